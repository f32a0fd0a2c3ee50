//! Scheduler and driver configuration.

/// Sizing for one object pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Slots allocated up front.
    pub initial: usize,
    /// Hard cap on slots. Acquiring past it is a contract violation.
    pub max: usize,
    /// Slots added at once when the free list runs dry.
    pub grow: usize,
}

impl PoolConfig {
    pub const fn new(initial: usize) -> Self {
        Self {
            initial,
            max: usize::MAX,
            grow: 32,
        }
    }

    pub const fn capped(initial: usize, max: usize) -> Self {
        Self {
            initial,
            max,
            grow: 32,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(8)
    }
}

/// One pool per primitive type plus one for tasks.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub tasks: PoolConfig,
    pub wait_time: PoolConfig,
    pub wait_until: PoolConfig,
    pub wait_event: PoolConfig,
    pub wait_frame: PoolConfig,
    pub return_value: PoolConfig,
    pub callback: PoolConfig,
    pub multi: PoolConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tasks: PoolConfig::new(128),
            wait_time: PoolConfig::default(),
            wait_until: PoolConfig::default(),
            wait_event: PoolConfig::default(),
            wait_frame: PoolConfig::default(),
            return_value: PoolConfig::default(),
            callback: PoolConfig::default(),
            multi: PoolConfig::default(),
        }
    }
}

/// Configuration for a [`FrameDriver`](crate::driver::FrameDriver).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DriverConfig {
    pub fps: f64,
    /// Multiplier applied to scaled time. `0.0` freezes it.
    pub time_scale: f64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            fps: 60.0,
            time_scale: 1.0,
        }
    }
}
