//! Frame driver - realtime and offline tick loops
//!
//! The driver owns the host clock pair and feeds it to [`Scheduler::tick`].
//! - Offline: `step_*` advance the clock by exact amounts, one tick per step
//! - Realtime: `run_until*` tick at the configured fps, using spin_sleep to
//!   wait out each frame

use crate::clock::Clock;
use crate::config::DriverConfig;
use crate::error::SchedError;
use crate::scheduler::Scheduler;
use crate::trace::debug;
use spin_sleep::SpinSleeper;
use std::time::{Duration, Instant};

pub struct FrameDriver {
    sched: Scheduler,
    clock: Clock,
    fps: f64,
    frames: u64,
    sleeper: SpinSleeper,
}

impl FrameDriver {
    pub fn new(sched: Scheduler, config: DriverConfig) -> Self {
        let fps = if config.fps.is_finite() && config.fps > 0.0 {
            config.fps
        } else {
            DriverConfig::default().fps
        };
        Self {
            sched,
            clock: Clock::new(config.time_scale),
            fps,
            frames: 0,
            sleeper: SpinSleeper::default(),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Ticks issued so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn frame_dt(&self) -> f64 {
        1.0 / self.fps
    }

    /// `0.0` freezes scaled time; real-time tasks keep running.
    pub fn set_time_scale(&mut self, scale: f64) {
        self.clock.set_time_scale(scale);
    }

    fn tick(&mut self) -> Result<(), SchedError> {
        self.frames += 1;
        self.sched.tick(self.clock.scaled(), self.clock.real())
    }

    /// Advance both clocks by `dt` real seconds and tick once (offline).
    pub fn step_sec(&mut self, dt: f64) -> Result<(), SchedError> {
        let dt = if dt.is_finite() && dt > 0.0 { dt } else { 0.0 };
        self.clock.advance(dt);
        self.tick()
    }

    /// Step by one frame (offline).
    pub fn step_frame(&mut self) -> Result<(), SchedError> {
        self.step_sec(self.frame_dt())
    }

    pub fn step_frames(&mut self, n: usize) -> Result<(), SchedError> {
        for _ in 0..n {
            self.step_frame()?;
        }
        Ok(())
    }

    /// Tick in realtime until `is_done` returns true. The clock advances by
    /// measured wall time, so a late frame is caught up rather than lost.
    pub fn run_until<F>(&mut self, mut is_done: F) -> Result<(), SchedError>
    where
        F: FnMut(&Scheduler) -> bool,
    {
        let frame = Duration::from_secs_f64(self.frame_dt());
        let started = self.frames;
        debug!(fps = self.fps, "realtime loop started");

        let mut last = Instant::now();
        while !is_done(&self.sched) {
            let due = last + frame;
            let now = Instant::now();
            if due > now {
                self.sleeper.sleep(due - now);
            }
            let now = Instant::now();
            let dt = now.duration_since(last).as_secs_f64();
            last = now;
            self.step_sec(dt)?;
        }

        debug!(
            frames = self.frames - started,
            real = self.clock.real(),
            "realtime loop finished"
        );
        Ok(())
    }

    /// Tick in realtime until no task is registered.
    pub fn run_until_idle(&mut self) -> Result<(), SchedError> {
        self.run_until(|s| s.active_count() == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskOptions;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn offline(scale: f64) -> FrameDriver {
        FrameDriver::new(
            Scheduler::default(),
            DriverConfig {
                fps: 10.0,
                time_scale: scale,
            },
        )
    }

    #[test]
    fn test_step_frames_advances_both_clocks() {
        let mut d = offline(2.0);
        d.step_frames(5).unwrap();
        assert_eq!(d.frames(), 5);
        assert!((d.clock().real() - 0.5).abs() < 1e-9);
        assert!((d.clock().scaled() - 1.0).abs() < 1e-9);
        assert!((d.scheduler().scaled_time() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_step_ticks_without_advancing() {
        let mut d = offline(1.0);
        d.step_sec(f64::NAN).unwrap();
        d.step_sec(-1.0).unwrap();
        assert_eq!(d.frames(), 2);
        assert_eq!(d.clock().real(), 0.0);
    }

    #[test]
    fn test_zero_scale_freezes_scaled_tasks_only() {
        let mut d = offline(1.0);
        let log = Rc::new(RefCell::new(Vec::new()));
        let sched = d.scheduler().clone();
        for (name, opts) in [
            ("scaled", TaskOptions::named("scaled")),
            ("real", TaskOptions::named("real").real_time()),
        ] {
            let l = log.clone();
            sched
                .spawn_with(opts, move |co| async move {
                    co.wait_time(0.5).await?;
                    l.borrow_mut().push(name);
                    Ok(())
                })
                .unwrap();
        }

        d.set_time_scale(0.0);
        d.step_frames(10).unwrap();
        assert_eq!(*log.borrow(), vec!["real"]);

        d.set_time_scale(1.0);
        d.step_frames(6).unwrap();
        assert_eq!(*log.borrow(), vec!["real", "scaled"]);
    }

    #[test]
    fn test_run_until_idle_realtime() {
        let mut d = FrameDriver::new(
            Scheduler::default(),
            DriverConfig {
                fps: 200.0,
                time_scale: 1.0,
            },
        );
        d.scheduler()
            .spawn("short", |co| async move {
                co.wait_time(0.02).await?;
                Ok(())
            })
            .unwrap();
        d.run_until_idle().unwrap();
        assert!(d.clock().real() >= 0.02);
        assert_eq!(d.scheduler().used_total(), 0);
    }
}
