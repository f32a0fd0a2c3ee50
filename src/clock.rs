//! Time sources and pause-aware deadlines.

/// Which host clock a task reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TimeSource {
    /// Host time multiplied by the time scale; stops when the scale is 0.
    #[default]
    Scaled,
    /// Wall-clock time, unaffected by the time scale.
    Real,
}

/// `dest = start + timeout`, with paused spans pushed onto `dest`.
///
/// The deadline never reads a clock itself. Its owner feeds it the current
/// time through `start`/`update`/`pause`/`resume`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Deadline {
    timeout: f64,
    dest: f64,
    cur: f64,
    paused_at: Option<f64>,
}

impl Default for Deadline {
    fn default() -> Self {
        Self::new(f64::INFINITY)
    }
}

impl Deadline {
    pub fn new(timeout: f64) -> Self {
        Self {
            timeout: timeout.max(0.0),
            dest: f64::INFINITY,
            cur: f64::NEG_INFINITY,
            paused_at: None,
        }
    }

    pub fn timeout(&self) -> f64 {
        self.timeout
    }

    pub fn start(&mut self, now: f64) {
        self.dest = now + self.timeout;
        self.cur = now;
        self.paused_at = None;
    }

    pub fn update(&mut self, now: f64) {
        self.cur = now;
    }

    pub fn pause(&mut self, now: f64) {
        if self.paused_at.is_none() {
            self.paused_at = Some(now);
        }
    }

    pub fn resume(&mut self, now: f64) {
        if let Some(at) = self.paused_at.take() {
            self.dest += (now - at).max(0.0);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    pub fn expired(&self) -> bool {
        self.cur >= self.dest
    }

    /// Time left as of the last `update`.
    pub fn remaining(&self) -> f64 {
        (self.dest - self.cur).max(0.0)
    }

    pub fn dest(&self) -> f64 {
        self.dest
    }
}

/// Host-side clock pair advanced by a driver.
///
/// Real time always advances by the wall delta; scaled time advances by the
/// delta times the current scale.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Clock {
    scaled: f64,
    real: f64,
    time_scale: f64,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Clock {
    pub fn new(time_scale: f64) -> Self {
        Self {
            scaled: 0.0,
            real: 0.0,
            time_scale: time_scale.max(0.0),
        }
    }

    pub fn advance(&mut self, real_dt: f64) {
        let dt = real_dt.max(0.0);
        self.real += dt;
        self.scaled += dt * self.time_scale;
    }

    pub fn scaled(&self) -> f64 {
        self.scaled
    }

    pub fn real(&self) -> f64 {
        self.real
    }

    pub fn read(&self, source: TimeSource) -> f64 {
        match source {
            TimeSource::Scaled => self.scaled,
            TimeSource::Real => self.real,
        }
    }

    pub fn time_scale(&self) -> f64 {
        self.time_scale
    }

    /// Negative scales are clamped to 0 (frozen).
    pub fn set_time_scale(&mut self, scale: f64) {
        self.time_scale = scale.max(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_expires_at_timeout() {
        let mut d = Deadline::new(1.0);
        assert!(!d.expired());
        d.start(0.0);
        for t in [0.0, 0.25, 0.5, 0.99] {
            d.update(t);
            assert!(!d.expired(), "expired early at {t}");
        }
        d.update(1.0);
        assert!(d.expired());
        d.update(5.0);
        assert!(d.expired());
    }

    #[test]
    fn test_pause_shifts_destination_by_paused_span() {
        let mut d = Deadline::new(1.0);
        d.start(0.0);
        d.update(0.4);
        d.pause(0.4);
        d.resume(1.4);
        assert_eq!(d.dest(), 2.0);

        // A second cycle adds its span too.
        d.pause(1.5);
        d.resume(1.75);
        assert_eq!(d.dest(), 2.25);

        d.update(2.2);
        assert!(!d.expired());
        d.update(2.25);
        assert!(d.expired());
    }

    #[test]
    fn test_double_pause_keeps_first_timestamp() {
        let mut d = Deadline::new(2.0);
        d.start(0.0);
        assert_eq!(d.remaining(), 2.0);
        d.pause(0.5);
        d.pause(1.0);
        assert!(d.is_paused());
        d.resume(1.5);
        assert!(!d.is_paused());
        assert_eq!(d.dest(), 3.0);
        d.update(1.5);
        assert_eq!(d.remaining(), 1.5);
        // Resume without pause is ignored.
        d.resume(10.0);
        assert_eq!(d.dest(), 3.0);
    }

    #[test]
    fn test_infinite_timeout_never_expires() {
        let mut d = Deadline::default();
        d.start(0.0);
        d.update(1e12);
        assert!(!d.expired());
    }

    #[test]
    fn test_clock_scale() {
        let mut c = Clock::new(2.0);
        c.advance(0.5);
        assert_eq!(c.real(), 0.5);
        assert_eq!(c.scaled(), 1.0);
        c.set_time_scale(0.0);
        c.advance(1.0);
        assert_eq!(c.read(TimeSource::Real), 1.5);
        assert_eq!(c.read(TimeSource::Scaled), 1.0);
    }
}
