//! Time sources.
//!
//! Code crash if there is a physical inconsistency (unrecoverable state).

/// Source of the current Unix time, in seconds.
pub trait Clock: Send + Sync {
    /// Get the current Unix timestamp in seconds.
    fn now(&self) -> i64;
}

/// System clock using the OS time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time before Unix epoch")
            .as_secs() as i64
    }
}

#[cfg(test)]
pub use fixed::FixedClock;
