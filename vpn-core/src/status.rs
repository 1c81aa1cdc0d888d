//! Process-wide loop status.
//!
//! A transmission loop runs until it decides to stop, and it can be told to
//! stop asynchronously by the SIGINT handler in [`crate::signal`]. A plain
//! enum behind `&mut` would not be valid to write from a signal handler that
//! can interrupt the loop thread at any instruction; an atomic cell is the
//! smallest primitive that is both signal-safe and lock-free.
//!
//! There is exactly one of these per process, matching the real deployment
//! shape: a client, an endpoint and a server are always separate OS
//! processes, never threads sharing one.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopStatus {
    Running = 0,
    StoppedShouldReinit = 1,
    StoppedShouldAbort = 2,
}

impl LoopStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LoopStatus::Running,
            1 => LoopStatus::StoppedShouldReinit,
            _ => LoopStatus::StoppedShouldAbort,
        }
    }
}

pub struct LoopStatusCell(AtomicU8);

impl LoopStatusCell {
    const fn new() -> Self {
        LoopStatusCell(AtomicU8::new(LoopStatus::Running as u8))
    }

    pub fn set(&self, status: LoopStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }

    pub fn get(&self) -> LoopStatus {
        LoopStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.get() == LoopStatus::Running
    }
}

pub static STATUS: LoopStatusCell = LoopStatusCell::new();

/// Marks the loop as running. Called once at the top of every loop entry, so
/// a restart after `StoppedShouldReinit` doesn't inherit the previous run's
/// terminal status.
pub fn begin() {
    STATUS.set(LoopStatus::Running);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn begin_resets_to_running() {
        STATUS.set(LoopStatus::StoppedShouldAbort);
        begin();
        assert_eq!(STATUS.get(), LoopStatus::Running);
        assert!(STATUS.is_running());
    }

    #[test]
    #[serial]
    fn round_trips_all_variants() {
        for status in [
            LoopStatus::Running,
            LoopStatus::StoppedShouldReinit,
            LoopStatus::StoppedShouldAbort,
        ] {
            STATUS.set(status);
            assert_eq!(STATUS.get(), status);
        }
    }
}
