//! Board services TFS borrows from the monitor: a clock, the watchdog and
//! the console.

pub trait Platform {
    /// Seconds (or ticks) stamped into `mod_time` of new records.
    fn now(&self) -> u32 {
        0
    }

    /// Called regularly from long erase/copy loops.
    fn watchdog(&mut self) {}

    /// Console abort poll (typically "was ^C typed").
    fn abort_requested(&mut self) -> bool {
        false
    }

    /// Ask the operator a yes/no question. Headless targets say yes.
    fn confirm(&mut self, _prompt: &str) -> bool {
        true
    }
}

/// Platform with no clock, no watchdog and nobody at the console.
#[derive(Debug, Default, Clone, Copy)]
pub struct Headless;

impl Platform for Headless {}
