//! # Interrupt Line
//!
//! This module exposes an abstract [`InterruptLine`] trait. The xHCI core
//! raises guest interrupts exclusively through this hook; whether the
//! hosting side delivers them as an MSI or as a legacy pin assertion is not
//! the core's business.

use std::fmt::Debug;

/// An interrupt line with a single operation: [`InterruptLine::interrupt`].
pub trait InterruptLine: Debug + Send + Sync + 'static {
    /// Send a single edge-triggered interrupt to the interrupt controller.
    fn interrupt(&self);
}

/// A dummy interrupt line that is intended to be used by devices whose
/// interrupts aren't wired to any interrupt controller.
#[derive(Default, Debug, Clone, Copy)]
pub struct DummyInterruptLine {}

impl InterruptLine for DummyInterruptLine {
    fn interrupt(&self) {}
}

#[cfg(test)]
/// Test-only helpers shared by this module's unit tests.
pub mod testutils {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// An interrupt line that counts assertions, for checking interrupt
    /// moderation behavior in tests.
    #[derive(Debug, Default)]
    pub struct CountingInterruptLine {
        count: AtomicUsize,
    }

    impl CountingInterruptLine {
        /// How often the line has been asserted so far.
        pub fn asserted(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    impl InterruptLine for CountingInterruptLine {
        fn interrupt(&self) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }
}
