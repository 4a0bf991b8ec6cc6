//! Cooperative cancellation of running chains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cloneable cancellation token.
///
/// Chain loops check the token before every iteration. Wire it to whatever
/// the application treats as a user interrupt (a Ctrl-C handler, a UI
/// button, a deadline):
///
/// ```rust
/// use mini_hmc::interrupt::Interrupt;
///
/// let interrupt = Interrupt::new();
/// let handle = interrupt.clone();
/// handle.trigger();
/// assert!(interrupt.is_triggered());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clears the token so it can be reused for another run.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let interrupt = Interrupt::new();
        let other = interrupt.clone();
        assert!(!other.is_triggered());
        interrupt.trigger();
        assert!(other.is_triggered());
        other.reset();
        assert!(!interrupt.is_triggered());
    }
}
