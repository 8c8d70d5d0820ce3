//! Signal-driven shutdown coordination for attached operations.
//!
//! Explicit state machine rather than implicit interrupt propagation: the
//! first interrupt while an operation runs flips Running into Stopping (a
//! graceful, grace-period-bounded sweep); a second interrupt flips Stopping
//! into ForceStopping (immediate kills). Workers observe transitions through
//! [`SignalCoordinator::checkpoint`] at every suspension point.

use crate::CoreError;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LifecyclePhase {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    ForceStopping = 3,
    Done = 4,
}

impl LifecyclePhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => LifecyclePhase::Running,
            2 => LifecyclePhase::Stopping,
            3 => LifecyclePhase::ForceStopping,
            4 => LifecyclePhase::Done,
            _ => LifecyclePhase::Idle,
        }
    }
}

#[derive(Debug, Default)]
pub struct SignalCoordinator {
    phase: AtomicU8,
}

impl SignalCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route process interrupt/terminate signals into this coordinator.
    /// Call once per process, from the binary entry point.
    pub fn install(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let _ = ctrlc::set_handler(move || coordinator.notify_signal());
    }

    pub fn phase(&self) -> LifecyclePhase {
        LifecyclePhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Idle -> Running, at operation start.
    pub fn begin(&self) {
        let _ = self.phase.compare_exchange(
            LifecyclePhase::Idle as u8,
            LifecyclePhase::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Sweep completion (or a clean finish) parks the machine in Done.
    pub fn finish(&self) {
        self.phase.store(LifecyclePhase::Done as u8, Ordering::SeqCst);
    }

    /// Reset to Idle so a new operation can begin (used between operations
    /// in one process, and by tests).
    pub fn reset(&self) {
        self.phase.store(LifecyclePhase::Idle as u8, Ordering::SeqCst);
    }

    /// One delivered interrupt/terminate signal.
    pub fn notify_signal(&self) {
        loop {
            let current = self.phase.load(Ordering::SeqCst);
            let next = match LifecyclePhase::from_u8(current) {
                // A signal before the operation starts still cancels it.
                LifecyclePhase::Idle | LifecyclePhase::Running => LifecyclePhase::Stopping,
                LifecyclePhase::Stopping => LifecyclePhase::ForceStopping,
                LifecyclePhase::ForceStopping | LifecyclePhase::Done => return,
            };
            if self
                .phase
                .compare_exchange(current, next as u8, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                match next {
                    LifecyclePhase::Stopping => {
                        warn!("interrupt received, stopping gracefully (interrupt again to force)");
                    }
                    LifecyclePhase::ForceStopping => {
                        warn!("second interrupt received, killing containers immediately");
                    }
                    _ => {}
                }
                return;
            }
        }
    }

    /// A stop sweep has been requested (gracefully or forcefully).
    pub fn interrupted(&self) -> bool {
        matches!(
            self.phase(),
            LifecyclePhase::Stopping | LifecyclePhase::ForceStopping
        )
    }

    /// The sweep must skip grace periods entirely.
    pub fn forced(&self) -> bool {
        self.phase() == LifecyclePhase::ForceStopping
    }

    /// Suspension-point check: fails with [`CoreError::Interrupted`] once a
    /// stop sweep has begun.
    pub fn checkpoint(&self) -> Result<(), CoreError> {
        if self.interrupted() {
            Err(CoreError::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_escalate_in_order() {
        let coordinator = SignalCoordinator::new();
        assert_eq!(coordinator.phase(), LifecyclePhase::Idle);

        coordinator.begin();
        assert_eq!(coordinator.phase(), LifecyclePhase::Running);
        assert!(coordinator.checkpoint().is_ok());

        coordinator.notify_signal();
        assert_eq!(coordinator.phase(), LifecyclePhase::Stopping);
        assert!(coordinator.interrupted());
        assert!(!coordinator.forced());
        assert!(matches!(
            coordinator.checkpoint(),
            Err(CoreError::Interrupted)
        ));

        coordinator.notify_signal();
        assert_eq!(coordinator.phase(), LifecyclePhase::ForceStopping);
        assert!(coordinator.forced());

        // Further signals are absorbed.
        coordinator.notify_signal();
        assert_eq!(coordinator.phase(), LifecyclePhase::ForceStopping);

        coordinator.finish();
        assert_eq!(coordinator.phase(), LifecyclePhase::Done);
        assert!(!coordinator.interrupted());
    }

    #[test]
    fn signal_before_begin_cancels_the_operation() {
        let coordinator = SignalCoordinator::new();
        coordinator.notify_signal();
        assert_eq!(coordinator.phase(), LifecyclePhase::Stopping);
        coordinator.begin();
        // begin() does not resurrect a cancelled run.
        assert_eq!(coordinator.phase(), LifecyclePhase::Stopping);
    }

    #[test]
    fn reset_allows_a_new_operation() {
        let coordinator = SignalCoordinator::new();
        coordinator.begin();
        coordinator.notify_signal();
        coordinator.finish();
        coordinator.reset();
        assert_eq!(coordinator.phase(), LifecyclePhase::Idle);
        coordinator.begin();
        assert_eq!(coordinator.phase(), LifecyclePhase::Running);
    }
}
