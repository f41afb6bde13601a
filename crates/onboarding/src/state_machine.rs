//! Device lifecycle state machine with validated transitions

use trustplane_core::types::DeviceStatus;
use trustplane_core::{Error, Result};

/// Lifecycle transition triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Administrator approved the pending device
    Approve,
    /// Administrator rejected the pending device
    Reject,
    /// Profiling window elapsed (or explicit finalize)
    WindowElapsed,
    /// Administrator or hard failure revoked the device
    Revoke,
    /// Attestation failed hard; isolate the device
    AttestationHardFail,
    /// Administrator released the device from quarantine
    AdminRelease,
}

/// Validated state machine over `DeviceStatus`
///
/// Invalid transitions are rejected with `Conflict`; callers flip the
/// stored status only after a transition validates.
pub struct DeviceStateMachine {
    current: DeviceStatus,
}

impl DeviceStateMachine {
    pub fn new() -> Self {
        Self {
            current: DeviceStatus::Pending,
        }
    }

    /// Restore from a persisted status
    pub fn from_status(status: DeviceStatus) -> Self {
        Self { current: status }
    }

    pub fn status(&self) -> DeviceStatus {
        self.current
    }

    /// Attempt a transition; returns the new status
    pub fn transition(&mut self, event: LifecycleEvent) -> Result<DeviceStatus> {
        let next = match (self.current, event) {
            (DeviceStatus::Pending, LifecycleEvent::Approve) => DeviceStatus::Profiling,
            (DeviceStatus::Pending, LifecycleEvent::Reject) => DeviceStatus::Revoked,
            (DeviceStatus::Profiling, LifecycleEvent::WindowElapsed) => DeviceStatus::Active,
            (DeviceStatus::Profiling, LifecycleEvent::Revoke) => DeviceStatus::Revoked,
            (DeviceStatus::Active, LifecycleEvent::Revoke) => DeviceStatus::Revoked,
            (DeviceStatus::Quarantined, LifecycleEvent::Revoke) => DeviceStatus::Revoked,
            (DeviceStatus::Quarantined, LifecycleEvent::AdminRelease) => DeviceStatus::Active,
            // Hard attestation failure isolates from any live state
            (
                DeviceStatus::Pending | DeviceStatus::Profiling | DeviceStatus::Active,
                LifecycleEvent::AttestationHardFail,
            ) => DeviceStatus::Quarantined,
            (current, event) => {
                return Err(Error::conflict(format!(
                    "invalid transition: {} on {:?}",
                    current, event
                )));
            }
        };
        self.current = next;
        Ok(next)
    }

    pub fn can_transition(&self, event: LifecycleEvent) -> bool {
        Self::from_status(self.current).transition(event).is_ok()
    }

    /// Revoked is terminal
    pub fn is_terminal(&self) -> bool {
        self.current == DeviceStatus::Revoked
    }
}

impl Default for DeviceStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut sm = DeviceStateMachine::new();
        assert_eq!(sm.status(), DeviceStatus::Pending);

        assert_eq!(
            sm.transition(LifecycleEvent::Approve).unwrap(),
            DeviceStatus::Profiling
        );
        assert_eq!(
            sm.transition(LifecycleEvent::WindowElapsed).unwrap(),
            DeviceStatus::Active
        );
    }

    #[test]
    fn test_reject_path() {
        let mut sm = DeviceStateMachine::new();
        assert_eq!(
            sm.transition(LifecycleEvent::Reject).unwrap(),
            DeviceStatus::Revoked
        );
        assert!(sm.is_terminal());
    }

    #[test]
    fn test_revoke_from_profiling_and_active() {
        let mut sm = DeviceStateMachine::from_status(DeviceStatus::Profiling);
        assert_eq!(
            sm.transition(LifecycleEvent::Revoke).unwrap(),
            DeviceStatus::Revoked
        );

        let mut sm = DeviceStateMachine::from_status(DeviceStatus::Active);
        assert_eq!(
            sm.transition(LifecycleEvent::Revoke).unwrap(),
            DeviceStatus::Revoked
        );
    }

    #[test]
    fn test_attestation_hard_fail_quarantines_any_live_state() {
        for status in [
            DeviceStatus::Pending,
            DeviceStatus::Profiling,
            DeviceStatus::Active,
        ] {
            let mut sm = DeviceStateMachine::from_status(status);
            assert_eq!(
                sm.transition(LifecycleEvent::AttestationHardFail).unwrap(),
                DeviceStatus::Quarantined
            );
        }
    }

    #[test]
    fn test_quarantine_release_requires_admin() {
        let mut sm = DeviceStateMachine::from_status(DeviceStatus::Quarantined);
        assert!(!sm.can_transition(LifecycleEvent::WindowElapsed));
        assert_eq!(
            sm.transition(LifecycleEvent::AdminRelease).unwrap(),
            DeviceStatus::Active
        );
    }

    #[test]
    fn test_revoked_is_terminal() {
        let mut sm = DeviceStateMachine::from_status(DeviceStatus::Revoked);
        for event in [
            LifecycleEvent::Approve,
            LifecycleEvent::WindowElapsed,
            LifecycleEvent::AttestationHardFail,
            LifecycleEvent::AdminRelease,
        ] {
            assert!(sm.transition(event).is_err());
        }
    }

    #[test]
    fn test_cannot_skip_profiling() {
        let mut sm = DeviceStateMachine::new();
        assert!(sm.transition(LifecycleEvent::WindowElapsed).is_err());
        assert_eq!(sm.status(), DeviceStatus::Pending);
    }
}
