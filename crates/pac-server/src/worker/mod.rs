//! Background work: event processing, admission and reconciliation.

pub mod concurrency;
pub mod event_processor;
pub mod launcher;
pub mod reconciler;
pub mod reporter;

pub use event_processor::{EventOutcome, process_event};
pub use reconciler::{
    ReconcileJob, reconcile, reconcile_channel, recover_unfinalized, start_reconciler, transition,
};

use pac_core::models::EventType;

/// Events a user fired on purpose. They ignore skip markers and may launch a
/// candidate again for a commit that already has a run.
pub fn is_manual_trigger(event_type: EventType) -> bool {
    event_type.is_explicit_rerun()
        || matches!(
            event_type,
            EventType::Incoming | EventType::OnComment | EventType::OkToTestComment
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_triggers() {
        assert!(is_manual_trigger(EventType::RetestAllComment));
        assert!(is_manual_trigger(EventType::Incoming));
        assert!(is_manual_trigger(EventType::CheckRunRerequested));
        assert!(!is_manual_trigger(EventType::Push));
        assert!(!is_manual_trigger(EventType::PullRequest));
    }
}
