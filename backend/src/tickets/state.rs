// Ticket state machine

use triage_shared::TicketStatus;

use crate::error::AppError;

/// Whether `from -> to` is an allowed workflow transition.
///
/// Closed is final. Cancelled can only be reopened. Resolved cannot go back
/// to pending, and closing requires the ticket to have been resolved first
/// (the bulk admin override bypasses this check explicitly).
pub fn can_transition(from: TicketStatus, to: TicketStatus) -> bool {
    use TicketStatus::*;
    match (from, to) {
        (Open, InProgress) | (Open, Pending) | (Open, Resolved) | (Open, Cancelled) => true,
        (InProgress, Open) | (InProgress, Pending) | (InProgress, Resolved) | (InProgress, Cancelled) => true,
        (Pending, Open) | (Pending, InProgress) | (Pending, Resolved) | (Pending, Cancelled) => true,
        (Resolved, Open) | (Resolved, InProgress) | (Resolved, Closed) => true,
        (Cancelled, Open) => true,
        _ => false,
    }
}

/// Validate a transition, producing the engine's stable error on violation.
pub fn check_transition(from: TicketStatus, to: TicketStatus) -> Result<(), AppError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(AppError::InvalidTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TicketStatus::*;

    const ALL: [TicketStatus; 6] = [Open, InProgress, Pending, Resolved, Closed, Cancelled];

    #[test]
    fn transition_table_matches_design() {
        // (from, allowed targets)
        let expected: [(TicketStatus, &[TicketStatus]); 6] = [
            (Open, &[InProgress, Pending, Resolved, Cancelled]),
            (InProgress, &[Open, Pending, Resolved, Cancelled]),
            (Pending, &[Open, InProgress, Resolved, Cancelled]),
            (Resolved, &[Open, InProgress, Closed]),
            (Closed, &[]),
            (Cancelled, &[Open]),
        ];

        for (from, allowed) in expected {
            for to in ALL {
                if to == from {
                    assert!(!can_transition(from, to), "{from} -> {to} should be rejected");
                } else {
                    assert_eq!(
                        can_transition(from, to),
                        allowed.contains(&to),
                        "{from} -> {to}"
                    );
                }
            }
        }
    }

    #[test]
    fn closed_is_final() {
        for to in ALL {
            assert!(!can_transition(Closed, to));
        }
    }

    #[test]
    fn closing_requires_resolved_first() {
        assert!(can_transition(Resolved, Closed));
        assert!(!can_transition(Open, Closed));
        assert!(!can_transition(InProgress, Closed));
        assert!(!can_transition(Pending, Closed));
    }

    #[test]
    fn invalid_transition_error_carries_both_states() {
        let err = check_transition(Closed, Open).unwrap_err();
        match err {
            AppError::InvalidTransition { from, to } => {
                assert_eq!(from, Closed);
                assert_eq!(to, Open);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
