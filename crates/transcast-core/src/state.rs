//! The task state machine's transition DAG, as a pure predicate.
//!
//! The authoritative enforcement of these transitions lives in the SQL
//! `WHERE status = $from` clauses in `transcast_db::queries::tasks` (the
//! compare-and-swap that makes a transition atomic); this module exists so
//! the same graph can be asserted against in tests and consulted by the
//! REST layer before it even issues a query.

use transcast_db::models::TaskStatus;

/// Whether `from -> to` is a valid edge in the task status DAG:
///
/// ```text
/// pending   -> assigned, cancelled
/// assigned  -> running, failed, cancelled
/// running   -> completed, failed, cancelled
/// failed    -> pending              (restart)
/// completed, cancelled are terminal
/// ```
pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, Assigned)
            | (Pending, Cancelled)
            | (Assigned, Running)
            | (Assigned, Failed)
            | (Assigned, Cancelled)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Failed, Pending)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::*;

    #[test]
    fn pending_can_only_move_to_assigned_or_cancelled() {
        assert!(is_valid_transition(Pending, Assigned));
        assert!(is_valid_transition(Pending, Cancelled));
        assert!(!is_valid_transition(Pending, Running));
        assert!(!is_valid_transition(Pending, Completed));
        assert!(!is_valid_transition(Pending, Failed));
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for to in [Pending, Assigned, Running, Completed, Failed, Cancelled] {
            assert!(!is_valid_transition(Completed, to));
            assert!(!is_valid_transition(Cancelled, to));
        }
    }

    #[test]
    fn failed_can_only_restart_to_pending() {
        assert!(is_valid_transition(Failed, Pending));
        assert!(!is_valid_transition(Failed, Assigned));
        assert!(!is_valid_transition(Failed, Running));
    }
}
