//! Event translation: `KernelEvent` → wire event name and JSON payload.
//!
//! Names follow the manager's event vocabulary:
//!   Recovered           → kernel_recovered
//!   RecoverySkipped     → kernel_recovery_skipped
//!   CommitStarted       → kernel_commit_started
//!   CommitFinished      → kernel_commit_finished (status: success|failure)
//!   ServicePortsBlocked → kernel_service_blocked
//!   Closed              → kernel_terminated

use serde_json::{json, Value};

use super::KernelEvent;

/// Translate an event into `(event_name, payload)`.
pub fn event_payload(event: &KernelEvent) -> (&'static str, Value) {
    match event {
        KernelEvent::Recovered {
            kernel_id,
            session_id,
        } => (
            "kernel_recovered",
            json!({"kernel_id": kernel_id, "session_id": session_id}),
        ),
        KernelEvent::RecoverySkipped { kernel_id, reason } => (
            "kernel_recovery_skipped",
            json!({"kernel_id": kernel_id, "reason": reason}),
        ),
        KernelEvent::CommitStarted { kernel_id, subdir } => (
            "kernel_commit_started",
            json!({"kernel_id": kernel_id, "subdir": subdir}),
        ),
        KernelEvent::CommitFinished {
            kernel_id,
            subdir,
            success,
        } => (
            "kernel_commit_finished",
            json!({
                "kernel_id": kernel_id,
                "subdir": subdir,
                "status": if *success { "success" } else { "failure" },
            }),
        ),
        KernelEvent::ServicePortsBlocked { kernel_id, service } => (
            "kernel_service_blocked",
            json!({"kernel_id": kernel_id, "service": service}),
        ),
        KernelEvent::Closed { kernel_id } => {
            ("kernel_terminated", json!({"kernel_id": kernel_id}))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KernelId;

    #[test]
    fn test_commit_finished_status() {
        let kernel_id = KernelId::from_string("k-1".to_string()).unwrap();
        let (name, data) = event_payload(&KernelEvent::CommitFinished {
            kernel_id,
            subdir: "u1".to_string(),
            success: false,
        });
        assert_eq!(name, "kernel_commit_finished");
        assert_eq!(data["kernel_id"], "k-1");
        assert_eq!(data["status"], "failure");
    }

    #[test]
    fn test_closed_maps_to_terminated() {
        let kernel_id = KernelId::from_string("k-2".to_string()).unwrap();
        let (name, data) = event_payload(&KernelEvent::Closed { kernel_id });
        assert_eq!(name, "kernel_terminated");
        assert_eq!(data, json!({"kernel_id": "k-2"}));
    }
}
