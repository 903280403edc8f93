// src/audit.rs

//! Fire-and-forget audit events emitted by task logic.

use tracing::{info, warn};

use crate::types::{Credential, TargetRef, TaskId};

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub task_id: TaskId,
    pub task_type: String,
    pub target: TargetRef,
    pub owner: Credential,
    pub action: String,
    pub success: bool,
    pub note: String,
}

/// Observational sink. Delivery is not retried and failures are not reported
/// back to the task.
pub trait Auditor: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Default auditor: one `tracing` line per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditor;

impl Auditor for TracingAuditor {
    fn record(&self, event: AuditEvent) {
        if event.success {
            info!(
                task_id = %event.task_id,
                task_type = %event.task_type,
                target = %event.target,
                owner = %event.owner,
                action = %event.action,
                note = %event.note,
                "audit"
            );
        } else {
            warn!(
                task_id = %event.task_id,
                task_type = %event.task_type,
                target = %event.target,
                owner = %event.owner,
                action = %event.action,
                note = %event.note,
                "audit (failed)"
            );
        }
    }
}
