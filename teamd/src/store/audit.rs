//! Append-only audit trail.
//!
//! One event per state transition, written before the mutated record is
//! renamed into place. The trail is authority for observability only;
//! recovery never replays it.

use chrono::Utc;

use team_common::error::StoreResult;
use team_common::fs::{append_json_line, read_json_lines};
use team_common::types::AuditEvent;
use team_common::SCHEMA_VERSION;

use super::Store;

impl Store {
    pub(crate) fn append_audit(
        &self,
        event_type: &str,
        actor: &str,
        task_id: Option<&str>,
        thread_id: Option<&str>,
        data: serde_json::Value,
    ) -> StoreResult<()> {
        let event = AuditEvent {
            schema_version: SCHEMA_VERSION,
            event_type: event_type.to_string(),
            actor: actor.to_string(),
            task_id: task_id.map(str::to_string),
            thread_id: thread_id.map(str::to_string),
            data,
            created_at: Utc::now(),
        };
        append_json_line(&self.audit_path(), &event)
    }

    /// Full audit history in commit order (tolerant of a torn tail).
    pub fn read_audit(&self) -> StoreResult<Vec<AuditEvent>> {
        read_json_lines(&self.audit_path())
    }
}
