//! Fan-out of one canonical record into per-scope rows.

use crate::identity::Identity;
use crate::record::{LogRecord, ScopedLogRecord};
use crate::scope::Scope;

/// Produces one row per scope entry, in scope insertion order.
///
/// When a subject is present and both the entry and the subject are of
/// `self_type`, the entry's id is replaced by the subject's id, whatever the
/// configured value was. Entries whose id is then missing or empty are
/// skipped, so the result is never longer than `scope` and may be empty.
pub fn expand(
    scope: &Scope,
    record: &LogRecord,
    self_type: &str,
    subject: Option<&Identity>,
) -> Vec<ScopedLogRecord> {
    let self_id = subject
        .filter(|s| s.type_name.as_deref() == Some(self_type))
        .map(|s| s.id.as_ref());

    scope
        .iter()
        .filter_map(|(scope_type, configured)| {
            let scope_id = match self_id {
                Some(own) if scope_type == self_type => own,
                _ => configured,
            };
            match scope_id.filter(|id| !id.is_empty()) {
                Some(id) => Some(ScopedLogRecord {
                    record: record.clone(),
                    scope_type: scope_type.to_string(),
                    scope_id: id.clone(),
                }),
                None => {
                    tracing::trace!(scope_type, "scope entry has no id, skipping");
                    None
                }
            }
        })
        .collect()
}
