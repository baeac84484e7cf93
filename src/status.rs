use tracing::debug;

use crate::error::StoreError;
use crate::store::Store;
use crate::types::MessageStatus;
use crate::webhook::{StatusError, StatusUpdate};

/// `code: title` for each provider error, joined with `; `.
pub fn error_summary(errors: &[StatusError]) -> Option<String> {
    let parts = errors
        .iter()
        .map(|e| {
            let title = Some(e.title.trim())
                .filter(|t| !t.is_empty())
                .or_else(|| e.message.as_deref().map(str::trim))
                .unwrap_or("");
            match (e.code.trim(), title) {
                ("", title) => title.to_string(),
                (code, "") => code.to_string(),
                (code, title) => format!("{code}: {title}"),
            }
        })
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>();
    (!parts.is_empty()).then(|| parts.join("; "))
}

/// Applies one delivery callback to the message it names.
///
/// Unknown status words, unknown message ids and backwards transitions all
/// change nothing and are not errors. Returns the number of rows changed.
pub async fn apply_status(store: &dyn Store, update: &StatusUpdate) -> Result<u64, StoreError> {
    let provider_message_id = update.id.trim();
    let Some(status) = MessageStatus::from_provider(&update.status) else {
        debug!(provider_message_id, status = %update.status, "ignoring unknown delivery status");
        return Ok(0);
    };
    if provider_message_id.is_empty() {
        return Ok(0);
    }
    let error_message = match status {
        MessageStatus::Failed => error_summary(&update.errors),
        _ => None,
    };
    let changed = store
        .apply_delivery_status(provider_message_id, status, error_message.as_deref())
        .await?;
    debug!(provider_message_id, status = %status, changed, "delivery status applied");
    Ok(changed)
}
