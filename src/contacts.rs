use tracing::debug;

use crate::error::StoreError;
use crate::store::Store;
use crate::types::{Contact, NewContact};

/// Finds or creates the contact for (organization, phone).
///
/// An existing contact only has gaps filled: `observed_name` lands when no
/// name is stored yet, `observed_avatar` when it differs from the stored one.
/// Nothing is written when neither changes. Losing a creation race to a
/// concurrent delivery falls back to reading the winner's row.
pub async fn resolve(
    store: &dyn Store,
    organization_id: &str,
    phone: &str,
    observed_name: Option<&str>,
    observed_avatar: Option<&str>,
) -> Result<Contact, StoreError> {
    let observed_name = observed_name.map(str::trim).filter(|v| !v.is_empty());
    let observed_avatar = observed_avatar.map(str::trim).filter(|v| !v.is_empty());

    if let Some(existing) = store.find_contact(organization_id, phone).await? {
        return merge_profile(store, existing, observed_name, observed_avatar).await;
    }

    let created = store
        .insert_contact(NewContact {
            organization_id: organization_id.to_string(),
            phone: phone.to_string(),
            name: observed_name.map(str::to_string),
            avatar_url: observed_avatar.map(str::to_string),
        })
        .await;

    match created {
        Ok(contact) => Ok(contact),
        Err(StoreError::UniqueViolation(_)) => {
            debug!(organization_id, phone, "contact created concurrently, re-reading");
            let existing = store
                .find_contact(organization_id, phone)
                .await?
                .ok_or(StoreError::NotFound)?;
            merge_profile(store, existing, observed_name, observed_avatar).await
        }
        Err(err) => Err(err),
    }
}

async fn merge_profile(
    store: &dyn Store,
    existing: Contact,
    observed_name: Option<&str>,
    observed_avatar: Option<&str>,
) -> Result<Contact, StoreError> {
    let name_is_unset = existing
        .name
        .as_deref()
        .map(|n| n.trim().is_empty())
        .unwrap_or(true);
    let name = observed_name.filter(|_| name_is_unset);
    let avatar = observed_avatar.filter(|a| existing.avatar_url.as_deref() != Some(*a));

    if name.is_none() && avatar.is_none() {
        return Ok(existing);
    }
    store.update_contact_profile(&existing.id, name, avatar).await
}
