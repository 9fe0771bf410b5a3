//! One-step inbox provisioning: provider account, tracked-inbox row and
//! portal credential. Returns the generated password exactly once.

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::info;

use crate::error::{MonitorError, Result};
use crate::mail_client::MailApi;
use crate::models::TrackedInbox;
use crate::repository::Repository;

/// Generate a random alphanumeric password.
pub fn generate_password(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Salted digest in `salt$hex` form. The portal's auth layer owns the
/// scheme; the repository just stores the string.
pub fn hash_password(password: &str) -> String {
    let salt = generate_password(16);
    let digest = Sha256::digest(format!("{salt}{password}").as_bytes());
    let mut hashed = String::with_capacity(salt.len() + 1 + 64);
    hashed.push_str(&salt);
    hashed.push('$');
    for byte in digest {
        let _ = write!(hashed, "{:02x}", byte);
    }
    hashed
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, _)) = stored.split_once('$') else {
        return false;
    };
    hash_password_with_salt(salt, password) == stored
}

fn hash_password_with_salt(salt: &str, password: &str) -> String {
    let digest = Sha256::digest(format!("{salt}{password}").as_bytes());
    let mut hashed = String::with_capacity(salt.len() + 1 + 64);
    hashed.push_str(salt);
    hashed.push('$');
    for byte in digest {
        let _ = write!(hashed, "{:02x}", byte);
    }
    hashed
}

/// Everything created for a new customer; the password is not stored in
/// clear anywhere else.
#[derive(Debug, Clone)]
pub struct ProvisionedInbox {
    pub inbox: TrackedInbox,
    pub portal_email: String,
    pub portal_password: String,
}

/// Provision a new tracked inbox end to end:
/// 1. create the provider account,
/// 2. insert the inbox row,
/// 3. create the portal user with a generated password.
///
/// An already-tracked email surfaces as `AlreadyExists`.
pub async fn provision_inbox(
    repo: &Arc<dyn Repository>,
    mail: &Arc<dyn MailApi>,
    email: &str,
) -> Result<ProvisionedInbox> {
    if email.is_empty() || !email.contains('@') {
        return Err(MonitorError::Validation(format!(
            "invalid email address: {email}"
        )));
    }

    if repo.find_inbox_by_email(email).await?.is_some() {
        return Err(MonitorError::AlreadyExists(email.to_string()));
    }

    let password = generate_password(12);
    let account = mail.create_account(email, Some(&password)).await?;

    let (inbox, _created) = repo
        .upsert_inbox_by_provider_id(&account.id, email, Utc::now())
        .await?;

    repo.upsert_portal_user(email, &hash_password(&password), inbox.id)
        .await?;

    info!("provisioned inbox {email} (provider id {})", account.id);
    Ok(ProvisionedInbox {
        inbox,
        portal_email: email.to_string(),
        portal_password: password,
    })
}
