//! Best-effort extraction of an inbox holder's name from received mail.
//!
//! Tier 1 reads greeting lines in message bodies; tier 2 splits the email
//! local part around the extracted first name. Callers bound the whole
//! attempt with a timeout; a miss is not an error.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::error::Result;
use crate::mail_client::{MailApi, ProviderAccount};

/// Messages sampled from the inbox when looking for a greeting.
const SAMPLE_MESSAGES: usize = 5;

static GREETING_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // "Hi Name," / "Hello Name" / "Dear Name"
        Regex::new(r"\b(?:Hi|Hello|Hey|Dear)\s+([A-Z][a-z]{1,20})\b").unwrap(),
        // "Congratulations, Name" / "Welcome Name" / "Thanks Name"
        Regex::new(r"\b(?:Congratulations|Welcome|Thanks|Thank you),?\s+([A-Z][a-z]{1,20})\b")
            .unwrap(),
        // Leading "Name, your ..." lines
        Regex::new(r"(?m)^([A-Z][a-z]{1,20}),\s+(?:your|start|to |we |you |this|the |please)")
            .unwrap(),
    ]
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedName {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Pull a first name out of greeting lines in free text.
pub fn first_name_from_text(text: &str) -> Option<String> {
    for pattern in GREETING_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(text) {
            if let Some(name) = captures.get(1) {
                return Some(name.as_str().to_string());
            }
        }
    }
    None
}

/// Split an email local part around a known first name:
/// `john.smith@` / `johnsmith@` with first name "John" yields "Smith".
pub fn last_name_from_local_part(local_part: &str, first_name: &str) -> Option<String> {
    let local = local_part.to_lowercase();
    let first = first_name.to_lowercase();

    // Separator form: john.smith, john_smith, john-smith
    for separator in ['.', '_', '-'] {
        if let Some((head, tail)) = local.split_once(separator) {
            if head == first && !tail.is_empty() {
                let tail: String = tail.chars().filter(|c| c.is_ascii_alphabetic()).collect();
                if tail.len() > 1 {
                    return Some(capitalize(&tail));
                }
            }
        }
    }

    // Concatenated form: johnsmith
    if let Some(tail) = local.strip_prefix(&first) {
        let tail: String = tail.chars().filter(|c| c.is_ascii_alphabetic()).collect();
        if tail.len() > 1 {
            return Some(capitalize(&tail));
        }
    }

    None
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Extract a name for a provider account by sampling recent inbox bodies.
pub async fn extract_names(
    mail: &dyn MailApi,
    account: &ProviderAccount,
) -> Result<Option<ExtractedName>> {
    let Some(inbox_id) = &account.inbox_id else {
        return Ok(None);
    };

    let page = mail
        .list_messages(&account.id, inbox_id, 1, SAMPLE_MESSAGES as u32)
        .await?;

    for header in page.messages.iter().take(SAMPLE_MESSAGES) {
        let Some(message) = mail.get_message(&header.id).await? else {
            continue;
        };
        if let Some(first_name) = first_name_from_text(&message.body()) {
            let local_part = account.email.split('@').next().unwrap_or_default();
            let last_name = last_name_from_local_part(local_part, &first_name);
            debug!(
                "name extraction hit for {}: {first_name} {last_name:?}",
                account.email
            );
            return Ok(Some(ExtractedName {
                first_name: Some(first_name),
                last_name,
            }));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_name_from_greetings() {
        assert_eq!(
            first_name_from_text("Hi Marcus, welcome to the platform"),
            Some("Marcus".to_string())
        );
        assert_eq!(
            first_name_from_text("Dear Johanna,\nYour application was received."),
            Some("Johanna".to_string())
        );
        assert_eq!(
            first_name_from_text("Congratulations, Pedro! You did it."),
            Some("Pedro".to_string())
        );
        assert_eq!(
            first_name_from_text("Alice, your dash is scheduled for tomorrow"),
            Some("Alice".to_string())
        );
    }

    #[test]
    fn test_first_name_misses() {
        assert_eq!(first_name_from_text("hello there, no names here"), None);
        assert_eq!(first_name_from_text(""), None);
        // Lowercase after the greeting keyword is prose, not a name
        assert_eq!(first_name_from_text("Hi there friend"), None);
    }

    #[test]
    fn test_last_name_from_local_part() {
        assert_eq!(
            last_name_from_local_part("john.smith", "John"),
            Some("Smith".to_string())
        );
        assert_eq!(
            last_name_from_local_part("john_smith", "John"),
            Some("Smith".to_string())
        );
        assert_eq!(
            last_name_from_local_part("johnsmith", "John"),
            Some("Smith".to_string())
        );
        // Digits in the tail are stripped before the length check
        assert_eq!(
            last_name_from_local_part("john.smith99", "John"),
            Some("Smith".to_string())
        );
    }

    #[test]
    fn test_last_name_misses() {
        assert_eq!(last_name_from_local_part("jsmith", "John"), None);
        assert_eq!(last_name_from_local_part("john", "John"), None);
        assert_eq!(last_name_from_local_part("john.s", "John"), None);
        assert_eq!(last_name_from_local_part("mary.smith", "John"), None);
    }
}
