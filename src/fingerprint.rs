//! Template fingerprinting: collapses superficially distinct messages that
//! are the same template instantiated with per-recipient variables.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;

use crate::models::{ClassificationSource, Urgency};

// Greeting runs on the original-cased subject: the capitalised name is the
// signal that distinguishes "Hi Marcus" from ordinary prose.
static GREETING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?i:hi|hello|hey|dear)\s+[A-Z][a-z]{2,}\b").unwrap());

static AMOUNT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$[\d,.]+").unwrap());
static ISO_DATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").unwrap());
static SLASH_DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,2}[/-]\d{1,2}(?:[/-]\d{2,4})?\b").unwrap());
static MONTH_DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(?:jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|jun(?:e)?|jul(?:y)?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)\.?\s+\d{1,2}(?:st|nd|rd|th)?\b",
    )
    .unwrap()
});
static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(?:19|20)\d{2}\b").unwrap());
static NUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{4,}\b").unwrap());

/// Reduce a subject to its template form by stripping per-recipient data.
///
/// Idempotent: the replacement tokens contain no digits or capitalised
/// names, so a second pass leaves the output unchanged.
pub fn normalize_subject(subject: &str) -> String {
    let s = subject.trim();
    let s = GREETING_RE.replace_all(s, "greeting");
    let s = s.to_lowercase();
    let s = AMOUNT_RE.replace_all(&s, "$$x");
    let s = ISO_DATE_RE.replace_all(&s, "date");
    let s = SLASH_DATE_RE.replace_all(&s, "date");
    let s = MONTH_DATE_RE.replace_all(&s, "date");
    let s = YEAR_RE.replace_all(&s, "year");
    let s = NUM_RE.replace_all(&s, "num");
    s.into_owned()
}

/// Reduce a sender to its bare domain: strip any display name and angle
/// brackets, take the part after `@`.
pub fn sender_domain(sender: &str) -> String {
    let mut s = sender;
    if let Some(idx) = s.rfind('<') {
        s = s[idx + 1..].trim_end_matches('>');
    }
    match s.rfind('@') {
        Some(idx) => s[idx + 1..].to_lowercase(),
        None => s.to_lowercase(),
    }
}

/// First 16 hex characters of SHA-256 over `domain|normalised_subject`.
pub fn make_fingerprint(subject: &str, sender: &str) -> String {
    let raw = format!("{}|{}", sender_domain(sender), normalize_subject(subject));
    let digest = Sha256::digest(raw.as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        let _ = write!(hex, "{:02x}", byte);
    }
    hex
}

/// Classification blob stored in the template cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedClassification {
    pub category: String,
    pub sub_category: String,
    pub confidence: f32,
    pub source: ClassificationSource,
    pub summary: String,
    pub urgency: Urgency,
    pub action_required: bool,
}

/// Counters reported when a scan finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Scan-scoped mapping of fingerprint to classification blob.
///
/// No eviction within a scan; the whole cache is discarded when the run
/// ends. Shared across per-inbox jobs behind a mutex.
#[derive(Debug, Default)]
pub struct TemplateCache {
    entries: HashMap<String, CachedClassification>,
    hits: u64,
    misses: u64,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, fingerprint: &str) -> Option<CachedClassification> {
        match self.entries.get(fingerprint) {
            Some(cached) => {
                self.hits += 1;
                Some(cached.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn put(&mut self, fingerprint: String, classification: CachedClassification) {
        self.entries.insert(fingerprint, classification);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_strips_amounts_and_dates() {
        assert_eq!(
            normalize_subject("Your weekly pay of $123.45 is ready on 01/15/2024"),
            "your weekly pay of $x is ready on date"
        );
        assert_eq!(
            normalize_subject("Statement for 2024-06-01"),
            "statement for date"
        );
        assert_eq!(
            normalize_subject("Delivery on March 3rd"),
            "delivery on date"
        );
    }

    #[test]
    fn test_normalize_strips_years_and_long_numbers() {
        assert_eq!(normalize_subject("Tax summary for 2024"), "tax summary for year");
        assert_eq!(normalize_subject("Order #123456 shipped"), "order #num shipped");
        // Short digit runs survive
        assert_eq!(normalize_subject("Top 10 tips"), "top 10 tips");
    }

    #[test]
    fn test_normalize_strips_greeting_names() {
        assert_eq!(
            normalize_subject("Hi Marcus, your dash is ready"),
            "greeting, your dash is ready"
        );
        assert_eq!(
            normalize_subject("Dear Johanna welcome aboard"),
            "greeting welcome aboard"
        );
        // Lowercase names are not greeting targets
        assert_eq!(normalize_subject("hi there friend"), "hi there friend");
    }

    #[test]
    fn test_normalize_idempotent() {
        let subjects = [
            "Your weekly pay of $123.45 is ready on 01/15/2024",
            "Hi Marcus, order #987654 ships March 3rd 2024",
            "plain subject with no variables",
        ];
        for subject in subjects {
            let once = normalize_subject(subject);
            assert_eq!(normalize_subject(&once), once, "subject: {subject}");
        }
    }

    #[test]
    fn test_sender_domain() {
        assert_eq!(sender_domain("DoorDash <no-reply@doordash.com>"), "doordash.com");
        assert_eq!(sender_domain("checkr@checkr.com"), "checkr.com");
        assert_eq!(sender_domain("<admin@Example.COM>"), "example.com");
        assert_eq!(sender_domain("not-an-address"), "not-an-address");
    }

    #[test]
    fn test_fingerprint_collapses_template_variants() {
        let a = make_fingerprint(
            "Your weekly pay is ready on 01/15/2024",
            "sender@doordash.com",
        );
        let b = make_fingerprint(
            "Your weekly pay is ready on 02/22/2024",
            "DoorDash <sender@doordash.com>",
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_distinguishes_domains() {
        let a = make_fingerprint("Your background check is complete", "checkr@checkr.com");
        let b = make_fingerprint("Your background check is complete", "checkr@onfido.com");
        assert_ne!(a, b);
    }

    #[test]
    fn test_cache_counters() {
        let mut cache = TemplateCache::new();
        let blob = CachedClassification {
            category: "earnings".to_string(),
            sub_category: "weekly_pay".to_string(),
            confidence: 0.95,
            source: ClassificationSource::Rules,
            summary: "Weekly pay statement".to_string(),
            urgency: Urgency::Low,
            action_required: false,
        };

        assert!(cache.get("fp1").is_none());
        cache.put("fp1".to_string(), blob.clone());
        assert_eq!(cache.get("fp1"), Some(blob));

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    proptest! {
        #[test]
        fn prop_normalize_idempotent(subject in ".{0,120}") {
            let once = normalize_subject(&subject);
            prop_assert_eq!(normalize_subject(&once), once);
        }

        #[test]
        fn prop_fingerprint_is_16_hex(subject in ".{0,80}", sender in "[a-z]{1,10}@[a-z]{1,10}\\.com") {
            let fp = make_fingerprint(&subject, &sender);
            prop_assert_eq!(fp.len(), 16);
            prop_assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
