//! Priority-ranked stage detection from message signals.
//!
//! Priority (highest wins):
//!   DEACTIVATED > ACTIVE > BGC_CONSIDER > BGC_CLEAR > BGC_PENDING >
//!   IDENTITY_VERIFIED > REGISTERED
//!
//! Messages are walked newest-first. A deactivation short-circuits unless a
//! reactivation was already seen; BGC-complete messages are recorded for a
//! deferred body inspection that can only promote CLEAR to CONSIDER.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{DetectionConfidence, MessageHeader, Stage};

/// Known background-check vendors; generic BGC mentions only count when the
/// sender matches one of these.
pub const BGC_VENDORS: [&str; 5] = ["checkr", "onfido", "sterling", "accurate", "certn"];

static DEACTIVATION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)dasher\s+account\s+has\s+been\s+deactivated").unwrap(),
        Regex::new(r"(?i)account.*deactivat").unwrap(),
        Regex::new(r"(?i)deactivation.*confirm").unwrap(),
        Regex::new(r"(?i)your\s+account\s+is.*deactivat").unwrap(),
        Regex::new(r"(?i)account.*suspend").unwrap(),
        Regex::new(r"(?i)permanently.*deactivat").unwrap(),
    ]
});

static REACTIVATION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)account.*reactivat").unwrap(),
        Regex::new(r"(?i)welcome\s+back").unwrap(),
        Regex::new(r"(?i)reactivation.*complete").unwrap(),
        Regex::new(r"(?i)account.*restored").unwrap(),
    ]
});

// Real earnings/delivery/payment proof only. Promotional subjects such as
// "how was your experience", "time to dash" or "maximize your earnings" are
// deliberately excluded: they arrive before an account is active.
static ACTIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)payment\s+processed").unwrap(),
        Regex::new(r"(?i)pay\s+statement").unwrap(),
        Regex::new(r"(?i)fast\s+pay\s+transfer").unwrap(),
        Regex::new(r"(?i)dasher\s+welcome\s+gift").unwrap(),
        Regex::new(r"(?i)your\s+first\s+dash").unwrap(),
        Regex::new(r"(?i)first\s+dash.*(?:done|complete|finished)").unwrap(),
        Regex::new(r"(?i)congratulations.*first\s+dash").unwrap(),
        Regex::new(r"(?i)you\s+completed.*(?:first\s+)?dash").unwrap(),
    ]
});

static BGC_COMPLETE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:background\s+check|bgc)\s+is\s+complete").unwrap());

static BGC_PENDING_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)(?:background\s+check|bgc)\s+is\s+taking\s+longer").unwrap(),
        Regex::new(r"(?i)(?:background\s+check|bgc)\s+paused").unwrap(),
        Regex::new(r"(?i)more\s+information\s+needed").unwrap(),
        Regex::new(r"(?i)let'?s\s+find\s+your\s+(?:background\s+check|bgc)").unwrap(),
        Regex::new(r"(?i)agreed\s+to\s+checkr").unwrap(),
        Regex::new(r"(?i)verify\s+your\s+email").unwrap(),
        Regex::new(r"(?i)finish\s+your\s+personal\s+check").unwrap(),
    ]
});

static BGC_GENERIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)background\s+check|bgc").unwrap());
static COMPLETE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)complete").unwrap());

static IDENTITY_VERIFIED_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)identity.*verified").unwrap(),
        Regex::new(r"(?i)information\s+verified").unwrap(),
    ]
});

// Adverse-action phrases; the first ("could potentially impact") is the
// most specific.
static BGC_CONSIDER_BODY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)could\s+potentially\s+impact").unwrap(),
        Regex::new(r"(?i)disqualif").unwrap(),
        Regex::new(r"(?i)may\s+affect\s+eligibility").unwrap(),
        Regex::new(r"(?i)adverse.*action").unwrap(),
        Regex::new(r"(?i)require.*review").unwrap(),
    ]
});

/// Outcome of a detection pass over an inbox's headers.
#[derive(Debug, Clone)]
pub struct StageDetection {
    pub stage: Stage,
    pub trigger_subject: Option<String>,
    pub trigger_date: Option<DateTime<Utc>>,
    /// BGC-complete messages whose bodies decide CLEAR vs CONSIDER
    pub needs_body_check: Vec<MessageHeader>,
    pub confidence: DetectionConfidence,
    /// A reactivation signal was observed; unlocks DEACTIVATED -> ACTIVE
    pub reactivated: bool,
}

impl StageDetection {
    fn registered() -> Self {
        Self {
            stage: Stage::Registered,
            trigger_subject: None,
            trigger_date: None,
            needs_body_check: Vec::new(),
            confidence: DetectionConfidence::Low,
            reactivated: false,
        }
    }
}

fn any_match(patterns: &[Regex], text: &str) -> bool {
    patterns.iter().any(|p| p.is_match(text))
}

fn is_bgc_vendor(sender: &str) -> bool {
    let lower = sender.to_lowercase();
    BGC_VENDORS.iter().any(|vendor| lower.contains(vendor))
}

fn is_bgc_pending_signal(subject: &str, sender: &str) -> bool {
    if !is_bgc_vendor(sender) {
        return false;
    }
    if any_match(&BGC_PENDING_PATTERNS, subject) {
        return true;
    }
    // Generic BGC mention from a vendor, but not "complete"
    BGC_GENERIC_RE.is_match(subject) && !COMPLETE_RE.is_match(subject)
}

/// Sort newest first; messages without a parseable date sort last.
fn sort_by_date_desc(messages: &[MessageHeader]) -> Vec<&MessageHeader> {
    let mut sorted: Vec<&MessageHeader> = messages.iter().collect();
    sorted.sort_by_key(|m| std::cmp::Reverse(m.date.unwrap_or(DateTime::<Utc>::MIN_UTC)));
    sorted
}

fn compute_confidence(stage: Stage, subject: &str) -> DetectionConfidence {
    match stage {
        Stage::Deactivated => {
            if DEACTIVATION_PATTERNS[0].is_match(subject) {
                DetectionConfidence::High
            } else {
                DetectionConfidence::Medium
            }
        }
        Stage::Active => {
            // "payment processed" / "pay statement" are exact proofs
            if ACTIVE_PATTERNS[0].is_match(subject) || ACTIVE_PATTERNS[1].is_match(subject) {
                DetectionConfidence::High
            } else {
                DetectionConfidence::Medium
            }
        }
        Stage::BgcClear | Stage::BgcConsider => {
            if BGC_COMPLETE_RE.is_match(subject) {
                DetectionConfidence::High
            } else {
                DetectionConfidence::Medium
            }
        }
        Stage::BgcPending => {
            if any_match(&BGC_PENDING_PATTERNS, subject) {
                DetectionConfidence::High
            } else if BGC_GENERIC_RE.is_match(subject) {
                DetectionConfidence::Low
            } else {
                DetectionConfidence::Medium
            }
        }
        Stage::IdentityVerified => {
            if any_match(&IDENTITY_VERIFIED_PATTERNS, subject) {
                DetectionConfidence::High
            } else {
                DetectionConfidence::Medium
            }
        }
        Stage::Registered => DetectionConfidence::Low,
    }
}

/// Analyze an inbox's headers to detect its lifecycle stage.
///
/// The caller is expected to fetch the bodies of `needs_body_check`
/// messages afterwards and run [`check_bgc_body`] on each; body inspection
/// may strictly promote BGC_CLEAR to BGC_CONSIDER, never demote.
pub fn detect_stage(messages: &[MessageHeader]) -> StageDetection {
    let mut detection = StageDetection::registered();

    for msg in sort_by_date_desc(messages) {
        let subject = msg.subject.trim();

        // Reactivation takes precedence over deactivation
        if any_match(&REACTIVATION_PATTERNS, subject) {
            detection.reactivated = true;
            if Stage::Active.priority() > detection.stage.priority() {
                detection.stage = Stage::Active;
                detection.trigger_subject = Some(msg.subject.clone());
                detection.trigger_date = msg.date;
                detection.confidence = compute_confidence(Stage::Active, subject);
            }
        } else if any_match(&DEACTIVATION_PATTERNS, subject) {
            if !detection.reactivated {
                // Highest priority: nothing else matters
                return StageDetection {
                    stage: Stage::Deactivated,
                    trigger_subject: Some(msg.subject.clone()),
                    trigger_date: msg.date,
                    needs_body_check: Vec::new(),
                    confidence: compute_confidence(Stage::Deactivated, subject),
                    reactivated: false,
                };
            }
        } else if any_match(&ACTIVE_PATTERNS, subject) {
            if Stage::Active.priority() > detection.stage.priority() {
                detection.stage = Stage::Active;
                detection.trigger_subject = Some(msg.subject.clone());
                detection.trigger_date = msg.date;
                detection.confidence = compute_confidence(Stage::Active, subject);
            }
        } else if BGC_COMPLETE_RE.is_match(subject) {
            detection.needs_body_check.push(msg.clone());
            if Stage::BgcClear.priority() > detection.stage.priority() {
                detection.stage = Stage::BgcClear;
                detection.trigger_subject = Some(msg.subject.clone());
                detection.trigger_date = msg.date;
                detection.confidence = compute_confidence(Stage::BgcClear, subject);
            }
        } else if is_bgc_pending_signal(subject, &msg.sender) {
            if Stage::BgcPending.priority() > detection.stage.priority() {
                detection.stage = Stage::BgcPending;
                detection.trigger_subject = Some(msg.subject.clone());
                detection.trigger_date = msg.date;
                detection.confidence = compute_confidence(Stage::BgcPending, subject);
            }
        } else if any_match(&IDENTITY_VERIFIED_PATTERNS, subject)
            && Stage::IdentityVerified.priority() > detection.stage.priority()
        {
            detection.stage = Stage::IdentityVerified;
            detection.trigger_subject = Some(msg.subject.clone());
            detection.trigger_date = msg.date;
            detection.confidence = compute_confidence(Stage::IdentityVerified, subject);
        }
    }

    detection
}

/// Inspect a BGC completion body: adverse-action phrasing means CONSIDER.
pub fn check_bgc_body(body: &str) -> Stage {
    if any_match(&BGC_CONSIDER_BODY_PATTERNS, body) {
        Stage::BgcConsider
    } else {
        Stage::BgcClear
    }
}

/// Body inspection with an advisory confidence attached.
pub fn check_bgc_body_with_confidence(body: &str) -> (Stage, DetectionConfidence) {
    for (i, pattern) in BGC_CONSIDER_BODY_PATTERNS.iter().enumerate() {
        if pattern.is_match(body) {
            let confidence = if i == 0 {
                DetectionConfidence::High
            } else {
                DetectionConfidence::Medium
            };
            return (Stage::BgcConsider, confidence);
        }
    }
    (Stage::BgcClear, DetectionConfidence::High)
}
