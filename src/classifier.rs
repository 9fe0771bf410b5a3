//! Rule-based classifier for Dasher account emails.
//!
//! Ordered pattern bank, first match wins. A positive match carries a
//! confidence in [0.7, 1.0]; anything below the threshold (including the
//! DoorDash-sender catchall at 0.5) signals the pipeline to try the LLM.
//!
//! Categories:
//!   - bgc: submitted, pending, clear, consider, identity_verified
//!   - account: welcome, activation, deactivation, reactivation
//!   - earnings: weekly_pay, direct_deposit, earnings_summary, tax_document
//!   - operational: dash_opportunity, rating_update, policy_update, promotion, survey
//!   - insurance / scheduling / equipment: single-rule categories
//!   - warning: contract_violation, low_rating_warning
//!   - unknown: needs_review (routed to the LLM)

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::Urgency;

/// Matches below this confidence are handed to the LLM tier.
pub const CONFIDENCE_THRESHOLD: f32 = 0.7;

/// Known background-check vendors; their sender domains unlock the
/// stricter BGC sub-category rules.
pub const BGC_VENDORS: [&str; 5] = ["checkr", "onfido", "sterling", "accurate", "certn"];

/// Output of a rule match.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    pub category: String,
    pub sub_category: String,
    pub confidence: f32,
    pub summary: String,
    pub urgency: Urgency,
    pub action_required: bool,
}

impl ClassificationResult {
    fn new(
        category: &str,
        sub_category: &str,
        confidence: f32,
        summary: &str,
        urgency: Urgency,
        action_required: bool,
    ) -> Self {
        Self {
            category: category.to_string(),
            sub_category: sub_category.to_string(),
            confidence,
            summary: summary.to_string(),
            urgency,
            action_required,
        }
    }
}

struct SubjectPatterns {
    deactivation: Regex,
    reactivation: Regex,
    dasher: Regex,
    doordash: Regex,
    contract_violation: Regex,
    rating: Regex,
    rating_risk: Regex,
    update: Regex,
    bgc_complete: Regex,
    bgc_pending: Regex,
    bgc_generic: Regex,
    complete: Regex,
    identity_verified: Regex,
    checkr_consent: Regex,
    more_info: Regex,
    welcome: Regex,
    activation: Regex,
    deactivat: Regex,
    weekly_pay: Regex,
    direct_deposit: Regex,
    earnings_summary: Regex,
    tax_document: Regex,
    first_dash: Regex,
    dash_opportunity: Regex,
    policy_update: Regex,
    survey: Regex,
    promotion: Regex,
    payment_bank: Regex,
    insurance: Regex,
    scheduling: Regex,
    equipment: Regex,
}

// Compiled once; `\s+` keeps every pattern whitespace-tolerant.
static PATTERNS: Lazy<SubjectPatterns> = Lazy::new(|| SubjectPatterns {
    deactivation: Regex::new(r"(?i)dasher\s+account\s+has\s+been\s+deactivated").unwrap(),
    reactivation: Regex::new(r"(?i)reactivat").unwrap(),
    dasher: Regex::new(r"(?i)dasher").unwrap(),
    doordash: Regex::new(r"(?i)doordash").unwrap(),
    contract_violation: Regex::new(r"(?i)contract\s+violation|violation\s+notice").unwrap(),
    rating: Regex::new(r"(?i)rating").unwrap(),
    rating_risk: Regex::new(r"(?i)warning|low|risk").unwrap(),
    update: Regex::new(r"(?i)update").unwrap(),
    bgc_complete: Regex::new(r"(?i)(?:background\s*check|bgc|bg\s*check).*(?:is\s+)?complete")
        .unwrap(),
    bgc_pending: Regex::new(
        r"(?i)(?:background\s*check|bgc|bg\s*check).*(?:taking\s+longer|paused)|more\s+information\s+needed|finish\s+your\s+personal\s+check",
    )
    .unwrap(),
    bgc_generic: Regex::new(r"(?i)background\s*check|bgc|bg\s*check").unwrap(),
    complete: Regex::new(r"(?i)complete").unwrap(),
    identity_verified: Regex::new(r"(?i)identity.*verified|information\s+verified").unwrap(),
    checkr_consent: Regex::new(r"(?i)agreed\s+to\s+checkr|verify\s+your\s+email").unwrap(),
    more_info: Regex::new(r"(?i)more\s+information").unwrap(),
    welcome: Regex::new(r"(?i)welcome").unwrap(),
    activation: Regex::new(r"(?i)account.*activat").unwrap(),
    deactivat: Regex::new(r"(?i)deactivat").unwrap(),
    weekly_pay: Regex::new(r"(?i)(?:your\s+)?weekly\s+(?:pay|earnings)|pay\s+statement").unwrap(),
    direct_deposit: Regex::new(r"(?i)direct\s+deposit|fast\s+pay\s+transfer").unwrap(),
    earnings_summary: Regex::new(
        r"(?i)you\s+earned|your\s+earnings|earnings\s+summary|delivery\s+summary",
    )
    .unwrap(),
    tax_document: Regex::new(r"(?i)1099|tax\s+document|tax\s+form|tax\s+statement").unwrap(),
    first_dash: Regex::new(
        r"(?i)first\s+dash.*(?:done|complete|finished)|your\s+first\s+dash|congratulations.*first\s+dash|you\s+completed.*(?:first\s+)?dash",
    )
    .unwrap(),
    dash_opportunity: Regex::new(
        r"(?i)new\s+dash\s+available|time\s+to\s+dash|dash\s+opportunity|busy\s+near\s+you",
    )
    .unwrap(),
    policy_update: Regex::new(
        r"(?i)policy\s+update|terms\s+of\s+service|agreement\s+update|ica\s+update",
    )
    .unwrap(),
    survey: Regex::new(r"(?i)how\s+was\s+your\s+experience|survey|feedback").unwrap(),
    promotion: Regex::new(r"(?i)promotion|bonus|challenge|incentive|prop\s+22").unwrap(),
    payment_bank: Regex::new(
        r"(?i)payment\s+processed|dasher\s+pay|dasher\s+bank|dasher\s+welcome\s+gift",
    )
    .unwrap(),
    insurance: Regex::new(r"(?i)insurance|coverage|claim|liability|workers.*comp").unwrap(),
    scheduling: Regex::new(r"(?i)schedule|shift|availability|time\s+slot|peak\s+pay").unwrap(),
    equipment: Regex::new(r"(?i)red\s+card|activation\s+kit|hot\s+bag|equipment|dasher\s+kit")
        .unwrap(),
});

// Body patterns signalling a BGC outcome of `consider`.
static BGC_CONSIDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)could\s+potentially\s+impact|disqualif|may\s+affect\s+eligibility|adverse.*action|require.*review|(?:record|item).*(?:found|flagged)",
    )
    .unwrap()
});

#[derive(Debug, Clone, Copy)]
enum MatchKind {
    Exact,
    Variant,
}

/// Adjust confidence by match quality, clamped into the positive band.
fn score_confidence(base: f32, kind: MatchKind) -> f32 {
    match kind {
        MatchKind::Exact => base.clamp(CONFIDENCE_THRESHOLD, 1.0),
        MatchKind::Variant => {
            if base >= 0.9 {
                (base * 0.95).clamp(CONFIDENCE_THRESHOLD, 1.0)
            } else {
                base.max(CONFIDENCE_THRESHOLD)
            }
        }
    }
}

fn is_bgc_vendor(sender: &str) -> bool {
    let lower = sender.to_lowercase();
    BGC_VENDORS.iter().any(|vendor| lower.contains(vendor))
}

/// Classify an email using the ordered rule bank.
///
/// Pure function: no I/O, no shared mutable state. Returns `None` when no
/// rule applies at all (the pipeline then tries the LLM).
pub fn classify_email(subject: &str, sender: &str, body: &str) -> Option<ClassificationResult> {
    let subj = subject.trim();
    let p = &*PATTERNS;

    // Deactivation: critical, checked before everything else
    if p.deactivation.is_match(subj) {
        return Some(ClassificationResult::new(
            "account",
            "deactivation",
            1.0,
            "Dasher account has been deactivated",
            Urgency::Critical,
            true,
        ));
    }

    // Reactivation, gated on a Dasher/DoorDash context
    if p.reactivation.is_match(subj) && (p.dasher.is_match(subj) || p.doordash.is_match(sender)) {
        return Some(ClassificationResult::new(
            "account",
            "reactivation",
            score_confidence(0.9, MatchKind::Variant),
            "Account reactivation notification",
            Urgency::High,
            true,
        ));
    }

    if p.contract_violation.is_match(subj) {
        return Some(ClassificationResult::new(
            "warning",
            "contract_violation",
            score_confidence(0.95, MatchKind::Exact),
            "Contract violation reported",
            Urgency::Critical,
            true,
        ));
    }

    if p.rating.is_match(subj) && p.rating_risk.is_match(subj) {
        return Some(ClassificationResult::new(
            "warning",
            "low_rating_warning",
            score_confidence(0.85, MatchKind::Variant),
            "Low rating warning received",
            Urgency::Warning,
            true,
        ));
    }

    // BGC complete: body decides clear vs consider
    if p.bgc_complete.is_match(subj) {
        if BGC_CONSIDER_RE.is_match(body) {
            return Some(ClassificationResult::new(
                "bgc",
                "consider",
                score_confidence(1.0, MatchKind::Exact),
                "Background check complete with considerations",
                Urgency::High,
                true,
            ));
        }
        return Some(ClassificationResult::new(
            "bgc",
            "clear",
            score_confidence(0.95, MatchKind::Variant),
            "Background check completed clear",
            Urgency::Medium,
            false,
        ));
    }

    // BGC vendor senders unlock the progress sub-categories
    if is_bgc_vendor(sender) {
        if p.bgc_pending.is_match(subj) {
            return Some(ClassificationResult::new(
                "bgc",
                "pending",
                score_confidence(0.9, MatchKind::Variant),
                "Background check in progress, action may be needed",
                Urgency::Medium,
                p.more_info.is_match(subj),
            ));
        }
        if p.bgc_generic.is_match(subj) && !p.complete.is_match(subj) {
            return Some(ClassificationResult::new(
                "bgc",
                "submitted",
                score_confidence(0.85, MatchKind::Variant),
                "Background check submitted/processing",
                Urgency::Low,
                false,
            ));
        }
        if p.identity_verified.is_match(subj) {
            return Some(ClassificationResult::new(
                "bgc",
                "identity_verified",
                score_confidence(0.95, MatchKind::Exact),
                "Identity verification completed",
                Urgency::Medium,
                false,
            ));
        }
        if p.checkr_consent.is_match(subj) {
            return Some(ClassificationResult::new(
                "bgc",
                "submitted",
                score_confidence(0.8, MatchKind::Variant),
                "Consent/verification step for background check",
                Urgency::Low,
                false,
            ));
        }
    }

    // Identity verification from non-vendor senders
    if p.identity_verified.is_match(subj) {
        return Some(ClassificationResult::new(
            "bgc",
            "identity_verified",
            score_confidence(0.9, MatchKind::Variant),
            "Identity verification completed",
            Urgency::Medium,
            false,
        ));
    }

    if p.welcome.is_match(subj) && (p.dasher.is_match(subj) || p.doordash.is_match(sender)) {
        return Some(ClassificationResult::new(
            "account",
            "welcome",
            score_confidence(0.9, MatchKind::Variant),
            "Welcome to DoorDash/Dasher",
            Urgency::Info,
            false,
        ));
    }

    // Activation, but never deactivation
    if p.activation.is_match(subj) && !p.deactivat.is_match(subj) {
        return Some(ClassificationResult::new(
            "account",
            "activation",
            score_confidence(0.85, MatchKind::Variant),
            "Account activation notification",
            Urgency::Medium,
            false,
        ));
    }

    if p.weekly_pay.is_match(subj) {
        return Some(ClassificationResult::new(
            "earnings",
            "weekly_pay",
            score_confidence(0.95, MatchKind::Exact),
            "Weekly pay statement",
            Urgency::Low,
            false,
        ));
    }

    if p.direct_deposit.is_match(subj) {
        return Some(ClassificationResult::new(
            "earnings",
            "direct_deposit",
            score_confidence(0.95, MatchKind::Exact),
            "Direct deposit or fast pay notification",
            Urgency::Low,
            false,
        ));
    }

    if p.earnings_summary.is_match(subj) {
        return Some(ClassificationResult::new(
            "earnings",
            "earnings_summary",
            score_confidence(0.9, MatchKind::Variant),
            "Earnings or delivery summary",
            Urgency::Low,
            false,
        ));
    }

    if p.tax_document.is_match(subj) {
        return Some(ClassificationResult::new(
            "earnings",
            "tax_document",
            score_confidence(0.95, MatchKind::Exact),
            "Tax document available",
            Urgency::Medium,
            true,
        ));
    }

    // First dash completed: strong active-account signal
    if p.first_dash.is_match(subj) {
        return Some(ClassificationResult::new(
            "earnings",
            "earnings_summary",
            score_confidence(0.95, MatchKind::Exact),
            "First dash completed - account is active",
            Urgency::Low,
            false,
        ));
    }

    if p.dash_opportunity.is_match(subj) {
        return Some(ClassificationResult::new(
            "operational",
            "dash_opportunity",
            score_confidence(0.85, MatchKind::Variant),
            "Dash opportunity available",
            Urgency::Info,
            false,
        ));
    }

    // Rating update, after the low-rating warning rule above
    if p.rating.is_match(subj) && p.update.is_match(subj) {
        return Some(ClassificationResult::new(
            "operational",
            "rating_update",
            score_confidence(0.8, MatchKind::Variant),
            "Rating update notification",
            Urgency::Low,
            false,
        ));
    }

    if p.policy_update.is_match(subj) {
        return Some(ClassificationResult::new(
            "operational",
            "policy_update",
            score_confidence(0.85, MatchKind::Variant),
            "Policy or terms update",
            Urgency::Medium,
            true,
        ));
    }

    if p.survey.is_match(subj) {
        return Some(ClassificationResult::new(
            "operational",
            "survey",
            score_confidence(0.7, MatchKind::Variant),
            "Experience feedback request",
            Urgency::Info,
            false,
        ));
    }

    if p.promotion.is_match(subj) {
        return Some(ClassificationResult::new(
            "operational",
            "promotion",
            score_confidence(0.8, MatchKind::Variant),
            "Promotion or incentive notification",
            Urgency::Info,
            false,
        ));
    }

    if p.payment_bank.is_match(subj) {
        return Some(ClassificationResult::new(
            "earnings",
            "direct_deposit",
            score_confidence(0.8, MatchKind::Variant),
            "Payment or bank related notification",
            Urgency::Low,
            false,
        ));
    }

    if p.insurance.is_match(subj) {
        return Some(ClassificationResult::new(
            "insurance",
            "insurance",
            score_confidence(0.85, MatchKind::Variant),
            "Dasher insurance related notification",
            Urgency::Medium,
            false,
        ));
    }

    if p.scheduling.is_match(subj) {
        return Some(ClassificationResult::new(
            "scheduling",
            "scheduling",
            score_confidence(0.85, MatchKind::Variant),
            "Shift or schedule notification",
            Urgency::Low,
            false,
        ));
    }

    if p.equipment.is_match(subj) {
        return Some(ClassificationResult::new(
            "equipment",
            "equipment",
            score_confidence(0.85, MatchKind::Variant),
            "Equipment or kit notification",
            Urgency::Low,
            false,
        ));
    }

    // DoorDash sender but nothing matched: below threshold, forces the LLM
    if p.doordash.is_match(sender) {
        return Some(ClassificationResult::new(
            "unknown",
            "needs_review",
            0.5,
            "Unclassified DoorDash email",
            Urgency::Low,
            false,
        ));
    }

    None
}

/// Classify and report whether the LLM tier should run.
///
/// `needs_ai` is true when no rule matched or the match fell below the
/// confidence threshold.
pub fn classify_with_threshold(
    subject: &str,
    sender: &str,
    body: &str,
) -> (Option<ClassificationResult>, bool) {
    let result = classify_email(subject, sender, body);
    match &result {
        Some(r) if r.confidence >= CONFIDENCE_THRESHOLD => (result, false),
        _ => (result, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(subject: &str, sender: &str) -> Option<ClassificationResult> {
        classify_email(subject, sender, "")
    }

    #[test]
    fn test_deactivation_critical() {
        let result = classify(
            "Your Dasher Account Has Been Deactivated",
            "no-reply@doordash.com",
        )
        .unwrap();
        assert_eq!(result.category, "account");
        assert_eq!(result.sub_category, "deactivation");
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.urgency, Urgency::Critical);
        assert!(result.action_required);
    }

    #[test]
    fn test_reactivation_requires_dasher_context() {
        let result = classify("Your account has been reactivated", "support@doordash.com");
        assert_eq!(result.unwrap().sub_category, "reactivation");

        // Reactivation from an unrelated sender falls through
        let other = classify("Your account has been reactivated", "support@other.com");
        assert_ne!(
            other.map(|r| r.sub_category),
            Some("reactivation".to_string())
        );
    }

    #[test]
    fn test_contract_violation() {
        let result = classify("Contract Violation Notice", "no-reply@doordash.com").unwrap();
        assert_eq!(result.sub_category, "contract_violation");
        assert_eq!(result.urgency, Urgency::Critical);
        assert!(result.confidence >= 0.9);
    }

    #[test]
    fn test_low_rating_warning_beats_rating_update() {
        let warning = classify("Warning: your rating is low", "no-reply@doordash.com").unwrap();
        assert_eq!(warning.sub_category, "low_rating_warning");
        assert_eq!(warning.urgency, Urgency::Warning);

        let update = classify("Your rating update is here", "no-reply@doordash.com").unwrap();
        assert_eq!(update.sub_category, "rating_update");
    }

    #[test]
    fn test_bgc_complete_clear_vs_consider() {
        let clear = classify_email(
            "Your background check is complete",
            "checkr@checkr.com",
            "Everything looks good",
        )
        .unwrap();
        assert_eq!(clear.category, "bgc");
        assert_eq!(clear.sub_category, "clear");
        assert_eq!(clear.urgency, Urgency::Medium);

        let consider = classify_email(
            "Your background check is complete",
            "checkr@checkr.com",
            "We found items that could potentially impact your eligibility",
        )
        .unwrap();
        assert_eq!(consider.sub_category, "consider");
        assert_eq!(consider.urgency, Urgency::High);
        assert!(consider.action_required);
    }

    #[test]
    fn test_bgc_whitespace_and_alias_tolerance() {
        let result = classify("Your bgc  is   complete", "checkr@checkr.com").unwrap();
        assert_eq!(result.sub_category, "clear");
    }

    #[test]
    fn test_bgc_vendor_pending_rules() {
        for vendor in ["checkr.com", "onfido.com", "sterling.com"] {
            let sender = format!("no-reply@{vendor}");
            let result = classify("Your background check is taking longer", &sender).unwrap();
            assert_eq!(result.sub_category, "pending", "vendor {vendor}");
        }

        let submitted = classify("Background check received", "checkr@checkr.com").unwrap();
        assert_eq!(submitted.sub_category, "submitted");

        // Same subject from a non-vendor sender is not a BGC progress email
        let not_vendor = classify("Background check received", "hr@employer.com");
        assert_ne!(
            not_vendor.map(|r| r.sub_category),
            Some("submitted".to_string())
        );
    }

    #[test]
    fn test_bgc_pending_action_required_on_more_info() {
        let result = classify("More information needed", "checkr@checkr.com").unwrap();
        assert_eq!(result.sub_category, "pending");
        assert!(result.action_required);
    }

    #[test]
    fn test_identity_verified() {
        let vendor = classify("Your identity has been verified", "checkr@checkr.com").unwrap();
        assert_eq!(vendor.sub_category, "identity_verified");

        let generic = classify("Information verified", "security@doordash.com").unwrap();
        assert_eq!(generic.sub_category, "identity_verified");
    }

    #[test]
    fn test_welcome_and_activation() {
        let welcome = classify("Welcome to DoorDash", "team@doordash.com").unwrap();
        assert_eq!(welcome.sub_category, "welcome");

        let activation = classify("Your account is activated", "team@doordash.com").unwrap();
        assert_eq!(activation.sub_category, "activation");

        // "deactivated" must never fall into the activation rule
        let deactivated = classify(
            "Your Dasher Account Has Been Deactivated",
            "team@doordash.com",
        )
        .unwrap();
        assert_eq!(deactivated.sub_category, "deactivation");
    }

    #[test]
    fn test_earnings_rules() {
        let weekly = classify("Your weekly pay is ready", "pay@doordash.com").unwrap();
        assert_eq!(weekly.sub_category, "weekly_pay");
        assert!(weekly.confidence >= 0.9);

        let deposit = classify("Fast Pay transfer initiated", "pay@doordash.com").unwrap();
        assert_eq!(deposit.sub_category, "direct_deposit");

        let summary = classify("You earned $84.20 today", "pay@doordash.com").unwrap();
        assert_eq!(summary.sub_category, "earnings_summary");

        let tax = classify("Your 1099 is available", "tax@doordash.com").unwrap();
        assert_eq!(tax.sub_category, "tax_document");
        assert!(tax.action_required);
    }

    #[test]
    fn test_first_dash_is_earnings() {
        let result = classify(
            "Congratulations on your first dash!",
            "team@doordash.com",
        )
        .unwrap();
        assert_eq!(result.category, "earnings");
        assert!(result.confidence >= 0.9);
    }

    #[test]
    fn test_operational_rules() {
        let opportunity = classify("Time to dash: it's busy!", "team@doordash.com").unwrap();
        assert_eq!(opportunity.sub_category, "dash_opportunity");

        let policy = classify("Terms of Service update", "legal@doordash.com").unwrap();
        assert_eq!(policy.sub_category, "policy_update");
        assert!(policy.action_required);

        let survey = classify("How was your experience?", "team@doordash.com").unwrap();
        assert_eq!(survey.sub_category, "survey");

        let promo = classify("New challenge: peak pay bonus", "team@doordash.com").unwrap();
        // promotion wins over scheduling's peak-pay keyword by rule order
        assert_eq!(promo.sub_category, "promotion");
    }

    #[test]
    fn test_single_rule_categories() {
        let insurance = classify("Your insurance coverage details", "team@doordash.com").unwrap();
        assert_eq!(insurance.category, "insurance");

        let scheduling = classify("Your shift schedule for next week", "team@doordash.com").unwrap();
        assert_eq!(scheduling.category, "scheduling");

        let equipment = classify("Your Red Card has shipped", "team@doordash.com").unwrap();
        assert_eq!(equipment.category, "equipment");
    }

    #[test]
    fn test_doordash_catchall_forces_llm() {
        let (result, needs_ai) =
            classify_with_threshold("Quick note", "noreply@doordash.com", "");
        let result = result.unwrap();
        assert_eq!(result.category, "unknown");
        assert_eq!(result.sub_category, "needs_review");
        assert_eq!(result.confidence, 0.5);
        assert!(needs_ai);
    }

    #[test]
    fn test_unmatched_returns_none_and_needs_ai() {
        let (result, needs_ai) =
            classify_with_threshold("Totally unrelated", "random@example.com", "");
        assert!(result.is_none());
        assert!(needs_ai);
    }

    #[test]
    fn test_confident_match_skips_ai() {
        let (result, needs_ai) =
            classify_with_threshold("Your weekly pay is ready", "pay@doordash.com", "");
        assert!(result.is_some());
        assert!(!needs_ai);
    }

    #[test]
    fn test_positive_confidence_band() {
        let subjects = [
            "Your Dasher Account Has Been Deactivated",
            "Contract violation notice",
            "Your background check is complete",
            "Welcome to DoorDash",
            "Your weekly pay is ready",
            "Your 1099 is available",
            "Time to dash",
            "Terms of service update",
            "Your Red Card has shipped",
        ];
        for subject in subjects {
            let result = classify(subject, "no-reply@doordash.com").unwrap();
            assert!(
                (CONFIDENCE_THRESHOLD..=1.0).contains(&result.confidence),
                "{subject}: {}",
                result.confidence
            );
        }
    }

    #[test]
    fn test_classification_deterministic() {
        let first = classify_email("Your weekly pay is ready", "pay@doordash.com", "body");
        let second = classify_email("Your weekly pay is ready", "pay@doordash.com", "body");
        assert_eq!(first, second);
    }
}
