//! Core data model: inbox lifecycle stages, classifications, alerts, scan logs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle position of a tracked inbox.
///
/// Totally ordered by priority rank; scanner-driven promotions only move
/// strictly upward, except the DEACTIVATED -> ACTIVE reactivation path.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    #[default]
    Registered,
    IdentityVerified,
    BgcPending,
    BgcClear,
    BgcConsider,
    Active,
    Deactivated,
}

impl Stage {
    /// Priority rank. Higher wins during detection and promotion.
    pub fn priority(&self) -> u8 {
        match self {
            Stage::Registered => 0,
            Stage::IdentityVerified => 1,
            Stage::BgcPending => 2,
            Stage::BgcClear => 3,
            Stage::BgcConsider => 4,
            Stage::Active => 5,
            Stage::Deactivated => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Registered => "REGISTERED",
            Stage::IdentityVerified => "IDENTITY_VERIFIED",
            Stage::BgcPending => "BGC_PENDING",
            Stage::BgcClear => "BGC_CLEAR",
            Stage::BgcConsider => "BGC_CONSIDER",
            Stage::Active => "ACTIVE",
            Stage::Deactivated => "DEACTIVATED",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REGISTERED" => Ok(Stage::Registered),
            "IDENTITY_VERIFIED" => Ok(Stage::IdentityVerified),
            "BGC_PENDING" => Ok(Stage::BgcPending),
            "BGC_CLEAR" => Ok(Stage::BgcClear),
            "BGC_CONSIDER" => Ok(Stage::BgcConsider),
            "ACTIVE" => Ok(Stage::Active),
            "DEACTIVATED" => Ok(Stage::Deactivated),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

/// Where a classification row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Rules,
    Ai,
    RulesDedup,
    AiDedup,
    Manual,
    Error,
}

impl ClassificationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationSource::Rules => "rules",
            ClassificationSource::Ai => "ai",
            ClassificationSource::RulesDedup => "rules_dedup",
            ClassificationSource::AiDedup => "ai_dedup",
            ClassificationSource::Manual => "manual",
            ClassificationSource::Error => "error",
        }
    }

    /// The `_dedup` variant of this source, used when a template-cache hit
    /// is persisted for another message.
    pub fn dedup(&self) -> Self {
        match self {
            ClassificationSource::Rules => ClassificationSource::RulesDedup,
            ClassificationSource::Ai => ClassificationSource::AiDedup,
            other => *other,
        }
    }

    pub fn is_dedup(&self) -> bool {
        matches!(
            self,
            ClassificationSource::RulesDedup | ClassificationSource::AiDedup
        )
    }
}

/// Urgency attached to a message classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Warning,
    Critical,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Info => "info",
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
            Urgency::Warning => "warning",
            Urgency::Critical => "critical",
        }
    }

    /// Lenient parse used for LLM responses; anything unrecognised maps to Info.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Urgency::Low,
            "medium" => Urgency::Medium,
            "high" => Urgency::High,
            "warning" => Urgency::Warning,
            "critical" => Urgency::Critical,
            _ => Urgency::Info,
        }
    }
}

/// Alert severity shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// One monitored mail account on the external provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedInbox {
    pub id: Uuid,
    /// Provider-assigned opaque account id
    pub provider_id: String,
    pub email: String,
    pub stage: Stage,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub stage_updated_at: Option<DateTime<Utc>>,
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub scan_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackedInbox {
    pub fn new(provider_id: String, email: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider_id,
            email,
            stage: Stage::Registered,
            first_name: None,
            last_name: None,
            stage_updated_at: None,
            last_scanned_at: None,
            scan_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Append-only record of one stage promotion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageHistoryEntry {
    pub id: Uuid,
    pub inbox_id: Uuid,
    pub old_stage: Stage,
    pub new_stage: Stage,
    pub trigger_subject: Option<String>,
    pub trigger_date: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

/// One classification row per (inbox, provider message id) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageClassification {
    pub inbox_id: Uuid,
    pub message_id: String,
    pub category: String,
    pub sub_category: String,
    /// Always within [0.0, 1.0]; `manual` rows carry 1.0.
    pub confidence: f32,
    pub source: ClassificationSource,
    pub summary: String,
    pub urgency: Urgency,
    pub action_required: bool,
    pub key_details: Option<Value>,
    pub raw_llm_response: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Operator-facing alert raised on classifications and stage events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub inbox_id: Uuid,
    pub alert_type: String,
    pub severity: Severity,
    pub title: String,
    pub message: Option<String>,
    pub read: bool,
    pub read_by: Option<String>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        inbox_id: Uuid,
        alert_type: impl Into<String>,
        severity: Severity,
        title: impl Into<String>,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            inbox_id,
            alert_type: alert_type.into(),
            severity,
            title: title.into(),
            message,
            read: false,
            read_by: None,
            read_at: None,
            created_at: now,
        }
    }
}

/// Status of one scanner run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Running,
    Completed,
    Failed,
}

/// One row per scanner invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanLog {
    pub id: Uuid,
    pub status: ScanStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_accounts: usize,
    pub scanned: usize,
    pub errors: usize,
    pub transitions: usize,
    pub error_details: Option<Value>,
    /// Progress pointer: email of the inbox the run is currently on
    pub current_account: Option<String>,
}

impl ScanLog {
    pub fn started(now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: ScanStatus::Running,
            started_at: now,
            finished_at: None,
            total_accounts: 0,
            scanned: 0,
            errors: 0,
            transitions: 0,
            error_details: None,
            current_account: None,
        }
    }
}

/// Normalized message header fetched from the mail provider.
///
/// `date` is `None` when the upstream date string failed to parse; such
/// messages sort last during stage detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Provider message path (JSON-LD `@id`) or plain id
    pub id: String,
    pub subject: String,
    /// Display form: `Name <addr>` or bare address
    pub from: String,
    /// Bare sender address
    pub sender: String,
    pub date: Option<DateTime<Utc>>,
}

/// Advisory confidence attached to a stage detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionConfidence {
    High,
    Medium,
    Low,
}

/// Transient event pushed to subscriber queues; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}
