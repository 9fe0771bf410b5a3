//! Persistence contract consumed by the engine, plus an in-memory
//! implementation used by tests and the demo binary.
//!
//! Errors follow a small taxonomy: `NotFound`, `Conflict` (uniqueness),
//! `Transient` (safe to retry once) and permanent `Repository` failures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::{MonitorError, Result};
use crate::models::{
    Alert, MessageClassification, ScanLog, ScanStatus, Severity, Stage, StageHistoryEntry,
    TrackedInbox,
};

/// Filters for alert listing.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub inbox_id: Option<Uuid>,
    pub severity: Option<Severity>,
    pub unread_only: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Target of a mark-read operation.
#[derive(Debug, Clone)]
pub enum AlertReadTarget {
    One(Uuid),
    All,
}

/// Partial update applied to a scan-log row.
#[derive(Debug, Clone, Default)]
pub struct ScanLogUpdate {
    pub status: Option<ScanStatus>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_accounts: Option<usize>,
    pub scanned: Option<usize>,
    pub errors: Option<usize>,
    pub transitions: Option<usize>,
    pub error_details: Option<serde_json::Value>,
    pub current_account: Option<String>,
}

/// Aggregate counts over all classification rows.
#[derive(Debug, Clone, Default)]
pub struct ClassificationStats {
    pub total: usize,
    pub by_category: HashMap<String, usize>,
    pub by_source: HashMap<String, usize>,
    pub by_urgency: HashMap<String, usize>,
}

/// Narrow persistence contract for the state engine.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Insert the inbox if its provider id is unknown; returns the row and
    /// whether it was created.
    async fn upsert_inbox_by_provider_id(
        &self,
        provider_id: &str,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<(TrackedInbox, bool)>;

    async fn list_inboxes(&self) -> Result<Vec<TrackedInbox>>;

    async fn find_inbox_by_email(&self, email: &str) -> Result<Option<TrackedInbox>>;

    /// Record scan bookkeeping: `last_scanned_at` and the latest scan error
    /// (cleared on success).
    async fn update_inbox_scan_state(
        &self,
        inbox_id: Uuid,
        scanned_at: DateTime<Utc>,
        scan_error: Option<String>,
    ) -> Result<()>;

    async fn update_inbox_names(
        &self,
        inbox_id: Uuid,
        first_name: Option<String>,
        last_name: Option<String>,
    ) -> Result<()>;

    /// Atomic promotion: updates the row and appends a stage-history entry
    /// only when the new rank is strictly greater, or the transition is the
    /// DEACTIVATED -> ACTIVE reactivation path. Returns whether a write
    /// happened.
    async fn update_stage(
        &self,
        inbox_id: Uuid,
        new_stage: Stage,
        trigger_subject: Option<String>,
        trigger_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        reactivation: bool,
    ) -> Result<bool>;

    async fn stage_history(&self, inbox_id: Uuid) -> Result<Vec<StageHistoryEntry>>;

    /// Batch read of existing classifications for the given message ids.
    async fn get_classifications_by_ids(
        &self,
        inbox_id: Uuid,
        message_ids: &[String],
    ) -> Result<Vec<MessageClassification>>;

    /// Upsert keyed on (inbox_id, message_id).
    async fn upsert_classification(&self, row: MessageClassification) -> Result<()>;

    async fn list_classifications(&self, inbox_id: Uuid) -> Result<Vec<MessageClassification>>;

    async fn classification_stats(&self) -> Result<ClassificationStats>;

    /// Rows routed to manual review (`source = manual`), newest first.
    async fn review_queue(&self, limit: usize) -> Result<Vec<MessageClassification>>;

    async fn insert_alert(&self, alert: Alert) -> Result<()>;

    async fn list_alerts(&self, filter: AlertFilter) -> Result<Vec<Alert>>;

    async fn mark_alerts_read(
        &self,
        target: AlertReadTarget,
        reader: &str,
        when: DateTime<Utc>,
    ) -> Result<usize>;

    async fn insert_scan_log(&self, log: ScanLog) -> Result<()>;

    async fn get_scan_log(&self, id: Uuid) -> Result<Option<ScanLog>>;

    async fn update_scan_log(&self, id: Uuid, update: ScanLogUpdate) -> Result<()>;

    /// Create the portal user when absent; returns whether it was created.
    async fn upsert_portal_user(
        &self,
        email: &str,
        password_hash: &str,
        inbox_id: Uuid,
    ) -> Result<bool>;
}

/// Run an operation, retrying once when the failure is a transient
/// repository error.
pub async fn with_transient_retry<T, F, Fut>(operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match operation().await {
        Ok(value) => Ok(value),
        Err(e) if matches!(e, MonitorError::Transient(_)) => {
            warn!("{operation_name} hit transient error, retrying once: {e}");
            operation().await
        }
        Err(e) => Err(e),
    }
}

// --- In-memory implementation --------------------------------------------

#[derive(Debug, Clone)]
struct PortalUser {
    #[allow(dead_code)]
    password_hash: String,
    #[allow(dead_code)]
    inbox_id: Uuid,
}

#[derive(Debug, Default)]
struct MemoryState {
    inboxes: HashMap<Uuid, TrackedInbox>,
    history: Vec<StageHistoryEntry>,
    classifications: HashMap<(Uuid, String), MessageClassification>,
    alerts: Vec<Alert>,
    scan_logs: HashMap<Uuid, ScanLog>,
    portal_users: HashMap<String, PortalUser>,
}

/// In-memory repository backing tests and the standalone binary.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn upsert_inbox_by_provider_id(
        &self,
        provider_id: &str,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<(TrackedInbox, bool)> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .inboxes
            .values()
            .find(|inbox| inbox.provider_id == provider_id)
        {
            return Ok((existing.clone(), false));
        }

        let inbox = TrackedInbox::new(provider_id.to_string(), email.to_string(), now);
        state.inboxes.insert(inbox.id, inbox.clone());
        Ok((inbox, true))
    }

    async fn list_inboxes(&self) -> Result<Vec<TrackedInbox>> {
        let state = self.state.lock().await;
        let mut inboxes: Vec<TrackedInbox> = state.inboxes.values().cloned().collect();
        inboxes.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(inboxes)
    }

    async fn find_inbox_by_email(&self, email: &str) -> Result<Option<TrackedInbox>> {
        let state = self.state.lock().await;
        Ok(state
            .inboxes
            .values()
            .find(|inbox| inbox.email == email)
            .cloned())
    }

    async fn update_inbox_scan_state(
        &self,
        inbox_id: Uuid,
        scanned_at: DateTime<Utc>,
        scan_error: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let inbox = state.inboxes.get_mut(&inbox_id).ok_or(MonitorError::NotFound {
            entity: "inbox",
            id: inbox_id.to_string(),
        })?;
        inbox.last_scanned_at = Some(scanned_at);
        inbox.scan_error = scan_error;
        inbox.updated_at = scanned_at;
        Ok(())
    }

    async fn update_inbox_names(
        &self,
        inbox_id: Uuid,
        first_name: Option<String>,
        last_name: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let inbox = state.inboxes.get_mut(&inbox_id).ok_or(MonitorError::NotFound {
            entity: "inbox",
            id: inbox_id.to_string(),
        })?;
        if first_name.is_some() {
            inbox.first_name = first_name;
        }
        if last_name.is_some() {
            inbox.last_name = last_name;
        }
        Ok(())
    }

    async fn update_stage(
        &self,
        inbox_id: Uuid,
        new_stage: Stage,
        trigger_subject: Option<String>,
        trigger_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        reactivation: bool,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let inbox = state.inboxes.get_mut(&inbox_id).ok_or(MonitorError::NotFound {
            entity: "inbox",
            id: inbox_id.to_string(),
        })?;

        let old_stage = inbox.stage;
        let is_reactivation =
            reactivation && old_stage == Stage::Deactivated && new_stage == Stage::Active;
        if new_stage.priority() <= old_stage.priority() && !is_reactivation {
            return Ok(false);
        }

        inbox.stage = new_stage;
        inbox.stage_updated_at = Some(now);
        inbox.updated_at = now;

        state.history.push(StageHistoryEntry {
            id: Uuid::new_v4(),
            inbox_id,
            old_stage,
            new_stage,
            trigger_subject,
            trigger_date,
            recorded_at: now,
        });
        Ok(true)
    }

    async fn stage_history(&self, inbox_id: Uuid) -> Result<Vec<StageHistoryEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .history
            .iter()
            .filter(|entry| entry.inbox_id == inbox_id)
            .cloned()
            .collect())
    }

    async fn get_classifications_by_ids(
        &self,
        inbox_id: Uuid,
        message_ids: &[String],
    ) -> Result<Vec<MessageClassification>> {
        let state = self.state.lock().await;
        Ok(message_ids
            .iter()
            .filter_map(|id| state.classifications.get(&(inbox_id, id.clone())).cloned())
            .collect())
    }

    async fn upsert_classification(&self, row: MessageClassification) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .classifications
            .insert((row.inbox_id, row.message_id.clone()), row);
        Ok(())
    }

    async fn list_classifications(&self, inbox_id: Uuid) -> Result<Vec<MessageClassification>> {
        let state = self.state.lock().await;
        let mut rows: Vec<MessageClassification> = state
            .classifications
            .values()
            .filter(|row| row.inbox_id == inbox_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn classification_stats(&self) -> Result<ClassificationStats> {
        let state = self.state.lock().await;
        let mut stats = ClassificationStats::default();
        for row in state.classifications.values() {
            stats.total += 1;
            *stats.by_category.entry(row.category.clone()).or_default() += 1;
            *stats
                .by_source
                .entry(row.source.as_str().to_string())
                .or_default() += 1;
            *stats
                .by_urgency
                .entry(row.urgency.as_str().to_string())
                .or_default() += 1;
        }
        Ok(stats)
    }

    async fn review_queue(&self, limit: usize) -> Result<Vec<MessageClassification>> {
        let state = self.state.lock().await;
        let mut rows: Vec<MessageClassification> = state
            .classifications
            .values()
            .filter(|row| row.source == crate::models::ClassificationSource::Manual)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn insert_alert(&self, alert: Alert) -> Result<()> {
        let mut state = self.state.lock().await;
        state.alerts.push(alert);
        Ok(())
    }

    async fn list_alerts(&self, filter: AlertFilter) -> Result<Vec<Alert>> {
        let state = self.state.lock().await;
        let mut alerts: Vec<Alert> = state
            .alerts
            .iter()
            .filter(|alert| {
                filter.inbox_id.map_or(true, |id| alert.inbox_id == id)
                    && filter.severity.map_or(true, |s| alert.severity == s)
                    && (!filter.unread_only || !alert.read)
            })
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let alerts: Vec<Alert> = alerts
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(alerts)
    }

    async fn mark_alerts_read(
        &self,
        target: AlertReadTarget,
        reader: &str,
        when: DateTime<Utc>,
    ) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut marked = 0;
        for alert in state.alerts.iter_mut() {
            let applies = match &target {
                AlertReadTarget::One(id) => alert.id == *id,
                AlertReadTarget::All => true,
            };
            if applies && !alert.read {
                alert.read = true;
                alert.read_by = Some(reader.to_string());
                alert.read_at = Some(when);
                marked += 1;
            }
        }
        if marked == 0 {
            if let AlertReadTarget::One(id) = target {
                let exists = state.alerts.iter().any(|alert| alert.id == id);
                if !exists {
                    return Err(MonitorError::NotFound {
                        entity: "alert",
                        id: id.to_string(),
                    });
                }
            }
        }
        Ok(marked)
    }

    async fn insert_scan_log(&self, log: ScanLog) -> Result<()> {
        let mut state = self.state.lock().await;
        state.scan_logs.insert(log.id, log);
        Ok(())
    }

    async fn get_scan_log(&self, id: Uuid) -> Result<Option<ScanLog>> {
        let state = self.state.lock().await;
        Ok(state.scan_logs.get(&id).cloned())
    }

    async fn update_scan_log(&self, id: Uuid, update: ScanLogUpdate) -> Result<()> {
        let mut state = self.state.lock().await;
        let log = state.scan_logs.get_mut(&id).ok_or(MonitorError::NotFound {
            entity: "scan_log",
            id: id.to_string(),
        })?;

        if let Some(status) = update.status {
            log.status = status;
        }
        if let Some(finished_at) = update.finished_at {
            log.finished_at = Some(finished_at);
        }
        if let Some(total) = update.total_accounts {
            log.total_accounts = total;
        }
        if let Some(scanned) = update.scanned {
            log.scanned = scanned;
        }
        if let Some(errors) = update.errors {
            log.errors = errors;
        }
        if let Some(transitions) = update.transitions {
            log.transitions = transitions;
        }
        if let Some(details) = update.error_details {
            log.error_details = Some(details);
        }
        if let Some(current) = update.current_account {
            log.current_account = Some(current);
        }
        Ok(())
    }

    async fn upsert_portal_user(
        &self,
        email: &str,
        password_hash: &str,
        inbox_id: Uuid,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.portal_users.contains_key(email) {
            return Ok(false);
        }
        state.portal_users.insert(
            email.to_string(),
            PortalUser {
                password_hash: password_hash.to_string(),
                inbox_id,
            },
        );
        Ok(true)
    }
}
