//! Fleet scan orchestrator.
//!
//! A scan run reconciles the provider's account list against the
//! repository, then sweeps every tracked inbox in size-bounded batches:
//! stage detection, promotion writes, alerts, and classification of the
//! most recent messages. Progress is recorded on the scan-log row between
//! batches and the row is finalised with a terminal status.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ScannerConfig;
use crate::error::Result;
use crate::events::EventBus;
use crate::fingerprint::TemplateCache;
use crate::llm::LlmClassifier;
use crate::mail_client::{MailApi, ProviderAccount};
use crate::models::{Alert, ScanLog, ScanStatus, Severity, Stage, TrackedInbox};
use crate::name_extractor::extract_names;
use crate::pipeline::{Pipeline, PipelineInput, PipelineOutcome};
use crate::provisioner::{generate_password, hash_password};
use crate::repository::{with_transient_retry, Repository, ScanLogUpdate};
use crate::stage_detector::{check_bgc_body, detect_stage};

/// Headers handed to the classification pipeline per inbox.
const RECENT_MESSAGE_LIMIT: usize = 20;
/// Time cap on best-effort name extraction for fresh inboxes.
const NAME_EXTRACTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Classifications that raise operator alerts on fresh rows, including
/// dedup-sourced ones.
fn alert_for(category: &str, sub_category: &str) -> Option<(&'static str, Severity)> {
    match (category, sub_category) {
        ("account", "deactivation") => Some(("deactivation", Severity::Critical)),
        ("warning", "contract_violation") => Some(("contract_violation", Severity::Critical)),
        ("warning", "low_rating_warning") => Some(("low_rating", Severity::Warning)),
        _ => None,
    }
}

/// Severity of the alert raised for a stage promotion.
fn stage_alert_severity(stage: Stage) -> Severity {
    match stage {
        Stage::Deactivated => Severity::Critical,
        Stage::BgcConsider => Severity::Warning,
        _ => Severity::Info,
    }
}

fn stage_alert_type(stage: Stage) -> &'static str {
    match stage {
        Stage::Deactivated => "deactivation",
        _ => "stage_change",
    }
}

pub struct Scanner {
    repo: Arc<dyn Repository>,
    mail: Arc<dyn MailApi>,
    events: Arc<EventBus>,
    pipeline: Pipeline,
    batch_size: usize,
    sync_interval: Duration,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Scanner {
    pub fn new(
        repo: Arc<dyn Repository>,
        mail: Arc<dyn MailApi>,
        events: Arc<EventBus>,
        llm: Arc<LlmClassifier>,
        config: &ScannerConfig,
    ) -> Self {
        let pipeline = Pipeline::new(
            repo.clone(),
            llm,
            config.classifier_rules_version,
            config.pipeline_max_concurrent,
        );
        Self {
            repo,
            mail,
            events,
            pipeline,
            batch_size: config.batch_size.max(1),
            sync_interval: Duration::from_secs(config.sync_interval_seconds),
            shutdown: None,
        }
    }

    /// Attach the process shutdown signal. In-flight scans stop between
    /// batches once it fires; the scan log is finalised as failed.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map_or(false, |signal| *signal.borrow())
    }

    /// Insert a fresh scan-log row and return its id.
    pub async fn begin_scan(&self) -> Result<Uuid> {
        let log = ScanLog::started(Utc::now());
        let id = log.id;
        self.repo.insert_scan_log(log).await?;
        Ok(id)
    }

    /// Run a full fleet scan. Never returns an error: any fatal failure is
    /// captured on the scan-log row instead.
    pub async fn run_scan(&self, scan_id: Uuid) {
        info!("scan {scan_id} starting");
        let mut scanned = 0usize;
        let mut transitions = 0usize;
        let mut errors: Vec<Value> = Vec::new();

        let result = self
            .scan_fleet(scan_id, &mut scanned, &mut transitions, &mut errors)
            .await;

        let now = Utc::now();
        let update = match result {
            Ok(()) => {
                info!(
                    "scan {scan_id} completed: {scanned} scanned, {transitions} transitions, {} errors",
                    errors.len()
                );
                ScanLogUpdate {
                    status: Some(ScanStatus::Completed),
                    finished_at: Some(now),
                    scanned: Some(scanned),
                    errors: Some(errors.len()),
                    transitions: Some(transitions),
                    error_details: (!errors.is_empty()).then(|| Value::Array(errors)),
                    ..ScanLogUpdate::default()
                }
            }
            Err(e) => {
                error!("scan {scan_id} failed: {e}");
                errors.push(json!({ "fatal": e.to_string() }));
                ScanLogUpdate {
                    status: Some(ScanStatus::Failed),
                    finished_at: Some(now),
                    scanned: Some(scanned),
                    errors: Some(errors.len()),
                    transitions: Some(transitions),
                    error_details: Some(Value::Array(errors)),
                    ..ScanLogUpdate::default()
                }
            }
        };

        if let Err(e) = self.repo.update_scan_log(scan_id, update).await {
            error!("failed to finalise scan log {scan_id}: {e}");
        }
    }

    async fn scan_fleet(
        &self,
        scan_id: Uuid,
        scanned: &mut usize,
        transitions: &mut usize,
        errors: &mut Vec<Value>,
    ) -> Result<()> {
        // 1. Reconcile provider accounts into the repository
        let provider_accounts = self.reconcile().await?;
        self.repo
            .update_scan_log(
                scan_id,
                ScanLogUpdate {
                    total_accounts: Some(provider_accounts.len()),
                    ..ScanLogUpdate::default()
                },
            )
            .await?;

        let provider_map: HashMap<String, ProviderAccount> = provider_accounts
            .into_iter()
            .map(|account| (account.id.clone(), account))
            .collect();

        // 2. Dispatch per-inbox jobs in bounded batches
        let inboxes = self.repo.list_inboxes().await?;
        let template_cache = Arc::new(Mutex::new(TemplateCache::new()));

        for batch in inboxes.chunks(self.batch_size) {
            if self.shutdown_requested() {
                return Err(crate::error::MonitorError::Scan(
                    "shutdown requested".to_string(),
                ));
            }

            let progress = ScanLogUpdate {
                scanned: Some(*scanned),
                errors: Some(errors.len()),
                transitions: Some(*transitions),
                current_account: batch.first().map(|inbox| inbox.email.clone()),
                ..ScanLogUpdate::default()
            };
            if let Err(e) = with_transient_retry("scan progress update", || {
                self.repo.update_scan_log(scan_id, progress.clone())
            })
            .await
            {
                warn!("scan {scan_id} progress update failed: {e}");
            }

            let jobs = batch
                .iter()
                .map(|inbox| self.scan_inbox(inbox, provider_map.get(&inbox.provider_id), &template_cache));
            let results = futures::future::join_all(jobs).await;

            for (inbox, result) in batch.iter().zip(results) {
                match result {
                    Ok(changed) => {
                        *scanned += 1;
                        if changed {
                            *transitions += 1;
                        }
                    }
                    Err(e) => {
                        warn!("scan of {} failed: {e}", inbox.email);
                        errors.push(json!({ "email": inbox.email, "error": e.to_string() }));
                        if let Err(update_err) = self
                            .repo
                            .update_inbox_scan_state(inbox.id, Utc::now(), Some(e.to_string()))
                            .await
                        {
                            warn!(
                                "failed to record scan error for {}: {update_err}",
                                inbox.email
                            );
                        }
                    }
                }
            }
        }

        let stats = template_cache.lock().unwrap_or_else(|e| e.into_inner()).stats();
        info!(
            "scan {scan_id} template cache: {} entries, {} hits, {} misses",
            stats.entries, stats.hits, stats.misses
        );
        Ok(())
    }

    /// Fetch the provider's account list and insert any inbox the
    /// repository does not know yet, bootstrapping its portal credential
    /// and, best-effort, its holder's name.
    pub async fn reconcile(&self) -> Result<Vec<ProviderAccount>> {
        let accounts = self.mail.list_accounts().await?;
        for account in &accounts {
            let (inbox, created) = self
                .repo
                .upsert_inbox_by_provider_id(&account.id, &account.email, Utc::now())
                .await?;
            if created {
                info!("provisioned new inbox {}", inbox.email);
                self.bootstrap_inbox(account, &inbox).await;
            }
        }
        Ok(accounts)
    }

    /// Portal credential plus name extraction for a freshly created inbox.
    /// Failures here only log; the scan itself is unaffected.
    async fn bootstrap_inbox(&self, account: &ProviderAccount, inbox: &TrackedInbox) {
        let password = generate_password(16);
        match self
            .repo
            .upsert_portal_user(&inbox.email, &hash_password(&password), inbox.id)
            .await
        {
            Ok(true) => {
                if let Err(e) = self.mail.update_password(&account.id, &password).await {
                    warn!("failed to push portal password for {}: {e}", inbox.email);
                }
            }
            Ok(false) => {}
            Err(e) => warn!("failed to create portal user for {}: {e}", inbox.email),
        }

        match tokio::time::timeout(
            NAME_EXTRACTION_TIMEOUT,
            extract_names(self.mail.as_ref(), account),
        )
        .await
        {
            Ok(Ok(Some(name))) => {
                debug!("extracted name for {}: {:?}", inbox.email, name);
                if let Err(e) = self
                    .repo
                    .update_inbox_names(inbox.id, name.first_name, name.last_name)
                    .await
                {
                    warn!("failed to store names for {}: {e}", inbox.email);
                }
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!("name extraction failed for {}: {e}", inbox.email),
            Err(_) => warn!("name extraction timed out for {}", inbox.email),
        }
    }

    /// Scan a single inbox. Returns whether its stage changed.
    async fn scan_inbox(
        &self,
        inbox: &TrackedInbox,
        account: Option<&ProviderAccount>,
        template_cache: &Arc<Mutex<TemplateCache>>,
    ) -> Result<bool> {
        let now = Utc::now();
        let mailbox_ids = account.map(ProviderAccount::scan_mailbox_ids).unwrap_or_default();

        if mailbox_ids.is_empty() {
            self.repo.update_inbox_scan_state(inbox.id, now, None).await?;
            return Ok(false);
        }

        let provider_id = account.map(|a| a.id.as_str()).unwrap_or(&inbox.provider_id);
        let headers = self.mail.list_all_headers(provider_id, &mailbox_ids).await?;

        // Stage detection, then deferred body inspection for BGC-complete
        let detection = detect_stage(&headers);
        let mut new_stage = detection.stage;
        let mut trigger_subject = detection.trigger_subject.clone();
        let mut trigger_date = detection.trigger_date;

        // Bodies fetched here are reused for classification below
        let mut fetched_bodies: HashMap<String, String> = HashMap::new();
        if matches!(new_stage, Stage::BgcClear | Stage::BgcConsider) {
            for message in &detection.needs_body_check {
                if let Some(full) = self.mail.get_message(&message.id).await? {
                    let body = full.body();
                    let body_stage = check_bgc_body(&body);
                    fetched_bodies.insert(message.id.clone(), body);
                    if body_stage.priority() > new_stage.priority() {
                        new_stage = body_stage;
                        trigger_subject = Some(message.subject.clone());
                        trigger_date = message.date;
                    }
                }
            }
        }

        let old_stage = inbox.stage;
        let promotable = new_stage.priority() > old_stage.priority()
            || (old_stage == Stage::Deactivated
                && new_stage == Stage::Active
                && detection.reactivated);

        let mut stage_changed = false;
        if promotable {
            stage_changed = self
                .repo
                .update_stage(
                    inbox.id,
                    new_stage,
                    trigger_subject.clone(),
                    trigger_date,
                    now,
                    detection.reactivated,
                )
                .await?;
        }

        if stage_changed {
            info!(
                "{}: {} -> {} (confidence {:?})",
                inbox.email, old_stage, new_stage, detection.confidence
            );
            let alert = Alert::new(
                inbox.id,
                stage_alert_type(new_stage),
                stage_alert_severity(new_stage),
                format!("{}: {} -> {}", inbox.email, old_stage, new_stage),
                trigger_subject,
                now,
            );
            self.repo.insert_alert(alert.clone()).await?;
            self.events.notify_stage_change(&inbox.email, old_stage, new_stage);
            self.events.notify_alert(&alert);
        }

        self.repo.update_inbox_scan_state(inbox.id, now, None).await?;

        // Classify the most recent headers
        let mut recent = headers;
        recent.sort_by_key(|h| std::cmp::Reverse(h.date.unwrap_or(chrono::DateTime::<Utc>::MIN_UTC)));
        recent.truncate(RECENT_MESSAGE_LIMIT);
        let inputs: Vec<PipelineInput> = recent
            .iter()
            .map(|header| {
                let mut input = PipelineInput::from(header);
                if let Some(body) = fetched_bodies.get(&header.id) {
                    input.body = body.clone();
                }
                input
            })
            .collect();

        let outcomes = self
            .pipeline
            .classify_batch(inbox.id, inputs, template_cache)
            .await;
        self.raise_classification_alerts(inbox, &outcomes).await;

        Ok(stage_changed)
    }

    async fn raise_classification_alerts(
        &self,
        inbox: &TrackedInbox,
        outcomes: &[PipelineOutcome],
    ) {
        for outcome in outcomes.iter().filter(|outcome| outcome.fresh) {
            let row = &outcome.row;
            if let Some((alert_type, severity)) = alert_for(&row.category, &row.sub_category) {
                let alert = Alert::new(
                    inbox.id,
                    alert_type,
                    severity,
                    format!("{}: {}", inbox.email, row.summary),
                    Some(row.message_id.clone()),
                    Utc::now(),
                );
                if let Err(e) = self.repo.insert_alert(alert.clone()).await {
                    warn!("failed to insert alert for {}: {e}", inbox.email);
                    continue;
                }
                self.events.notify_alert(&alert);
            }
        }
    }

    /// Periodic reconciliation loop: sleep, reconcile, repeat. Errors are
    /// logged, never fatal. Ends when the shutdown signal fires.
    pub async fn auto_sync(&self, mut shutdown: watch::Receiver<bool>) {
        info!("auto-sync loop started, interval {:?}", self.sync_interval);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.sync_interval) => {
                    match self.reconcile().await {
                        Ok(accounts) => {
                            debug!("auto-sync reconciled {} provider accounts", accounts.len());
                        }
                        Err(e) => error!("auto-sync error: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("auto-sync loop stopping");
                        break;
                    }
                }
            }
        }
    }
}
