//! Classification pipeline: template cache -> rules -> LLM.
//!
//! One call classifies a batch of messages for a single inbox. Existing
//! rows are fetched in one batch read; misses run through a bounded worker
//! pool and results come back in input order regardless of completion
//! order. A failing worker yields an `unknown/error` placeholder instead of
//! aborting the batch.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::classifier::{classify_with_threshold, ClassificationResult};
use crate::error::{MonitorError, Result};
use crate::fingerprint::{make_fingerprint, CachedClassification, TemplateCache};
use crate::llm::{smart_truncate, LlmClassifier};
use crate::models::{ClassificationSource, MessageClassification, MessageHeader, Urgency};
use crate::repository::{with_transient_retry, Repository};

/// Normalised pipeline input.
#[derive(Debug, Clone)]
pub struct PipelineInput {
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    pub body: String,
}

impl From<&MessageHeader> for PipelineInput {
    fn from(header: &MessageHeader) -> Self {
        Self {
            message_id: header.id.clone(),
            subject: header.subject.clone(),
            sender: header.sender.clone(),
            body: String::new(),
        }
    }
}

/// A classification row plus whether it was produced by this call.
/// Pre-existing rows come back with `fresh == false` so callers do not
/// re-raise alerts on every scan.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub row: MessageClassification,
    pub fresh: bool,
}

pub struct Pipeline {
    repo: Arc<dyn Repository>,
    llm: Arc<LlmClassifier>,
    rules_version: Option<DateTime<Utc>>,
    workers: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Pipeline {
    pub fn new(
        repo: Arc<dyn Repository>,
        llm: Arc<LlmClassifier>,
        rules_version: Option<DateTime<Utc>>,
        max_concurrent: usize,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            repo,
            llm,
            rules_version,
            workers: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// A cached `rules` row is stale once the pinned rule bank version
    /// postdates it; AI-sourced and manual rows never go stale.
    fn is_stale(&self, row: &MessageClassification) -> bool {
        row.source == ClassificationSource::Rules
            && self
                .rules_version
                .map_or(false, |version| row.created_at < version)
    }

    /// Classify a batch of messages for one inbox.
    pub async fn classify_batch(
        &self,
        inbox_id: Uuid,
        inputs: Vec<PipelineInput>,
        cache: &Arc<Mutex<TemplateCache>>,
    ) -> Vec<PipelineOutcome> {
        if inputs.is_empty() {
            return Vec::new();
        }

        // One batch read replaces N per-message lookups
        let ids: Vec<String> = inputs.iter().map(|input| input.message_id.clone()).collect();
        let existing = match self.repo.get_classifications_by_ids(inbox_id, &ids).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("batch classification lookup failed for inbox {inbox_id}: {e}");
                Vec::new()
            }
        };

        let mut hits: HashMap<String, MessageClassification> = existing
            .into_iter()
            .filter(|row| !self.is_stale(row))
            .map(|row| (row.message_id.clone(), row))
            .collect();

        stream::iter(inputs.into_iter().map(|input| {
            let hit = hits.remove(&input.message_id);
            async move {
                match hit {
                    Some(row) => PipelineOutcome { row, fresh: false },
                    None => self.classify_one(inbox_id, input, cache).await,
                }
            }
        }))
        .buffered(self.max_concurrent)
        .collect()
        .await
    }

    async fn classify_one(
        &self,
        inbox_id: Uuid,
        input: PipelineInput,
        cache: &Arc<Mutex<TemplateCache>>,
    ) -> PipelineOutcome {
        match self.try_classify_one(inbox_id, &input, cache).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    "classification worker failed for message {}: {e}",
                    input.message_id
                );
                PipelineOutcome {
                    row: error_placeholder(inbox_id, &input),
                    fresh: true,
                }
            }
        }
    }

    async fn try_classify_one(
        &self,
        inbox_id: Uuid,
        input: &PipelineInput,
        cache: &Arc<Mutex<TemplateCache>>,
    ) -> Result<PipelineOutcome> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|e| MonitorError::Scan(format!("worker pool closed: {e}")))?;

        let fingerprint = make_fingerprint(&input.subject, &input.sender);

        // Template cache short-circuits both the rules and the LLM
        let cached = {
            let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.get(&fingerprint)
        };
        if let Some(cached) = cached {
            debug!(
                "template cache hit for message {} ({fingerprint})",
                input.message_id
            );
            let row = row_from_cached(inbox_id, &input.message_id, cached);
            self.persist(&row).await?;
            return Ok(PipelineOutcome { row, fresh: true });
        }

        let truncated_body = smart_truncate(&input.body);
        let (rule_result, needs_ai) =
            classify_with_threshold(&input.subject, &input.sender, &truncated_body);

        if let (Some(result), false) = (&rule_result, needs_ai) {
            let row = row_from_rules(inbox_id, &input.message_id, result);
            {
                let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
                cache.put(
                    fingerprint,
                    CachedClassification {
                        category: result.category.clone(),
                        sub_category: result.sub_category.clone(),
                        confidence: result.confidence,
                        source: ClassificationSource::Rules,
                        summary: result.summary.clone(),
                        urgency: result.urgency,
                        action_required: result.action_required,
                    },
                );
            }
            self.persist(&row).await?;
            return Ok(PipelineOutcome { row, fresh: true });
        }

        // LLM fallback; exhaustion routes the message to manual review
        match self
            .llm
            .classify(&input.subject, &input.sender, &input.body)
            .await
        {
            Ok(Some(llm_result)) => {
                let row = MessageClassification {
                    inbox_id,
                    message_id: input.message_id.clone(),
                    category: llm_result.category.clone(),
                    sub_category: llm_result.sub_category.clone(),
                    confidence: llm_result.confidence,
                    source: ClassificationSource::Ai,
                    summary: llm_result.summary.clone(),
                    urgency: llm_result.urgency,
                    action_required: llm_result.action_required,
                    key_details: llm_result.key_details.clone(),
                    raw_llm_response: Some(llm_result.raw.clone()),
                    created_at: Utc::now(),
                };
                {
                    let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
                    cache.put(
                        fingerprint,
                        CachedClassification {
                            category: llm_result.category,
                            sub_category: llm_result.sub_category,
                            confidence: llm_result.confidence,
                            source: ClassificationSource::Ai,
                            summary: llm_result.summary,
                            urgency: llm_result.urgency,
                            action_required: llm_result.action_required,
                        },
                    );
                }
                self.persist(&row).await?;
                Ok(PipelineOutcome { row, fresh: true })
            }
            Ok(None) => {
                let row = manual_placeholder(inbox_id, input);
                self.persist(&row).await?;
                Ok(PipelineOutcome { row, fresh: true })
            }
            Err(e) => {
                warn!("LLM tier errored for message {}: {e}", input.message_id);
                let row = manual_placeholder(inbox_id, input);
                self.persist(&row).await?;
                Ok(PipelineOutcome { row, fresh: true })
            }
        }
    }

    /// Upsert with a single transient retry; a conflict is an idempotent
    /// re-arrival and is ignored.
    async fn persist(&self, row: &MessageClassification) -> Result<()> {
        let result = with_transient_retry("classification upsert", || {
            self.repo.upsert_classification(row.clone())
        })
        .await;
        match result {
            Err(MonitorError::Conflict(_)) => {
                debug!(
                    "classification for message {} already present, ignoring",
                    row.message_id
                );
                Ok(())
            }
            other => other,
        }
    }
}

fn row_from_rules(
    inbox_id: Uuid,
    message_id: &str,
    result: &ClassificationResult,
) -> MessageClassification {
    MessageClassification {
        inbox_id,
        message_id: message_id.to_string(),
        category: result.category.clone(),
        sub_category: result.sub_category.clone(),
        confidence: result.confidence,
        source: ClassificationSource::Rules,
        summary: result.summary.clone(),
        urgency: result.urgency,
        action_required: result.action_required,
        key_details: None,
        raw_llm_response: None,
        created_at: Utc::now(),
    }
}

fn row_from_cached(
    inbox_id: Uuid,
    message_id: &str,
    cached: CachedClassification,
) -> MessageClassification {
    MessageClassification {
        inbox_id,
        message_id: message_id.to_string(),
        category: cached.category,
        sub_category: cached.sub_category,
        confidence: cached.confidence,
        source: cached.source.dedup(),
        summary: cached.summary,
        urgency: cached.urgency,
        action_required: cached.action_required,
        key_details: None,
        raw_llm_response: None,
        created_at: Utc::now(),
    }
}

fn manual_placeholder(inbox_id: Uuid, input: &PipelineInput) -> MessageClassification {
    let subject_excerpt: String = input.subject.chars().take(100).collect();
    MessageClassification {
        inbox_id,
        message_id: input.message_id.clone(),
        category: "unknown".to_string(),
        sub_category: "unclassified".to_string(),
        confidence: 1.0,
        source: ClassificationSource::Manual,
        summary: format!("Could not classify: {subject_excerpt}"),
        urgency: Urgency::Low,
        action_required: false,
        key_details: None,
        raw_llm_response: None,
        created_at: Utc::now(),
    }
}

fn error_placeholder(inbox_id: Uuid, input: &PipelineInput) -> MessageClassification {
    MessageClassification {
        inbox_id,
        message_id: input.message_id.clone(),
        category: "unknown".to_string(),
        sub_category: "error".to_string(),
        confidence: 0.0,
        source: ClassificationSource::Error,
        summary: "Classification worker failed".to_string(),
        urgency: Urgency::Low,
        action_required: false,
        key_details: None,
        raw_llm_response: None,
        created_at: Utc::now(),
    }
}
