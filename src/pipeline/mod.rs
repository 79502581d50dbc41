//! Email processing pipeline.
//!
//! All inbound mail flows through:
//! 1. `Mailbox::fetch_*` — POP3 I/O with UID-level filtering
//! 2. MIME parse → `ParsedMessage`
//! 3. Message-ID dedup against the audit store
//! 4. `Classifier` — full classification or digest summary
//! 5. `DocumentSink` — Notion page creation
//!
//! **Every touched message leaves exactly one audit row per run**, and a
//! failure on one message never aborts the rest of the batch. Only the
//! initial fetch is allowed to fail the whole run.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::analysis::Classifier;
use crate::error::{DatabaseError, PipelineError};
use crate::mailbox::parser::{self, ParsedMessage};
use crate::mailbox::{Mailbox, RawMessage};
use crate::notion::DocumentSink;
use crate::settings::SettingsStore;
use crate::store::{CategoryStore, NewRecord, RecordStatus, RecordStore, RecordUpdate};

/// Counters for a classification run over unseen mail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    /// Messages classified and recorded (delivered when a requirement).
    pub processed: usize,
    /// Messages that failed and were recorded as errors.
    pub errors: usize,
}

/// Counters for a date-window digest run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowOutcome {
    /// Messages fetched from the server.
    pub total: usize,
    /// Messages that survived parsing.
    pub filtered: usize,
    /// Digest pages written.
    pub written: usize,
    /// Messages that failed after parsing.
    pub errors: usize,
}

/// What a reprocess run produced; the HTTP layer words the user-facing
/// message from this.
#[derive(Debug, Clone)]
pub struct ReprocessOutcome {
    pub is_requirement: bool,
    pub title: String,
    pub category: String,
    pub page_url: Option<String>,
}

/// Fate of one message inside a batch.
enum ItemOutcome {
    Processed,
    Skipped,
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

/// Pipeline orchestrator. Holds trait objects at the three I/O seams so
/// tests can script mail, analysis, and delivery independently.
pub struct Pipeline {
    mailbox: Arc<dyn Mailbox>,
    classifier: Arc<dyn Classifier>,
    sink: Arc<dyn DocumentSink>,
    records: RecordStore,
    categories: CategoryStore,
    settings: SettingsStore,
}

impl Pipeline {
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        classifier: Arc<dyn Classifier>,
        sink: Arc<dyn DocumentSink>,
        records: RecordStore,
        categories: CategoryStore,
        settings: SettingsStore,
    ) -> Self {
        Self {
            mailbox,
            classifier,
            sink,
            records,
            categories,
            settings,
        }
    }

    /// Classify all unseen mail and deliver requirements to Notion.
    ///
    /// The category vocabulary and provider name are loaded once per
    /// batch. Per-message failures are recorded and counted; only the
    /// fetch itself can fail the run.
    pub async fn process_all(&self) -> Result<BatchOutcome, PipelineError> {
        let raw = self.mailbox.fetch_unseen().await?;
        if raw.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let total = raw.len();
        let categories = self.categories.names().await?;
        let provider = self.settings.ai().await?.provider;
        info!(count = total, "Processing new messages");

        let mut outcome = BatchOutcome::default();
        for msg in raw {
            let started = Instant::now();
            match self.process_one(&msg, &categories, &provider, started).await {
                Ok(ItemOutcome::Processed) => outcome.processed += 1,
                Ok(ItemOutcome::Skipped) => {}
                Err(e) => {
                    error!(uid = %msg.uid, error = %e, "Failed to process message");
                    self.records
                        .create(NewRecord {
                            error_message: Some(e.to_string()),
                            provider: Some(provider.clone()),
                            processing_ms: Some(elapsed_ms(started)),
                            ..NewRecord::new(
                                msg.uid.clone(),
                                msg.message_id.clone(),
                                RecordStatus::Error,
                            )
                        })
                        .await?;
                    outcome.errors += 1;
                }
            }
        }

        info!(
            processed = outcome.processed,
            errors = outcome.errors,
            total,
            "Batch processing complete"
        );
        Ok(outcome)
    }

    async fn process_one(
        &self,
        raw: &RawMessage,
        categories: &[String],
        provider: &str,
        started: Instant,
    ) -> Result<ItemOutcome, PipelineError> {
        let parsed = parser::parse(raw)?;

        if self
            .records
            .find_by_message_id(&parsed.message_id)
            .await?
            .is_some()
        {
            info!(message_id = %parsed.message_id, "Duplicate message, skipping");
            self.records
                .create(NewRecord {
                    from_address: parsed.from.clone(),
                    subject: parsed.subject.clone(),
                    provider: Some(provider.to_string()),
                    processing_ms: Some(elapsed_ms(started)),
                    ..NewRecord::new(
                        raw.uid.clone(),
                        parsed.message_id.clone(),
                        RecordStatus::Skipped,
                    )
                })
                .await?;
            return Ok(ItemOutcome::Skipped);
        }

        let analysis = self.classifier.classify(&parsed, categories).await?;
        let result = &analysis.result;

        let page = if result.is_requirement {
            Some(self.sink.create_page(&parsed, result).await?)
        } else {
            debug!(
                message_id = %parsed.message_id,
                category = %result.category,
                "Not a requirement, nothing to deliver"
            );
            None
        };

        let raw_classification = serde_json::to_string(result)
            .map_err(|e| PipelineError::Database(DatabaseError::Serialization(e.to_string())))?;

        self.records
            .create(NewRecord {
                from_address: parsed.from.clone(),
                subject: parsed.subject.clone(),
                category: Some(result.category.clone()),
                priority: Some(result.priority.as_str().to_string()),
                page_id: page.as_ref().map(|p| p.id.clone()),
                page_url: page.as_ref().map(|p| p.url.clone()),
                provider: Some(analysis.provider.clone()),
                processing_ms: Some(elapsed_ms(started)),
                raw_classification: Some(raw_classification),
                ..NewRecord::new(
                    raw.uid.clone(),
                    parsed.message_id.clone(),
                    RecordStatus::Success,
                )
            })
            .await?;

        Ok(ItemOutcome::Processed)
    }

    /// Summarize mail dated at or after `since` into digest pages.
    ///
    /// Unparseable messages are dropped up front without audit rows.
    /// Already-processed messages are skipped silently. When Notion is
    /// not configured, nothing is written and every parsed message counts
    /// as an error.
    pub async fn process_since(&self, since: DateTime<Utc>) -> Result<WindowOutcome, PipelineError> {
        let raw = self.mailbox.fetch_since(since).await?;
        let total = raw.len();
        if raw.is_empty() {
            return Ok(WindowOutcome::default());
        }

        let mut parsed = Vec::with_capacity(raw.len());
        for msg in &raw {
            match parser::parse(msg) {
                Ok(p) => parsed.push(p),
                Err(e) => error!(uid = %msg.uid, error = %e, "Dropping unparseable message"),
            }
        }
        let filtered = parsed.len();
        if parsed.is_empty() {
            return Ok(WindowOutcome {
                total,
                ..Default::default()
            });
        }

        let notion = self.settings.notion().await?;
        if !notion.is_configured() {
            error!("Notion is not configured; cannot deliver digest pages");
            return Ok(WindowOutcome {
                total,
                filtered,
                written: 0,
                errors: filtered,
            });
        }

        let categories = self.categories.names().await?;
        let provider = self.settings.ai().await?.provider;

        let mut written = 0;
        let mut errors = 0;
        for msg in &parsed {
            let started = Instant::now();
            match self.digest_one(msg, &categories, started).await {
                Ok(ItemOutcome::Processed) => written += 1,
                Ok(ItemOutcome::Skipped) => {}
                Err(e) => {
                    error!(uid = %msg.uid, error = %e, "Failed to deliver digest");
                    self.records
                        .create(NewRecord {
                            from_address: msg.from.clone(),
                            subject: msg.subject.clone(),
                            error_message: Some(e.to_string()),
                            provider: Some(provider.clone()),
                            processing_ms: Some(elapsed_ms(started)),
                            ..NewRecord::new(
                                msg.uid.clone(),
                                msg.message_id.clone(),
                                RecordStatus::Error,
                            )
                        })
                        .await?;
                    errors += 1;
                }
            }
        }

        info!(total, filtered, written, errors, "Digest run complete");
        Ok(WindowOutcome {
            total,
            filtered,
            written,
            errors,
        })
    }

    async fn digest_one(
        &self,
        msg: &ParsedMessage,
        categories: &[String],
        started: Instant,
    ) -> Result<ItemOutcome, PipelineError> {
        if self
            .records
            .find_by_message_id(&msg.message_id)
            .await?
            .is_some()
        {
            debug!(message_id = %msg.message_id, "Already processed, skipping");
            return Ok(ItemOutcome::Skipped);
        }

        let digest = self.classifier.summarize(msg, categories).await?;
        let page = self.sink.create_digest_page(msg, &digest).await?;

        self.records
            .create(NewRecord {
                from_address: msg.from.clone(),
                subject: msg.subject.clone(),
                category: Some(digest.category.clone()),
                page_id: Some(page.id),
                page_url: Some(page.url),
                provider: Some(digest.provider.clone()),
                processing_ms: Some(elapsed_ms(started)),
                ..NewRecord::new(
                    msg.uid.clone(),
                    msg.message_id.clone(),
                    RecordStatus::Success,
                )
            })
            .await?;

        Ok(ItemOutcome::Processed)
    }

    /// Re-run a failed record end to end and rewrite it in place.
    ///
    /// Validation order: record exists → record is in `error` status →
    /// the message is still on the server. Each failure surfaces as its
    /// own error without touching the record.
    pub async fn reprocess(&self, id: i64) -> Result<ReprocessOutcome, PipelineError> {
        let record = self
            .records
            .find_by_id(id)
            .await?
            .ok_or(PipelineError::RecordNotFound { id })?;

        if record.status != RecordStatus::Error {
            return Err(PipelineError::NotRetryable {
                id,
                status: record.status.as_str().to_string(),
            });
        }

        let started = Instant::now();
        let raw = self
            .mailbox
            .fetch_by_uid(&record.mail_uid)
            .await?
            .ok_or_else(|| PipelineError::MessageGone {
                uid: record.mail_uid.clone(),
            })?;

        let parsed = parser::parse(&raw)?;
        let categories = self.categories.names().await?;
        let analysis = self.classifier.classify(&parsed, &categories).await?;
        let result = analysis.result;

        let page = if result.is_requirement {
            Some(self.sink.create_page(&parsed, &result).await?)
        } else {
            None
        };

        let raw_classification = serde_json::to_string(&result)
            .map_err(|e| PipelineError::Database(DatabaseError::Serialization(e.to_string())))?;

        self.records
            .update_status(
                id,
                RecordUpdate {
                    status: RecordStatus::Success,
                    from_address: parsed.from.clone(),
                    subject: parsed.subject.clone(),
                    category: Some(result.category.clone()),
                    priority: Some(result.priority.as_str().to_string()),
                    page_id: page.as_ref().map(|p| p.id.clone()),
                    page_url: page.as_ref().map(|p| p.url.clone()),
                    error_message: None,
                    provider: Some(analysis.provider),
                    processing_ms: Some(elapsed_ms(started)),
                    raw_classification: Some(raw_classification),
                },
            )
            .await?;

        info!(id, is_requirement = result.is_requirement, "Record reprocessed");

        Ok(ReprocessOutcome {
            is_requirement: result.is_requirement,
            title: result.title.clone(),
            category: result.category,
            page_url: page.map(|p| p.url),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::analysis::{Analysis, ClassificationResult, Digest, Effort, Priority};
    use crate::error::{AnalysisError, DeliveryError, MailError};
    use crate::notion::PageRef;
    use crate::settings::NotionSettings;
    use crate::store::Db;

    use super::*;

    fn raw(uid: &str, mid: &str, subject: &str) -> RawMessage {
        RawMessage {
            uid: uid.to_string(),
            message_id: mid.to_string(),
            payload: format!(
                "From: Dana <dana@example.com>\r\nTo: intake@test\r\n\
                 Subject: {subject}\r\nMessage-ID: <{mid}>\r\n\
                 Date: Tue, 10 Jun 2025 09:30:00 +0000\r\n\r\n\
                 Please add the thing.\r\n"
            ),
        }
    }

    fn unparseable(uid: &str) -> RawMessage {
        RawMessage {
            uid: uid.to_string(),
            message_id: format!("uid-{uid}"),
            payload: String::new(),
        }
    }

    #[derive(Default)]
    struct FakeMailbox {
        messages: Vec<RawMessage>,
        by_uid: HashMap<String, RawMessage>,
        fail_fetch: bool,
    }

    impl FakeMailbox {
        fn with_messages(messages: Vec<RawMessage>) -> Self {
            Self {
                messages,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Mailbox for FakeMailbox {
        async fn fetch_unseen(&self) -> Result<Vec<RawMessage>, MailError> {
            if self.fail_fetch {
                return Err(MailError::Disconnected);
            }
            Ok(self.messages.clone())
        }

        async fn fetch_since(&self, _since: DateTime<Utc>) -> Result<Vec<RawMessage>, MailError> {
            self.fetch_unseen().await
        }

        async fn fetch_by_uid(&self, uid: &str) -> Result<Option<RawMessage>, MailError> {
            Ok(self.by_uid.get(uid).cloned())
        }
    }

    /// Classifier scripted by subject line.
    #[derive(Default)]
    struct ScriptedClassifier {
        not_requirements: HashSet<String>,
        failures: HashSet<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Classifier for ScriptedClassifier {
        async fn classify(
            &self,
            msg: &ParsedMessage,
            _categories: &[String],
        ) -> Result<Analysis, AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.contains(&msg.subject) {
                return Err(AnalysisError::Exhausted {
                    attempts: 2,
                    last_error: "model unavailable".into(),
                });
            }
            Ok(Analysis {
                result: ClassificationResult {
                    is_requirement: !self.not_requirements.contains(&msg.subject),
                    category: "Feature Request".into(),
                    priority: Priority::Normal,
                    title: format!("Filed: {}", msg.subject),
                    summary: "A summary".into(),
                    key_requirements: vec![],
                    estimated_effort: Effort::Undetermined,
                    tags: vec![],
                    language: "en".into(),
                    reasoning: "scripted".into(),
                },
                provider: "claude".into(),
            })
        }

        async fn summarize(
            &self,
            msg: &ParsedMessage,
            _categories: &[String],
        ) -> Result<Digest, AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Digest {
                summary: format!("Digest of {}", msg.subject),
                category: "Inquiry".into(),
                provider: "ollama".into(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        pages: Mutex<Vec<String>>,
        digests: Mutex<Vec<String>>,
        fail_subjects: HashSet<String>,
    }

    #[async_trait]
    impl DocumentSink for RecordingSink {
        async fn create_page(
            &self,
            msg: &ParsedMessage,
            analysis: &ClassificationResult,
        ) -> Result<PageRef, DeliveryError> {
            if self.fail_subjects.contains(&msg.subject) {
                return Err(DeliveryError::Api {
                    status: 500,
                    message: "server error".into(),
                });
            }
            self.pages.lock().unwrap().push(analysis.title.clone());
            Ok(PageRef {
                id: format!("page-{}", msg.uid),
                url: format!("https://notion.so/page{}", msg.uid),
            })
        }

        async fn create_digest_page(
            &self,
            msg: &ParsedMessage,
            _digest: &Digest,
        ) -> Result<PageRef, DeliveryError> {
            if self.fail_subjects.contains(&msg.subject) {
                return Err(DeliveryError::Api {
                    status: 500,
                    message: "server error".into(),
                });
            }
            self.digests.lock().unwrap().push(msg.subject.clone());
            Ok(PageRef {
                id: format!("digest-{}", msg.uid),
                url: format!("https://notion.so/d{}", msg.uid),
            })
        }
    }

    struct Harness {
        pipeline: Pipeline,
        records: RecordStore,
        settings: SettingsStore,
        classifier: Arc<ScriptedClassifier>,
        sink: Arc<RecordingSink>,
    }

    async fn harness(
        mailbox: FakeMailbox,
        classifier: ScriptedClassifier,
        sink: RecordingSink,
    ) -> Harness {
        let db = Db::open_memory().await.unwrap();
        let records = RecordStore::new(db.clone());
        let categories = CategoryStore::new(db.clone());
        categories.seed_defaults().await.unwrap();
        let settings = SettingsStore::new(db);
        settings.seed_defaults().await.unwrap();
        settings
            .set_notion(&NotionSettings {
                api_key: "secret".into(),
                database_id: "db-1".into(),
            })
            .await
            .unwrap();

        let classifier = Arc::new(classifier);
        let sink = Arc::new(sink);
        let pipeline = Pipeline::new(
            Arc::new(mailbox),
            classifier.clone(),
            sink.clone(),
            records.clone(),
            categories,
            settings.clone(),
        );
        Harness {
            pipeline,
            records,
            settings,
            classifier,
            sink,
        }
    }

    // ── Classification runs ─────────────────────────────────────────

    #[tokio::test]
    async fn process_all_delivers_and_records_success() {
        let mailbox = FakeMailbox::with_messages(vec![raw("1", "a@x", "Add CSV export")]);
        let h = harness(mailbox, ScriptedClassifier::default(), RecordingSink::default()).await;

        let outcome = h.pipeline.process_all().await.unwrap();
        assert_eq!(outcome, BatchOutcome { processed: 1, errors: 0 });

        let rec = h.records.find_by_message_id("a@x").await.unwrap().unwrap();
        assert_eq!(rec.status, RecordStatus::Success);
        assert_eq!(rec.from_address, "Dana <dana@example.com>");
        assert_eq!(rec.category.as_deref(), Some("Feature Request"));
        assert_eq!(rec.priority.as_deref(), Some("normal"));
        assert_eq!(rec.page_id.as_deref(), Some("page-1"));
        assert_eq!(rec.provider.as_deref(), Some("claude"));
        assert!(rec.raw_classification.as_deref().unwrap().contains("isRequirement"));
        assert!(rec.processing_ms.is_some());

        assert_eq!(*h.sink.pages.lock().unwrap(), vec!["Filed: Add CSV export"]);
    }

    #[tokio::test]
    async fn process_all_rerun_skips_without_redelivery() {
        let mailbox = FakeMailbox::with_messages(vec![raw("1", "a@x", "Add CSV export")]);
        let h = harness(mailbox, ScriptedClassifier::default(), RecordingSink::default()).await;

        let first = h.pipeline.process_all().await.unwrap();
        assert_eq!(first, BatchOutcome { processed: 1, errors: 0 });

        // Same message still on the server — must not reach the sink again.
        let second = h.pipeline.process_all().await.unwrap();
        assert_eq!(second, BatchOutcome { processed: 0, errors: 0 });
        assert_eq!(h.sink.pages.lock().unwrap().len(), 1);

        let page = h.records.find_all(&Default::default()).await.unwrap();
        assert_eq!(page.total, 2);
        let statuses: Vec<_> = page.records.iter().map(|r| r.status).collect();
        assert!(statuses.contains(&RecordStatus::Success));
        assert!(statuses.contains(&RecordStatus::Skipped));
    }

    #[tokio::test]
    async fn process_all_same_message_id_under_new_uid_is_skipped() {
        let mailbox = FakeMailbox::with_messages(vec![
            raw("1", "a@x", "Add CSV export"),
            raw("2", "a@x", "Add CSV export"),
        ]);
        let h = harness(mailbox, ScriptedClassifier::default(), RecordingSink::default()).await;

        let outcome = h.pipeline.process_all().await.unwrap();
        assert_eq!(outcome, BatchOutcome { processed: 1, errors: 0 });
        assert_eq!(h.sink.pages.lock().unwrap().len(), 1);

        let skipped = h.records.find_by_uid("2").await.unwrap().unwrap();
        assert_eq!(skipped.status, RecordStatus::Skipped);
        assert_eq!(skipped.from_address, "Dana <dana@example.com>");
        assert!(skipped.provider.is_some());
    }

    #[tokio::test]
    async fn process_all_isolates_delivery_failures() {
        let mailbox = FakeMailbox::with_messages(vec![
            raw("1", "a@x", "First"),
            raw("2", "b@x", "Broken"),
            raw("3", "c@x", "Third"),
        ]);
        let sink = RecordingSink {
            fail_subjects: HashSet::from(["Broken".to_string()]),
            ..Default::default()
        };
        let h = harness(mailbox, ScriptedClassifier::default(), sink).await;

        let outcome = h.pipeline.process_all().await.unwrap();
        assert_eq!(outcome, BatchOutcome { processed: 2, errors: 1 });

        let err = h.records.find_by_message_id("b@x").await.unwrap().unwrap();
        assert_eq!(err.status, RecordStatus::Error);
        assert!(err.error_message.as_deref().unwrap().contains("500"));
        // The catch block has no parsed message in scope.
        assert_eq!(err.from_address, "");
        assert_eq!(*h.sink.pages.lock().unwrap(), vec!["Filed: First", "Filed: Third"]);
    }

    #[tokio::test]
    async fn process_all_records_classifier_failure() {
        let mailbox = FakeMailbox::with_messages(vec![raw("1", "a@x", "Opaque")]);
        let classifier = ScriptedClassifier {
            failures: HashSet::from(["Opaque".to_string()]),
            ..Default::default()
        };
        let h = harness(mailbox, classifier, RecordingSink::default()).await;

        let outcome = h.pipeline.process_all().await.unwrap();
        assert_eq!(outcome, BatchOutcome { processed: 0, errors: 1 });
        assert!(h.sink.pages.lock().unwrap().is_empty());

        let err = h.records.find_by_uid("1").await.unwrap().unwrap();
        assert!(err.error_message.as_deref().unwrap().contains("model unavailable"));
    }

    #[tokio::test]
    async fn process_all_non_requirement_is_recorded_but_not_delivered() {
        let mailbox = FakeMailbox::with_messages(vec![raw("1", "a@x", "Just FYI")]);
        let classifier = ScriptedClassifier {
            not_requirements: HashSet::from(["Just FYI".to_string()]),
            ..Default::default()
        };
        let h = harness(mailbox, classifier, RecordingSink::default()).await;

        let outcome = h.pipeline.process_all().await.unwrap();
        assert_eq!(outcome, BatchOutcome { processed: 1, errors: 0 });
        assert!(h.sink.pages.lock().unwrap().is_empty());

        let rec = h.records.find_by_uid("1").await.unwrap().unwrap();
        assert_eq!(rec.status, RecordStatus::Success);
        assert_eq!(rec.category.as_deref(), Some("Feature Request"));
        assert!(rec.page_id.is_none());
        assert!(rec.page_url.is_none());
    }

    #[tokio::test]
    async fn process_all_unparseable_message_is_an_error_row() {
        let mailbox = FakeMailbox::with_messages(vec![unparseable("9")]);
        let h = harness(mailbox, ScriptedClassifier::default(), RecordingSink::default()).await;

        let outcome = h.pipeline.process_all().await.unwrap();
        assert_eq!(outcome, BatchOutcome { processed: 0, errors: 1 });

        let err = h.records.find_by_uid("9").await.unwrap().unwrap();
        assert_eq!(err.status, RecordStatus::Error);
        assert_eq!(err.message_id, "uid-9");
    }

    #[tokio::test]
    async fn process_all_fetch_failure_aborts_the_run() {
        let mailbox = FakeMailbox {
            fail_fetch: true,
            ..Default::default()
        };
        let h = harness(mailbox, ScriptedClassifier::default(), RecordingSink::default()).await;

        let err = h.pipeline.process_all().await.unwrap_err();
        assert!(matches!(err, PipelineError::Mail(_)));
        assert_eq!(h.records.find_all(&Default::default()).await.unwrap().total, 0);
    }

    // ── Digest runs ─────────────────────────────────────────────────

    #[tokio::test]
    async fn process_since_writes_digests_and_skips_processed_silently() {
        let mailbox = FakeMailbox::with_messages(vec![
            raw("1", "a@x", "Old question"),
            raw("2", "b@x", "New question"),
        ]);
        let h = harness(mailbox, ScriptedClassifier::default(), RecordingSink::default()).await;
        h.records
            .create(NewRecord::new("1", "a@x", RecordStatus::Success))
            .await
            .unwrap();

        let outcome = h.pipeline.process_since(Utc::now()).await.unwrap();
        assert_eq!(
            outcome,
            WindowOutcome { total: 2, filtered: 2, written: 1, errors: 0 }
        );

        // The duplicate leaves no extra row.
        assert_eq!(h.records.find_all(&Default::default()).await.unwrap().total, 2);
        assert_eq!(*h.sink.digests.lock().unwrap(), vec!["New question"]);

        let rec = h.records.find_by_message_id("b@x").await.unwrap().unwrap();
        assert_eq!(rec.category.as_deref(), Some("Inquiry"));
        assert_eq!(rec.provider.as_deref(), Some("ollama"));
        assert!(rec.priority.is_none());
        assert!(rec.raw_classification.is_none());
    }

    #[tokio::test]
    async fn process_since_without_notion_counts_parsed_as_errors() {
        let mailbox = FakeMailbox::with_messages(vec![
            raw("1", "a@x", "One"),
            raw("2", "b@x", "Two"),
        ]);
        let h = harness(mailbox, ScriptedClassifier::default(), RecordingSink::default()).await;
        h.settings
            .set_notion(&NotionSettings::default())
            .await
            .unwrap();

        let outcome = h.pipeline.process_since(Utc::now()).await.unwrap();
        assert_eq!(
            outcome,
            WindowOutcome { total: 2, filtered: 2, written: 0, errors: 2 }
        );
        // Counters only — no rows, no classifier calls, no pages.
        assert_eq!(h.records.find_all(&Default::default()).await.unwrap().total, 0);
        assert_eq!(h.classifier.calls.load(Ordering::SeqCst), 0);
        assert!(h.sink.digests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn process_since_drops_unparseable_without_rows() {
        let mailbox =
            FakeMailbox::with_messages(vec![raw("1", "a@x", "Fine"), unparseable("2")]);
        let h = harness(mailbox, ScriptedClassifier::default(), RecordingSink::default()).await;

        let outcome = h.pipeline.process_since(Utc::now()).await.unwrap();
        assert_eq!(
            outcome,
            WindowOutcome { total: 2, filtered: 1, written: 1, errors: 0 }
        );
        assert_eq!(h.records.find_all(&Default::default()).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn process_since_records_delivery_failure_with_sender() {
        let mailbox = FakeMailbox::with_messages(vec![raw("1", "a@x", "Broken")]);
        let sink = RecordingSink {
            fail_subjects: HashSet::from(["Broken".to_string()]),
            ..Default::default()
        };
        let h = harness(mailbox, ScriptedClassifier::default(), sink).await;

        let outcome = h.pipeline.process_since(Utc::now()).await.unwrap();
        assert_eq!(
            outcome,
            WindowOutcome { total: 1, filtered: 1, written: 0, errors: 1 }
        );

        // Unlike the classification path, the message is parsed here, so
        // the error row carries sender and subject.
        let err = h.records.find_by_uid("1").await.unwrap().unwrap();
        assert_eq!(err.status, RecordStatus::Error);
        assert_eq!(err.from_address, "Dana <dana@example.com>");
        assert_eq!(err.subject, "Broken");
    }

    #[tokio::test]
    async fn process_since_empty_window_short_circuits() {
        let mailbox = FakeMailbox::default();
        let h = harness(mailbox, ScriptedClassifier::default(), RecordingSink::default()).await;

        let outcome = h.pipeline.process_since(Utc::now()).await.unwrap();
        assert_eq!(outcome, WindowOutcome::default());
    }

    // ── Reprocessing ────────────────────────────────────────────────

    #[tokio::test]
    async fn reprocess_unknown_record_is_not_found() {
        let h = harness(
            FakeMailbox::default(),
            ScriptedClassifier::default(),
            RecordingSink::default(),
        )
        .await;

        let err = h.pipeline.reprocess(404).await.unwrap_err();
        assert!(matches!(err, PipelineError::RecordNotFound { id: 404 }));
    }

    #[tokio::test]
    async fn reprocess_rejects_non_error_records_untouched() {
        let h = harness(
            FakeMailbox::default(),
            ScriptedClassifier::default(),
            RecordingSink::default(),
        )
        .await;
        let rec = h
            .records
            .create(NewRecord::new("1", "a@x", RecordStatus::Success))
            .await
            .unwrap();

        let err = h.pipeline.reprocess(rec.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotRetryable { .. }));
        assert_eq!(err.to_string(), format!(
            "Record {} has status success; only error records can be reprocessed",
            rec.id
        ));

        // Nothing ran, nothing changed.
        assert_eq!(h.classifier.calls.load(Ordering::SeqCst), 0);
        let unchanged = h.records.find_by_id(rec.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, RecordStatus::Success);
    }

    #[tokio::test]
    async fn reprocess_when_message_left_the_server() {
        let h = harness(
            FakeMailbox::default(),
            ScriptedClassifier::default(),
            RecordingSink::default(),
        )
        .await;
        let rec = h
            .records
            .create(NewRecord {
                error_message: Some("boom".into()),
                ..NewRecord::new("9", "gone@x", RecordStatus::Error)
            })
            .await
            .unwrap();

        let err = h.pipeline.reprocess(rec.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::MessageGone { .. }));

        // The record keeps its error state for another attempt later.
        let kept = h.records.find_by_id(rec.id).await.unwrap().unwrap();
        assert_eq!(kept.status, RecordStatus::Error);
        assert_eq!(kept.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn reprocess_success_rewrites_the_row_in_place() {
        let mailbox = FakeMailbox {
            by_uid: HashMap::from([("7".to_string(), raw("7", "retry@x", "Add exports"))]),
            ..Default::default()
        };
        let h = harness(mailbox, ScriptedClassifier::default(), RecordingSink::default()).await;
        let rec = h
            .records
            .create(NewRecord {
                error_message: Some("notion timed out".into()),
                ..NewRecord::new("7", "retry@x", RecordStatus::Error)
            })
            .await
            .unwrap();

        let outcome = h.pipeline.reprocess(rec.id).await.unwrap();
        assert!(outcome.is_requirement);
        assert_eq!(outcome.title, "Filed: Add exports");
        assert_eq!(outcome.page_url.as_deref(), Some("https://notion.so/page7"));

        let updated = h.records.find_by_id(rec.id).await.unwrap().unwrap();
        assert_eq!(updated.status, RecordStatus::Success);
        assert_eq!(updated.from_address, "Dana <dana@example.com>");
        assert_eq!(updated.subject, "Add exports");
        assert!(updated.error_message.is_none());
        assert_eq!(updated.page_url.as_deref(), Some("https://notion.so/page7"));

        // Updated in place, not appended.
        assert_eq!(h.records.find_all(&Default::default()).await.unwrap().total, 1);
    }
}
