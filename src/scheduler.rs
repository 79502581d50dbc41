//! Periodic pipeline runs on a cron cadence.
//!
//! A ticker task sleeps until the next cron fire and then spawns a
//! date-window run over everything since the watermark. Runs are fired,
//! not awaited, so a slow run can overlap the next fire; the `processing`
//! flag turns that overlap into a skipped tick instead of a second
//! concurrent run. The watermark only advances when a run succeeds, so a
//! failed window is retried in full on the next tick.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::SchedulerError;
use crate::pipeline::Pipeline;
use crate::settings::SettingsStore;

/// Snapshot for the scheduler status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    /// Whether settings say the scheduler should run at boot.
    pub enabled: bool,
    pub interval_minutes: u32,
    /// A ticker task is alive.
    pub running: bool,
    /// A run is currently in flight.
    pub processing: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    /// Lower bound of the next date window.
    pub watermark: DateTime<Utc>,
}

struct TickerTask {
    handle: JoinHandle<()>,
    interval_minutes: u32,
    schedule: Schedule,
}

/// Drives `Pipeline::process_since` on an every-N-minutes cron schedule.
pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    settings: SettingsStore,
    processing: Arc<AtomicBool>,
    watermark: Arc<RwLock<DateTime<Utc>>>,
    last_run: Arc<RwLock<Option<DateTime<Utc>>>>,
    task: Mutex<Option<TickerTask>>,
}

impl Scheduler {
    /// The initial watermark is the construction time: scheduled runs
    /// only ever look at mail that arrived while the service was up.
    pub fn new(pipeline: Arc<Pipeline>, settings: SettingsStore) -> Self {
        Self {
            pipeline,
            settings,
            processing: Arc::new(AtomicBool::new(false)),
            watermark: Arc::new(RwLock::new(Utc::now())),
            last_run: Arc::new(RwLock::new(None)),
            task: Mutex::new(None),
        }
    }

    /// (Re)start the ticker at the given interval.
    pub async fn start(&self, interval_minutes: u32) -> Result<(), SchedulerError> {
        if interval_minutes == 0 {
            return Err(SchedulerError::InvalidInterval {
                minutes: interval_minutes,
            });
        }
        let expression = format!("0 */{interval_minutes} * * * *");
        let schedule = Schedule::from_str(&expression).map_err(|_| {
            SchedulerError::InvalidInterval {
                minutes: interval_minutes,
            }
        })?;

        self.stop().await;

        let pipeline = Arc::clone(&self.pipeline);
        let processing = Arc::clone(&self.processing);
        let watermark = Arc::clone(&self.watermark);
        let last_run = Arc::clone(&self.last_run);
        let tick_schedule = schedule.clone();

        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = tick_schedule.upcoming(Utc).next() else {
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;

                if processing
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    warn!("Previous scheduled run still in flight, skipping tick");
                    continue;
                }

                let tick_start = Utc::now();
                *last_run.write().await = Some(tick_start);

                // Fire the run without awaiting it; the flag is cleared by
                // the run itself on every exit path.
                let pipeline = Arc::clone(&pipeline);
                let processing = Arc::clone(&processing);
                let watermark = Arc::clone(&watermark);
                tokio::spawn(async move {
                    let since = *watermark.read().await;
                    match pipeline.process_since(since).await {
                        Ok(outcome) => {
                            info!(
                                total = outcome.total,
                                written = outcome.written,
                                errors = outcome.errors,
                                "Scheduled run complete"
                            );
                            *watermark.write().await = tick_start;
                        }
                        Err(e) => error!(error = %e, "Scheduled run failed"),
                    }
                    processing.store(false, Ordering::SeqCst);
                });
            }
        });

        *self.task.lock().await = Some(TickerTask {
            handle,
            interval_minutes,
            schedule,
        });
        info!(interval_minutes, "Scheduler started");
        Ok(())
    }

    /// Abort the ticker. An already-fired run is left to finish.
    pub async fn stop(&self) {
        let mut task = self.task.lock().await;
        if let Some(t) = task.take() {
            if !t.handle.is_finished() {
                t.handle.abort();
            }
            info!("Scheduler stopped");
        }
    }

    pub async fn status(&self) -> Result<SchedulerStatus, SchedulerError> {
        let settings = self.settings.scheduler().await?;
        let task = self.task.lock().await;
        let (running, interval_minutes, next_run) = match task.as_ref() {
            Some(t) if !t.handle.is_finished() => (
                true,
                t.interval_minutes,
                t.schedule.upcoming(Utc).next(),
            ),
            _ => (false, settings.interval_minutes, None),
        };

        Ok(SchedulerStatus {
            enabled: settings.enabled,
            interval_minutes,
            running,
            processing: self.processing.load(Ordering::SeqCst),
            last_run: *self.last_run.read().await,
            next_run,
            watermark: *self.watermark.read().await,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use crate::analysis::{Analysis, Classifier, Digest};
    use crate::error::{AnalysisError, DeliveryError, MailError};
    use crate::mailbox::parser::ParsedMessage;
    use crate::mailbox::{Mailbox, RawMessage};
    use crate::notion::{DocumentSink, PageRef};
    use crate::store::{CategoryStore, Db, RecordStore};

    use super::*;

    /// Mailbox that records every `since` it is asked for, plus the
    /// virtual-clock instant of each call. Always empty, so runs end
    /// before touching classifier or sink.
    #[derive(Default)]
    struct RecordingMailbox {
        sinces: StdMutex<Vec<DateTime<Utc>>>,
        starts: StdMutex<Vec<tokio::time::Instant>>,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Mailbox for RecordingMailbox {
        async fn fetch_unseen(&self) -> Result<Vec<RawMessage>, MailError> {
            Ok(vec![])
        }

        async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<RawMessage>, MailError> {
            self.sinces.lock().unwrap().push(since);
            self.starts.lock().unwrap().push(tokio::time::Instant::now());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(MailError::Disconnected);
            }
            Ok(vec![])
        }

        async fn fetch_by_uid(&self, _uid: &str) -> Result<Option<RawMessage>, MailError> {
            Ok(None)
        }
    }

    struct NullClassifier;

    #[async_trait]
    impl Classifier for NullClassifier {
        async fn classify(
            &self,
            _msg: &ParsedMessage,
            _categories: &[String],
        ) -> Result<Analysis, AnalysisError> {
            unreachable!("empty mailbox")
        }

        async fn summarize(
            &self,
            _msg: &ParsedMessage,
            _categories: &[String],
        ) -> Result<Digest, AnalysisError> {
            unreachable!("empty mailbox")
        }
    }

    struct NullSink;

    #[async_trait]
    impl DocumentSink for NullSink {
        async fn create_page(
            &self,
            _msg: &ParsedMessage,
            _analysis: &crate::analysis::ClassificationResult,
        ) -> Result<PageRef, DeliveryError> {
            unreachable!("empty mailbox")
        }

        async fn create_digest_page(
            &self,
            _msg: &ParsedMessage,
            _digest: &Digest,
        ) -> Result<PageRef, DeliveryError> {
            unreachable!("empty mailbox")
        }
    }

    async fn scheduler_over(mailbox: Arc<RecordingMailbox>) -> Scheduler {
        let db = Db::open_memory().await.unwrap();
        let records = RecordStore::new(db.clone());
        let categories = CategoryStore::new(db.clone());
        let settings = SettingsStore::new(db);
        settings.seed_defaults().await.unwrap();
        let pipeline = Arc::new(Pipeline::new(
            mailbox,
            Arc::new(NullClassifier),
            Arc::new(NullSink),
            records,
            categories,
            settings.clone(),
        ));
        Scheduler::new(pipeline, settings)
    }

    #[tokio::test]
    async fn start_rejects_zero_interval() {
        let scheduler = scheduler_over(Arc::new(RecordingMailbox::default())).await;
        let err = scheduler.start(0).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidInterval { minutes: 0 }));
    }

    #[tokio::test]
    async fn status_reflects_lifecycle() {
        let scheduler = scheduler_over(Arc::new(RecordingMailbox::default())).await;

        let idle = scheduler.status().await.unwrap();
        assert!(!idle.enabled);
        assert!(!idle.running);
        assert!(!idle.processing);
        assert_eq!(idle.interval_minutes, 5);
        assert!(idle.last_run.is_none());
        assert!(idle.next_run.is_none());

        scheduler.start(2).await.unwrap();
        let running = scheduler.status().await.unwrap();
        assert!(running.running);
        assert_eq!(running.interval_minutes, 2);
        assert!(running.next_run.is_some());

        scheduler.stop().await;
        let stopped = scheduler.status().await.unwrap();
        assert!(!stopped.running);
        assert!(stopped.next_run.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_advance_the_watermark_on_success() {
        let mailbox = Arc::new(RecordingMailbox::default());
        let scheduler = scheduler_over(Arc::clone(&mailbox)).await;

        scheduler.start(1).await.unwrap();
        tokio::time::sleep(Duration::from_secs(150)).await;
        scheduler.stop().await;

        let sinces = mailbox.sinces.lock().unwrap().clone();
        assert!(sinces.len() >= 2, "expected at least two ticks, got {}", sinces.len());
        // Each successful run moves the window forward.
        assert!(sinces[1] > sinces[0]);

        let status = scheduler.status().await.unwrap();
        assert!(status.last_run.is_some());
        assert!(status.watermark > sinces[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_runs_keep_the_watermark() {
        let mailbox = Arc::new(RecordingMailbox {
            fail: true,
            ..Default::default()
        });
        let scheduler = scheduler_over(Arc::clone(&mailbox)).await;

        scheduler.start(1).await.unwrap();
        tokio::time::sleep(Duration::from_secs(150)).await;
        scheduler.stop().await;

        let sinces = mailbox.sinces.lock().unwrap().clone();
        assert!(sinces.len() >= 2);
        // Same window retried, not advanced past.
        assert_eq!(sinces[0], sinces[1]);
        assert!(!scheduler.status().await.unwrap().processing);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_tick_is_skipped() {
        // Each run takes 90s against a 60s interval, so fires land while
        // the previous run is still in flight and must be skipped. With
        // the guard, consecutive run starts are at least a full run
        // apart; without it they would be one interval apart.
        let mailbox = Arc::new(RecordingMailbox {
            delay: Duration::from_secs(90),
            ..Default::default()
        });
        let scheduler = scheduler_over(Arc::clone(&mailbox)).await;

        scheduler.start(1).await.unwrap();
        tokio::time::sleep(Duration::from_secs(200)).await;
        scheduler.stop().await;

        let starts = mailbox.starts.lock().unwrap().clone();
        assert!(starts.len() >= 2, "expected at least two runs, got {}", starts.len());
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(90));
        }
    }
}
