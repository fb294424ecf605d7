//! Discovery: the only component allowed to advance the cursor.
//!
//! The producer pages through the upstream submission search in ascending
//! creation order. After each page it publishes the matching items, then
//! moves the cursor to the creation time of the page's last raw record,
//! whether or not that record matched, and persists it. An empty page ends
//! discovery; the publisher is closed on every exit path.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::config::ArchiverConfig;
use super::types::{created_utc_of, Cursor, WorkItem};
use crate::error::{FetchError, PipelineError};
use crate::scheduler::queue::FanOut;
use crate::storage::{ConfigStore, Notifier};
use crate::upstream::client::{QueryFilters, UpstreamApi, SUBMISSION_SEARCH};

/// Destination of discovered items.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Makes every item visible to all downstream stages.
    async fn publish(&self, items: Vec<Arc<WorkItem>>) -> Result<(), PipelineError>;

    /// Signals that no further items will be published.
    async fn close(&self);
}

#[async_trait]
impl Publisher for FanOut {
    async fn publish(&self, items: Vec<Arc<WorkItem>>) -> Result<(), PipelineError> {
        FanOut::publish(self, &items);
        Ok(())
    }

    async fn close(&self) {
        FanOut::close(self);
    }
}

/// Publishes item ids through a [`Notifier`] for out-of-process stage workers.
pub struct NotifierPublisher {
    notifier: Arc<dyn Notifier>,
}

impl NotifierPublisher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl Publisher for NotifierPublisher {
    async fn publish(&self, items: Vec<Arc<WorkItem>>) -> Result<(), PipelineError> {
        for item in &items {
            self.notifier.send(item.id()).await?;
        }
        Ok(())
    }

    async fn close(&self) {}
}

/// Flair predicate applied to every discovered record.
#[derive(Debug, Clone, Default)]
pub struct FlairFilter {
    flair: Option<String>,
}

impl FlairFilter {
    pub fn new(flair: Option<String>) -> Self {
        Self { flair }
    }

    /// True when no flair is configured or `link_flair_text` contains it.
    pub fn matches(&self, record: &Value) -> bool {
        match &self.flair {
            None => true,
            Some(flair) => record
                .get("link_flair_text")
                .and_then(Value::as_str)
                .is_some_and(|text| text.contains(flair.as_str())),
        }
    }
}

/// Totals of one discovery run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoverySummary {
    pub pages: usize,
    pub records: usize,
    pub published: usize,
    pub cursor: Option<Cursor>,
}

pub struct Producer {
    upstream: Arc<dyn UpstreamApi>,
    config_store: Arc<dyn ConfigStore>,
    subreddit: String,
    filter: FlairFilter,
    after: Option<Cursor>,
    before: Option<Cursor>,
}

impl Producer {
    pub fn new(
        upstream: Arc<dyn UpstreamApi>,
        config_store: Arc<dyn ConfigStore>,
        config: &ArchiverConfig,
    ) -> Self {
        Self {
            upstream,
            config_store,
            subreddit: config.subreddit.clone(),
            filter: FlairFilter::new(config.flair.clone()),
            after: config.after,
            before: config.before,
        }
    }

    /// Runs discovery to the end of the stream, then closes `publisher`.
    ///
    /// # Errors
    ///
    /// Propagates exhausted upstream retries, config-store failures, publish
    /// failures and [`PipelineError::CursorStalled`]. The publisher is closed
    /// in every case.
    pub async fn run(&self, publisher: &dyn Publisher) -> Result<DiscoverySummary, PipelineError> {
        let result = self.discover(publisher).await;
        publisher.close().await;
        result
    }

    async fn discover(&self, publisher: &dyn Publisher) -> Result<DiscoverySummary, PipelineError> {
        let mut state = self.config_store.get_config().await?;
        let mut cursor = state.cursor.or(self.after);
        let filters = QueryFilters::new()
            .with("subreddit", &self.subreddit)
            .with_opt("before", self.before);

        info!(subreddit = %self.subreddit, cursor = ?cursor, "Discovery starting");
        let mut summary = DiscoverySummary {
            cursor,
            ..Default::default()
        };

        loop {
            let page = self.upstream.query(SUBMISSION_SEARCH, &filters, cursor).await?;
            if page.is_empty() {
                break;
            }

            let last = page.last().and_then(created_utc_of).ok_or_else(|| {
                FetchError::invalid(SUBMISSION_SEARCH, "last record has no created_utc")
            })?;
            if let Some(current) = cursor {
                if last <= current.as_secs() {
                    return Err(PipelineError::CursorStalled {
                        cursor: current.as_secs(),
                        last,
                    });
                }
            }

            let records = page.len();
            let items: Vec<Arc<WorkItem>> = page
                .into_iter()
                .filter(|record| self.filter.matches(record))
                .filter_map(|record| {
                    let item = WorkItem::from_record(record.clone());
                    if item.is_none() {
                        warn!(
                            record = %record,
                            "Matching record has no id or created_utc; skipping"
                        );
                    }
                    item
                })
                .map(Arc::new)
                .collect();
            let published = items.len();
            publisher.publish(items).await?;

            // Advance on the last raw record so all-filtered pages still progress.
            cursor = Some(Cursor(last));
            state.cursor = cursor;
            self.config_store.put_config(&state).await?;

            summary.pages += 1;
            summary.records += records;
            summary.published += published;
            summary.cursor = cursor;
            debug!(
                records = records,
                published = published,
                cursor = last,
                "Discovery page committed"
            );
        }

        info!(
            pages = summary.pages,
            records = summary.records,
            published = summary.published,
            cursor = ?summary.cursor,
            "Discovery finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotifyError;
    use crate::pipeline::types::StageKind;
    use crate::storage::{DiscoveryConfig, MemoryConfigStore};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Serves canned pages in order and records the cursor of every request.
    struct ScriptedUpstream {
        pages: Mutex<VecDeque<Result<Vec<Value>, FetchError>>>,
        seen_cursors: Mutex<Vec<Option<Cursor>>>,
    }

    impl ScriptedUpstream {
        fn new(pages: Vec<Result<Vec<Value>, FetchError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                seen_cursors: Mutex::new(Vec::new()),
            }
        }

        fn cursors(&self) -> Vec<Option<Cursor>> {
            self.seen_cursors.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl UpstreamApi for ScriptedUpstream {
        async fn query(
            &self,
            _endpoint: &str,
            _filters: &QueryFilters,
            after: Option<Cursor>,
        ) -> Result<Vec<Value>, FetchError> {
            self.seen_cursors.lock().expect("lock").push(after);
            self.pages
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    /// Serves every record strictly after the requested cursor, `size` at a time.
    struct StoredUpstream {
        records: Vec<Value>,
        size: usize,
    }

    #[async_trait]
    impl UpstreamApi for StoredUpstream {
        async fn query(
            &self,
            _endpoint: &str,
            _filters: &QueryFilters,
            after: Option<Cursor>,
        ) -> Result<Vec<Value>, FetchError> {
            let after = after.map_or(i64::MIN, Cursor::as_secs);
            Ok(self
                .records
                .iter()
                .filter(|r| created_utc_of(r).is_some_and(|t| t > after))
                .take(self.size)
                .cloned()
                .collect())
        }
    }

    fn post(id: &str, created_utc: i64, flair: &str) -> Value {
        json!({"id": id, "created_utc": created_utc, "link_flair_text": flair})
    }

    fn config() -> ArchiverConfig {
        ArchiverConfig::default().with_flair("DD")
    }

    #[tokio::test]
    async fn test_cursor_advances_through_filtered_pages() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Ok(vec![post("a", 10, "Meme"), post("b", 20, "Meme")]),
            Ok(vec![post("c", 30, "DD 👨‍🔬"), post("d", 40, "News")]),
            Ok(vec![]),
        ]));
        let store = Arc::new(MemoryConfigStore::new());
        let producer = Producer::new(upstream.clone(), store.clone(), &config());
        let fan_out = FanOut::new(&StageKind::ALL);

        let summary = producer.run(&fan_out).await.expect("discovery");

        assert_eq!(summary.pages, 2);
        assert_eq!(summary.records, 4);
        assert_eq!(summary.published, 1);
        assert_eq!(summary.cursor, Some(Cursor(40)));
        assert_eq!(
            upstream.cursors(),
            vec![None, Some(Cursor(20)), Some(Cursor(40))]
        );
        assert_eq!(
            store.get_config().await.expect("config").cursor,
            Some(Cursor(40))
        );
        for queue in fan_out.queues() {
            assert!(queue.is_closed());
            assert_eq!(queue.enqueued_total(), 1);
        }
    }

    #[tokio::test]
    async fn test_matching_record_without_id_is_skipped() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Ok(vec![
                json!({"created_utc": 10, "link_flair_text": "DD"}),
                post("b", 20, "DD"),
                json!({"id": "c", "link_flair_text": "DD", "created_utc": 30}),
            ]),
            Ok(vec![]),
        ]));
        let store = Arc::new(MemoryConfigStore::new());
        let fan_out = FanOut::new(&[StageKind::Submission]);

        let summary = Producer::new(upstream, store, &config())
            .run(&fan_out)
            .await
            .expect("discovery");

        assert_eq!(summary.records, 3);
        assert_eq!(summary.published, 2);
        assert_eq!(summary.cursor, Some(Cursor(30)));
        assert_eq!(fan_out.queues()[0].enqueued_total(), 2);
    }

    #[tokio::test]
    async fn test_cursor_monotonic_for_many_page_sequences() {
        // Varying page sizes and filter outcomes.
        for size in 1..7 {
            let records: Vec<Value> = (0..23)
                .map(|i| post(&format!("p{i}"), 100 + i * 3, if i % 4 == 0 { "DD" } else { "x" }))
                .collect();
            let upstream = Arc::new(StoredUpstream { records, size });
            let store = Arc::new(MemoryConfigStore::new());
            let producer = Producer::new(upstream, store.clone(), &config());
            let fan_out = FanOut::new(&[StageKind::Submission]);

            let summary = producer.run(&fan_out).await.expect("discovery");

            assert_eq!(summary.records, 23, "size {size}");
            assert_eq!(summary.published, 6, "size {size}");
            assert_eq!(summary.cursor, Some(Cursor(100 + 22 * 3)));
            assert_eq!(summary.pages, 23usize.div_ceil(size));
        }
    }

    #[tokio::test]
    async fn test_resume_from_persisted_cursor() {
        let records: Vec<Value> = (0..10).map(|i| post(&format!("p{i}"), i, "DD")).collect();
        let store = Arc::new(MemoryConfigStore::with_config(DiscoveryConfig {
            cursor: Some(Cursor(5)),
            ..Default::default()
        }));
        let upstream = Arc::new(StoredUpstream {
            records,
            size: 3,
        });
        // The configured lower bound is ignored once a cursor was persisted.
        let config = config().with_window(Some(Cursor(0)), None);
        let producer = Producer::new(upstream, store, &config);
        let fan_out = FanOut::new(&[StageKind::Submission]);

        producer.run(&fan_out).await.expect("discovery");

        let queue = fan_out.queue(StageKind::Submission).expect("queue");
        let mut ids = Vec::new();
        while let crate::scheduler::queue::Dequeued::Item(item) =
            queue.dequeue(std::time::Duration::from_millis(1)).await
        {
            ids.push(item.id().to_string());
        }
        assert_eq!(ids, vec!["p6", "p7", "p8", "p9"]);
    }

    #[tokio::test]
    async fn test_crash_mid_batch_rereads_without_loss() {
        let records: Vec<Value> = (0..8).map(|i| post(&format!("p{i}"), i + 1, "DD")).collect();
        let store = Arc::new(MemoryConfigStore::new());

        // First run: second page fails after the first was committed.
        let first = Arc::new(ScriptedUpstream::new(vec![
            Ok(records[..4].to_vec()),
            Err(FetchError::MaxAttemptsExceeded {
                attempts: 5,
                last: Box::new(FetchError::Timeout("u".to_string())),
            }),
        ]));
        let fan_out = FanOut::new(&[StageKind::Submission]);
        let err = Producer::new(first, store.clone(), &config())
            .run(&fan_out)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Fetch(_)));
        assert!(fan_out.queues()[0].is_closed());
        assert_eq!(
            store.get_config().await.expect("config").cursor,
            Some(Cursor(4))
        );

        // Restart picks up exactly after the committed page.
        let second = Arc::new(StoredUpstream {
            records: records.clone(),
            size: 4,
        });
        let fan_out = FanOut::new(&[StageKind::Submission]);
        let summary = Producer::new(second, store, &config())
            .run(&fan_out)
            .await
            .expect("discovery");
        assert_eq!(summary.published, 4);
        assert_eq!(summary.cursor, Some(Cursor(8)));
    }

    #[tokio::test]
    async fn test_stalled_cursor_is_fatal() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Ok(vec![post("a", 50, "DD")]),
            Ok(vec![post("a", 50, "DD")]),
        ]));
        let store = Arc::new(MemoryConfigStore::new());
        let fan_out = FanOut::new(&[StageKind::Submission]);

        let err = Producer::new(upstream, store, &config())
            .run(&fan_out)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::CursorStalled {
                cursor: 50,
                last: 50
            }
        ));
    }

    #[tokio::test]
    async fn test_notifier_publisher_sends_ids() {
        struct Recording(Mutex<Vec<String>>);

        #[async_trait]
        impl Notifier for Recording {
            async fn send(&self, item_id: &str) -> Result<(), NotifyError> {
                self.0.lock().expect("lock").push(item_id.to_string());
                Ok(())
            }
        }

        let notifier = Arc::new(Recording(Mutex::new(Vec::new())));
        let publisher = NotifierPublisher::new(notifier.clone());
        let upstream = Arc::new(ScriptedUpstream::new(vec![Ok(vec![
            post("a", 1, "DD"),
            post("b", 2, "Meme"),
            post("c", 3, "DD"),
        ])]));
        let store = Arc::new(MemoryConfigStore::new());

        Producer::new(upstream, store, &config())
            .run(&publisher)
            .await
            .expect("discovery");
        assert_eq!(*notifier.0.lock().expect("lock"), vec!["a", "c"]);
    }

    #[test]
    fn test_flair_filter() {
        let filter = FlairFilter::new(Some("DD".to_string()));
        assert!(filter.matches(&post("a", 1, "DD 👨‍🔬")));
        assert!(!filter.matches(&post("a", 1, "Discussion")));
        assert!(!filter.matches(&json!({"id": "a", "link_flair_text": null})));
        assert!(FlairFilter::default().matches(&json!({"id": "a"})));
    }
}
