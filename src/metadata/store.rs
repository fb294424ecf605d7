//! Metadata records and the stores that serve paginated queries over them.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::index::{resolve_index, SortField};
use super::MetadataError;
use crate::error::StorageError;
use crate::pipeline::config::ConfigError;

/// Largest page a query may return.
pub const MAX_PAGE_SIZE: usize = 100;

/// Summary of one archived submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub submission_id: String,
    pub created_utc: i64,
    pub author: String,
    pub title: String,
    pub score: i64,
    pub post_type: String,
    pub subreddit: String,
    pub last_updated: i64,
}

impl MetadataRecord {
    /// String-valued field by name, for partition and filter matching.
    pub fn text_field(&self, name: &str) -> Option<&str> {
        match name {
            "submission_id" => Some(&self.submission_id),
            "author" => Some(&self.author),
            "title" => Some(&self.title),
            "post_type" => Some(&self.post_type),
            "subreddit" => Some(&self.subreddit),
            _ => None,
        }
    }

    fn sort_value(&self, sort: SortField) -> i64 {
        match sort {
            SortField::CreatedUtc => self.created_utc,
            SortField::Score => self.score,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Equality condition on a record field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldEq {
    pub field: String,
    pub value: String,
}

impl FieldEq {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// A paginated metadata query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataQuery {
    /// Partition key condition; `None` queries the constant partition.
    pub key_condition: Option<FieldEq>,
    /// Extra condition applied after the partition is selected.
    pub filter_condition: Option<FieldEq>,
    /// Resume strictly after this submission id.
    pub after_id: Option<String>,
    pub limit: usize,
    pub sort_field: String,
    pub sort_order: SortOrder,
}

impl Default for MetadataQuery {
    fn default() -> Self {
        Self {
            key_condition: None,
            filter_condition: None,
            after_id: None,
            limit: MAX_PAGE_SIZE,
            sort_field: SortField::CreatedUtc.as_str().to_string(),
            sort_order: SortOrder::Asc,
        }
    }
}

impl MetadataQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partitioned_by(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.key_condition = Some(FieldEq::new(field, value));
        self
    }

    pub fn filtered_by(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter_condition = Some(FieldEq::new(field, value));
        self
    }

    pub fn after(mut self, id: impl Into<String>) -> Self {
        self.after_id = Some(id.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn sorted_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort_field = field.into();
        self.sort_order = order;
        self
    }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataPage {
    pub items: Vec<MetadataRecord>,
    /// Pass as `after_id` to fetch the next page; absent on the last page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_id: Option<String>,
}

/// Put/get/query access to metadata records.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Inserts or replaces the record for `item_id`.
    async fn put(&self, item_id: &str, record: &MetadataRecord) -> Result<(), MetadataError>;

    async fn get(&self, item_id: &str) -> Result<Option<MetadataRecord>, MetadataError>;

    /// Runs `query` against the index resolved for its partition and sort field.
    async fn query(&self, query: &MetadataQuery) -> Result<MetadataPage, MetadataError>;
}

/// Evaluates `query` over a full record set.
///
/// Records are ordered by the sort field with ties broken by submission id,
/// in the requested direction.
pub fn run_query<'a, I>(records: I, query: &MetadataQuery) -> Result<MetadataPage, ConfigError>
where
    I: IntoIterator<Item = &'a MetadataRecord>,
{
    let partition = query.key_condition.as_ref().map(|c| c.field.as_str());
    let index = resolve_index(partition, &query.sort_field)?;
    let limit = query.limit.clamp(1, MAX_PAGE_SIZE);

    let matches = |record: &MetadataRecord, condition: &Option<FieldEq>| {
        condition.as_ref().map_or(true, |c| {
            record.text_field(&c.field) == Some(c.value.as_str())
        })
    };

    let mut selected: Vec<&MetadataRecord> = records
        .into_iter()
        .filter(|r| matches(r, &query.key_condition) && matches(r, &query.filter_condition))
        .collect();
    selected.sort_by(|a, b| {
        a.sort_value(index.sort)
            .cmp(&b.sort_value(index.sort))
            .then_with(|| a.submission_id.cmp(&b.submission_id))
    });
    if query.sort_order == SortOrder::Desc {
        selected.reverse();
    }

    let start = match &query.after_id {
        None => 0,
        Some(after) => {
            let position = selected
                .iter()
                .position(|r| &r.submission_id == after)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "after_id".to_string(),
                    message: format!("'{after}' is not in the queried partition"),
                })?;
            position + 1
        }
    };

    let remaining = &selected[start.min(selected.len())..];
    let items: Vec<MetadataRecord> = remaining.iter().take(limit).map(|r| (*r).clone()).collect();
    let last_id = if remaining.len() > limit {
        items.last().map(|r| r.submission_id.clone())
    } else {
        None
    };

    debug!(index = index.name, returned = items.len(), more = last_id.is_some(), "Metadata query");
    Ok(MetadataPage { items, last_id })
}

/// Metadata held in process memory.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: RwLock<BTreeMap<String, MetadataRecord>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn put(&self, item_id: &str, record: &MetadataRecord) -> Result<(), MetadataError> {
        self.records
            .write()
            .await
            .insert(item_id.to_string(), record.clone());
        Ok(())
    }

    async fn get(&self, item_id: &str) -> Result<Option<MetadataRecord>, MetadataError> {
        Ok(self.records.read().await.get(item_id).cloned())
    }

    async fn query(&self, query: &MetadataQuery) -> Result<MetadataPage, MetadataError> {
        let records = self.records.read().await;
        Ok(run_query(records.values(), query)?)
    }
}

/// Metadata kept as one JSON document keyed by submission id.
///
/// Every `put` rewrites the document with write-then-rename.
#[derive(Debug)]
pub struct JsonFileMetadataStore {
    path: PathBuf,
    records: Mutex<Option<BTreeMap<String, MetadataRecord>>>,
}

impl JsonFileMetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Mutex::new(None),
        }
    }

    fn display(&self) -> String {
        self.path.display().to_string()
    }

    async fn load(&self) -> Result<BTreeMap<String, MetadataRecord>, StorageError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(StorageError::io(self.display(), e)),
        }
    }

    async fn save(&self, records: &BTreeMap<String, MetadataRecord>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent.display().to_string(), e))?;
        }
        let body = serde_json::to_vec_pretty(records)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, body)
            .await
            .map_err(|e| StorageError::io(tmp.display().to_string(), e))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StorageError::io(self.display(), e))
    }
}

#[async_trait]
impl MetadataStore for JsonFileMetadataStore {
    async fn put(&self, item_id: &str, record: &MetadataRecord) -> Result<(), MetadataError> {
        let mut cache = self.records.lock().await;
        if cache.is_none() {
            *cache = Some(self.load().await?);
        }
        if let Some(records) = cache.as_mut() {
            records.insert(item_id.to_string(), record.clone());
            self.save(records).await?;
        }
        Ok(())
    }

    async fn get(&self, item_id: &str) -> Result<Option<MetadataRecord>, MetadataError> {
        let mut cache = self.records.lock().await;
        if cache.is_none() {
            *cache = Some(self.load().await?);
        }
        Ok(cache.as_ref().and_then(|records| records.get(item_id).cloned()))
    }

    async fn query(&self, query: &MetadataQuery) -> Result<MetadataPage, MetadataError> {
        let mut cache = self.records.lock().await;
        if cache.is_none() {
            *cache = Some(self.load().await?);
        }
        let records = cache.as_ref().map(|r| r.values().collect::<Vec<_>>()).unwrap_or_default();
        Ok(run_query(records, query)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str, created_utc: i64, score: i64, author: &str, post_type: &str) -> MetadataRecord {
        MetadataRecord {
            submission_id: id.to_string(),
            created_utc,
            author: author.to_string(),
            title: format!("title {id}"),
            score,
            post_type: post_type.to_string(),
            subreddit: "Superstonk".to_string(),
            last_updated: 0,
        }
    }

    fn sample() -> Vec<MetadataRecord> {
        vec![
            record("a", 100, 5, "alice", "dd"),
            record("b", 200, 50, "bob", "shitpost"),
            record("c", 300, 5, "alice", "discussion"),
            record("d", 400, 20, "alice", "dd"),
            record("e", 500, 1, "carol", "dd"),
        ]
    }

    fn ids(page: &MetadataPage) -> Vec<&str> {
        page.items.iter().map(|r| r.submission_id.as_str()).collect()
    }

    #[test]
    fn test_paginates_with_last_id() {
        let records = sample();
        let first = run_query(&records, &MetadataQuery::new().with_limit(2)).expect("query");
        assert_eq!(ids(&first), vec!["a", "b"]);
        assert_eq!(first.last_id.as_deref(), Some("b"));

        let second = run_query(&records, &MetadataQuery::new().with_limit(2).after("b")).expect("query");
        assert_eq!(ids(&second), vec!["c", "d"]);

        let last = run_query(&records, &MetadataQuery::new().with_limit(2).after("d")).expect("query");
        assert_eq!(ids(&last), vec!["e"]);
        assert!(last.last_id.is_none());
    }

    #[test]
    fn test_partition_filter_and_sort() {
        let records = sample();
        let query = MetadataQuery::new()
            .partitioned_by("author", "alice")
            .filtered_by("post_type", "dd")
            .sorted_by("score", SortOrder::Desc);
        let page = run_query(&records, &query).expect("query");
        assert_eq!(ids(&page), vec!["d", "a"]);

        // Equal scores fall back to id order.
        let query = MetadataQuery::new().sorted_by("score", SortOrder::Asc);
        let page = run_query(&records, &query).expect("query");
        assert_eq!(ids(&page), vec!["e", "a", "c", "d", "b"]);
    }

    #[test]
    fn test_limit_is_clamped() {
        let records: Vec<MetadataRecord> = (0..150)
            .map(|i| record(&format!("p{i:03}"), i, 0, "x", "dd"))
            .collect();
        let page = run_query(&records, &MetadataQuery::new().with_limit(500)).expect("query");
        assert_eq!(page.items.len(), MAX_PAGE_SIZE);
        assert_eq!(page.last_id.as_deref(), Some("p099"));
    }

    #[test]
    fn test_unsupported_index_and_unknown_cursor() {
        let records = sample();
        let err = run_query(&records, &MetadataQuery::new().partitioned_by("title", "x")).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedIndex { .. }));

        let err = run_query(&records, &MetadataQuery::new().after("zzz")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[tokio::test]
    async fn test_json_file_store_survives_reopen() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("metadata.json");

        let store = JsonFileMetadataStore::new(&path);
        for r in sample() {
            store.put(&r.submission_id, &r).await.expect("put");
        }

        let reopened = JsonFileMetadataStore::new(&path);
        assert_eq!(
            reopened.get("c").await.expect("get"),
            Some(record("c", 300, 5, "alice", "discussion"))
        );
        let page = reopened
            .query(&MetadataQuery::new().partitioned_by("post_type", "dd"))
            .await
            .expect("query");
        assert_eq!(ids(&page), vec!["a", "d", "e"]);
    }

    #[tokio::test]
    async fn test_memory_store_put_replaces() {
        let store = MemoryMetadataStore::new();
        store.put("a", &record("a", 1, 1, "x", "dd")).await.expect("put");
        store.put("a", &record("a", 1, 9, "x", "dd")).await.expect("put");
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("a").await.expect("get").expect("record").score, 9);
    }
}
