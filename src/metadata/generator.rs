//! Backfills metadata records from archived posts.

use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tracing::{info, warn};

use super::store::{MetadataRecord, MetadataStore};
use super::MetadataError;
use crate::storage::{list_dirs, ConfigStore, MetadataCommand, Storage};

/// Flair keywords in match order. The first keyword found wins.
const FLAIR_KEYWORDS: [(&str, &str); 11] = [
    ("dd", "dd"),
    ("discussion", "discussion"),
    ("opinion", "discussion"),
    ("shitpost", "shitpost"),
    ("meme", "shitpost"),
    ("social media", "social_media"),
    ("data", "data"),
    ("hodl", "fluff"),
    ("fluff", "fluff"),
    ("news", "news"),
    ("daily", "daily"),
];

/// Classifies a post by its flair text.
pub fn derive_post_type(flair: Option<&str>) -> &'static str {
    let Some(flair) = flair else {
        return "unknown";
    };
    let flair = flair.to_lowercase();
    FLAIR_KEYWORDS
        .iter()
        .find(|(keyword, _)| flair.contains(keyword))
        .map_or("unknown", |(_, post_type)| *post_type)
}

/// Builds the metadata record for an archived post.
///
/// Returns `None` if a required field is missing or has the wrong type.
pub fn metadata_for(submission_id: &str, post: &Value) -> Option<MetadataRecord> {
    let text = |name: &str| post.get(name).and_then(Value::as_str).map(str::to_string);
    let number = |name: &str| {
        post.get(name)
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f.trunc() as i64)))
    };

    Some(MetadataRecord {
        submission_id: submission_id.to_string(),
        created_utc: number("created_utc")?,
        author: text("author")?,
        title: text("title")?,
        score: number("score")?,
        post_type: derive_post_type(post.get("link_flair_text").and_then(Value::as_str)).to_string(),
        subreddit: text("subreddit")?,
        last_updated: Utc::now().timestamp(),
    })
}

/// Totals of one backfill run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    pub generated: usize,
    pub skipped: usize,
    pub last_generated: Option<String>,
}

/// Generates metadata for every archived post after the saved progress marker.
///
/// A `rebuild` command restarts from the first directory and is replaced by
/// `resume`. Progress is saved after every record, so an interrupted run picks
/// up after the last record it wrote.
///
/// # Errors
///
/// Fails on storage, config-store or metadata-store errors. Directories with
/// no readable `post.json` are skipped.
pub async fn generate_metadata(
    storage: &dyn Storage,
    config_store: &dyn ConfigStore,
    metadata: &dyn MetadataStore,
) -> Result<BackfillSummary, MetadataError> {
    let mut config = config_store.get_config().await?;

    let start_after = if config.metadata_command == Some(MetadataCommand::Rebuild) {
        info!("Metadata rebuild requested; starting from the beginning");
        config.last_generated_metadata = None;
        config.metadata_command = Some(MetadataCommand::Resume);
        config_store.put_config(&config).await?;
        None
    } else {
        match config.last_generated_metadata.clone() {
            Some(last) => {
                info!(after = %last, "Resuming metadata generation");
                Some(last)
            }
            None => {
                info!("Metadata generation starting from the beginning");
                None
            }
        }
    };

    let mut summary = BackfillSummary::default();
    let mut dirs = list_dirs(storage, start_after);
    while let Some(dir) = dirs.next().await {
        let submission_id = dir?;

        let post = match storage.read(&format!("{submission_id}/post.json")).await? {
            Some(bytes) => serde_json::from_slice::<Value>(&bytes).ok(),
            None => None,
        };
        let Some(record) = post.as_ref().and_then(|post| metadata_for(&submission_id, post)) else {
            warn!(submission_id = %submission_id, "No usable post.json; skipping");
            summary.skipped += 1;
            continue;
        };

        metadata.put(&submission_id, &record).await?;

        config.last_generated_metadata = Some(submission_id.clone());
        config_store.put_config(&config).await?;

        summary.generated += 1;
        summary.last_generated = Some(submission_id);
    }

    info!(
        generated = summary.generated,
        skipped = summary.skipped,
        "Metadata generation finished"
    );
    Ok(summary)
}
