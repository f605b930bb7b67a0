//! Community rules feed.
//!
//! Fetches a JSON rule array from a single HTTPS URL and merges rules whose
//! ids are not yet present; existing rules are never touched. Fetch failures
//! are logged and retried at the next scheduled tick.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::{RuleFileEntry, RuleManager, RuleSource};
use crate::error::{Error, Result};

/// Fetch timeout for the community feed.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetch the rule entries from a community feed URL.
pub async fn fetch_entries(url: &str) -> Result<Vec<RuleFileEntry>> {
    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(|e| Error::CommunityFetch {
            message: e.to_string(),
        })?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::CommunityFetch {
            message: e.to_string(),
        })?;

    if !response.status().is_success() {
        return Err(Error::CommunityFetch {
            message: format!("feed returned status {}", response.status()),
        });
    }

    response
        .json::<Vec<RuleFileEntry>>()
        .await
        .map_err(|e| Error::CommunityFetch {
            message: format!("invalid feed body: {e}"),
        })
}

/// Fetch the feed once and merge new rules into the manager.
/// Returns the number of rules added.
pub async fn refresh(manager: &RuleManager, url: &str) -> Result<usize> {
    let entries = fetch_entries(url).await?;
    let added = manager.merge_entries(&entries, RuleSource::Community);
    info!(url = url, fetched = entries.len(), added = added, "community rules refreshed");
    Ok(added)
}

/// Spawn the periodic refresh task. The returned handle aborts the task on
/// drop-by-`abort`; the task sleeps between ticks without holding any rule
/// lock.
pub fn spawn_refresh_task(
    manager: Arc<RuleManager>,
    url: String,
    interval_ms: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1_000)));
        // The first tick fires immediately; skip it so startup is not
        // coupled to feed availability.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = refresh(&manager, &url).await {
                warn!(error = %e, "community rules refresh failed, will retry");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_unreachable_host_errors() {
        let err = fetch_entries("https://127.0.0.1:1/rules.json")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommunityFetch { .. }));
    }

    #[tokio::test]
    async fn test_refresh_failure_leaves_manager_untouched() {
        let manager = RuleManager::with_builtin().unwrap();
        let before = manager.stats().total;
        let result = refresh(&manager, "https://127.0.0.1:1/rules.json").await;
        assert!(result.is_err());
        assert_eq!(manager.stats().total, before);
    }
}
