//! Background job: forget links older than the retention window.
//!
//! Runs once at startup and then every `interval`. A failed sweep is logged
//! and retried on the next tick.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

use crate::store::SlugStore;

/// Spawn the background sweep task. Call this once at startup.
pub fn spawn(store: SlugStore, retention: Duration, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            // First tick completes immediately.
            interval.tick().await;
            sweep(&store, retention).await;
        }
    })
}

/// One sweep; returns how many links were removed.
pub async fn sweep(store: &SlugStore, retention: Duration) -> u64 {
    match store.purge_expired(retention).await {
        Ok(0) => {
            tracing::debug!("link sweep: nothing expired");
            0
        }
        Ok(removed) => {
            tracing::info!(rows = removed, "link sweep: removed expired links");
            removed
        }
        Err(e) => {
            tracing::error!("link sweep failed: {}", e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawned_sweep_runs_immediately() {
        let store = SlugStore::connect("sqlite::memory:").await.unwrap();
        let slug = store.get_or_create_slug("old").await.unwrap();
        sqlx::query("UPDATE links SET created_at = created_at - 100000")
            .execute(store.pool())
            .await
            .unwrap();

        let handle = spawn(store.clone(), Duration::from_secs(3600), Duration::from_secs(3600));

        let mut gone = false;
        for _ in 0..50 {
            if store.resolve_slug(&slug).await.unwrap().is_none() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();
        assert!(gone, "startup sweep should remove the stale link");
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_links() {
        let store = SlugStore::connect("sqlite::memory:").await.unwrap();
        let slug = store.get_or_create_slug("fresh").await.unwrap();
        assert_eq!(sweep(&store, Duration::from_secs(3600)).await, 0);
        assert_eq!(
            store.resolve_slug(&slug).await.unwrap().as_deref(),
            Some("fresh")
        );
    }
}
