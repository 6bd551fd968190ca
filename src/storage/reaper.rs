//! Background Reaper
//!
//! Deadlines recorded by `EXPIRE` only take effect because this task removes
//! keys once their deadline passes. Nothing else evicts: reads do not check
//! deadlines.
//!
//! ## Design
//!
//! The reaper runs as a Tokio task and loops:
//! 1. Pops due entries from the root of the expiration index (up to a batch
//!    limit) and deletes those keys from both stores
//! 2. Sleeps until the next deadline or `max_interval`, whichever is sooner
//! 3. Wakes early when an `EXPIRE` inserts or moves a deadline, since the
//!    new one may be nearer than the one it was sleeping towards

use crate::storage::StorageEngine;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Configuration for the reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Longest sleep between passes (default: 100ms)
    pub max_interval: Duration,

    /// Most keys removed per pass before yielding (default: 256)
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            max_interval: Duration::from_millis(100),
            batch_size: 256,
        }
    }
}

/// A handle to the running reaper.
///
/// When this handle is dropped, the reaper task will be stopped.
#[derive(Debug)]
pub struct Reaper {
    shutdown_tx: watch::Sender<bool>,
}

impl Reaper {
    /// Starts the reaper as a background task.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use tidekv::storage::{Reaper, ReaperConfig, StorageEngine};
    /// use std::sync::Arc;
    ///
    /// let engine = Arc::new(StorageEngine::new());
    /// let reaper = Reaper::start(engine, ReaperConfig::default());
    ///
    /// // Dropping the handle stops the task
    /// drop(reaper);
    /// ```
    pub fn start(engine: Arc<StorageEngine>, config: ReaperConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(reaper_loop(engine, config, shutdown_rx));

        info!("Background reaper started");

        Self { shutdown_tx }
    }

    /// Stops the reaper.
    ///
    /// This is called automatically when the handle is dropped.
    pub fn stop(&self) {
        if self.shutdown_tx.send(true).is_ok() {
            info!("Background reaper stopped");
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn reaper_loop(
    engine: Arc<StorageEngine>,
    config: ReaperConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let now = Instant::now();
        let result = engine.reap_expired(now, config.batch_size);

        if result.reaped > 0 {
            debug!(
                reaped = result.reaped,
                pending = engine.stats().pending_expirations,
                "Expired keys removed"
            );
        }

        let sleep_for = match result.next_deadline {
            Some(deadline) => deadline
                .saturating_duration_since(now)
                .min(config.max_interval),
            None => config.max_interval,
        };
        trace!(sleep_ms = sleep_for.as_millis() as u64, "Reaper sleeping");

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = engine.expiry_changed().notified() => {
                trace!("Deadline changed, waking reaper");
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Reaper received shutdown signal");
                    return;
                }
            }
        }
    }
}

/// Starts the reaper with default configuration.
pub fn start_reaper(engine: Arc<StorageEngine>) -> Reaper {
    Reaper::start(engine, ReaperConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::expiry::{deadline_after, ExpirePolicy};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_reaper_removes_past_due_keys() {
        let engine = Arc::new(StorageEngine::new());
        let now = Instant::now();

        engine.set(Bytes::from("scalar"), Bytes::from("v"));
        engine.hset(Bytes::from("hash"), Bytes::from("f"), Bytes::from("v"));
        engine.set(Bytes::from("persistent"), Bytes::from("v"));

        engine
            .expire(Bytes::from("scalar"), deadline_after(now, -5), ExpirePolicy::Nx)
            .unwrap();
        engine
            .expire(Bytes::from("hash"), deadline_after(now, -5), ExpirePolicy::Nx)
            .unwrap();

        let config = ReaperConfig {
            max_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let _reaper = Reaper::start(Arc::clone(&engine), config);

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(engine.get(b"scalar"), None);
        assert_eq!(engine.hgetall(b"hash"), None);
        assert_eq!(engine.get(b"persistent"), Some(Bytes::from("v")));
        assert_eq!(engine.stats().pending_expirations, 0);
        assert_eq!(engine.stats().expired, 2);
    }

    #[tokio::test]
    async fn test_reaper_wakes_on_nearer_deadline() {
        let engine = Arc::new(StorageEngine::new());

        // long sleep so only the notification can explain a prompt removal
        let config = ReaperConfig {
            max_interval: Duration::from_secs(30),
            ..Default::default()
        };
        let _reaper = Reaper::start(Arc::clone(&engine), config);
        tokio::time::sleep(Duration::from_millis(20)).await;

        engine.set(Bytes::from("key"), Bytes::from("v"));
        engine
            .expire(
                Bytes::from("key"),
                Instant::now() + Duration::from_millis(30),
                ExpirePolicy::Nx,
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(engine.get(b"key"), None);
    }

    #[tokio::test]
    async fn test_reaper_stops_on_drop() {
        let engine = Arc::new(StorageEngine::new());

        let config = ReaperConfig {
            max_interval: Duration::from_millis(10),
            ..Default::default()
        };

        {
            let _reaper = Reaper::start(Arc::clone(&engine), config);
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        engine.set(Bytes::from("key"), Bytes::from("value"));
        engine
            .expire(Bytes::from("key"), Instant::now(), ExpirePolicy::Nx)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        // nothing evicts once the reaper is gone
        assert_eq!(engine.get(b"key"), Some(Bytes::from("value")));
    }
}
