//! Echo-token bookkeeping for outbound commands.
//!
//! Every command sent on the api channel carries a token. The token stays in
//! the [`CorrelationTable`] until the matching response arrives or a periodic
//! sweep declares it expired.

use std::{
    collections::HashMap,
    sync::{
        Arc, LazyLock, Mutex, MutexGuard,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use {
    tokio::{task::JoinHandle, time::Instant},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

static NEXT_TOKEN: LazyLock<AtomicI64> =
    LazyLock::new(|| AtomicI64::new(chrono::Utc::now().timestamp_millis()));

/// Fresh echo token, unique for the life of the process.
pub fn next_token() -> i64 {
    NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
}

pub struct CorrelationTable {
    pending: Mutex<HashMap<i64, Instant>>,
    timeout: Duration,
}

impl CorrelationTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<i64, Instant>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, token: i64) {
        self.pending().insert(token, Instant::now());
    }

    /// Drop `token`. Returns `false` for unknown or already expired tokens.
    pub fn resolve(&self, token: i64) -> bool {
        self.pending().remove(&token).is_some()
    }

    pub fn contains(&self, token: i64) -> bool {
        self.pending().contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    /// Remove every token older than the timeout, logging each one.
    pub fn sweep_expired(&self) -> Vec<i64> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.pending().retain(|&token, sent_at| {
            let keep = now.duration_since(*sent_at) <= self.timeout;
            if !keep {
                expired.push(token);
            }
            keep
        });
        expired.sort_unstable();
        for token in &expired {
            warn!(echo = token, "command timed out waiting for a response");
        }
        expired
    }

    /// Run [`Self::sweep_expired`] every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("correlation sweeper stopped");
                        return;
                    },
                    _ = ticker.tick() => {
                        table.sweep_expired();
                    },
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn resolved_token_is_not_swept() {
        let table = CorrelationTable::new(TIMEOUT);
        table.register(7);
        assert!(table.resolve(7));
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(table.sweep_expired().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn only_stale_tokens_expire() {
        let table = CorrelationTable::new(TIMEOUT);
        table.register(1);
        tokio::time::advance(Duration::from_secs(20)).await;
        table.register(2);
        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(table.sweep_expired(), vec![1]);
        assert!(table.contains(2));
        assert!(!table.resolve(1));
    }

    #[tokio::test(start_paused = true)]
    async fn token_at_exact_timeout_survives() {
        let table = CorrelationTable::new(TIMEOUT);
        table.register(3);
        tokio::time::advance(TIMEOUT).await;
        assert!(table.sweep_expired().is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn resolving_unknown_token_is_noop() {
        let table = CorrelationTable::new(TIMEOUT);
        assert!(!table.resolve(99));
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_on_interval() {
        let table = Arc::new(CorrelationTable::new(Duration::from_secs(5)));
        let cancel = CancellationToken::new();
        let handle = table.spawn_sweeper(Duration::from_secs(10), cancel.clone());

        table.register(42);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(table.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn tokens_are_unique() {
        let mut seen: Vec<i64> = (0..1000).map(|_| next_token()).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 1000);
    }
}
