use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::task::JoinHandle;

use crate::sessions::SessionRegistry;

/// Periodically evicts sessions whose access token has expired.
#[derive(Clone)]
pub struct SessionSweeper {
    sessions: SessionRegistry,
    interval: Duration,
    runs: Arc<AtomicU64>,
}

impl SessionSweeper {
    pub fn new(sessions: SessionRegistry, interval: Duration) -> Self {
        Self {
            sessions,
            interval,
            runs: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "session sweeper started");
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.interval).await;
                self.tick();
            }
        })
    }

    pub fn tick(&self) -> usize {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.sessions.evict_expired_sessions()
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }
}
