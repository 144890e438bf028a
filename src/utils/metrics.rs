use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::info;

/// How a page was fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchPath {
    Http,
    Browser,
}

/// Counters for one fetch path
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathStats {
    pub fetched: usize,
    pub failed: usize,
    pub bytes: usize,
    /// Sum of fetch durations, for the average
    pub total_ms: u64,
}

impl PathStats {
    pub fn average_ms(&self) -> u64 {
        let attempts = (self.fetched + self.failed) as u64;
        if attempts == 0 {
            0
        } else {
            self.total_ms / attempts
        }
    }
}

/// Snapshot of what the agent did since start
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Stats {
    pub start_time: DateTime<Utc>,

    pub paths: HashMap<FetchPath, PathStats>,

    /// URLs given up on after every attempt failed
    pub abandoned: usize,

    /// Session snapshots written to disk
    pub session_captures: usize,

    /// Broker tasks handled (task type -> (succeeded, failed))
    pub tasks: HashMap<String, (usize, usize)>,
}

/// Shared, cheaply cloned crawl statistics
#[derive(Debug, Clone)]
pub struct CrawlStats {
    stats: Arc<Mutex<Stats>>,
}

impl Default for CrawlStats {
    fn default() -> Self {
        Self::new()
    }
}

impl CrawlStats {
    pub fn new() -> Self {
        let stats = Stats {
            start_time: Utc::now(),
            ..Default::default()
        };

        Self {
            stats: Arc::new(Mutex::new(stats)),
        }
    }

    /// Record one fetch attempt
    pub async fn record_fetch(&self, path: FetchPath, success: bool, bytes: usize, duration_ms: u64) {
        let mut stats = self.stats.lock().await;
        let entry = stats.paths.entry(path).or_default();

        if success {
            entry.fetched += 1;
        } else {
            entry.failed += 1;
        }
        entry.bytes += bytes;
        entry.total_ms += duration_ms;
    }

    pub async fn record_abandoned(&self) {
        self.stats.lock().await.abandoned += 1;
    }

    pub async fn record_session_capture(&self) {
        self.stats.lock().await.session_captures += 1;
    }

    pub async fn record_task(&self, task_type: &str, success: bool) {
        let mut stats = self.stats.lock().await;
        let entry = stats.tasks.entry(task_type.to_string()).or_default();
        if success {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
    }

    /// Start timing a fetch
    pub fn start_timer(&self) -> RequestTimer {
        RequestTimer {
            start: Instant::now(),
        }
    }

    pub async fn snapshot(&self) -> Stats {
        self.stats.lock().await.clone()
    }

    /// Log a one-screen summary
    pub async fn log_summary(&self) {
        let stats = self.snapshot().await;
        let elapsed = (Utc::now() - stats.start_time).num_seconds();

        info!("Crawl summary after {}s", elapsed);
        for (path, counters) in &stats.paths {
            info!(
                "  {:?}: {} fetched, {} failed, {} bytes, {} ms average",
                path,
                counters.fetched,
                counters.failed,
                counters.bytes,
                counters.average_ms()
            );
        }
        for (task_type, (ok, failed)) in &stats.tasks {
            info!("  {} tasks: {} succeeded, {} failed", task_type, ok, failed);
        }
        info!("  {} URLs abandoned, {} session captures", stats.abandoned, stats.session_captures);
    }
}

/// Measures one request
pub struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    /// Milliseconds since the timer started
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
