//! Transports carrying check tasks to workers and results back.
//!
//! Tasks travel as raw JSON text so that the worker decides what to do
//! with payloads it cannot decode.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::{Mutex, mpsc};

use crate::messages::ResultMessage;
use crate::runtime::Runtime;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// The next task payload, or `None` once the source is exhausted.
    async fn next_task(&self) -> Result<Option<String>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn publish(&self, result: &ResultMessage) -> Result<()>;
}

/// In-process task queue. Exhausted once every sender is dropped.
pub struct ChannelTaskSource {
    receiver: Mutex<mpsc::Receiver<String>>,
}

impl ChannelTaskSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<String>, Self) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            sender,
            Self {
                receiver: Mutex::new(receiver),
            },
        )
    }
}

#[async_trait]
impl TaskSource for ChannelTaskSource {
    async fn next_task(&self) -> Result<Option<String>> {
        Ok(self.receiver.lock().await.recv().await)
    }
}

pub struct ChannelResultSink {
    sender: mpsc::Sender<ResultMessage>,
}

impl ChannelResultSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ResultMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl ResultSink for ChannelResultSink {
    async fn publish(&self, result: &ResultMessage) -> Result<()> {
        self.sender
            .send(result.clone())
            .await
            .map_err(|_| anyhow::anyhow!("Result receiver is closed"))
    }
}

/// Directory spool: tasks are `incoming/*.json` files, claimed by moving
/// them to `claimed/`.
pub struct SpoolTaskSource {
    runtime: Arc<dyn Runtime>,
    spool: PathBuf,
    pattern: glob::Pattern,
    poll_interval: Option<Duration>,
}

impl SpoolTaskSource {
    /// A source that is exhausted as soon as `incoming/` is empty.
    pub fn new(runtime: Arc<dyn Runtime>, spool: PathBuf) -> Result<Self> {
        Ok(Self {
            runtime,
            spool,
            pattern: glob::Pattern::new("*.json").context("Invalid spool pattern")?,
            poll_interval: None,
        })
    }

    /// Keeps waiting for new files instead of finishing on an empty spool.
    pub fn polling(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    fn incoming(&self) -> PathBuf {
        self.spool.join("incoming")
    }

    /// Claims the first pending file, skipping files another consumer won.
    fn claim(&self) -> Result<Option<(PathBuf, String)>> {
        let incoming = self.incoming();
        if !self.runtime.exists(&incoming) {
            return Ok(None);
        }
        let mut pending: Vec<PathBuf> = self
            .runtime
            .read_dir(&incoming)?
            .into_iter()
            .filter(|path| {
                path.file_name()
                    .is_some_and(|name| self.pattern.matches(&name.to_string_lossy()))
            })
            .collect();
        pending.sort();

        let claimed_dir = self.spool.join("claimed");
        self.runtime.create_dir_all(&claimed_dir)?;
        for path in pending {
            let Some(name) = path.file_name() else {
                continue;
            };
            let claimed = claimed_dir.join(name);
            if let Err(e) = self.runtime.rename(&path, &claimed) {
                debug!("Skipping {}: {}", path.display(), e);
                continue;
            }
            let payload = self.runtime.read_to_string(&claimed)?;
            debug!("Claimed {}", claimed.display());
            return Ok(Some((claimed, payload)));
        }
        Ok(None)
    }
}

#[async_trait]
impl TaskSource for SpoolTaskSource {
    async fn next_task(&self) -> Result<Option<String>> {
        loop {
            if let Some((_, payload)) = self.claim()? {
                return Ok(Some(payload));
            }
            let Some(interval) = self.poll_interval else {
                return Ok(None);
            };
            tokio::time::sleep(interval).await;
        }
    }
}

/// Writes every result as a JSON file into `outgoing/`.
pub struct SpoolResultSink {
    runtime: Arc<dyn Runtime>,
    outgoing: PathBuf,
    sequence: AtomicU64,
}

impl SpoolResultSink {
    pub fn new(runtime: Arc<dyn Runtime>, spool: &Path) -> Self {
        Self {
            runtime,
            outgoing: spool.join("outgoing"),
            sequence: AtomicU64::new(0),
        }
    }

    fn file_name(&self, result: &ResultMessage) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let package: String = result
            .package()
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
            .collect();
        format!("{millis}-{sequence:04}-{package}.json")
    }
}

#[async_trait]
impl ResultSink for SpoolResultSink {
    async fn publish(&self, result: &ResultMessage) -> Result<()> {
        self.runtime.create_dir_all(&self.outgoing)?;
        let path = self.outgoing.join(self.file_name(result));
        let json = serde_json::to_vec_pretty(result)?;
        self.runtime
            .write_atomic(&path, &json)
            .with_context(|| format!("Failed to write result {}", path.display()))?;
        debug!("Wrote result {}", path.display());
        Ok(())
    }
}

/// Reads the result files of a spool, oldest first. Unreadable files are
/// skipped with a warning.
pub fn read_results(runtime: &dyn Runtime, spool: &Path) -> Result<Vec<(PathBuf, ResultMessage)>> {
    let outgoing = spool.join("outgoing");
    if !runtime.exists(&outgoing) {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = runtime
        .read_dir(&outgoing)?
        .into_iter()
        .filter(|p| p.extension().is_some_and(|e| e == "json"))
        .collect();
    paths.sort();

    let mut results = Vec::with_capacity(paths.len());
    for path in paths {
        let content = runtime.read_to_string(&path)?;
        match serde_json::from_str(&content) {
            Ok(result) => results.push((path, result)),
            Err(e) => warn!("Skipping unreadable result {}: {}", path.display(), e),
        }
    }
    Ok(results)
}
