//! The worker loop: consumers pull check tasks, a bounded pool runs them and
//! a single sender publishes the results.

mod transport;

pub use transport::{
    ChannelResultSink, ChannelTaskSource, ResultSink, SpoolResultSink, SpoolTaskSource,
    TaskSource, read_results,
};
#[cfg(test)]
pub use transport::{MockResultSink, MockTaskSource};

use std::sync::Arc;

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};

use crate::check::CheckOrchestrator;
use crate::messages::{CheckTaskMessage, ResultMessage};

/// Results waiting for the sender before checks block.
pub const RESULT_QUEUE_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub received: usize,
    pub malformed: usize,
    pub published: usize,
}

pub struct Worker {
    orchestrator: Arc<CheckOrchestrator>,
    consumers: usize,
    pool: Arc<Semaphore>,
}

impl Worker {
    /// A worker running at most `pool_size` checks at a time.
    pub fn new(orchestrator: Arc<CheckOrchestrator>, consumers: usize, pool_size: usize) -> Self {
        Self {
            orchestrator,
            consumers: consumers.max(1),
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
        }
    }

    /// Runs until `source` is exhausted and every accepted task has been
    /// published.
    pub async fn run(
        &self,
        source: Arc<dyn TaskSource>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<WorkerStats> {
        let (results, mut queue) = mpsc::channel::<ResultMessage>(RESULT_QUEUE_SIZE);

        let sender = tokio::spawn(async move {
            let mut published = 0;
            while let Some(result) = queue.recv().await {
                match sink.publish(&result).await {
                    Ok(()) => published += 1,
                    Err(e) => error!("Failed to publish result for {}: {:#}", result.package().name, e),
                }
            }
            published
        });

        let mut consumers = JoinSet::new();
        for id in 0..self.consumers {
            consumers.spawn(consume(
                id,
                Arc::clone(&source),
                Arc::clone(&self.pool),
                Arc::clone(&self.orchestrator),
                results.clone(),
            ));
        }
        drop(results);

        let mut stats = WorkerStats::default();
        while let Some(joined) = consumers.join_next().await {
            let (received, malformed) = joined?;
            stats.received += received;
            stats.malformed += malformed;
        }
        stats.published = sender.await?;
        info!(
            "Worker finished: {} task(s) received, {} malformed, {} result(s) published",
            stats.received, stats.malformed, stats.published
        );
        Ok(stats)
    }
}

/// Pulls tasks until the source is exhausted. A pool permit is taken before
/// each pull so no more tasks are accepted than can run.
async fn consume(
    id: usize,
    source: Arc<dyn TaskSource>,
    pool: Arc<Semaphore>,
    orchestrator: Arc<CheckOrchestrator>,
    results: mpsc::Sender<ResultMessage>,
) -> (usize, usize) {
    let mut received = 0;
    let mut malformed = 0;
    let mut running = JoinSet::new();

    loop {
        reap_finished(&mut running);
        let Ok(permit) = Arc::clone(&pool).acquire_owned().await else {
            break;
        };
        let payload = match source.next_task().await {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(e) => {
                error!("Consumer {} stopped: {:#}", id, e);
                break;
            }
        };
        received += 1;

        let task: CheckTaskMessage = match serde_json::from_str(&payload) {
            Ok(task) => task,
            Err(e) => {
                warn!("Dropping malformed task: {}", e);
                malformed += 1;
                continue;
            }
        };
        debug!("Consumer {} accepted {}", id, task.package.label());

        let orchestrator = Arc::clone(&orchestrator);
        let results = results.clone();
        running.spawn(async move {
            let _permit = permit;
            let result = orchestrator.check_task(&task).await;
            if results.send(result).await.is_err() {
                error!("Result queue closed before {} was sent", task.package.label());
            }
        });
    }

    while let Some(joined) = running.join_next().await {
        report(joined);
    }
    (received, malformed)
}

/// Collects the checks that already finished. Returns how many there were.
fn reap_finished(running: &mut JoinSet<()>) -> usize {
    let mut reaped = 0;
    while let Some(joined) = running.try_join_next() {
        report(joined);
        reaped += 1;
    }
    reaped
}

fn report(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!("Check task panicked: {}", e);
    }
}
