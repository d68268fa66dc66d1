//! Implementations of the `pkgcheck` subcommands.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::config::{REGISTRY_SOURCE_TYPE, WorkerConfig};
use crate::coordinator::{
    CheckTaskPlanner, MemoryResultStore, PackageContext, ReconcileOutcome, ResultStore,
    RevisionReconciler,
};
use crate::messages::{CheckTaskMessage, PackageReference, RepositoryReference, ResultMessage};
use crate::runtime::Runtime;
use crate::worker::{SpoolResultSink, SpoolTaskSource, Worker, WorkerStats, read_results};

fn history(runtime: Arc<dyn Runtime>, config: &WorkerConfig) -> Result<Arc<MemoryResultStore>> {
    Ok(Arc::new(MemoryResultStore::open(runtime, config.history_file())?))
}

/// Works through the spool. With `poll` the worker keeps waiting for tasks.
pub async fn worker(
    runtime: Arc<dyn Runtime>,
    config: &WorkerConfig,
    poll: Option<Duration>,
) -> Result<WorkerStats> {
    let spool = config.spool_dir();
    let mut source = SpoolTaskSource::new(Arc::clone(&runtime), spool.clone())?;
    if let Some(interval) = poll {
        source = source.polling(interval);
    }
    let sink = SpoolResultSink::new(Arc::clone(&runtime), &spool);

    let orchestrator = config.check_orchestrator(runtime)?;
    let worker = Worker::new(Arc::new(orchestrator), config.consumers, config.pool_size);
    worker.run(Arc::new(source), Arc::new(sink)).await
}

/// Checks one package right away.
pub async fn check(
    runtime: Arc<dyn Runtime>,
    config: &WorkerConfig,
    package: PackageReference,
) -> Result<ResultMessage> {
    let task = CheckTaskMessage {
        context_ref: None,
        package,
        dependencies: Vec::new(),
        default_repository: Some(RepositoryReference::new(REGISTRY_SOURCE_TYPE)),
        installer: config.installer_spec().reference(),
    };
    let orchestrator = config.check_orchestrator(runtime)?;
    Ok(orchestrator.check_task(&task).await)
}

pub fn add_context(
    runtime: Arc<dyn Runtime>,
    config: &WorkerConfig,
    name: &str,
) -> Result<PackageContext> {
    let context = history(runtime, config)?.create_context(name)?;
    info!("Created context {} with id {}", context.name, context.id);
    Ok(context)
}

/// Queues check tasks for `packages` in the spool.
pub fn plan(
    runtime: Arc<dyn Runtime>,
    config: &WorkerConfig,
    context_id: u64,
    packages: &[String],
) -> Result<Vec<PathBuf>> {
    let planner = CheckTaskPlanner::new(
        history(Arc::clone(&runtime), config)?,
        RepositoryReference::new(REGISTRY_SOURCE_TYPE),
        config.installer_spec().reference(),
    );

    let incoming = config.spool_dir().join("incoming");
    runtime.create_dir_all(&incoming)?;
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();

    let mut written = Vec::with_capacity(packages.len());
    for (index, package) in packages.iter().enumerate() {
        let task = planner.plan(context_id, package)?;
        let path = incoming.join(format!("{stamp}-{index:04}-{context_id}-{package}.json"));
        runtime
            .write_atomic(&path, &serde_json::to_vec_pretty(&task)?)
            .with_context(|| format!("Failed to queue task {}", path.display()))?;
        info!("Queued {} in context {}", package, context_id);
        written.push(path);
    }
    Ok(written)
}

/// Merges the results waiting in the spool into the history. Merged files
/// move to `processed/`, results contradicting the history to `rejected/`.
pub async fn reconcile(
    runtime: Arc<dyn Runtime>,
    config: &WorkerConfig,
) -> Result<Vec<(String, ReconcileOutcome)>> {
    let spool = config.spool_dir();
    let reconciler = RevisionReconciler::new(history(Arc::clone(&runtime), config)?);

    let mut outcomes = Vec::new();
    for (path, result) in read_results(runtime.as_ref(), &spool)? {
        let target = match reconciler.reconcile(&result).await {
            Ok(outcome) => {
                outcomes.push((result.package().name.clone(), outcome));
                spool.join("processed")
            }
            Err(e @ crate::Error::RevisionInconsistency { .. }) => {
                warn!("Rejected result {}: {}", path.display(), e);
                spool.join("rejected")
            }
            Err(e) => return Err(e.into()),
        };
        runtime.create_dir_all(&target)?;
        if let Some(name) = path.file_name() {
            runtime.rename(&path, &target.join(name))?;
        }
    }
    Ok(outcomes)
}
