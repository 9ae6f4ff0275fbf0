//! Batch-by-batch parallel execution of features.
//!
//! Every feature of a batch is spawned at once; a semaphore bounds how many
//! run their worker concurrently. The next batch starts only after every
//! member of the current one has an outcome and its code has been merged
//! into the shared store, so later features build on earlier output.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::scheduler::{Batch, DependencyResolver};
use crate::cache::ResultCache;
use crate::events::{EngineEvent, EventSink};
use crate::feature::Feature;
use crate::orchestrator::{
    FeatureFailure, FeatureOutcome, FeatureStatus, ProgressSnapshot,
};
use crate::retry::ErrorClass;
use crate::store::{CodeSnapshot, CodeStore, MergeReport};

/// Executes one feature to a terminal outcome.
///
/// Implementations must not panic and should observe `cancel` between
/// suspension points, returning a `Cancelled` outcome once it fires.
#[async_trait]
pub trait FeatureWorker: Send + Sync {
    async fn execute(
        &self,
        feature: Feature,
        batch: usize,
        codebase: CodeSnapshot,
        cancel: CancellationToken,
    ) -> FeatureOutcome;
}

/// Outcomes and merge results of one batch.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub index: usize,
    /// In batch (input) order
    pub outcomes: Vec<FeatureOutcome>,
    /// Merge result per GREEN feature, in merge order
    pub merges: Vec<(String, MergeReport)>,
    pub duration_ms: u64,
}

impl BatchReport {
    pub fn count(&self, status: FeatureStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchResults {
    pub batches: Vec<BatchReport>,
}

impl BatchResults {
    pub fn outcomes(&self) -> impl Iterator<Item = &FeatureOutcome> {
        self.batches.iter().flat_map(|b| b.outcomes.iter())
    }

    pub fn into_outcomes(self) -> Vec<FeatureOutcome> {
        self.batches.into_iter().flat_map(|b| b.outcomes).collect()
    }

    pub fn status_of(&self, feature_id: &str) -> Option<FeatureStatus> {
        self.outcomes()
            .find(|o| o.feature_id == feature_id)
            .map(|o| o.status)
    }

    pub fn all_green(&self) -> bool {
        self.outcomes().all(FeatureOutcome::is_green)
    }
}

/// Runs an execution plan batch by batch under a worker-count limit.
pub struct ParallelScheduler {
    max_concurrency: usize,
    store: Arc<CodeStore>,
    cache: Option<Arc<ResultCache>>,
    sink: Option<Arc<dyn EventSink>>,
    cancel: CancellationToken,
    progress: Arc<Mutex<ProgressSnapshot>>,
}

impl ParallelScheduler {
    pub fn new(max_concurrency: usize, store: Arc<CodeStore>) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            store,
            cache: None,
            sink: None,
            cancel: CancellationToken::new(),
            progress: Arc::new(Mutex::new(ProgressSnapshot::default())),
        }
    }

    /// Cache whose entries are invalidated when merged code displaces a feature's files.
    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Share a progress snapshot that is updated as features start and finish.
    pub fn with_progress(mut self, progress: Arc<Mutex<ProgressSnapshot>>) -> Self {
        self.progress = progress;
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(ref sink) = self.sink {
            sink.emit(event);
        }
    }

    fn update_progress(&self, f: impl FnOnce(&mut ProgressSnapshot)) {
        f(&mut self.progress.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Execute every batch of the resolver's plan with `worker`.
    pub async fn run(
        &self,
        resolver: &DependencyResolver,
        worker: Arc<dyn FeatureWorker>,
    ) -> BatchResults {
        let plan = resolver.plan();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut statuses: HashMap<String, FeatureStatus> = HashMap::new();
        let mut results = BatchResults::default();

        self.update_progress(|p| p.total = plan.feature_count());

        for batch in &plan.batches {
            let report = self
                .run_batch(batch, resolver, &worker, &semaphore, &mut statuses)
                .await;
            results.batches.push(report);
        }

        self.update_progress(|p| p.current_batch = None);
        results
    }

    async fn run_batch(
        &self,
        batch: &Batch,
        resolver: &DependencyResolver,
        worker: &Arc<dyn FeatureWorker>,
        semaphore: &Arc<Semaphore>,
        statuses: &mut HashMap<String, FeatureStatus>,
    ) -> BatchReport {
        let started = Instant::now();
        tracing::info!(batch = batch.index, features = ?batch.feature_ids, "starting batch");
        self.emit(EngineEvent::BatchStarted {
            batch: batch.index,
            features: batch.feature_ids.clone(),
        });
        self.update_progress(|p| p.current_batch = Some(batch.index));

        // Every prior batch is merged, so one snapshot serves the whole batch.
        let codebase = match self.store.snapshot().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::error!(batch = batch.index, error = %e, "failed to snapshot shared code store");
                None
            }
        };

        let mut slots: Vec<Slot> = Vec::with_capacity(batch.len());
        for feature_id in &batch.feature_ids {
            let slot = if self.cancel.is_cancelled() {
                Slot::Done(FeatureOutcome::skipped(feature_id, batch.index, "run cancelled"))
            } else if let Some(feature) = resolver.feature(feature_id) {
                match (blocking_dependency(feature, statuses), &codebase) {
                    (Some(reason), _) => {
                        Slot::Done(FeatureOutcome::skipped(feature_id, batch.index, &reason))
                    }
                    (None, None) => Slot::Done(FeatureOutcome::failed(
                        feature_id,
                        batch.index,
                        FeatureFailure::new(
                            ErrorClass::StorageError,
                            "shared code store could not be read",
                        ),
                    )),
                    (None, Some(codebase)) => Slot::Running(self.spawn_feature(
                        feature.clone(),
                        batch.index,
                        codebase.clone(),
                        worker,
                        semaphore,
                    )),
                }
            } else {
                Slot::Done(FeatureOutcome::failed(
                    feature_id,
                    batch.index,
                    FeatureFailure::new(ErrorClass::MalformedFeature, "feature missing from plan"),
                ))
            };
            slots.push(slot);
        }

        let mut outcomes = Vec::with_capacity(slots.len());
        for (feature_id, slot) in batch.feature_ids.iter().zip(slots) {
            let outcome = match slot {
                Slot::Done(outcome) => outcome,
                Slot::Running(handle) => match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!(feature = %feature_id, error = %e, "feature task aborted");
                        FeatureOutcome::failed(
                            feature_id,
                            batch.index,
                            FeatureFailure::new(
                                ErrorClass::ContractViolation,
                                format!("feature task aborted: {}", e),
                            ),
                        )
                    }
                },
            };
            outcomes.push(outcome);
        }

        let merges = self.merge_outcomes(&mut outcomes).await;

        for outcome in &outcomes {
            statuses.insert(outcome.feature_id.clone(), outcome.status);
            self.update_progress(|p| p.record(outcome.status));
            if matches!(outcome.status, FeatureStatus::Failed | FeatureStatus::Cancelled) {
                let blocked = resolver.transitive_dependents(&outcome.feature_id);
                if !blocked.is_empty() {
                    tracing::warn!(feature = %outcome.feature_id, blocked = ?blocked, "dependents will be skipped");
                }
            }
            self.emit(EngineEvent::FeatureFinished {
                feature: outcome.feature_id.clone(),
                status: outcome.status,
                attempts: outcome.attempts,
                elapsed_ms: outcome.elapsed_ms,
            });
        }

        let report = BatchReport {
            index: batch.index,
            outcomes,
            merges,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            batch = batch.index,
            green = report.count(FeatureStatus::Green),
            failed = report.count(FeatureStatus::Failed),
            skipped = report.count(FeatureStatus::Skipped),
            cancelled = report.count(FeatureStatus::Cancelled),
            "batch complete"
        );
        self.emit(EngineEvent::BatchCompleted {
            batch: batch.index,
            green: report.count(FeatureStatus::Green),
            failed: report.count(FeatureStatus::Failed),
            skipped: report.count(FeatureStatus::Skipped),
            cancelled: report.count(FeatureStatus::Cancelled),
            duration_ms: report.duration_ms,
        });
        report
    }

    fn spawn_feature(
        &self,
        feature: Feature,
        batch: usize,
        codebase: CodeSnapshot,
        worker: &Arc<dyn FeatureWorker>,
        semaphore: &Arc<Semaphore>,
    ) -> JoinHandle<FeatureOutcome> {
        let worker = Arc::clone(worker);
        let semaphore = Arc::clone(semaphore);
        let cancel = self.cancel.clone();
        let sink = self.sink.clone();
        let progress = Arc::clone(&self.progress);

        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return FeatureOutcome::cancelled(&feature.id, batch);
            };
            if cancel.is_cancelled() {
                return FeatureOutcome::cancelled(&feature.id, batch);
            }

            if let Some(ref sink) = sink {
                sink.emit(EngineEvent::FeatureStarted {
                    feature: feature.id.clone(),
                    batch,
                });
            }
            progress
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .in_flight += 1;

            let outcome = worker.execute(feature, batch, codebase, cancel).await;

            let mut progress = progress.lock().unwrap_or_else(PoisonError::into_inner);
            progress.in_flight = progress.in_flight.saturating_sub(1);
            outcome
        })
    }

    /// Merge GREEN code into the shared store in batch order. Later features
    /// overwrite earlier ones on conflicting paths.
    async fn merge_outcomes(&self, outcomes: &mut [FeatureOutcome]) -> Vec<(String, MergeReport)> {
        let mut merges = Vec::new();

        for outcome in outcomes.iter_mut().filter(|o| o.is_green()) {
            let Some(code) = outcome.code.take() else {
                continue;
            };
            match self.store.merge(&code, &outcome.feature_id).await {
                Ok(report) => {
                    if !report.displaced_owners.is_empty() {
                        tracing::warn!(
                            feature = %outcome.feature_id,
                            displaced = ?report.displaced_owners,
                            "merged code overwrote files of other features"
                        );
                        if let Some(ref cache) = self.cache {
                            for owner in &report.displaced_owners {
                                cache.invalidate(owner);
                            }
                        }
                    }
                    tracing::debug!(
                        feature = %outcome.feature_id,
                        inserted = report.inserted.len(),
                        updated = report.updated.len(),
                        "merged feature code"
                    );
                    merges.push((outcome.feature_id.clone(), report));
                }
                Err(e) => {
                    tracing::error!(feature = %outcome.feature_id, error = %e, "failed to merge feature code");
                    outcome.status = FeatureStatus::Failed;
                    outcome.failure = Some(FeatureFailure::new(ErrorClass::StorageError, e.to_string()));
                }
            }
        }

        merges
    }
}

enum Slot {
    Done(FeatureOutcome),
    Running(JoinHandle<FeatureOutcome>),
}

/// Reason to skip `feature`, if one of its dependencies did not reach GREEN.
fn blocking_dependency(
    feature: &Feature,
    statuses: &HashMap<String, FeatureStatus>,
) -> Option<String> {
    feature.dependencies.iter().find_map(|dep| match statuses.get(dep) {
        Some(FeatureStatus::Green) => None,
        Some(status) => Some(format!("dependency '{}' is {}", dep, status)),
        None => Some(format!("dependency '{}' was not executed", dep)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::SourceFiles;
    use crate::events::MemorySink;
    use crate::store::StoreConfig;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    /// Writes `<id>.py` and goes GREEN unless the id is listed as failing.
    struct ScriptedWorker {
        failing: HashSet<String>,
        delay: Duration,
        running: AtomicUsize,
        peak: AtomicUsize,
        seen: Mutex<Vec<(String, usize)>>,
    }

    impl ScriptedWorker {
        fn new(failing: &[&str]) -> Self {
            Self {
                failing: failing.iter().map(|s| s.to_string()).collect(),
                delay: Duration::from_millis(0),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl FeatureWorker for ScriptedWorker {
        async fn execute(
            &self,
            feature: Feature,
            batch: usize,
            codebase: CodeSnapshot,
            cancel: CancellationToken,
        ) -> FeatureOutcome {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((feature.id.clone(), codebase.len()));
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if cancel.is_cancelled() {
                return FeatureOutcome::cancelled(&feature.id, batch);
            }
            if self.failing.contains(&feature.id) {
                return FeatureOutcome::failed(
                    &feature.id,
                    batch,
                    FeatureFailure::new(ErrorClass::MaxAttemptsExceeded, "scripted failure"),
                );
            }
            let mut files = SourceFiles::new();
            files.insert(format!("{}.py", feature.id), format!("# {}\n", feature.id));
            FeatureOutcome::green(&feature.id, batch, CodeSnapshot::new(files))
        }
    }

    fn store(dir: &std::path::Path) -> Arc<CodeStore> {
        Arc::new(CodeStore::new(StoreConfig {
            memory_threshold_bytes: 1024 * 1024,
            spill_dir: dir.join("spill"),
        }))
    }

    fn diamond() -> DependencyResolver {
        DependencyResolver::new(&[
            Feature::new("a", "A"),
            Feature::new("b", "B").with_dependencies(&["a"]),
            Feature::new("c", "C").with_dependencies(&["a"]),
            Feature::new("d", "D").with_dependencies(&["b", "c"]),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_batches_see_prior_code() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let worker = Arc::new(ScriptedWorker::new(&[]));
        let scheduler = ParallelScheduler::new(4, Arc::clone(&store));

        let results = scheduler.run(&diamond(), worker.clone()).await;

        assert!(results.all_green());
        assert_eq!(results.batches.len(), 3);
        assert_eq!(store.len().await, 4);

        let seen = worker.seen.lock().unwrap().clone();
        let codebase_of = |id: &str| seen.iter().find(|(f, _)| f == id).unwrap().1;
        assert_eq!(codebase_of("a"), 0);
        assert_eq!(codebase_of("b"), 1);
        assert_eq!(codebase_of("c"), 1);
        assert_eq!(codebase_of("d"), 3);
        assert_eq!(store.owner("d.py").await.as_deref(), Some("d"));
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let dir = tempdir().unwrap();
        let worker = Arc::new(ScriptedWorker::new(&["b"]));
        let scheduler = ParallelScheduler::new(2, store(dir.path()));

        let results = scheduler.run(&diamond(), worker).await;

        assert_eq!(results.status_of("a"), Some(FeatureStatus::Green));
        assert_eq!(results.status_of("b"), Some(FeatureStatus::Failed));
        assert_eq!(results.status_of("c"), Some(FeatureStatus::Green));
        assert_eq!(results.status_of("d"), Some(FeatureStatus::Skipped));

        let d = results.outcomes().find(|o| o.feature_id == "d").unwrap();
        assert_eq!(d.skip_reason.as_deref(), Some("dependency 'b' is failed"));
        assert!(!results.all_green());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let dir = tempdir().unwrap();
        let features: Vec<Feature> = (0..6)
            .map(|i| Feature::new(&format!("f{}", i), "F"))
            .collect();
        let resolver = DependencyResolver::new(&features).unwrap();
        let worker = Arc::new(ScriptedWorker::new(&[]).with_delay(Duration::from_millis(30)));
        let scheduler = ParallelScheduler::new(2, store(dir.path()));

        let results = scheduler.run(&resolver, worker.clone()).await;

        assert_eq!(results.batches.len(), 1);
        assert!(results.all_green());
        assert!(worker.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(worker.seen.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_remaining_batches() {
        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let worker = Arc::new(ScriptedWorker::new(&[]));
        let scheduler =
            ParallelScheduler::new(2, store(dir.path())).with_cancellation(cancel);

        let results = scheduler.run(&diamond(), worker.clone()).await;

        assert!(results
            .outcomes()
            .all(|o| o.status == FeatureStatus::Skipped));
        assert!(worker.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_events_and_progress() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(MemorySink::new());
        let progress = Arc::new(Mutex::new(ProgressSnapshot::default()));
        let scheduler = ParallelScheduler::new(2, store(dir.path()))
            .with_sink(sink.clone())
            .with_progress(Arc::clone(&progress));

        scheduler
            .run(&diamond(), Arc::new(ScriptedWorker::new(&["c"])))
            .await;

        assert_eq!(
            sink.count(|e| matches!(e, EngineEvent::BatchStarted { .. })),
            3
        );
        assert_eq!(
            sink.count(|e| matches!(e, EngineEvent::FeatureStarted { .. })),
            3
        );
        assert_eq!(
            sink.count(|e| matches!(e, EngineEvent::FeatureFinished { .. })),
            4
        );

        let progress = progress.lock().unwrap().clone();
        assert_eq!(progress.total, 4);
        assert_eq!(progress.completed, 4);
        assert_eq!(progress.green, 2);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.skipped, 1);
        assert_eq!(progress.in_flight, 0);
        assert_eq!(progress.current_batch, None);
    }

    #[tokio::test]
    async fn test_conflicting_paths_merge_in_batch_order() {
        struct SamePath;

        #[async_trait]
        impl FeatureWorker for SamePath {
            async fn execute(
                &self,
                feature: Feature,
                batch: usize,
                _codebase: CodeSnapshot,
                _cancel: CancellationToken,
            ) -> FeatureOutcome {
                let mut files = SourceFiles::new();
                files.insert("shared.py".into(), format!("# written by {}\n", feature.id));
                FeatureOutcome::green(&feature.id, batch, CodeSnapshot::new(files))
            }
        }

        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let resolver =
            DependencyResolver::new(&[Feature::new("x", "X"), Feature::new("y", "Y")]).unwrap();
        let scheduler = ParallelScheduler::new(2, Arc::clone(&store));

        let results = scheduler.run(&resolver, Arc::new(SamePath)).await;

        assert_eq!(
            store.get("shared.py").await.unwrap().as_deref(),
            Some("# written by y\n")
        );
        let merges = &results.batches[0].merges;
        assert_eq!(merges.len(), 2);
        assert!(merges[1].1.displaced_owners.contains("x"));
    }
}
