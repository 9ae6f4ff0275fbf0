//! Feature orchestration: drives each feature through RED → YELLOW → GREEN
//! and coordinates a whole run across dependency batches.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::outcome::{FeatureFailure, FeatureOutcome, RetryReason, StepOutcome};
use super::report::{CompletionReport, ProgressSnapshot, RunMetrics};
use crate::cache::{CacheConfig, CacheLookup, Fingerprint, ResultCache};
use crate::collab::{Collaborators, ReviewVerdict, SourceFiles, TestRunResult, TestSuite};
use crate::config::{FeatureOverride, FeatureSettings, resolve_feature_settings};
use crate::dag::{DependencyResolver, FeatureWorker, ParallelScheduler};
use crate::errors::{CollaboratorError, CollaboratorRole, OrchestratorError, PhaseError, StoreError};
use crate::events::{EngineEvent, EventSink, TracingSink};
use crate::feature::Feature;
use crate::phase::{Phase, PhaseTracker};
use crate::retry::{
    ErrorClass, RetryDirective, RetryPlanner, RetryPolicy, TestFailureContext, TestProgression,
};
use crate::store::{CodeSnapshot, CodeStore, StoreConfig};

/// Settings for one orchestration run.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Concurrent feature workers
    pub max_parallel: usize,
    /// Retries after the first attempt, shared by every step of a feature
    pub max_retries: u32,
    /// Timeout for each external call
    pub call_timeout: Duration,
    pub max_hints: usize,
    pub cache: CacheConfig,
    pub store: StoreConfig,
    /// Write the final code snapshot here when set
    pub snapshot_dir: Option<PathBuf>,
    /// Per-feature overrides keyed by glob pattern
    pub overrides: BTreeMap<String, FeatureOverride>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            max_retries: 3,
            call_timeout: Duration::from_secs(300),
            max_hints: 5,
            cache: CacheConfig::default(),
            store: StoreConfig::default(),
            snapshot_dir: None,
            overrides: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_hints(mut self, max_hints: usize) -> Self {
        self.max_hints = max_hints;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshot_dir = Some(dir.into());
        self
    }

    pub fn with_overrides(mut self, overrides: BTreeMap<String, FeatureOverride>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Effective retry limit and call timeout for one feature.
    pub fn settings_for(&self, feature_id: &str) -> FeatureSettings {
        resolve_feature_settings(
            &self.overrides,
            feature_id,
            FeatureSettings {
                max_retries: self.max_retries,
                call_timeout: self.call_timeout,
            },
        )
    }
}

/// Top-level coordinator for one orchestration run.
///
/// Owns the shared services (phase tracker, retry planner, result cache,
/// code store) and injects them into every feature worker. One orchestrator
/// drives one run; create a new one for the next.
pub struct FeatureOrchestrator {
    config: OrchestratorConfig,
    collaborators: Collaborators,
    tracker: Arc<PhaseTracker>,
    planner: Arc<RetryPlanner>,
    cache: Arc<ResultCache>,
    store: Arc<CodeStore>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    progress: Arc<Mutex<ProgressSnapshot>>,
    started: AtomicBool,
}

impl FeatureOrchestrator {
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Self {
        let sink: Arc<dyn EventSink> = Arc::new(TracingSink);
        let policy = RetryPolicy {
            max_retries: config.max_retries,
            max_hints: config.max_hints,
        };
        Self {
            tracker: Arc::new(PhaseTracker::new().with_sink(Arc::clone(&sink))),
            planner: Arc::new(RetryPlanner::new(policy)),
            cache: Arc::new(ResultCache::new(config.cache)),
            store: Arc::new(CodeStore::new(config.store.clone())),
            sink,
            cancel: CancellationToken::new(),
            progress: Arc::new(Mutex::new(ProgressSnapshot::default())),
            started: AtomicBool::new(false),
            config,
            collaborators,
        }
    }

    /// Send events to `sink` instead of the tracing log.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.tracker = Arc::new(PhaseTracker::new().with_sink(Arc::clone(&sink)));
        self.sink = sink;
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Signal cancellation to every in-flight feature.
    pub fn cancel(&self) {
        tracing::warn!("cancellation requested");
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn tracker(&self) -> &PhaseTracker {
        &self.tracker
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn store(&self) -> &CodeStore {
        &self.store
    }

    /// Snapshot of the run so far.
    pub fn progress(&self) -> ProgressSnapshot {
        let mut progress = self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        progress.phases = self.tracker.snapshot();
        progress
    }

    /// Resolve the dependency graph and drive every feature to a terminal status.
    ///
    /// Configuration errors abort before any feature runs. Feature-level
    /// failures never abort the run; they are reported per feature.
    pub async fn run(&self, features: &[Feature]) -> Result<CompletionReport, OrchestratorError> {
        let resolver = DependencyResolver::new(features).inspect_err(|e| {
            tracing::error!(error = %e, "invalid feature set");
        })?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(anyhow::anyhow!("orchestrator has already run; create a new one per run").into());
        }

        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let timer = Instant::now();
        let batches = resolver.batches();

        tracing::info!(%run_id, features = features.len(), batches = batches.len(), "starting run");
        self.sink.emit(EngineEvent::RunStarted {
            run_id: run_id.clone(),
            features: features.len(),
            batches: batches.len(),
        });

        let lineage = resolver
            .features()
            .iter()
            .map(|f| (f.id.clone(), resolver.transitive_dependencies(&f.id)))
            .collect();
        let worker = Arc::new(FeatureCycle {
            config: self.config.clone(),
            collaborators: self.collaborators.clone(),
            tracker: Arc::clone(&self.tracker),
            planner: Arc::clone(&self.planner),
            cache: Arc::clone(&self.cache),
            store: Arc::clone(&self.store),
            sink: Arc::clone(&self.sink),
            lineage,
        });

        let scheduler = ParallelScheduler::new(self.config.max_parallel, Arc::clone(&self.store))
            .with_cache(Arc::clone(&self.cache))
            .with_sink(Arc::clone(&self.sink))
            .with_cancellation(self.cancel.clone())
            .with_progress(Arc::clone(&self.progress));

        let features = scheduler.run(&resolver, worker).await.into_outcomes();

        // Storage failures below land in the report; outcomes are always returned.
        let mut storage_errors = Vec::new();
        let snapshot = match self.store.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(%run_id, error = %e, "failed to snapshot code store");
                storage_errors.push(format!("snapshot: {}", e));
                CodeSnapshot::default()
            }
        };
        if let Some(ref dir) = self.config.snapshot_dir
            && let Err(e) = self.store.persist(dir).await
        {
            tracing::error!(%run_id, dir = %dir.display(), error = %e, "failed to persist code snapshot");
            storage_errors.push(format!("persist: {}", e));
        }

        let mut metrics = RunMetrics::from_outcomes(&features);
        metrics.cache = self.cache.stats();
        metrics.store = self.store.stats().await;
        metrics.duration_ms = timer.elapsed().as_millis() as u64;
        if let Err(e) = self.store.clear().await {
            tracing::error!(%run_id, error = %e, "failed to clear code store");
            storage_errors.push(format!("clear: {}", e));
        }

        let success = features.iter().all(FeatureOutcome::is_green);
        tracing::info!(
            %run_id,
            success,
            green = metrics.green,
            failed = metrics.failed,
            skipped = metrics.skipped,
            cancelled = metrics.cancelled,
            "run complete"
        );
        self.sink.emit(EngineEvent::RunCompleted {
            run_id: run_id.clone(),
            success,
            green: metrics.green,
            total: metrics.total,
            duration_ms: metrics.duration_ms,
        });

        Ok(CompletionReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            success,
            batches,
            features,
            metrics,
            storage_errors,
            snapshot,
        })
    }
}

/// How a feature cycle ended short of GREEN.
enum Terminal {
    Failed(FeatureFailure),
    Cancelled(String),
}

fn contract_violation(error: PhaseError) -> Terminal {
    Terminal::Failed(FeatureFailure::new(
        ErrorClass::ContractViolation,
        error.to_string(),
    ))
}

fn storage_failure<T>(error: StoreError) -> StepOutcome<T> {
    StepOutcome::Fatal(FeatureFailure::new(ErrorClass::StorageError, error.to_string()))
}

/// Mutable state of one feature's cycle.
struct FeatureRun<'a> {
    feature: &'a Feature,
    cancel: &'a CancellationToken,
    settings: FeatureSettings,
    /// Code completed by earlier batches
    codebase: &'a CodeSnapshot,
    /// Files this feature has produced across attempts
    scoped: CodeStore,
    own: CodeSnapshot,
    /// `codebase` overlaid with `own`; what the implementer and test runner see
    view: CodeSnapshot,
    /// Index of the current attempt in the retry budget
    attempt: u32,
    implementations: u32,
    directive: Option<RetryDirective>,
}

/// Worker that runs the full phase cycle for one feature.
struct FeatureCycle {
    config: OrchestratorConfig,
    collaborators: Collaborators,
    tracker: Arc<PhaseTracker>,
    planner: Arc<RetryPlanner>,
    cache: Arc<ResultCache>,
    store: Arc<CodeStore>,
    sink: Arc<dyn EventSink>,
    /// Transitive dependencies per feature, for cache invalidation
    lineage: HashMap<String, Vec<String>>,
}

#[async_trait]
impl FeatureWorker for FeatureCycle {
    async fn execute(
        &self,
        feature: Feature,
        batch: usize,
        codebase: CodeSnapshot,
        cancel: CancellationToken,
    ) -> FeatureOutcome {
        let started = Instant::now();
        let mut run = FeatureRun {
            feature: &feature,
            cancel: &cancel,
            settings: self.config.settings_for(&feature.id),
            codebase: &codebase,
            scoped: self.store.scoped(&feature.id),
            own: CodeSnapshot::default(),
            view: codebase.clone(),
            attempt: 0,
            implementations: 0,
            directive: None,
        };
        tracing::info!(feature = %feature.id, batch, max_retries = run.settings.max_retries, "feature started");

        let mut outcome = match self.drive(&mut run).await {
            Ok(code) => {
                tracing::info!(feature = %feature.id, attempts = run.implementations, "feature GREEN");
                FeatureOutcome::green(&feature.id, batch, code)
            }
            Err(Terminal::Failed(failure)) => {
                tracing::error!(feature = %feature.id, class = %failure.class, "feature failed: {}", failure.message);
                FeatureOutcome::failed(&feature.id, batch, failure)
            }
            Err(Terminal::Cancelled(reason)) => {
                tracing::warn!(feature = %feature.id, "feature cancelled: {}", reason);
                let mut outcome = FeatureOutcome::cancelled(&feature.id, batch);
                outcome.skip_reason = Some(reason);
                outcome
            }
        };

        outcome.attempts = run.implementations;
        outcome.final_phase = self.tracker.current_phase(&feature.id);
        outcome.history = self.tracker.history(&feature.id);
        outcome.durations = self.tracker.phase_durations(&feature.id);
        outcome.review_rejections = self.tracker.rejections(&feature.id) as u32;
        outcome.elapsed_ms = started.elapsed().as_millis() as u64;

        if let Err(e) = run.scoped.clear().await {
            tracing::warn!(feature = %feature.id, error = %e, "failed to clear feature store");
        }
        self.planner.reset(&feature.id);
        outcome
    }
}

impl FeatureCycle {
    async fn drive(&self, run: &mut FeatureRun<'_>) -> Result<CodeSnapshot, Terminal> {
        let feature = run.feature;

        let suite = loop {
            let outcome = self.write_tests(run).await;
            if let Some(suite) = self.settle(run, outcome)? {
                break suite;
            }
        };

        self.tracker
            .start_feature(&feature.id, suite.file_count())
            .map_err(contract_violation)?;

        loop {
            let outcome = self.validate_red(run, &suite).await;
            if self.settle(run, outcome)?.is_some() {
                break;
            }
        }

        loop {
            self.tracker
                .enforce_red_before_implementation(&feature.id)
                .map_err(contract_violation)?;

            let outcome = self.attempt_implementation(run, &suite).await;
            let Some((files, results)) = self.settle(run, outcome)? else {
                continue;
            };

            self.tracker
                .transition(&feature.id, Phase::Yellow)
                .map_err(contract_violation)?;

            let verdict = loop {
                let outcome = self.review(run, &files, &results).await;
                if let Some(verdict) = self.settle(run, outcome)? {
                    break verdict;
                }
            };

            if verdict.approved {
                self.tracker
                    .transition(&feature.id, Phase::Green)
                    .map_err(contract_violation)?;
                return Ok(run.own.clone());
            }

            self.tracker
                .transition(&feature.id, Phase::Red)
                .map_err(contract_violation)?;
            tracing::warn!(feature = %feature.id, "review rejected: {}", verdict.feedback);

            let progression = self.planner.progression(&feature.id);
            run.directive = Some(
                self.planner
                    .build_retry_directive(feature, &[], progression.as_ref(), run.attempt + 1, &run.view)
                    .with_review_feedback(&verdict.feedback),
            );
            self.schedule_retry(
                run,
                RetryReason::new(
                    ErrorClass::TestFailure,
                    format!("review rejected: {}", verdict.feedback),
                ),
            )?;
        }
    }

    /// Turn a step outcome into control flow: `Some` to proceed, `None` to
    /// repeat the step, `Err` to stop the feature.
    fn settle<T>(&self, run: &mut FeatureRun<'_>, outcome: StepOutcome<T>) -> Result<Option<T>, Terminal> {
        match outcome {
            StepOutcome::Success(value) => Ok(Some(value)),
            StepOutcome::Retry(reason) => self.schedule_retry(run, reason).map(|()| None),
            StepOutcome::Fatal(failure) => Err(Terminal::Failed(failure)),
            StepOutcome::Skip(reason) => Err(Terminal::Cancelled(reason)),
        }
    }

    fn schedule_retry(&self, run: &mut FeatureRun<'_>, reason: RetryReason) -> Result<(), Terminal> {
        let max_retries = run.settings.max_retries;

        if self.planner.should_retry_within(run.attempt, reason.class, max_retries) {
            run.attempt += 1;
            let hints = run
                .directive
                .as_ref()
                .filter(|d| d.attempt == run.attempt)
                .map(|d| d.hints.clone())
                .unwrap_or_default();
            tracing::warn!(
                feature = %run.feature.id,
                attempt = run.attempt,
                max_retries,
                class = %reason.class,
                "retrying: {}",
                reason.message
            );
            self.sink.emit(EngineEvent::RetryScheduled {
                feature: run.feature.id.clone(),
                attempt: run.attempt,
                reason: format!("{}: {}", reason.class, reason.message),
                hints,
            });
            Ok(())
        } else if reason.class.is_retryable() {
            Err(Terminal::Failed(FeatureFailure::new(
                ErrorClass::MaxAttemptsExceeded,
                format!(
                    "gave up after {} attempt(s); last failure ({}): {}",
                    run.attempt + 1,
                    reason.class,
                    reason.message
                ),
            )))
        } else {
            Err(Terminal::Failed(FeatureFailure::new(reason.class, reason.message)))
        }
    }

    /// Await an external call under the feature's timeout. A call already in
    /// flight when the run is cancelled still runs to completion (or timeout);
    /// its result is discarded.
    async fn call<T>(
        &self,
        run: &FeatureRun<'_>,
        role: CollaboratorRole,
        request: impl Future<Output = Result<T, CollaboratorError>>,
    ) -> StepOutcome<T> {
        if run.cancel.is_cancelled() {
            return StepOutcome::Skip(format!("run cancelled before {} call", role));
        }

        let timeout = run.settings.call_timeout;
        let request = tokio::time::timeout(timeout, request);
        tokio::pin!(request);

        let finished = tokio::select! {
            biased;
            finished = &mut request => finished,
            _ = run.cancel.cancelled() => {
                tracing::warn!(feature = %run.feature.id, %role, "run cancelled; waiting for in-flight call");
                let _ = request.await;
                tracing::warn!(feature = %run.feature.id, %role, "discarding result of call finished after cancellation");
                return StepOutcome::Skip(format!("run cancelled during {} call", role));
            }
        };
        let result = finished.unwrap_or_else(|_| Err(CollaboratorError::Timeout { role, timeout }));

        if run.cancel.is_cancelled() {
            tracing::warn!(feature = %run.feature.id, %role, "run cancelled; discarding call result");
            return StepOutcome::Skip(format!("run cancelled during {} call", role));
        }

        match result {
            Ok(value) => {
                self.planner.clear_collaborator_error(&run.feature.id);
                StepOutcome::Success(value)
            }
            Err(error) => self.collaborator_failure(run, error),
        }
    }

    fn collaborator_failure<T>(&self, run: &FeatureRun<'_>, error: CollaboratorError) -> StepOutcome<T> {
        let class = self.planner.classify_collaborator_error(&run.feature.id, &error);
        tracing::warn!(feature = %run.feature.id, %class, error = %error, "collaborator call failed");

        if class.is_retryable() {
            StepOutcome::Retry(
                RetryReason::new(class, error.to_string())
                    .with_contexts(vec![RetryPlanner::collaborator_failure_context(&error)]),
            )
        } else {
            StepOutcome::Fatal(FeatureFailure::new(class, error.to_string()))
        }
    }

    async fn write_tests(&self, run: &FeatureRun<'_>) -> StepOutcome<TestSuite> {
        let outcome = self
            .call(
                run,
                CollaboratorRole::TestWriter,
                self.collaborators.test_writer.write_tests(run.feature),
            )
            .await;

        match outcome {
            StepOutcome::Success(suite) if suite.is_empty() => self.collaborator_failure(
                run,
                CollaboratorError::Malformed {
                    role: CollaboratorRole::TestWriter,
                    message: "no test files returned".to_string(),
                },
            ),
            other => other,
        }
    }

    /// Run the fresh tests against code without this feature. They must fail.
    async fn validate_red(&self, run: &FeatureRun<'_>, suite: &TestSuite) -> StepOutcome<()> {
        let fingerprint = Fingerprint::compute(run.view.files(), &suite.files);
        if let CacheLookup::Bypassed = self.cache.lookup(&fingerprint, true) {
            tracing::debug!(feature = %run.feature.id, fingerprint = fingerprint.short(), "cache bypassed for RED validation");
            self.sink.emit(EngineEvent::CacheBypassed {
                feature: run.feature.id.clone(),
            });
        }

        let outcome = self
            .call(
                run,
                CollaboratorRole::TestRunner,
                self.collaborators
                    .test_runner
                    .run_tests(run.view.files(), suite, true),
            )
            .await;

        match outcome {
            StepOutcome::Success(result) if result.passed => StepOutcome::Fatal(FeatureFailure::new(
                ErrorClass::ContractViolation,
                "tests passed before any implementation existed",
            )),
            other => other.map(|_| ()),
        }
    }

    /// One implementation request followed by a real test run.
    async fn attempt_implementation(
        &self,
        run: &mut FeatureRun<'_>,
        suite: &TestSuite,
    ) -> StepOutcome<(SourceFiles, TestRunResult)> {
        let feature = run.feature;
        run.implementations += 1;
        tracing::info!(
            feature = %feature.id,
            attempt = run.attempt,
            retry = run.directive.is_some(),
            "requesting implementation"
        );

        let outcome = self
            .call(
                run,
                CollaboratorRole::Implementer,
                self.collaborators
                    .implementer
                    .implement(feature, &run.view, run.directive.as_ref()),
            )
            .await;
        let files = match outcome {
            StepOutcome::Success(files) => files,
            StepOutcome::Retry(reason) => {
                self.prepare_directive(run, &reason.contexts, None);
                return StepOutcome::Retry(reason);
            }
            StepOutcome::Fatal(failure) => return StepOutcome::Fatal(failure),
            StepOutcome::Skip(reason) => return StepOutcome::Skip(reason),
        };

        if let Err(e) = run.scoped.put_files(&feature.id, &files).await {
            return storage_failure(e);
        }
        if let Err(e) = self.refresh_view(run).await {
            return storage_failure(e);
        }

        let fingerprint = Fingerprint::compute(run.view.files(), &suite.files);
        let results = match self.cache.lookup(&fingerprint, false) {
            CacheLookup::Hit(entry) => {
                tracing::debug!(feature = %feature.id, fingerprint = fingerprint.short(), "test result served from cache");
                self.sink.emit(EngineEvent::CacheHit {
                    feature: feature.id.clone(),
                    fingerprint: fingerprint.to_string(),
                });
                entry.result
            }
            CacheLookup::Miss | CacheLookup::Bypassed => {
                self.sink.emit(EngineEvent::CacheMiss {
                    feature: feature.id.clone(),
                    fingerprint: fingerprint.to_string(),
                });
                let outcome = self
                    .call(
                        run,
                        CollaboratorRole::TestRunner,
                        self.collaborators
                            .test_runner
                            .run_tests(run.view.files(), suite, false),
                    )
                    .await;
                match outcome {
                    StepOutcome::Success(result) => {
                        let lineage = self.lineage.get(&feature.id).map(Vec::as_slice).unwrap_or(&[]);
                        self.cache
                            .put_with_lineage(fingerprint, result.clone(), &feature.id, lineage);
                        result
                    }
                    StepOutcome::Retry(reason) => {
                        self.prepare_directive(run, &reason.contexts, None);
                        return StepOutcome::Retry(reason);
                    }
                    StepOutcome::Fatal(failure) => return StepOutcome::Fatal(failure),
                    StepOutcome::Skip(reason) => return StepOutcome::Skip(reason),
                }
            }
        };

        let (failing, contexts) = if results.passed {
            (BTreeSet::new(), Vec::new())
        } else {
            let contexts = self.planner.extract_failure_context(&results.raw_output);
            (self.planner.failing_tests(&results.raw_output, &contexts), contexts)
        };
        let progression = self
            .planner
            .track_progression(&feature.id, failing.clone(), run.attempt);

        self.sink.emit(EngineEvent::AttemptFinished {
            feature: feature.id.clone(),
            attempt: run.attempt,
            passed: results.passed,
            failing: failing.len(),
            duration_ms: results.duration_ms,
        });

        if results.passed {
            return StepOutcome::Success((run.own.files().clone(), results));
        }

        tracing::info!(
            feature = %feature.id,
            attempt = run.attempt,
            failing = failing.len(),
            newly_passing = progression.newly_passing.len(),
            regressions = progression.newly_failing.len(),
            improving = progression.is_improving(),
            "tests failing"
        );
        if progression.is_stalled() {
            tracing::warn!(
                feature = %feature.id,
                attempt = run.attempt,
                "no test started passing since the previous attempt"
            );
        }
        self.prepare_directive(run, &contexts, Some(&progression));
        StepOutcome::Retry(
            RetryReason::new(
                ErrorClass::TestFailure,
                format!("{} failing test(s)", failing.len()),
            )
            .with_contexts(contexts),
        )
    }

    async fn review(
        &self,
        run: &FeatureRun<'_>,
        files: &SourceFiles,
        results: &TestRunResult,
    ) -> StepOutcome<ReviewVerdict> {
        self.call(
            run,
            CollaboratorRole::Reviewer,
            self.collaborators.reviewer.review(run.feature, files, results),
        )
        .await
    }

    /// Directive for the next attempt, built from this attempt's failures.
    fn prepare_directive(
        &self,
        run: &mut FeatureRun<'_>,
        contexts: &[TestFailureContext],
        progression: Option<&TestProgression>,
    ) {
        let progression = progression
            .cloned()
            .or_else(|| self.planner.progression(&run.feature.id));
        run.directive = Some(self.planner.build_retry_directive(
            run.feature,
            contexts,
            progression.as_ref(),
            run.attempt + 1,
            &run.view,
        ));
    }

    async fn refresh_view(&self, run: &mut FeatureRun<'_>) -> Result<(), StoreError> {
        let own = run.scoped.snapshot().await?;
        let mut files = run.codebase.files().clone();
        files.extend(own.files().iter().map(|(k, v)| (k.clone(), v.clone())));
        run.view = CodeSnapshot::new(files);
        run.own = own;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_parallel, 4);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.call_timeout, Duration::from_secs(300));
        assert!(config.snapshot_dir.is_none());
    }

    #[test]
    fn test_settings_for_applies_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "slow-*".to_string(),
            FeatureOverride {
                max_retries: None,
                call_timeout_secs: Some(900),
            },
        );
        let config = OrchestratorConfig::default()
            .with_max_retries(1)
            .with_call_timeout(Duration::from_secs(10))
            .with_overrides(overrides);

        let slow = config.settings_for("slow-import");
        assert_eq!(slow.max_retries, 1);
        assert_eq!(slow.call_timeout, Duration::from_secs(900));
        assert_eq!(config.settings_for("fast").call_timeout, Duration::from_secs(10));
    }
}
