pub mod queue;


use crate::{
    calculators::{Calculators, ExecutionRequest, Failure, Outcome, Success},
    case::{Case, CaseStatus, Job, Outputs},
    extract::{Extractor, OutputSpec},
    render::Renderer,
    report::Report,
    store::{ResultStore, StoreError},
};
use parking_lot::Mutex;
use queue::WorkQueue;
use rayon::ThreadPoolBuilder;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Failed to start worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("Failed to access the result store")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// attempts per case, defaults to the number of executor slots
    pub max_attempts: Option<usize>,
    /// per attempt
    pub timeout: Option<Duration>,
}

/// Owns the calculator pool and drives every case to a terminal status
#[derive(Debug)]
pub struct Dispatcher {
    caches: Vec<Calculators>,
    /// one entry per unit of concurrency, duplicated descriptors yield separate slots
    slots: Vec<Arc<Calculators>>,
    store: ResultStore,
    renderer: Arc<dyn Renderer>,
    extractor: Arc<dyn Extractor>,
    outputs: OutputSpec,
    max_attempts: usize,
    timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(
        calculators: Vec<Calculators>,
        store: ResultStore,
        renderer: Arc<dyn Renderer>,
        extractor: Arc<dyn Extractor>,
        outputs: OutputSpec,
        options: DispatchOptions,
    ) -> Self {
        let (caches, executors): (Vec<_>, Vec<_>) = calculators
            .into_iter()
            .partition(Calculators::is_cache);

        let slots: Vec<Arc<Calculators>> = executors
            .into_iter()
            .flat_map(|calculator| {
                let calculator = Arc::new(calculator);
                (0..calculator.max_concurrency()).map(move |_| calculator.clone())
            })
            .collect();

        let max_attempts = options.max_attempts.unwrap_or(slots.len()).max(1);

        info!(
            caches = caches.len(),
            slots = slots.len(),
            max_attempts = max_attempts,
            "Prepared calculator pool"
        );

        Self {
            caches,
            slots,
            store,
            renderer,
            extractor,
            outputs,
            max_attempts,
            timeout: options.timeout,
        }
    }

    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn outputs(&self) -> &OutputSpec {
        &self.outputs
    }

    pub fn renderer(&self) -> &Arc<dyn Renderer> {
        &self.renderer
    }

    /// Run all cases to a terminal status. Failing cases end up with null outputs, only
    /// infrastructure problems are errors.
    #[instrument(skip_all, fields(cases = cases.len()), level = "info")]
    pub fn run(&self, cases: Vec<Case>) -> Result<Report, DispatchError> {
        let mut finished = Vec::new();
        let mut pending = Vec::new();
        let mut hits = Vec::new();
        self.store.claim(&cases);

        for mut case in cases {
            match self.probe_caches(&mut case) {
                Some(source) => hits.push((case, source)),
                None => pending.push(case),
            }
        }

        // a hit may come from a directory that persisting another hit replaces
        let mut staged = Vec::with_capacity(hits.len());
        for (mut case, source) in hits {
            match self.store.stage(&case, &source) {
                Ok(dir) => staged.push((case, source, dir)),
                Err(error) => {
                    warn!(case = case.index, error = %error, "Failed to stage cached result, running it");
                    case.status = CaseStatus::Pending;
                    case.outputs = Outputs::new();
                    pending.push(case);
                }
            }
        }

        for (case, source, dir) in staged {
            self.persist(&case, Some(&dir), Some(&source));
            finished.push(case);
        }

        info!(
            cached = finished.len(),
            pending = pending.len(),
            "Finished cache probe"
        );

        if !pending.is_empty() {
            if self.slots.is_empty() {
                warn!("No executor configured, failing all uncached cases");

                for mut case in pending {
                    case.status = CaseStatus::Failed;
                    case.null_outputs(self.outputs.keys());
                    self.persist(&case, None, None);
                    finished.push(case);
                }
            } else {
                finished.extend(self.run_pool(pending)?);
            }
        }

        finished.sort_by_key(|case| case.index);
        self.store.cleanup()?;

        let report = Report::new(&finished, &self.outputs);
        info!("{}", report.summary());

        Ok(report)
    }

    /// Consult every cache in configured order, the first hit wins. Returns the directory of
    /// the cached result.
    fn probe_caches(&self, case: &mut Case) -> Option<PathBuf> {
        for cache in self.caches.iter() {
            let request = ExecutionRequest {
                case: &*case,
                dir: self.store.root(),
                timeout: None,
            };

            match cache.execute(&request) {
                Outcome::Success(Success {
                    artifacts_dir,
                    outputs,
                    ..
                }) => {
                    debug!(case = case.index, from = ?artifacts_dir, "Cache hit");
                    case.status = CaseStatus::Cached;
                    case.outputs = self.requested(outputs.unwrap_or_default());

                    return Some(artifacts_dir);
                }
                Outcome::CacheMiss => continue,
                Outcome::Failure(failure) => {
                    warn!(case = case.index, failure = %failure, "Cache failed, treating it as a miss");
                }
            }
        }

        None
    }

    /// restrict cached outputs to the requested names, missing ones are null
    fn requested(&self, mut outputs: Outputs) -> Outputs {
        self.outputs
            .keys()
            .map(|name| (name.clone(), outputs.shift_remove(name).flatten()))
            .collect()
    }

    fn run_pool(&self, cases: Vec<Case>) -> Result<Vec<Case>, DispatchError> {
        let queue = WorkQueue::new(0..cases.len(), self.slots.len());
        let board = Mutex::new(cases);
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.slots.len())
            .thread_name(|slot| format!("slot-{slot}"))
            .build()?;

        pool.scope(|scope| {
            for slot in 0..self.slots.len() {
                let queue = &queue;
                let board = &board;

                scope.spawn(move |_| self.work(slot, queue, board));
            }
        });

        Ok(board.into_inner())
    }

    /// pull cases until the queue is drained
    fn work(&self, slot: usize, queue: &WorkQueue, board: &Mutex<Vec<Case>>) {
        let calculator = &self.slots[slot];

        while let Some(position) = queue.pull(slot) {
            let (case, attempt) = {
                let mut board = board.lock();
                let case = &mut board[position];
                case.status = CaseStatus::Running;

                (case.clone(), case.attempts.len() + 1)
            };

            let job = self.attempt(calculator, &case, attempt);
            let outputs = match &job.result {
                Outcome::Success(Success {
                    outputs: Some(outputs),
                    ..
                }) => Some(self.requested(outputs.clone())),
                Outcome::Success(success) => {
                    Some(self.extractor.extract(&self.outputs, &success.artifacts_dir))
                }
                _ => None,
            };

            let (snapshot, retry) = {
                let mut board = board.lock();
                let case = &mut board[position];
                let retry = match &job.result {
                    Outcome::Failure(failure) => {
                        failure.is_retryable() && attempt < self.max_attempts
                    }
                    _ => false,
                };

                match &job.result {
                    Outcome::Success(_) => {
                        case.status = CaseStatus::Succeeded;
                        case.outputs = outputs.unwrap_or_default();
                    }
                    _ if retry => case.status = CaseStatus::Pending,
                    _ => {
                        case.status = CaseStatus::Failed;
                        case.null_outputs(self.outputs.keys());
                    }
                }

                case.attempts.push(job);

                (case.clone(), retry)
            };

            if retry {
                debug!(case = snapshot.index, attempt = attempt, "Re-queueing case");
                queue.requeue(position, slot);
                continue;
            }

            let artifacts = self.store.attempt_path(&snapshot, attempt);
            self.persist(
                &snapshot,
                artifacts.exists().then_some(artifacts.as_path()),
                None,
            );
            queue.complete(position);
        }

        debug!(slot = slot, "Slot finished");
    }

    fn attempt(&self, calculator: &Calculators, case: &Case, attempt: usize) -> Job {
        let started_at = SystemTime::now();

        let result = match self.store.attempt_dir(case, attempt) {
            Err(error) => Outcome::Failure(Failure::Transport(format!(
                "cannot prepare working directory: {error}"
            ))),
            Ok(dir) => match self.renderer.render(case.variables(), &dir) {
                Err(error) => Outcome::Failure(Failure::Render(error.to_string())),
                Ok(()) => calculator.execute(&ExecutionRequest {
                    case,
                    dir: &dir,
                    timeout: self.timeout,
                }),
            },
        };

        let result = match result {
            Outcome::CacheMiss => Outcome::Failure(Failure::Transport(String::from(
                "executor answered with a cache miss",
            ))),
            other => other,
        };

        match &result {
            Outcome::Failure(failure) => warn!(
                case = case.index,
                attempt = attempt,
                calculator = %calculator.descriptor(),
                failure = %failure,
                "Attempt failed"
            ),
            _ => info!(
                case = case.index,
                attempt = attempt,
                calculator = %calculator.descriptor(),
                "Attempt succeeded"
            ),
        }

        Job {
            case: case.index,
            calculator: calculator.descriptor().clone(),
            attempt,
            started_at,
            ended_at: SystemTime::now(),
            result,
        }
    }

    fn persist(
        &self,
        case: &Case,
        artifacts: Option<&Path>,
        source: Option<&Path>,
    ) {
        if let Err(error) = self.store.persist(case, artifacts, source) {
            error!(case = case.index, error = %error, "Failed to persist case");
        }
    }
}
