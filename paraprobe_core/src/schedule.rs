use crate::extract::{ParameterExtractor, parse_filter_output, run_filter};
use crate::report::ReportWriter;
use crate::runner::Invoker;
use crate::score::{ScoredResult, score};
use crate::state::{StateError, StateStore};
use crate::work::WorkItem;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that abort the whole run from inside the scheduler. Per-item
/// failures never surface here; they are contained in their results.
#[derive(Error, Debug)]
pub enum ScheduleError {
    /// Durable state could not be written. Fatal, because continuing would
    /// silently break the resume guarantees.
    #[error("state persistence failed: {0}")]
    State(#[from] StateError),
}

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Size of the worker pool.
    pub max_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get().max(1),
        }
    }
}

/// What a finished (or stopped) run produced.
#[derive(Debug)]
pub struct RunOutcome {
    /// Scored results in completion order. Each retains its enumeration
    /// index, so downstream consumers can re-establish deterministic order.
    pub results: Vec<ScoredResult>,
    /// True when the stop signal cut the run short.
    pub stopped: bool,
}

/// Bounded worker pool that drains the enumerated work set.
///
/// Workers share a single cursor over the item slice, so every identity is
/// dispatched at most once per run; combined with enumeration-time
/// deduplication this keeps at most one invocation in flight per identity.
/// Each worker runs one invocation to completion, then merges the outcome:
/// artifact write, parameter extraction, scoring, state update plus result
/// append under the state lock, before pulling the next item.
pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Runs all `items` to terminal outcomes, honoring `stop`: once set, no
    /// new items are pulled, in-flight invocations finish (bounded by their
    /// own timeouts), and everything completed so far is already recorded.
    pub fn run(
        &self,
        items: &[WorkItem],
        invoker: &dyn Invoker,
        state: &Mutex<StateStore>,
        extractor: &Mutex<ParameterExtractor>,
        artifacts: Option<&ReportWriter>,
        stop: &AtomicBool,
    ) -> Result<RunOutcome, ScheduleError> {
        let workers = self.config.max_workers.max(1).min(items.len().max(1));
        let cursor = AtomicUsize::new(0);
        let results: Mutex<Vec<ScoredResult>> = Mutex::new(Vec::with_capacity(items.len()));
        let fatal: Mutex<Option<ScheduleError>> = Mutex::new(None);

        let filter_config = lock(extractor).config().clone();

        info!(items = items.len(), workers, "scheduling work items");

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        let index = cursor.fetch_add(1, Ordering::SeqCst);
                        if index >= items.len() {
                            break;
                        }
                        let item = &items[index];
                        debug!(url = %item.url, payload = %item.payload, "dispatching work item");

                        let result = invoker.invoke(item);

                        // Synthetic dry-run results are never persisted or
                        // extracted; recording them would poison resume
                        // state with items that were never really probed.
                        let synthetic = !result.spawned && result.attempt_count == 0;

                        // The filter subprocess runs outside the extractor
                        // lock so a slow filter cannot serialize the pool;
                        // only corpus append and flag lookup are serialized.
                        let names = if !synthetic
                            && filter_config.enabled
                            && !result.stdout.is_empty()
                        {
                            match run_filter(
                                &filter_config.filter_tool,
                                &filter_config.rule,
                                &result.stdout,
                                filter_config.timeout,
                            ) {
                                Ok(output) => parse_filter_output(&output),
                                Err(e) => {
                                    warn!(url = %item.url, error = %e, "parameter extraction failed");
                                    Vec::new()
                                }
                            }
                        } else {
                            Vec::new()
                        };

                        let flagged = {
                            let mut extractor = lock(extractor);
                            if let Err(e) = extractor.record_flagged(&item.url, &names) {
                                warn!(url = %item.url, error = %e, "recording extracted parameters failed");
                            }
                            extractor.is_flagged(&item.url)
                        };

                        let scored = ScoredResult {
                            index,
                            score: score(&result, flagged),
                            item: item.clone(),
                            result,
                        };

                        if !synthetic {
                            if let Some(writer) = artifacts {
                                if let Err(e) = writer.write_artifact(&scored) {
                                    warn!(url = %item.url, error = %e, "artifact write failed");
                                }
                            }
                        }

                        // State update and aggregation-stream append happen
                        // under one lock so no item is ever half-recorded.
                        {
                            let mut state = lock(state);
                            if !synthetic {
                                state.mark_complete(&scored.result.work_item_id, scored.result.status);
                                if let Err(e) = state.flush() {
                                    *lock(&fatal) = Some(ScheduleError::State(e));
                                    stop.store(true, Ordering::SeqCst);
                                    break;
                                }
                            }
                            lock(&results).push(scored);
                        }
                    }
                });
            }
        });

        if let Some(error) = lock(&fatal).take() {
            return Err(error);
        }

        let results = results.into_inner().unwrap_or_else(|p| p.into_inner());
        let stopped = stop.load(Ordering::SeqCst);
        info!(
            processed = results.len(),
            total = items.len(),
            stopped,
            "scheduler drained"
        );
        Ok(RunOutcome { results, stopped })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
