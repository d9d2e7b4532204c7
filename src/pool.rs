//! Structured fan-out of per-VM work.
//!
//! A [`TaskPool`] collects the tasks of one lifecycle phase and runs them on
//! a dedicated rayon pool with one thread per task. `join` is the barrier:
//! it returns only after every task has finished, then logs and classifies
//! the failures. A panicking task is recorded as a failure; it never takes
//! its siblings down.

use crate::orchestrator::LabError;
use log::{debug, error, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

type Task<'a> = Box<dyn FnOnce() -> Result<(), LabError> + Send + 'a>;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Critical error! {} task(s) of phase '{phase}' failed critically", .failures.iter().filter(|f| f.critical).count())]
    Critical {
        phase: String,
        failures: Vec<TaskFailure>,
    },

    #[error("failed to start workers for phase '{phase}': {source}")]
    Spawn {
        phase: String,
        #[source]
        source: rayon::ThreadPoolBuildError,
    },
}

/// A task that returned an error or panicked
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub label: String,
    pub message: String,
    pub critical: bool,
}

/// Outcome of a phase without critical failures
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    pub completed: usize,
    pub failures: Vec<TaskFailure>,
}

impl PoolReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct TaskPool<'a> {
    phase: String,
    single: bool,
    tasks: Vec<(String, Task<'a>)>,
    /// Outcomes of tasks already run by `submit` in single mode
    finished: Vec<Result<(), TaskFailure>>,
}

impl<'a> TaskPool<'a> {
    pub fn new(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            single: false,
            tasks: Vec::new(),
            finished: Vec::new(),
        }
    }

    /// Run every task synchronously at submit time
    pub fn single(mut self, single: bool) -> Self {
        self.single = single;
        self
    }

    pub fn submit<F>(&mut self, label: impl Into<String>, task: F)
    where
        F: FnOnce() -> Result<(), LabError> + Send + 'a,
    {
        let label = label.into();
        let task: Task<'a> = Box::new(task);
        if self.single {
            let outcome = run_isolated((label, task));
            self.finished.push(outcome);
        } else {
            self.tasks.push((label, task));
        }
    }

    pub fn join(mut self) -> Result<PoolReport, PoolError> {
        let tasks = std::mem::take(&mut self.tasks);
        debug!("Phase '{}': running {} task(s)", self.phase, tasks.len());

        if !tasks.is_empty() {
            let workers = rayon::ThreadPoolBuilder::new()
                .num_threads(tasks.len())
                .thread_name(|i| format!("lab-worker-{}", i))
                .build()
                .map_err(|source| PoolError::Spawn {
                    phase: self.phase.clone(),
                    source,
                })?;
            let outcomes: Vec<Result<(), TaskFailure>> = workers.install(|| {
                tasks
                    .into_par_iter()
                    .with_max_len(1)
                    .map(run_isolated)
                    .collect()
            });
            self.finished.extend(outcomes);
        }

        let completed = self.finished.iter().filter(|o| o.is_ok()).count();
        let failures: Vec<TaskFailure> = self.finished.into_iter().filter_map(Result::err).collect();

        for failure in &failures {
            error!("[{}] {}: {}", self.phase, failure.label, failure.message);
        }
        if failures.iter().any(|f| f.critical) {
            return Err(PoolError::Critical {
                phase: self.phase,
                failures,
            });
        }
        if !failures.is_empty() {
            warn!(
                "Phase '{}' finished with {} failed task(s) of {}",
                self.phase,
                failures.len(),
                failures.len() + completed
            );
        }
        Ok(PoolReport { completed, failures })
    }
}

fn run_isolated((label, task): (String, Task<'_>)) -> Result<(), TaskFailure> {
    match catch_unwind(AssertUnwindSafe(task)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TaskFailure {
            label,
            critical: e.is_critical(),
            message: e.to_string(),
        }),
        Err(payload) => Err(TaskFailure {
            label,
            message: format!("worker panicked: {}", panic_message(payload.as_ref())),
            critical: false,
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failing(critical: bool) -> LabError {
        if critical {
            LabError::Critical("Network lab_x is not exists".into())
        } else {
            LabError::Worker {
                vm: "r1".into(),
                reason: "timeout".into(),
            }
        }
    }

    #[test]
    fn test_all_tasks_finish_before_join_returns() {
        let done = AtomicUsize::new(0);
        let mut pool = TaskPool::new("power on");
        for i in 0..8 {
            let done = &done;
            pool.submit(format!("vm{}", i), move || {
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let report = pool.join().unwrap();
        assert_eq!(report.completed, 8);
        assert!(report.is_clean());
        assert_eq!(done.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_non_critical_failures_are_collected() {
        let mut pool = TaskPool::new("configure");
        for i in 0..5 {
            pool.submit(format!("vm{}", i), || Err(failing(false)));
        }
        pool.submit("ok", || Ok(()));
        let report = pool.join().unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.failures.len(), 5);
        assert!(report.failures.iter().all(|f| !f.critical));
    }

    #[test]
    fn test_critical_failure_fails_the_phase() {
        let mut pool = TaskPool::new("create vms");
        for i in 0..4 {
            pool.submit(format!("vm{}", i), || Err(failing(false)));
        }
        pool.submit("vm4", || Err(failing(true)));
        match pool.join() {
            Err(PoolError::Critical { phase, failures }) => {
                assert_eq!(phase, "create vms");
                assert_eq!(failures.len(), 5);
                assert_eq!(failures.iter().filter(|f| f.critical).count(), 1);
            }
            other => panic!("expected critical failure, got {:?}", other),
        }
    }

    #[test]
    fn test_panic_is_recorded() {
        let mut pool = TaskPool::new("install");
        pool.submit("boom", || panic!("console went away"));
        pool.submit("fine", || Ok(()));
        let report = pool.join().unwrap();
        assert_eq!(report.completed, 1);
        assert!(report.failures[0].message.contains("console went away"));
    }

    #[test]
    fn test_single_mode_runs_in_submit_order() {
        let order = std::sync::Mutex::new(Vec::new());
        let mut pool = TaskPool::new("power off").single(true);
        for i in 0..3 {
            let order = &order;
            pool.submit(format!("vm{}", i), move || {
                order.lock().unwrap().push(i);
                Ok(())
            });
            assert_eq!(order.lock().unwrap().len(), i + 1);
        }
        assert_eq!(pool.join().unwrap().completed, 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_empty_pool() {
        let report = TaskPool::new("nothing").join().unwrap();
        assert_eq!(report.completed, 0);
    }
}
