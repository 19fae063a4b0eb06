use std::{
    any::Any,
    fmt,
    ops::Not,
    panic::{self, AssertUnwindSafe},
};

use anyhow::anyhow;
use crossbeam::{
    channel::{self, Receiver, Sender},
    scope,
};
use log::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ProcessBlastHits,
    ConnectCognates,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::ProcessBlastHits => "initial processing of hits",
            Phase::ConnectCognates => "connection of putative homologues",
        };
        f.write_str(name)
    }
}

/// A fixed-size pool of workers pulling species indices from a shared queue.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    workers: usize,
}

impl Scheduler {
    /// Uses all the available processors when `requested` is `None`. There are never more workers
    /// than species, and always at least one.
    pub fn new(requested: Option<usize>, species: usize) -> Self {
        let workers = requested
            .unwrap_or_else(num_cpus::get)
            .min(species)
            .max(1);
        Self { workers }
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `job` once for every species index in `0..species` and waits for all of them.
    ///
    /// Results are ordered by species index. The phase fails if any job returned an error,
    /// panicked or was never picked up.
    pub fn run_phase<T, F>(&self, phase: Phase, species: usize, job: F) -> Result<Vec<T>, PhaseError>
    where
        T: Send,
        F: Fn(usize) -> anyhow::Result<T> + Sync,
    {
        let (job_sender, job_receiver) = channel::bounded(species.max(1));
        for index in 0..species {
            job_sender
                .send(index)
                .expect("job queue is large enough for every species");
        }
        drop(job_sender);

        let (ack_sender, ack_receiver) = channel::unbounded();
        let job = &job;
        scope(|scope| {
            for _ in 0..self.workers {
                let jobs = job_receiver.clone();
                let acks = ack_sender.clone();
                scope.spawn(move |_| run_worker(phase, job, jobs, acks));
            }
        })
        .expect("job panics are caught inside the workers");
        drop(ack_sender);

        let mut results: Vec<Option<T>> = (0..species).map(|_| None).collect();
        let mut failed = Vec::new();
        for (index, result) in ack_receiver {
            match result {
                Ok(result) => results[index] = Some(result),
                Err(err) => {
                    error!("{phase} failed for species {index}: {err:#}");
                    failed.push(index);
                }
            }
        }

        failed.sort_unstable();
        let missing: Vec<_> = results
            .iter()
            .enumerate()
            .filter(|&(index, result)| result.is_none() && failed.contains(&index).not())
            .map(|(index, _)| index)
            .collect();

        if failed.is_empty() && missing.is_empty() {
            Ok(results.into_iter().flatten().collect())
        } else {
            Err(PhaseError::Incomplete {
                phase,
                failed,
                missing,
            })
        }
    }
}

type Ack<T> = (usize, anyhow::Result<T>);

fn run_worker<T, F>(phase: Phase, job: &F, jobs: Receiver<usize>, acks: Sender<Ack<T>>)
where
    F: Fn(usize) -> anyhow::Result<T>,
{
    for species in jobs {
        let result = panic::catch_unwind(AssertUnwindSafe(|| job(species))).unwrap_or_else(
            |payload| {
                Err(anyhow!(
                    "{phase} panicked: {}",
                    panic_message(payload.as_ref())
                ))
            },
        );

        let failed = result.is_err();
        if acks.send((species, result)).is_err() || failed {
            break;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}

#[derive(Debug, thiserror::Error)]
pub enum PhaseError {
    #[error(
        "{phase} did not complete (failed species: {failed:?}, never processed species: {missing:?})"
    )]
    Incomplete {
        phase: Phase,
        failed: Vec<usize>,
        missing: Vec<usize>,
    },
}

#[cfg(test)]
mod tests {
    use anyhow::bail;

    use super::*;

    #[test]
    fn pool_size_is_bounded_by_species() {
        assert_eq!(Scheduler::new(Some(8), 3).workers(), 3);
        assert_eq!(Scheduler::new(Some(2), 5).workers(), 2);
        assert_eq!(Scheduler::new(Some(0), 5).workers(), 1);
        assert_eq!(Scheduler::new(Some(4), 0).workers(), 1);
        assert!(Scheduler::new(None, 1).workers() == 1);
    }

    #[test]
    fn results_are_ordered_by_species() {
        let scheduler = Scheduler { workers: 3 };
        let results = scheduler
            .run_phase(Phase::ProcessBlastHits, 10, |species| Ok(species * 2))
            .unwrap();

        assert_eq!(results, (0..10).map(|species| species * 2).collect::<Vec<_>>());
    }

    #[test]
    fn failures_are_reported() {
        let scheduler = Scheduler { workers: 1 };
        let err = scheduler
            .run_phase(Phase::ConnectCognates, 6, |species| {
                if species == 3 {
                    bail!("unable to read matrix");
                }
                Ok(())
            })
            .unwrap_err();

        let PhaseError::Incomplete {
            phase,
            failed,
            missing,
        } = err;
        assert_eq!(phase, Phase::ConnectCognates);
        assert_eq!(failed, [3]);
        // the only worker exits after the failure
        assert_eq!(missing, [4, 5]);
    }

    #[test]
    fn siblings_drain_the_queue_after_a_failure() {
        let scheduler = Scheduler { workers: 2 };
        let err = scheduler
            .run_phase(Phase::ProcessBlastHits, 8, |species| {
                if species == 0 {
                    bail!("corrupted input");
                }
                Ok(species)
            })
            .unwrap_err();

        let PhaseError::Incomplete {
            failed, missing, ..
        } = err;
        assert_eq!(failed, [0]);
        assert!(missing.is_empty());
    }

    #[test]
    fn panics_are_reported() {
        let scheduler = Scheduler { workers: 2 };
        let err = scheduler
            .run_phase(Phase::ProcessBlastHits, 4, |species| {
                assert_ne!(species, 1, "boom");
                Ok(species)
            })
            .unwrap_err();

        let PhaseError::Incomplete { failed, .. } = err;
        assert_eq!(failed, [1]);
    }

    #[test]
    fn no_species() {
        let results = Scheduler::new(None, 0)
            .run_phase(Phase::ConnectCognates, 0, |_| Ok(()))
            .unwrap();
        assert!(results.is_empty());
    }
}
