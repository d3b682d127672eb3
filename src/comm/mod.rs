// src/comm/mod.rs
//
// Rank-to-rank collectives used by the solver.
//
// Every collective is blocking and must be entered by all ranks of the
// communicator in the same order. A rank that skips one deadlocks the job,
// which is the intended failure mode for control-flow divergence.
//
// Transports:
//  - SerialComm: a single rank; collectives are identities.
//  - LocalComm:  N ranks as scoped threads of one process, exchanging through
//                shared mailbox slots and a barrier (see LocalWorld::run).
//  - MpiComm:    one rank per MPI process (feature "mpi"). Payloads are
//                flattened with `Wire`, which is why every collective asks
//                for it even in-process.

use std::any::Any;
use std::sync::{Arc, Barrier, Mutex, MutexGuard};

use crate::error::{PmError, Result};

mod wire;
pub use wire::Wire;

#[cfg(feature = "mpi")]
mod mpi_comm;
#[cfg(feature = "mpi")]
pub use mpi_comm::MpiComm;

pub trait Communicator: Clone + Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn barrier(&self);

    /// Every rank receives every rank's value, indexed by source rank.
    fn all_gather<T: Wire + Clone + Send + 'static>(&self, value: T) -> Vec<T>;

    /// `send[d]` goes to rank `d`; the result's entry `s` came from rank `s`.
    fn all_to_all<T: Wire + Send + 'static>(&self, send: Vec<Vec<T>>) -> Vec<Vec<T>>;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Element-wise sum across ranks, accumulated in rank order so every rank
    /// sees bit-identical results.
    fn all_reduce_sum(&self, values: &mut [f64]) {
        if self.size() == 1 {
            return;
        }
        let parts = self.all_gather(values.to_vec());
        values.iter_mut().for_each(|v| *v = 0.0);
        for part in &parts {
            for (v, p) in values.iter_mut().zip(part) {
                *v += *p;
            }
        }
    }

    fn all_reduce_sum_usize(&self, value: usize) -> usize {
        self.all_gather(value).into_iter().sum()
    }

    fn all_reduce_min(&self, value: usize) -> usize {
        self.all_gather(value).into_iter().min().unwrap_or(value)
    }

    fn all_reduce_max(&self, value: usize) -> usize {
        self.all_gather(value).into_iter().max().unwrap_or(value)
    }
}

/// Single-rank communicator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn all_gather<T: Wire + Clone + Send + 'static>(&self, value: T) -> Vec<T> {
        vec![value]
    }

    fn all_to_all<T: Wire + Send + 'static>(&self, send: Vec<Vec<T>>) -> Vec<Vec<T>> {
        assert_eq!(send.len(), 1, "all_to_all: expected 1 send buffer");
        send
    }
}

type Slot = Option<Box<dyn Any + Send>>;

struct Shared {
    size: usize,
    barrier: Barrier,
    // size * size mailboxes; slot (src * size + dst)
    slots: Mutex<Vec<Slot>>,
}

/// One rank's handle onto an in-process world.
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("size", &self.shared.size)
            .finish()
    }
}

impl LocalComm {
    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        // A poisoned lock means another rank panicked mid-collective; the data
        // in the slots is still structurally valid.
        self.shared
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn all_gather<T: Wire + Clone + Send + 'static>(&self, value: T) -> Vec<T> {
        let n = self.shared.size;
        self.slots()[self.rank * n] = Some(Box::new(value));
        self.barrier();

        let out: Vec<T> = {
            let slots = self.slots();
            (0..n)
                .map(|src| {
                    slots[src * n]
                        .as_ref()
                        .and_then(|b| b.downcast_ref::<T>())
                        .cloned()
                        .expect("all_gather: ranks entered different collectives")
                })
                .collect()
        };

        // Nobody may overwrite a slot before every rank has read it.
        self.barrier();
        out
    }

    fn all_to_all<T: Wire + Send + 'static>(&self, send: Vec<Vec<T>>) -> Vec<Vec<T>> {
        let n = self.shared.size;
        assert_eq!(
            send.len(),
            n,
            "all_to_all: expected {} send buffers, got {}",
            n,
            send.len()
        );

        {
            let mut slots = self.slots();
            for (dst, buf) in send.into_iter().enumerate() {
                slots[self.rank * n + dst] = Some(Box::new(buf));
            }
        }
        self.barrier();

        let out: Vec<Vec<T>> = {
            let mut slots = self.slots();
            (0..n)
                .map(|src| {
                    slots[src * n + self.rank]
                        .take()
                        .and_then(|b| b.downcast::<Vec<T>>().ok())
                        .map(|b| *b)
                        .expect("all_to_all: ranks entered different collectives")
                })
                .collect()
        };

        self.barrier();
        out
    }
}

/// Turn a rank-local outcome into a collective one: every rank returns an
/// error if any rank failed.
pub fn agree<C: Communicator>(comm: &C, result: Result<()>, what: &str) -> Result<()> {
    let failed = comm.all_gather(result.is_err());
    result?;
    match failed.iter().position(|&f| f) {
        Some(rank) => Err(PmError::Io(std::io::Error::other(format!(
            "{} failed on rank {}",
            what, rank
        )))),
        None => Ok(()),
    }
}

/// Factory for in-process worlds.
pub struct LocalWorld;

impl LocalWorld {
    /// Handles for `size` ranks sharing one world.
    pub fn comms(size: usize) -> Result<Vec<LocalComm>> {
        if size == 0 {
            return Err(PmError::config("a world needs at least one rank"));
        }
        let shared = Arc::new(Shared {
            size,
            barrier: Barrier::new(size),
            slots: Mutex::new((0..size * size).map(|_| None).collect()),
        });
        Ok((0..size)
            .map(|rank| LocalComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect())
    }

    /// Run `f` once per rank on its own thread and collect results in rank order.
    /// A panic on any rank is re-raised on the caller.
    pub fn run<F, R>(size: usize, f: F) -> Result<Vec<R>>
    where
        F: Fn(LocalComm) -> R + Sync,
        R: Send,
    {
        let comms = Self::comms(size)?;
        let f = &f;
        let results = std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| s.spawn(move || f(comm)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        });
        Ok(results)
    }
}
