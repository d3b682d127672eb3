// src/comm/mpi_comm.rs
//
// Communicator over MPI_COMM_WORLD. Every payload is flattened with `Wire`
// and moved as bytes by the variable-count collectives; the byte counts go
// first so receivers can size their buffers.
//
// Only the thread that initialised MPI may call into this communicator.

use mpi::collective::SystemOperation;
use mpi::datatype::{Partition, PartitionMut};
use mpi::environment::Universe;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use mpi::Count;

use super::wire::Wire;

/// One process's handle onto the MPI world.
#[derive(Debug, Clone, Copy)]
pub struct MpiComm {
    rank: usize,
    size: usize,
}

impl MpiComm {
    /// The universe must outlive every use of the handle.
    pub fn world(universe: &Universe) -> Self {
        let world = universe.world();
        Self {
            rank: world.rank() as usize,
            size: world.size() as usize,
        }
    }

    fn raw(&self) -> SimpleCommunicator {
        SimpleCommunicator::world()
    }
}

fn count(n: usize) -> Count {
    Count::try_from(n).unwrap_or_else(|_| panic!("{} bytes exceed one MPI message", n))
}

fn displacements(counts: &[Count]) -> Vec<Count> {
    counts
        .iter()
        .scan(0, |at, &c| {
            let d = *at;
            *at += c;
            Some(d)
        })
        .collect()
}

fn decode_each<T: Wire>(bytes: &[u8], counts: &[Count]) -> Vec<T> {
    let mut rest = bytes;
    counts
        .iter()
        .enumerate()
        .map(|(src, &c)| {
            let (mut chunk, tail) = rest.split_at(c as usize);
            rest = tail;
            T::decode(&mut chunk)
                .unwrap_or_else(|| panic!("malformed payload from rank {}", src))
        })
        .collect()
}

impl super::Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        self.raw().barrier();
    }

    fn all_gather<T: Wire + Clone + Send + 'static>(&self, value: T) -> Vec<T> {
        let world = self.raw();
        let mut bytes = Vec::new();
        value.encode(&mut bytes);

        let mut counts = vec![0 as Count; self.size];
        world.all_gather_into(&count(bytes.len()), &mut counts[..]);
        let displs = displacements(&counts);
        let total: usize = counts.iter().map(|&c| c as usize).sum();

        let mut recv = vec![0u8; total];
        {
            let mut part = PartitionMut::new(&mut recv[..], &counts[..], &displs[..]);
            world.all_gather_varcount_into(&bytes[..], &mut part);
        }
        decode_each(&recv, &counts)
    }

    fn all_to_all<T: Wire + Send + 'static>(&self, send: Vec<Vec<T>>) -> Vec<Vec<T>> {
        assert_eq!(
            send.len(),
            self.size,
            "all_to_all: expected {} send buffers, got {}",
            self.size,
            send.len()
        );
        let world = self.raw();

        let mut bytes = Vec::new();
        let mut send_counts = Vec::with_capacity(self.size);
        for buf in &send {
            let start = bytes.len();
            buf.encode(&mut bytes);
            send_counts.push(count(bytes.len() - start));
        }
        drop(send);
        let send_displs = displacements(&send_counts);

        let mut recv_counts = vec![0 as Count; self.size];
        world.all_to_all_into(&send_counts[..], &mut recv_counts[..]);
        let recv_displs = displacements(&recv_counts);
        let total: usize = recv_counts.iter().map(|&c| c as usize).sum();

        let mut recv = vec![0u8; total];
        {
            let outgoing = Partition::new(&bytes[..], &send_counts[..], &send_displs[..]);
            let mut incoming = PartitionMut::new(&mut recv[..], &recv_counts[..], &recv_displs[..]);
            world.all_to_all_varcount_into(&outgoing, &mut incoming);
        }
        decode_each(&recv, &recv_counts)
    }

    // Integer reductions go straight to MPI. The f64 sum keeps the default
    // rank-ordered gather so every rank sees the same bits.

    fn all_reduce_sum_usize(&self, value: usize) -> usize {
        let mut out = 0u64;
        self.raw()
            .all_reduce_into(&(value as u64), &mut out, SystemOperation::sum());
        out as usize
    }

    fn all_reduce_min(&self, value: usize) -> usize {
        let mut out = 0u64;
        self.raw()
            .all_reduce_into(&(value as u64), &mut out, SystemOperation::min());
        out as usize
    }

    fn all_reduce_max(&self, value: usize) -> usize {
        let mut out = 0u64;
        self.raw()
            .all_reduce_into(&(value as u64), &mut out, SystemOperation::max());
        out as usize
    }
}
