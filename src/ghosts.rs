// src/ghosts.rs
//
// Halo exchange for the CIC stencil.
//
// `append` copies selected attributes of every owned particle whose stencil
// reaches another rank's slab to that rank, where the copies are appended
// after the owned particles. `reduce` sends one attribute of the ghosts back
// to the owners and combines it there. The owner keeps its own contribution
// under `Reduction::Sum`.

use crate::comm::{agree, Communicator};
use crate::error::{PmError, Result};
use crate::mesh::ParticleMesh;
use crate::particles::{check_capacity, AttrMask, ParticleStore};

/// One exchangeable particle attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    Position,
    Velocity,
    Id,
    /// A single acceleration component.
    Acceleration(usize),
    Dx1,
    Dx2,
}

impl Attribute {
    /// f64 words per particle.
    pub fn width(self) -> usize {
        match self {
            Attribute::Id | Attribute::Acceleration(_) => 1,
            _ => 3,
        }
    }

    fn mask(self) -> AttrMask {
        match self {
            Attribute::Position => AttrMask::POS,
            Attribute::Velocity => AttrMask::VEL,
            Attribute::Id => AttrMask::ID,
            Attribute::Acceleration(_) => AttrMask::ACC,
            Attribute::Dx1 => AttrMask::DX1,
            Attribute::Dx2 => AttrMask::DX2,
        }
    }

    /// Attributes selected by a mask, accelerations split per axis.
    pub fn expand(mask: AttrMask) -> Vec<Attribute> {
        let mut out = Vec::new();
        if mask.contains(AttrMask::POS) {
            out.push(Attribute::Position);
        }
        if mask.contains(AttrMask::VEL) {
            out.push(Attribute::Velocity);
        }
        if mask.contains(AttrMask::ID) {
            out.push(Attribute::Id);
        }
        if mask.contains(AttrMask::ACC) {
            out.extend((0..3).map(Attribute::Acceleration));
        }
        if mask.contains(AttrMask::DX1) {
            out.push(Attribute::Dx1);
        }
        if mask.contains(AttrMask::DX2) {
            out.push(Attribute::Dx2);
        }
        out
    }

    fn pack(self, store: &ParticleStore, i: usize, buf: &mut Vec<f64>) {
        match self {
            Attribute::Position => buf.extend_from_slice(&store.x[i]),
            Attribute::Velocity => buf.extend_from_slice(&store.v[i]),
            Attribute::Id => buf.push(f64::from_bits(store.id[i])),
            Attribute::Acceleration(d) => buf.push(store.acc[i][d]),
            Attribute::Dx1 => buf.extend_from_slice(&store.dx1[i]),
            Attribute::Dx2 => buf.extend_from_slice(&store.dx2[i]),
        }
    }

    fn unpack(self, store: &mut ParticleStore, i: usize, src: &[f64], op: Reduction) {
        fn combine3(dst: &mut [f64; 3], src: &[f64], op: Reduction) {
            for (d, s) in dst.iter_mut().zip(src) {
                op.apply(d, *s);
            }
        }
        match self {
            Attribute::Position => combine3(&mut store.x[i], src, op),
            Attribute::Velocity => combine3(&mut store.v[i], src, op),
            // ids are labels; they are only ever copied
            Attribute::Id => store.id[i] = src[0].to_bits(),
            Attribute::Acceleration(d) => op.apply(&mut store.acc[i][d], src[0]),
            Attribute::Dx1 => combine3(&mut store.dx1[i], src, op),
            Attribute::Dx2 => combine3(&mut store.dx2[i], src, op),
        }
    }
}

/// How a returned ghost value is combined into the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Assign,
    Sum,
}

impl Reduction {
    #[inline]
    fn apply(self, dst: &mut f64, src: f64) {
        match self {
            Reduction::Assign => *dst = src,
            Reduction::Sum => *dst += src,
        }
    }
}

/// Bookkeeping for one append/reduce cycle. Lives for one force evaluation.
#[derive(Debug)]
pub struct Ghosts {
    attributes: Vec<Attribute>,
    /// Owned particle indices sent to each rank, in send order.
    send_index: Vec<Vec<usize>>,
    /// Ghosts received from each rank; stored contiguously in rank order.
    recv_counts: Vec<usize>,
    first_ghost: usize,
    nghosts: usize,
}

impl Ghosts {
    /// Append ghost copies of the `mask` attributes (collective).
    pub fn append<C: Communicator>(
        store: &mut ParticleStore,
        mesh: &ParticleMesh<C>,
        mask: AttrMask,
    ) -> Result<Ghosts> {
        let comm = mesh.comm();
        agree(comm, Self::check_append(store, mask), "ghost append")?;
        let size = comm.size();
        let attributes = Attribute::expand(mask);
        let width: usize = attributes.iter().map(|a| a.width()).sum();

        let mut send_index: Vec<Vec<usize>> = vec![Vec::new(); size];
        let mut send: Vec<Vec<f64>> = vec![Vec::new(); size];
        for i in 0..store.np {
            for r in mesh.stencil_ranks(&store.x[i]) {
                send_index[r].push(i);
                for a in &attributes {
                    a.pack(store, i, &mut send[r]);
                }
            }
        }

        let recv = comm.all_to_all(send);
        let recv_counts: Vec<usize> = recv.iter().map(|b| b.len() / width).collect();
        let nghosts: usize = recv_counts.iter().sum();
        check_capacity(comm, store.np + nghosts, store.np_upper, "ghost append")?;

        let first_ghost = store.len();
        store.extend_slots(nghosts);
        let mut slot = first_ghost;
        for buf in &recv {
            for chunk in buf.chunks_exact(width) {
                let mut off = 0;
                for a in &attributes {
                    let w = a.width();
                    a.unpack(store, slot, &chunk[off..off + w], Reduction::Assign);
                    off += w;
                }
                slot += 1;
            }
        }

        Ok(Ghosts {
            attributes,
            send_index,
            recv_counts,
            first_ghost,
            nghosts,
        })
    }

    fn check_append(store: &ParticleStore, mask: AttrMask) -> Result<()> {
        if store.nghosts() != 0 {
            return Err(PmError::config("ghosts are already attached to this store"));
        }
        if !store.has(mask) {
            return Err(PmError::config(format!(
                "ghost attributes {:?} missing from store {:?}",
                mask, store.attributes
            )));
        }
        if Attribute::expand(mask).is_empty() {
            return Err(PmError::config("ghost append needs at least one attribute"));
        }
        Ok(())
    }

    /// Number of ghost slots appended.
    #[inline]
    pub fn count(&self) -> usize {
        self.nghosts
    }

    /// Attributes copied at append time.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Sum each ghost's `attr` back into its owner (collective).
    pub fn reduce<C: Communicator>(
        &self,
        store: &mut ParticleStore,
        attr: Attribute,
        comm: &C,
    ) -> Result<()> {
        self.reduce_with(store, attr, Reduction::Sum, comm)
    }

    pub fn reduce_with<C: Communicator>(
        &self,
        store: &mut ParticleStore,
        attr: Attribute,
        op: Reduction,
        comm: &C,
    ) -> Result<()> {
        let local = if store.has(attr.mask()) {
            Ok(())
        } else {
            Err(PmError::config(format!(
                "cannot reduce {:?}: attribute missing from store",
                attr
            )))
        };
        agree(comm, local, "ghost reduce")?;
        let w = attr.width();

        // ghosts go back to the rank they came from, in arrival order
        let mut send: Vec<Vec<f64>> = Vec::with_capacity(self.recv_counts.len());
        let mut slot = self.first_ghost;
        for &count in &self.recv_counts {
            let mut buf = Vec::with_capacity(count * w);
            for _ in 0..count {
                attr.pack(store, slot, &mut buf);
                slot += 1;
            }
            send.push(buf);
        }

        let recv = comm.all_to_all(send);
        for (r, buf) in recv.iter().enumerate() {
            for (&owner, chunk) in self.send_index[r].iter().zip(buf.chunks_exact(w)) {
                attr.unpack(store, owner, chunk, op);
            }
        }
        Ok(())
    }

    /// Drop the ghost slots from the store.
    pub fn destroy(self, store: &mut ParticleStore) {
        store.truncate(self.first_ghost);
    }
}
