// src/particles.rs
//
// Rank-local particle container.
//
// Attributes live in parallel arrays. An attribute that is not in the store's
// mask keeps an empty array. Slots `0..np` hold the rank's own particles;
// slots `np..len()` are transient ghost copies appended by the halo exchange.

use std::ops::BitOr;

use rayon::prelude::*;

use crate::comm::{Communicator, Wire};
use crate::error::{PmError, Result};
use crate::grid::{wrap_position, SlabRange};

/// Set of particle attributes carried by a store or a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttrMask(u32);

impl AttrMask {
    pub const POS: AttrMask = AttrMask(1 << 0);
    pub const VEL: AttrMask = AttrMask(1 << 1);
    pub const ID: AttrMask = AttrMask(1 << 2);
    pub const ACC: AttrMask = AttrMask(1 << 3);
    pub const DX1: AttrMask = AttrMask(1 << 4);
    pub const DX2: AttrMask = AttrMask(1 << 5);

    pub const fn empty() -> Self {
        AttrMask(0)
    }

    pub const fn all() -> Self {
        AttrMask(0b11_1111)
    }

    #[inline]
    pub const fn contains(self, other: AttrMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AttrMask {
    type Output = AttrMask;

    fn bitor(self, rhs: AttrMask) -> AttrMask {
        AttrMask(self.0 | rhs.0)
    }
}

/// One particle with every attribute; used when particles travel between ranks.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Particle {
    pub x: [f64; 3],
    pub v: [f64; 3],
    pub id: u64,
    pub acc: [f64; 3],
    pub dx1: [f64; 3],
    pub dx2: [f64; 3],
}

impl Wire for Particle {
    fn encode(&self, out: &mut Vec<u8>) {
        self.x.encode(out);
        self.v.encode(out);
        self.id.encode(out);
        self.acc.encode(out);
        self.dx1.encode(out);
        self.dx2.encode(out);
    }

    fn decode(input: &mut &[u8]) -> Option<Self> {
        Some(Particle {
            x: Wire::decode(input)?,
            v: Wire::decode(input)?,
            id: Wire::decode(input)?,
            acc: Wire::decode(input)?,
            dx1: Wire::decode(input)?,
            dx2: Wire::decode(input)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ParticleStore {
    pub attributes: AttrMask,
    /// Logical (owned, non-ghost) particle count.
    pub np: usize,
    /// Capacity fixed at allocation time.
    pub np_upper: usize,
    len: usize,

    pub x: Vec<[f64; 3]>,
    pub v: Vec<[f64; 3]>,
    pub id: Vec<u64>,
    pub acc: Vec<[f64; 3]>,
    pub dx1: Vec<[f64; 3]>,
    pub dx2: Vec<[f64; 3]>,
}

/// Fail on every rank if any rank would exceed its capacity, so that all ranks
/// leave the collective path together.
pub fn check_capacity<C: Communicator>(
    comm: &C,
    needed: usize,
    capacity: usize,
    stage: &'static str,
) -> Result<()> {
    let all = comm.all_gather((needed, capacity));
    match all.iter().enumerate().find(|(_, &(n, c))| n > c) {
        Some((rank, &(needed, capacity))) => Err(PmError::CapacityOverflow {
            rank,
            needed,
            capacity,
            stage,
        }),
        None => Ok(()),
    }
}

impl ParticleStore {
    /// Empty store able to hold `capacity` particles with the given attributes.
    pub fn new(capacity: usize, attributes: AttrMask) -> Self {
        let reserve = |a: AttrMask| if attributes.contains(a) { capacity } else { 0 };
        Self {
            attributes,
            np: 0,
            np_upper: capacity,
            len: 0,
            x: Vec::with_capacity(reserve(AttrMask::POS)),
            v: Vec::with_capacity(reserve(AttrMask::VEL)),
            id: Vec::with_capacity(reserve(AttrMask::ID)),
            acc: Vec::with_capacity(reserve(AttrMask::ACC)),
            dx1: Vec::with_capacity(reserve(AttrMask::DX1)),
            dx2: Vec::with_capacity(reserve(AttrMask::DX2)),
        }
    }

    /// Store sized for an even share of `total` particles, over-allocated by
    /// `alloc_factor`.
    pub fn alloc_evenly<C: Communicator>(
        total: usize,
        attributes: AttrMask,
        alloc_factor: f64,
        comm: &C,
    ) -> Result<Self> {
        if !(alloc_factor >= 1.0) {
            return Err(PmError::config(format!(
                "alloc factor must be >= 1, got {}",
                alloc_factor
            )));
        }
        let mean = total as f64 / comm.size() as f64;
        let capacity = (mean * alloc_factor).ceil() as usize;
        Ok(Self::new(capacity, attributes))
    }

    /// Slots in use, ghosts included.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of ghost slots currently appended.
    #[inline]
    pub fn nghosts(&self) -> usize {
        self.len - self.np
    }

    #[inline]
    pub fn has(&self, a: AttrMask) -> bool {
        self.attributes.contains(a)
    }

    pub fn get(&self, i: usize) -> Particle {
        debug_assert!(i < self.len);
        let mut p = Particle::default();
        if self.has(AttrMask::POS) {
            p.x = self.x[i];
        }
        if self.has(AttrMask::VEL) {
            p.v = self.v[i];
        }
        if self.has(AttrMask::ID) {
            p.id = self.id[i];
        }
        if self.has(AttrMask::ACC) {
            p.acc = self.acc[i];
        }
        if self.has(AttrMask::DX1) {
            p.dx1 = self.dx1[i];
        }
        if self.has(AttrMask::DX2) {
            p.dx2 = self.dx2[i];
        }
        p
    }

    fn push_unchecked(&mut self, p: &Particle) {
        if self.has(AttrMask::POS) {
            self.x.push(p.x);
        }
        if self.has(AttrMask::VEL) {
            self.v.push(p.v);
        }
        if self.has(AttrMask::ID) {
            self.id.push(p.id);
        }
        if self.has(AttrMask::ACC) {
            self.acc.push(p.acc);
        }
        if self.has(AttrMask::DX1) {
            self.dx1.push(p.dx1);
        }
        if self.has(AttrMask::DX2) {
            self.dx2.push(p.dx2);
        }
        self.len += 1;
    }

    /// Append an owned particle. Not allowed while ghosts are attached.
    pub fn push(&mut self, p: Particle) -> Result<()> {
        debug_assert_eq!(self.np, self.len, "push with ghosts attached");
        if self.len >= self.np_upper {
            return Err(PmError::CapacityOverflow {
                rank: 0,
                needed: self.len + 1,
                capacity: self.np_upper,
                stage: "push",
            });
        }
        self.push_unchecked(&p);
        self.np = self.len;
        Ok(())
    }

    /// Grow by `count` zeroed slots past the current end (ghost storage).
    pub(crate) fn extend_slots(&mut self, count: usize) {
        let zero = Particle::default();
        for _ in 0..count {
            self.push_unchecked(&zero);
        }
    }

    /// Drop every slot at or after `len`.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.x.truncate(len);
        self.v.truncate(len);
        self.id.truncate(len);
        self.acc.truncate(len);
        self.dx1.truncate(len);
        self.dx2.truncate(len);
        self.len = self.len.min(len);
        self.np = self.np.min(len);
    }

    pub fn clear(&mut self) {
        self.truncate(0);
    }

    /// Apply periodic boundaries to every owned particle.
    pub fn wrap(&mut self, box_size: f64) {
        let np = self.np;
        self.x[..np].par_iter_mut().for_each(|x| {
            for d in 0..3 {
                x[d] = wrap_position(x[d], box_size);
            }
        });
    }

    /// Move every owned particle to the rank returned by `to_rank`.
    ///
    /// This transfers ownership (all-to-all); it is not a ghost copy.
    pub fn decompose<C, F>(&mut self, to_rank: F, comm: &C) -> Result<()>
    where
        C: Communicator,
        F: Fn(&[f64; 3]) -> usize,
    {
        debug_assert_eq!(self.np, self.len, "decompose with ghosts attached");

        let size = comm.size();
        let mut send: Vec<Vec<Particle>> = vec![Vec::new(); size];
        for i in 0..self.np {
            let target = to_rank(&self.x[i]);
            debug_assert!(target < size);
            send[target].push(self.get(i));
        }

        let recv = comm.all_to_all(send);
        let incoming: usize = recv.iter().map(Vec::len).sum();
        check_capacity(comm, incoming, self.np_upper, "decompose")?;

        self.clear();
        for p in recv.iter().flatten() {
            self.push_unchecked(p);
        }
        self.np = self.len;
        Ok(())
    }

    /// Place this rank's share of an `nc^3` particle lattice, offset by
    /// `shift`, with ids `ix * nc * nc + iy * nc + iz`.
    pub fn set_lagrangian_lattice<C: Communicator>(
        &mut self,
        nc: usize,
        box_size: f64,
        shift: [f64; 3],
        comm: &C,
    ) -> Result<()> {
        let total = nc * nc * nc;
        let share = SlabRange::split(total, comm.size(), comm.rank());
        check_capacity(comm, share.len(), self.np_upper, "lattice setup")?;

        let spacing = box_size / nc as f64;
        self.clear();
        for idx in share.start..share.end {
            let ix = idx / (nc * nc);
            let iy = (idx / nc) % nc;
            let iz = idx % nc;
            let q = [ix, iy, iz];
            let mut p = Particle {
                id: idx as u64,
                ..Particle::default()
            };
            for d in 0..3 {
                p.x[d] = wrap_position(q[d] as f64 * spacing + shift[d], box_size);
            }
            self.push_unchecked(&p);
        }
        self.np = self.len;
        Ok(())
    }

    /// Global number of owned particles.
    pub fn total_count<C: Communicator>(&self, comm: &C) -> usize {
        comm.all_reduce_sum_usize(self.np)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{LocalWorld, SerialComm};

    #[test]
    fn absent_attributes_stay_empty() {
        let mut s = ParticleStore::new(4, AttrMask::POS | AttrMask::ID);
        s.push(Particle {
            x: [1.0, 2.0, 3.0],
            v: [9.0; 3],
            id: 7,
            ..Particle::default()
        })
        .unwrap();
        assert_eq!(s.np, 1);
        assert!(s.v.is_empty());
        let p = s.get(0);
        assert_eq!(p.id, 7);
        assert_eq!(p.v, [0.0; 3]);
    }

    #[test]
    fn particle_bytes_carry_every_attribute() {
        let p = Particle {
            x: [0.5, 1.5, 2.5],
            v: [-1.0, 0.0, 1.0],
            id: 1 << 40,
            acc: [3.0; 3],
            dx1: [0.25; 3],
            dx2: [-0.125; 3],
        };
        let mut bytes = Vec::new();
        p.encode(&mut bytes);
        assert_eq!(bytes.len(), 16 * 8);
        assert_eq!(Particle::decode(&mut &bytes[..]), Some(p));
    }

    #[test]
    fn push_beyond_capacity_fails() {
        let mut s = ParticleStore::new(1, AttrMask::POS);
        s.push(Particle::default()).unwrap();
        assert!(matches!(
            s.push(Particle::default()),
            Err(PmError::CapacityOverflow { .. })
        ));
    }

    #[test]
    fn alloc_evenly_rounds_capacity_up() {
        let s = ParticleStore::alloc_evenly(1000, AttrMask::POS, 1.25, &SerialComm).unwrap();
        assert_eq!(s.np_upper, 1250);
        assert!(ParticleStore::alloc_evenly(10, AttrMask::POS, 0.5, &SerialComm).is_err());
    }

    #[test]
    fn lattice_covers_every_id_once_across_ranks() {
        let nc = 5;
        let ids = LocalWorld::run(3, |comm| {
            let mut s =
                ParticleStore::alloc_evenly(nc * nc * nc, AttrMask::POS | AttrMask::ID, 1.5, &comm)
                    .unwrap();
            s.set_lagrangian_lattice(nc, 10.0, [0.5; 3], &comm).unwrap();
            s.id.clone()
        })
        .unwrap();
        let mut all: Vec<u64> = ids.into_iter().flatten().collect();
        all.sort_unstable();
        assert_eq!(all, (0..(nc * nc * nc) as u64).collect::<Vec<_>>());
    }

    #[test]
    fn decompose_moves_particles_to_target_rank() {
        let nc = 4;
        let out = LocalWorld::run(2, |comm| {
            let mut s = ParticleStore::alloc_evenly(
                nc * nc * nc,
                AttrMask::POS | AttrMask::ID,
                2.0,
                &comm,
            )
            .unwrap();
            s.set_lagrangian_lattice(nc, 4.0, [0.5; 3], &comm).unwrap();
            // split on y instead of the lattice's x ordering
            s.decompose(|x| if x[1] < 2.0 { 0 } else { 1 }, &comm).unwrap();
            let ok = s.x[..s.np]
                .iter()
                .all(|x| (x[1] < 2.0) == (comm.rank() == 0));
            (ok, s.total_count(&comm))
        })
        .unwrap();
        for (ok, total) in out {
            assert!(ok);
            assert_eq!(total, nc * nc * nc);
        }
    }

    #[test]
    fn decompose_overflow_fails_on_every_rank() {
        let out = LocalWorld::run(2, |comm| {
            let mut s = ParticleStore::new(8, AttrMask::POS);
            for i in 0..8 {
                s.push(Particle {
                    x: [i as f64, 0.0, 0.0],
                    ..Particle::default()
                })
                .unwrap();
            }
            // everything to rank 0, which can hold only 8
            s.decompose(|_| 0, &comm).is_err()
        })
        .unwrap();
        assert_eq!(out, vec![true, true]);
    }
}
