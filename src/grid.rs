// src/grid.rs

/// Cubic periodic grid of `n` points per side covering `[0, box_size)^3`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid3D {
    pub n: usize,
    pub box_size: f64,
}

impl Grid3D {
    pub fn new(n: usize, box_size: f64) -> Self {
        Self { n, box_size }
    }

    /// Spacing between mesh points.
    #[inline]
    pub fn cell_size(&self) -> f64 {
        self.box_size / self.n as f64
    }

    /// Total number of mesh points, also the transform normalisation.
    pub fn n_cells(&self) -> usize {
        self.n * self.n * self.n
    }

    pub fn volume(&self) -> f64 {
        self.box_size * self.box_size * self.box_size
    }

    /// Fundamental wavenumber 2π / L.
    pub fn k0(&self) -> f64 {
        2.0 * std::f64::consts::PI / self.box_size
    }

    /// Map a signed mesh index into `0..n`.
    #[inline]
    pub fn wrap_index(&self, i: isize) -> usize {
        i.rem_euclid(self.n as isize) as usize
    }

    /// Index of the mesh cell whose lower corner is at or below `x`.
    #[inline]
    pub fn cell_of(&self, x: f64) -> usize {
        let u = (x / self.cell_size()).floor() as isize;
        self.wrap_index(u)
    }
}

/// Fold a coordinate back into `[0, box_size)`.
#[inline]
pub fn wrap_position(x: f64, box_size: f64) -> f64 {
    let w = x - box_size * (x / box_size).floor();
    // x slightly below zero can round up to exactly box_size
    if w >= box_size {
        0.0
    } else {
        w
    }
}

/// Half-open index range `[start, end)` owned by one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabRange {
    pub start: usize,
    pub end: usize,
}

impl SlabRange {
    /// Even split of `0..n` into `parts` contiguous slabs; slab `index`.
    pub fn split(n: usize, parts: usize, index: usize) -> Self {
        debug_assert!(index < parts);
        Self {
            start: index * n / parts,
            end: (index + 1) * n / parts,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    #[inline]
    pub fn contains(&self, i: usize) -> bool {
        i >= self.start && i < self.end
    }
}

/// Which of the `parts` slabs of `0..n` contains index `i`.
#[inline]
pub fn slab_owner(n: usize, parts: usize, i: usize) -> usize {
    debug_assert!(i < n);
    // largest r with floor(r * n / parts) <= i
    ((i + 1) * parts - 1) / n
}
