//! Assignment of particles to every rank whose sub-domain they touch.
//!
//! Runs in three side-effect-free stages: [bin_spans] digitizes each particle's support interval
//! per dimension, [count_destinations] sizes every destination block, and [fill_indices] writes
//! the particle indices into a buffer of exactly that size.

use std::fmt::Debug;

use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Zip};

use crate::coordinates::{
    bin_upper_from_coordinate, periodic_bin_from_coordinate, ravel_coordinate, wrap_bin, BinIndex,
    Rank,
};
use crate::error::{DomainError, Result};
use crate::grid::GridNd;
use crate::Float;

/// Default width of particle indices. Bounds the number of items per chunk.
pub type ParticleIndex = u32;

/// Unsigned integer type used to store particle indices.
pub trait IndexWidth: Copy + Default + Debug + Send + Sync + 'static {
    /// Largest index (and index count) the type can hold.
    const CAPACITY: usize;

    /// Truncating conversion. Callers check against [IndexWidth::CAPACITY] first.
    fn from_usize(index: usize) -> Self;

    fn to_usize(self) -> usize;
}

macro_rules! impl_index_width {
    ($($t:ty),*) => {
        $(
            impl IndexWidth for $t {
                const CAPACITY: usize = <$t>::MAX as usize;

                fn from_usize(index: usize) -> Self {
                    index as $t
                }

                fn to_usize(self) -> usize {
                    self as usize
                }
            }
        )*
    };
}

impl_index_width!(u8, u16, u32, u64, usize);

/// What happens to support intervals reaching past the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// The domain wraps around; ghosts crossing a face reappear on the opposite side.
    Periodic,
    /// Anything outside the domain is dropped.
    Open,
}

/// Support radius of the particles.
#[derive(Debug, Clone)]
pub enum Smoothing<'a> {
    Uniform(Float),
    PerParticle(ArrayView1<'a, Float>),
}

impl Default for Smoothing<'_> {
    fn default() -> Self {
        Smoothing::Uniform(0.)
    }
}

impl From<Float> for Smoothing<'_> {
    fn from(radius: Float) -> Self {
        Smoothing::Uniform(radius)
    }
}

impl<'a> From<ArrayView1<'a, Float>> for Smoothing<'a> {
    fn from(radii: ArrayView1<'a, Float>) -> Self {
        Smoothing::PerParticle(radii)
    }
}

impl Smoothing<'_> {
    fn check_len(&self, n_particles: usize) -> Result<()> {
        match self {
            Smoothing::PerParticle(radii) if radii.len() != n_particles => {
                Err(DomainError::LengthMismatch {
                    expected: n_particles,
                    got: radii.len(),
                })
            }
            _ => Ok(()),
        }
    }

    fn radii(&self, n_particles: usize) -> Result<Array1<Float>> {
        self.check_len(n_particles)?;
        let radii = match self {
            Smoothing::Uniform(radius) => Array1::from_elem(n_particles, *radius),
            Smoothing::PerParticle(radii) => radii.to_owned(),
        };
        if let Some(particle) = radii.iter().position(|r| !(r.is_finite() && *r >= 0.)) {
            return Err(DomainError::InvalidRadius {
                particle,
                radius: radii[particle] as f64,
            });
        }
        Ok(radii)
    }
}

/// Per-destination item counts and the particle indices grouped by destination rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment<I = ParticleIndex> {
    /// Number of items for each rank, indexed by rank.
    pub counts: Vec<usize>,
    /// Particle indices, one block per rank in ascending rank order, insertion-ordered within a
    /// block.
    pub indices: Vec<I>,
}

impl<I: IndexWidth> Assignment<I> {
    /// Total number of items, ghosts included.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Indices of the particles sent to `rank`.
    pub fn block(&self, rank: Rank) -> &[I] {
        let start: usize = self.counts[..rank].iter().sum();
        &self.indices[start..start + self.counts[rank]]
    }
}

/// Range of mesh bins `[lower, upper)` touched by each particle, shape `(n_particles, ndim)`.
///
/// Periodic spans are not wrapped yet and can reach below 0 or past the mesh extent.
#[derive(Debug, Clone)]
pub struct BinSpans {
    pub lower: Array2<BinIndex>,
    pub upper: Array2<BinIndex>,
}

impl BinSpans {
    pub fn n_particles(&self) -> usize {
        self.lower.nrows()
    }
}

/// Exclusive prefix sum of `counts`.
pub fn offsets_from_counts(counts: &[usize]) -> Vec<usize> {
    counts
        .iter()
        .scan(0, |total, &count| {
            let offset = *total;
            *total += count;
            Some(offset)
        })
        .collect()
}

/// Stage 1: digitize the support interval of every particle along every dimension.
pub fn bin_spans(
    grid: &GridNd,
    positions: ArrayView2<'_, Float>,
    smoothing: &Smoothing<'_>,
    boundary: Boundary,
) -> Result<BinSpans> {
    let (n_particles, ndim) = positions.dim();
    if ndim != grid.ndim() {
        return Err(DomainError::Configuration(format!(
            "positions have {ndim} dimensions, grid has {}",
            grid.ndim()
        )));
    }
    if let Some(((particle, dim), _)) = positions.indexed_iter().find(|(_, x)| !x.is_finite()) {
        return Err(DomainError::InvalidPosition { particle, dim });
    }
    let radii = smoothing.radii(n_particles)?;

    let mut lower = Array2::zeros((n_particles, ndim));
    let mut upper = Array2::zeros((n_particles, ndim));
    Zip::from(lower.rows_mut())
        .and(upper.rows_mut())
        .and(positions.rows())
        .and(&radii)
        .par_for_each(|mut lo, mut hi, pos, &radius| {
            for d in 0..ndim {
                let edges = &grid.edges()[d];
                let n_bins = grid.dims()[d] as BinIndex;
                let x = pos[d];
                let (l, h) = match boundary {
                    Boundary::Periodic => {
                        // Each end is digitized in its own period, so spans may leave the mesh.
                        let l = periodic_bin_from_coordinate(x - radius, edges);
                        let h = periodic_bin_from_coordinate(x + radius, edges) + 1;
                        // One full turn already covers every bin once.
                        if h - l > n_bins {
                            (0, n_bins)
                        } else {
                            (l, h)
                        }
                    }
                    Boundary::Open => {
                        let l = bin_upper_from_coordinate(x - radius, edges) - 1;
                        let h = bin_upper_from_coordinate(x + radius, edges);
                        (l.clamp(0, n_bins), h.clamp(0, n_bins))
                    }
                };
                lo[d] = l;
                hi[d] = h;
            }
        });

    Ok(BinSpans { lower, upper })
}

/// Every rank in the Cartesian product of the bin ranges, wrapped onto the mesh.
fn destinations<'a>(
    lower: ArrayView1<'a, BinIndex>,
    upper: ArrayView1<'a, BinIndex>,
    dims: &'a [usize],
) -> impl Iterator<Item = Rank> + 'a {
    lower
        .into_iter()
        .zip(upper)
        .map(|(&l, &h)| l..h)
        .multi_cartesian_product()
        .map(move |bins| {
            let coord: Vec<usize> = bins.iter().zip(dims).map(|(&b, &n)| wrap_bin(b, n)).collect();
            ravel_coordinate(&coord, dims)
        })
}

/// Stage 2: number of items each rank will receive from this batch.
pub fn count_destinations(spans: &BinSpans, dims: &[usize]) -> Vec<usize> {
    let mut counts = vec![0; dims.iter().product()];
    for (lo, hi) in spans.lower.rows().into_iter().zip(spans.upper.rows()) {
        for rank in destinations(lo, hi, dims) {
            counts[rank] += 1;
        }
    }
    counts
}

/// Stage 3: particle indices grouped by destination, sized exactly by `counts`.
pub fn fill_indices<I: IndexWidth>(spans: &BinSpans, dims: &[usize], counts: &[usize]) -> Vec<I> {
    let mut cursor = offsets_from_counts(counts);
    let mut indices = vec![I::default(); counts.iter().sum()];
    for (particle, (lo, hi)) in spans
        .lower
        .rows()
        .into_iter()
        .zip(spans.upper.rows())
        .enumerate()
    {
        for rank in destinations(lo, hi, dims) {
            indices[cursor[rank]] = I::from_usize(particle);
            cursor[rank] += 1;
        }
    }
    indices
}

/// Assign each particle to every rank whose sub-domain lies within its support radius.
pub fn assign<I: IndexWidth>(
    grid: &GridNd,
    positions: ArrayView2<'_, Float>,
    smoothing: Smoothing<'_>,
    boundary: Boundary,
) -> Result<Assignment<I>> {
    let n_particles = positions.nrows();
    smoothing.check_len(n_particles)?;
    if n_particles == 0 {
        return Ok(Assignment {
            counts: vec![0; grid.n_ranks()],
            indices: vec![],
        });
    }

    let spans = bin_spans(grid, positions, &smoothing, boundary)?;
    let counts = count_destinations(&spans, grid.dims());

    let n_items: usize = counts.iter().sum();
    let required = n_items.max(n_particles);
    if required > I::CAPACITY {
        return Err(DomainError::Capacity {
            required,
            capacity: I::CAPACITY,
        });
    }

    let indices = fill_indices(&spans, grid.dims(), &counts);
    tracing::trace!(n_particles, n_items, "assigned particles to ranks");
    Ok(Assignment { counts, indices })
}
