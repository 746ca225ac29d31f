//! Decomposition of space into a mesh of sub-domains, one per rank.

use ndarray::ArrayView2;

use crate::assign::{assign, Boundary, ParticleIndex, Smoothing};
use crate::comm::Communicator;
use crate::coordinates::{ravel_coordinate, unravel_rank, Rank};
use crate::error::{DomainError, Result};
use crate::layout::Layout;
use crate::Float;

/// ND domain decomposition on a rectilinear grid.
///
/// `edges[d]` are the bin edges along dimension `d`; the last one is the extent of the domain.
/// The ranks form a mesh of `edges[d].len() - 1` bins per dimension.
#[derive(Debug, Clone)]
pub struct GridNd {
    edges: Vec<Vec<Float>>,
    dims: Vec<usize>,
    periodic: bool,
    rank: Rank,
    rank_coordinate: Vec<usize>,
    start: Vec<Float>,
    end: Vec<Float>,
}

impl GridNd {
    pub fn new(edges: Vec<Vec<Float>>, periodic: bool, rank: Rank, n_ranks: usize) -> Result<Self> {
        if edges.is_empty() {
            return Err(DomainError::Configuration(
                "grid needs at least one dimension".to_string(),
            ));
        }
        for (d, e) in edges.iter().enumerate() {
            if e.len() < 2 {
                return Err(DomainError::Configuration(format!(
                    "dimension {d} has {} edges, need at least 2",
                    e.len()
                )));
            }
            if e.iter().any(|x| !x.is_finite()) {
                return Err(DomainError::Configuration(format!(
                    "dimension {d} has a non-finite edge"
                )));
            }
            if e.windows(2).any(|w| w[1] < w[0]) {
                return Err(DomainError::Configuration(format!(
                    "edges of dimension {d} are decreasing"
                )));
            }
        }

        let dims: Vec<usize> = edges.iter().map(|e| e.len() - 1).collect();
        let mesh_size: usize = dims.iter().product();
        if mesh_size != n_ranks {
            return Err(DomainError::Configuration(format!(
                "mesh {dims:?} has {mesh_size} sub-domains but the group has {n_ranks} ranks"
            )));
        }
        if rank >= n_ranks {
            return Err(DomainError::Configuration(format!(
                "rank {rank} outside group of {n_ranks}"
            )));
        }

        let rank_coordinate = unravel_rank(rank, &dims);
        let start = edges.iter().zip(&rank_coordinate).map(|(e, &c)| e[c]).collect();
        let end = edges.iter().zip(&rank_coordinate).map(|(e, &c)| e[c + 1]).collect();

        Ok(Self {
            edges,
            dims,
            periodic,
            rank,
            rank_coordinate,
            start,
            end,
        })
    }

    /// Grid for the calling rank of `comm`.
    pub fn for_comm<C: Communicator + ?Sized>(
        edges: Vec<Vec<Float>>,
        periodic: bool,
        comm: &C,
    ) -> Result<Self> {
        Self::new(edges, periodic, comm.rank(), comm.size())
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Number of sub-domains along each dimension.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn edges(&self) -> &[Vec<Float>] {
        &self.edges
    }

    /// Size of the domain along dimension `d`.
    pub fn extent(&self, d: usize) -> Float {
        self.edges[d][self.dims[d]]
    }

    pub fn periodic(&self) -> bool {
        self.periodic
    }

    pub fn boundary(&self) -> Boundary {
        if self.periodic {
            Boundary::Periodic
        } else {
            Boundary::Open
        }
    }

    pub fn n_ranks(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn rank_coordinate(&self) -> &[usize] {
        &self.rank_coordinate
    }

    /// Lower corner of this rank's sub-domain (inclusive).
    pub fn start(&self) -> &[Float] {
        &self.start
    }

    /// Upper corner of this rank's sub-domain (exclusive).
    pub fn end(&self) -> &[Float] {
        &self.end
    }

    /// Rank owning the mesh cell `coord`.
    pub fn rank_of(&self, coord: &[usize]) -> Rank {
        ravel_coordinate(coord, &self.dims)
    }

    /// Assign `positions` to ranks and negotiate the exchange layout. Collective.
    ///
    /// Any particle within its smoothing radius of a sub-domain is sent to that sub-domain.
    pub fn decompose<'c, C: Communicator + ?Sized>(
        &self,
        comm: &'c C,
        positions: ArrayView2<'_, Float>,
        smoothing: Smoothing<'_>,
    ) -> Result<Layout<'c, C>> {
        let assignment = assign::<ParticleIndex>(self, positions, smoothing, self.boundary())?;
        Layout::from_assignment(comm, assignment, positions.nrows())
    }
}

/// Split `n_ranks` into a near-square 2D mesh `(nx, ny)` with `nx <= ny`.
pub fn mesh_shape_2d(n_ranks: usize) -> (usize, usize) {
    let mut nx = ((n_ranks as f64).sqrt() as usize).max(1);
    while n_ranks % nx != 0 {
        nx -= 1;
    }
    (nx, n_ranks / nx)
}

/// Edges splitting `pixels` into `n_parts` runs of whole tiles of `tile_padding` pixels.
///
/// The last edge is rounded up to a full tile, so it can exceed `pixels`.
pub fn tiled_edges(pixels: usize, n_parts: usize, tile_padding: usize) -> Vec<Float> {
    let n_tiles = (pixels + tile_padding - 1) / tile_padding;
    (0..=n_parts)
        .map(|i| (i * n_tiles / n_parts * tile_padding) as Float)
        .collect()
}
