//! Domain decomposition of particles on an ND grid of ranks, with ghost duplication and a
//! generic all-to-all exchange of per-particle attribute arrays.

pub mod assign;
pub mod comm;
pub mod config;
pub mod coordinates;
pub mod error;
pub mod grid;
pub mod layout;
pub mod ordered;
pub mod thread_comm;

pub use assign::{assign, Assignment, Boundary, IndexWidth, ParticleIndex, Smoothing};
pub use comm::{Communicator, Partition, SelfComm};
pub use error::{DomainError, Result};
pub use grid::GridNd;
pub use layout::{Element, Layout};
pub use ordered::in_rank_order;
pub use thread_comm::{CommOptions, ThreadComm};

/// Choose between f32 and f64 to change precision of floating point numbers.
pub type Float = f64;
