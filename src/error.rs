//! Error type shared by the decomposition and exchange code.

use thiserror::Error;

/// Errors raised while building a decomposition or exchanging data.
#[derive(Error, Debug)]
pub enum DomainError {
    /// Grid edges, mesh shape or process group are inconsistent.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Ranks disagree on the element type or trailing shape of a payload.
    #[error("payload type differs across ranks: {descriptors:?}")]
    TypeMismatch {
        /// Descriptor reported by every rank, indexed by rank.
        descriptors: Vec<String>,
    },

    /// An array does not have the length the operation was built for.
    #[error("length mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    /// The request exceeds a fixed width (index type or per-call transfer size).
    #[error("capacity exceeded: required {required}, capacity is {capacity}")]
    Capacity { required: usize, capacity: usize },

    /// A particle coordinate is NaN or infinite.
    #[error("particle {particle} has a non-finite coordinate in dimension {dim}")]
    InvalidPosition { particle: usize, dim: usize },

    /// A support radius is negative or not finite.
    #[error("particle {particle} has invalid support radius {radius}")]
    InvalidRadius { particle: usize, radius: f64 },

    /// Another rank rejected its payload, so this rank aborts the exchange too.
    #[error("rank {rank} failed to validate its payload")]
    PeerFailed { rank: usize },

    /// The channel to a rank was closed.
    #[error("rank {rank} disconnected")]
    Disconnected { rank: usize },

    /// A collective did not complete in time, usually a call-order mismatch.
    #[error("collective {epoch} on rank {rank} timed out")]
    Timeout { rank: usize, epoch: u64 },

    /// A rank answered with a different collective, so the call order diverged.
    #[error("rank {from} is in a different collective")]
    CollectiveMismatch { from: usize },

    /// A rank delivered a different number of bytes than announced.
    #[error("rank {from} sent {got} bytes, expected {expected}")]
    TransferMismatch {
        from: usize,
        expected: usize,
        got: usize,
    },

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

pub type Result<T> = std::result::Result<T, DomainError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::LengthMismatch {
            expected: 10,
            got: 7,
        };
        assert_eq!(err.to_string(), "length mismatch: expected 10, got 7");

        let err = DomainError::Capacity {
            required: 300,
            capacity: 255,
        };
        assert_eq!(
            err.to_string(),
            "capacity exceeded: required 300, capacity is 255"
        );

        let err = DomainError::TypeMismatch {
            descriptors: vec!["f4[]".to_string(), "f8[]".to_string()],
        };
        assert_eq!(
            err.to_string(),
            r#"payload type differs across ranks: ["f4[]", "f8[]"]"#
        );
    }
}
