//! Collective communication required by the decomposition.
//!
//! Every method is collective: all ranks of the group must call it, in the same order, or the
//! group stalls.

use crate::error::{DomainError, Result};

/// Per-peer block sizes and starting positions of a buffer, in items.
#[derive(Debug, Clone, Copy)]
pub struct Partition<'a> {
    pub counts: &'a [usize],
    pub offsets: &'a [usize],
}

impl<'a> Partition<'a> {
    pub fn new(counts: &'a [usize], offsets: &'a [usize]) -> Self {
        debug_assert_eq!(counts.len(), offsets.len());
        Self { counts, offsets }
    }

    /// Byte range of the block for `peer` with items of `stride` bytes.
    pub fn byte_range(&self, peer: usize, stride: usize) -> std::ops::Range<usize> {
        let start = self.offsets[peer] * stride;
        start..start + self.counts[peer] * stride
    }
}

pub trait Communicator {
    /// This process's rank.
    fn rank(&self) -> usize;

    /// Number of processes in the group.
    fn size(&self) -> usize;

    fn barrier(&self) -> Result<()>;

    /// Send `send[i]` to rank `i`; element `j` of the result came from rank `j`.
    fn all_to_all(&self, send: &[u64]) -> Result<Vec<u64>>;

    /// Variable-size exchange of opaque items of `stride` bytes.
    ///
    /// Block `i` of `send` goes to rank `i`; the block received from rank `j` is written at
    /// `recv_parts` position `j` of `recv`.
    fn all_to_all_v(
        &self,
        send: &[u8],
        send_parts: Partition<'_>,
        recv: &mut [u8],
        recv_parts: Partition<'_>,
        stride: usize,
    ) -> Result<()>;

    /// Collect a small buffer from every rank, indexed by rank.
    fn all_gather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Largest number of items a single [Communicator::all_to_all_v] block may hold.
    fn max_transfer_items(&self) -> usize {
        i32::MAX as usize
    }
}

/// Group consisting of the calling process only.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfComm;

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn all_to_all(&self, send: &[u64]) -> Result<Vec<u64>> {
        if send.len() != 1 {
            return Err(DomainError::LengthMismatch {
                expected: 1,
                got: send.len(),
            });
        }
        Ok(send.to_vec())
    }

    fn all_to_all_v(
        &self,
        send: &[u8],
        send_parts: Partition<'_>,
        recv: &mut [u8],
        recv_parts: Partition<'_>,
        stride: usize,
    ) -> Result<()> {
        let src = send_parts.byte_range(0, stride);
        let dst = recv_parts.byte_range(0, stride);
        if src.len() != dst.len() {
            return Err(DomainError::TransferMismatch {
                from: 0,
                expected: dst.len(),
                got: src.len(),
            });
        }
        recv[dst].copy_from_slice(&send[src]);
        Ok(())
    }

    fn all_gather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(vec![local.to_vec()])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_self_comm_rank_and_size() {
        let comm = SelfComm;
        assert_eq!(comm.rank(), 0);
        assert_eq!(comm.size(), 1);
        comm.barrier().unwrap();
    }

    #[test]
    fn test_self_comm_all_to_all_v_copies_block() {
        let comm = SelfComm;
        let send = [1u8, 2, 3, 4, 5, 6];
        let mut recv = [0u8; 8];
        comm.all_to_all_v(
            &send,
            Partition::new(&[2], &[1]),
            &mut recv,
            Partition::new(&[2], &[2]),
            2,
        )
        .unwrap();
        assert_eq!([0, 0, 0, 0, 3, 4, 5, 6], recv);
    }

    #[test]
    fn test_self_comm_all_to_all_rejects_wrong_length() {
        assert!(matches!(
            SelfComm.all_to_all(&[1, 2]),
            Err(DomainError::LengthMismatch {
                expected: 1,
                got: 2
            })
        ));
    }
}
