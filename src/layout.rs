//! Global all-to-all communication layout and the bulk exchange built on it.

use std::borrow::Cow;

use bytemuck::{Pod, Zeroable};
use ndarray::{Array, ArrayBase, Data, Dimension};

use crate::assign::{offsets_from_counts, Assignment, IndexWidth, ParticleIndex};
use crate::comm::{Communicator, Partition};
use crate::error::{DomainError, Result};

/// Plain-old-data element that can travel through an exchange.
pub trait Element: Pod + Send + Sync {
    /// Short type tag compared across ranks before every exchange.
    const DTYPE: &'static str;
}

macro_rules! impl_element {
    ($($t:ty => $tag:literal),*) => {
        $(
            impl Element for $t {
                const DTYPE: &'static str = $tag;
            }
        )*
    };
}

impl_element!(
    u8 => "u1", i8 => "i1", u16 => "u2", i16 => "i2", u32 => "u4",
    i32 => "i4", u64 => "u8", i64 => "i8", f32 => "f4", f64 => "f8"
);

/// What a rank is about to exchange, as seen by the other ranks.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PayloadDescriptor {
    length_ok: bool,
    // Element tag followed by the trailing shape, e.g. `f8[3]`.
    dtype: String,
}

impl PayloadDescriptor {
    fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![self.length_ok as u8];
        bytes.extend_from_slice(self.dtype.as_bytes());
        bytes
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            length_ok: bytes.first() == Some(&1),
            dtype: String::from_utf8_lossy(bytes.get(1..).unwrap_or(&[])).into_owned(),
        }
    }
}

/// A global all-to-all communication layout.
///
/// Built collectively from the per-destination counts and the index list of an [Assignment],
/// then reused for every attribute array of the same batch.
#[derive(Debug)]
pub struct Layout<'c, C: ?Sized, I = ParticleIndex> {
    comm: &'c C,
    send_counts: Vec<usize>,
    recv_counts: Vec<usize>,
    send_offsets: Vec<usize>,
    recv_offsets: Vec<usize>,
    // `None` sends the source rows as they are.
    indices: Option<Vec<I>>,
    source_len: usize,
    old_length: usize,
    new_length: usize,
    items_per_call: usize,
    rounds: usize,
}

impl<'c, C, I> Layout<'c, C, I>
where
    C: Communicator + ?Sized,
    I: IndexWidth,
{
    /// Negotiate receive counts with every rank. Collective.
    ///
    /// `send_counts[r]` items go to rank `r`; `indices` lists the rows of the source batch in
    /// send order and `source_len` is the number of rows of that batch.
    pub fn new(
        comm: &'c C,
        send_counts: Vec<usize>,
        indices: Vec<I>,
        source_len: usize,
    ) -> Result<Self> {
        if send_counts.len() != comm.size() {
            return Err(DomainError::LengthMismatch {
                expected: comm.size(),
                got: send_counts.len(),
            });
        }
        let old_length: usize = send_counts.iter().sum();
        if indices.len() != old_length {
            return Err(DomainError::LengthMismatch {
                expected: old_length,
                got: indices.len(),
            });
        }
        if let Some(i) = indices.iter().find(|i| i.to_usize() >= source_len) {
            return Err(DomainError::Configuration(format!(
                "index {i:?} outside source batch of {source_len} rows"
            )));
        }

        let send: Vec<u64> = send_counts.iter().map(|&c| c as u64).collect();
        let recv_counts: Vec<usize> = comm
            .all_to_all(&send)?
            .into_iter()
            .map(|c| c as usize)
            .collect();

        let items_per_call = comm.max_transfer_items().max(1);
        let rounds = agree_rounds(comm, &send_counts, &recv_counts, items_per_call)?;

        let new_length = recv_counts.iter().sum();
        tracing::debug!(
            rank = comm.rank(),
            old_length,
            new_length,
            rounds,
            "negotiated exchange layout"
        );

        Ok(Self {
            comm,
            send_offsets: offsets_from_counts(&send_counts),
            recv_offsets: offsets_from_counts(&recv_counts),
            send_counts,
            recv_counts,
            indices: Some(indices),
            source_len,
            old_length,
            new_length,
            items_per_call,
            rounds,
        })
    }

    /// Layout sending every particle of `assignment`. Collective.
    pub fn from_assignment(
        comm: &'c C,
        assignment: Assignment<I>,
        source_len: usize,
    ) -> Result<Self> {
        Self::new(comm, assignment.counts, assignment.indices, source_len)
    }

    /// Layout sending exchanged data back to where it came from. Needs no communication.
    ///
    /// Each rank gets its items back grouped by the rank it had sent them to.
    pub fn reversed(&self) -> Self {
        Self {
            comm: self.comm,
            send_counts: self.recv_counts.clone(),
            recv_counts: self.send_counts.clone(),
            send_offsets: self.recv_offsets.clone(),
            recv_offsets: self.send_offsets.clone(),
            indices: None,
            source_len: self.new_length,
            old_length: self.new_length,
            new_length: self.old_length,
            items_per_call: self.items_per_call,
            rounds: self.rounds,
        }
    }

    pub fn send_counts(&self) -> &[usize] {
        &self.send_counts
    }

    pub fn recv_counts(&self) -> &[usize] {
        &self.recv_counts
    }

    pub fn send_offsets(&self) -> &[usize] {
        &self.send_offsets
    }

    pub fn recv_offsets(&self) -> &[usize] {
        &self.recv_offsets
    }

    /// Source rows in send order, `None` for a reversed layout.
    pub fn indices(&self) -> Option<&[I]> {
        self.indices.as_deref()
    }

    /// Rows of the batch this layout was computed against.
    pub fn source_len(&self) -> usize {
        self.source_len
    }

    /// Items sent by this rank, ghosts included.
    pub fn old_length(&self) -> usize {
        self.old_length
    }

    /// Items this rank holds after an exchange.
    pub fn new_length(&self) -> usize {
        self.new_length
    }

    /// Number of variable-size exchange calls per payload.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Redistribute `data` according to the layout. Collective.
    ///
    /// `data` must have `source_len` rows and the same element type and trailing shape on every
    /// rank. The result has `new_length` rows ordered by source rank.
    pub fn exchange<A, S, D>(&self, data: &ArrayBase<S, D>) -> Result<Array<A, D>>
    where
        A: Element,
        S: Data<Elem = A>,
        D: Dimension,
    {
        self.validate::<A>(data.shape())?;

        let data = data.as_standard_layout();
        let flat = data.as_slice().ok_or_else(|| {
            DomainError::Configuration("payload is not contiguous".to_string())
        })?;
        let width: usize = data.shape()[1..].iter().product();

        // One contiguous block per destination.
        let send: Cow<'_, [A]> = match &self.indices {
            Some(indices) => {
                let mut buffer = Vec::with_capacity(self.old_length * width);
                for &i in indices {
                    let i = i.to_usize();
                    buffer.extend_from_slice(&flat[i * width..(i + 1) * width]);
                }
                Cow::Owned(buffer)
            }
            None => Cow::Borrowed(flat),
        };

        let mut recv = vec![A::zeroed(); self.new_length * width];
        let stride = width * std::mem::size_of::<A>();
        tracing::trace!(dtype = A::DTYPE, stride, rounds = self.rounds, "exchanging payload");
        self.transfer(
            bytemuck::cast_slice(&*send),
            bytemuck::cast_slice_mut(&mut recv[..]),
            stride,
        )?;

        let mut shape = data.raw_dim();
        shape[0] = self.new_length;
        Ok(Array::from_shape_vec(shape, recv)?)
    }

    /// Check with every rank that the payload about to be exchanged is consistent. Collective.
    ///
    /// All ranks see every descriptor, so they fail together rather than leaving a peer blocked
    /// in the transfer.
    fn validate<A: Element>(&self, shape: &[usize]) -> Result<()> {
        let got = shape.first().copied().unwrap_or(0);
        let local = PayloadDescriptor {
            length_ok: !shape.is_empty() && got == self.source_len,
            dtype: format!("{}{:?}", A::DTYPE, shape.get(1..).unwrap_or(&[])),
        };

        let descriptors: Vec<PayloadDescriptor> = self
            .comm
            .all_gather(&local.encode())?
            .iter()
            .map(|bytes| PayloadDescriptor::decode(bytes))
            .collect();

        if !local.length_ok {
            return Err(DomainError::LengthMismatch {
                expected: self.source_len,
                got,
            });
        }
        if descriptors.iter().any(|d| d.dtype != local.dtype) {
            tracing::warn!(rank = self.comm.rank(), "payload type differs across ranks");
            return Err(DomainError::TypeMismatch {
                descriptors: descriptors.into_iter().map(|d| d.dtype).collect(),
            });
        }
        if let Some(rank) = descriptors.iter().position(|d| !d.length_ok) {
            return Err(DomainError::PeerFailed { rank });
        }
        Ok(())
    }

    /// Move the gathered bytes, at most `items_per_call` items per block and call.
    fn transfer(&self, send: &[u8], recv: &mut [u8], stride: usize) -> Result<()> {
        for round in 0..self.rounds {
            let skip = round * self.items_per_call;
            let (send_counts, send_offsets) =
                round_blocks(&self.send_counts, &self.send_offsets, skip, self.items_per_call);
            let (recv_counts, recv_offsets) =
                round_blocks(&self.recv_counts, &self.recv_offsets, skip, self.items_per_call);
            self.comm.all_to_all_v(
                send,
                Partition::new(&send_counts, &send_offsets),
                recv,
                Partition::new(&recv_counts, &recv_offsets),
                stride,
            )?;
        }
        Ok(())
    }
}

/// Number of transfer rounds every rank will run, from the largest block anywhere in the group.
fn agree_rounds<C: Communicator + ?Sized>(
    comm: &C,
    send_counts: &[usize],
    recv_counts: &[usize],
    items_per_call: usize,
) -> Result<usize> {
    let local_max = send_counts.iter().chain(recv_counts).copied().max().unwrap_or(0) as u64;
    let mut global_max = 0;
    for (from, bytes) in comm.all_gather(&local_max.to_le_bytes())?.into_iter().enumerate() {
        let bytes: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| DomainError::TransferMismatch {
                from,
                expected: 8,
                got: bytes.len(),
            })?;
        global_max = global_max.max(u64::from_le_bytes(bytes) as usize);
    }
    Ok(global_max.div_ceil(items_per_call).max(1))
}

/// The slice of every block moved in the round that starts `skip` items into the block.
fn round_blocks(
    counts: &[usize],
    offsets: &[usize],
    skip: usize,
    items_per_call: usize,
) -> (Vec<usize>, Vec<usize>) {
    counts
        .iter()
        .zip(offsets)
        .map(|(&count, &offset)| {
            let done = skip.min(count);
            ((count - done).min(items_per_call), offset + done)
        })
        .unzip()
}
