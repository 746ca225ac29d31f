//! A process group whose ranks are threads of one process, talking over lock-free channels.

use std::cell::{Cell, RefCell};
use std::thread;
use std::time::{Duration, Instant};

use lockfree::channel::mpsc::{self, Receiver, Sender};
use lockfree::channel::RecvErr;

use crate::comm::{Communicator, Partition};
use crate::error::{DomainError, Result};

#[derive(Debug)]
enum Payload {
    Sync,
    Count(u64),
    Bytes(Vec<u8>),
}

#[derive(Debug)]
struct Envelope {
    // Sequence number of the collective this message belongs to.
    epoch: u64,
    // Rank of thread that sent the message.
    sent_by: usize,
    payload: Payload,
}

#[derive(Debug)]
struct Inbox {
    rx: Receiver<Envelope>,
    // Messages of later collectives that arrived before this rank got there.
    parked: Vec<Envelope>,
}

/// Tuning of a [ThreadComm] group.
#[derive(Debug, Clone, Copy)]
pub struct CommOptions {
    /// Give up on a collective after this long. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Largest block a single variable-size exchange may carry, in items.
    pub max_transfer_items: usize,
}

impl Default for CommOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            max_transfer_items: i32::MAX as usize,
        }
    }
}

/// Communicator handed to one thread of the group.
///
/// Every collective takes the next sequence number, so messages of consecutive collectives never
/// mix even when a fast rank runs ahead.
#[derive(Debug)]
pub struct ThreadComm {
    pub rank: usize,
    // Total number of threads.
    pub size: usize,
    tx: Vec<Sender<Envelope>>,
    inbox: RefCell<Inbox>,
    epoch: Cell<u64>,
    options: CommOptions,
}

impl ThreadComm {
    pub fn create_communicators(number: usize) -> Vec<ThreadComm> {
        Self::create_communicators_with(number, CommOptions::default())
    }

    pub fn create_communicators_with(number: usize, options: CommOptions) -> Vec<ThreadComm> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..number).map(|_| mpsc::create()).unzip();

        receivers
            .into_iter()
            .enumerate()
            .map(|(i, rx)| ThreadComm {
                rank: i,
                size: number,
                tx: senders.clone(),
                inbox: RefCell::new(Inbox { rx, parked: vec![] }),
                epoch: Cell::new(0),
                options,
            })
            .collect()
    }

    /// Run `f` once per communicator, each on its own scoped thread.
    ///
    /// Returns the results in rank order. A panic on any rank is resumed on the caller.
    pub fn spawn_ranks<F, R>(communicators: Vec<ThreadComm>, f: F) -> Vec<R>
    where
        F: Fn(&ThreadComm) -> R + Sync,
        R: Send,
    {
        let f = &f;
        thread::scope(|s| {
            let handles: Vec<_> = communicators
                .into_iter()
                .map(|comm| s.spawn(move || f(&comm)))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        })
    }

    fn next_epoch(&self) -> u64 {
        let epoch = self.epoch.get();
        self.epoch.set(epoch + 1);
        epoch
    }

    fn post(&self, to: usize, epoch: u64, payload: Payload) -> Result<()> {
        self.tx[to]
            .send(Envelope {
                epoch,
                sent_by: self.rank,
                payload,
            })
            .map_err(|_| DomainError::Disconnected { rank: to })
    }

    /// Block until every rank delivered its message for `epoch`. Indexed by sender.
    fn collect(&self, epoch: u64) -> Result<Vec<Payload>> {
        let mut slots: Vec<Option<Payload>> = (0..self.size).map(|_| None).collect();
        let mut received = 0;
        let mut inbox = self.inbox.borrow_mut();

        for envelope in std::mem::take(&mut inbox.parked) {
            if envelope.epoch == epoch {
                slots[envelope.sent_by] = Some(envelope.payload);
                received += 1;
            } else {
                inbox.parked.push(envelope);
            }
        }

        let start = Instant::now();
        while received < self.size {
            match inbox.rx.recv() {
                Ok(envelope) if envelope.epoch == epoch => {
                    slots[envelope.sent_by] = Some(envelope.payload);
                    received += 1;
                }
                Ok(envelope) => inbox.parked.push(envelope),
                Err(RecvErr::NoMessage) => {
                    if let Some(timeout) = self.options.timeout {
                        if start.elapsed() > timeout {
                            return Err(DomainError::Timeout {
                                rank: self.rank,
                                epoch,
                            });
                        }
                    }
                    thread::yield_now();
                }
                Err(RecvErr::NoSender) => return Err(DomainError::Disconnected { rank: self.rank }),
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }

    fn check_block(&self, count: usize) -> Result<()> {
        if count > self.options.max_transfer_items {
            return Err(DomainError::Capacity {
                required: count,
                capacity: self.options.max_transfer_items,
            });
        }
        Ok(())
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    /// Blocking barrier for all threads in ThreadComm.
    fn barrier(&self) -> Result<()> {
        let epoch = self.next_epoch();
        for to in 0..self.size {
            self.post(to, epoch, Payload::Sync)?;
        }
        for (from, payload) in self.collect(epoch)?.into_iter().enumerate() {
            if !matches!(payload, Payload::Sync) {
                return Err(DomainError::CollectiveMismatch { from });
            }
        }
        Ok(())
    }

    fn all_to_all(&self, send: &[u64]) -> Result<Vec<u64>> {
        if send.len() != self.size {
            return Err(DomainError::LengthMismatch {
                expected: self.size,
                got: send.len(),
            });
        }
        let epoch = self.next_epoch();
        for (to, &value) in send.iter().enumerate() {
            self.post(to, epoch, Payload::Count(value))?;
        }
        self.collect(epoch)?
            .into_iter()
            .enumerate()
            .map(|(from, payload)| match payload {
                Payload::Count(value) => Ok(value),
                _ => Err(DomainError::CollectiveMismatch { from }),
            })
            .collect()
    }

    fn all_to_all_v(
        &self,
        send: &[u8],
        send_parts: Partition<'_>,
        recv: &mut [u8],
        recv_parts: Partition<'_>,
        stride: usize,
    ) -> Result<()> {
        for peer in 0..self.size {
            self.check_block(send_parts.counts[peer])?;
            self.check_block(recv_parts.counts[peer])?;
        }

        let epoch = self.next_epoch();
        for to in 0..self.size {
            let block = send[send_parts.byte_range(to, stride)].to_vec();
            self.post(to, epoch, Payload::Bytes(block))?;
        }

        for (from, payload) in self.collect(epoch)?.into_iter().enumerate() {
            let Payload::Bytes(block) = payload else {
                return Err(DomainError::CollectiveMismatch { from });
            };
            let range = recv_parts.byte_range(from, stride);
            if block.len() != range.len() {
                return Err(DomainError::TransferMismatch {
                    from,
                    expected: range.len(),
                    got: block.len(),
                });
            }
            recv[range].copy_from_slice(&block);
        }
        Ok(())
    }

    fn all_gather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>> {
        let epoch = self.next_epoch();
        for to in 0..self.size {
            self.post(to, epoch, Payload::Bytes(local.to_vec()))?;
        }
        self.collect(epoch)?
            .into_iter()
            .enumerate()
            .map(|(from, payload)| match payload {
                Payload::Bytes(bytes) => Ok(bytes),
                _ => Err(DomainError::CollectiveMismatch { from }),
            })
            .collect()
    }

    fn max_transfer_items(&self) -> usize {
        self.options.max_transfer_items
    }
}

/// Run `f` on `n_ranks` threads with a timeout, so a broken collective fails the test instead of
/// hanging it.
#[cfg(test)]
pub(crate) fn run_ranks<F, R>(n_ranks: usize, f: F) -> Vec<R>
where
    F: Fn(&ThreadComm) -> R + Sync,
    R: Send,
{
    let options = CommOptions {
        timeout: Some(Duration::from_secs(10)),
        ..CommOptions::default()
    };
    ThreadComm::spawn_ranks(ThreadComm::create_communicators_with(n_ranks, options), f)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_create_communicators() {
        let communicators = ThreadComm::create_communicators(3);
        let ranks: Vec<_> = communicators.iter().map(|c| (c.rank, c.size)).collect();
        assert_eq!(vec![(0, 3), (1, 3), (2, 3)], ranks);
    }

    #[test]
    fn test_repeated_barriers_do_not_mix() {
        let done = run_ranks(4, |comm| {
            for _ in 0..50 {
                comm.barrier().unwrap();
            }
            true
        });
        assert_eq!(vec![true; 4], done);
    }

    #[test]
    fn test_all_to_all_transposes() {
        let received = run_ranks(3, |comm| {
            let send: Vec<u64> = (0..3).map(|to| (10 * comm.rank + to) as u64).collect();
            comm.all_to_all(&send).unwrap()
        });
        assert_eq!(
            vec![vec![0, 10, 20], vec![1, 11, 21], vec![2, 12, 22]],
            received
        );
    }

    #[test]
    fn test_all_gather() {
        let gathered = run_ranks(3, |comm| comm.all_gather(&[comm.rank as u8; 2]).unwrap());
        for g in gathered {
            assert_eq!(vec![vec![0, 0], vec![1, 1], vec![2, 2]], g);
        }
    }

    #[test]
    fn test_all_to_all_v() {
        // Rank r sends r + 1 one-byte items to every peer.
        let received = run_ranks(3, |comm| {
            let r = comm.rank;
            let send = vec![r as u8; 3 * (r + 1)];
            let send_counts = vec![r + 1; 3];
            let send_offsets: Vec<_> = (0..3).map(|i| i * (r + 1)).collect();
            let recv_counts = vec![1, 2, 3];
            let recv_offsets = vec![0, 1, 3];
            let mut recv = vec![0u8; 6];
            comm.all_to_all_v(
                &send,
                Partition::new(&send_counts, &send_offsets),
                &mut recv,
                Partition::new(&recv_counts, &recv_offsets),
                1,
            )
            .unwrap();
            recv
        });
        for recv in received {
            assert_eq!(vec![0, 1, 1, 2, 2, 2], recv);
        }
    }

    #[test]
    fn test_block_above_ceiling_is_rejected() {
        let options = CommOptions {
            timeout: Some(Duration::from_secs(10)),
            max_transfer_items: 2,
        };
        let comm = ThreadComm::create_communicators_with(1, options).remove(0);
        let mut recv = [0u8; 3];
        let result = comm.all_to_all_v(
            &[1, 2, 3],
            Partition::new(&[3], &[0]),
            &mut recv,
            Partition::new(&[3], &[0]),
            1,
        );
        assert!(matches!(
            result,
            Err(DomainError::Capacity {
                required: 3,
                capacity: 2
            })
        ));
    }

    #[test]
    fn test_missing_rank_times_out() {
        let options = CommOptions {
            timeout: Some(Duration::from_millis(50)),
            ..CommOptions::default()
        };
        let communicators = ThreadComm::create_communicators_with(2, options);
        let results = ThreadComm::spawn_ranks(communicators, |comm| {
            if comm.rank == 0 {
                comm.barrier().err()
            } else {
                // Stay alive without joining the barrier.
                thread::sleep(Duration::from_millis(300));
                None
            }
        });
        assert!(matches!(
            results[0],
            Some(DomainError::Timeout { rank: 0, epoch: 0 })
        ));
    }

    #[test]
    fn test_mismatched_collectives_are_detected() {
        let results = run_ranks(2, |comm| {
            if comm.rank == 0 {
                comm.barrier().err()
            } else {
                comm.all_gather(&[1]).err()
            }
        });
        assert!(matches!(
            results[0],
            Some(DomainError::CollectiveMismatch { from: 1 })
        ));
        assert!(matches!(
            results[1],
            Some(DomainError::CollectiveMismatch { from: 0 })
        ));
    }
}
