//! Running a region one rank at a time.

use crate::comm::Communicator;
use crate::error::Result;

/// Run `f` on every rank in ascending rank order. Collective.
///
/// Rank `r` waits through `r` barriers before running `f` and through the remaining ones
/// afterwards, so no rank returns before every rank has finished `f`. Every rank calls
/// [Communicator::barrier] `size + 2` times, even when `f` panics.
pub fn in_rank_order<C, F, R>(comm: &C, f: F) -> Result<R>
where
    C: Communicator + ?Sized,
    F: FnOnce() -> R,
{
    comm.barrier()?;
    for _ in 0..comm.rank() {
        comm.barrier()?;
    }

    let mut exit = ExitRounds { comm, armed: true };
    let result = f();
    exit.armed = false;
    exit.run()?;
    Ok(result)
}

/// Barriers a rank still owes the group after running its turn.
struct ExitRounds<'a, C: Communicator + ?Sized> {
    comm: &'a C,
    // Set until the turn returned normally.
    armed: bool,
}

impl<C: Communicator + ?Sized> ExitRounds<'_, C> {
    fn run(&self) -> Result<()> {
        for _ in self.comm.rank()..self.comm.size() {
            self.comm.barrier()?;
        }
        self.comm.barrier()
    }
}

impl<C: Communicator + ?Sized> Drop for ExitRounds<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            // Unwinding out of the turn. Peers still wait in the region; errors have nowhere to go.
            let _ = self.run();
        }
    }
}

#[cfg(test)]
mod test {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::comm::SelfComm;
    use crate::thread_comm::run_ranks;

    #[test]
    fn test_single_rank() {
        assert_eq!(7, in_rank_order(&SelfComm, || 7).unwrap());
    }

    #[test]
    fn test_ranks_enter_in_order() {
        let log = Mutex::new(vec![]);
        run_ranks(4, |comm| {
            // Later ranks arrive first.
            thread::sleep(Duration::from_millis(10 * (3 - comm.rank) as u64));
            in_rank_order(comm, || {
                log.lock().unwrap().push(comm.rank);
                thread::sleep(Duration::from_millis(5));
            })
            .unwrap();
        });
        assert_eq!(vec![0, 1, 2, 3], log.into_inner().unwrap());
    }

    #[test]
    fn test_panicking_turn_releases_peers() {
        let finished = run_ranks(3, |comm| {
            panic::catch_unwind(AssertUnwindSafe(|| {
                in_rank_order(comm, || {
                    if comm.rank == 1 {
                        panic!("turn of rank 1 failed");
                    }
                })
                .unwrap();
            }))
            .is_ok()
        });
        assert_eq!(vec![true, false, true], finished);
    }

    #[test]
    fn test_nobody_leaves_early() {
        let entered = Mutex::new(0);
        let seen_on_exit = run_ranks(3, |comm| {
            in_rank_order(comm, || *entered.lock().unwrap() += 1).unwrap();
            *entered.lock().unwrap()
        });
        assert_eq!(vec![3, 3, 3], seen_on_exit);
    }
}
