//! Collective primitives for a fixed-size group of workers.
//!
//! Every worker holds one [`Comm`] carrying its rank, the group size, and
//! shared slot storage. Collectives must be entered by all ranks in the
//! same order; each call blocks until the whole group has joined, which is
//! the only cross-worker ordering the engines rely on.

use std::any::Any;
use std::sync::{Arc, Barrier, Mutex};

struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Box<dyn Any + Send>>>>,
}

/// One worker's endpoint into the group.
pub struct Comm {
    rank: usize,
    ranks: usize,
    shared: Arc<Shared>,
}

impl Comm {
    /// Build a group of `ranks` endpoints, one per worker.
    pub fn group(ranks: usize) -> Vec<Comm> {
        assert!(ranks > 0, "worker group must have at least one rank");
        let shared = Arc::new(Shared {
            barrier: Barrier::new(ranks),
            slots: Mutex::new((0..ranks).map(|_| None).collect()),
        });
        (0..ranks)
            .map(|rank| Comm {
                rank,
                ranks,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn ranks(&self) -> usize {
        self.ranks
    }

    pub fn barrier(&self) {
        self.shared.barrier.wait();
    }

    /// Every rank contributes one value; every rank receives all values in
    /// rank order.
    pub fn all_gather<T: Clone + Send + 'static>(&self, value: T) -> Vec<T> {
        self.shared.slots.lock().unwrap()[self.rank] = Some(Box::new(value));
        self.shared.barrier.wait();
        let out: Vec<T> = {
            let slots = self.shared.slots.lock().unwrap();
            slots
                .iter()
                .map(|slot| {
                    slot.as_ref()
                        .and_then(|v| v.downcast_ref::<T>())
                        .expect("collective entered with mismatched types")
                        .clone()
                })
                .collect()
        };
        // Nobody may overwrite a slot for the next collective until every
        // rank has read this round.
        self.shared.barrier.wait();
        out
    }

    /// The root's value, delivered to every rank. Non-root ranks pass
    /// `None`.
    pub fn broadcast<T: Clone + Send + 'static>(&self, value: Option<T>, root: usize) -> T {
        let gathered = self.all_gather(value);
        gathered
            .into_iter()
            .nth(root)
            .flatten()
            .expect("broadcast root supplied no value")
    }

    pub fn all_reduce_sum(&self, value: u64) -> u64 {
        self.all_gather(value).iter().sum()
    }

    pub fn all_reduce_max(&self, value: u64) -> u64 {
        self.all_gather(value).into_iter().max().unwrap_or(0)
    }

    /// Exclusive prefix sum over rank contributions: the sum of values
    /// held by ranks below this one.
    pub fn exscan_sum(&self, value: u64) -> u64 {
        self.all_gather(value)[..self.rank].iter().sum()
    }

    /// Logical-or reduction used for aggregate error reporting: true on
    /// every rank iff any rank flagged a failure.
    pub fn any_failed(&self, failed: bool) -> bool {
        self.all_gather(failed).into_iter().any(|b| b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_group<F, T>(ranks: usize, f: F) -> Vec<T>
    where
        F: Fn(Comm) -> T + Sync,
        T: Send,
    {
        let comms = Comm::group(ranks);
        thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| s.spawn(|| f(comm)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn all_gather_orders_by_rank() {
        let out = run_group(4, |comm| comm.all_gather(comm.rank() as u64 * 10));
        for got in out {
            assert_eq!(got, vec![0, 10, 20, 30]);
        }
    }

    #[test]
    fn exscan_is_exclusive() {
        let out = run_group(4, |comm| (comm.rank(), comm.exscan_sum(comm.rank() as u64 + 1)));
        // contributions 1,2,3,4 -> prefixes 0,1,3,6
        for (rank, prefix) in out {
            let want = [0, 1, 3, 6][rank];
            assert_eq!(prefix, want);
        }
    }

    #[test]
    fn reduce_and_broadcast_agree_across_ranks() {
        let out = run_group(3, |comm| {
            let total = comm.all_reduce_sum(comm.rank() as u64 + 1);
            let widest = comm.all_reduce_max(comm.rank() as u64 * 7);
            let root_word = comm.broadcast(
                if comm.rank() == 0 { Some("planned") } else { None },
                0,
            );
            let failed = comm.any_failed(comm.rank() == 2);
            (total, widest, root_word, failed)
        });
        for (total, widest, word, failed) in out {
            assert_eq!(total, 6);
            assert_eq!(widest, 14);
            assert_eq!(word, "planned");
            assert!(failed);
        }
    }

    #[test]
    fn consecutive_collectives_do_not_bleed() {
        let out = run_group(2, |comm| {
            let a = comm.all_gather(comm.rank() as u32);
            let b = comm.all_gather((comm.rank() + 5) as u32);
            (a, b)
        });
        for (a, b) in out {
            assert_eq!(a, vec![0, 1]);
            assert_eq!(b, vec![5, 6]);
        }
    }
}
