//! In-process communicators. Each rank is a thread holding a `Communicator`; ranks of
//! the same group share a mailbox and a barrier, which is enough to run the collectives
//! the FFT needs (all-to-all, all-reduce, all-gather) with MPI-like semantics.
//!
//! Collectives must be entered by every rank of the group, in the same order. A rank
//! that never arrives blocks the others, the same as a real collective.

use std::{
    any::Any,
    cell::RefCell,
    collections::HashMap,
    fmt,
    sync::{Arc, Barrier, Mutex, MutexGuard},
};

use crate::error::CommError;

type Slot = Option<Box<dyn Any + Send>>;

struct Shared {
    size: usize,
    barrier: Barrier,
    /// `size × size` slots; `[src * size + dst]` carries the block from src to dst.
    mailbox: Mutex<Vec<Slot>>,
    /// One slot per rank, for reductions and gathers.
    board: Mutex<Vec<Slot>>,
}

#[derive(Clone)]
pub struct Communicator {
    shared: Arc<Shared>,
    rank: usize,
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.rank)
            .field("size", &self.shared.size)
            .finish()
    }
}

/// The three communicators of one rank in a 2D rank grid.
#[derive(Debug, Clone)]
pub struct RankComms {
    pub world: Communicator,
    /// Ranks that share one distributed FFT.
    pub fft: Communicator,
    /// The complementary axis: ranks holding the same z-slab of different FFTs.
    pub ortho: Communicator,
}

fn lock<'a>(m: &'a Mutex<Vec<Slot>>, op: &'static str) -> Result<MutexGuard<'a, Vec<Slot>>, CommError> {
    m.lock().map_err(|_| CommError::Poisoned(op))
}

impl Communicator {
    /// A group of `n` ranks. Hand one to each thread.
    pub fn world(n: usize) -> Vec<Self> {
        assert!(n > 0, "a communicator needs at least one rank");

        let shared = Arc::new(Shared {
            size: n,
            barrier: Barrier::new(n),
            mailbox: Mutex::new((0..n * n).map(|_| None).collect()),
            board: Mutex::new((0..n).map(|_| None).collect()),
        });

        (0..n)
            .map(|rank| Self {
                shared: Arc::clone(&shared),
                rank,
            })
            .collect()
    }

    /// Single-rank communicator.
    pub fn solo() -> Self {
        Self::world(1).remove(0)
    }

    /// A `n_fft × n_ortho` rank grid. World rank `f * n_ortho + o` has FFT rank `f` and
    /// ortho rank `o`; the returned vector is indexed by world rank.
    pub fn grid(n_fft: usize, n_ortho: usize) -> Vec<RankComms> {
        let world = Self::world(n_fft * n_ortho);
        let mut fft: Vec<Vec<Self>> = (0..n_ortho).map(|_| Self::world(n_fft)).collect();
        let mut ortho: Vec<Vec<Self>> = (0..n_fft).map(|_| Self::world(n_ortho)).collect();

        // Pop from the back so the indices line up.
        let mut out: Vec<RankComms> = world
            .into_iter()
            .rev()
            .map(|w| {
                let (f, o) = (w.rank / n_ortho, w.rank % n_ortho);
                RankComms {
                    fft: fft[o].remove(f),
                    ortho: ortho[f].remove(o),
                    world: w,
                }
            })
            .collect();
        out.reverse();
        out
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Whether both handles belong to the same group (not necessarily the same rank).
    pub fn same_group(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn barrier(&self) {
        self.shared.barrier.wait();
    }

    /// Personalized all-to-all. `send` holds contiguous blocks for ranks 0..size with
    /// lengths `send_counts`; `recv` receives contiguous blocks from ranks 0..size with
    /// lengths `recv_counts`.
    ///
    /// A rank whose buffers don't match its counts still takes part in both rounds so
    /// its peers aren't left in the barrier; it posts nothing, and they get `PeerFailed`.
    pub fn all_to_all_v<T: Copy + Send + 'static>(
        &self,
        send: &[T],
        send_counts: &[usize],
        recv: &mut [T],
        recv_counts: &[usize],
    ) -> Result<(), CommError> {
        const OP: &str = "all_to_all_v";
        let size = self.size();

        let local = check_len(OP, send_counts.len(), size)
            .and_then(|()| check_len(OP, recv_counts.len(), size))
            .and_then(|()| check_len(OP, send.len(), send_counts.iter().sum()))
            .and_then(|()| check_len(OP, recv.len(), recv_counts.iter().sum()));

        if size == 1 {
            local?;
            recv.copy_from_slice(send);
            return Ok(());
        }

        let posted = local.and_then(|()| {
            let mut mailbox = lock(&self.shared.mailbox, OP)?;
            let mut offset = 0;
            for (dst, &n) in send_counts.iter().enumerate() {
                mailbox[self.rank * size + dst] = Some(Box::new(send[offset..offset + n].to_vec()));
                offset += n;
            }
            Ok(())
        });
        self.barrier();

        // Drain this rank's column even after a local failure, so no stale block is
        // picked up by the next exchange.
        let drained = lock(&self.shared.mailbox, OP).map(|mut mailbox| {
            (0..size)
                .map(|src| mailbox[src * size + self.rank].take())
                .collect::<Vec<Slot>>()
        });
        // Nobody may refill the mailbox until every rank has drained its column.
        self.barrier();

        posted?;
        let mut offset = 0;
        for (src, (slot, &n)) in drained?.into_iter().zip(recv_counts).enumerate() {
            let Some(slot) = slot else {
                return Err(CommError::PeerFailed { op: OP, src });
            };
            match slot.downcast::<Vec<T>>() {
                Ok(block) if block.len() == n => {
                    recv[offset..offset + n].copy_from_slice(&block);
                }
                other => {
                    return Err(CommError::CountMismatch {
                        op: OP,
                        src,
                        dst: self.rank,
                        sent: other.map(|b| b.len()).unwrap_or(0),
                        expected: n,
                    });
                }
            }
            offset += n;
        }
        Ok(())
    }

    /// Element-wise sum over all ranks, in rank order so every rank gets bit-identical
    /// results.
    pub fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), CommError> {
        const OP: &str = "all_reduce_sum";
        if self.size() == 1 {
            return Ok(());
        }

        let parts: Vec<Vec<f64>> = self.exchange_board(OP, Ok(values.to_vec()))?;

        for p in &parts {
            check_len(OP, p.len(), values.len())?;
        }
        for (i, v) in values.iter_mut().enumerate() {
            *v = parts.iter().map(|p| p[i]).sum();
        }
        Ok(())
    }

    /// Concatenate every rank's `send` into `recv`, in rank order. `counts[r]` is the
    /// length rank r contributes.
    pub fn all_gather_v<T: Copy + Send + 'static>(
        &self,
        send: &[T],
        recv: &mut [T],
        counts: &[usize],
    ) -> Result<(), CommError> {
        const OP: &str = "all_gather_v";
        let local = check_len(OP, counts.len(), self.size())
            .and_then(|()| check_len(OP, send.len(), counts[self.rank]))
            .and_then(|()| check_len(OP, recv.len(), counts.iter().sum()));

        if self.size() == 1 {
            local?;
            recv.copy_from_slice(send);
            return Ok(());
        }

        let parts: Vec<Vec<T>> = self.exchange_board(OP, local.map(|()| send.to_vec()))?;

        let mut offset = 0;
        for (src, (p, &n)) in parts.iter().zip(counts).enumerate() {
            if p.len() != n {
                return Err(CommError::CountMismatch {
                    op: OP,
                    src,
                    dst: self.rank,
                    sent: p.len(),
                    expected: n,
                });
            }
            recv[offset..offset + n].copy_from_slice(p);
            offset += n;
        }
        Ok(())
    }

    /// Post `mine` on the board, wait for everyone, copy all posts out, wait again. A
    /// rank that failed locally posts nothing but still passes both barriers.
    fn exchange_board<T: Clone + Send + 'static>(
        &self,
        op: &'static str,
        mine: Result<Vec<T>, CommError>,
    ) -> Result<Vec<Vec<T>>, CommError> {
        let posted = mine.and_then(|v| {
            let mut board = lock(&self.shared.board, op)?;
            board[self.rank] = Some(Box::new(v));
            Ok(())
        });
        self.barrier();

        let parts = posted.and_then(|()| {
            let board = lock(&self.shared.board, op)?;
            let parts: Result<Vec<Vec<T>>, CommError> = board
                .iter()
                .enumerate()
                .map(|(src, slot)| {
                    slot.as_ref()
                        .and_then(|b| b.downcast_ref::<Vec<T>>())
                        .cloned()
                        .ok_or(CommError::PeerFailed { op, src })
                })
                .collect();
            parts
        });
        self.barrier();

        // Everyone has read; clear the own post so a later failure can't leave it stale.
        if let Ok(mut board) = lock(&self.shared.board, op) {
            board[self.rank] = None;
        }

        parts
    }
}

fn check_len(op: &'static str, got: usize, expected: usize) -> Result<(), CommError> {
    if got != expected {
        return Err(CommError::BufferLength { op, got, expected });
    }
    Ok(())
}

/// Integer id to communicator map, so independently created objects can refer to the
/// same communicator. Each rank (thread) has its own map, like a process would.
#[derive(Debug, Default)]
pub struct CommMap {
    next: i32,
    comms: HashMap<i32, Communicator>,
}

impl CommMap {
    pub fn register(&mut self, comm: Communicator) -> i32 {
        let id = self.next;
        self.next += 1;
        self.comms.insert(id, comm);
        id
    }

    pub fn get(&self, id: i32) -> Option<Communicator> {
        self.comms.get(&id).cloned()
    }

    pub fn remove(&mut self, id: i32) -> Option<Communicator> {
        self.comms.remove(&id)
    }
}

thread_local! {
    static COMM_MAP: RefCell<CommMap> = RefCell::new(CommMap::default());
}

/// Register a communicator for this rank and get its id.
pub fn register_comm(comm: Communicator) -> i32 {
    COMM_MAP.with(|m| m.borrow_mut().register(comm))
}

/// Look up a communicator registered on this rank.
pub fn map_comm(id: i32) -> Option<Communicator> {
    COMM_MAP.with(|m| m.borrow().get(id))
}

pub fn unregister_comm(id: i32) -> Option<Communicator> {
    COMM_MAP.with(|m| m.borrow_mut().remove(id))
}

/// Run `f` on `n` ranks, one thread each, and collect the results in rank order.
pub fn run_ranks<R, F>(comms: Vec<Communicator>, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(Communicator) -> R + Sync,
{
    std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|c| {
                let f = &f;
                s.spawn(move || f(c))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(r) => r,
                Err(e) => std::panic::resume_unwind(e),
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_to_all_permutes_blocks() {
        let n = 4;
        let out = run_ranks(Communicator::world(n), |c| {
            let me = c.rank();
            // Rank `me` sends `dst + 1` copies of `100 * me + dst` to each dst.
            let send_counts: Vec<usize> = (0..n).map(|dst| dst + 1).collect();
            let send: Vec<usize> = (0..n)
                .flat_map(|dst| std::iter::repeat(100 * me + dst).take(dst + 1))
                .collect();
            let recv_counts = vec![me + 1; n];
            let mut recv = vec![0; n * (me + 1)];
            c.all_to_all_v(&send, &send_counts, &mut recv, &recv_counts)
                .unwrap();
            recv
        });

        for (me, recv) in out.iter().enumerate() {
            for src in 0..n {
                let block = &recv[src * (me + 1)..(src + 1) * (me + 1)];
                assert!(block.iter().all(|&v| v == 100 * src + me));
            }
        }
    }

    #[test]
    fn all_to_all_is_reusable() {
        let out = run_ranks(Communicator::world(3), |c| {
            let mut total = 0;
            for round in 0..5 {
                let send = vec![round * 10 + c.rank(); 3];
                let mut recv = vec![0; 3];
                c.all_to_all_v(&send, &[1, 1, 1], &mut recv, &[1, 1, 1])
                    .unwrap();
                total += recv.iter().sum::<usize>();
            }
            total
        });
        // Each round: sum over src of (round * 10 + src).
        let expected: usize = (0..5).map(|r| 3 * r * 10 + 3).sum();
        assert!(out.iter().all(|&t| t == expected));
    }

    #[test]
    fn count_mismatch_is_reported() {
        let out = run_ranks(Communicator::world(2), |c| {
            let send = vec![1.0f64; 2];
            let mut recv = vec![0.; 3];
            // Everybody expects 2 from rank 1 but only gets 1.
            c.all_to_all_v(&send, &[1, 1], &mut recv, &[1, 2])
        });
        for r in out {
            assert!(matches!(r, Err(CommError::CountMismatch { src: 1, .. })));
        }
    }

    /// Run `f` on `n` ranks in the background; `None` if they don't all return in time.
    fn within_timeout<R, F>(n: usize, f: F) -> Option<Vec<R>>
    where
        R: Send + 'static,
        F: Fn(Communicator) -> R + Send + Sync + 'static,
    {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(run_ranks(Communicator::world(n), f));
        });
        rx.recv_timeout(std::time::Duration::from_secs(10)).ok()
    }

    #[test]
    fn one_sided_bad_buffer_fails_every_rank() {
        let out = within_timeout(2, |c| {
            let send = vec![1.0f64; 2];
            // Rank 0 hands in a receive buffer that doesn't match its counts.
            let mut recv = vec![0.; if c.rank() == 0 { 5 } else { 2 }];
            let first = c.all_to_all_v(&send, &[1, 1], &mut recv, &[1, 1]);

            // The group is still usable afterwards.
            let mut recv = vec![0.; 2];
            let second = c.all_to_all_v(&send, &[1, 1], &mut recv, &[1, 1]);
            (first, second)
        })
        .expect("collective hung after a one-sided error");

        assert!(matches!(out[0].0, Err(CommError::BufferLength { got: 5, .. })));
        assert!(matches!(out[1].0, Err(CommError::PeerFailed { src: 0, .. })));
        for (_, second) in out {
            assert!(second.is_ok());
        }
    }

    #[test]
    fn one_sided_bad_gather_fails_every_rank() {
        let out = within_timeout(3, |c| {
            let counts = [1, 1, 1];
            let send = vec![c.rank() as i32; if c.rank() == 2 { 4 } else { 1 }];
            let mut all = vec![0; 3];
            let first = c.all_gather_v(&send, &mut all, &counts);

            let mut v = vec![1.];
            let second = c.all_reduce_sum(&mut v).map(|()| v[0]);
            (first, second)
        })
        .expect("collective hung after a one-sided error");

        assert!(matches!(out[2].0, Err(CommError::BufferLength { .. })));
        for (first, second) in &out[..2] {
            assert!(matches!(first, Err(CommError::PeerFailed { src: 2, .. })));
            assert_eq!(*second, Ok(3.));
        }
    }

    #[test]
    fn reduce_and_gather() {
        let out = run_ranks(Communicator::world(3), |c| {
            let mut v = vec![c.rank() as f64, 1.];
            c.all_reduce_sum(&mut v).unwrap();

            let counts = [1, 2, 3];
            let send = vec![c.rank() as i32; counts[c.rank()]];
            let mut all = vec![0; 6];
            c.all_gather_v(&send, &mut all, &counts).unwrap();
            (v, all)
        });
        for (v, all) in out {
            assert_eq!(v, vec![3., 3.]);
            assert_eq!(all, vec![0, 1, 1, 2, 2, 2]);
        }
    }

    #[test]
    fn grid_ranks_are_consistent() {
        let grid = Communicator::grid(3, 2);
        assert_eq!(grid.len(), 6);
        for (w, rc) in grid.iter().enumerate() {
            assert_eq!(rc.world.rank(), w);
            assert_eq!(rc.fft.size(), 3);
            assert_eq!(rc.ortho.size(), 2);
            assert_eq!(rc.fft.rank() * 2 + rc.ortho.rank(), w);
        }
        assert!(grid[0].fft.same_group(&grid[2].fft));
        assert!(!grid[0].fft.same_group(&grid[1].fft));
        assert!(grid[0].ortho.same_group(&grid[1].ortho));
    }

    #[test]
    fn comm_ids_are_per_rank() {
        let id = register_comm(Communicator::solo());
        assert!(map_comm(id).is_some());
        let seen_elsewhere = std::thread::spawn(move || map_comm(id).is_some())
            .join()
            .unwrap();
        assert!(!seen_elsewhere);
        assert!(unregister_comm(id).is_some());
    }
}
