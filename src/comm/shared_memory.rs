//! In-process process group over crossbeam channels.
//!
//! One bounded channel per directed rank pair; rank `i`'s chunk for rank `j`
//! travels over channel `(i, j)`, so no message tagging is needed. Used by
//! tests and single-node runs; multi-node groups implement [`ProcessGroup`]
//! elsewhere.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};

use super::traits::{CommError, CommResult, ProcessGroup, TensorMessage};

/// A group of in-process communicators sharing a channel mesh.
pub struct SharedMemoryGroup {
    communicators: Vec<SharedMemoryComm>,
}

impl SharedMemoryGroup {
    pub fn new(world_size: usize) -> CommResult<Self> {
        if world_size == 0 {
            return Err(CommError::InvalidConfig(
                "world_size must be > 0".to_string(),
            ));
        }

        // Channel mesh: tx[src][dst] feeds rx[dst][src].
        let mut tx_mesh: Vec<Vec<Sender<Vec<f32>>>> =
            (0..world_size).map(|_| Vec::with_capacity(world_size)).collect();
        let mut rx_mesh: Vec<Vec<Receiver<Vec<f32>>>> =
            (0..world_size).map(|_| Vec::with_capacity(world_size)).collect();
        for src in 0..world_size {
            for _dst in 0..world_size {
                let (tx, rx) = bounded(2);
                tx_mesh[src].push(tx);
                rx_mesh[src].push(rx);
            }
        }
        // Transpose receivers so rank `dst` owns rx[dst][src] for every src.
        let mut rx_by_dst: Vec<Vec<Receiver<Vec<f32>>>> =
            (0..world_size).map(|_| Vec::with_capacity(world_size)).collect();
        for row in rx_mesh {
            for (dst, rx) in row.into_iter().enumerate() {
                rx_by_dst[dst].push(rx);
            }
        }

        let mut barrier_txs: Vec<Sender<()>> = Vec::with_capacity(world_size);
        let mut barrier_rxs: Vec<Receiver<()>> = Vec::with_capacity(world_size);
        for _ in 0..world_size {
            let (tx, rx) = bounded(world_size);
            barrier_txs.push(tx);
            barrier_rxs.push(rx);
        }

        let mut communicators = Vec::with_capacity(world_size);
        for (rank, (peer_rxs, barrier_rx)) in rx_by_dst
            .into_iter()
            .zip(barrier_rxs.into_iter())
            .enumerate()
        {
            communicators.push(SharedMemoryComm {
                rank,
                world_size,
                peer_txs: tx_mesh[rank].clone(),
                peer_rxs,
                barrier_txs: barrier_txs.clone(),
                barrier_rx,
            });
        }

        Ok(Self { communicators })
    }

    pub fn world_size(&self) -> usize {
        self.communicators.len()
    }

    /// Take ownership of every per-rank communicator, in rank order.
    pub fn into_comms(self) -> Vec<SharedMemoryComm> {
        self.communicators
    }
}

/// One rank's handle into a [`SharedMemoryGroup`].
pub struct SharedMemoryComm {
    rank: usize,
    world_size: usize,
    peer_txs: Vec<Sender<Vec<f32>>>,
    peer_rxs: Vec<Receiver<Vec<f32>>>,
    barrier_txs: Vec<Sender<()>>,
    barrier_rx: Receiver<()>,
}

impl ProcessGroup for SharedMemoryComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> CommResult<()> {
        for (peer, tx) in self.barrier_txs.iter().enumerate() {
            if peer != self.rank {
                tx.send(()).map_err(|_| CommError::Disconnected)?;
            }
        }
        for _ in 0..(self.world_size - 1) {
            self.barrier_rx.recv().map_err(|_| CommError::Disconnected)?;
        }
        Ok(())
    }

    fn all_to_all(&self, message: TensorMessage) -> CommResult<TensorMessage> {
        let rows = message.rows();
        if rows % self.world_size != 0 {
            return Err(CommError::InvalidConfig(format!(
                "leading dimension {} not divisible by world size {}",
                rows, self.world_size
            )));
        }
        let chunk_len = (rows / self.world_size) * message.row_len();

        // Push every outgoing chunk (the self-chunk included, which keeps
        // the data path uniform), then assemble incoming chunks in rank
        // order.
        for (peer, tx) in self.peer_txs.iter().enumerate() {
            let chunk = message.data[peer * chunk_len..(peer + 1) * chunk_len].to_vec();
            tx.send(chunk)
                .map_err(|_| CommError::SendFailed(format!("to rank {peer}")))?;
        }

        let mut data = message.data;
        for (peer, rx) in self.peer_rxs.iter().enumerate() {
            let chunk = rx
                .recv()
                .map_err(|_| CommError::RecvFailed(format!("from rank {peer}")))?;
            if chunk.len() != chunk_len {
                return Err(CommError::RecvFailed(format!(
                    "rank {peer} sent {} elements, expected {chunk_len}",
                    chunk.len()
                )));
            }
            data[peer * chunk_len..(peer + 1) * chunk_len].copy_from_slice(&chunk);
        }

        TensorMessage::new(data, message.shape)
    }
}

/// Run one closure per rank on its own thread; results come back in rank
/// order.
pub fn run_group<F, R>(world_size: usize, f: F) -> CommResult<Vec<R>>
where
    F: Fn(SharedMemoryComm) -> R + Send + Sync + 'static,
    R: Send + 'static,
{
    let group = SharedMemoryGroup::new(world_size)?;
    let f = Arc::new(f);

    let handles: Vec<_> = group
        .into_comms()
        .into_iter()
        .map(|comm| {
            let f = Arc::clone(&f);
            thread::spawn(move || f(comm))
        })
        .collect();

    let mut results = Vec::with_capacity(world_size);
    for handle in handles {
        results.push(handle.join().map_err(|_| {
            CommError::RecvFailed("group thread panicked".to_string())
        })?);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_exposes_ranks_in_order() {
        let group = SharedMemoryGroup::new(3).unwrap();
        assert_eq!(group.world_size(), 3);
        for (rank, comm) in group.into_comms().iter().enumerate() {
            assert_eq!(comm.rank(), rank);
            assert_eq!(comm.world_size(), 3);
        }
    }

    #[test]
    fn rejects_empty_group() {
        assert!(SharedMemoryGroup::new(0).is_err());
    }

    #[test]
    fn single_rank_all_to_all_is_identity() {
        let results = run_group(1, |comm| {
            let msg = TensorMessage::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();
            comm.all_to_all(msg.clone()).unwrap() == msg
        })
        .unwrap();
        assert!(results[0]);
    }

    #[test]
    fn indivisible_leading_dimension_is_rejected() {
        let results = run_group(2, |comm| {
            let msg = TensorMessage::new(vec![0.0; 3], vec![3]).unwrap();
            comm.all_to_all(msg).is_err()
        })
        .unwrap();
        assert!(results.iter().all(|&rejected| rejected));
    }
}
