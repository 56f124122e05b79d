//! Collective communication between data-parallel workers.
//!
//! Only the gather-style collectives needed to share embeddings before the
//! in-batch negative loss are modelled. Every collective is blocking: a rank
//! that never calls it leaves the others waiting forever.

use std::sync::{Arc, Barrier, Mutex};

use candle_core::Tensor;

use super::error::{DistributedError, Result};
use super::process_group::{LocalProcessGroup, ProcessGroup};

pub trait DeviceCommunicator: Send + Sync {
    fn process_group(&self) -> &dyn ProcessGroup;

    /// Collect one tensor from every rank, indexed by rank.
    ///
    /// All ranks must pass tensors of the same shape and dtype. With a single
    /// rank the result is `[tensor.clone()]`.
    fn all_gather_into_list(&self, tensor: &Tensor) -> Result<Vec<Tensor>>;

    /// Gather and concatenate along `gather_dim`.
    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor> {
        if self.process_group().is_single() {
            return Ok(tensor.clone());
        }
        let parts = self.all_gather_into_list(tensor)?;
        Ok(Tensor::cat(&parts, gather_dim)?)
    }

    /// Block until every rank arrives.
    fn barrier(&self) -> Result<()>;
}

/// Communicator that never talks to anyone.
///
/// With a single-rank group every collective is identity. With a simulated
/// larger group, gathers repeat the local tensor once per rank so shape
/// logic can be exercised without real peers.
pub struct MockCommunicator<P: ProcessGroup> {
    process_group: P,
}

impl<P: ProcessGroup> MockCommunicator<P> {
    pub fn new(process_group: P) -> Self {
        Self { process_group }
    }
}

impl MockCommunicator<LocalProcessGroup> {
    pub fn single() -> Self {
        Self::new(LocalProcessGroup::new())
    }
}

impl<P: ProcessGroup> DeviceCommunicator for MockCommunicator<P> {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_gather_into_list(&self, tensor: &Tensor) -> Result<Vec<Tensor>> {
        Ok(vec![tensor.clone(); self.process_group.world_size()])
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

struct Exchange {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Tensor>>>,
}

/// Multi-rank communicator for workers living in one process (one thread
/// per rank). Tensors are exchanged through shared slots guarded by a
/// barrier.
pub struct InProcessCommunicator {
    process_group: LocalProcessGroup,
    exchange: Arc<Exchange>,
}

impl InProcessCommunicator {
    /// One communicator per rank, all wired to the same exchange. Hand each
    /// to its own thread.
    pub fn group(world_size: usize) -> Vec<Self> {
        let exchange = Arc::new(Exchange {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![None; world_size]),
        });
        (0..world_size)
            .map(|rank| Self {
                process_group: LocalProcessGroup::with_rank(rank, world_size),
                exchange: Arc::clone(&exchange),
            })
            .collect()
    }

    fn slots(&self) -> Result<std::sync::MutexGuard<'_, Vec<Option<Tensor>>>> {
        self.exchange
            .slots
            .lock()
            .map_err(|_| DistributedError::Collective {
                op: "all_gather",
                reason: "a peer panicked while holding the exchange".to_string(),
            })
    }
}

impl DeviceCommunicator for InProcessCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_gather_into_list(&self, tensor: &Tensor) -> Result<Vec<Tensor>> {
        let rank = self.process_group.rank();
        self.slots()?[rank] = Some(tensor.clone());
        self.exchange.barrier.wait();

        let gathered: Vec<Option<Tensor>> = self.slots()?.clone();
        // Nobody may overwrite a slot until every rank has read it.
        self.exchange.barrier.wait();

        let expected = tensor.dims();
        gathered
            .into_iter()
            .enumerate()
            .map(|(peer, slot)| {
                let t = slot.ok_or_else(|| DistributedError::Collective {
                    op: "all_gather",
                    reason: format!("rank {peer} did not contribute"),
                })?;
                if t.dims() != expected {
                    return Err(DistributedError::ShapeMismatch {
                        rank: peer,
                        expected: expected.to_vec(),
                        actual: t.dims().to_vec(),
                    });
                }
                Ok(t)
            })
            .collect()
    }

    fn barrier(&self) -> Result<()> {
        self.exchange.barrier.wait();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::thread;

    fn ones(shape: &[usize]) -> Tensor {
        Tensor::ones(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn mock_all_gather_single_is_identity() {
        let comm = MockCommunicator::single();
        let input = ones(&[2, 3]);
        let output = comm.all_gather(&input, 0).unwrap();
        assert_eq!(output.dims(), input.dims());
        assert_eq!(comm.all_gather_into_list(&input).unwrap().len(), 1);
    }

    #[test]
    fn mock_all_gather_simulated_ranks() {
        let comm = MockCommunicator::new(LocalProcessGroup::with_rank(0, 4));
        let output = comm.all_gather(&ones(&[2, 3]), 0).unwrap();
        assert_eq!(output.dims(), &[8, 3]);
    }

    #[test]
    fn mock_barrier_no_error() {
        MockCommunicator::single().barrier().unwrap();
    }

    #[test]
    fn process_group_accessible_via_trait() {
        let comm = MockCommunicator::new(LocalProcessGroup::with_rank(2, 8));
        assert_eq!(comm.process_group().rank(), 2);
        assert_eq!(comm.process_group().world_size(), 8);
    }

    #[test]
    fn in_process_gather_orders_by_rank() {
        let handles: Vec<_> = InProcessCommunicator::group(3)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let rank = comm.process_group().rank();
                    let t = Tensor::full(rank as f32, (1, 2), &Device::Cpu).unwrap();
                    comm.all_gather(&t, 0).unwrap().to_vec2::<f32>().unwrap()
                })
            })
            .collect();

        for h in handles {
            let gathered = h.join().unwrap();
            assert_eq!(gathered, vec![vec![0.0, 0.0], vec![1.0, 1.0], vec![2.0, 2.0]]);
        }
    }

    #[test]
    fn in_process_gather_rejects_mismatched_shapes() {
        let handles: Vec<_> = InProcessCommunicator::group(2)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let rows = comm.process_group().rank() + 1;
                    comm.all_gather_into_list(&ones(&[rows, 2]))
                })
            })
            .collect();

        for h in handles {
            let err = h.join().unwrap().unwrap_err();
            assert!(matches!(err, DistributedError::ShapeMismatch { .. }));
        }
    }

    #[test]
    fn in_process_gather_is_reusable() {
        let handles: Vec<_> = InProcessCommunicator::group(2)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let mut sums = Vec::new();
                    for step in 0..3 {
                        let v = (step * 10 + comm.process_group().rank()) as f32;
                        let t = Tensor::full(v, 1, &Device::Cpu).unwrap();
                        let all = comm.all_gather(&t, 0).unwrap();
                        sums.push(all.sum_all().unwrap().to_scalar::<f32>().unwrap());
                    }
                    comm.barrier().unwrap();
                    sums
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), vec![1.0, 21.0, 41.0]);
        }
    }
}
