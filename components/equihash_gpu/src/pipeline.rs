//! The per-nonce round pipeline: hash expansion followed by `k` collision rounds.

use tracing::{debug, trace, warn};

use crate::{
    backend::{partition, ComputeBackend, KernelArgs, KernelSet},
    buffers::{Attempt, COUNTER_BYTES},
    error::{Error, Stage},
};

/// The states of one attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RoundState {
    HashExpand,
    /// Collision round `i` is next, over the given number of source rows.
    Collide { round: u32, rows: u32 },
    Done { rows: u32 },
    Aborted { round: u32 },
}

/// How an attempt's rounds ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Every round produced rows; `rows` fully collapsed chains are in the source table.
    Done { rows: u32 },
    /// No rows survived collision round `round`.
    Aborted { round: u32 },
}

/// Dispatches `kernel` over `0..total`, partitioned across every queue, and joins all
/// queues.
///
/// Queues are joined even if enqueueing failed, so no work from a failed stage is
/// still running when the error is returned.
pub(crate) fn fan_out<B: ComputeBackend>(
    backend: &B,
    stage: Stage,
    kernel: &B::Kernel,
    total: u32,
    args: impl Fn() -> KernelArgs<B::Buffer>,
) -> Result<(), Error> {
    let queues = backend.devices().len();

    let mut dispatched = Ok(());
    for (queue, range) in partition(total, queues) {
        trace!(%stage, queue, ?range, "Dispatching");
        dispatched = backend
            .enqueue(queue, kernel, args(), range)
            .and_then(|()| backend.flush(queue));
        if dispatched.is_err() {
            break;
        }
    }

    let mut joined = Ok(());
    for queue in 0..queues {
        let finished = backend.finish(queue);
        if joined.is_ok() {
            joined = finished;
        }
    }

    dispatched
        .and(joined)
        .map_err(|error| Error::DeviceDispatch { stage, error })
}

/// Reads a 4-byte counter buffer.
pub(crate) fn read_counter<B: ComputeBackend>(
    backend: &B,
    stage: Stage,
    counter: &B::Buffer,
) -> Result<u32, Error> {
    let mut bytes = [0; COUNTER_BYTES];
    backend
        .read_buffer(counter, 0, &mut bytes)
        .map_err(|error| Error::DeviceDispatch { stage, error })?;
    Ok(u32::from_le_bytes(bytes))
}

fn hash_expand<B: ComputeBackend>(
    attempt: &Attempt<'_, '_, B>,
    kernels: &KernelSet<B::Kernel>,
) -> Result<u32, Error> {
    let buffers = &*attempt.buffers;
    let rows = attempt.params.table_rows() as u32;
    fan_out(
        attempt.backend,
        Stage::HashExpand,
        &kernels.hash_expand,
        rows,
        || KernelArgs::HashExpand {
            context: buffers.context.clone(),
            digest: buffers.digest.clone(),
            table: buffers.tables.source().clone(),
        },
    )?;
    Ok(rows)
}

/// Runs collision round `round` over `rows` source rows, returning the number of rows
/// the destination table received.
fn collide<B: ComputeBackend>(
    attempt: &Attempt<'_, '_, B>,
    kernels: &KernelSet<B::Kernel>,
    round: u32,
    rows: u32,
) -> Result<u32, Error> {
    let stage = Stage::Collide(round);
    let backend = attempt.backend;
    let buffers = &*attempt.buffers;

    backend
        .fill_buffer(&buffers.row_count, 0)
        .map_err(|error| Error::DeviceDispatch { stage, error })?;
    fan_out(backend, stage, &kernels.collision_round, rows, || {
        KernelArgs::CollisionRound {
            context: buffers.context.clone(),
            source: buffers.tables.source().clone(),
            destination: buffers.tables.destination().clone(),
            row_count: buffers.row_count.clone(),
            source_rows: rows,
            round,
        }
    })?;

    let produced = read_counter(backend, stage, &buffers.row_count)?;
    let capacity = attempt.params.table_capacity(round + 1);
    if produced as usize > capacity {
        warn!(
            round,
            produced,
            capacity,
            "Destination table overflowed; extra rows were dropped"
        );
        Ok(capacity as u32)
    } else {
        Ok(produced)
    }
}

/// Drives `attempt` from hash expansion through the last collision round.
///
/// A device failure at any stage aborts the whole attempt with
/// [`Error::DeviceDispatch`]; its partial results must not be used.
#[tracing::instrument(level = "debug", skip_all, fields(nonce = attempt.nonce))]
pub(crate) fn run<B: ComputeBackend>(
    attempt: &mut Attempt<'_, '_, B>,
    kernels: &KernelSet<B::Kernel>,
) -> Result<Outcome, Error> {
    let k = attempt.params.k();
    let mut state = RoundState::HashExpand;

    loop {
        state = match state {
            RoundState::HashExpand => {
                let rows = hash_expand(attempt, kernels)?;
                RoundState::Collide { round: 0, rows }
            }
            RoundState::Collide { round, rows } => {
                let produced = collide(attempt, kernels, round, rows)?;
                trace!(round, rows = produced, "Collision round finished");
                if produced == 0 {
                    RoundState::Aborted { round }
                } else {
                    attempt.buffers.tables.flip();
                    if round + 1 == k {
                        RoundState::Done { rows: produced }
                    } else {
                        RoundState::Collide {
                            round: round + 1,
                            rows: produced,
                        }
                    }
                }
            }
            RoundState::Done { rows } => {
                debug!(rows, "Every round produced rows");
                return Ok(Outcome::Done { rows });
            }
            RoundState::Aborted { round } => {
                debug!(round, "No rows survived");
                return Ok(Outcome::Aborted { round });
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{collide, hash_expand, read_counter, run, Outcome};
    use crate::{
        backend::{
            host::{HostBackend, HostConfig, HostKernel},
            ComputeBackend, KernelSources,
        },
        buffers::BufferManager,
        digest::PartialDigest,
        error::{Error, Stage},
        params::ParameterSet,
        testing::{Fault, TestBackend},
    };

    #[test]
    fn rounds_run_in_order_across_queues() {
        let p = ParameterSet::derive(48, 5).unwrap();
        let backend = TestBackend::new(2, Fault::None);
        let kernels = backend.compile(&KernelSources::default()).unwrap();
        let mut manager = BufferManager::new(&backend, p);
        manager.allocate().unwrap();

        let digest = PartialDigest::seed(&p, b"pipeline").with_nonce(0);
        let mut attempt = manager.begin_attempt(&digest, 0).unwrap();
        let outcome = run(&mut attempt, &kernels).unwrap();

        let dispatches = backend.dispatches();
        // Hash expansion over both queues, then one dispatch per queue per round.
        assert_eq!(dispatches[0].kernel, HostKernel::HashExpand);
        assert_eq!(dispatches[0].range, 0..256);
        assert_eq!(dispatches[1].range, 256..512);
        let rounds = dispatches
            .iter()
            .filter_map(|d| d.round)
            .collect::<Vec<_>>();
        assert!(rounds.windows(2).all(|w| w[0] <= w[1]));
        match outcome {
            Outcome::Done { rows } => {
                assert!(rows > 0);
                assert_eq!(rounds.last(), Some(&4));
            }
            Outcome::Aborted { round } => assert_eq!(rounds.last(), Some(&round)),
        }
        assert!(dispatches
            .iter()
            .all(|d| d.kernel != HostKernel::ExtractSolutions));
    }

    #[test]
    fn merged_rows_never_repeat_a_leaf() {
        let p = ParameterSet::derive(48, 5).unwrap();
        let backend = TestBackend::new(2, Fault::None);
        let kernels = backend.compile(&KernelSources::default()).unwrap();
        let mut manager = BufferManager::new(&backend, p);
        manager.allocate().unwrap();

        for nonce in 0..4 {
            let digest = PartialDigest::seed(&p, b"pipeline").with_nonce(nonce);
            let attempt = manager.begin_attempt(&digest, nonce).unwrap();
            let mut rows = hash_expand(&attempt, &kernels).unwrap();
            for round in 0..p.k() {
                rows = collide(&attempt, &kernels, round, rows).unwrap();
                let layout = p.row_layout(round + 1);
                let mut table = vec![0; rows as usize * layout.stride()];
                backend
                    .read_buffer(attempt.buffers.tables.destination(), 0, &mut table)
                    .unwrap();
                for row in table.chunks_exact(layout.stride()) {
                    let mut indices: Vec<u32> = row[layout.hash_bytes..]
                        .chunks_exact(4)
                        .map(|i| u32::from_le_bytes(i.try_into().unwrap()))
                        .collect();
                    indices.sort_unstable();
                    assert!(indices.windows(2).all(|w| w[0] != w[1]));
                }
                if rows == 0 {
                    break;
                }
                attempt.buffers.tables.flip();
            }
        }
    }

    #[test]
    fn overflowing_round_is_clamped_to_capacity() {
        let p = ParameterSet::derive(48, 5).unwrap();
        let backend = HostBackend::new(HostConfig::default()).unwrap();
        let kernels = backend.compile(&KernelSources::default()).unwrap();
        let mut manager = BufferManager::new(&backend, p);
        manager.allocate().unwrap();

        let digest = PartialDigest::seed(&p, b"pipeline").with_nonce(0);
        let attempt = manager.begin_attempt(&digest, 0).unwrap();
        let buffers = &*attempt.buffers;

        // Every leaf carries the same hash, so every pair of leaves collides.
        let leaves = p.table_rows() as u32;
        let table: Vec<u8> = (0..leaves)
            .flat_map(|i| {
                let mut row = vec![0x5a; p.hash_row_bytes()];
                row.extend_from_slice(&i.to_le_bytes());
                row
            })
            .collect();
        backend
            .write_buffer(buffers.tables.source(), 0, &table)
            .unwrap();

        let capacity = p.table_capacity(1);
        assert_eq!(
            collide(&attempt, &kernels, 0, leaves).unwrap() as usize,
            capacity
        );
        assert_eq!(
            read_counter(&backend, Stage::Collide(0), &buffers.row_count).unwrap(),
            leaves * (leaves - 1) / 2
        );

        // Leaf 0 pairs with 511 others, leaf 1 with 510, and so on; the last stored
        // slot falls among the pairs of leaf 5.
        let layout = p.row_layout(1);
        let mut last = vec![0; layout.stride()];
        backend
            .read_buffer(
                buffers.tables.destination(),
                (capacity - 1) * layout.stride(),
                &mut last,
            )
            .unwrap();
        assert!(last[..layout.hash_bytes].iter().all(|b| *b == 0));
        assert_eq!(&last[layout.hash_bytes..][..4], &5u32.to_le_bytes());
        assert_eq!(&last[layout.hash_bytes + 4..], &59u32.to_le_bytes());
    }

    #[test]
    fn empty_round_aborts() {
        let p = ParameterSet::derive(48, 5).unwrap();
        let backend = TestBackend::new(1, Fault::EmptyRound { round: 2 });
        let kernels = backend.compile(&KernelSources::default()).unwrap();
        let mut manager = BufferManager::new(&backend, p);
        manager.allocate().unwrap();

        let digest = PartialDigest::seed(&p, b"pipeline").with_nonce(0);
        let mut attempt = manager.begin_attempt(&digest, 0).unwrap();
        assert_eq!(
            run(&mut attempt, &kernels).unwrap(),
            Outcome::Aborted { round: 2 }
        );
        assert!(backend.dispatches().iter().all(|d| d.round <= Some(2)));
    }

    #[test]
    fn device_failure_aborts_the_attempt() {
        let p = ParameterSet::derive(48, 5).unwrap();
        let backend = TestBackend::new(
            2,
            Fault::FailEnqueue {
                kernel: HostKernel::CollisionRound,
                times: 1,
            },
        );
        let kernels = backend.compile(&KernelSources::default()).unwrap();
        let mut manager = BufferManager::new(&backend, p);
        manager.allocate().unwrap();

        let digest = PartialDigest::seed(&p, b"pipeline").with_nonce(0);
        let mut attempt = manager.begin_attempt(&digest, 0).unwrap();
        assert_matches!(
            run(&mut attempt, &kernels),
            Err(Error::DeviceDispatch {
                stage: Stage::Collide(0),
                ..
            })
        );
    }

    #[test]
    fn host_and_test_backends_agree() {
        let p = ParameterSet::derive(48, 5).unwrap();
        let digest = PartialDigest::seed(&p, b"pipeline").with_nonce(4);

        let host = HostBackend::new(HostConfig::default().with_devices(3)).unwrap();
        let kernels = host.compile(&KernelSources::default()).unwrap();
        let mut manager = BufferManager::new(&host, p);
        manager.allocate().unwrap();
        let mut attempt = manager.begin_attempt(&digest, 4).unwrap();
        let expected = run(&mut attempt, &kernels).unwrap();

        let backend = TestBackend::new(3, Fault::None);
        let kernels = backend.compile(&KernelSources::default()).unwrap();
        let mut manager = BufferManager::new(&backend, p);
        manager.allocate().unwrap();
        let mut attempt = manager.begin_attempt(&digest, 4).unwrap();
        assert_eq!(run(&mut attempt, &kernels).unwrap(), expected);
    }
}
