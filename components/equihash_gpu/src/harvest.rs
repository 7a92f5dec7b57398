//! Collection of the solutions left in the table after the last collision round.

use memuse::DynamicUsage;
use tracing::debug;

use crate::{
    backend::{ComputeBackend, KernelArgs, KernelSet, MAX_SOLUTIONS},
    buffers::Attempt,
    error::{Error, Stage},
    pipeline::{fan_out, read_counter},
    proof::Proof,
};

/// Validates the `final_rows` collapsed chains of a finished attempt on the devices and
/// returns the accepted ones, sorted and without duplicates.
///
/// An empty result means there is no solution at this nonce.
pub(crate) fn extract<B: ComputeBackend>(
    attempt: &Attempt<'_, '_, B>,
    kernels: &KernelSet<B::Kernel>,
    final_rows: u32,
) -> Result<Vec<Proof>, Error> {
    let backend = attempt.backend;
    let buffers = &*attempt.buffers;
    let solution_bytes = attempt.params.solution_bytes();

    backend
        .fill_buffer(&buffers.solutions_count, 0)
        .map_err(|error| Error::DeviceDispatch {
            stage: Stage::Extract,
            error,
        })?;
    fan_out(
        backend,
        Stage::Extract,
        &kernels.extract_solutions,
        final_rows,
        || KernelArgs::ExtractSolutions {
            context: buffers.context.clone(),
            digest: buffers.digest.clone(),
            source: buffers.tables.source().clone(),
            source_rows: final_rows,
            solutions: buffers.solutions.clone(),
            solutions_count: buffers.solutions_count.clone(),
        },
    )?;

    let found = read_counter(backend, Stage::Extract, &buffers.solutions_count)? as usize;
    if found > MAX_SOLUTIONS {
        debug!(found, "Solutions buffer overflowed; keeping the first ones");
    }
    let count = found.min(MAX_SOLUTIONS);
    if count == 0 {
        return Ok(vec![]);
    }

    let mut records = vec![0; count * solution_bytes];
    backend
        .read_buffer(&buffers.solutions, 0, &mut records)
        .map_err(|error| Error::DeviceDispatch {
            stage: Stage::Extract,
            error,
        })?;

    let mut proofs: Vec<_> = records
        .chunks_exact(solution_bytes)
        .map(|solution| Proof::new(solution.to_vec(), attempt.nonce))
        .collect();
    proofs.sort();
    proofs.dedup();

    debug!(
        nonce = attempt.nonce,
        solutions = proofs.len(),
        bytes = proofs.dynamic_usage(),
        "Harvested solutions"
    );
    Ok(proofs)
}
