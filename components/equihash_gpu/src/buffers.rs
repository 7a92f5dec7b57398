//! Ownership of every device buffer the solver uses, and their per-attempt reset.

use tracing::{debug, info};

use crate::{
    backend::{ComputeBackend, KernelContext, CONTEXT_BYTES, MAX_SOLUTIONS},
    digest::{PartialDigest, DIGEST_IMAGE_BYTES},
    error::{DeviceError, Error, Stage},
    params::ParameterSet,
};

pub(crate) const COUNTER_BYTES: usize = 4;

/// The two table buffers, with the index of the one currently holding the source rows.
///
/// Swapping roles flips the index; neither buffer is ever copied or resized.
#[derive(Debug)]
pub(crate) struct TableArena<T> {
    slots: [T; 2],
    active: usize,
}

impl<T> TableArena<T> {
    fn new(table: T, collision_table: T) -> Self {
        TableArena {
            slots: [table, collision_table],
            active: 0,
        }
    }

    /// The buffer the next round reads from.
    pub(crate) fn source(&self) -> &T {
        &self.slots[self.active]
    }

    /// The buffer the next round writes to.
    pub(crate) fn destination(&self) -> &T {
        &self.slots[1 - self.active]
    }

    pub(crate) fn flip(&mut self) {
        self.active = 1 - self.active;
    }

    fn reset(&mut self) {
        self.active = 0;
    }

    fn into_slots(self) -> [T; 2] {
        self.slots
    }
}

#[derive(Debug)]
pub(crate) struct Buffers<T> {
    pub(crate) tables: TableArena<T>,
    pub(crate) row_count: T,
    pub(crate) digest: T,
    pub(crate) context: T,
    pub(crate) solutions: T,
    pub(crate) solutions_count: T,
}

/// Allocates, resets and releases the buffers for one [`ParameterSet`].
///
/// All buffers are sized from the parameters they were allocated for. Changing the
/// parameters with [`BufferManager::reconfigure`] releases them, and a fresh
/// [`BufferManager::allocate`] is needed before the next attempt.
pub struct BufferManager<'a, B: ComputeBackend> {
    backend: &'a B,
    params: ParameterSet,
    buffers: Option<Buffers<B::Buffer>>,
}

/// Exclusive access to the buffers for the duration of one nonce attempt.
pub struct Attempt<'m, 'a, B: ComputeBackend> {
    pub(crate) backend: &'a B,
    pub(crate) params: ParameterSet,
    pub(crate) buffers: &'m mut Buffers<B::Buffer>,
    pub(crate) nonce: u32,
}

impl<'m, 'a, B: ComputeBackend> Attempt<'m, 'a, B> {
    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }
}

impl<'a, B: ComputeBackend> BufferManager<'a, B> {
    /// Creates a manager that holds no buffers yet.
    pub fn new(backend: &'a B, params: ParameterSet) -> Self {
        BufferManager {
            backend,
            params,
            buffers: None,
        }
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    pub fn is_allocated(&self) -> bool {
        self.buffers.is_some()
    }

    /// Sizes of the buffers this manager allocates, by label.
    pub fn buffer_sizes(&self) -> [(&'static str, usize); 7] {
        let p = &self.params;
        [
            ("table", p.table_bytes()),
            ("collision_table", p.table_bytes()),
            ("row_count", COUNTER_BYTES),
            ("digest", DIGEST_IMAGE_BYTES),
            ("context", CONTEXT_BYTES),
            ("solutions", MAX_SOLUTIONS * p.solution_bytes()),
            ("solutions_count", COUNTER_BYTES),
        ]
    }

    /// Creates and initialises every buffer. Does nothing if they already exist.
    ///
    /// If any buffer cannot be created, the ones created before it are released again.
    pub fn allocate(&mut self) -> Result<(), Error> {
        if self.buffers.is_some() {
            return Ok(());
        }

        let mut created = Vec::with_capacity(7);
        match self.create_all(&mut created) {
            Ok(buffers) => {
                let bytes: usize = created.iter().map(|b| self.backend.buffer_len(b)).sum();
                info!(
                    n = self.params.n(),
                    k = self.params.k(),
                    bytes,
                    "Allocated solver buffers"
                );
                self.buffers = Some(buffers);
                Ok(())
            }
            Err(e) => {
                debug!(
                    released = created.len(),
                    "Releasing partially allocated buffers"
                );
                for buffer in created {
                    self.backend.release_buffer(buffer);
                }
                Err(e)
            }
        }
    }

    fn create_all(&self, created: &mut Vec<B::Buffer>) -> Result<Buffers<B::Buffer>, Error> {
        let mut create = |(label, bytes): (&'static str, usize)| {
            let buffer = self
                .backend
                .create_buffer(label, bytes)
                .map_err(|e| Error::BufferAllocation {
                    buffer: label,
                    bytes,
                    reason: e.to_string(),
                })?;
            created.push(buffer.clone());
            Ok::<_, Error>(buffer)
        };

        let [table, collision_table, row_count, digest, context, solutions, solutions_count] =
            self.buffer_sizes();
        let buffers = Buffers {
            tables: TableArena::new(create(table)?, create(collision_table)?),
            row_count: create(row_count)?,
            digest: create(digest)?,
            context: create(context)?,
            solutions: create(solutions)?,
            solutions_count: create(solutions_count)?,
        };

        // Nothing a kernel reads before writing may hold stale bytes.
        for buffer in created.iter() {
            self.backend.fill_buffer(buffer, 0).map_err(reset_error)?;
        }
        self.backend
            .write_buffer(
                &buffers.context,
                0,
                &KernelContext::new(&self.params).to_bytes(),
            )
            .map_err(reset_error)?;

        Ok(buffers)
    }

    /// Releases every buffer. Safe to call any number of times.
    pub fn release(&mut self) {
        if let Some(buffers) = self.buffers.take() {
            let Buffers {
                tables,
                row_count,
                digest,
                context,
                solutions,
                solutions_count,
            } = buffers;
            let [table, collision_table] = tables.into_slots();
            for buffer in [
                table,
                collision_table,
                row_count,
                digest,
                context,
                solutions,
                solutions_count,
            ] {
                self.backend.release_buffer(buffer);
            }
            debug!("Released solver buffers");
        }
    }

    /// Releases the buffers and adopts `params` for the next allocation.
    pub fn reconfigure(&mut self, params: ParameterSet) {
        self.release();
        self.params = params;
    }

    /// Clears all state left by a previous attempt, uploads `digest` and hands out the
    /// buffers for the attempt at `nonce`.
    pub fn begin_attempt(
        &mut self,
        digest: &PartialDigest,
        nonce: u32,
    ) -> Result<Attempt<'_, 'a, B>, Error> {
        let buffers = self.buffers.as_mut().ok_or(Error::BuffersNotAllocated)?;
        let image = digest.to_image()?;

        let backend = self.backend;
        let [table, collision_table] = &buffers.tables.slots;
        for buffer in [
            table,
            collision_table,
            &buffers.row_count,
            &buffers.solutions_count,
        ] {
            backend.fill_buffer(buffer, 0).map_err(reset_error)?;
        }
        backend
            .write_buffer(&buffers.digest, 0, &image)
            .map_err(reset_error)?;
        buffers.tables.reset();

        Ok(Attempt {
            backend,
            params: self.params,
            buffers,
            nonce,
        })
    }
}

impl<'a, B: ComputeBackend> Drop for BufferManager<'a, B> {
    fn drop(&mut self) {
        self.release();
    }
}

fn reset_error(error: DeviceError) -> Error {
    Error::DeviceDispatch {
        stage: Stage::Reset,
        error,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{BufferManager, TableArena};
    use crate::{
        backend::{
            host::{HostBackend, HostConfig},
            ComputeBackend,
        },
        digest::PartialDigest,
        params::ParameterSet,
        Error,
    };

    #[test]
    fn arena_flips_roles() {
        let mut arena = TableArena::new("table", "collision_table");
        assert_eq!(
            (*arena.source(), *arena.destination()),
            ("table", "collision_table")
        );
        arena.flip();
        assert_eq!(
            (*arena.source(), *arena.destination()),
            ("collision_table", "table")
        );
        arena.reset();
        assert_eq!(*arena.source(), "table");
    }

    #[test]
    fn allocation_is_sized_from_parameters() {
        let backend = HostBackend::new(HostConfig::default()).unwrap();
        let p = ParameterSet::derive(48, 5).unwrap();
        let mut manager = BufferManager::new(&backend, p);
        manager.allocate().unwrap();

        let expected: usize = manager.buffer_sizes().iter().map(|(_, len)| len).sum();
        assert_eq!(backend.allocated_bytes(), expected);
        let buffers = manager.buffers.as_ref().unwrap();
        assert_eq!(backend.buffer_len(buffers.tables.source()), p.table_bytes());
        assert_eq!(backend.buffer_len(&buffers.solutions), 8 * 36);

        // Allocating again keeps the same buffers.
        manager.allocate().unwrap();
        assert_eq!(backend.allocated_bytes(), expected);

        manager.release();
        manager.release();
        assert_eq!(backend.allocated_bytes(), 0);
    }

    #[test]
    fn reconfigure_requires_fresh_allocation() {
        let backend = HostBackend::new(HostConfig::default()).unwrap();
        let small = ParameterSet::derive(48, 5).unwrap();
        let large = ParameterSet::derive(96, 5).unwrap();
        let mut manager = BufferManager::new(&backend, small);
        manager.allocate().unwrap();

        manager.reconfigure(large);
        assert!(!manager.is_allocated());
        assert_eq!(backend.allocated_bytes(), 0);
        let digest = PartialDigest::seed(&large, b"seed");
        assert!(matches!(
            manager.begin_attempt(&digest, 0),
            Err(Error::BuffersNotAllocated)
        ));

        manager.allocate().unwrap();
        let attempt = manager.begin_attempt(&digest, 0).unwrap();
        assert_eq!(
            backend.buffer_len(attempt.buffers.tables.destination()),
            large.table_bytes()
        );
        assert_eq!(attempt.params(), &large);
    }

    #[test]
    fn failed_allocation_releases_everything() {
        let p = ParameterSet::derive(48, 5).unwrap();
        // Room for both tables, but not for the rest.
        let config = HostConfig::default().with_memory_limit(2 * p.table_bytes() + 8);
        let backend = HostBackend::new(config).unwrap();
        let mut manager = BufferManager::new(&backend, p);

        assert_matches!(
            manager.allocate(),
            Err(Error::BufferAllocation { buffer: "digest", .. })
        );
        assert!(!manager.is_allocated());
        assert_eq!(backend.allocated_bytes(), 0);
    }

    #[test]
    fn attempts_start_from_clean_buffers() {
        let backend = HostBackend::new(HostConfig::default()).unwrap();
        let p = ParameterSet::derive(48, 5).unwrap();
        let mut manager = BufferManager::new(&backend, p);
        manager.allocate().unwrap();

        {
            let attempt = manager
                .begin_attempt(&PartialDigest::seed(&p, b"a"), 0)
                .unwrap();
            let buffers = &mut *attempt.buffers;
            backend.fill_buffer(buffers.tables.source(), 0xaa).unwrap();
            backend
                .write_buffer(&buffers.row_count, 0, &[9, 0, 0, 0])
                .unwrap();
            buffers.tables.flip();
        }

        let attempt = manager
            .begin_attempt(&PartialDigest::seed(&p, b"b"), 1)
            .unwrap();
        let buffers = &*attempt.buffers;
        let mut row_count = [0xff; 4];
        backend
            .read_buffer(&buffers.row_count, 0, &mut row_count)
            .unwrap();
        assert_eq!(row_count, [0; 4]);
        let mut table = vec![0xff; p.table_bytes()];
        backend
            .read_buffer(buffers.tables.source(), 0, &mut table)
            .unwrap();
        assert!(table.iter().all(|b| *b == 0));
        assert_eq!(attempt.nonce(), 1);
    }
}
