//! The interface between the solver and the parallel hardware it runs on.
//!
//! A [`ComputeBackend`] owns the devices, one in-order command queue per device, the
//! compiled kernels and the buffers they operate on. The solver only ever talks to
//! devices through this trait, and never holds more than one backend handle.

use std::ops::Range;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{
    error::{DeviceError, Error},
    params::ParameterSet,
};

pub mod host;

/// Entry point of the kernel that fills the initial table with leaf hashes.
pub const HASH_EXPAND: &str = "hash_expand";
/// Entry point of the kernel that runs one collision round.
pub const COLLISION_ROUND: &str = "collision_round";
/// Entry point of the kernel that validates and packs surviving chains.
pub const EXTRACT_SOLUTIONS: &str = "extract_solutions";

/// The most solutions one attempt can report.
pub const MAX_SOLUTIONS: usize = 8;

/// A compute device exposed by a backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    pub name: String,
}

/// The program handed to [`ComputeBackend::compile`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelSources {
    pub hash_expand: &'static str,
    pub collision_round: &'static str,
    pub extract_solutions: &'static str,
}

impl Default for KernelSources {
    fn default() -> Self {
        KernelSources {
            hash_expand: HASH_EXPAND,
            collision_round: COLLISION_ROUND,
            extract_solutions: EXTRACT_SOLUTIONS,
        }
    }
}

/// The three compiled kernels the pipeline dispatches.
#[derive(Clone, Debug)]
pub struct KernelSet<K> {
    pub hash_expand: K,
    pub collision_round: K,
    pub extract_solutions: K,
}

/// The arguments bound to one kernel dispatch.
///
/// Every work-item of a dispatch gets one index of the dispatched range: a leaf index
/// for [`KernelArgs::HashExpand`], a source row otherwise.
#[derive(Clone, Debug)]
pub enum KernelArgs<B> {
    HashExpand {
        context: B,
        digest: B,
        table: B,
    },
    CollisionRound {
        context: B,
        source: B,
        destination: B,
        /// Destination cursor, advanced atomically by every emitted row.
        row_count: B,
        /// Number of valid rows in `source`.
        source_rows: u32,
        round: u32,
    },
    ExtractSolutions {
        context: B,
        digest: B,
        source: B,
        source_rows: u32,
        solutions: B,
        solutions_count: B,
    },
}

/// A parallel compute backend.
///
/// Queues are in-order. Work enqueued on a queue starts no later than the next
/// [`ComputeBackend::flush`] of that queue, and [`ComputeBackend::finish`] blocks until
/// all of it has completed. Buffer reads and writes are blocking.
pub trait ComputeBackend {
    type Buffer: Clone;
    type Kernel;

    /// The usable devices, one command queue per device.
    fn devices(&self) -> &[Device];

    /// Compiles `sources` for every device. On failure the error carries the build
    /// log of each device that failed.
    fn compile(&self, sources: &KernelSources) -> Result<KernelSet<Self::Kernel>, Error>;

    fn create_buffer(&self, label: &'static str, len: usize) -> Result<Self::Buffer, DeviceError>;

    fn release_buffer(&self, buffer: Self::Buffer);

    fn buffer_len(&self, buffer: &Self::Buffer) -> usize;

    fn fill_buffer(&self, buffer: &Self::Buffer, value: u8) -> Result<(), DeviceError>;

    fn write_buffer(
        &self,
        buffer: &Self::Buffer,
        offset: usize,
        data: &[u8],
    ) -> Result<(), DeviceError>;

    fn read_buffer(
        &self,
        buffer: &Self::Buffer,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), DeviceError>;

    fn enqueue(
        &self,
        queue: usize,
        kernel: &Self::Kernel,
        args: KernelArgs<Self::Buffer>,
        range: Range<u32>,
    ) -> Result<(), DeviceError>;

    fn flush(&self, queue: usize) -> Result<(), DeviceError>;

    fn finish(&self, queue: usize) -> Result<(), DeviceError>;
}

/// Splits `0..total` into at most `queues` contiguous ranges of `ceil(total / queues)`
/// items, the last range taking the remainder. Empty ranges are omitted.
pub(crate) fn partition(total: u32, queues: usize) -> Vec<(usize, Range<u32>)> {
    if queues == 0 {
        return vec![];
    }
    let chunk = (total as u64 + queues as u64 - 1) / queues as u64;
    (0..queues)
        .filter_map(|queue| {
            let start = (queue as u64 * chunk).min(total as u64) as u32;
            let end = ((queue as u64 + 1) * chunk).min(total as u64) as u32;
            (start < end).then_some((queue, start..end))
        })
        .collect()
}

pub(crate) const CONTEXT_BYTES: usize = 4 + 4 + 8 + 8;

/// The parameter record stored in the context buffer, from which kernels size their
/// rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct KernelContext {
    pub(crate) n: u32,
    pub(crate) k: u32,
    pub(crate) row_width_bytes: u64,
    pub(crate) table_rows: u64,
}

impl KernelContext {
    pub(crate) fn new(params: &ParameterSet) -> Self {
        KernelContext {
            n: params.n(),
            k: params.k(),
            row_width_bytes: params.row_width_bytes() as u64,
            table_rows: params.table_rows() as u64,
        }
    }

    pub(crate) fn to_bytes(self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(CONTEXT_BYTES);
        bytes.write_u32::<LittleEndian>(self.n).unwrap();
        bytes.write_u32::<LittleEndian>(self.k).unwrap();
        bytes.write_u64::<LittleEndian>(self.row_width_bytes).unwrap();
        bytes.write_u64::<LittleEndian>(self.table_rows).unwrap();
        bytes
    }

    pub(crate) fn read(mut bytes: &[u8]) -> Option<Self> {
        Some(KernelContext {
            n: bytes.read_u32::<LittleEndian>().ok()?,
            k: bytes.read_u32::<LittleEndian>().ok()?,
            row_width_bytes: bytes.read_u64::<LittleEndian>().ok()?,
            table_rows: bytes.read_u64::<LittleEndian>().ok()?,
        })
    }

    /// Recovers the parameter set, or `None` if the record is inconsistent.
    pub(crate) fn params(&self) -> Option<ParameterSet> {
        let params = ParameterSet::derive(self.n, self.k).ok()?;
        (*self == KernelContext::new(&params)).then_some(params)
    }
}
