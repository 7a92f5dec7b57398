//! A [`ComputeBackend`] that runs the solver kernels on a CPU thread pool.
//!
//! Each emulated device is one worker thread of a dedicated [`rayon`] pool. Flushing a
//! queue submits its pending commands as a single job; the job's writes are staged and
//! published when the queue is finished. Rows appended through a cursor are therefore
//! published in the order queues are joined, which makes host results reproducible.

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_channel as channel;
use memuse::DynamicUsage;
use tracing::{debug, trace};

use super::{
    ComputeBackend, Device, KernelArgs, KernelContext, KernelSet, KernelSources,
    COLLISION_ROUND, EXTRACT_SOLUTIONS, HASH_EXPAND, MAX_SOLUTIONS,
};
use crate::{
    digest::{for_each_leaf, PartialDigest},
    error::{BuildLog, DeviceError, Error},
    minimal::minimal_from_indices,
    params::{ParameterSet, INDEX_BYTES},
    verify::validate_indices,
};

/// Configuration for a [`HostBackend`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostConfig {
    devices: usize,
    memory_limit: Option<usize>,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            devices: 1,
            memory_limit: None,
        }
    }
}

impl HostConfig {
    /// Sets the number of emulated devices, each with its own queue and worker thread.
    pub fn with_devices(mut self, devices: usize) -> Self {
        self.devices = devices;
        self
    }

    /// Caps the total size of live buffers.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn devices(&self) -> usize {
        self.devices
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.memory_limit
    }
}

/// A buffer in host memory. Clones share the same storage.
#[derive(Clone)]
pub struct HostBuffer {
    label: &'static str,
    data: Arc<RwLock<Vec<u8>>>,
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("label", &self.label)
            .field("len", &self.data.read().map(|data| data.len()).ok())
            .finish()
    }
}

impl PartialEq for HostBuffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl Eq for HostBuffer {}

impl DynamicUsage for HostBuffer {
    fn dynamic_usage(&self) -> usize {
        self.data
            .read()
            .map(|data| data.dynamic_usage())
            .unwrap_or(0)
    }

    fn dynamic_usage_bounds(&self) -> (usize, Option<usize>) {
        let usage = self.dynamic_usage();
        (usage, Some(usage))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostKernel {
    HashExpand,
    CollisionRound,
    ExtractSolutions,
}

impl HostKernel {
    fn entry_point(&self) -> &'static str {
        match self {
            HostKernel::HashExpand => HASH_EXPAND,
            HostKernel::CollisionRound => COLLISION_ROUND,
            HostKernel::ExtractSolutions => EXTRACT_SOLUTIONS,
        }
    }
}

/// A buffer write produced by a kernel, applied when its queue is finished.
enum Effect {
    /// Writes `bytes` at a fixed offset.
    Write {
        buffer: HostBuffer,
        offset: usize,
        bytes: Vec<u8>,
    },
    /// Appends `stride`-byte rows at the cursor stored in `cursor`. Rows past
    /// `capacity` are dropped, but still advance the cursor.
    Append {
        buffer: HostBuffer,
        cursor: HostBuffer,
        stride: usize,
        capacity: usize,
        rows: Vec<u8>,
    },
}

struct Command {
    kernel: HostKernel,
    args: KernelArgs<HostBuffer>,
    range: Range<u32>,
}

type JobResult = Result<Vec<Effect>, DeviceError>;

#[derive(Default)]
struct Queue {
    pending: Vec<Command>,
    in_flight: Vec<channel::Receiver<JobResult>>,
}

/// Runs the solver kernels on the CPU.
pub struct HostBackend {
    devices: Vec<Device>,
    pool: rayon::ThreadPool,
    queues: Vec<Mutex<Queue>>,
    memory_limit: Option<usize>,
    allocated: AtomicUsize,
}

impl fmt::Debug for HostBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBackend")
            .field("devices", &self.devices)
            .field("memory_limit", &self.memory_limit)
            .field("allocated", &self.allocated_bytes())
            .finish_non_exhaustive()
    }
}

impl HostBackend {
    pub fn new(config: HostConfig) -> Result<Self, Error> {
        if config.devices == 0 {
            return Err(Error::BackendUnavailable(
                "the host backend needs at least one device".to_owned(),
            ));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.devices)
            .thread_name(|i| format!("equihash-host-{}", i))
            .build()
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;

        let devices = (0..config.devices)
            .map(|i| Device {
                name: format!("Host CPU #{}", i),
            })
            .collect();
        let queues = (0..config.devices).map(|_| Mutex::default()).collect();

        debug!(devices = config.devices, "Created host backend");
        Ok(HostBackend {
            devices,
            pool,
            queues,
            memory_limit: config.memory_limit,
            allocated: AtomicUsize::new(0),
        })
    }

    /// Total size of the buffers currently alive.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    fn context_error(&self, status: impl Into<String>) -> DeviceError {
        DeviceError {
            queue: None,
            device: "host".to_owned(),
            status: status.into(),
        }
    }

    fn queue(&self, queue: usize) -> Result<MutexGuard<'_, Queue>, DeviceError> {
        let device = self
            .devices
            .get(queue)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| "host".to_owned());
        let status = |status: &str| DeviceError {
            queue: Some(queue),
            device: device.clone(),
            status: status.to_owned(),
        };
        self.queues
            .get(queue)
            .ok_or_else(|| status("invalid command queue"))?
            .lock()
            .map_err(|_| status("command queue poisoned"))
    }
}

fn read(buffer: &HostBuffer) -> Result<RwLockReadGuard<'_, Vec<u8>>, String> {
    buffer
        .data
        .read()
        .map_err(|_| format!("{} buffer poisoned", buffer.label))
}

fn write(buffer: &HostBuffer) -> Result<RwLockWriteGuard<'_, Vec<u8>>, String> {
    buffer
        .data
        .write()
        .map_err(|_| format!("{} buffer poisoned", buffer.label))
}

impl ComputeBackend for HostBackend {
    type Buffer = HostBuffer;
    type Kernel = HostKernel;

    fn devices(&self) -> &[Device] {
        &self.devices
    }

    fn compile(&self, sources: &KernelSources) -> Result<KernelSet<HostKernel>, Error> {
        let log: String = [
            (sources.hash_expand, HostKernel::HashExpand),
            (sources.collision_round, HostKernel::CollisionRound),
            (sources.extract_solutions, HostKernel::ExtractSolutions),
        ]
        .iter()
        .filter(|(name, kernel)| *name != kernel.entry_point())
        .map(|(name, kernel)| {
            format!(
                "error: no kernel named `{}` (expected `{}`)\n",
                name,
                kernel.entry_point()
            )
        })
        .collect();

        if log.is_empty() {
            debug!(devices = self.devices.len(), "Compiled host kernels");
            Ok(KernelSet {
                hash_expand: HostKernel::HashExpand,
                collision_round: HostKernel::CollisionRound,
                extract_solutions: HostKernel::ExtractSolutions,
            })
        } else {
            Err(Error::BackendCompile(
                self.devices
                    .iter()
                    .map(|device| BuildLog {
                        device: device.name.clone(),
                        log: log.clone(),
                    })
                    .collect(),
            ))
        }
    }

    fn create_buffer(&self, label: &'static str, len: usize) -> Result<HostBuffer, DeviceError> {
        let in_use = self.allocated.fetch_add(len, Ordering::SeqCst);
        let over_limit = self
            .memory_limit
            .is_some_and(|limit| in_use.saturating_add(len) > limit);

        let mut data = vec![];
        let reserved = if over_limit {
            Err(format!(
                "{} of {} bytes already in use",
                in_use,
                self.memory_limit.unwrap_or_default()
            ))
        } else {
            data.try_reserve_exact(len).map_err(|e| e.to_string())
        };
        if let Err(status) = reserved {
            self.allocated.fetch_sub(len, Ordering::SeqCst);
            return Err(self.context_error(status));
        }
        data.resize(len, 0);

        trace!(label, len, "Created host buffer");
        Ok(HostBuffer {
            label,
            data: Arc::new(RwLock::new(data)),
        })
    }

    fn release_buffer(&self, buffer: HostBuffer) {
        let len = self.buffer_len(&buffer);
        self.allocated.fetch_sub(len, Ordering::SeqCst);
        trace!(label = buffer.label, len, "Released host buffer");
    }

    fn buffer_len(&self, buffer: &HostBuffer) -> usize {
        buffer.data.read().map(|data| data.len()).unwrap_or(0)
    }

    fn fill_buffer(&self, buffer: &HostBuffer, value: u8) -> Result<(), DeviceError> {
        write(buffer)
            .map_err(|e| self.context_error(e))?
            .fill(value);
        Ok(())
    }

    fn write_buffer(
        &self,
        buffer: &HostBuffer,
        offset: usize,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let mut contents = write(buffer).map_err(|e| self.context_error(e))?;
        let target = offset
            .checked_add(data.len())
            .and_then(|end| contents.get_mut(offset..end))
            .ok_or_else(|| {
                self.context_error(format!("write outside the {} buffer", buffer.label))
            })?;
        target.copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: &HostBuffer,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), DeviceError> {
        let contents = read(buffer).map_err(|e| self.context_error(e))?;
        let source = offset
            .checked_add(out.len())
            .and_then(|end| contents.get(offset..end))
            .ok_or_else(|| {
                self.context_error(format!("read outside the {} buffer", buffer.label))
            })?;
        out.copy_from_slice(source);
        Ok(())
    }

    fn enqueue(
        &self,
        queue: usize,
        kernel: &HostKernel,
        args: KernelArgs<HostBuffer>,
        range: Range<u32>,
    ) -> Result<(), DeviceError> {
        trace!(queue, kernel = kernel.entry_point(), ?range, "Enqueued kernel");
        self.queue(queue)?.pending.push(Command {
            kernel: *kernel,
            args,
            range,
        });
        Ok(())
    }

    fn flush(&self, queue: usize) -> Result<(), DeviceError> {
        let mut state = self.queue(queue)?;
        if state.pending.is_empty() {
            return Ok(());
        }

        let commands = std::mem::take(&mut state.pending);
        let device = self.devices[queue].name.clone();
        let (tx, rx) = channel::bounded(1);
        self.pool.spawn_fifo(move || {
            let result = commands
                .into_iter()
                .try_fold(vec![], |mut effects, command| {
                    effects.extend(run(command)?);
                    Ok::<_, String>(effects)
                })
                .map_err(|status| DeviceError {
                    queue: Some(queue),
                    device,
                    status,
                });
            if tx.send(result).is_err() {
                debug!("HostBackend was dropped before queue {} finished", queue);
            }
        });
        state.in_flight.push(rx);
        Ok(())
    }

    fn finish(&self, queue: usize) -> Result<(), DeviceError> {
        self.flush(queue)?;
        let in_flight = std::mem::take(&mut self.queue(queue)?.in_flight);

        let device_error = |status: String| DeviceError {
            queue: Some(queue),
            device: self.devices[queue].name.clone(),
            status,
        };

        // Every job is waited for, even after one has failed.
        let mut first_error = None;
        for rx in in_flight {
            let published = rx
                .recv()
                .map_err(|_| device_error("kernel execution aborted".to_owned()))
                .and_then(|result| result)
                .and_then(|effects| {
                    effects
                        .into_iter()
                        .try_for_each(publish)
                        .map_err(device_error)
                });
            if let Err(e) = published {
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

fn publish(effect: Effect) -> Result<(), String> {
    match effect {
        Effect::Write {
            buffer,
            offset,
            bytes,
        } => {
            let mut contents = write(&buffer)?;
            contents
                .get_mut(offset..offset + bytes.len())
                .ok_or_else(|| format!("write outside the {} buffer", buffer.label))?
                .copy_from_slice(&bytes);
            Ok(())
        }
        Effect::Append {
            buffer,
            cursor,
            stride,
            capacity,
            rows,
        } => {
            if buffer == cursor {
                return Err("cursor aliases its destination".to_owned());
            }
            let mut cursor_bytes = write(&cursor)?;
            let mut contents = write(&buffer)?;

            let count = (&cursor_bytes[..])
                .read_u32::<LittleEndian>()
                .map_err(|_| "cursor buffer is too small")?;
            let appended = rows.len() / stride;
            for (slot, row) in (count as usize..).zip(rows.chunks_exact(stride)) {
                if slot >= capacity {
                    break;
                }
                contents
                    .get_mut(slot * stride..(slot + 1) * stride)
                    .ok_or_else(|| format!("append outside the {} buffer", buffer.label))?
                    .copy_from_slice(row);
            }

            (&mut cursor_bytes[..4])
                .write_u32::<LittleEndian>(count.saturating_add(appended as u32))
                .map_err(|e| e.to_string())
        }
    }
}

fn context_params(context: &HostBuffer) -> Result<ParameterSet, String> {
    KernelContext::read(&read(context)?)
        .and_then(|context| context.params())
        .ok_or_else(|| "invalid context record".to_owned())
}

fn digest_state(digest: &HostBuffer) -> Result<PartialDigest, String> {
    PartialDigest::from_image(&read(digest)?)
        .ok_or_else(|| "invalid digest image".to_owned())
}

fn run(command: Command) -> Result<Vec<Effect>, String> {
    let Command {
        kernel,
        args,
        range,
    } = command;

    match (kernel, args) {
        (
            HostKernel::HashExpand,
            KernelArgs::HashExpand {
                context,
                digest,
                table,
            },
        ) => hash_expand(&context, &digest, table, range),
        (
            HostKernel::CollisionRound,
            KernelArgs::CollisionRound {
                context,
                source,
                destination,
                row_count,
                source_rows,
                round,
            },
        ) => collision_round(
            &context,
            &source,
            destination,
            row_count,
            source_rows,
            round,
            range,
        ),
        (
            HostKernel::ExtractSolutions,
            KernelArgs::ExtractSolutions {
                context,
                digest,
                source,
                source_rows,
                solutions,
                solutions_count,
            },
        ) => extract_solutions(
            &context,
            &digest,
            &source,
            source_rows,
            solutions,
            solutions_count,
            range,
        ),
        (kernel, _) => Err(format!(
            "arguments do not match kernel `{}`",
            kernel.entry_point()
        )),
    }
}

/// Writes leaf `i` as row `i` of the depth-0 table: its expanded hash followed by its
/// own index.
fn hash_expand(
    context: &HostBuffer,
    digest: &HostBuffer,
    table: HostBuffer,
    range: Range<u32>,
) -> Result<Vec<Effect>, String> {
    let p = context_params(context)?;
    let digest = digest_state(digest)?;
    let stride = p.row_layout(0).stride();
    if range.end as usize > p.table_rows() {
        return Err(format!("leaf range {:?} exceeds the table", range));
    }

    let mut bytes = Vec::with_capacity(range.len() * stride);
    for_each_leaf(&p, digest.state(), range.start, range.end, |i, leaf| {
        bytes.extend_from_slice(leaf);
        bytes.extend_from_slice(&i.to_le_bytes());
    });

    Ok(vec![Effect::Write {
        buffer: table,
        offset: range.start as usize * stride,
        bytes,
    }])
}

/// For every source row `i` in `range`, emits the merge of `i` with each later row
/// whose compared blocks are equal and that shares no leaf index with it.
fn collision_round(
    context: &HostBuffer,
    source: &HostBuffer,
    destination: HostBuffer,
    row_count: HostBuffer,
    source_rows: u32,
    round: u32,
    range: Range<u32>,
) -> Result<Vec<Effect>, String> {
    let p = context_params(context)?;
    if round >= p.k() {
        return Err(format!("round {} out of range", round));
    }
    let from = p.row_layout(round);
    let to = p.row_layout(round + 1);
    let compared = p.compared_bytes(round);
    if source_rows as usize > p.table_capacity(round) || range.end > source_rows {
        return Err(format!("source rows {:?} exceed the table", range));
    }

    let stride = from.stride();
    let contents = read(source)?;
    let rows = contents
        .get(..source_rows as usize * stride)
        .ok_or("source buffer is too small")?;
    let key = |i: u32| &row(rows, stride, i)[..compared];

    // Rows sorted by compared blocks, then by position, so that every row's partners
    // follow it directly.
    let mut order: Vec<u32> = (0..source_rows).collect();
    order.sort_unstable_by(|&a, &b| key(a).cmp(key(b)).then(a.cmp(&b)));
    let mut rank = vec![0; source_rows as usize];
    for (pos, &i) in order.iter().enumerate() {
        rank[i as usize] = pos;
    }

    let mut out = vec![];
    for i in range {
        let a = row(rows, stride, i);
        for &j in order[rank[i as usize] + 1..]
            .iter()
            .take_while(|&&j| key(j) == key(i))
        {
            let b = row(rows, stride, j);
            let (a_indices, b_indices) = (&a[from.hash_bytes..], &b[from.hash_bytes..]);
            if shares_index(a_indices, b_indices) {
                continue;
            }
            out.extend(
                a[compared..from.hash_bytes]
                    .iter()
                    .zip(&b[compared..from.hash_bytes])
                    .map(|(x, y)| x ^ y),
            );
            if first_index(a_indices) < first_index(b_indices) {
                out.extend_from_slice(a_indices);
                out.extend_from_slice(b_indices);
            } else {
                out.extend_from_slice(b_indices);
                out.extend_from_slice(a_indices);
            }
        }
    }
    debug_assert_eq!(out.len() % to.stride(), 0);

    Ok(vec![Effect::Append {
        buffer: destination,
        cursor: row_count,
        stride: to.stride(),
        capacity: p.table_capacity(round + 1),
        rows: out,
    }])
}

fn row(rows: &[u8], stride: usize, i: u32) -> &[u8] {
    &rows[i as usize * stride..][..stride]
}

/// Whether two index lists have a leaf in common. Merging them would cancel that leaf
/// against itself.
fn shares_index(a: &[u8], b: &[u8]) -> bool {
    a.chunks_exact(INDEX_BYTES)
        .any(|x| b.chunks_exact(INDEX_BYTES).any(|y| x == y))
}

fn first_index(indices: &[u8]) -> u32 {
    u32::from_le_bytes([indices[0], indices[1], indices[2], indices[3]])
}

/// Re-validates every fully collapsed chain in `range`, appending the accepted ones in
/// the minimal encoding.
fn extract_solutions(
    context: &HostBuffer,
    digest: &HostBuffer,
    source: &HostBuffer,
    source_rows: u32,
    solutions: HostBuffer,
    solutions_count: HostBuffer,
    range: Range<u32>,
) -> Result<Vec<Effect>, String> {
    let p = context_params(context)?;
    let digest = digest_state(digest)?;
    let layout = p.row_layout(p.k());
    if source_rows as usize > p.table_capacity(p.k()) || range.end > source_rows {
        return Err(format!("source rows {:?} exceed the table", range));
    }

    let contents = read(source)?;
    let mut out = vec![];
    for i in range {
        let start = i as usize * layout.stride();
        let indices: Vec<u32> = contents
            .get(start..start + layout.stride())
            .ok_or("source buffer is too small")?
            .chunks_exact(INDEX_BYTES)
            .map(first_index)
            .collect();
        match validate_indices(&p, digest.state(), &indices) {
            Ok(()) => out.extend(minimal_from_indices(&p, &indices)),
            Err(kind) => trace!(row = i, "Discarded candidate: {}", kind),
        }
    }

    Ok(vec![Effect::Append {
        buffer: solutions,
        cursor: solutions_count,
        stride: p.solution_bytes(),
        capacity: MAX_SOLUTIONS,
        rows: out,
    }])
}
