//! A host backend wrapper that records dispatches and injects faults, for exercising
//! the solver's failure handling.

use std::ops::Range;
use std::sync::Mutex;

use crate::{
    backend::{
        host::{HostBackend, HostBuffer, HostConfig, HostKernel},
        ComputeBackend, Device, KernelArgs, KernelSet, KernelSources,
    },
    error::{DeviceError, Error},
};

#[derive(Clone, Copy, Debug)]
pub enum Fault {
    None,
    /// Rejects the next `times` enqueues of `kernel`.
    FailEnqueue { kernel: HostKernel, times: u32 },
    /// Runs collision round `round` over no rows at all.
    EmptyRound { round: u32 },
}

/// One recorded call to [`ComputeBackend::enqueue`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dispatch {
    pub queue: usize,
    pub kernel: HostKernel,
    pub range: Range<u32>,
    pub round: Option<u32>,
}

/// A [`HostBackend`] that records every dispatch and applies a [`Fault`] to it.
pub struct TestBackend {
    inner: HostBackend,
    fault: Mutex<Fault>,
    dispatches: Mutex<Vec<Dispatch>>,
}

impl TestBackend {
    pub fn new(devices: usize, fault: Fault) -> Self {
        let config = HostConfig::default().with_devices(devices);
        TestBackend {
            inner: HostBackend::new(config).unwrap(),
            fault: Mutex::new(fault),
            dispatches: Mutex::new(vec![]),
        }
    }

    pub fn dispatches(&self) -> Vec<Dispatch> {
        self.dispatches.lock().unwrap().clone()
    }
}

impl ComputeBackend for TestBackend {
    type Buffer = HostBuffer;
    type Kernel = HostKernel;

    fn devices(&self) -> &[Device] {
        self.inner.devices()
    }

    fn compile(&self, sources: &KernelSources) -> Result<KernelSet<HostKernel>, Error> {
        self.inner.compile(sources)
    }

    fn create_buffer(&self, label: &'static str, len: usize) -> Result<HostBuffer, DeviceError> {
        self.inner.create_buffer(label, len)
    }

    fn release_buffer(&self, buffer: HostBuffer) {
        self.inner.release_buffer(buffer)
    }

    fn buffer_len(&self, buffer: &HostBuffer) -> usize {
        self.inner.buffer_len(buffer)
    }

    fn fill_buffer(&self, buffer: &HostBuffer, value: u8) -> Result<(), DeviceError> {
        self.inner.fill_buffer(buffer, value)
    }

    fn write_buffer(
        &self,
        buffer: &HostBuffer,
        offset: usize,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        self.inner.write_buffer(buffer, offset, data)
    }

    fn read_buffer(
        &self,
        buffer: &HostBuffer,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), DeviceError> {
        self.inner.read_buffer(buffer, offset, out)
    }

    fn enqueue(
        &self,
        queue: usize,
        kernel: &HostKernel,
        mut args: KernelArgs<HostBuffer>,
        mut range: Range<u32>,
    ) -> Result<(), DeviceError> {
        let round = match &args {
            KernelArgs::CollisionRound { round, .. } => Some(*round),
            _ => None,
        };
        self.dispatches.lock().unwrap().push(Dispatch {
            queue,
            kernel: *kernel,
            range: range.clone(),
            round,
        });

        match &mut *self.fault.lock().unwrap() {
            Fault::FailEnqueue {
                kernel: failing,
                times,
            } if *failing == *kernel && *times > 0 => {
                *times -= 1;
                return Err(DeviceError {
                    queue: Some(queue),
                    device: self.inner.devices()[queue].name.clone(),
                    status: "injected fault".to_owned(),
                });
            }
            Fault::EmptyRound { round: empty } if round == Some(*empty) => {
                if let KernelArgs::CollisionRound { source_rows, .. } = &mut args {
                    *source_rows = 0;
                }
                range = 0..0;
            }
            _ => (),
        }

        self.inner.enqueue(queue, kernel, args, range)
    }

    fn flush(&self, queue: usize) -> Result<(), DeviceError> {
        self.inner.flush(queue)
    }

    fn finish(&self, queue: usize) -> Result<(), DeviceError> {
        self.inner.finish(queue)
    }
}
