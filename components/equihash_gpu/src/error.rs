//! Error types for problems that may arise while configuring or running the solver.

use std::error;
use std::fmt;

/// The pipeline stage during which a device failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Clearing counters and tables, or uploading the digest, before an attempt.
    Reset,
    /// The hash-expansion dispatch.
    HashExpand,
    /// The collision round with the given index.
    Collide(u32),
    /// The solution-extraction dispatch.
    Extract,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Reset => f.write_str("buffer reset"),
            Stage::HashExpand => f.write_str("hash expansion"),
            Stage::Collide(round) => write!(f, "collision round {}", round),
            Stage::Extract => f.write_str("solution extraction"),
        }
    }
}

/// The build output of one device whose kernel compilation failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildLog {
    pub device: String,
    pub log: String,
}

/// A failure reported by a compute backend while enqueueing, running or transferring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceError {
    /// The queue that failed, or `None` for context-wide buffer operations.
    pub queue: Option<usize>,
    pub device: String,
    /// The backend's own status text.
    pub status: String,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.queue {
            Some(queue) => write!(f, "{} (queue {}): {}", self.device, queue, self.status),
            None => write!(f, "{}: {}", self.device, self.status),
        }
    }
}

impl error::Error for DeviceError {}

/// The primary error type for the solver.
#[derive(Debug)]
pub enum Error {
    /// The `(n, k)` pair cannot be solved; nothing has been allocated.
    InvalidParameters {
        n: u32,
        k: u32,
        reason: &'static str,
    },

    /// The compute backend could not be initialised.
    BackendUnavailable(String),

    /// Kernel compilation failed on one or more devices.
    BackendCompile(Vec<BuildLog>),

    /// A buffer could not be created.
    BufferAllocation {
        buffer: &'static str,
        bytes: usize,
        reason: String,
    },

    /// An attempt was started on a buffer manager that holds no buffers.
    BuffersNotAllocated,

    /// A device failed during an attempt. The attempt's results are discarded.
    DeviceDispatch { stage: Stage, error: DeviceError },

    /// Devices kept failing for the given number of consecutive attempts.
    PersistentDispatchFailure {
        attempts: u32,
        stage: Stage,
        error: DeviceError,
    },
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self {
            Error::DeviceDispatch { error, .. } => Some(error),
            Error::PersistentDispatchFailure { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            Error::InvalidParameters { n, k, reason } => {
                write!(f, "Invalid Equihash parameters ({}, {}): {}", n, k, reason)
            }
            Error::BackendUnavailable(reason) => {
                write!(f, "No usable compute backend: {}", reason)
            }
            Error::BackendCompile(logs) => {
                write!(f, "Kernel compilation failed on {} device(s)", logs.len())?;
                for log in logs {
                    write!(f, "\nBuild log for {}:\n{}", log.device, log.log)?;
                }
                Ok(())
            }
            Error::BufferAllocation {
                buffer,
                bytes,
                reason,
            } => write!(
                f,
                "Could not allocate {} bytes for the {} buffer: {}",
                bytes, buffer, reason
            ),
            Error::BuffersNotAllocated => {
                f.write_str("Solver buffers were released before the attempt started")
            }
            Error::DeviceDispatch { stage, error } => {
                write!(f, "Device failure during {}: {}", stage, error)
            }
            Error::PersistentDispatchFailure {
                attempts,
                stage,
                error,
            } => write!(
                f,
                "Giving up after {} consecutive failed attempts; last failure during {}: {}",
                attempts, stage, error
            ),
        }
    }
}
