//! The nonce search loop.

use tracing::{debug, info, warn};

use crate::{
    backend::{ComputeBackend, KernelSet, KernelSources},
    buffers::BufferManager,
    digest::PartialDigest,
    error::Error,
    harvest,
    params::ParameterSet,
    pipeline::{self, Outcome},
    proof::{Proof, Seed},
};

/// Configuration for the nonce search.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SolverConfig {
    initial_nonce: u32,
    max_attempts: u32,
    max_consecutive_failures: u32,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            initial_nonce: 0,
            max_attempts: 256,
            max_consecutive_failures: 3,
        }
    }
}

impl SolverConfig {
    pub fn with_initial_nonce(mut self, nonce: u32) -> Self {
        self.initial_nonce = nonce;
        self
    }

    /// Sets how many nonces [`Solver::find_proof`] tries before giving up.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets how many attempts in a row may fail on a device before the search stops.
    /// At least one failure is always tolerated.
    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures.max(1);
        self
    }

    pub fn initial_nonce(&self) -> u32 {
        self.initial_nonce
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn max_consecutive_failures(&self) -> u32 {
        self.max_consecutive_failures
    }

    /// The nonces to try, in order. Stops early at the end of the `u32` range.
    fn nonces(&self) -> impl Iterator<Item = u32> {
        let start = self.initial_nonce;
        (0..self.max_attempts).map_while(move |i| start.checked_add(i))
    }
}

/// Searches for Equihash solutions on a compute backend.
///
/// A `Solver` owns the compiled kernels and every buffer it dispatches them on, so
/// only one search can run on them at a time.
pub struct Solver<'a, B: ComputeBackend> {
    backend: &'a B,
    config: SolverConfig,
    kernels: KernelSet<B::Kernel>,
    buffers: BufferManager<'a, B>,
}

impl<'a, B: ComputeBackend> Solver<'a, B> {
    /// Compiles the kernels on every device of `backend` and allocates the buffers for
    /// `params`.
    pub fn new(backend: &'a B, params: ParameterSet, config: SolverConfig) -> Result<Self, Error> {
        let kernels = backend.compile(&KernelSources::default())?;
        let mut buffers = BufferManager::new(backend, params);
        buffers.allocate()?;

        info!(
            n = params.n(),
            k = params.k(),
            devices = backend.devices().len(),
            "Solver ready"
        );
        Ok(Solver {
            backend,
            config,
            kernels,
            buffers,
        })
    }

    pub fn params(&self) -> &ParameterSet {
        self.buffers.params()
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Switches to new parameters, replacing every buffer.
    pub fn reconfigure(&mut self, params: ParameterSet) -> Result<(), Error> {
        self.buffers.reconfigure(params);
        self.buffers.allocate()
    }

    /// Tries successive nonces until one yields at least one solution.
    ///
    /// Returns the solutions found at that nonce, or an empty list once the configured
    /// number of attempts is used up. An attempt that fails on a device is skipped;
    /// the search only fails once
    /// [`SolverConfig::max_consecutive_failures`] attempts in a row have failed.
    pub fn find_proof(&mut self, seed: &Seed) -> Result<Vec<Proof>, Error> {
        let seeded = PartialDigest::seed(self.params(), seed.as_bytes());

        let mut failures = 0;
        for nonce in self.config.nonces() {
            match self.attempt(&seeded.with_nonce(nonce), nonce) {
                Ok(proofs) if !proofs.is_empty() => {
                    info!(nonce, solutions = proofs.len(), "Found proofs");
                    return Ok(proofs);
                }
                Ok(_) => failures = 0,
                Err(Error::DeviceDispatch { stage, error }) => {
                    failures += 1;
                    warn!(nonce, %stage, %error, "Abandoned attempt after a device failure");
                    if failures >= self.config.max_consecutive_failures {
                        return Err(Error::PersistentDispatchFailure {
                            attempts: failures,
                            stage,
                            error,
                        });
                    }
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            initial_nonce = self.config.initial_nonce,
            attempts = self.config.max_attempts,
            "No proof found"
        );
        Ok(vec![])
    }

    /// Runs a single attempt from a digest that already has its nonce absorbed.
    pub(crate) fn attempt(
        &mut self,
        digest: &PartialDigest,
        nonce: u32,
    ) -> Result<Vec<Proof>, Error> {
        let mut attempt = self.buffers.begin_attempt(digest, nonce)?;
        match pipeline::run(&mut attempt, &self.kernels)? {
            Outcome::Done { rows } => harvest::extract(&attempt, &self.kernels, rows),
            Outcome::Aborted { round } => {
                debug!(nonce, round, "Attempt died out");
                Ok(vec![])
            }
        }
    }

    /// The backend this solver dispatches to.
    pub fn backend(&self) -> &'a B {
        self.backend
    }
}
