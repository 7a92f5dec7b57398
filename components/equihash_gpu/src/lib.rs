//! Equihash is a Proof-of-Work algorithm, based on a generalization of the Birthday
//! problem which finds colliding hash values. It was designed to be memory-hard; more
//! specifically, the bottle-neck for parallel implementations of Equihash solvers would
//! be memory bandwidth.
//!
//! This crate searches for Equihash solutions on parallel hardware, and verifies them.
//! A [`Solver`] drives hash expansion, `k` collision rounds and solution extraction as
//! kernel dispatches on a [`ComputeBackend`], spreading every dispatch across all of the
//! backend's devices. [`backend::host::HostBackend`] emulates a set of devices with
//! worker threads.
//!
//! Found solutions can be checked with [`verify`] (or [`is_valid_solution`], which
//! takes the raw header bytes), which does not depend on any backend.
//!
#![doc = "## Feature flags"]
#![doc = document_features::document_features!()]
//!
//! References
//! ==========
//! - [Section 7.6.1: Equihash.] Zcash Protocol Specification, version 2020.1.10 or later.
//! - Alex Biryukov and Dmitry Khovratovich.
//!   [*Equihash: Asymmetric Proof-of-Work Based on the Generalized Birthday Problem.*][BK16]
//!   NDSS ’16.
//!
//! [Section 7.6.1: Equihash.]: https://zips.z.cash/protocol/protocol.pdf#equihash
//! [BK16]: https://www.internetsociety.org/sites/default/files/blogs-media/equihash-asymmetric-proof-of-work-based-generalized-birthday-problem.pdf

// Catch documentation errors caused by code changes.
#![deny(rustdoc::broken_intra_doc_links)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, doc(auto_cfg))]

pub mod backend;
mod buffers;
mod digest;
mod error;
mod harvest;
mod minimal;
mod params;
mod pipeline;
mod proof;
mod solver;
mod verify;

#[cfg(any(test, feature = "test-dependencies"))]
pub mod testing;

#[cfg(test)]
mod test_vectors;

pub use backend::ComputeBackend;
pub use buffers::{Attempt, BufferManager};
pub use digest::PartialDigest;
pub use error::{BuildLog, DeviceError, Error, Stage};
pub use params::ParameterSet;
pub use proof::{Proof, Seed, SEED_LENGTH};
pub use solver::{Solver, SolverConfig};
pub use verify::{is_valid_solution, verify, InvalidSolution};
