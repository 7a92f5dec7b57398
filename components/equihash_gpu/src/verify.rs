//! Verification functions for the [Equihash] proof-of-work algorithm.
//!
//! Verification runs entirely on the host and does not depend on any compute backend,
//! so anyone can check a [`Proof`] without parallel hardware.
//!
//! [Equihash]: https://zips.z.cash/protocol/protocol.pdf#equihash

use std::fmt;

use blake2b_simd::State as Blake2bState;
use tracing::debug;

use crate::{
    digest::{leaf_hash, PartialDigest},
    minimal::indices_from_minimal,
    params::ParameterSet,
    proof::{Proof, Seed},
};

#[derive(Clone)]
struct Node {
    hash: Vec<u8>,
    indices: Vec<u32>,
}

impl Node {
    fn leaf(hash: Vec<u8>, i: u32) -> Self {
        Node {
            hash,
            indices: vec![i],
        }
    }

    fn from_children(a: Node, b: Node, trim: usize) -> Self {
        let hash: Vec<_> = a
            .hash
            .iter()
            .zip(b.hash.iter())
            .skip(trim)
            .map(|(a, b)| a ^ b)
            .collect();
        let (mut indices, tail) = if a.indices_before(&b) {
            (a.indices, b.indices)
        } else {
            (b.indices, a.indices)
        };
        indices.extend(tail);
        Node { hash, indices }
    }

    #[cfg(test)]
    fn from_children_ref(a: &Node, b: &Node, trim: usize) -> Self {
        Node::from_children(a.clone(), b.clone(), trim)
    }

    fn indices_before(&self, other: &Node) -> bool {
        self.indices[0] < other.indices[0]
    }

    fn is_zero(&self, len: usize) -> bool {
        self.hash.iter().take(len).all(|v| *v == 0)
    }
}

/// An Equihash solution failed to verify.
#[derive(Debug)]
pub struct InvalidSolution(Kind);

impl fmt::Display for InvalidSolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid solution: {}", self.0)
    }
}

impl std::error::Error for InvalidSolution {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Kind {
    InvalidParams,
    Collision,
    OutOfOrder,
    DuplicateIdxs,
    NonZeroRootHash,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::InvalidParams => f.write_str("invalid parameters"),
            Kind::Collision => f.write_str("invalid collision length between StepRows"),
            Kind::OutOfOrder => f.write_str("Index tree incorrectly ordered"),
            Kind::DuplicateIdxs => f.write_str("duplicate indices"),
            Kind::NonZeroRootHash => f.write_str("root hash of tree is non-zero"),
        }
    }
}

fn has_collision(a: &Node, b: &Node, len: usize) -> bool {
    a.hash
        .iter()
        .zip(b.hash.iter())
        .take(len)
        .all(|(a, b)| a == b)
}

fn validate_subtrees(p: &ParameterSet, a: &Node, b: &Node) -> Result<(), Kind> {
    if !has_collision(a, b, p.collision_bytes()) {
        Err(Kind::Collision)
    } else if b.indices_before(a) {
        Err(Kind::OutOfOrder)
    } else {
        Ok(())
    }
}

fn distinct_indices(indices: &[u32]) -> bool {
    let mut sorted = indices.to_vec();
    sorted.sort_unstable();
    sorted.windows(2).all(|w| w[0] != w[1])
}

fn tree_validator<F>(p: &ParameterSet, leaf: &F, indices: &[u32]) -> Result<Node, Kind>
where
    F: Fn(u32) -> Vec<u8>,
{
    if indices.len() > 1 {
        let end = indices.len();
        let mid = end / 2;
        let a = tree_validator(p, leaf, &indices[0..mid])?;
        let b = tree_validator(p, leaf, &indices[mid..end])?;
        validate_subtrees(p, &a, &b)?;
        Ok(Node::from_children(a, b, p.collision_bytes()))
    } else {
        Ok(Node::leaf(leaf(indices[0]), indices[0]))
    }
}

/// Checks `indices` against the tree rules, taking each leaf's expanded hash from
/// `leaf`.
fn validate_tree<F>(p: &ParameterSet, leaf: F, indices: &[u32]) -> Result<(), Kind>
where
    F: Fn(u32) -> Vec<u8>,
{
    if indices.len() != p.solution_indices() {
        return Err(Kind::InvalidParams);
    }
    if !distinct_indices(indices) {
        return Err(Kind::DuplicateIdxs);
    }

    let root = tree_validator(p, &leaf, indices)?;

    // Hashes were trimmed, so only need to check remaining length
    if root.is_zero(p.collision_bytes()) {
        Ok(())
    } else {
        Err(Kind::NonZeroRootHash)
    }
}

/// Checks a chain of leaf indices against the engine state that produced its leaves.
pub(crate) fn validate_indices(
    p: &ParameterSet,
    state: &Blake2bState,
    indices: &[u32],
) -> Result<(), Kind> {
    validate_tree(p, |i| leaf_hash(p, state, i), indices)
}

/// Checks whether `soln` is a valid solution for `(input, nonce)` with the
/// parameters `(n, k)`.
pub fn is_valid_solution(
    n: u32,
    k: u32,
    input: &[u8],
    nonce: &[u8],
    soln: &[u8],
) -> Result<(), InvalidSolution> {
    let p = ParameterSet::derive(n, k).map_err(|_| InvalidSolution(Kind::InvalidParams))?;
    let indices =
        indices_from_minimal(&p, soln).ok_or(InvalidSolution(Kind::InvalidParams))?;
    let digest = PartialDigest::seed(&p, input).absorb(nonce);

    validate_indices(&p, digest.state(), &indices).map_err(InvalidSolution)
}

/// Returns `true` if `proof` is a valid solution for `seed` under `params`.
///
/// A malformed proof is simply invalid; the reason is logged at `debug` level.
pub fn verify(proof: &Proof, params: &ParameterSet, seed: &Seed) -> bool {
    let Some(indices) = proof.indices(params) else {
        debug!(
            nonce = proof.nonce(),
            len = proof.solution().len(),
            "Proof has the wrong solution length"
        );
        return false;
    };

    let digest = PartialDigest::seed(params, seed.as_bytes()).with_nonce(proof.nonce());
    match validate_indices(params, digest.state(), &indices) {
        Ok(()) => true,
        Err(kind) => {
            debug!(nonce = proof.nonce(), "Rejected proof: {}", kind);
            false
        }
    }
}
