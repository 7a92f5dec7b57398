use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memuse::DynamicUsage;

use crate::{minimal::indices_from_minimal, params::ParameterSet};

/// Number of 32-bit words in a [`Seed`].
pub const SEED_WORDS: usize = 4;

/// Length in bytes of a [`Seed`].
pub const SEED_LENGTH: usize = SEED_WORDS * 4;

/// The fixed-length input that every attempt of a search is derived from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Seed([u8; SEED_LENGTH]);

impl Seed {
    pub fn from_bytes(bytes: [u8; SEED_LENGTH]) -> Self {
        Seed(bytes)
    }

    /// Builds a seed from 32-bit words, each serialized little-endian.
    pub fn from_words(words: [u32; SEED_WORDS]) -> Self {
        let mut bytes = [0; SEED_LENGTH];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Seed(bytes)
    }

    /// Builds a seed with `word` in every position.
    pub fn repeated(word: u32) -> Self {
        Self::from_words([word; SEED_WORDS])
    }

    pub fn as_bytes(&self) -> &[u8; SEED_LENGTH] {
        &self.0
    }
}

/// A solution together with the nonce it was found at.
///
/// `Proof`s are produced by the solver, or parsed from bytes of exactly the right
/// length for verification. A `Proof` is not necessarily *valid*; see
/// [`crate::verify`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Proof {
    solution: Vec<u8>,
    nonce: u32,
}

impl DynamicUsage for Proof {
    fn dynamic_usage(&self) -> usize {
        self.solution.dynamic_usage()
    }

    fn dynamic_usage_bounds(&self) -> (usize, Option<usize>) {
        self.solution.dynamic_usage_bounds()
    }
}

impl Proof {
    pub(crate) fn new(solution: Vec<u8>, nonce: u32) -> Self {
        Proof { solution, nonce }
    }

    /// Returns `None` if `solution` is not `params.solution_bytes()` long.
    pub fn from_parts(params: &ParameterSet, solution: Vec<u8>, nonce: u32) -> Option<Self> {
        (solution.len() == params.solution_bytes()).then_some(Proof { solution, nonce })
    }

    /// The minimally-encoded solution.
    pub fn solution(&self) -> &[u8] {
        &self.solution
    }

    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    /// Unpacks the solution into its `2^k` indices, in chain order.
    pub fn indices(&self, params: &ParameterSet) -> Option<Vec<u32>> {
        indices_from_minimal(params, &self.solution)
    }

    /// Reads a proof serialized by [`Proof::write`].
    pub fn read<R: Read>(params: &ParameterSet, mut reader: R) -> io::Result<Self> {
        let mut solution = vec![0; params.solution_bytes()];
        reader.read_exact(&mut solution)?;
        let nonce = reader.read_u32::<LittleEndian>()?;
        Ok(Proof { solution, nonce })
    }

    /// Writes the solution followed by the little-endian nonce.
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.solution)?;
        writer.write_u32::<LittleEndian>(self.nonce)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.solution.len() + 4);
        self.write(&mut bytes).unwrap();
        bytes
    }
}
