use std::mem::size_of;

use crate::error::Error;

/// Width in bytes of one provenance index stored in a table row.
pub(crate) const INDEX_BYTES: usize = size_of::<u32>();

/// Indices and expanded hash blocks are handled through a 32-bit accumulator, which
/// leaves room for at most 24 collision bits (plus the extra index bit and a partial
/// input byte).
const MAX_COLLISION_BITS: usize = 24;
const MIN_COLLISION_BITS: usize = 8;

/// The algorithm constants derived from an Equihash `(n, k)` pair.
///
/// A `ParameterSet` is computed once per run and never changes afterwards. Every
/// buffer used by the solver is sized from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ParameterSet {
    n: u32,
    k: u32,
    collision_bits: usize,
    collision_bytes: usize,
    indices_per_hash_output: u32,
    table_rows: usize,
    row_width_bytes: usize,
    table_bytes: usize,
    solution_bytes: usize,
}

/// The shape of a table row after `depth` collision rounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RowLayout {
    /// Bytes of hash that have not yet been cancelled.
    pub(crate) hash_bytes: usize,
    /// Number of provenance indices carried by the row.
    pub(crate) indices: usize,
}

impl RowLayout {
    pub(crate) fn stride(&self) -> usize {
        self.hash_bytes + self.indices * INDEX_BYTES
    }
}

impl ParameterSet {
    /// Derives the parameter set for Equihash `(n, k)`.
    ///
    /// We place the following requirements on the parameters:
    /// - `0 < k < n`;
    /// - `n` is a multiple of 8 no larger than 512, so each hash sub-output has an exact
    ///   byte length and at least one fits in a BLAKE2b output;
    /// - `n / (k + 1)` is between 8 and 24 bits;
    /// - `2^k * (n / (k + 1) + 1)` is a multiple of 8, so encoded solutions have an exact
    ///   byte length;
    /// - the table buffers fit in addressable memory.
    ///
    /// `n` need not be a multiple of `k + 1`; the collision bit length is truncated and
    /// the trailing hash bits are ignored.
    pub fn derive(n: u32, k: u32) -> Result<Self, Error> {
        let invalid = |reason| Error::InvalidParameters { n, k, reason };

        if k == 0 {
            return Err(invalid("k must be positive"));
        }
        if k >= n {
            return Err(invalid("k must be smaller than n"));
        }
        if n % 8 != 0 {
            return Err(invalid("n must be a multiple of 8"));
        }
        if n > 512 {
            return Err(invalid("n must not exceed the 512-bit hash output"));
        }

        let collision_bits = (n / (k + 1)) as usize;
        if !(MIN_COLLISION_BITS..=MAX_COLLISION_BITS).contains(&collision_bits) {
            return Err(invalid("n / (k + 1) must be between 8 and 24"));
        }

        let solution_indices = 1usize
            .checked_shl(k)
            .ok_or_else(|| invalid("2^k does not fit in usize"))?;
        let solution_bits = solution_indices
            .checked_mul(collision_bits + 1)
            .ok_or_else(|| invalid("solution size does not fit in usize"))?;
        if solution_bits % 8 != 0 {
            return Err(invalid("encoded solutions must be a whole number of bytes"));
        }

        let collision_bytes = collision_bits.div_ceil(8);
        let row_width_bytes = (solution_indices / 2)
            .checked_mul(INDEX_BYTES)
            .and_then(|indices| indices.checked_add(2 * collision_bytes))
            .ok_or_else(|| invalid("row width does not fit in usize"))?;
        let table_rows = 1usize << (collision_bits + 1);
        let table_bytes = table_rows
            .checked_mul(row_width_bytes)
            .filter(|bytes| *bytes <= isize::MAX as usize)
            .ok_or_else(|| invalid("table buffers exceed addressable memory"))?;

        Ok(ParameterSet {
            n,
            k,
            collision_bits,
            collision_bytes,
            indices_per_hash_output: 512 / n,
            table_rows,
            row_width_bytes,
            table_bytes,
            solution_bytes: solution_bits / 8,
        })
    }

    pub fn n(&self) -> u32 {
        self.n
    }

    pub fn k(&self) -> u32 {
        self.k
    }

    /// `n / (k + 1)`: the number of bits cancelled by each collision round.
    pub fn collision_bits(&self) -> usize {
        self.collision_bits
    }

    pub fn collision_bytes(&self) -> usize {
        self.collision_bytes
    }

    /// Length of a fully expanded leaf hash: `k + 1` byte-aligned blocks.
    pub fn hash_row_bytes(&self) -> usize {
        (self.k as usize + 1) * self.collision_bytes
    }

    /// How many `n`-bit leaves one BLAKE2b invocation yields.
    pub fn indices_per_hash_output(&self) -> u32 {
        self.indices_per_hash_output
    }

    /// The BLAKE2b output length used for leaf generation.
    pub fn hash_output_bytes(&self) -> u8 {
        (self.indices_per_hash_output * self.n / 8) as u8
    }

    /// Width of a row at the widest intermediate round: `2^(k-1)` indices plus the two
    /// hash blocks that remain before the final round.
    pub fn row_width_bytes(&self) -> usize {
        self.row_width_bytes
    }

    /// Number of leaves, and the row capacity of the initial table.
    pub fn table_rows(&self) -> usize {
        self.table_rows
    }

    /// Size of each of the two table buffers.
    pub fn table_bytes(&self) -> usize {
        self.table_bytes
    }

    /// Number of indices in a solution: `2^k`.
    pub fn solution_indices(&self) -> usize {
        1 << self.k
    }

    /// Length of a minimally-encoded solution.
    pub fn solution_bytes(&self) -> usize {
        self.solution_bytes
    }

    /// Returns the row shape after `depth` collision rounds.
    ///
    /// Rounds before the last cancel one block each; the last round cancels the final
    /// two, so rows at depth `k` carry no hash at all.
    pub(crate) fn row_layout(&self, depth: u32) -> RowLayout {
        let hash_bytes = if depth < self.k {
            (self.k - depth + 1) as usize * self.collision_bytes
        } else {
            0
        };
        RowLayout {
            hash_bytes,
            indices: 1 << depth,
        }
    }

    /// Number of leading hash bytes compared by collision round `round`.
    pub(crate) fn compared_bytes(&self, round: u32) -> usize {
        if round + 1 < self.k {
            self.collision_bytes
        } else {
            2 * self.collision_bytes
        }
    }

    /// How many rows of depth `depth` fit in one table buffer.
    pub(crate) fn table_capacity(&self, depth: u32) -> usize {
        self.table_bytes / self.row_layout(depth).stride()
    }
}
