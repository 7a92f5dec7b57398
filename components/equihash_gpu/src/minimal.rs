//! Bit-packing between byte-aligned values and the minimal big-endian encoding used
//! for hash outputs and solutions.

use std::io::Cursor;
use std::mem::size_of;

use byteorder::{BigEndian, ReadBytesExt};

use crate::params::ParameterSet;

/// Splits `vin` into `bit_len`-bit big-endian chunks, each written into
/// `ceil(bit_len / 8) + byte_pad` bytes.
pub(crate) fn expand_array(vin: &[u8], bit_len: usize, byte_pad: usize) -> Vec<u8> {
    assert!(bit_len >= 8);
    assert!(u32::BITS as usize >= 7 + bit_len);

    let out_width = bit_len.div_ceil(8) + byte_pad;
    let out_len = 8 * out_width * vin.len() / bit_len;

    // Shortcut for parameters where expansion is a no-op
    if out_len == vin.len() {
        return vin.to_vec();
    }

    let mut vout: Vec<u8> = vec![0; out_len];
    let bit_len_mask: u32 = (1 << bit_len) - 1;

    // The acc_bits least-significant bits of acc_value represent a bit sequence
    // in big-endian order.
    let mut acc_bits = 0;
    let mut acc_value: u32 = 0;

    let mut j = 0;
    for b in vin {
        acc_value = (acc_value << 8) | u32::from(*b);
        acc_bits += 8;

        // When we have bit_len or more bits in the accumulator, write the next
        // output element.
        if acc_bits >= bit_len {
            acc_bits -= bit_len;
            for x in byte_pad..out_width {
                vout[j + x] = ((
                    // Big-endian
                    acc_value >> (acc_bits + (8 * (out_width - x - 1)))
                ) & (
                    // Apply bit_len_mask across byte boundaries
                    (bit_len_mask >> (8 * (out_width - x - 1))) & 0xFF
                )) as u8;
            }
            j += out_width;
        }
    }

    vout
}

/// The inverse of [`expand_array`]: packs `bit_len`-bit values stored in
/// `ceil(bit_len / 8) + byte_pad`-byte big-endian slots back into a dense bit string.
pub(crate) fn compress_array(vin: &[u8], bit_len: usize, byte_pad: usize) -> Vec<u8> {
    assert!(bit_len >= 8);
    assert!(u32::BITS as usize >= 7 + bit_len);

    let in_width = bit_len.div_ceil(8) + byte_pad;
    let out_len = bit_len * vin.len() / (8 * in_width);

    if out_len == vin.len() {
        return vin.to_vec();
    }

    let mut vout = vec![0; out_len];
    let bit_len_mask: u32 = (1 << bit_len) - 1;

    let mut acc_bits = 0;
    let mut acc_value: u32 = 0;

    let mut j = 0;
    for out in vout.iter_mut() {
        // Refill the accumulator with the next input element once fewer than 8 bits
        // are left in it.
        if acc_bits < 8 {
            acc_value <<= bit_len;
            for x in byte_pad..in_width {
                let shift = 8 * (in_width - x - 1);
                acc_value |= (u32::from(vin[j + x]) & ((bit_len_mask >> shift) & 0xFF)) << shift;
            }
            j += in_width;
            acc_bits += bit_len;
        }

        acc_bits -= 8;
        *out = (acc_value >> acc_bits) as u8;
    }

    vout
}

/// Returns `None` if `minimal` is not the encoded length of a solution for `p`.
pub(crate) fn indices_from_minimal(p: &ParameterSet, minimal: &[u8]) -> Option<Vec<u32>> {
    let c_bit_len = p.collision_bits();
    if minimal.len() != p.solution_bytes() {
        return None;
    }

    let byte_pad = size_of::<u32>() - (c_bit_len + 1).div_ceil(8);

    let mut csr = Cursor::new(expand_array(minimal, c_bit_len + 1, byte_pad));
    let mut ret = Vec::with_capacity(p.solution_indices());

    // Big-endian so that lexicographic array comparison is equivalent to integer
    // comparison
    while let Ok(i) = csr.read_u32::<BigEndian>() {
        ret.push(i);
    }

    Some(ret)
}

/// Packs `2^k` indices into the minimal encoding, `n / (k + 1) + 1` bits each.
pub(crate) fn minimal_from_indices(p: &ParameterSet, indices: &[u32]) -> Vec<u8> {
    let c_bit_len = p.collision_bits();
    let byte_pad = size_of::<u32>() - (c_bit_len + 1).div_ceil(8);

    let array: Vec<u8> = indices.iter().flat_map(|i| i.to_be_bytes()).collect();
    compress_array(&array, c_bit_len + 1, byte_pad)
}

#[cfg(test)]
mod tests {
    use proptest::collection::vec;
    use proptest::prelude::*;

    use super::{compress_array, expand_array, indices_from_minimal, minimal_from_indices};
    use crate::params::ParameterSet;

    #[test]
    fn array_expansion() {
        let check_array = |(bit_len, byte_pad), compact: &[u8], expanded: &[u8]| {
            assert_eq!(expand_array(compact, bit_len, byte_pad), expanded);
            assert_eq!(compress_array(expanded, bit_len, byte_pad), compact);
        };

        // 8 11-bit chunks, all-ones
        check_array(
            (11, 0),
            &[0xff; 11],
            &[
                0x07, 0xff, 0x07, 0xff, 0x07, 0xff, 0x07, 0xff, 0x07, 0xff, 0x07, 0xff, 0x07, 0xff,
                0x07, 0xff,
            ],
        );
        // 8 21-bit chunks, alternating 1s and 0s
        check_array(
            (21, 0),
            &[
                0xaa, 0xaa, 0xad, 0x55, 0x55, 0x6a, 0xaa, 0xab, 0x55, 0x55, 0x5a, 0xaa, 0xaa, 0xd5,
                0x55, 0x56, 0xaa, 0xaa, 0xb5, 0x55, 0x55,
            ],
            &[
                0x15, 0x55, 0x55, 0x15, 0x55, 0x55, 0x15, 0x55, 0x55, 0x15, 0x55, 0x55, 0x15, 0x55,
                0x55, 0x15, 0x55, 0x55, 0x15, 0x55, 0x55, 0x15, 0x55, 0x55,
            ],
        );
        // 8 11-bit chunks, all-ones, 2-byte padding
        check_array(
            (11, 2),
            &[0xff; 11],
            &[0x00, 0x00, 0x07, 0xff].repeat(8)[..],
        );
    }

    #[test]
    fn minimal_solution_repr() {
        let p = ParameterSet::derive(80, 3).unwrap();
        let check_repr = |minimal: &[u8], indices: &[u32]| {
            assert_eq!(indices_from_minimal(&p, minimal).unwrap(), indices);
            assert_eq!(minimal_from_indices(&p, indices), minimal);
        };

        // The solutions here are not intended to be valid.
        check_repr(
            &[
                0x00, 0x00, 0x08, 0x00, 0x00, 0x40, 0x00, 0x02, 0x00, 0x00, 0x10, 0x00, 0x00, 0x80,
                0x00, 0x04, 0x00, 0x00, 0x20, 0x00, 0x01,
            ],
            &[1, 1, 1, 1, 1, 1, 1, 1],
        );
        check_repr(
            &[
                0x00, 0x02, 0x20, 0x00, 0x0a, 0x7f, 0xff, 0xfe, 0x00, 0x4d, 0x10, 0x01, 0x4c, 0x80,
                0x0f, 0xfc, 0x00, 0x00, 0x2f, 0xff, 0xff,
            ],
            &[68, 41, 2097151, 1233, 665, 1023, 1, 1048575],
        );
    }

    #[test]
    fn wrong_length_is_rejected() {
        let p = ParameterSet::derive(80, 3).unwrap();
        assert_eq!(indices_from_minimal(&p, &[0; 20]), None);
        assert_eq!(indices_from_minimal(&p, &[0; 22]), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn minimal_encoding_is_invertible(raw in vec(any::<u32>(), 32)) {
            let p = ParameterSet::derive(96, 5).unwrap();
            let mask = (1u32 << (p.collision_bits() + 1)) - 1;
            let indices: Vec<u32> = raw.into_iter().map(|i| i & mask).collect();

            let minimal = minimal_from_indices(&p, &indices);
            prop_assert_eq!(minimal.len(), p.solution_bytes());
            prop_assert_eq!(indices_from_minimal(&p, &minimal), Some(indices));
        }
    }
}
