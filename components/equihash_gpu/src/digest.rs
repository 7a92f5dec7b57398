//! The personalised BLAKE2b state from which every leaf of an attempt is derived.

use std::fmt;

use blake2b_simd::{Hash as Blake2bHash, Params as Blake2bParams, State as Blake2bState};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{error::Error, minimal::expand_array, params::ParameterSet};

const PERSONALIZATION_PREFIX: &[u8; 8] = b"ZcashPoW";
const PERSONALIZATION_BYTES: usize = 16;

/// The most input a digest image can carry: the seed plus everything layered on top of
/// it, such as the nonce.
pub const MAX_ABSORBED_BYTES: usize = 256;

const IMAGE_HEADER_BYTES: usize = 1 + PERSONALIZATION_BYTES + 4;

/// Size of the digest buffer handed to devices.
pub const DIGEST_IMAGE_BYTES: usize = IMAGE_HEADER_BYTES + MAX_ABSORBED_BYTES;

/// A BLAKE2b engine that has absorbed the `(n, k)` personalisation and the seed, but
/// not yet the nonce.
///
/// The state is built once per seed. Each attempt layers its nonce onto a copy with
/// [`PartialDigest::with_nonce`], so a `PartialDigest` is never mutated once shared.
#[derive(Clone)]
pub struct PartialDigest {
    hash_length: u8,
    personal: [u8; PERSONALIZATION_BYTES],
    absorbed: Vec<u8>,
    state: Blake2bState,
}

impl fmt::Debug for PartialDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialDigest")
            .field("hash_length", &self.hash_length)
            .field("personal", &hex::encode(self.personal))
            .field("absorbed", &hex::encode(&self.absorbed))
            .finish()
    }
}

impl PartialEq for PartialDigest {
    fn eq(&self, other: &Self) -> bool {
        self.hash_length == other.hash_length
            && self.personal == other.personal
            && self.absorbed == other.absorbed
    }
}

impl Eq for PartialDigest {}

fn personalization(n: u32, k: u32) -> [u8; PERSONALIZATION_BYTES] {
    let mut personal = [0; PERSONALIZATION_BYTES];
    personal[..8].copy_from_slice(PERSONALIZATION_PREFIX);
    (&mut personal[8..12]).write_u32::<LittleEndian>(n).unwrap();
    (&mut personal[12..]).write_u32::<LittleEndian>(k).unwrap();
    personal
}

fn initialise_state(hash_length: u8, personal: &[u8]) -> Blake2bState {
    Blake2bParams::new()
        .hash_length(hash_length as usize)
        .personal(personal)
        .to_state()
}

impl PartialDigest {
    /// Initialises the engine for `params` and absorbs `seed`.
    pub fn seed(params: &ParameterSet, seed: &[u8]) -> Self {
        let hash_length = params.hash_output_bytes();
        let personal = personalization(params.n(), params.k());
        PartialDigest {
            hash_length,
            personal,
            absorbed: vec![],
            state: initialise_state(hash_length, &personal),
        }
        .absorb(seed)
    }

    /// Returns a copy of this state with `input` absorbed.
    pub fn absorb(&self, input: &[u8]) -> Self {
        let mut next = self.clone();
        next.state.update(input);
        next.absorbed.extend_from_slice(input);
        next
    }

    /// Returns a copy of this state with the little-endian `nonce` absorbed.
    pub fn with_nonce(&self, nonce: u32) -> Self {
        self.absorb(&nonce.to_le_bytes())
    }

    pub(crate) fn state(&self) -> &Blake2bState {
        &self.state
    }

    /// Serializes the engine state for upload into a digest buffer.
    ///
    /// The image is `hash_length || personalisation || le32(len) || absorbed`, padded
    /// with zeroes to [`DIGEST_IMAGE_BYTES`].
    pub(crate) fn to_image(&self) -> Result<Vec<u8>, Error> {
        if self.absorbed.len() > MAX_ABSORBED_BYTES {
            return Err(Error::BufferAllocation {
                buffer: "digest",
                bytes: IMAGE_HEADER_BYTES + self.absorbed.len(),
                reason: format!("more than {} bytes were absorbed", MAX_ABSORBED_BYTES),
            });
        }

        let mut image = Vec::with_capacity(DIGEST_IMAGE_BYTES);
        image.push(self.hash_length);
        image.extend_from_slice(&self.personal);
        image
            .write_u32::<LittleEndian>(self.absorbed.len() as u32)
            .unwrap();
        image.extend_from_slice(&self.absorbed);
        image.resize(DIGEST_IMAGE_BYTES, 0);
        Ok(image)
    }

    /// Rebuilds the engine state from a digest image. Returns `None` if the image is
    /// malformed.
    pub(crate) fn from_image(mut image: &[u8]) -> Option<Self> {
        let hash_length = image.read_u8().ok()?;
        if hash_length == 0 || hash_length as usize > blake2b_simd::OUTBYTES {
            return None;
        }
        let mut personal = [0; PERSONALIZATION_BYTES];
        personal.copy_from_slice(image.get(..PERSONALIZATION_BYTES)?);
        image = &image[PERSONALIZATION_BYTES..];
        let len = image.read_u32::<LittleEndian>().ok()? as usize;
        if len > MAX_ABSORBED_BYTES {
            return None;
        }
        let absorbed = image.get(..len)?;

        Some(
            PartialDigest {
                hash_length,
                personal,
                absorbed: vec![],
                state: initialise_state(hash_length, &personal),
            }
            .absorb(absorbed),
        )
    }
}

fn generate_hash(base_state: &Blake2bState, i: u32) -> Blake2bHash {
    let mut lei = [0u8; 4];
    (&mut lei[..]).write_u32::<LittleEndian>(i).unwrap();

    let mut state = base_state.clone();
    state.update(&lei);
    state.finalize()
}

/// Cuts leaf `i` out of the BLAKE2b output that contains it, and expands it into
/// `k + 1` byte-aligned collision blocks.
fn expand_leaf(p: &ParameterSet, hash: &Blake2bHash, i: u32) -> Vec<u8> {
    let start = ((i % p.indices_per_hash_output()) * p.n() / 8) as usize;
    let end = start + (p.n() as usize) / 8;
    let mut leaf = expand_array(&hash.as_bytes()[start..end], p.collision_bits(), 0);
    // Bits past (k + 1) * collision_bits only exist when n is not a multiple of k + 1.
    leaf.truncate(p.hash_row_bytes());
    leaf
}

/// The expanded hash of leaf `i`.
pub(crate) fn leaf_hash(p: &ParameterSet, state: &Blake2bState, i: u32) -> Vec<u8> {
    let hash = generate_hash(state, i / p.indices_per_hash_output());
    expand_leaf(p, &hash, i)
}

/// Calls `f` with the expanded hash of every leaf in `start..end`, computing each
/// BLAKE2b output only once.
pub(crate) fn for_each_leaf(
    p: &ParameterSet,
    state: &Blake2bState,
    start: u32,
    end: u32,
    mut f: impl FnMut(u32, &[u8]),
) {
    let per_output = p.indices_per_hash_output();
    let mut cached: Option<(u32, Blake2bHash)> = None;
    for i in start..end {
        let g = i / per_output;
        let hash = match cached {
            Some((cached_g, hash)) if cached_g == g => hash,
            _ => generate_hash(state, g),
        };
        f(i, &expand_leaf(p, &hash, i));
        cached = Some((g, hash));
    }
}

#[cfg(test)]
mod tests {
    use super::{for_each_leaf, leaf_hash, personalization, PartialDigest, DIGEST_IMAGE_BYTES};
    use crate::params::ParameterSet;

    #[test]
    fn personalization_encodes_parameters() {
        assert_eq!(
            &personalization(200, 9),
            b"ZcashPoW\xc8\x00\x00\x00\x09\x00\x00\x00"
        );
    }

    #[test]
    fn seeding_is_deterministic() {
        let p = ParameterSet::derive(96, 5).unwrap();
        let a = PartialDigest::seed(&p, b"seed");
        let b = PartialDigest::seed(&p, b"seed");
        assert_eq!(a, b);
        assert_eq!(
            a.with_nonce(7).state().finalize(),
            b.with_nonce(7).state().finalize()
        );
        assert_ne!(
            a.with_nonce(7).state().finalize(),
            a.with_nonce(8).state().finalize()
        );
    }

    #[test]
    fn parameters_separate_domains() {
        let a = PartialDigest::seed(&ParameterSet::derive(96, 5).unwrap(), b"seed");
        let b = PartialDigest::seed(&ParameterSet::derive(144, 5).unwrap(), b"seed");
        assert_ne!(a, b);
        assert_ne!(a.state().finalize(), b.state().finalize());
    }

    #[test]
    fn nonce_does_not_touch_the_seeded_state() {
        let p = ParameterSet::derive(48, 5).unwrap();
        let seeded = PartialDigest::seed(&p, b"seed");
        let before = seeded.state().finalize();
        let _ = seeded.with_nonce(1);
        assert_eq!(seeded.state().finalize(), before);
    }

    #[test]
    fn image_round_trip_preserves_state() {
        let p = ParameterSet::derive(96, 5).unwrap();
        let digest = PartialDigest::seed(&p, b"some seed bytes").with_nonce(42);
        let image = digest.to_image().unwrap();
        assert_eq!(image.len(), DIGEST_IMAGE_BYTES);

        let restored = PartialDigest::from_image(&image).unwrap();
        assert_eq!(restored, digest);
        assert_eq!(restored.state().finalize(), digest.state().finalize());
    }

    #[test]
    fn oversized_input_has_no_image() {
        let p = ParameterSet::derive(96, 5).unwrap();
        let digest = PartialDigest::seed(&p, &[0; 300]);
        assert!(digest.to_image().is_err());
        assert_eq!(PartialDigest::from_image(&[0; 4]), None);
    }

    #[test]
    fn batched_leaves_match_single_leaves() {
        let p = ParameterSet::derive(48, 5).unwrap();
        let digest = PartialDigest::seed(&p, b"seed").with_nonce(3);
        let mut seen = 0;
        for_each_leaf(&p, digest.state(), 5, 37, |i, leaf| {
            assert_eq!(leaf, &leaf_hash(&p, digest.state(), i)[..]);
            assert_eq!(leaf.len(), p.hash_row_bytes());
            seen += 1;
        });
        assert_eq!(seen, 32);
    }
}
