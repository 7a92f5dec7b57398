use crate::verify::Kind;

pub(crate) struct TestVector {
    pub(crate) n: u32,
    pub(crate) k: u32,
    pub(crate) input: &'static [u8],
    pub(crate) nonce: [u8; 32],
    pub(crate) indices: Vec<u32>,
}

pub(crate) struct InvalidTestVector {
    pub(crate) description: &'static str,
    pub(crate) vector: TestVector,
    pub(crate) error: Kind,
}

const INPUT: &[u8] = b"Equihash is an asymmetric PoW based on the Generalised Birthday problem.";

const NONCE_1: [u8; 32] = {
    let mut nonce = [0; 32];
    nonce[0] = 1;
    nonce
};

const SOLUTION_96_5: [u32; 32] = [
    2261, 15185, 36112, 104243, 23779, 118390, 118332, 130041, 32642, 69878, 76925, 80080, 45858,
    116805, 92842, 111026, 15972, 115059, 85191, 90330, 68190, 122819, 81830, 91132, 23460, 49807,
    52426, 80391, 69567, 114474, 104973, 122568,
];

/// The same solution in the minimal encoding.
pub(crate) const MINIMAL_96_5: [u8; 68] = [
    0x04, 0x6a, 0x8e, 0xd4, 0x51, 0xa2, 0x19, 0x73, 0x32, 0xe7, 0x1f, 0x39, 0xdb, 0x9c, 0x79, 0xfb,
    0xf9, 0x3f, 0xc1, 0x44, 0x3d, 0xa5, 0x8f, 0xb3, 0x8d, 0x05, 0x99, 0x17, 0x21, 0x16, 0xd5, 0x55,
    0xb1, 0xb2, 0x1f, 0x32, 0x70, 0x5c, 0xe9, 0x98, 0xf6, 0x0d, 0xa8, 0x52, 0xf7, 0x7f, 0x0e, 0x7f,
    0x4d, 0x63, 0xfc, 0x2d, 0xd2, 0x30, 0xa3, 0xd9, 0x99, 0x53, 0xa0, 0x78, 0x7d, 0xfe, 0xfc, 0xab,
    0x34, 0x1b, 0xde, 0xc8,
];

pub(crate) fn valid_96_5() -> TestVector {
    TestVector {
        n: 96,
        k: 5,
        input: INPUT,
        nonce: NONCE_1,
        indices: SOLUTION_96_5.to_vec(),
    }
}

/// Single mutations of [`valid_96_5`], each breaking exactly one validity rule.
pub(crate) fn invalid_96_5() -> Vec<InvalidTestVector> {
    let mutated = |description, error, f: &dyn Fn(&mut Vec<u32>)| {
        let mut vector = valid_96_5();
        f(&mut vector.indices);
        InvalidTestVector {
            description,
            vector,
            error,
        }
    };

    vec![
        mutated("change one index", Kind::Collision, &|s| s[0] += 1),
        mutated("swap two arbitrary indices", Kind::Collision, &|s| {
            s.swap(0, 12)
        }),
        mutated("reverse the first pair", Kind::OutOfOrder, &|s| s.swap(0, 1)),
        mutated("swap the first two pairs", Kind::OutOfOrder, &|s| {
            s[..4].rotate_left(2)
        }),
        mutated("swap the last two pairs", Kind::OutOfOrder, &|s| {
            s[28..].rotate_left(2)
        }),
        mutated("swap the halves", Kind::OutOfOrder, &|s| s.rotate_left(16)),
        mutated("sort the indices", Kind::Collision, &|s| s.sort_unstable()),
        mutated("duplicate every index", Kind::DuplicateIdxs, &|s| {
            *s = s[..16].iter().flat_map(|i| [*i, *i]).collect()
        }),
        mutated("duplicate the first half", Kind::DuplicateIdxs, &|s| {
            s.copy_within(..16, 16)
        }),
    ]
}
