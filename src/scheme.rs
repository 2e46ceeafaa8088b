// SPDX-FileCopyrightText: 2023 Stefan Hackenberg <mail@stefan-hackenberg.de>
//
// SPDX-License-Identifier: MIT

//! Set-index schemes.
//!
//! Every scheme maps a line address (byte offset already stripped) onto a set
//! index in `[0, set_count)`. Schemes 7 and 8 are keyed; the key material lives
//! in [`SchemeKeys`] which is owned by the simulation and rotated by its flush
//! defense.

use std::fmt;

use des::{
    cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit},
    Des,
};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::SimError;

/// Number of address bits fed into the CEASER network.
const CEASER_ADDRESS_MASK: u64 = 0xFF_FFFF_FFFF;

/// Each half of the CEASER network is 20 bits wide.
const HALF_MASK: u32 = 0xF_FFFF;

pub const DEFAULT_DES_KEY: u64 = 0x1334_5779_9BBC_DFF1;
pub const DEFAULT_CEASER_KEYS: [u32; 4] = [0xababa, 0xcdcdc, 0xbabab, 0xdcdcd];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum IndexScheme {
    #[default]
    Modulo,
    RotateRight3,
    TagXor,
    RotateRight1Xor,
    SquareTagXor,
    OddMultiplier,
    Slide,
    Des,
    Ceaser,
    TagPermutation,
}

impl IndexScheme {
    pub const ALL: [IndexScheme; 10] = [
        IndexScheme::Modulo,
        IndexScheme::RotateRight3,
        IndexScheme::TagXor,
        IndexScheme::RotateRight1Xor,
        IndexScheme::SquareTagXor,
        IndexScheme::OddMultiplier,
        IndexScheme::Slide,
        IndexScheme::Des,
        IndexScheme::Ceaser,
        IndexScheme::TagPermutation,
    ];

    pub fn id(self) -> u8 {
        self as u8
    }

    /// Human readable name used in the leakage report header.
    pub fn name(self) -> &'static str {
        match self {
            IndexScheme::Modulo => "Module Scheme",
            IndexScheme::RotateRight3 => "Rotation Right by 3 bits",
            IndexScheme::TagXor => "XOR Scheme",
            IndexScheme::RotateRight1Xor => "Rotate Right by 1 & XOR",
            IndexScheme::SquareTagXor => "Square TAG XOR with set",
            IndexScheme::OddMultiplier => "Odd multiplier (by 7)",
            IndexScheme::Slide => "Intel Slide Cache",
            IndexScheme::Des => "DES",
            IndexScheme::Ceaser => "CEASER",
            IndexScheme::TagPermutation => "TAG PERMUTATION and later XOR SET",
        }
    }

    /// Keyed schemes change their mapping whenever the keys rotate.
    pub fn is_keyed(self) -> bool {
        matches!(self, IndexScheme::Des | IndexScheme::Ceaser)
    }
}

impl TryFrom<u8> for IndexScheme {
    type Error = SimError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        IndexScheme::ALL
            .get(id as usize)
            .copied()
            .ok_or(SimError::UnknownScheme(id))
    }
}

impl From<IndexScheme> for u8 {
    fn from(scheme: IndexScheme) -> Self {
        scheme.id()
    }
}

impl fmt::Display for IndexScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id(), self.name())
    }
}

/// Key state of the keyed schemes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemeKeys {
    pub des: u64,
    /// Four 20-bit round keys.
    pub ceaser: [u32; 4],
}

impl SchemeKeys {
    pub fn new(des: u64, ceaser: [u32; 4]) -> Self {
        Self {
            des,
            ceaser: ceaser.map(|k| k & HALF_MASK),
        }
    }

    /// Draw a fresh key set.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        let mut ceaser = [0; 4];
        for key in ceaser.iter_mut() {
            *key = rng.gen::<u32>() & HALF_MASK;
        }
        Self {
            des: rng.gen(),
            ceaser,
        }
    }
}

impl Default for SchemeKeys {
    fn default() -> Self {
        Self::new(DEFAULT_DES_KEY, DEFAULT_CEASER_KEYS)
    }
}

/// Map `address` (byte offset stripped) onto a set in `[0, set_count)`.
///
/// `set_count` must be a power of two.
pub fn compute_set(address: u64, scheme: IndexScheme, set_count: usize, keys: &SchemeKeys) -> usize {
    debug_assert!(set_count.is_power_of_two());
    if set_count <= 1 {
        return 0;
    }
    let set_bits = set_count.trailing_zeros();
    let mask = set_count as u64 - 1;
    let set = address & mask;
    let tag_slice = (address >> set_bits) & mask;

    let index = match scheme {
        IndexScheme::Modulo => set,
        IndexScheme::RotateRight3 => rotate_right(set, set_bits, 3),
        IndexScheme::TagXor => set ^ tag_slice,
        IndexScheme::RotateRight1Xor => rotate_right(set, set_bits, 1) ^ tag_slice,
        IndexScheme::SquareTagXor => {
            let square = tag_slice as u128 * tag_slice as u128;
            set ^ ((square >> (set_bits / 2)) as u64 & mask)
        }
        IndexScheme::OddMultiplier => (7 * tag_slice + set) % set_count as u64,
        IndexScheme::Slide => {
            if set_bits < 3 {
                slide_hash(address) & mask
            } else {
                let low = set & ((1 << (set_bits - 3)) - 1);
                low | (slide_hash(address) << (set_bits - 3))
            }
        }
        IndexScheme::Des => des_encrypt(address, keys.des) % set_count as u64,
        IndexScheme::Ceaser => ceaser_encrypt(address & CEASER_ADDRESS_MASK, &keys.ceaser) & mask,
        IndexScheme::TagPermutation => set ^ permute_tag(tag_slice, set_bits),
    };
    index as usize
}

/// Rotate the low `bits` bits of `value` right by `amount`.
pub fn rotate_right(value: u64, bits: u32, amount: u32) -> u64 {
    if bits == 0 {
        return 0;
    }
    let amount = amount % bits;
    let value = value & low_mask(bits);
    if amount == 0 {
        return value;
    }
    let lower = value & low_mask(amount);
    (value >> amount) | (lower << (bits - amount))
}

fn low_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1 << bits) - 1
    }
}

const fn bit_mask(bits: &[u32]) -> u64 {
    let mut mask = 0;
    let mut i = 0;
    while i < bits.len() {
        mask |= 1 << bits[i];
        i += 1;
    }
    mask
}

/// The seven parity terms of the slide hash, over address bits 6 to 34.
const SLIDE_TERMS: [u64; 7] = [
    bit_mask(&[6, 12, 17, 18, 22, 24, 27, 29, 30, 32]),
    bit_mask(&[7, 12, 13, 17, 19, 22, 23, 24, 25, 27, 28, 31, 32, 33]),
    bit_mask(&[8, 13, 14, 18, 20, 23, 24, 25, 26, 28, 32, 33, 34]),
    bit_mask(&[9, 14, 15, 19, 21, 24, 25, 26, 27, 29, 33, 34]),
    bit_mask(&[10, 15, 16, 20, 22, 25, 26, 27, 28, 30, 34]),
    bit_mask(&[11, 16, 17, 21, 23, 26, 27, 28, 29, 31]),
    bit_mask(&[12, 13, 14, 15, 16, 18, 19, 20, 21, 24, 25, 26, 28, 30, 31]),
];

fn parity(value: u64) -> u64 {
    (value.count_ones() & 1) as u64
}

/// Three bit slice selector.
pub fn slide_hash(address: u64) -> u64 {
    let f = SLIDE_TERMS.map(|term| parity(address & term));
    let s2 = (f[0] ^ f[5]) & ((f[2] | f[3]) & (f[4] | f[5]));
    let s1 = f[1] & (s2 ^ 1);
    let s0 = f.iter().fold(0, |acc, bit| acc ^ bit);
    (s2 << 2) | (s1 << 1) | s0
}

pub fn des_encrypt(block: u64, key: u64) -> u64 {
    let cipher = Des::new(&GenericArray::from(key.to_be_bytes()));
    let mut block = GenericArray::from(block.to_be_bytes());
    cipher.encrypt_block(&mut block);
    let mut out = [0u8; 8];
    out.copy_from_slice(&block);
    u64::from_be_bytes(out)
}

/// S-box rows as (data mask, key mask) pairs. Output bit `i` of a round is the
/// parity of the masked data half XOR the parity of the masked round key.
const SBOX_ROWS: [(u32, u32); 20] = [
    (0x003ff, 0x003ff),
    (0xc0ab7, 0xaaaaa),
    (0xaaaaa, 0x003ff),
    (0x55555, 0x25a8f),
    (0xe5b0a, 0x69ad4),
    (0xfcf00, 0x372b8),
    (0x8cdd2, 0xf31a4),
    (0x32bf0, 0x39b68),
    (0xdd2e0, 0x37bc0),
    (0xaf3c0, 0x0faf0),
    (0x3ef80, 0xffc00),
    (0x3ff00, 0xb32a9),
    (0x7fe00, 0x02b3f),
    (0x567a8, 0x23a97),
    (0xcea8a, 0x6a9d4),
    (0xf6f00, 0x372b8),
    (0x1cbca, 0xf518c),
    (0x9c3f0, 0x33758),
    (0xdd1e0, 0x36fc0),
    (0x6dbc0, 0x4db70),
];

/// Row rotation applied to [`SBOX_ROWS`] in each round.
const SBOX_ROUND_OFFSET: [usize; 4] = [0, 2, 5, 6];

/// Output bit `i` of the permutation of round `r` is S-box bit `PBOX[r][i]`.
const PBOX: [[u8; 20]; 4] = [
    [0, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 1],
    [2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 0, 1],
    [10, 11, 12, 13, 14, 15, 16, 17, 18, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 19],
    [4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 0, 1, 2, 3],
];

fn ceaser_round(round: usize, half: u32, key: u32) -> u32 {
    let mut sbox = 0u32;
    for bit in 0..20 {
        let (data_mask, key_mask) = SBOX_ROWS[(bit + 20 - SBOX_ROUND_OFFSET[round]) % 20];
        let out = (half & data_mask).count_ones() ^ (key & key_mask).count_ones();
        sbox |= (out & 1) << bit;
    }
    PBOX[round]
        .iter()
        .enumerate()
        .fold(0, |acc, (i, &src)| acc | (((sbox >> src) & 1) << i))
}

/// Four round Feistel network over two 20-bit halves.
pub fn ceaser_encrypt(address: u64, keys: &[u32; 4]) -> u64 {
    let r1 = address as u32 & HALF_MASK;
    let l1 = (address >> 20) as u32 & HALF_MASK;

    let r2 = r1 ^ ceaser_round(0, l1, keys[0]);
    let l2 = l1 ^ ceaser_round(1, r2, keys[1]);
    let l3 = r2 ^ ceaser_round(2, l2, keys[2]);
    let r3 = l2 ^ ceaser_round(3, l3, keys[3]);

    ((l3 as u64) << 20) | r3 as u64
}

/// Bit 0 stays, bits 2.. move down by one and bit 1 wraps to the top.
pub fn permute_tag(tag: u64, bits: u32) -> u64 {
    if bits <= 2 {
        return tag & low_mask(bits);
    }
    let top = bits - 1;
    let bit0 = tag & 1;
    let bit1 = (tag >> 1) & 1;
    let middle = (tag >> 2) & low_mask(top - 1);
    bit0 | (middle << 1) | (bit1 << top)
}
