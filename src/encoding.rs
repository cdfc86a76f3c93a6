//! Deterministic slot encoding used for channel ids and state hashes.
//!
//! Every value is written as one or more 32 byte slots, similar to how the
//! adjudicator lays out static types: integers and addresses right aligned,
//! fixed-size bytes left aligned. Dynamic values (byte strings and lists) are
//! prefixed with their length. Hashes are the Keccak-256 of the slots.
//!
//! Wire data is never trusted to carry a correct hash, so this encoding is the
//! single source for every hash the wallet compares.

use sha3::{
    digest::{core_api::CoreWrapper, Output},
    Digest, Keccak256, Keccak256Core,
};

use crate::types::{Address, Destination, Hash, U256};

pub const SLOT_SIZE: usize = 32; // bytes

pub trait Writer {
    fn write(&mut self, slot: &[u8]);

    fn write_right_aligned(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= SLOT_SIZE);
        let mut slot = [0u8; SLOT_SIZE];
        slot[SLOT_SIZE - bytes.len()..].copy_from_slice(bytes);
        self.write(&slot);
    }

    /// Write `bytes` left aligned, zero padded to a multiple of [SLOT_SIZE].
    fn write_padded(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks(SLOT_SIZE) {
            let mut slot = [0u8; SLOT_SIZE];
            slot[..chunk.len()].copy_from_slice(chunk);
            self.write(&slot);
        }
    }
}

/// Types that have a canonical slot encoding.
pub trait Encode {
    fn encode<W: Writer>(&self, w: &mut W);
}

impl Encode for U256 {
    fn encode<W: Writer>(&self, w: &mut W) {
        w.write(&self.to_be_bytes());
    }
}

impl Encode for u64 {
    fn encode<W: Writer>(&self, w: &mut W) {
        w.write_right_aligned(&self.to_be_bytes());
    }
}

impl Encode for bool {
    fn encode<W: Writer>(&self, w: &mut W) {
        w.write_right_aligned(&[*self as u8]);
    }
}

impl Encode for Address {
    fn encode<W: Writer>(&self, w: &mut W) {
        // Addresses are right aligned (like uints) instead of left aligned
        // like bytesN.
        w.write_right_aligned(&self.0);
    }
}

impl Encode for Hash {
    fn encode<W: Writer>(&self, w: &mut W) {
        w.write(&self.0);
    }
}

impl Encode for Destination {
    fn encode<W: Writer>(&self, w: &mut W) {
        w.write(&self.0);
    }
}

/// Dynamic byte string: length slot followed by the padded data.
pub fn encode_bytes<W: Writer>(bytes: &[u8], w: &mut W) {
    (bytes.len() as u64).encode(w);
    w.write_padded(bytes);
}

/// Dynamic list: length slot followed by each element.
pub fn encode_list<T: Encode, W: Writer>(items: &[T], w: &mut W) {
    (items.len() as u64).encode(w);
    for item in items {
        item.encode(w);
    }
}

pub struct Keccak256Writer {
    hasher: CoreWrapper<Keccak256Core>,
}

impl Default for Keccak256Writer {
    fn default() -> Self {
        Self {
            hasher: Keccak256::new(),
        }
    }
}

impl Writer for Keccak256Writer {
    fn write(&mut self, slot: &[u8]) {
        self.hasher.update(slot);
    }
}

impl Keccak256Writer {
    pub fn finalize(self) -> Output<Keccak256> {
        self.hasher.finalize()
    }
}

/// Collects the slots, mostly useful for looking at what gets hashed.
#[derive(Debug, Default)]
pub struct VecWriter(pub Vec<u8>);

impl Writer for VecWriter {
    fn write(&mut self, slot: &[u8]) {
        self.0.extend_from_slice(slot);
    }
}

pub fn to_hash<T>(value: &T) -> Hash
where
    T: Encode + ?Sized,
{
    let mut writer = Keccak256Writer::default();
    value.encode(&mut writer);
    Hash(writer.finalize().into())
}
