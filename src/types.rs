//! Fixed-size byte types and the 256-bit amount type shared by the whole
//! wallet.
//!
//! All of them serialize to `0x`-prefixed hex strings, which is how they are
//! stored in the [Store][crate::store::Store] rows and how they show up in
//! logs.

use core::fmt::{Debug, Display};
use core::str::FromStr;

use rand::{distributions::Standard, prelude::Distribution};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use uint::construct_uint;

/// Error returned when parsing one of the byte types from a hex string.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("expected {expected} bytes, got {actual}")]
    ByteLengthMismatch { expected: usize, actual: usize },
}

fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

macro_rules! impl_hex_debug {
    ($T:ident) => {
        impl Debug for $T {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }

        impl Display for $T {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                Debug::fmt(self, f)
            }
        }
    };
}

macro_rules! bytesN {
    ( $T:ident, $N:literal ) => {
        #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone)]
        pub struct $T(pub [u8; $N]);

        impl $T {
            pub fn from_slice(bytes: &[u8]) -> Result<Self, ParseError> {
                let arr: [u8; $N] = bytes.try_into().or(Err(ParseError::ByteLengthMismatch {
                    expected: $N,
                    actual: bytes.len(),
                }))?;
                Ok($T(arr))
            }

            pub fn to_hex(&self) -> String {
                format!("{:?}", self)
            }
        }

        impl FromStr for $T {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_slice(&hex::decode(strip_0x(s))?)
            }
        }

        impl Serialize for $T {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $T {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }

        impl Distribution<$T> for Standard {
            fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> $T {
                let mut bytes = [0u8; $N];
                rng.fill(&mut bytes[..]);
                $T(bytes)
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self([0; $N])
            }
        }

        impl_hex_debug!($T);
    };
}

bytesN!(Hash, 32);
bytesN!(Signature, 65);
bytesN!(Address, 20);
bytesN!(Destination, 32);

impl Signature {
    pub fn new(rs: &[u8; 64], v: u8) -> Self {
        let mut sig: Signature = Signature([0; 65]);
        sig.0[..64].copy_from_slice(rs);
        sig.0[64] = v;
        sig
    }
}

impl Address {
    /// The reserved "null application": channels without application rules
    /// (e.g. ledger channels) use it as their app definition.
    pub const ZERO: Address = Address([0; 20]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

/// Where an allocation item pays out to.
///
/// External destinations are addresses left-padded with 12 zero bytes, like
/// on-chain. Anything else is interpreted as the id of another channel, which
/// is how ledger channels allocate funds to the channels they fund.
impl Destination {
    pub fn from_address(addr: Address) -> Self {
        let mut bytes = [0u8; 32];
        bytes[32 - 20..].copy_from_slice(&addr.0);
        Destination(bytes)
    }

    pub fn from_channel_id(id: Hash) -> Self {
        Destination(id.0)
    }

    pub fn is_external(&self) -> bool {
        self.0[..12].iter().all(|b| *b == 0)
    }

    pub fn to_address(&self) -> Option<Address> {
        if self.is_external() {
            let mut addr = Address::default();
            addr.0.copy_from_slice(&self.0[12..]);
            Some(addr)
        } else {
            None
        }
    }

    pub fn is_channel(&self, id: &Hash) -> bool {
        self.0 == id.0
    }
}

impl From<Address> for Destination {
    fn from(addr: Address) -> Self {
        Destination::from_address(addr)
    }
}

// We could use primitive_types:U256 here, but it serializes to a hex string
// without the 0x prefix and brings in more than we need. Amounts are stored
// as 0x-prefixed hex to keep them readable in the store rows.
construct_uint! {
    pub struct U256(4);
}

impl U256 {
    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        bytes
    }
}

impl Serialize for U256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:#x}", self))
    }
}

impl<'de> Deserialize<'de> for U256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        U256::from_str_radix(strip_0x(&s), 16).map_err(|e| de::Error::custom(format!("{:?}", e)))
    }
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let buf: [u8; 32] = rng.gen();
        U256::from_big_endian(&buf)
    }
}

/// Serialize any `Vec<u8>` as a `0x`-prefixed hex string.
///
/// Without this, serde writes byte vectors as a list of numbers.
///
/// # Example usage
/// ```
/// # use serde::{Deserialize, Serialize};
/// #[derive(Serialize, Deserialize)]
/// pub struct AppData {
///     #[serde(with = "nitro_wallet::types::as_hex")]
///     pub data: Vec<u8>,
/// }
/// ```
pub mod as_hex {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(v)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(super::strip_0x(&s)).map_err(de::Error::custom)
    }
}
