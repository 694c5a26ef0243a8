//! Fixed-size byte types shared by signers and slashing protection.

use crate::serialization::Str;
use rocket::serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};
use thiserror::Error;

macro_rules! impl_fixed_bytes {
    (
        $(#[$attr:meta])*
        pub struct $t:ident([u8; $n:literal]);
    ) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $t(pub [u8; $n]);

        impl $t {
            /// The length of the value in bytes.
            pub const LEN: usize = $n;

            /// Creates a value from a byte slice, returning `None` if the
            /// slice has the wrong length.
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                bytes.try_into().ok().map(Self)
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = InvalidHex;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.strip_prefix("0x").ok_or(InvalidHex::MissingPrefix)?;
                let mut bytes = [0; $n];
                hex::decode_to_slice(s, &mut bytes)?;
                Ok(Self(bytes))
            }
        }

        impl Display for $t {
            fn fmt(&self, f: &mut Formatter) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl Debug for $t {
            fn fmt(&self, f: &mut Formatter) -> fmt::Result {
                Display::fmt(self, f)
            }
        }

        impl Serialize for $t {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $t {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                Str::<Self>::deserialize(deserializer).map(|s| s.0)
            }
        }
    };
}

impl_fixed_bytes! {
    /// A compressed BLS12-381 validator public key.
    pub struct PublicKey([u8; 48]);
}

impl_fixed_bytes! {
    /// A 32-byte hash, used for signing roots and genesis validators roots.
    pub struct Root([u8; 32]);
}

/// An error parsing a `0x`-prefixed hex string.
#[derive(Debug, Error)]
pub enum InvalidHex {
    #[error("hex string missing '0x' prefix")]
    MissingPrefix,
    #[error(transparent)]
    Decode(#[from] hex::FromHexError),
}
