//! An abstraction around signers.
//!
//! Signers hold key material loaded by a [`KeyProvider`] and expose nothing
//! but an identifier and a signing operation, which allows us to compose
//! different operations around them, such as recording every signature to the
//! logs.

pub mod bls;
pub mod log_recorder;
pub mod registry;
pub mod wallet;

use anyhow::Result;
use rocket::serde::Serialize;
use std::fmt::{self, Display, Formatter};

/// The type of key a signer holds.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum KeyKind {
    /// A BLS12-381 consensus layer validator key.
    Bls,
    /// A secp256k1 execution layer account key.
    Secp256k1,
}

/// A trait abstracting signing keys.
pub trait Signing {
    /// Returns the `0x`-prefixed lower case hex identifier of the key: the
    /// public key for BLS keys and the address for account keys.
    fn identifier(&self) -> &str;

    /// Returns the type of key.
    fn kind(&self) -> KeyKind;

    /// Signs a message.
    fn sign(&self, message: &[u8]) -> Result<Signature>;
}

impl<S> Signing for Box<S>
where
    S: Signing + ?Sized,
{
    fn identifier(&self) -> &str {
        (**self).identifier()
    }

    fn kind(&self) -> KeyKind {
        (**self).kind()
    }

    fn sign(&self, message: &[u8]) -> Result<Signature> {
        (**self).sign(message)
    }
}

/// A boxed signer that is safe to send between threads.
pub type BoxSigner = Box<dyn Signing + Send + Sync + 'static>;

/// A source of signing keys.
///
/// Providers are asked for their keys once at start-up and closed when the
/// server shuts down.
pub trait KeyProvider {
    /// A name identifying the provider.
    fn name(&self) -> &str;

    /// Loads all keys made available by the provider.
    fn load(&mut self) -> Result<Vec<BoxSigner>>;

    /// Releases any resources held by the provider.
    fn close(&mut self) {}
}

/// A boxed key provider that is safe to send between threads.
pub type BoxKeyProvider = Box<dyn KeyProvider + Send + 'static>;

/// A signature in its `0x`-prefixed hex encoding.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(crate = "rocket::serde", transparent)]
pub struct Signature(String);

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Signature> for String {
    fn from(signature: Signature) -> Self {
        signature.0
    }
}

/// Normalizes a hex key identifier for lookups.
pub fn normalize_identifier(identifier: &str) -> String {
    let identifier = identifier.to_ascii_lowercase();
    if identifier.starts_with("0x") {
        identifier
    } else {
        format!("0x{identifier}")
    }
}
