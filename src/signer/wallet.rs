//! Execution layer accounts derived from a mnemonic.

use super::{normalize_identifier, BoxSigner, KeyKind, KeyProvider, Signature, Signing};
use anyhow::{Context as _, Result};
use hdwallet::{account::PrivateKey, hdk, message::EthereumMessage, mnemonic::Mnemonic};

/// HD wallet accounts that can perform Ethereum ECDSA operations.
pub struct MnemonicAccounts {
    private_keys: Vec<PrivateKey>,
}

impl MnemonicAccounts {
    /// Derives private keys for the specified number of accounts from a
    /// mnemonic.
    pub fn new(mnemonic: &Mnemonic, password: &str, count: usize) -> Result<Self> {
        let seed = mnemonic.seed(password);
        let private_keys = (0..count)
            .map(|i| hdk::derive_index(&seed, i))
            .collect::<Result<Vec<_>, _>>()
            .context("key derivation error")?;

        Ok(Self { private_keys })
    }
}

impl KeyProvider for MnemonicAccounts {
    fn name(&self) -> &str {
        "mnemonic"
    }

    fn load(&mut self) -> Result<Vec<BoxSigner>> {
        Ok(self
            .private_keys
            .drain(..)
            .map(|private_key| Box::new(Account::new(private_key)) as BoxSigner)
            .collect())
    }
}

/// A single account signing EIP-191 personal messages.
pub struct Account {
    private_key: PrivateKey,
    identifier: String,
}

impl Account {
    fn new(private_key: PrivateKey) -> Self {
        let identifier = normalize_identifier(&private_key.address().to_string());
        Self {
            private_key,
            identifier,
        }
    }
}

impl Signing for Account {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn kind(&self) -> KeyKind {
        KeyKind::Secp256k1
    }

    fn sign(&self, message: &[u8]) -> Result<Signature> {
        let message = EthereumMessage(message);
        let signature = self.private_key.sign(message.signing_message());
        Ok(Signature(signature.to_string()))
    }
}
