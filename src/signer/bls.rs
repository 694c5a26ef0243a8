//! BLS12-381 validator keys read from raw key files.

use super::{normalize_identifier, BoxSigner, KeyKind, KeyProvider, Signature, Signing};
use crate::types::PublicKey;
use anyhow::{anyhow, Context as _, Result};
use blst::min_pk::SecretKey;
use std::{fs, path::PathBuf};

/// Domain separation tag of the Ethereum proof-of-possession BLS ciphersuite.
const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// A validator signing key.
pub struct BlsSigner {
    secret_key: SecretKey,
    public_key: PublicKey,
    identifier: String,
}

impl BlsSigner {
    /// Creates a signer from a 32-byte big-endian secret key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let secret_key = SecretKey::from_bytes(bytes)
            .map_err(|err| anyhow!("invalid BLS secret key: {err:?}"))?;
        let public_key = PublicKey(secret_key.sk_to_pk().to_bytes());
        Ok(Self {
            secret_key,
            public_key,
            identifier: public_key.to_string(),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }
}

impl Signing for BlsSigner {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn kind(&self) -> KeyKind {
        KeyKind::Bls
    }

    fn sign(&self, message: &[u8]) -> Result<Signature> {
        let signature = self.secret_key.sign(message, DST, &[]);
        Ok(Signature::from_bytes(&signature.to_bytes()))
    }
}

/// Loads unencrypted BLS secret keys, one hex encoded key per file.
pub struct RawKeyFiles {
    paths: Vec<PathBuf>,
}

impl RawKeyFiles {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

impl KeyProvider for RawKeyFiles {
    fn name(&self) -> &str {
        "file-raw"
    }

    fn load(&mut self) -> Result<Vec<BoxSigner>> {
        self.paths
            .iter()
            .map(|path| {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("failed to read key file {}", path.display()))?;
                let hex = contents.trim();
                let bytes = hex::decode(hex.strip_prefix("0x").unwrap_or(hex))
                    .with_context(|| format!("invalid hex in key file {}", path.display()))?;
                let signer = BlsSigner::from_bytes(&bytes)
                    .with_context(|| format!("invalid key in key file {}", path.display()))?;
                tracing::debug!(
                    public_key = %signer.public_key(),
                    path = %path.display(),
                    "loaded BLS key"
                );
                Ok(Box::new(signer) as BoxSigner)
            })
            .collect()
    }
}

/// Parses the public key of a BLS signer identifier.
pub fn public_key(identifier: &str) -> Option<PublicKey> {
    normalize_identifier(identifier).parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use blst::{min_pk, BLST_ERROR};

    #[test]
    fn signs_with_pop_ciphersuite() {
        let signer = BlsSigner::from_bytes(&[0x11; 32]).unwrap();
        let message = [0x42; 32];

        let signature = signer.sign(&message).unwrap();
        let bytes = hex::decode(&signature.to_string()[2..]).unwrap();
        assert_eq!(bytes.len(), 96);

        let signature = min_pk::Signature::from_bytes(&bytes).unwrap();
        let public_key = min_pk::PublicKey::from_bytes(&signer.public_key().0).unwrap();
        assert_eq!(
            signature.verify(true, &message, DST, &[], &public_key, true),
            BLST_ERROR::BLST_SUCCESS
        );
    }

    #[test]
    fn rejects_invalid_keys() {
        assert!(BlsSigner::from_bytes(&[0; 32]).is_err());
        assert!(BlsSigner::from_bytes(&[0x11; 31]).is_err());
    }

    #[test]
    fn loads_key_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("validator.key");
        fs::write(&path, format!("0x{}\n", "11".repeat(32))).unwrap();

        let mut provider = RawKeyFiles::new(vec![path]);
        let signers = provider.load().unwrap();
        assert_eq!(signers.len(), 1);
        assert_eq!(signers[0].kind(), KeyKind::Bls);
        assert_eq!(
            public_key(signers[0].identifier()),
            Some(BlsSigner::from_bytes(&[0x11; 32]).unwrap().public_key())
        );

        let mut missing = RawKeyFiles::new(vec![dir.path().join("missing.key")]);
        assert!(missing.load().is_err());
    }
}
