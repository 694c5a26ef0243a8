//! A signer that just logs all signing operations.

use super::{KeyKind, Signature, Signing};
use anyhow::Result;

/// Wrapping signer that logs all signing operations to the global logger.
pub struct LogRecorder<S>(pub S);

impl<S> Signing for LogRecorder<S>
where
    S: Signing,
{
    fn identifier(&self) -> &str {
        self.0.identifier()
    }

    fn kind(&self) -> KeyKind {
        self.0.kind()
    }

    fn sign(&self, message: &[u8]) -> Result<Signature> {
        let signature = self.0.sign(message)?;
        let identifier = self.identifier();
        let message = format!("0x{}", hex::encode(message));
        tracing::info!(%identifier, kind = ?self.kind(), %message, %signature, "signed message");
        Ok(signature)
    }
}
