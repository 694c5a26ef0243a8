//! The set of loaded signers and the providers they came from.

use super::{
    log_recorder::LogRecorder, normalize_identifier, BoxKeyProvider, KeyKind, Signing,
};
use anyhow::{Context as _, Result};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeMap, HashMap},
    mem,
    sync::Arc,
};

/// A shared signer.
pub type SharedSigner = Arc<dyn Signing + Send + Sync + 'static>;

/// Keys a provider contributed, and those it returned that were skipped.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProviderKeys {
    pub name: String,
    pub loaded: usize,
    pub skipped: usize,
}

struct LoadedProvider {
    provider: BoxKeyProvider,
    loaded: usize,
    skipped: usize,
}

/// Owns key providers and the signers they loaded.
#[derive(Default)]
pub struct SignerRegistry {
    providers: Mutex<BTreeMap<String, LoadedProvider>>,
    signers: RwLock<HashMap<String, SharedSigner>>,
}

impl SignerRegistry {
    /// Loads all keys of a provider and takes ownership of it. Returns the
    /// number of new signers.
    pub fn add_provider(&self, mut provider: BoxKeyProvider) -> Result<usize> {
        let name = provider.name().to_owned();
        let loaded = provider
            .load()
            .with_context(|| format!("failed to load keys from '{name}' provider"))?;

        let mut added = 0;
        let mut skipped = 0;
        {
            let mut signers = self.signers.write();
            for signer in loaded {
                let identifier = signer.identifier().to_owned();
                if signers.contains_key(&identifier) {
                    tracing::warn!(%identifier, provider = %name, "ignoring duplicate key");
                    skipped += 1;
                    continue;
                }
                signers.insert(identifier, Arc::new(LogRecorder(signer)));
                added += 1;
            }
        }

        tracing::info!(provider = %name, keys = added, skipped, "loaded keys");
        let loaded = LoadedProvider {
            provider,
            loaded: added,
            skipped,
        };
        if let Some(mut previous) = self.providers.lock().insert(name, loaded) {
            previous.provider.close();
        }
        Ok(added)
    }

    /// Finds a signer of the specified kind.
    pub fn get(&self, kind: KeyKind, identifier: &str) -> Option<SharedSigner> {
        self.signers
            .read()
            .get(&normalize_identifier(identifier))
            .filter(|signer| signer.kind() == kind)
            .cloned()
    }

    /// Returns the sorted identifiers of all signers of the specified kind.
    pub fn identifiers(&self, kind: KeyKind) -> Vec<String> {
        let mut identifiers = self
            .signers
            .read()
            .values()
            .filter(|signer| signer.kind() == kind)
            .map(|signer| signer.identifier().to_owned())
            .collect::<Vec<_>>();
        identifiers.sort();
        identifiers
    }

    /// Returns per-provider key counts, ordered by provider name.
    pub fn provider_keys(&self) -> Vec<ProviderKeys> {
        self.providers
            .lock()
            .iter()
            .map(|(name, loaded)| ProviderKeys {
                name: name.clone(),
                loaded: loaded.loaded,
                skipped: loaded.skipped,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.signers.read().len()
    }

    /// Closes every provider and forgets all signers.
    pub fn close(&self) {
        let providers = mem::take(&mut *self.providers.lock());
        for (name, mut loaded) in providers {
            loaded.provider.close();
            tracing::debug!(provider = %name, "closed key provider");
        }
        self.signers.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::{bls::BlsSigner, BoxSigner, KeyProvider};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Keys {
        seeds: Vec<u8>,
        closed: Arc<AtomicBool>,
    }

    impl KeyProvider for Keys {
        fn name(&self) -> &str {
            "test"
        }

        fn load(&mut self) -> Result<Vec<BoxSigner>> {
            self.seeds
                .iter()
                .map(|&seed| Ok(Box::new(BlsSigner::from_bytes(&[seed; 32])?) as BoxSigner))
                .collect()
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn registers_and_closes_providers() {
        let closed = Arc::new(AtomicBool::new(false));
        let registry = SignerRegistry::default();
        let added = registry
            .add_provider(Box::new(Keys {
                seeds: vec![0x11, 0x12, 0x11],
                closed: closed.clone(),
            }))
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.provider_keys(),
            [ProviderKeys {
                name: "test".to_owned(),
                loaded: 2,
                skipped: 1,
            }]
        );

        let identifiers = registry.identifiers(KeyKind::Bls);
        assert_eq!(identifiers.len(), 2);
        assert!(registry.identifiers(KeyKind::Secp256k1).is_empty());

        let upper = identifiers[0].to_ascii_uppercase().replacen("0X", "0x", 1);
        assert!(registry.get(KeyKind::Bls, &upper).is_some());
        assert!(registry.get(KeyKind::Secp256k1, &identifiers[0]).is_none());

        registry.close();
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(registry.len(), 0);
        assert!(registry.provider_keys().is_empty());
    }
}
