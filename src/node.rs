//! Module implementing the remote signing node.

pub mod eth2;
pub mod health;
pub mod routes;

use self::{
    eth2::{SignRequest, Slashable},
    health::{Health, HealthCheck, HealthStatus, KeysLoaded},
};
use crate::{
    metrics::{MetricsSnapshot, Signed, SigningMetrics},
    signer::{bls, registry::SignerRegistry, KeyKind, Signature},
    slashing::{self, Decision, PruningSchedule, SlashingProtection, Violation},
    types::Root,
};
use rocket::{
    http::Status,
    tokio::{task, time},
};
use std::sync::Arc;
use thiserror::Error;

/// Everything the background pruner runs with.
pub type Pruner = (Arc<SlashingProtection>, Arc<SigningMetrics>, PruningSchedule);

/// Remote signing node.
pub struct Node {
    signers: SignerRegistry,
    protection: Option<Arc<SlashingProtection>>,
    pruning: Option<PruningSchedule>,
    metrics: Arc<SigningMetrics>,
}

impl Node {
    pub fn new(
        signers: SignerRegistry,
        protection: Option<Arc<SlashingProtection>>,
        pruning: Option<PruningSchedule>,
    ) -> Self {
        let metrics = Arc::new(SigningMetrics::default());
        metrics.set_loaded_signers(signers.len());
        Self {
            signers,
            protection,
            pruning,
            metrics,
        }
    }

    /// Returns the identifiers of all keys of a kind.
    pub fn public_keys(&self, kind: KeyKind) -> Vec<String> {
        self.signers.identifiers(kind)
    }

    /// Signs a consensus layer message, checking block and attestation
    /// requests against slashing protection first.
    ///
    /// The slashing protection record commits before the signature is
    /// produced, so a failure after that point is safe to retry.
    pub async fn sign_eth2(
        &self,
        identifier: &str,
        request: SignRequest,
    ) -> Result<Signature, SignError> {
        let signer = self
            .signers
            .get(KeyKind::Bls, identifier)
            .ok_or_else(|| SignError::UnknownKey(identifier.to_owned()))?;
        let slashable = request.slashable().map_err(SignError::InvalidRequest)?;

        if let Some(protection) = &self.protection {
            let public_key = bls::public_key(signer.identifier())
                .ok_or_else(|| SignError::UnknownKey(identifier.to_owned()))?;
            let signing_root = request.signing_root;
            let protection = protection.clone();
            let decision = task::spawn_blocking(move || match slashable {
                Slashable::Block {
                    slot,
                    genesis_validators_root,
                } => protection
                    .may_sign_block(&public_key, signing_root, slot, &genesis_validators_root)
                    .map(Some),
                Slashable::Attestation {
                    source_epoch,
                    target_epoch,
                    genesis_validators_root,
                } => protection
                    .may_sign_attestation(
                        &public_key,
                        signing_root,
                        source_epoch,
                        target_epoch,
                        &genesis_validators_root,
                    )
                    .map(Some),
                Slashable::None => Ok(None),
            })
            .await??;

            if let Some(Decision::Deny(violation)) = decision {
                self.metrics.record_refusal();
                return Err(SignError::Slashing(violation));
            }
        }

        let message = request.signing_root;
        let signature = task::spawn_blocking(move || signer.sign(message.as_bytes()))
            .await?
            .map_err(SignError::Signing)?;

        self.metrics.record_signature(match slashable {
            Slashable::Block { .. } => Signed::Block,
            Slashable::Attestation { .. } => Signed::Attestation,
            Slashable::None => Signed::Other,
        });
        Ok(signature)
    }

    /// Signs arbitrary data as an EIP-191 personal message.
    pub async fn sign_eth1(&self, identifier: &str, data: Vec<u8>) -> Result<Signature, SignError> {
        let signer = self
            .signers
            .get(KeyKind::Secp256k1, identifier)
            .ok_or_else(|| SignError::UnknownKey(identifier.to_owned()))?;
        let signature = task::spawn_blocking(move || signer.sign(&data))
            .await?
            .map_err(SignError::Signing)?;
        self.metrics.record_signature(Signed::Other);
        Ok(signature)
    }

    /// Returns slashing protection, or an error if it is disabled.
    pub fn protection(&self) -> Result<Arc<SlashingProtection>, SignError> {
        self.protection
            .clone()
            .ok_or(SignError::InvalidRequest("slashing protection is disabled"))
    }

    /// Returns what the background pruner needs, if pruning is enabled.
    pub fn pruner(&self) -> Option<Pruner> {
        let protection = self.protection.clone()?;
        Some((protection, self.metrics.clone(), self.pruning?))
    }

    /// Reports the keys loaded by each provider and, when slashing
    /// protection is enabled, whether its database answers in time.
    pub async fn health(&self) -> Health {
        let keys = self
            .signers
            .provider_keys()
            .into_iter()
            .map(|provider| {
                HealthCheck::keys(
                    provider.name,
                    KeysLoaded {
                        keys_loaded: provider.loaded,
                        error_count: provider.skipped,
                    },
                )
            })
            .collect();

        let mut checks = vec![
            HealthCheck::new("default-check", HealthStatus::Up),
            HealthCheck::group("keys-check", keys),
        ];
        if let Some(protection) = &self.protection {
            let timeout = protection.health_check_timeout();
            let protection = protection.clone();
            let check = task::spawn_blocking(move || protection.check_health());
            let status = match time::timeout(timeout, check).await {
                Ok(Ok(Ok(()))) => HealthStatus::Up,
                Ok(Ok(Err(err))) => {
                    tracing::warn!(?err, "slashing protection database is unhealthy");
                    HealthStatus::Down
                }
                Ok(Err(err)) => {
                    tracing::error!(?err, "database health check task failed");
                    HealthStatus::Down
                }
                Err(_) => {
                    tracing::warn!(?timeout, "database health check timed out");
                    HealthStatus::Down
                }
            };
            checks.push(HealthCheck::new("slashing-protection-db-health-check", status));
        }
        Health::new(checks)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let registered = self
            .protection
            .as_ref()
            .map(|protection| protection.registered_validators())
            .unwrap_or_default();
        self.metrics.snapshot(registered)
    }

    /// Closes all key providers.
    pub fn close(&self) {
        self.signers.close();
        tracing::info!("closed signers");
    }
}

/// An error signing a request.
#[derive(Debug, Error)]
pub enum SignError {
    #[error("no key found for identifier {0}")]
    UnknownKey(String),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("signing refused by slashing protection: {}", .0.reason())]
    Slashing(Violation),
    #[error("genesis validators root {0} does not match slashing protection database")]
    GenesisRootMismatch(Root),
    #[error(transparent)]
    Protection(slashing::Error),
    #[error("signing failed: {0}")]
    Signing(anyhow::Error),
    #[error("signing task failed: {0}")]
    Task(#[from] task::JoinError),
}

impl SignError {
    pub fn status(&self) -> Status {
        match self {
            Self::UnknownKey(_) => Status::NotFound,
            Self::InvalidRequest(_) => Status::BadRequest,
            Self::Slashing(_) => Status::PreconditionFailed,
            Self::GenesisRootMismatch(_) => Status::Forbidden,
            Self::Protection(
                slashing::Error::Json(_)
                | slashing::Error::UnsupportedInterchangeVersion(_)
                | slashing::Error::ValueOutOfRange(_),
            ) => Status::BadRequest,
            Self::Protection(_) | Self::Signing(_) | Self::Task(_) => Status::InternalServerError,
        }
    }
}

impl From<slashing::Error> for SignError {
    fn from(err: slashing::Error) -> Self {
        match err {
            slashing::Error::GenesisRootMismatch(root) => Self::GenesisRootMismatch(root),
            err => Self::Protection(err),
        }
    }
}
