mod metrics;
mod node;
mod serialization;
mod signer;
mod slashing;
mod types;

use crate::{
    node::Node,
    serialization::Str,
    signer::{
        bls::{self, RawKeyFiles},
        registry::SignerRegistry,
        wallet::MnemonicAccounts,
        KeyKind,
    },
    slashing::{pruner, SlashingProtection, SlashingProtectionConfig},
};
use anyhow::{Context as _, Result};
use hdwallet::mnemonic::Mnemonic;
use rocket::{fairing::AdHoc, serde::Deserialize};
use std::{path::PathBuf, sync::Arc};

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
struct Config {
    /// Files containing raw hex encoded BLS validator secret keys.
    #[serde(default)]
    key_files: Vec<PathBuf>,

    /// The BIP-0039 mnemonic phrase for seeding the HD wallet accounts.
    #[serde(default)]
    mnemonic: Option<Str<Mnemonic>>,

    /// The password to use with the mnemonic phrase for salting the seed used
    /// for the HD wallet.
    #[serde(default)]
    password: String,

    /// The number of accounts to derive from the mnemonic seed phrase.
    #[serde(default)]
    account_count: usize,

    #[serde(default)]
    slashing_protection: SlashingProtectionConfig,
}

#[rocket::main]
async fn main() -> Result<(), rocket::Error> {
    tracing_subscriber::fmt::init();

    rocket::build()
        .attach(AdHoc::config::<Config>())
        .attach(AdHoc::try_on_ignite("slashsigner::Node", |rocket| async {
            let Some(config) = rocket.state::<Config>() else {
                return Err(rocket);
            };
            match init(config) {
                Ok(node) => Ok(rocket.manage(node)),
                Err(err) => {
                    tracing::error!(?err, "failed to initialize node");
                    Err(rocket)
                }
            }
        }))
        .attach(AdHoc::on_liftoff("slashsigner::Pruner", |rocket| {
            Box::pin(async move {
                let Some((protection, metrics, schedule)) =
                    rocket.state::<Node>().and_then(Node::pruner)
                else {
                    return;
                };
                tracing::info!(?schedule, "starting slashing protection pruner");
                rocket::tokio::spawn(pruner::run(
                    protection,
                    metrics,
                    schedule,
                    rocket.shutdown(),
                ));
            })
        }))
        .attach(AdHoc::on_shutdown("slashsigner::Close", |rocket| {
            Box::pin(async move {
                if let Some(node) = rocket.state::<Node>() {
                    node.close();
                }
            })
        }))
        .mount("/", node::routes::routes())
        .launch()
        .await?;

    Ok(())
}

fn init(config: &Config) -> Result<Node> {
    let signers = SignerRegistry::default();
    if !config.key_files.is_empty() {
        signers.add_provider(Box::new(RawKeyFiles::new(config.key_files.clone())))?;
    }
    if let Some(mnemonic) = &config.mnemonic {
        let accounts = MnemonicAccounts::new(mnemonic, &config.password, config.account_count)?;
        signers.add_provider(Box::new(accounts))?;
    }

    let settings = &config.slashing_protection;
    let (protection, pruning) = if settings.enabled {
        let protection = SlashingProtection::open(settings).with_context(|| {
            format!(
                "failed to open slashing protection database {}",
                settings.db_path.display()
            )
        })?;
        let public_keys = signers
            .identifiers(KeyKind::Bls)
            .iter()
            .filter_map(|identifier| bls::public_key(identifier))
            .collect::<Vec<_>>();
        protection
            .register_validators(&public_keys)
            .context("failed to register validators")?;

        let pruning = if settings.pruning.enabled {
            Some(settings.pruning.schedule()?)
        } else {
            None
        };
        (Some(Arc::new(protection)), pruning)
    } else {
        tracing::warn!("slashing protection is disabled");
        (None, None)
    };

    Ok(Node::new(signers, protection, pruning))
}
