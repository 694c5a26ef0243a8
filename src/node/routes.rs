//! HTTP routes of the signing node.

use super::{
    eth2::SignRequest,
    health::{Health, HealthStatus},
    Node, SignError,
};
use crate::{
    metrics::MetricsSnapshot,
    serialization,
    signer::KeyKind,
    slashing::{ExportOptions, Format, ImportReport, Interchange},
    types::PublicKey,
};
use rocket::{
    http::Status,
    request::Request,
    response::{self, status::Custom, Responder},
    serde::{json::Json, Deserialize},
    tokio::task,
    Route, State,
};

pub fn routes() -> Vec<Route> {
    rocket::routes![
        upcheck,
        healthcheck,
        eth2_public_keys,
        eth1_public_keys,
        eth2_sign,
        eth1_sign,
        import,
        export,
        metrics,
    ]
}

impl<'r> Responder<'r, 'static> for SignError {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        if status.code >= 500 {
            tracing::error!(err = ?self, "request failed");
        } else {
            tracing::debug!(err = %self, %status, "request rejected");
        }
        Custom(status, self.to_string()).respond_to(request)
    }
}

#[rocket::get("/upcheck")]
fn upcheck() -> &'static str {
    "OK"
}

#[rocket::get("/healthcheck")]
async fn healthcheck(node: &State<Node>) -> Custom<Json<Health>> {
    let health = node.health().await;
    let status = match health.status {
        HealthStatus::Up => Status::Ok,
        HealthStatus::Down => Status::ServiceUnavailable,
    };
    Custom(status, Json(health))
}

#[rocket::get("/api/v1/eth2/publicKeys")]
fn eth2_public_keys(node: &State<Node>) -> Json<Vec<String>> {
    Json(node.public_keys(KeyKind::Bls))
}

#[rocket::get("/api/v1/eth1/publicKeys")]
fn eth1_public_keys(node: &State<Node>) -> Json<Vec<String>> {
    Json(node.public_keys(KeyKind::Secp256k1))
}

#[rocket::post("/api/v1/eth2/sign/<identifier>", data = "<request>")]
async fn eth2_sign(
    node: &State<Node>,
    identifier: &str,
    request: Json<SignRequest>,
) -> Result<String, SignError> {
    let signature = node.sign_eth2(identifier, request.into_inner()).await?;
    Ok(signature.into())
}

#[derive(Debug, Deserialize)]
#[serde(crate = "rocket::serde")]
struct Eth1SignRequest {
    #[serde(with = "serialization::bytes")]
    data: Vec<u8>,
}

#[rocket::post("/api/v1/eth1/sign/<identifier>", data = "<request>")]
async fn eth1_sign(
    node: &State<Node>,
    identifier: &str,
    request: Json<Eth1SignRequest>,
) -> Result<String, SignError> {
    let signature = node.sign_eth1(identifier, request.into_inner().data).await?;
    Ok(signature.into())
}

#[rocket::post("/slashing-protection/import", data = "<interchange>")]
async fn import(node: &State<Node>, interchange: String) -> Result<Json<ImportReport>, SignError> {
    let protection = node.protection()?;
    let report =
        task::spawn_blocking(move || protection.import_from(interchange.as_bytes())).await??;
    Ok(Json(report))
}

#[rocket::get("/slashing-protection/export?<format>&<pubkeys>")]
async fn export(
    node: &State<Node>,
    format: Option<&str>,
    pubkeys: Option<&str>,
) -> Result<Json<Interchange>, SignError> {
    let protection = node.protection()?;
    let format = match format {
        None | Some("complete") => Format::Complete,
        Some("minimal") => Format::Minimal,
        Some(_) => return Err(SignError::InvalidRequest("unknown interchange format")),
    };
    let public_keys = pubkeys
        .map(|pubkeys| {
            pubkeys
                .split(',')
                .map(|pubkey| pubkey.trim().parse::<PublicKey>())
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()
        .map_err(|_| SignError::InvalidRequest("invalid public key"))?;

    let options = ExportOptions {
        format,
        public_keys,
    };
    let interchange = task::spawn_blocking(move || protection.export(&options)).await??;
    Ok(Json(interchange))
}

#[rocket::get("/metrics")]
fn metrics(node: &State<Node>) -> Json<MetricsSnapshot> {
    Json(node.metrics())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        signer::{bls::BlsSigner, registry::SignerRegistry, BoxSigner, KeyProvider},
        slashing::{SlashingProtection, SlashingProtectionConfig},
        types::Root,
    };
    use rocket::{
        http::ContentType,
        local::blocking::Client,
        serde::json::{serde_json, serde_json::json},
    };
    use std::sync::Arc;

    struct Keys;

    impl KeyProvider for Keys {
        fn name(&self) -> &str {
            "test"
        }

        fn load(&mut self) -> anyhow::Result<Vec<BoxSigner>> {
            Ok(vec![Box::new(BlsSigner::from_bytes(&[0x11; 32])?)])
        }
    }

    fn client(dir: &tempfile::TempDir) -> Client {
        let signers = SignerRegistry::default();
        signers.add_provider(Box::new(Keys)).unwrap();
        let protection = SlashingProtection::open(&SlashingProtectionConfig {
            db_path: dir.path().join("slashing.sqlite"),
            ..Default::default()
        })
        .unwrap();
        let node = Node::new(signers, Some(Arc::new(protection)), None);
        Client::tracked(rocket::build().manage(node).mount("/", routes())).unwrap()
    }

    fn attestation(source: u64, target: u64, root: u8) -> String {
        json!({
            "type": "ATTESTATION",
            "signing_root": Root([root; 32]),
            "fork_info": { "genesis_validators_root": Root([4; 32]) },
            "attestation": {
                "source": { "epoch": source.to_string() },
                "target": { "epoch": target.to_string() },
            },
        })
        .to_string()
    }

    #[test]
    fn upcheck_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(&dir);

        let response = client.get("/upcheck").dispatch();
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(response.into_string().unwrap(), "OK");

        let keys = client
            .get("/api/v1/eth2/publicKeys")
            .dispatch()
            .into_json::<Vec<String>>()
            .unwrap();
        assert_eq!(keys.len(), 1);
        let eth1 = client
            .get("/api/v1/eth1/publicKeys")
            .dispatch()
            .into_json::<Vec<String>>()
            .unwrap();
        assert!(eth1.is_empty());

        let response = client.get("/healthcheck").dispatch();
        assert_eq!(response.status(), Status::Ok);
        let health = response.into_json::<serde_json::Value>().unwrap();
        assert_eq!(health["status"], json!("UP"));
        assert_eq!(
            health["checks"][1]["checks"][0],
            json!({
                "id": "test",
                "status": "UP",
                "data": { "keys-loaded": 1, "error-count": 0 },
            })
        );
        assert_eq!(health["checks"][2]["status"], json!("UP"));
    }

    #[test]
    fn signs_and_refuses_attestations() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(&dir);
        let keys = client
            .get("/api/v1/eth2/publicKeys")
            .dispatch()
            .into_json::<Vec<String>>()
            .unwrap();
        let uri = format!("/api/v1/eth2/sign/{}", keys[0]);
        let uri = uri.as_str();

        let response = client
            .post(uri)
            .header(ContentType::JSON)
            .body(attestation(1, 5, 0x11))
            .dispatch();
        assert_eq!(response.status(), Status::Ok);
        assert!(response.into_string().unwrap().starts_with("0x"));

        let response = client
            .post(uri)
            .header(ContentType::JSON)
            .body(attestation(2, 4, 0x22))
            .dispatch();
        assert_eq!(response.status(), Status::PreconditionFailed);

        let response = client
            .post("/api/v1/eth2/sign/0x1234")
            .header(ContentType::JSON)
            .body(attestation(6, 7, 0x33))
            .dispatch();
        assert_eq!(response.status(), Status::NotFound);

        let metrics = client
            .get("/metrics")
            .dispatch()
            .into_json::<serde_json::Value>()
            .unwrap();
        assert_eq!(metrics["signed_attestations"], json!(1));
        assert_eq!(metrics["slashing_refusals"], json!(1));
    }

    #[test]
    fn import_and_export() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(&dir);
        let pubkey = format!("0x{}", "b8".repeat(48));

        let response = client
            .post("/slashing-protection/import")
            .header(ContentType::JSON)
            .body(
                json!({
                    "metadata": {
                        "interchange_format_version": "5",
                        "genesis_validators_root": Root([4; 32]),
                    },
                    "data": [{
                        "pubkey": pubkey,
                        "signed_blocks": [{ "slot": "10" }, { "slot": "12" }],
                        "signed_attestations": [],
                    }],
                })
                .to_string(),
            )
            .dispatch();
        assert_eq!(response.status(), Status::Ok);
        let report = response.into_json::<serde_json::Value>().unwrap();
        assert_eq!(report["accepted"], json!(2));
        assert_eq!(report["rejected"], json!(0));

        let exported = client
            .get(format!("/slashing-protection/export?format=minimal&pubkeys={pubkey}").as_str())
            .dispatch()
            .into_json::<serde_json::Value>()
            .unwrap();
        assert_eq!(
            exported["data"],
            json!([{
                "pubkey": pubkey,
                "signed_blocks": [{ "slot": "12" }],
                "signed_attestations": [],
            }])
        );

        let response = client
            .get("/slashing-protection/export?format=partial")
            .dispatch();
        assert_eq!(response.status(), Status::BadRequest);

        let response = client
            .post("/slashing-protection/import")
            .header(ContentType::JSON)
            .body(r#"{"metadata": {"interchange_format_version": "4"}}"#)
            .dispatch();
        assert_eq!(response.status(), Status::BadRequest);
    }
}
