//! Health report of the signing node.

use rocket::serde::Serialize;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(crate = "rocket::serde", rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
}

impl HealthStatus {
    fn all(checks: &[HealthCheck]) -> Self {
        if checks.iter().all(|check| check.status == Self::Up) {
            Self::Up
        } else {
            Self::Down
        }
    }
}

/// Key counts reported by a key provider check.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(crate = "rocket::serde", rename_all = "kebab-case")]
pub struct KeysLoaded {
    pub keys_loaded: usize,
    pub error_count: usize,
}

/// A named check, possibly made of nested checks.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct HealthCheck {
    pub id: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<HealthCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<KeysLoaded>,
}

impl HealthCheck {
    pub fn new(id: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            id: id.into(),
            status,
            checks: Vec::new(),
            data: None,
        }
    }

    pub fn keys(id: impl Into<String>, data: KeysLoaded) -> Self {
        Self {
            data: Some(data),
            ..Self::new(id, HealthStatus::Up)
        }
    }

    /// A check that is up only if all of `checks` are.
    pub fn group(id: impl Into<String>, checks: Vec<HealthCheck>) -> Self {
        let status = HealthStatus::all(&checks);
        Self {
            checks,
            ..Self::new(id, status)
        }
    }
}

/// The overall health of the node.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct Health {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub outcome: HealthStatus,
}

impl Health {
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = HealthStatus::all(&checks);
        Self {
            status,
            checks,
            outcome: status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocket::serde::json::{serde_json, serde_json::json};

    #[test]
    fn serializes_nested_checks() {
        let health = Health::new(vec![
            HealthCheck::new("default-check", HealthStatus::Up),
            HealthCheck::group(
                "keys-check",
                vec![HealthCheck::keys(
                    "file-raw",
                    KeysLoaded {
                        keys_loaded: 4,
                        error_count: 0,
                    },
                )],
            ),
            HealthCheck::new("slashing-protection-db-health-check", HealthStatus::Down),
        ]);

        assert_eq!(health.status, HealthStatus::Down);
        assert_eq!(
            serde_json::to_value(&health).unwrap(),
            json!({
                "status": "DOWN",
                "checks": [
                    { "id": "default-check", "status": "UP" },
                    {
                        "id": "keys-check",
                        "status": "UP",
                        "checks": [{
                            "id": "file-raw",
                            "status": "UP",
                            "data": { "keys-loaded": 4, "error-count": 0 },
                        }],
                    },
                    { "id": "slashing-protection-db-health-check", "status": "DOWN" },
                ],
                "outcome": "DOWN",
            })
        );
    }
}
