//! Secret managers
//!
//! Provider API keys come from one of three places: environment variables
//! (`SIDE_<NAME>`), the OS keyring (service `sidekick`), or a mock used in
//! tests. The JSON form is a discriminated union so a secret-manager choice
//! can ride inside serialized configuration.

use serde::{Deserialize, Serialize};

pub const KEYRING_SERVICE: &str = "sidekick";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretManagerKind {
    Env,
    Mock,
    Keyring,
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret {0} not found in environment")]
    NotInEnv(String),

    #[error("error retrieving {name} from keyring: {source}")]
    Keyring {
        name: String,
        #[source]
        source: keyring::Error,
    },
}

/// A source of named secrets.
///
/// Serializes as `{"Type": ..., "Manager": ...}` so configuration can carry
/// any variant and reconstruct the right one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Type", content = "Manager")]
pub enum SecretManager {
    #[serde(rename = "env")]
    Env,
    #[serde(rename = "mock")]
    Mock,
    #[serde(rename = "keyring")]
    Keyring,
}

impl SecretManager {
    pub fn kind(&self) -> SecretManagerKind {
        match self {
            Self::Env => SecretManagerKind::Env,
            Self::Mock => SecretManagerKind::Mock,
            Self::Keyring => SecretManagerKind::Keyring,
        }
    }

    pub fn get_secret(&self, name: &str) -> Result<String, SecretError> {
        match self {
            Self::Env => {
                let var = format!("SIDE_{name}");
                match std::env::var(&var) {
                    Ok(value) if !value.is_empty() => Ok(value),
                    _ => Err(SecretError::NotInEnv(var)),
                }
            }
            Self::Mock => Ok("fake secret".to_string()),
            Self::Keyring => {
                let entry = keyring::Entry::new(KEYRING_SERVICE, name).map_err(|source| {
                    SecretError::Keyring {
                        name: name.to_string(),
                        source,
                    }
                })?;
                entry.get_password().map_err(|source| SecretError::Keyring {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }

    /// Store a secret. Only meaningful for the keyring variant; the env and
    /// mock variants are read-only.
    pub fn set_secret(&self, name: &str, value: &str) -> Result<(), SecretError> {
        if let Self::Keyring = self {
            let entry =
                keyring::Entry::new(KEYRING_SERVICE, name).map_err(|source| SecretError::Keyring {
                    name: name.to_string(),
                    source,
                })?;
            entry
                .set_password(value)
                .map_err(|source| SecretError::Keyring {
                    name: name.to_string(),
                    source,
                })?;
        }
        Ok(())
    }
}
