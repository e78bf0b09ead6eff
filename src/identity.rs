use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Computes the signature the Gateway verifies over the canonical connect payload.
/// A faithful asymmetric keypair lives outside this crate; only the interface it
/// calls through is implemented here.
pub trait DeviceIdentity: Send + Sync {
    fn device_id(&self) -> String;
    fn public_key(&self) -> String;
    fn sign(&self, canonical_payload: &[u8]) -> Result<String, IdentityError>;
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("failed to read or create device identity file at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("device identity file at {0} is not valid JSON")]
    Corrupt(PathBuf),
}

#[derive(Debug, Serialize, Deserialize)]
struct DeviceRecord {
    device_id: String,
    secret_key_b64: String,
}

/// A file-backed identity that keeps a `{deviceId, secretKey}` pair under
/// `OPENCLAW_STATE_DIR/device_identity.json`, generating one on first use. The
/// "public key" surfaced to the Gateway is a digest of the secret, not an asymmetric
/// keypair, so the crate runs standalone without an external signing collaborator.
pub struct FileDeviceIdentity {
    device_id: String,
    secret_key: Vec<u8>,
}

impl FileDeviceIdentity {
    pub fn load_or_create(state_dir: &Path) -> Result<Self, IdentityError> {
        let path = state_dir.join("device_identity.json");
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let record: DeviceRecord =
                    serde_json::from_str(&contents).map_err(|_| IdentityError::Corrupt(path.clone()))?;
                let secret_key = BASE64
                    .decode(record.secret_key_b64)
                    .map_err(|_| IdentityError::Corrupt(path.clone()))?;
                Ok(Self { device_id: record.device_id, secret_key })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let device_id = Uuid::new_v4().to_string();
                let secret_key: Vec<u8> = (0..32).map(|_| rand::random::<u8>()).collect();
                let record = DeviceRecord {
                    device_id: device_id.clone(),
                    secret_key_b64: BASE64.encode(&secret_key),
                };
                fs::create_dir_all(state_dir).map_err(|source| IdentityError::Io { path: path.clone(), source })?;
                let serialized = serde_json::to_string_pretty(&record).expect("DeviceRecord always serializes");
                fs::write(&path, serialized).map_err(|source| IdentityError::Io { path: path.clone(), source })?;
                Ok(Self { device_id, secret_key })
            }
            Err(source) => Err(IdentityError::Io { path, source }),
        }
    }
}

impl DeviceIdentity for FileDeviceIdentity {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    fn public_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret_key);
        BASE64.encode(hasher.finalize())
    }

    fn sign(&self, canonical_payload: &[u8]) -> Result<String, IdentityError> {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret_key);
        hasher.update(canonical_payload);
        Ok(BASE64.encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_create_persists_the_same_identity_across_loads() {
        let dir = tempfile_dir();
        let first = FileDeviceIdentity::load_or_create(&dir).unwrap();
        let second = FileDeviceIdentity::load_or_create(&dir).unwrap();
        assert_eq!(first.device_id(), second.device_id());
        assert_eq!(first.public_key(), second.public_key());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn sign_is_deterministic_for_the_same_payload() {
        let dir = tempfile_dir();
        let identity = FileDeviceIdentity::load_or_create(&dir).unwrap();
        let a = identity.sign(b"payload").unwrap();
        let b = identity.sign(b"payload").unwrap();
        assert_eq!(a, b);
        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempfile_dir() -> PathBuf {
        std::env::temp_dir().join(format!("relay-identity-test-{}", Uuid::new_v4()))
    }
}
