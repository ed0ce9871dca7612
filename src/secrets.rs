//! Encrypted secret store.
//!
//! Secrets (credentials, API keys) are kept out of the public config file in
//! a small encrypted blob keyed by a machine-derived key, so a copied config
//! directory is useless on another host. The cipher is an HMAC-SHA256
//! keystream with a random nonce and an integrity tag over the ciphertext;
//! tampering or a foreign machine key fails closed.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;

const KEY_SALT: &str = "stakepilot-secret-store-v1";
const NONCE_LEN: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct SecretFile {
    nonce: String,
    ciphertext: String,
    tag: String,
}

pub struct SecretStore {
    values: HashMap<String, String>,
}

impl SecretStore {
    /// Load and decrypt the store. `Ok(None)` when the file does not exist.
    pub fn open(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read secret store {}", path.display()))?;
        let file: SecretFile = serde_json::from_str(&raw).context("parse secret store")?;

        let nonce = BASE64.decode(&file.nonce).context("decode nonce")?;
        let ciphertext = BASE64.decode(&file.ciphertext).context("decode ciphertext")?;
        let tag = BASE64.decode(&file.tag).context("decode tag")?;

        let key = machine_key();
        if compute_tag(&key, &nonce, &ciphertext) != tag {
            bail!("secret store integrity check failed (wrong machine or corrupted file)");
        }

        let plaintext = apply_keystream(&key, &nonce, &ciphertext);
        let values: HashMap<String, String> =
            serde_json::from_slice(&plaintext).context("parse decrypted secrets")?;
        Ok(Some(Self { values }))
    }

    /// Encrypt `values` to `path`, creating parent directories as needed.
    pub fn write(path: &Path, values: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let plaintext = serde_json::to_vec(values)?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let key = machine_key();
        let ciphertext = apply_keystream(&key, &nonce, &plaintext);
        let tag = compute_tag(&key, &nonce, &ciphertext);

        let file = SecretFile {
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(&ciphertext),
            tag: BASE64.encode(tag),
        };
        std::fs::write(path, serde_json::to_vec_pretty(&file)?)
            .with_context(|| format!("write secret store {}", path.display()))?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Key derived from stable machine identity. Obfuscation against casual file
/// copying, not a defense against an attacker with shell access to the host.
fn machine_key() -> [u8; 32] {
    let hostname = std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown-user".to_string());

    let mut hasher = Sha256::new();
    hasher.update(KEY_SALT.as_bytes());
    hasher.update(hostname.as_bytes());
    hasher.update(b":");
    hasher.update(user.as_bytes());
    hasher.finalize().into()
}

fn apply_keystream(key: &[u8; 32], nonce: &[u8], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut counter: u64 = 0;
    while out.len() < data.len() {
        let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(nonce);
        mac.update(&counter.to_le_bytes());
        let block = mac.finalize().into_bytes();
        for byte in block {
            if out.len() >= data.len() {
                break;
            }
            out.push(data[out.len()] ^ byte);
        }
        counter += 1;
    }
    out
}

fn compute_tag(key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(b"tag");
    mac.update(nonce);
    mac.update(ciphertext);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secrets.enc");

        let mut values = HashMap::new();
        values.insert("bookmaker_password".to_string(), "hunter2".to_string());
        values.insert("vision_api_key".to_string(), "sk-test".to_string());
        SecretStore::write(&path, &values).unwrap();

        let store = SecretStore::open(&path).unwrap().expect("store exists");
        assert_eq!(store.get("bookmaker_password"), Some("hunter2"));
        assert_eq!(store.get("vision_api_key"), Some("sk-test"));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempdir().unwrap();
        assert!(SecretStore::open(&dir.path().join("nope.enc"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn tampering_fails_closed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secrets.enc");

        let mut values = HashMap::new();
        values.insert("pin".to_string(), "0000".to_string());
        SecretStore::write(&path, &values).unwrap();

        let mut file: SecretFile =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let mut bytes = BASE64.decode(&file.ciphertext).unwrap();
        if let Some(b) = bytes.first_mut() {
            *b ^= 0xFF;
        }
        file.ciphertext = BASE64.encode(&bytes);
        std::fs::write(&path, serde_json::to_vec(&file).unwrap()).unwrap();

        assert!(SecretStore::open(&path).is_err());
    }
}
