#![forbid(unsafe_code)]

//! Encrypted at-rest store for render-provider bearer tokens.
//!
//! One JSON file holds a sealed blob per credential slot (`producer:<id>` or `platform`).
//! Each blob is `nonce || ciphertext`, and the slot id is bound in as associated data, so a
//! blob copied into another slot fails to open.

use std::collections::BTreeMap;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use avatart_kernel_contracts::clone_grant::ProducerId;
use avatart_kernel_contracts::render_provider::{
    CredentialId, CredentialSource, ProviderCredential,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const VAULT_FORMAT: u8 = 2;
const MASTER_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("credential slot {0} is not a producer or platform slot")]
    UnknownSlot(String),
    #[error("credential token must be non-empty")]
    EmptyToken,
    #[error("vault file uses unsupported format {found}")]
    Format { found: u8 },
    #[error("vault master key is malformed")]
    MasterKey,
    #[error("credential {0} could not be sealed or opened")]
    Seal(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("decode error: {0}")]
    Decode(#[from] base64::DecodeError),
}

#[derive(Debug, Serialize, Deserialize)]
struct VaultFile {
    format: u8,
    slots: BTreeMap<String, SealedSlot>,
}

impl Default for VaultFile {
    fn default() -> Self {
        Self {
            format: VAULT_FORMAT,
            slots: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SealedSlot {
    sealed_b64: String,
    stored_at_unix_ms: u64,
}

/// AES-256-GCM key loaded from the key file.
struct MasterKey(Aes256Gcm);

impl MasterKey {
    fn seal(&self, slot: &CredentialId, token: &str) -> Result<Vec<u8>, VaultError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let payload = Payload {
            msg: token.as_bytes(),
            aad: slot.as_str().as_bytes(),
        };
        let ciphertext = self
            .0
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| VaultError::Seal(slot.to_string()))?;
        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, slot: &CredentialId, sealed: &[u8]) -> Result<String, VaultError> {
        if sealed.len() <= NONCE_LEN {
            return Err(VaultError::Seal(slot.to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let payload = Payload {
            msg: ciphertext,
            aad: slot.as_str().as_bytes(),
        };
        let plaintext = self
            .0
            .decrypt(Nonce::from_slice(nonce), payload)
            .map_err(|_| VaultError::Seal(slot.to_string()))?;
        String::from_utf8(plaintext).map_err(|_| VaultError::Seal(slot.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct CredentialVault {
    vault_path: PathBuf,
    key_path: PathBuf,
}

impl CredentialVault {
    /// `AVATART_VAULT_PATH`, or `avatart/render_credentials.json` under the user config dir.
    pub fn from_env() -> Self {
        let vault_path = env::var("AVATART_VAULT_PATH")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(default_vault_path);
        let key_path = vault_path.with_extension("master.key");
        Self::for_paths(vault_path, key_path)
    }

    pub fn for_paths(vault_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            vault_path,
            key_path,
        }
    }

    pub fn store_producer_token(
        &self,
        producer_id: &ProducerId,
        token: &str,
    ) -> Result<(), VaultError> {
        let slot = CredentialId::for_producer(producer_id)
            .map_err(|_| VaultError::UnknownSlot(producer_id.to_string()))?;
        self.store(&slot, token)
    }

    pub fn store_platform_token(&self, token: &str) -> Result<(), VaultError> {
        self.store(&CredentialId::platform(), token)
    }

    pub fn store(&self, slot: &CredentialId, token: &str) -> Result<(), VaultError> {
        if slot.owner().is_none() {
            return Err(VaultError::UnknownSlot(slot.to_string()));
        }
        let token = token.trim();
        if token.is_empty() {
            return Err(VaultError::EmptyToken);
        }
        let sealed = self.master_key(true)?.seal(slot, token)?;
        let mut file = self.load()?.unwrap_or_default();
        file.slots.insert(
            slot.to_string(),
            SealedSlot {
                sealed_b64: BASE64.encode(sealed),
                stored_at_unix_ms: now_unix_ms(),
            },
        );
        self.save(&file)?;
        debug!(credential_id = %slot, "render credential stored");
        Ok(())
    }

    /// `Ok(None)` when the slot was never written.
    pub fn open(&self, slot: &CredentialId) -> Result<Option<ProviderCredential>, VaultError> {
        let Some(owner) = slot.owner() else {
            return Err(VaultError::UnknownSlot(slot.to_string()));
        };
        let Some(entry) = self.load()?.and_then(|mut f| f.slots.remove(slot.as_str())) else {
            return Ok(None);
        };
        let sealed = BASE64.decode(entry.sealed_b64.as_bytes())?;
        let token = self.master_key(false)?.open(slot, &sealed)?;
        ProviderCredential::v1(slot.clone(), owner, token)
            .map(Some)
            .map_err(|_| VaultError::Seal(slot.to_string()))
    }

    fn lookup(&self, slot: &CredentialId) -> Option<ProviderCredential> {
        match self.open(slot) {
            Ok(found) => found,
            Err(err) => {
                warn!(credential_id = %slot, error = %err, "credential vault lookup failed");
                None
            }
        }
    }

    fn load(&self) -> Result<Option<VaultFile>, VaultError> {
        let raw = match fs::read(&self.vault_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let file: VaultFile = serde_json::from_slice(&raw)?;
        if file.format != VAULT_FORMAT {
            return Err(VaultError::Format { found: file.format });
        }
        Ok(Some(file))
    }

    fn save(&self, file: &VaultFile) -> Result<(), VaultError> {
        if let Some(dir) = self.vault_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let staged = self.vault_path.with_extension("staged");
        let mut out = File::create(&staged)?;
        out.write_all(&serde_json::to_vec_pretty(file)?)?;
        out.sync_all()?;
        fs::rename(staged, &self.vault_path)?;
        Ok(())
    }

    /// Reads the key file; with `create`, a missing key file is generated with mode 0o600.
    fn master_key(&self, create: bool) -> Result<MasterKey, VaultError> {
        let bytes = match fs::read_to_string(&self.key_path) {
            Ok(encoded) => BASE64.decode(encoded.trim().as_bytes())?,
            Err(err) if create && err.kind() == std::io::ErrorKind::NotFound => {
                generate_key_file(&self.key_path)?
            }
            Err(err) => return Err(err.into()),
        };
        if bytes.len() != MASTER_KEY_LEN {
            return Err(VaultError::MasterKey);
        }
        Aes256Gcm::new_from_slice(&bytes)
            .map(MasterKey)
            .map_err(|_| VaultError::MasterKey)
    }
}

/// Producer-owned credential first, platform credential as fallback.
impl CredentialSource for CredentialVault {
    fn candidates_for(&self, producer_id: &ProducerId) -> Vec<ProviderCredential> {
        let own = CredentialId::for_producer(producer_id)
            .ok()
            .and_then(|slot| self.lookup(&slot));
        own.into_iter()
            .chain(self.lookup(&CredentialId::platform()))
            .collect()
    }

    fn credential(&self, credential_id: &CredentialId) -> Option<ProviderCredential> {
        self.lookup(credential_id)
    }
}

fn generate_key_file(path: &Path) -> Result<Vec<u8>, VaultError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut key = vec![0u8; MASTER_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    let mut file = OpenOptions::new().create_new(true).write(true).open(path)?;
    file.write_all(BASE64.encode(&key).as_bytes())?;
    file.sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(key)
}

fn default_vault_path() -> PathBuf {
    let config_dir = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| env::var("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|_| PathBuf::from("."));
    config_dir.join("avatart").join("render_credentials.json")
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
