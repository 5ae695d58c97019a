//! Wise Authority trust: keys, certificates, signed privileged commands and
//! signed manifests.

pub mod keys;

pub use keys::{SigningKey, decode_public_key, fingerprint, verify_signature};

use crate::config::{TrustedKey, WiseAuthorityConfig};
use crate::error::AuthorityError;
use crate::schemas::timestamp;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use strum::{Display, EnumString};
use subtle::ConstantTimeEq;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum WaRole {
    Root,
    Authority,
    Observer,
}

/// Identifier derived from the key fingerprint: `wa-` and 16 hex digits.
pub fn wa_id_for(key: &SigningKey) -> String {
    format!("wa-{}", &key.fingerprint()[..16])
}

/// Public identity of a Wise Authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaCertificate {
    pub wa_id: String,
    pub name: String,
    pub role: WaRole,
    /// Base64 raw Ed25519 public key.
    pub public_key: String,
    /// Hex SHA-256 of the raw public key.
    pub fingerprint: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl WaCertificate {
    pub fn new(name: impl Into<String>, role: WaRole, key: &SigningKey, scopes: Vec<String>) -> Self {
        Self {
            wa_id: wa_id_for(key),
            name: name.into(),
            role,
            public_key: key.public_key_b64(),
            fingerprint: key.fingerprint(),
            scopes,
            active: true,
            created_at: Utc::now(),
        }
    }

    /// Allowlist entry for this authority. ROOT is unrestricted, an
    /// inactive certificate may use no scope at all.
    pub fn trusted_key(&self) -> TrustedKey {
        let scopes = if !self.active {
            Some(Vec::new())
        } else if self.role == WaRole::Root {
            None
        } else {
            Some(self.scopes.clone())
        };
        TrustedKey {
            wa_id: self.wa_id.clone(),
            public_key: self.public_key.clone(),
            scopes,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum CommandType {
    EmergencyShutdown,
    ReloadConfig,
}

impl CommandType {
    /// Scope a trusted key needs to issue this command.
    pub fn scope(self) -> &'static str {
        match self {
            Self::EmergencyShutdown => "emergency_shutdown",
            Self::ReloadConfig => "reload_config",
        }
    }
}

/// Wire format of a signed command from a Wise Authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivilegedCommand {
    pub command_id: String,
    pub command_type: CommandType,
    pub wa_id: String,
    pub wa_public_key: String,
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: String,
    pub target_agent_id: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub relay_chain: Vec<String>,
}

/// Fields covered by the signature, serialised in declaration order.
#[derive(Serialize)]
struct SignablePayload<'a> {
    command_id: &'a str,
    command_type: CommandType,
    wa_id: &'a str,
    issued_at: String,
    reason: &'a str,
    target_agent_id: &'a str,
}

impl PrivilegedCommand {
    /// Build and sign a command with `key`.
    pub fn signed(
        command_type: CommandType,
        wa_id: impl Into<String>,
        key: &SigningKey,
        reason: impl Into<String>,
        target_agent_id: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Self, AuthorityError> {
        let mut command = Self {
            command_id: Uuid::new_v4().to_string(),
            command_type,
            wa_id: wa_id.into(),
            wa_public_key: key.public_key_b64(),
            issued_at: Utc::now(),
            expires_at,
            reason: reason.into(),
            target_agent_id: target_agent_id.into(),
            signature: String::new(),
            relay_chain: Vec::new(),
        };
        command.signature = key.sign(&command.signable_bytes()?);
        Ok(command)
    }

    /// Canonical compact JSON of the signed subset.
    pub fn signable_bytes(&self) -> Result<Vec<u8>, AuthorityError> {
        let payload = SignablePayload {
            command_id: &self.command_id,
            command_type: self.command_type,
            wa_id: &self.wa_id,
            issued_at: timestamp(self.issued_at),
            reason: &self.reason,
            target_agent_id: &self.target_agent_id,
        };
        serde_json::to_vec(&payload)
            .map_err(|e| AuthorityError::KeyMaterial(format!("unserialisable command: {e}")))
    }
}

/// Trusted Wise Authority keys; swapped atomically on rotation.
pub struct KeyAllowlist {
    keys: ArcSwap<Vec<TrustedKey>>,
}

impl KeyAllowlist {
    pub fn new(keys: Vec<TrustedKey>) -> Self {
        Self {
            keys: ArcSwap::from_pointee(keys),
        }
    }

    pub fn from_config(config: &WiseAuthorityConfig) -> Self {
        Self::new(config.trusted_keys.clone())
    }

    /// Replace the trusted set. Verifications already in progress finish
    /// against the set they loaded.
    pub fn rotate(&self, keys: Vec<TrustedKey>) {
        tracing::info!(keys = keys.len(), "wise authority allowlist rotated");
        self.keys.store(Arc::new(keys));
    }

    pub fn len(&self) -> usize {
        self.keys.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.load().is_empty()
    }

    /// Whether `public_key_b64` is registered for `wa_id`.
    pub fn is_trusted(&self, wa_id: &str, public_key_b64: &str) -> bool {
        self.entry(wa_id, public_key_b64).is_some()
    }

    fn entry(&self, wa_id: &str, public_key_b64: &str) -> Option<TrustedKey> {
        let candidate = decode_public_key(public_key_b64).ok()?;
        let keys = self.keys.load();
        keys.iter()
            .filter(|k| k.wa_id == wa_id)
            .find(|k| {
                decode_public_key(&k.public_key)
                    .is_ok_and(|known| bool::from(known.ct_eq(&candidate)))
            })
            .cloned()
    }

    /// Full admission check for a privileged command addressed to `agent_id`.
    pub fn verify_command(
        &self,
        command: &PrivilegedCommand,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AuthorityError> {
        let Some(trusted) = self.entry(&command.wa_id, &command.wa_public_key) else {
            return Err(AuthorityError::UntrustedKey(command.wa_id.clone()));
        };

        verify_signature(
            &command.wa_public_key,
            &command.signable_bytes()?,
            &command.signature,
            &command.command_id,
        )?;

        if let Some(expires_at) = command.expires_at
            && expires_at <= now
        {
            return Err(AuthorityError::Expired {
                command_id: command.command_id.clone(),
                expires_at: timestamp(expires_at),
            });
        }

        if command.target_agent_id != agent_id {
            return Err(AuthorityError::WrongTarget {
                command_id: command.command_id.clone(),
                target: command.target_agent_id.clone(),
            });
        }

        if !trusted.permits(command.command_type.scope()) {
            return Err(AuthorityError::Unauthorized(command.wa_id.clone()));
        }
        Ok(())
    }
}

/// Detached signature over a manifest's SHA-256 checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSignature {
    pub wa_id: String,
    pub sha256: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at: DateTime<Utc>,
}

pub fn manifest_checksum(contents: &[u8]) -> String {
    hex::encode(Sha256::digest(contents))
}

pub fn sign_manifest(wa_id: &str, key: &SigningKey, contents: &[u8]) -> ManifestSignature {
    let sha256 = manifest_checksum(contents);
    ManifestSignature {
        wa_id: wa_id.to_string(),
        signature: key.sign(sha256.as_bytes()),
        sha256,
        public_key: key.public_key_b64(),
        signed_at: Utc::now(),
    }
}

/// Check that `contents` match the signed checksum and that the signer is trusted.
pub fn verify_manifest(
    contents: &[u8],
    manifest: &ManifestSignature,
    allowlist: &KeyAllowlist,
) -> Result<(), AuthorityError> {
    if !allowlist.is_trusted(&manifest.wa_id, &manifest.public_key) {
        return Err(AuthorityError::UntrustedKey(manifest.wa_id.clone()));
    }
    let computed = manifest_checksum(contents);
    if !bool::from(computed.as_bytes().ct_eq(manifest.sha256.as_bytes())) {
        return Err(AuthorityError::InvalidSignature(format!(
            "manifest checksum {computed}"
        )));
    }
    verify_signature(
        &manifest.public_key,
        manifest.sha256.as_bytes(),
        &manifest.signature,
        "manifest",
    )
}
