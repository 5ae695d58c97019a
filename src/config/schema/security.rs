use crate::schemas::ActionKind;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ask for a retry when SPEAK follows an implausible thought.
    #[serde(default = "default_true")]
    pub plausibility_check: bool,
    /// CSDMA scores below this make SPEAK reconsider.
    #[serde(default = "default_plausibility_min_score")]
    pub plausibility_min_score: u8,
}

fn default_true() -> bool {
    true
}

fn default_plausibility_min_score() -> u8 {
    8
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            plausibility_check: true,
            plausibility_min_score: default_plausibility_min_score(),
        }
    }
}

/// How aggressively the secrets filter matches.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    /// Well-known provider token prefixes only.
    Low,
    /// Adds `password=`, JSON credential fields and bearer headers.
    #[default]
    Medium,
    /// Adds long opaque alphanumeric tokens.
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    #[serde(default)]
    pub sensitivity: Sensitivity,
    /// Actions whose parameters get secret references decrypted before dispatch.
    #[serde(default = "default_auto_decrypt_actions")]
    pub auto_decrypt_actions: Vec<ActionKind>,
    /// When false, detected secrets are replaced by `[REDACTED]` and not kept.
    #[serde(default = "default_true")]
    pub encrypt: bool,
}

fn default_auto_decrypt_actions() -> Vec<ActionKind> {
    vec![ActionKind::Tool]
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            sensitivity: Sensitivity::default(),
            auto_decrypt_actions: default_auto_decrypt_actions(),
            encrypt: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Period of the background chain verification. Zero disables it.
    #[serde(default = "default_verify_interval_seconds")]
    pub verify_interval_seconds: u64,
    /// PKCS#8 Ed25519 key used to sign record hashes.
    #[serde(default)]
    pub signing_key_path: Option<PathBuf>,
}

fn default_verify_interval_seconds() -> u64 {
    300
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            verify_interval_seconds: default_verify_interval_seconds(),
            signing_key_path: None,
        }
    }
}

/// A Wise-Authority public key trusted for privileged commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedKey {
    pub wa_id: String,
    /// Base64 raw Ed25519 public key.
    pub public_key: String,
    /// Command scopes this key may use; absent means every scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
}

impl TrustedKey {
    pub fn permits(&self, scope: &str) -> bool {
        self.scopes
            .as_ref()
            .is_none_or(|scopes| scopes.iter().any(|s| s == scope || s == "*"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WiseAuthorityConfig {
    #[serde(default)]
    pub trusted_keys: Vec<TrustedKey>,
    /// Refuse privileged commands outright when no key is trusted.
    #[serde(default)]
    pub require_trusted_keys: bool,
}

impl WiseAuthorityConfig {
    pub fn validate(&self) -> Result<()> {
        for key in &self.trusted_keys {
            anyhow::ensure!(
                !key.wa_id.trim().is_empty(),
                "wise_authority.trusted_keys entries need a wa_id"
            );
            anyhow::ensure!(
                !key.public_key.trim().is_empty(),
                "wise_authority.trusted_keys[{}] has an empty public_key",
                key.wa_id
            );
        }
        anyhow::ensure!(
            !self.require_trusted_keys || !self.trusted_keys.is_empty(),
            "wise_authority.require_trusted_keys is set but no keys are configured"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitivity_parses_lowercase() {
        let cfg: SecretsConfig = toml::from_str("sensitivity = \"high\"").unwrap();
        assert_eq!(cfg.sensitivity, Sensitivity::High);
        assert_eq!(cfg.auto_decrypt_actions, vec![ActionKind::Tool]);
    }

    #[test]
    fn strict_authority_without_keys_is_invalid() {
        let cfg = WiseAuthorityConfig {
            trusted_keys: Vec::new(),
            require_trusted_keys: true,
        };
        assert!(cfg.validate().is_err());
    }
}
