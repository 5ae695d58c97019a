use super::detect::{detect, find_references};
use crate::config::Sensitivity;
use anyhow::{Context, Result};
use chacha20poly1305::{
    ChaCha20Poly1305, KeyInit, Nonce,
    aead::{Aead, OsRng, rand_core::RngCore},
};
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use zeroize::Zeroize;

const KEY_FILE: &str = ".vault_key";
const NONCE_LEN: usize = 12;
const REDACTED: &str = "[REDACTED]";

/// Result of [`SecretsVault::protect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Protected {
    pub text: String,
    /// Labels of the secrets that were removed, in order of appearance.
    pub labels: Vec<String>,
}

impl Protected {
    pub fn changed(&self) -> bool {
        !self.labels.is_empty()
    }
}

/// Encrypted store for secrets lifted out of thought and action text.
///
/// Plaintext never stays in memory beyond one call; the key is read from
/// `<root>/.vault_key` per operation and zeroized afterwards.
pub struct SecretsVault {
    pool: SqlitePool,
    root: PathBuf,
    encrypt: bool,
}

impl SecretsVault {
    pub async fn new(pool: SqlitePool, root: &Path, encrypt: bool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS secrets (
                 secret_id TEXT PRIMARY KEY,
                 label TEXT NOT NULL,
                 ciphertext TEXT NOT NULL,
                 created_at TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await
        .context("failed to create secrets table")?;

        Ok(Self {
            pool,
            root: root.to_path_buf(),
            encrypt,
        })
    }

    /// Replace every secret in `text` with a `{SECRET:<uuid>:<label>}`
    /// reference, or with `[REDACTED]` when encryption is disabled.
    pub async fn protect(&self, text: &str, sensitivity: Sensitivity) -> Result<Protected> {
        let found = detect(text, sensitivity);
        if found.is_empty() {
            return Ok(Protected {
                text: text.to_string(),
                labels: Vec::new(),
            });
        }

        let mut out = String::with_capacity(text.len());
        let mut labels = Vec::with_capacity(found.len());
        let mut cursor = 0;
        for secret in found {
            out.push_str(&text[cursor..secret.start]);
            let replacement = if self.encrypt {
                let secret_id = self.store(secret.label, &text[secret.start..secret.end]).await?;
                format!("{{SECRET:{secret_id}:{}}}", secret.label)
            } else {
                REDACTED.to_string()
            };
            out.push_str(&replacement);
            labels.push(secret.label.to_string());
            cursor = secret.end;
        }
        out.push_str(&text[cursor..]);

        tracing::info!(secrets = labels.len(), "secrets moved into vault");
        Ok(Protected { text: out, labels })
    }

    /// Substitute the plaintext back for every reference in `text`. Unknown
    /// references are left untouched.
    pub async fn reveal(&self, text: &str) -> Result<String> {
        let references = find_references(text);
        if references.is_empty() {
            return Ok(text.to_string());
        }

        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for reference in references {
            out.push_str(&text[cursor..reference.start]);
            match self.fetch(reference.secret_id).await? {
                Some(plaintext) => out.push_str(&plaintext),
                None => {
                    tracing::warn!(secret_id = %reference.secret_id, "unknown secret reference");
                    out.push_str(&text[reference.start..reference.end]);
                }
            }
            cursor = reference.end;
        }
        out.push_str(&text[cursor..]);
        Ok(out)
    }

    /// [`protect`](Self::protect) every string inside `value`, in place.
    /// Returns the labels of everything removed.
    pub async fn protect_json(&self, value: &mut Value, sensitivity: Sensitivity) -> Result<Vec<String>> {
        let mut labels = Vec::new();
        let mut stack: Vec<&mut Value> = vec![value];
        while let Some(node) = stack.pop() {
            match node {
                Value::String(text) => {
                    let protected = self.protect(text, sensitivity).await?;
                    if protected.changed() {
                        *text = protected.text;
                        labels.extend(protected.labels);
                    }
                }
                Value::Array(items) => stack.extend(items.iter_mut()),
                Value::Object(fields) => stack.extend(fields.values_mut()),
                _ => {}
            }
        }
        Ok(labels)
    }

    /// [`reveal`](Self::reveal) every string inside `value`, in place.
    pub async fn reveal_json(&self, value: &mut Value) -> Result<()> {
        let mut stack: Vec<&mut Value> = vec![value];
        while let Some(node) = stack.pop() {
            match node {
                Value::String(text) => {
                    if !find_references(text).is_empty() {
                        *text = self.reveal(text).await?;
                    }
                }
                Value::Array(items) => stack.extend(items.iter_mut()),
                Value::Object(fields) => stack.extend(fields.values_mut()),
                _ => {}
            }
        }
        Ok(())
    }

    pub async fn forget(&self, secret_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM secrets WHERE secret_id = $1")
            .bind(secret_id.to_string())
            .execute(&self.pool)
            .await
            .context("failed to delete secret")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM secrets")
            .fetch_one(&self.pool)
            .await
            .context("failed to count secrets")?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn store(&self, label: &str, plaintext: &str) -> Result<Uuid> {
        let secret_id = Uuid::new_v4();
        let ciphertext = self.encrypt_value(plaintext)?;
        sqlx::query(
            "INSERT INTO secrets (secret_id, label, ciphertext, created_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(secret_id.to_string())
        .bind(label)
        .bind(ciphertext)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to store secret")?;
        Ok(secret_id)
    }

    async fn fetch(&self, secret_id: Uuid) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT ciphertext FROM secrets WHERE secret_id = $1")
                .bind(secret_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .context("failed to read secret")?;
        row.map(|(ciphertext,)| self.decrypt_value(&ciphertext))
            .transpose()
    }

    fn encrypt_value(&self, plaintext: &str) -> Result<String> {
        let mut key_bytes = self.load_or_create_key()?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key_bytes).context("invalid key length")?;
        key_bytes.zeroize();

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(hex::encode(combined))
    }

    fn decrypt_value(&self, encoded: &str) -> Result<String> {
        let combined = hex::decode(encoded).context("invalid hex in vault entry")?;
        if combined.len() < NONCE_LEN {
            anyhow::bail!("vault entry too short");
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let mut key_bytes = self.load_or_create_key()?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key_bytes).context("invalid key length")?;
        key_bytes.zeroize();

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| anyhow::anyhow!("decryption failed: {e}"))?;
        String::from_utf8(plaintext).context("decrypted value is not valid UTF-8")
    }

    fn key_path(&self) -> PathBuf {
        self.root.join(KEY_FILE)
    }

    fn read_key_file(path: &Path) -> Result<Vec<u8>> {
        let hex_key = fs::read_to_string(path).context("failed to read vault key")?;
        let key = hex::decode(hex_key.trim()).context("invalid hex in vault key")?;
        if key.len() != 32 {
            anyhow::bail!("vault key has invalid length (expected 32 bytes)");
        }
        Ok(key)
    }

    fn write_new_key_file(path: &Path, key: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("failed to create vault directory")?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;

            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)
                .context("failed to create vault key")?;
            file.write_all(hex::encode(key).as_bytes())
                .context("failed to write vault key")?;
            file.sync_all().context("failed to sync vault key")?;
        }

        #[cfg(not(unix))]
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .context("failed to create vault key")?;
            file.write_all(hex::encode(key).as_bytes())
                .context("failed to write vault key")?;
        }

        Ok(())
    }

    fn load_or_create_key(&self) -> Result<Vec<u8>> {
        let path = self.key_path();
        if path.exists() {
            return Self::read_key_file(&path);
        }

        let mut key = vec![0u8; 32];
        OsRng.fill_bytes(&mut key);
        match Self::write_new_key_file(&path, &key) {
            Ok(()) => Ok(key),
            Err(error) => {
                key.zeroize();
                let is_already_exists = error
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::AlreadyExists);
                if is_already_exists {
                    Self::read_key_file(&path)
                } else {
                    Err(error)
                }
            }
        }
    }
}
