use crate::error::AuthorityError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use ring::rand::SystemRandom;
use ring::signature::{ED25519, Ed25519KeyPair, KeyPair, UnparsedPublicKey};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;
use zeroize::Zeroizing;

/// Ed25519 signing key held as its PKCS#8 document.
pub struct SigningKey {
    pair: Ed25519KeyPair,
    pkcs8: Zeroizing<Vec<u8>>,
}

impl SigningKey {
    /// Generate a fresh keypair from the system RNG. Runs fully offline.
    pub fn generate() -> Result<Self, AuthorityError> {
        let rng = SystemRandom::new();
        let document = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| AuthorityError::KeyMaterial("key generation failed".into()))?;
        Self::from_pkcs8(document.as_ref())
    }

    pub fn from_pkcs8(bytes: &[u8]) -> Result<Self, AuthorityError> {
        let pair = Ed25519KeyPair::from_pkcs8(bytes)
            .map_err(|e| AuthorityError::KeyMaterial(format!("rejected PKCS#8 key: {e}")))?;
        Ok(Self {
            pair,
            pkcs8: Zeroizing::new(bytes.to_vec()),
        })
    }

    /// Read a base64 PKCS#8 key file written by [`SigningKey::save`].
    pub fn load(path: &Path) -> Result<Self, AuthorityError> {
        let encoded = Zeroizing::new(fs::read_to_string(path).map_err(|e| {
            AuthorityError::KeyMaterial(format!("failed to read {}: {e}", path.display()))
        })?);
        let bytes = Zeroizing::new(
            BASE64_STANDARD
                .decode(encoded.trim())
                .map_err(|e| AuthorityError::KeyMaterial(format!("invalid base64 key file: {e}")))?,
        );
        Self::from_pkcs8(&bytes)
    }

    /// Write the key owner-readable only. Refuses to overwrite an existing file.
    pub fn save(&self, path: &Path) -> Result<(), AuthorityError> {
        let encoded = Zeroizing::new(BASE64_STANDARD.encode(self.pkcs8.as_slice()));
        let io_err =
            |e: std::io::Error| AuthorityError::KeyMaterial(format!("{}: {e}", path.display()));

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;

            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)
                .map_err(io_err)?;
            file.write_all(encoded.as_bytes()).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }

        #[cfg(not(unix))]
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .map_err(io_err)?;
            file.write_all(encoded.as_bytes()).map_err(io_err)?;
        }

        Ok(())
    }

    pub fn public_key_bytes(&self) -> &[u8] {
        self.pair.public_key().as_ref()
    }

    pub fn public_key_b64(&self) -> String {
        BASE64_STANDARD.encode(self.public_key_bytes())
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(self.public_key_bytes())
    }

    /// Base64 Ed25519 signature over `message`.
    pub fn sign(&self, message: &[u8]) -> String {
        BASE64_STANDARD.encode(self.pair.sign(message).as_ref())
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Hex SHA-256 of the raw public key.
pub fn fingerprint(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

pub fn decode_public_key(public_key_b64: &str) -> Result<Vec<u8>, AuthorityError> {
    let bytes = BASE64_STANDARD
        .decode(public_key_b64.trim())
        .map_err(|e| AuthorityError::KeyMaterial(format!("invalid base64 public key: {e}")))?;
    if bytes.len() != 32 {
        return Err(AuthorityError::KeyMaterial(format!(
            "Ed25519 public key must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Check a base64 signature over `message` against a base64 public key.
/// `subject` names what was signed in the returned error.
pub fn verify_signature(
    public_key_b64: &str,
    message: &[u8],
    signature_b64: &str,
    subject: &str,
) -> Result<(), AuthorityError> {
    let public_key = decode_public_key(public_key_b64)?;
    let signature = BASE64_STANDARD
        .decode(signature_b64.trim())
        .map_err(|_| AuthorityError::InvalidSignature(subject.to_string()))?;
    UnparsedPublicKey::new(&ED25519, &public_key)
        .verify(message, &signature)
        .map_err(|_| AuthorityError::InvalidSignature(subject.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sign_and_verify() {
        let key = SigningKey::generate().unwrap();
        let signature = key.sign(b"shutdown");
        verify_signature(&key.public_key_b64(), b"shutdown", &signature, "cmd").unwrap();
    }

    #[test]
    fn tampered_message_fails() {
        let key = SigningKey::generate().unwrap();
        let signature = key.sign(b"shutdown");
        let err = verify_signature(&key.public_key_b64(), b"shutdown now", &signature, "cmd")
            .unwrap_err();
        assert!(matches!(err, AuthorityError::InvalidSignature(id) if id == "cmd"));
    }

    #[test]
    fn wrong_key_fails() {
        let signer = SigningKey::generate().unwrap();
        let other = SigningKey::generate().unwrap();
        let signature = signer.sign(b"payload");
        assert!(verify_signature(&other.public_key_b64(), b"payload", &signature, "x").is_err());
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let key = SigningKey::generate().unwrap();
        let fp = key.fingerprint();
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn short_public_key_is_rejected() {
        let err = decode_public_key(&BASE64_STANDARD.encode([1u8; 8])).unwrap_err();
        assert!(err.to_string().contains("32 bytes"));
    }

    #[test]
    fn save_then_load_keeps_identity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("wa.key");
        let key = SigningKey::generate().unwrap();
        key.save(&path).unwrap();

        let loaded = SigningKey::load(&path).unwrap();
        assert_eq!(loaded.public_key_b64(), key.public_key_b64());
        assert!(key.save(&path).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn saved_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wa.key");
        SigningKey::generate().unwrap().save(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
