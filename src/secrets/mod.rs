//! Secret detection and the encrypted vault behind the secrets guardrail.

pub mod detect;
pub mod vault;

pub use detect::{DetectedSecret, SecretReference, detect, find_references};
pub use vault::{Protected, SecretsVault};
