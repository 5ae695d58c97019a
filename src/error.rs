use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for the CIRIS runtime.
///
/// Each subsystem defines its own error variant. Callers at subsystem
/// boundaries match on these to pick a recovery strategy (retry, defer,
/// halt); internal code continues to use `anyhow::Result` for context chains.
#[derive(Debug, Error)]
pub enum CirisError {
    // ── Config ───────────────────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── Action parameters ───────────────────────────────────────────────
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),

    // ── Capability services ─────────────────────────────────────────────
    #[error("service: {0}")]
    Service(#[from] ServiceError),

    // ── Decision-making algorithms ──────────────────────────────────────
    #[error("dma: {0}")]
    Dma(#[from] DmaError),

    // ── Guardrails ──────────────────────────────────────────────────────
    #[error("guardrail: {0}")]
    Guardrail(#[from] GuardrailError),

    // ── Audit chain ─────────────────────────────────────────────────────
    #[error("integrity: {0}")]
    Integrity(#[from] IntegrityError),

    // ── Task / thought store ────────────────────────────────────────────
    #[error("store: {0}")]
    Store(#[from] StoreError),

    // ── Wise Authority ──────────────────────────────────────────────────
    #[error("authority: {0}")]
    Authority(#[from] AuthorityError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CirisError {
    /// Whether a bounded retry may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Service(err) => err.is_transient(),
            Self::Dma(err) => !matches!(err, DmaError::RetriesExhausted { .. }),
            _ => false,
        }
    }

    /// Whether the runtime must stop audit-dependent dispatch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Validation errors ──────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{action}: missing required parameter '{field}'")]
    MissingField { action: String, field: String },

    #[error("{action}: invalid parameter '{field}': {message}")]
    InvalidField {
        action: String,
        field: String,
        message: String,
    },

    #[error("action {0} is not permitted by the agent profile")]
    ActionNotPermitted(String),
}

// ─── Service errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no provider registered for capability '{0}'")]
    NoProvider(String),

    #[error("capability '{capability}' temporarily unavailable: {message}")]
    Transient { capability: String, message: String },

    #[error("capability '{capability}' failed after {attempts} attempts: {message}")]
    Exhausted {
        capability: String,
        attempts: u32,
        message: String,
    },

    #[error("capability '{capability}' call timed out after {timeout_ms}ms")]
    Timeout { capability: String, timeout_ms: u64 },

    #[error("capability '{capability}' rejected the request: {message}")]
    Rejected { capability: String, message: String },
}

impl ServiceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }
}

// ─── DMA errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DmaError {
    #[error("{stage} backend unavailable: {message}")]
    BackendUnavailable { stage: String, message: String },

    #[error("{stage} returned malformed output: {message}")]
    MalformedOutput { stage: String, message: String },

    #[error("{stage} timed out after {timeout_secs}s")]
    Timeout { stage: String, timeout_secs: u64 },

    #[error("{stage} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        stage: String,
        attempts: u32,
        last_error: String,
    },
}

// ─── Guardrail errors ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum GuardrailError {
    #[error("guardrail {guardrail} violated: {reason}")]
    Violation { guardrail: String, reason: String },

    #[error("guardrail {guardrail} attempted to de-escalate {from} to {to}")]
    BypassAttempt {
        guardrail: String,
        from: String,
        to: String,
    },

    #[error("guardrail retries exhausted after {0} attempts")]
    RetriesExhausted(u32),
}

// ─── Integrity errors ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("hash mismatch at sequence {sequence}: stored={stored}, computed={computed}")]
    HashMismatch {
        sequence: i64,
        stored: String,
        computed: String,
    },

    #[error("chain break at sequence {sequence}: prev_hash does not match predecessor")]
    ChainBreak { sequence: i64 },

    #[error("signature invalid at sequence {0}")]
    BadSignature(i64),

    #[error("unreadable audit row at sequence {sequence}: {reason}")]
    Corrupt { sequence: i64, reason: String },

    #[error("audit dispatch halted after integrity fault: {0}")]
    Halted(String),

    #[error("audit storage failure: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for IntegrityError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

// ─── Store errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("illegal {kind} transition {from} -> {to}")]
    IllegalTransition {
        kind: &'static str,
        from: String,
        to: String,
    },

    #[error("thought depth {depth} exceeds the maximum of {max}")]
    DepthExceeded { depth: u32, max: u32 },

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("sqlx: {0}")]
    Sqlx(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Sqlx(err.to_string())
    }
}

// ─── Authority errors ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("public key is not in the trusted allowlist: {0}")]
    UntrustedKey(String),

    #[error("signature verification failed for command {0}")]
    InvalidSignature(String),

    #[error("command {command_id} expired at {expires_at}")]
    Expired {
        command_id: String,
        expires_at: String,
    },

    #[error("command {command_id} targets agent {target}, not this agent")]
    WrongTarget { command_id: String, target: String },

    #[error("malformed key material: {0}")]
    KeyMaterial(String),

    #[error("wise authority {0} is inactive or lacks the required scope")]
    Unauthorized(String),
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, CirisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_displays_correctly() {
        let err = CirisError::Config(ConfigError::Validation("max_active_tasks = 0".into()));
        assert!(err.to_string().contains("validation failed"));
    }

    #[test]
    fn transient_service_error_is_retryable() {
        let err = CirisError::Service(ServiceError::Transient {
            capability: "communication".into(),
            message: "socket closed".into(),
        });
        assert!(err.is_transient());
        assert!(!err.is_fatal());
    }

    #[test]
    fn exhausted_dma_is_not_retryable() {
        let err = CirisError::Dma(DmaError::RetriesExhausted {
            stage: "pdma".into(),
            attempts: 3,
            last_error: "timeout".into(),
        });
        assert!(!err.is_transient());
    }

    #[test]
    fn integrity_fault_is_fatal() {
        let err = CirisError::Integrity(IntegrityError::ChainBreak { sequence: 4 });
        assert!(err.is_fatal());
        assert!(err.to_string().contains("sequence 4"));
    }

    #[test]
    fn anyhow_interop() {
        let anyhow_err = anyhow::anyhow!("something went wrong");
        let err: CirisError = anyhow_err.into();
        assert!(err.to_string().contains("something went wrong"));
    }

    #[test]
    fn bypass_attempt_names_both_actions() {
        let err = GuardrailError::BypassAttempt {
            guardrail: "secrets".into(),
            from: "DEFER".into(),
            to: "SPEAK".into(),
        };
        let text = err.to_string();
        assert!(text.contains("DEFER") && text.contains("SPEAK"));
    }
}
