use super::{
    AgentProfile, AuditConfig, BusConfig, DatabaseConfig, GuardrailConfig, ObservabilityConfig,
    SecretsConfig, StatesConfig, WiseAuthorityConfig, WorkflowConfig,
};
use crate::error::ConfigError;
use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to config.toml - computed, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,
    /// Directory for the database, vault key and signing keys - computed, not serialized
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub agent: AgentProfile,

    #[serde(default)]
    pub workflow: WorkflowConfig,

    #[serde(default)]
    pub states: StatesConfig,

    #[serde(default)]
    pub guardrails: GuardrailConfig,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub wise_authority: WiseAuthorityConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub database: DatabaseConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from(".ciris");
        Self {
            config_path: data_dir.join("config.toml"),
            data_dir,
            agent: AgentProfile::default(),
            workflow: WorkflowConfig::default(),
            states: StatesConfig::default(),
            guardrails: GuardrailConfig::default(),
            secrets: SecretsConfig::default(),
            audit: AuditConfig::default(),
            wise_authority: WiseAuthorityConfig::default(),
            bus: BusConfig::default(),
            observability: ObservabilityConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Config {
    /// Load `~/.ciris/config.toml`, writing defaults on first run.
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        Self::load_or_init_at(&home.join(".ciris").join("config.toml"))
    }

    /// Load `config_path`, or write defaults there when it does not exist.
    /// The data directory is the file's parent.
    pub fn load_or_init_at(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            return Self::load_from_path(config_path);
        }

        let data_dir = config_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        fs::create_dir_all(&data_dir).context("Failed to create config directory")?;
        let mut config = Self {
            config_path: config_path.to_path_buf(),
            data_dir,
            ..Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        config.save()?;
        Ok(config)
    }

    /// Load and validate an explicit config file.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("failed to read {}: {e}", path.display())))?;
        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| ConfigError::Load(format!("failed to parse {}: {e}", path.display())))?;
        config.config_path = path.to_path_buf();
        config.data_dir = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("CIRIS_LOG_LEVEL")
            && !level.is_empty()
        {
            self.observability.log_level = level;
        }

        if let Ok(agent_id) = std::env::var("CIRIS_AGENT_ID")
            && !agent_id.is_empty()
        {
            self.agent.agent_id = agent_id;
        }

        if let Ok(db_path) = std::env::var("CIRIS_DB_PATH")
            && !db_path.is_empty()
        {
            self.database.path = Some(PathBuf::from(db_path));
        }
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            self.agent.validate(),
            self.workflow.validate(),
            self.wise_authority.validate(),
        ];
        for check in checks {
            check.map_err(|e| ConfigError::Validation(e.to_string()))?;
        }

        if !matches!(
            self.observability.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::Validation(format!(
                "unknown observability.log_level '{}'",
                self.observability.log_level
            ))
            .into());
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("ciris.db"))
    }

    /// sqlx connection string; creates the file when missing.
    pub fn database_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.database_path().display())
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        fs::write(&self.config_path, toml_str).context("Failed to write config file")?;
        Ok(())
    }
}
