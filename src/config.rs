//! Configuration management with validation and defaults
//!
//! `EngineConfig` is plain serde data with presets. [`ConfigLoader`] layers a TOML
//! file and `ROUNDHOUSE_*` environment variables on top and validates the result.

use crate::errors::{ConfigurationError, RoundhouseResult};
use crate::games::types::{Amount, HouseStrategy, ModeId, ModeKind, Multiplier};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fixed RNG seed for reproducible draws; random when unset
    pub rng_seed: Option<u64>,
    pub server: ServerConfig,
    pub modes: Vec<ModeConfig>,
    pub payouts: PayoutConfig,
    pub crash: CrashConfig,
    pub settlement: SettlementConfig,
    pub broadcast: BroadcastConfig,
    pub storage: StorageConfig,
    pub accounts: AccountsConfig,
    pub monitoring: MonitoringConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rng_seed: None,
            server: ServerConfig::default(),
            modes: vec![
                ModeConfig::discrete("30", 30),
                ModeConfig::discrete("60", 60),
                ModeConfig::discrete("180", 180),
                ModeConfig::discrete("300", 300),
                ModeConfig::crash("aviator"),
            ],
            payouts: PayoutConfig::default(),
            crash: CrashConfig::default(),
            settlement: SettlementConfig::default(),
            broadcast: BroadcastConfig::default(),
            storage: StorageConfig::default(),
            accounts: AccountsConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    /// CORS origins; `*` or empty allows any
    pub allowed_origins: Vec<String>,
    /// Required `x-api-key` for admin routes; admin is open when unset
    pub admin_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 30,
            allowed_origins: vec!["*".to_string()],
            admin_key: None,
        }
    }
}

/// Per-mode settings. Changes made at runtime apply from the next round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeConfig {
    pub id: ModeId,
    pub kind: ModeKind,
    /// Round length for discrete modes
    #[serde(default)]
    pub duration_secs: u64,
    /// Betting closes when this many seconds remain
    #[serde(default = "default_lock_secs")]
    pub lock_secs: u64,
    #[serde(default = "default_min_wager")]
    pub min_wager: Amount,
    #[serde(default = "default_max_wager")]
    pub max_wager: Amount,
    #[serde(default = "default_strategy")]
    pub strategy: HouseStrategy,
}

fn default_lock_secs() -> u64 {
    5
}

fn default_min_wager() -> Amount {
    10
}

fn default_max_wager() -> Amount {
    50_000
}

fn default_strategy() -> HouseStrategy {
    HouseStrategy::Adversarial
}

impl ModeConfig {
    pub fn discrete(id: &str, duration_secs: u64) -> Self {
        Self {
            id: ModeId::new(id),
            kind: ModeKind::Discrete,
            duration_secs,
            lock_secs: default_lock_secs(),
            min_wager: default_min_wager(),
            max_wager: default_max_wager(),
            strategy: default_strategy(),
        }
    }

    pub fn crash(id: &str) -> Self {
        Self {
            id: ModeId::new(id),
            kind: ModeKind::Crash,
            duration_secs: 0,
            lock_secs: 0,
            min_wager: default_min_wager(),
            max_wager: default_max_wager(),
            strategy: default_strategy(),
        }
    }

    pub fn with_strategy(mut self, strategy: HouseStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let id = self.id.as_str();
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid("modes.id", id, "mode ids must be non-empty and alphanumeric"));
        }
        if self.min_wager == 0 {
            return Err(invalid("modes.min_wager", "0", "minimum wager must be positive"));
        }
        if self.min_wager > self.max_wager {
            return Err(invalid(
                "modes.max_wager",
                &self.max_wager.to_string(),
                "maximum wager must not be below the minimum",
            ));
        }
        if self.kind == ModeKind::Discrete {
            if self.duration_secs == 0 {
                return Err(invalid("modes.duration_secs", "0", "discrete rounds need a duration"));
            }
            if self.lock_secs >= self.duration_secs {
                return Err(invalid(
                    "modes.lock_secs",
                    &self.lock_secs.to_string(),
                    "lock threshold must be shorter than the round",
                ));
            }
        }
        Ok(())
    }
}

/// Administrative settings change for one mode
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModePatch {
    pub strategy: Option<HouseStrategy>,
    pub min_wager: Option<Amount>,
    pub max_wager: Option<Amount>,
    pub lock_secs: Option<u64>,
}

impl ModePatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// The validated config that results from applying this patch to `base`
    pub fn apply(&self, base: &ModeConfig) -> Result<ModeConfig, ConfigurationError> {
        let mut next = base.clone();
        if let Some(strategy) = self.strategy {
            next.strategy = strategy;
        }
        if let Some(min) = self.min_wager {
            next.min_wager = min;
        }
        if let Some(max) = self.max_wager {
            next.max_wager = max;
        }
        if let Some(lock) = self.lock_secs {
            next.lock_secs = lock;
        }
        next.validate()?;
        Ok(next)
    }
}

/// Win multipliers in basis points
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PayoutConfig {
    pub number_bp: u32,
    pub color_bp: u32,
    pub size_bp: u32,
}

impl PayoutConfig {
    pub const MIN_CATEGORY_BP: u32 = 19_000;
    pub const MAX_CATEGORY_BP: u32 = 19_800;
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            number_bp: 90_000,
            color_bp: 19_800,
            size_bp: 19_800,
        }
    }
}

/// Crash mode timings; multipliers in basis points
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashConfig {
    pub waiting_ms: u64,
    pub tick_ms: u64,
    pub cooldown_ms: u64,
    pub min_increment_bp: u32,
    pub max_increment_bp: u32,
    pub min_crash_bp: u32,
    pub max_crash_bp: u32,
}

impl Default for CrashConfig {
    fn default() -> Self {
        Self {
            waiting_ms: 5_000,
            tick_ms: 100,
            cooldown_ms: 3_000,
            min_increment_bp: 500,
            max_increment_bp: 2_000,
            min_crash_bp: 12_000,
            max_crash_bp: 100_000,
        }
    }
}

impl CrashConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Whole ticks spent in the waiting window
    pub fn waiting_ticks(&self) -> u64 {
        (self.waiting_ms / self.tick_ms.max(1)).max(1)
    }

    pub fn cooldown_ticks(&self) -> u64 {
        self.cooldown_ms / self.tick_ms.max(1)
    }

    pub fn min_crash(&self) -> Multiplier {
        Multiplier::from_bp(self.min_crash_bp)
    }

    pub fn max_crash(&self) -> Multiplier {
        Multiplier::from_bp(self.max_crash_bp)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub retry_base_ms: u64,
    pub max_attempts: u32,
    pub retry_poll_ms: u64,
    /// How many recent rounds per mode to inspect on startup
    pub recovery_scan: usize,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            retry_base_ms: 500,
            max_attempts: 8,
            retry_poll_ms: 250,
            recovery_scan: 50,
        }
    }
}

impl SettlementConfig {
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_poll_interval(&self) -> Duration {
        Duration::from_millis(self.retry_poll_ms.max(10))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub channel_capacity: usize,
    pub history_len: usize,
    pub heartbeat_secs: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            history_len: 10,
            heartbeat_secs: 30,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    RocksDb,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::RocksDb,
            data_dir: PathBuf::from("./DB/roundhouse"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    /// Balance credited to a bettor the first time they are seen
    pub opening_balance: Amount,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            opening_balance: 10_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_filter: String,
    pub metrics_enabled: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_filter: "roundhouse=info,tower_http=info".to_string(),
            metrics_enabled: true,
        }
    }
}

impl EngineConfig {
    /// Small in-memory setup with a fixed seed
    pub fn testing() -> Self {
        Self {
            modes: vec![ModeConfig::discrete("30", 30), ModeConfig::crash("aviator")],
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                ..StorageConfig::default()
            },
            monitoring: MonitoringConfig {
                log_filter: "roundhouse=debug".to_string(),
                metrics_enabled: true,
            },
            rng_seed: Some(7),
            ..Self::default()
        }
    }

    pub fn mode(&self, id: &ModeId) -> Option<&ModeConfig> {
        self.modes.iter().find(|m| &m.id == id)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.modes.is_empty() {
            return Err(ConfigurationError::ValidationFailed(
                "at least one game mode must be configured".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for mode in &self.modes {
            mode.validate()?;
            if !seen.insert(mode.id.clone()) {
                return Err(invalid("modes.id", mode.id.as_str(), "duplicate mode id"));
            }
        }

        let category = PayoutConfig::MIN_CATEGORY_BP..=PayoutConfig::MAX_CATEGORY_BP;
        if !category.contains(&self.payouts.color_bp) {
            return Err(invalid(
                "payouts.color_bp",
                &self.payouts.color_bp.to_string(),
                "color multiplier must be between 1.90x and 1.98x",
            ));
        }
        if !category.contains(&self.payouts.size_bp) {
            return Err(invalid(
                "payouts.size_bp",
                &self.payouts.size_bp.to_string(),
                "size multiplier must be between 1.90x and 1.98x",
            ));
        }
        if self.payouts.number_bp < Multiplier::SCALE {
            return Err(invalid(
                "payouts.number_bp",
                &self.payouts.number_bp.to_string(),
                "number multiplier must be at least 1.00x",
            ));
        }

        let crash = &self.crash;
        if crash.tick_ms == 0 {
            return Err(invalid("crash.tick_ms", "0", "tick interval cannot be zero"));
        }
        if crash.min_increment_bp == 0 || crash.min_increment_bp > crash.max_increment_bp {
            return Err(invalid(
                "crash.min_increment_bp",
                &crash.min_increment_bp.to_string(),
                "increment range must be positive and ordered",
            ));
        }
        if crash.min_crash_bp < Multiplier::SCALE || crash.min_crash_bp > crash.max_crash_bp {
            return Err(invalid(
                "crash.min_crash_bp",
                &crash.min_crash_bp.to_string(),
                "crash range must start at 1.00x or above and be ordered",
            ));
        }

        if self.settlement.max_attempts == 0 {
            return Err(invalid("settlement.max_attempts", "0", "at least one credit attempt is required"));
        }
        if self.broadcast.channel_capacity == 0 {
            return Err(invalid("broadcast.channel_capacity", "0", "channel capacity cannot be zero"));
        }
        if self.storage.backend == StorageBackend::RocksDb && self.storage.data_dir.as_os_str().is_empty() {
            return Err(invalid("storage.data_dir", "", "RocksDB needs a data directory"));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Loads configuration from an optional TOML file plus environment overrides
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// File (or defaults), then `ROUNDHOUSE_*` variables, then validation
    pub fn load(&self) -> RoundhouseResult<EngineConfig> {
        self.load_with(|key| env::var(key).ok())
    }

    /// Same as [`ConfigLoader::load`] with an explicit variable lookup
    pub fn load_with<F>(&self, lookup: F) -> RoundhouseResult<EngineConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match &self.config_path {
            Some(path) => Self::load_from_file(path)?,
            None => EngineConfig::default(),
        };
        Self::apply_overrides(&mut config, lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<EngineConfig, ConfigurationError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)))
    }

    fn apply_overrides<F>(config: &mut EngineConfig, lookup: F) -> Result<(), ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("ROUNDHOUSE_HOST") {
            config.server.host = host;
        }
        if let Some(port) = lookup("ROUNDHOUSE_PORT") {
            config.server.port = parse_var("ROUNDHOUSE_PORT", port)?;
        }
        if let Some(key) = lookup("ROUNDHOUSE_ADMIN_KEY") {
            config.server.admin_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Some(backend) = lookup("ROUNDHOUSE_STORAGE") {
            config.storage.backend = match backend.to_ascii_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                "rocksdb" => StorageBackend::RocksDb,
                _ => {
                    return Err(ConfigurationError::InvalidValue {
                        field: "ROUNDHOUSE_STORAGE".to_string(),
                        value: backend,
                        reason: "expected memory or rocksdb".to_string(),
                    })
                }
            };
        }
        if let Some(dir) = lookup("ROUNDHOUSE_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(balance) = lookup("ROUNDHOUSE_OPENING_BALANCE") {
            config.accounts.opening_balance = parse_var("ROUNDHOUSE_OPENING_BALANCE", balance)?;
        }
        if let Some(seed) = lookup("ROUNDHOUSE_RNG_SEED") {
            config.rng_seed = Some(parse_var("ROUNDHOUSE_RNG_SEED", seed)?);
        }
        if let Some(filter) = lookup("ROUNDHOUSE_LOG") {
            config.monitoring.log_filter = filter;
        }
        Ok(())
    }

    pub fn save(config: &EngineConfig, path: &Path) -> RoundhouseResult<()> {
        let toml_string = toml::to_string_pretty(config).map_err(|e| {
            ConfigurationError::SaveFailed(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(path, toml_string).map_err(|e| {
            ConfigurationError::SaveFailed(format!("Failed to write to {}: {}", path.display(), e))
        })?;
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(field: &str, value: String) -> Result<T, ConfigurationError> {
    value.parse().map_err(|_| ConfigurationError::InvalidValue {
        field: field.to_string(),
        value,
        reason: "could not parse value".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.modes.len(), 5);
        assert_eq!(config.payouts.color_bp, 19_800);
        assert_eq!(config.crash.waiting_ticks(), 50);
        assert_eq!(config.crash.cooldown_ticks(), 30);
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::testing();
        config.modes[0].lock_secs = 30;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::testing();
        config.payouts.color_bp = 20_000;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::testing();
        config.modes.push(ModeConfig::discrete("30", 60));
        assert!(config.validate().is_err());

        let mut config = EngineConfig::testing();
        config.modes[0].id = ModeId::new("bad:id");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ROUNDHOUSE_PORT", "9000"),
            ("ROUNDHOUSE_STORAGE", "memory"),
            ("ROUNDHOUSE_ADMIN_KEY", "secret"),
            ("ROUNDHOUSE_RNG_SEED", "99"),
        ]
        .into_iter()
        .collect();

        let config = ConfigLoader::new()
            .load_with(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.server.admin_key.as_deref(), Some("secret"));
        assert_eq!(config.rng_seed, Some(99));
    }

    #[test]
    fn test_bad_env_value_is_rejected() {
        let result = ConfigLoader::new().load_with(|key| {
            (key == "ROUNDHOUSE_PORT").then(|| "not-a-port".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roundhouse.toml");

        let mut config = EngineConfig::testing();
        config.modes[0].strategy = HouseStrategy::OperatorOverride;
        ConfigLoader::save(&config, &path).unwrap();

        let loaded = ConfigLoader::new().with_path(&path).load_with(|_| None).unwrap();
        assert_eq!(loaded.modes, config.modes);
        assert_eq!(loaded.rng_seed, Some(7));
    }

    #[test]
    fn test_mode_patch() {
        let base = ModeConfig::discrete("60", 60);
        let patch = ModePatch {
            strategy: Some(HouseStrategy::UniformRandom),
            max_wager: Some(1_000),
            ..ModePatch::default()
        };
        let next = patch.apply(&base).unwrap();
        assert_eq!(next.strategy, HouseStrategy::UniformRandom);
        assert_eq!(next.max_wager, 1_000);
        assert_eq!(next.min_wager, base.min_wager);

        let bad = ModePatch {
            lock_secs: Some(60),
            ..ModePatch::default()
        };
        assert!(bad.apply(&base).is_err());
        assert!(ModePatch::default().is_empty());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [[modes]]
            id = "60"
            kind = "discrete"
            duration_secs = 60
            strategy = "uniform-random"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.modes.len(), 1);
        assert_eq!(config.modes[0].lock_secs, 5);
        assert_eq!(config.modes[0].max_wager, 50_000);
        assert_eq!(config.server.port, 8080);
    }
}
