// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use lok_common::{
    AllowedArea, DEFAULT_API_BASE_URL, DEFAULT_AUTH_BASE_URL, TroopAmount, expand_env_vars,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::retry::RetryPolicy;

pub type ConfigSnapshot = Arc<FarmerConfig>;

/// Immutable engine configuration, loaded from yaml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FarmerConfig {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub gather: FeatureTargets,
    #[serde(default)]
    pub attack: FeatureTargets,
    #[serde(default)]
    pub rally: RallyConfig,
    #[serde(default)]
    pub buffs: BuffConfig,
    #[serde(default)]
    pub skills: SkillConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub march_status: IntervalConfig,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    /// Jobs to run; empty runs every registered job.
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_radius")]
    pub radius: i64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_grace_batches")]
    pub grace_batches: usize,
    #[serde(default = "default_conflict_wait_ms")]
    pub conflict_wait_ms: u64,
    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: u64,
    #[serde(default = "default_pass_cooldown_secs")]
    pub pass_cooldown_secs: u64,
    /// Gather context limit; the backend march limit applies when unset.
    #[serde(default)]
    pub max_marches: Option<usize>,
    #[serde(default)]
    pub allowed_areas: Vec<AllowedArea>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            radius: default_radius(),
            batch_size: default_batch_size(),
            grace_batches: default_grace_batches(),
            conflict_wait_ms: default_conflict_wait_ms(),
            batch_timeout_secs: default_batch_timeout_secs(),
            pass_cooldown_secs: default_pass_cooldown_secs(),
            max_marches: None,
            allowed_areas: Vec::new(),
        }
    }
}

impl ScanConfig {
    pub fn conflict_wait(&self) -> Duration {
        Duration::from_millis(self.conflict_wait_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }

    pub fn pass_cooldown(&self) -> Duration {
        Duration::from_secs(self.pass_cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_zone_fresh_secs")]
    pub zone_fresh_secs: u64,
    #[serde(default = "default_global_fresh_secs")]
    pub global_fresh_secs: u64,
    #[serde(default = "default_max_zone_entries")]
    pub max_zone_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            zone_fresh_secs: default_zone_fresh_secs(),
            global_fresh_secs: default_global_fresh_secs(),
            max_zone_entries: default_max_zone_entries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_watchdog_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_watchdog_check_secs")]
    pub check_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_watchdog_timeout_secs(),
            check_secs: default_watchdog_check_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureTargets {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

impl FeatureTargets {
    pub fn target_for(&self, code: u32, level: u32) -> Option<&TargetConfig> {
        if !self.enabled {
            return None;
        }
        self.targets
            .iter()
            .find(|target| target.code == code && target.allows_level(level))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetConfig {
    pub code: u32,
    /// Allowed levels; empty allows every level.
    #[serde(default)]
    pub level: Vec<u32>,
    #[serde(default)]
    pub troops: Vec<TroopAmount>,
    #[serde(default)]
    pub max_distance: Option<f64>,
}

impl TargetConfig {
    pub fn allows_level(&self, level: u32) -> bool {
        self.level.is_empty() || self.level.contains(&level)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RallyConfig {
    #[serde(default)]
    pub join: RallyFeature,
    #[serde(default)]
    pub start: RallyFeature,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RallyFeature {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rally_num_march")]
    pub num_march: usize,
    #[serde(default = "default_rally_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub targets: Vec<RallyTarget>,
}

impl Default for RallyFeature {
    fn default() -> Self {
        Self {
            enabled: false,
            num_march: default_rally_num_march(),
            poll_interval_secs: default_rally_poll_secs(),
            targets: Vec::new(),
        }
    }
}

impl RallyFeature {
    pub fn band_for(&self, code: u32, level: u32) -> Option<&LevelRange> {
        self.targets
            .iter()
            .filter(|target| target.code == code)
            .flat_map(|target| target.level_ranges.iter())
            .find(|band| (band.min_level..=band.max_level).contains(&level))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RallyTarget {
    pub code: u32,
    #[serde(default)]
    pub level_ranges: Vec<LevelRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LevelRange {
    #[serde(default)]
    pub min_level: u32,
    #[serde(default = "default_max_level")]
    pub max_level: u32,
    #[serde(default)]
    pub troops: Vec<TroopAmount>,
    #[serde(default)]
    pub rally_time: Option<u32>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuffConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_scheduler_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_buff_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_buff_max_remaining_minutes")]
    pub max_remaining_minutes: i64,
    #[serde(default)]
    pub items: Vec<BuffItemConfig>,
}

impl Default for BuffConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_scheduler_interval_secs(),
            cooldown_secs: default_buff_cooldown_secs(),
            max_remaining_minutes: default_buff_max_remaining_minutes(),
            items: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuffItemConfig {
    pub item_code: u32,
    #[serde(default)]
    pub min_duration_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_scheduler_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub codes: Vec<u32>,
}

impl Default for SkillConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_scheduler_interval_secs(),
            codes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_retry_delay_min_ms")]
    pub retry_delay_min_ms: u64,
    #[serde(default = "default_retry_delay_max_ms")]
    pub retry_delay_max_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            retry_delay_min_ms: default_retry_delay_min_ms(),
            retry_delay_max_ms: default_retry_delay_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub channel: RetryPolicy,
    #[serde(default = "RetryPolicy::transport")]
    pub transport: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            channel: RetryPolicy::default(),
            transport: RetryPolicy::transport(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalConfig {
    #[serde(default = "default_march_status_secs")]
    pub interval_secs: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_march_status_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    #[serde(default = "default_scheduler_interval_secs")]
    pub interval_secs: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_scheduler_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default)]
    pub monitor: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_radius() -> i64 {
    8
}

fn default_batch_size() -> usize {
    9
}

fn default_grace_batches() -> usize {
    7
}

fn default_conflict_wait_ms() -> u64 {
    3_500
}

fn default_batch_timeout_secs() -> u64 {
    60
}

fn default_pass_cooldown_secs() -> u64 {
    16
}

fn default_zone_fresh_secs() -> u64 {
    60
}

fn default_global_fresh_secs() -> u64 {
    300
}

fn default_max_zone_entries() -> usize {
    10
}

fn default_watchdog_timeout_secs() -> u64 {
    300
}

fn default_watchdog_check_secs() -> u64 {
    60
}

fn default_rally_num_march() -> usize {
    8
}

fn default_rally_poll_secs() -> u64 {
    30
}

fn default_max_level() -> u32 {
    u32::MAX
}

fn default_scheduler_interval_secs() -> u64 {
    600
}

fn default_buff_cooldown_secs() -> u64 {
    1_800
}

fn default_buff_max_remaining_minutes() -> i64 {
    480
}

fn default_retry_delay_min_ms() -> u64 {
    3_000
}

fn default_retry_delay_max_ms() -> u64 {
    6_000
}

fn default_march_status_secs() -> u64 {
    30
}

/// Publishes whole replacement snapshots; readers never observe a partial edit.
#[derive(Clone)]
pub struct ConfigStore {
    tx: Arc<watch::Sender<ConfigSnapshot>>,
}

impl ConfigStore {
    pub fn new(config: FarmerConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> ConfigSnapshot {
        self.tx.borrow().clone()
    }

    pub fn replace(&self, config: FarmerConfig) {
        self.tx.send_replace(Arc::new(config));
    }

    /// Swaps in the file's contents; a bad file leaves the current snapshot live.
    pub fn reload_from(&self, path: &Path) -> anyhow::Result<ConfigSnapshot> {
        let config = read_farmer_config(path)?;
        self.replace(config);
        Ok(self.current())
    }
}

pub fn farmer_config_path() -> PathBuf {
    std::env::var("FARMER_CONFIG_PATH")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "config.yaml".to_string())
        .into()
}

pub fn load_farmer_config() -> FarmerConfig {
    let path = farmer_config_path();
    match read_farmer_config(&path) {
        Ok(config) => config,
        Err(error) => {
            warn!(
                path = %path.display(),
                error = %format!("{error:#}"),
                "failed to load farmer config; using defaults"
            );
            FarmerConfig::default()
        }
    }
}

pub fn read_farmer_config(path: &Path) -> anyhow::Result<FarmerConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config = parse_farmer_config(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    info!(
        path = %path.display(),
        gather_targets = config.gather.targets.len(),
        attack_targets = config.attack.targets.len(),
        rally_join_targets = config.rally.join.targets.len(),
        rally_start_targets = config.rally.start.targets.len(),
        jobs = config.jobs.len(),
        "loaded farmer config"
    );
    Ok(config)
}

pub fn parse_farmer_config(raw: &str) -> Result<FarmerConfig, serde_yaml::Error> {
    serde_yaml::from_str::<FarmerConfig>(&expand_env_vars(raw))
}

/// Process-level settings read from the environment.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub api_base_url: String,
    pub auth_base_url: String,
    pub email: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub token_dir: PathBuf,
    pub bind_addr: String,
    pub notify_webhook_url: Option<String>,
}

impl ServiceSettings {
    pub fn from_env() -> Self {
        Self {
            api_base_url: std::env::var("LOK_API_BASE_URL")
                .ok()
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            auth_base_url: std::env::var("LOK_AUTH_BASE_URL")
                .ok()
                .unwrap_or_else(|| DEFAULT_AUTH_BASE_URL.to_string()),
            email: normalize_optional_string(std::env::var("LOK_EMAIL").ok()),
            password: normalize_optional_string(std::env::var("LOK_PASSWORD").ok()),
            token: normalize_optional_string(std::env::var("LOK_TOKEN").ok()),
            token_dir: PathBuf::from(
                std::env::var("LOK_TOKEN_DIR")
                    .ok()
                    .unwrap_or_else(|| "data".to_string()),
            ),
            bind_addr: std::env::var("FARMER_SERVICE_BIND")
                .ok()
                .unwrap_or_else(|| "0.0.0.0:8095".to_string()),
            notify_webhook_url: normalize_optional_string(
                std::env::var("FARMER_NOTIFY_WEBHOOK_URL").ok(),
            ),
        }
    }
}

fn normalize_optional_string(value: Option<String>) -> Option<String> {
    value
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_yields_documented_defaults() {
        let config = parse_farmer_config("{}").unwrap();
        assert_eq!(config.scan.batch_size, 9);
        assert_eq!(config.scan.grace_batches, 7);
        assert_eq!(config.scan.conflict_wait(), Duration::from_millis(3_500));
        assert_eq!(config.cache.zone_fresh_secs, 60);
        assert_eq!(config.cache.global_fresh_secs, 300);
        assert_eq!(config.rally.join.num_march, 8);
        assert_eq!(config.watchdog.timeout_secs, 300);
        assert_eq!(config.retry.transport.max_attempts, 2);
        assert!(config.jobs.is_empty());
    }

    #[test]
    fn targets_and_tunables_parse_from_yaml() {
        let raw = r#"
scan:
  conflict_wait_ms: 1200
  grace_batches: 5
  max_marches: 3
  allowed_areas:
    - { min_x: 100, max_x: 400, min_y: 100, max_y: 400 }
gather:
  enabled: true
  targets:
    - code: 20100105
      level: [1, 2, 3]
      troops:
        - { code: 50100305, amount: 1000 }
rally:
  join:
    enabled: true
    num_march: 4
    targets:
      - code: 20700506
        level_ranges:
          - { min_level: 1, max_level: 3, troops: [{ code: 50100306, amount: 500 }] }
jobs:
  - name: field_scan
  - name: buff_management
    enabled: false
"#;
        let config = parse_farmer_config(raw).unwrap();
        assert_eq!(config.scan.conflict_wait_ms, 1200);
        assert_eq!(config.scan.grace_batches, 5);
        assert_eq!(config.scan.max_marches, Some(3));
        assert_eq!(config.scan.allowed_areas[0].max_x, 400);
        let target = config.gather.target_for(20100105, 2).unwrap();
        assert_eq!(target.troops[0].amount, 1000);
        assert!(config.gather.target_for(20100105, 4).is_none());
        assert!(config.attack.target_for(20100105, 2).is_none());
        let band = config.rally.join.band_for(20700506, 2).unwrap();
        assert_eq!(band.troops[0].code, 50100306);
        assert!(config.rally.join.band_for(20700506, 4).is_none());
        assert_eq!(config.jobs.len(), 2);
        assert!(!config.jobs[1].enabled);
    }

    #[test]
    fn store_replaces_snapshots_without_mutating_old_ones() {
        let store = ConfigStore::new(FarmerConfig::default());
        let before = store.current();
        let mut next = (*before).clone();
        next.scan.enabled = false;
        store.replace(next);
        assert!(before.scan.enabled);
        assert!(!store.current().scan.enabled);
    }

    #[test]
    fn reload_keeps_current_snapshot_when_file_is_bad() {
        let path = std::env::temp_dir().join(format!("farmer-{}.yaml", uuid::Uuid::new_v4()));
        let store = ConfigStore::new(FarmerConfig::default());

        std::fs::write(&path, "scan:\n  enabled: false\n").unwrap();
        let reloaded = store.reload_from(&path).unwrap();
        assert!(!reloaded.scan.enabled);

        std::fs::write(&path, "scan: [not, a, map]\n").unwrap();
        assert!(store.reload_from(&path).is_err());
        assert!(!store.current().scan.enabled);

        std::fs::remove_file(&path).unwrap();
        assert!(store.reload_from(&path).is_err());
    }
}
