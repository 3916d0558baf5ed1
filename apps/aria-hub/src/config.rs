use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::capability::DiscoverySettings;
use crate::pipeline::PipelineGates;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub schedule: ScheduleConfig,
    pub discovery: DiscoveryConfig,
    pub organic: OrganicConfig,
    pub pipeline: PipelineGates,
    pub shadow: ShadowConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            shutdown_grace_secs: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub cache_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let base = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            cache_dir: base.join("ha-logs").join("intelligence").join("cache"),
        }
    }
}

/// Intervals for the recurring hub tasks, in seconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub discovery_secs: u64,
    pub organic_discovery_secs: u64,
    pub training_secs: u64,
    pub shadow_sweep_secs: u64,
    pub pipeline_eval_secs: u64,
    /// Upper bound on one training run.
    pub training_timeout_secs: u64,
    /// Upper bound on one prediction pass.
    pub prediction_timeout_secs: u64,
    /// Upper bound on one clustering pass during organic discovery.
    pub clustering_timeout_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            discovery_secs: 24 * 3600,
            organic_discovery_secs: 24 * 3600,
            training_secs: 7 * 24 * 3600,
            shadow_sweep_secs: 60,
            pipeline_eval_secs: 3600,
            training_timeout_secs: 120,
            prediction_timeout_secs: 30,
            clustering_timeout_secs: 120,
        }
    }
}

impl ScheduleConfig {
    pub fn every(secs: u64) -> Duration {
        Duration::from_secs(secs.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Program printing the discovery payload as JSON on stdout. Discovery is
    /// not registered when unset.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub attempts: u32,
    pub backoff_base_ms: u64,
    pub ha_url: Option<String>,
    #[serde(skip_serializing)]
    pub ha_token: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: 120,
            attempts: 3,
            backoff_base_ms: 1000,
            ha_url: None,
            ha_token: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrganicConfig {
    pub settings: DiscoverySettings,
    pub seed_match_threshold: f64,
    pub history_limit: usize,
    pub min_cluster_size: usize,
}

impl Default for OrganicConfig {
    fn default() -> Self {
        Self {
            settings: DiscoverySettings::default(),
            seed_match_threshold: aria_heuristics::MATCH_THRESHOLD,
            history_limit: 90,
            min_cluster_size: 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    pub default_window_seconds: i64,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            default_window_seconds: 300,
        }
    }
}

impl HubConfig {
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Overlay environment overrides. `lookup` is `std::env::var` in
    /// production; tests pass a map.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("ARIA_HOST") {
            self.server.host = v;
        }
        if let Some(v) = get("ARIA_PORT") {
            match v.trim().parse() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!(value = %v, "ignoring invalid ARIA_PORT"),
            }
        }
        if let Some(v) = get("ARIA_SHUTDOWN_GRACE_SECS") {
            match v.trim().parse() {
                Ok(secs) => self.server.shutdown_grace_secs = secs,
                Err(_) => warn!(value = %v, "ignoring invalid ARIA_SHUTDOWN_GRACE_SECS"),
            }
        }
        if let Some(v) = get("ARIA_CACHE_DIR") {
            self.store.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = get("ARIA_DISCOVERY_CMD") {
            self.discovery.command = Some(v);
        }
        if let Some(v) = get("HA_URL") {
            self.discovery.ha_url = Some(v);
        }
        if let Some(v) = get("HA_TOKEN") {
            self.discovery.ha_token = Some(v);
        }
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .server
            .host
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid host {}: {e}", self.server.host))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_grace_secs)
    }
}

fn discovered_config_path() -> (Option<PathBuf>, &'static str) {
    if let Ok(explicit) = std::env::var("ARIA_CONFIG") {
        if !explicit.trim().is_empty() {
            return (Some(PathBuf::from(explicit)), "env");
        }
    }
    let default = PathBuf::from("configs/hub.toml");
    (default.exists().then_some(default), "search")
}

/// Load the hub configuration: file (if any), then env overrides.
pub fn load() -> HubConfig {
    let mut cfg = HubConfig::default();
    match discovered_config_path() {
        (Some(path), source) => match std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| HubConfig::from_toml_str(&raw))
        {
            Ok(loaded) => {
                info!(path = %path.display(), source, "loaded hub config");
                cfg = loaded;
            }
            Err(err) => {
                warn!(path = %path.display(), source, "failed to load hub config: {err:#}")
            }
        },
        (None, _) => info!("no hub config file discovered; using defaults"),
    }
    cfg.apply_env(|key| std::env::var(key).ok());
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::AutonomyMode;
    use std::collections::HashMap;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = HubConfig::from_toml_str(
            r#"
            [server]
            port = 9100

            [organic.settings]
            autonomy_mode = "auto_promote"

            [pipeline]
            shadow_accuracy_min = 0.8
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.organic.settings.autonomy_mode, AutonomyMode::AutoPromote);
        assert_eq!(cfg.organic.settings.promote_threshold, 50);
        assert_eq!(cfg.pipeline.shadow_accuracy_min, 0.8);
        assert_eq!(cfg.pipeline.shadow_window_days, 7);
        assert_eq!(cfg.discovery.timeout_secs, 120);
    }

    #[test]
    fn example_config_matches_defaults() {
        let cfg = HubConfig::from_toml_str(include_str!("../../../configs/hub.example.toml"))
            .unwrap();
        let defaults = HubConfig::default();
        assert_eq!(cfg.organic.settings, defaults.organic.settings);
        assert_eq!(cfg.pipeline, defaults.pipeline);
        assert_eq!(cfg.schedule.training_secs, defaults.schedule.training_secs);
        assert_eq!(
            cfg.schedule.prediction_timeout_secs,
            defaults.schedule.prediction_timeout_secs
        );
        assert_eq!(
            cfg.schedule.clustering_timeout_secs,
            defaults.schedule.clustering_timeout_secs
        );
        assert_eq!(cfg.discovery.command, None);
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("ARIA_PORT", "8123"),
            ("ARIA_HOST", "0.0.0.0"),
            ("ARIA_CACHE_DIR", "/tmp/aria"),
            ("HA_URL", "http://ha.local:8123"),
            ("HA_TOKEN", "secret"),
            ("ARIA_SHUTDOWN_GRACE_SECS", "nope"),
        ]
        .into_iter()
        .collect();
        let mut cfg = HubConfig::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.bind_addr().unwrap().to_string(), "0.0.0.0:8123");
        assert_eq!(cfg.store.cache_dir, PathBuf::from("/tmp/aria"));
        assert_eq!(cfg.discovery.ha_url.as_deref(), Some("http://ha.local:8123"));
        assert_eq!(cfg.server.shutdown_grace_secs, 5);
        let rendered = serde_json::to_string(&cfg).unwrap();
        assert!(!rendered.contains("secret"));
    }
}
