use std::any::Any;
use std::convert::Infallible;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use aria_topics as topics;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::capability::{decode_map, CapabilityMap, CapabilitySource, CapabilityStatus};
use crate::config::{DiscoveryConfig, HubConfig, ScheduleConfig};
use crate::hub::Hub;
use crate::modules::Module;
use crate::tasks;

pub const MODULE_NAME: &str = "discovery";
pub const TASK_ID: &str = "discovery_periodic";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to start discovery command: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("discovery timed out after {0:?}")]
    Timeout(Duration),
    #[error("discovery failed ({status}): {stderr}")]
    Failed { status: String, stderr: String },
    #[error("failed to parse discovery output: {0}")]
    Parse(#[from] serde_json::Error),
}

impl DiscoveryError {
    /// Failures worth retrying at the client boundary.
    pub fn is_transient(&self) -> bool {
        matches!(self, DiscoveryError::Failed { .. })
    }
}

/// Source of the home's entity, device, area and capability registry.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    async fn discover(&self) -> Result<Value, DiscoveryError>;
}

/// Runs an external program that prints the discovery payload as JSON.
pub struct CommandDiscoveryClient {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    ha_url: Option<String>,
    ha_token: Option<String>,
}

impl CommandDiscoveryClient {
    pub fn from_config(cfg: &DiscoveryConfig) -> Option<Self> {
        let program = cfg.command.clone()?;
        Some(Self {
            program,
            args: cfg.args.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs.max(1)),
            ha_url: cfg.ha_url.clone(),
            ha_token: cfg.ha_token.clone(),
        })
    }
}

#[async_trait]
impl DiscoveryClient for CommandDiscoveryClient {
    async fn discover(&self) -> Result<Value, DiscoveryError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(url) = &self.ha_url {
            cmd.env("HA_URL", url);
        }
        if let Some(token) = &self.ha_token {
            cmd.env("HA_TOKEN", token);
        }
        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(res) => res.map_err(DiscoveryError::Spawn)?,
            Err(_) => return Err(DiscoveryError::Timeout(self.timeout)),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(DiscoveryError::Failed {
                status: output.status.to_string(),
                stderr: if stderr.is_empty() {
                    "Unknown error".into()
                } else {
                    stderr
                },
            });
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

/// Retries transient failures with exponential backoff.
pub struct RetryingClient {
    inner: Arc<dyn DiscoveryClient>,
    attempts: u32,
    base: Duration,
}

impl RetryingClient {
    pub fn new(inner: Arc<dyn DiscoveryClient>, attempts: u32, base: Duration) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
            base,
        }
    }
}

#[async_trait]
impl DiscoveryClient for RetryingClient {
    async fn discover(&self) -> Result<Value, DiscoveryError> {
        let mut attempt = 1;
        loop {
            match self.inner.discover().await {
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    let delay = self.base.saturating_mul(1 << (attempt - 1).min(16));
                    warn!(attempt, ?delay, error = %err, "discovery failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn object_len(v: &Value) -> usize {
    match v {
        Value::Object(m) => m.len(),
        Value::Array(a) => a.len(),
        _ => 0,
    }
}

fn is_empty(v: &Value) -> bool {
    v.is_null() || object_len(v) == 0
}

/// Merge discovered capabilities as seeds. Existing entries keep their
/// lifecycle fields; only the descriptive ones are refreshed.
fn merge_seeds(caps: &mut CapabilityMap, discovered: &Value) -> usize {
    let stamp = aria_kernel::fmt_ts(&Utc::now());
    let incoming = decode_map(discovered);
    let count = incoming.len();
    for (name, fresh) in incoming {
        match caps.get_mut(&name) {
            Some(existing) => {
                existing.entities = fresh.entities;
                existing.extra.extend(fresh.extra);
                existing.last_seen = Some(stamp.clone());
            }
            None => {
                let mut seed = fresh;
                seed.status = CapabilityStatus::Promoted;
                seed.source = CapabilitySource::Seed;
                seed.promote_streak = 0;
                seed.archive_streak = 0;
                seed.promoted_at = Some(stamp.clone());
                seed.archived_at = None;
                seed.first_seen = Some(stamp.clone());
                seed.last_seen = Some(stamp.clone());
                caps.insert(name, seed);
            }
        }
    }
    count
}

/// Imports the home registry on startup and on a schedule.
pub struct DiscoveryModule {
    client: Arc<dyn DiscoveryClient>,
    interval_secs: u64,
    last: RwLock<Option<Value>>,
}

impl DiscoveryModule {
    pub fn new(config: &HubConfig, client: Arc<dyn DiscoveryClient>) -> Arc<Self> {
        Arc::new(Self {
            client,
            interval_secs: config.schedule.discovery_secs,
            last: RwLock::new(None),
        })
    }

    /// Module over the configured command, or `None` when no command is set.
    pub fn from_config(config: &HubConfig) -> Option<Arc<Self>> {
        let cmd = CommandDiscoveryClient::from_config(&config.discovery)?;
        let client = RetryingClient::new(
            Arc::new(cmd),
            config.discovery.attempts,
            Duration::from_millis(config.discovery.backoff_base_ms),
        );
        Some(Self::new(config, Arc::new(client)))
    }

    /// Metadata of the last successful run.
    pub fn last_metadata(&self) -> Option<Value> {
        self.last.read().clone()
    }

    pub async fn run(&self, hub: &Hub) -> anyhow::Result<Value> {
        info!("running discovery");
        let payload = self.client.discover().await?;
        let metadata = self.store(hub, &payload).await?;
        info!(
            entities = metadata["entity_count"].as_i64().unwrap_or(0),
            capabilities = metadata["capability_count"].as_i64().unwrap_or(0),
            "discovery complete"
        );
        *self.last.write() = Some(metadata.clone());
        hub.emit(topics::TOPIC_DISCOVERY_COMPLETED, &metadata).await;
        Ok(metadata)
    }

    async fn store(&self, hub: &Hub, payload: &Value) -> anyhow::Result<Value> {
        for category in [
            topics::CATEGORY_ENTITIES,
            topics::CATEGORY_DEVICES,
            topics::CATEGORY_AREAS,
        ] {
            let data = payload.get(category).cloned().unwrap_or(Value::Null);
            if is_empty(&data) {
                continue;
            }
            let meta = json!({"count": object_len(&data), "source": "discovery"});
            hub.set_cache(category, data, Some(meta)).await?;
        }

        let discovered = payload
            .get(topics::CATEGORY_CAPABILITIES)
            .cloned()
            .unwrap_or(Value::Null);
        let mut capability_count = 0;
        if !is_empty(&discovered) {
            let merged = hub
                .capabilities()
                .update(hub, |caps| Ok::<_, Infallible>(merge_seeds(caps, &discovered)))
                .await?;
            capability_count = match merged {
                Ok(n) => n,
                Err(never) => match never {},
            };
        }

        let metadata = json!({
            "entity_count": payload.get("entity_count").cloned().unwrap_or(json!(0)),
            "device_count": payload.get("device_count").cloned().unwrap_or(json!(0)),
            "area_count": payload.get("area_count").cloned().unwrap_or(json!(0)),
            "capability_count": capability_count,
            "timestamp": payload.get("timestamp").cloned().unwrap_or(Value::Null),
            "ha_version": payload.get("ha_version").cloned().unwrap_or(Value::Null),
        });
        hub.set_cache(topics::CATEGORY_DISCOVERY_METADATA, metadata.clone(), None)
            .await?;
        Ok(metadata)
    }
}

#[async_trait]
impl Module for DiscoveryModule {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    async fn initialize(self: Arc<Self>, hub: &Hub) -> anyhow::Result<()> {
        if let Err(err) = self.run(hub).await {
            error!(error = %format!("{err:#}"), "initial discovery failed");
        }
        let me = self.clone();
        let task_hub = hub.clone();
        hub.schedule_task(
            MODULE_NAME,
            TASK_ID,
            ScheduleConfig::every(self.interval_secs),
            false,
            tasks::action(move || {
                let me = me.clone();
                let hub = task_hub.clone();
                async move { me.run(&hub).await.map(|_| ()) }
            }),
        );
        info!(interval_secs = self.interval_secs, "scheduled periodic discovery");
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
