use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use aria_events::Envelope;
use aria_topics as topics;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::capability::{CapabilityMap, CapabilityStatus};
use crate::config::{HubConfig, ScheduleConfig};
use crate::hub::Hub;
use crate::modules::Module;
use crate::tasks;

pub const MODULE_NAME: &str = "ml_engine";
pub const TASK_ID: &str = "ml_training_periodic";

/// A prediction the engine wants tracked in shadow mode.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProposedPrediction {
    pub context: Value,
    pub predicted_actions: Vec<Value>,
    pub confidence: f64,
    #[serde(default)]
    pub is_exploration: bool,
    #[serde(default)]
    pub window_seconds: Option<i64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TrainingReport {
    /// Held-out accuracy in [0, 1], when the engine measured one.
    pub backtest_accuracy: Option<f64>,
    pub targets: Vec<String>,
    pub samples: usize,
}

/// Model training and inference over the active capabilities.
#[async_trait]
pub trait PredictionEngine: Send + Sync {
    async fn train(&self, capabilities: &CapabilityMap) -> anyhow::Result<TrainingReport>;

    async fn predict(&self, capabilities: &CapabilityMap) -> anyhow::Result<Vec<ProposedPrediction>>;
}

/// Capabilities the engine may learn from: everything not archived.
fn active(mut caps: CapabilityMap) -> CapabilityMap {
    caps.retain(|_, c| c.status != CapabilityStatus::Archived);
    caps
}

pub struct MlModule {
    engine: Arc<dyn PredictionEngine>,
    interval_secs: u64,
    train_timeout: Duration,
    predict_timeout: Duration,
}

impl MlModule {
    pub fn new(config: &HubConfig, engine: Arc<dyn PredictionEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            interval_secs: config.schedule.training_secs,
            train_timeout: ScheduleConfig::every(config.schedule.training_timeout_secs),
            predict_timeout: ScheduleConfig::every(config.schedule.prediction_timeout_secs),
        })
    }

    /// Train, then report the backtest accuracy to the rollout pipeline.
    pub async fn train(&self, hub: &Hub) -> anyhow::Result<TrainingReport> {
        let caps = active(hub.capabilities().load(hub).await?);
        if caps.is_empty() {
            warn!("no capabilities available; skipping training");
            return Ok(TrainingReport::default());
        }
        let report = tokio::time::timeout(self.train_timeout, self.engine.train(&caps))
            .await
            .with_context(|| format!("training timed out after {:?}", self.train_timeout))??;
        if let Some(accuracy) = report.backtest_accuracy {
            hub.pipeline().record_backtest(accuracy).await?;
        }
        hub.set_cache(
            topics::CATEGORY_ML_TRAINING_METADATA,
            json!({
                "last_trained": aria_kernel::now_iso(),
                "samples": report.samples,
                "targets": report.targets,
                "capabilities_trained": caps.keys().collect::<Vec<_>>(),
                "backtest_accuracy": report.backtest_accuracy,
            }),
            None,
        )
        .await?;
        info!(targets = report.targets.len(), samples = report.samples, "model training complete");
        hub.emit(topics::TOPIC_MODELS_TRAINED, &report).await;
        Ok(report)
    }

    /// Ask the engine for predictions and record them in the shadow ledger.
    pub async fn predict(&self, hub: &Hub) -> anyhow::Result<Vec<String>> {
        let caps = active(hub.capabilities().load(hub).await?);
        let proposals = tokio::time::timeout(self.predict_timeout, self.engine.predict(&caps))
            .await
            .with_context(|| format!("prediction timed out after {:?}", self.predict_timeout))??;
        let mut ids = Vec::with_capacity(proposals.len());
        for p in proposals {
            let recorded = hub
                .shadow()
                .record_prediction(
                    p.context,
                    p.predicted_actions,
                    p.confidence,
                    p.is_exploration,
                    p.window_seconds,
                )
                .await?;
            ids.push(recorded.id);
        }
        let stage = hub.pipeline().current_stage().await?;
        hub.set_cache(
            topics::CATEGORY_ML_PREDICTIONS,
            json!({
                "timestamp": aria_kernel::fmt_ts(&Utc::now()),
                "prediction_ids": ids,
                "count": ids.len(),
                "stage": stage.as_str(),
            }),
            None,
        )
        .await?;
        info!(count = ids.len(), stage = stage.as_str(), "predictions recorded");
        Ok(ids)
    }
}

#[async_trait]
impl Module for MlModule {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    async fn initialize(self: Arc<Self>, hub: &Hub) -> anyhow::Result<()> {
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
                async move { me.train(&hub).await.map(|_| ()) }
            }),
        );
        Ok(())
    }

    async fn on_event(&self, hub: &Hub, event: &Envelope) -> anyhow::Result<()> {
        let capabilities_changed = event.kind == topics::TOPIC_CACHE_UPDATED
            && event.payload.get("category").and_then(Value::as_str)
                == Some(topics::CATEGORY_CAPABILITIES);
        if capabilities_changed {
            self.predict(hub).await?;
        }
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use crate::pipeline::Stage;
    use crate::test_support;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;
    use tokio::sync::Notify;

    struct Stub;

    #[async_trait]
    impl PredictionEngine for Stub {
        async fn train(&self, caps: &CapabilityMap) -> anyhow::Result<TrainingReport> {
            Ok(TrainingReport {
                backtest_accuracy: Some(0.9),
                targets: caps.keys().cloned().collect(),
                samples: 60,
            })
        }

        async fn predict(&self, _caps: &CapabilityMap) -> anyhow::Result<Vec<ProposedPrediction>> {
            Ok(vec![ProposedPrediction {
                context: json!({"type": "lighting"}),
                predicted_actions: vec![json!({"action": "light.turn_on"})],
                confidence: 0.7,
                is_exploration: false,
                window_seconds: None,
            }])
        }
    }

    async fn with_capability(hub: &Hub, status: CapabilityStatus) {
        hub.capabilities()
            .update(hub, |caps| {
                caps.insert(
                    "lighting".into(),
                    Capability {
                        status,
                        ..Capability::default()
                    },
                );
                Ok::<_, Infallible>(())
            })
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn training_feeds_the_backtest_gate() {
        let dir = tempdir().unwrap();
        let hub = test_support::hub_in(dir.path());
        with_capability(&hub, CapabilityStatus::Promoted).await;
        let module = MlModule::new(hub.config(), Arc::new(Stub));
        let report = module.train(&hub).await.unwrap();
        assert_eq!(report.targets, vec!["lighting".to_string()]);

        let eval = hub.pipeline().evaluate(Utc::now()).await.unwrap();
        assert_eq!(eval.to, Some(Stage::Shadow));
        assert!(hub
            .get_cache(topics::CATEGORY_ML_TRAINING_METADATA)
            .await
            .unwrap()
            .is_some());
    }

    struct Stalled;

    #[async_trait]
    impl PredictionEngine for Stalled {
        async fn train(&self, _caps: &CapabilityMap) -> anyhow::Result<TrainingReport> {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(TrainingReport::default())
        }

        async fn predict(&self, _caps: &CapabilityMap) -> anyhow::Result<Vec<ProposedPrediction>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_training_times_out() {
        let dir = tempdir().unwrap();
        let hub = test_support::hub_in(dir.path());
        with_capability(&hub, CapabilityStatus::Promoted).await;
        let module = MlModule::new(hub.config(), Arc::new(Stalled));
        let err = module.train(&hub).await.unwrap_err();
        assert!(format!("{err:#}").contains("timed out"));
        assert!(hub
            .get_cache(topics::CATEGORY_ML_TRAINING_METADATA)
            .await
            .unwrap()
            .is_none());
    }

    /// Stalls its first prediction past any timeout; later calls return at once.
    #[derive(Default)]
    struct StallFirst {
        stalled: AtomicBool,
        entered: Notify,
    }

    #[async_trait]
    impl PredictionEngine for StallFirst {
        async fn train(&self, _caps: &CapabilityMap) -> anyhow::Result<TrainingReport> {
            Ok(TrainingReport::default())
        }

        async fn predict(&self, _caps: &CapabilityMap) -> anyhow::Result<Vec<ProposedPrediction>> {
            if !self.stalled.swap(true, Ordering::SeqCst) {
                self.entered.notify_one();
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            }
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_prediction_times_out() {
        let dir = tempdir().unwrap();
        let hub = test_support::hub_in(dir.path());
        let module = MlModule::new(hub.config(), Arc::new(StallFirst::default()));
        let err = module.predict(&hub).await.unwrap_err();
        assert!(format!("{err:#}").contains("prediction timed out"));
        assert!(module.predict(&hub).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_prediction_does_not_block_lifecycle_writes() {
        let dir = tempdir().unwrap();
        let hub = test_support::hub_in(dir.path());
        let engine = Arc::new(StallFirst::default());
        hub.register_module(MlModule::new(hub.config(), engine.clone()))
            .unwrap();
        hub.initialize_all().await;

        let writer = {
            let hub = hub.clone();
            tokio::spawn(async move { with_capability(&hub, CapabilityStatus::Candidate).await })
        };
        engine.entered.notified().await;

        // the first write is still inside its cache_updated subscriber
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            hub.capabilities().promote(&hub, "lighting"),
        )
        .await
        .expect("write lock released before subscribers run")
        .unwrap()
        .unwrap();
        writer.await.unwrap();

        let caps = hub.capabilities().load(&hub).await.unwrap();
        assert_eq!(caps["lighting"].status, CapabilityStatus::Promoted);
        hub.shutdown(std::time::Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn training_skips_when_everything_is_archived() {
        let dir = tempdir().unwrap();
        let hub = test_support::hub_in(dir.path());
        with_capability(&hub, CapabilityStatus::Archived).await;
        let module = MlModule::new(hub.config(), Arc::new(Stub));
        assert_eq!(module.train(&hub).await.unwrap(), TrainingReport::default());
        assert_eq!(hub.pipeline().current_stage().await.unwrap(), Stage::Backtest);
    }

    #[tokio::test]
    async fn capability_updates_trigger_predictions() {
        let dir = tempdir().unwrap();
        let hub = test_support::hub_in(dir.path());
        hub.register_module(MlModule::new(hub.config(), Arc::new(Stub)))
            .unwrap();
        hub.initialize_all().await;
        with_capability(&hub, CapabilityStatus::Candidate).await;

        let recent = hub.shadow().recent(10, 0).await.unwrap();
        assert_eq!(recent.len(), 1);
        let cached = hub
            .get_cache(topics::CATEGORY_ML_PREDICTIONS)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.data["count"], 1);
        assert_eq!(cached.data["stage"], "backtest");
        hub.shutdown(std::time::Duration::from_millis(50)).await;
    }
}
