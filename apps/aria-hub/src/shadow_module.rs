use std::any::Any;
use std::sync::Arc;

use aria_events::Envelope;
use aria_topics as topics;
use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::config::{HubConfig, ScheduleConfig};
use crate::hub::Hub;
use crate::modules::Module;
use crate::tasks;

pub const MODULE_NAME: &str = "shadow_engine";
pub const SWEEP_TASK_ID: &str = "shadow_expiry_sweep";
pub const EVAL_TASK_ID: &str = "pipeline_evaluation";

/// Wires the shadow ledger and stage gate into the hub: observations arrive
/// as `state_changed` events, expiry and gate evaluation run on timers.
pub struct ShadowModule {
    sweep_secs: u64,
    eval_secs: u64,
}

impl ShadowModule {
    pub fn new(config: &HubConfig) -> Arc<Self> {
        Arc::new(Self {
            sweep_secs: config.schedule.shadow_sweep_secs,
            eval_secs: config.schedule.pipeline_eval_secs,
        })
    }
}

#[async_trait]
impl Module for ShadowModule {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    async fn initialize(self: Arc<Self>, hub: &Hub) -> anyhow::Result<()> {
        let sweep_hub = hub.clone();
        hub.schedule_task(
            MODULE_NAME,
            SWEEP_TASK_ID,
            ScheduleConfig::every(self.sweep_secs),
            true,
            tasks::action(move || {
                let hub = sweep_hub.clone();
                async move {
                    hub.shadow().expire_due(Utc::now()).await?;
                    Ok(())
                }
            }),
        );
        let eval_hub = hub.clone();
        hub.schedule_task(
            MODULE_NAME,
            EVAL_TASK_ID,
            ScheduleConfig::every(self.eval_secs),
            false,
            tasks::action(move || {
                let hub = eval_hub.clone();
                async move {
                    hub.pipeline().evaluate(Utc::now()).await?;
                    Ok(())
                }
            }),
        );
        Ok(())
    }

    async fn on_event(&self, hub: &Hub, event: &Envelope) -> anyhow::Result<()> {
        if event.kind != topics::TOPIC_STATE_CHANGED {
            return Ok(());
        }
        let resolved = hub.shadow().observe(&event.payload, Utc::now()).await?;
        if !resolved.is_empty() {
            debug!(count = resolved.len(), "observation resolved predictions");
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
    use crate::test_support;
    use aria_kernel::Outcome;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn state_changes_resolve_predictions() {
        let dir = tempdir().unwrap();
        let hub = test_support::hub_in(dir.path());
        hub.register_module(ShadowModule::new(hub.config())).unwrap();
        hub.initialize_all().await;
        assert!(hub.scheduler().contains(SWEEP_TASK_ID));
        assert!(hub.scheduler().contains(EVAL_TASK_ID));

        let p = hub
            .shadow()
            .record_prediction(
                json!({"area": "kitchen"}),
                vec![json!({"action": "light.turn_on"})],
                0.8,
                false,
                Some(600),
            )
            .await
            .unwrap();
        hub.emit(
            topics::TOPIC_STATE_CHANGED,
            &json!({"action": "light.turn_on", "area": "kitchen"}),
        )
        .await;
        let stored = hub.kernel().get_prediction_async(&p.id).await.unwrap().unwrap();
        assert_eq!(stored.outcome, Outcome::Correct);
        hub.shutdown(Duration::from_millis(50)).await;
    }
}
