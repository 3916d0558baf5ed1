use aria_events::Bus;
use aria_kernel::{Kernel, PipelineRow, StoreError};
use aria_topics as topics;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("prediction not found: {0}")]
    UnknownPrediction(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Backtest,
    Shadow,
    SuggestAndWait,
    AutoPromote,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Backtest => "backtest",
            Stage::Shadow => "shadow",
            Stage::SuggestAndWait => "suggest_and_wait",
            Stage::AutoPromote => "auto_promote",
        }
    }

    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Backtest => Some(Stage::Shadow),
            Stage::Shadow => Some(Stage::SuggestAndWait),
            Stage::SuggestAndWait => Some(Stage::AutoPromote),
            Stage::AutoPromote => None,
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "backtest" => Ok(Stage::Backtest),
            "shadow" => Ok(Stage::Shadow),
            "suggest_and_wait" | "suggest" => Ok(Stage::SuggestAndWait),
            "auto_promote" | "autonomous" => Ok(Stage::AutoPromote),
            _ => Err(()),
        }
    }
}

/// Thresholds and windows for stage advancement. A gate passes only when the
/// metric strictly exceeds its threshold and enough samples back it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineGates {
    pub backtest_accuracy_min: f64,
    pub shadow_accuracy_min: f64,
    pub shadow_window_days: i64,
    pub shadow_min_resolved: i64,
    pub approval_rate_min: f64,
    pub approval_window_days: i64,
    pub approval_min_decisions: i64,
}

impl Default for PipelineGates {
    fn default() -> Self {
        Self {
            backtest_accuracy_min: 0.70,
            shadow_accuracy_min: 0.60,
            shadow_window_days: 7,
            shadow_min_resolved: 50,
            approval_rate_min: 0.70,
            approval_window_days: 14,
            approval_min_decisions: 20,
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct GateStatus {
    pub metric: &'static str,
    pub value: Option<f64>,
    pub threshold: f64,
    pub samples: i64,
    pub min_samples: i64,
    pub passed: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Evaluation {
    pub from: Stage,
    pub to: Option<Stage>,
    pub gate: Option<GateStatus>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PipelineState {
    pub current_stage: Stage,
    pub stage_entered_at: String,
    pub backtest_accuracy: Option<f64>,
    pub shadow_accuracy_7d: Option<f64>,
    pub suggest_approval_rate_14d: Option<f64>,
    pub autonomous_contexts: Option<Value>,
    pub updated_at: String,
}

impl From<&PipelineRow> for PipelineState {
    fn from(row: &PipelineRow) -> Self {
        let current_stage = row.current_stage.parse().unwrap_or_else(|_| {
            warn!(stage = %row.current_stage, "unknown persisted stage; reporting backtest");
            Stage::Backtest
        });
        Self {
            current_stage,
            stage_entered_at: aria_kernel::fmt_ts(&row.stage_entered_at),
            backtest_accuracy: row.backtest_accuracy,
            shadow_accuracy_7d: row.shadow_accuracy_7d,
            suggest_approval_rate_14d: row.suggest_approval_rate_14d,
            autonomous_contexts: row.autonomous_contexts.clone(),
            updated_at: aria_kernel::fmt_ts(&row.updated_at),
        }
    }
}

fn fresh_row(now: &DateTime<Utc>) -> PipelineRow {
    PipelineRow {
        current_stage: Stage::Backtest.as_str().to_string(),
        stage_entered_at: *now,
        backtest_accuracy: None,
        shadow_accuracy_7d: None,
        suggest_approval_rate_14d: None,
        autonomous_contexts: None,
        updated_at: *now,
    }
}

/// Forward-only staged rollout of predictions.
pub struct Pipeline {
    kernel: Kernel,
    bus: Bus,
    gates: PipelineGates,
    lock: Mutex<()>,
}

impl Pipeline {
    pub fn new(kernel: Kernel, bus: Bus, gates: PipelineGates) -> Self {
        Self {
            kernel,
            bus,
            gates,
            lock: Mutex::new(()),
        }
    }

    pub fn gates(&self) -> &PipelineGates {
        &self.gates
    }

    pub async fn state(&self) -> Result<Option<PipelineState>, StoreError> {
        Ok(self
            .kernel
            .get_pipeline_state_async()
            .await?
            .as_ref()
            .map(PipelineState::from))
    }

    pub async fn current_stage(&self) -> Result<Stage, StoreError> {
        Ok(self
            .state()
            .await?
            .map(|s| s.current_stage)
            .unwrap_or_default())
    }

    async fn load_or_init(&self, now: &DateTime<Utc>) -> Result<PipelineRow, StoreError> {
        Ok(self
            .kernel
            .get_pipeline_state_async()
            .await?
            .unwrap_or_else(|| fresh_row(now)))
    }

    pub async fn record_backtest(&self, accuracy: f64) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let now = Utc::now();
        let mut row = self.load_or_init(&now).await?;
        row.backtest_accuracy = Some(accuracy.clamp(0.0, 1.0));
        row.updated_at = now;
        self.kernel.put_pipeline_state_async(row).await
    }

    /// Record a human decision on a suggested prediction. Each prediction
    /// counts once toward the approval rate; a repeat decision replaces the
    /// earlier one. Returns whether this was the prediction's first decision.
    pub async fn record_suggestion_decision(
        &self,
        prediction_id: &str,
        approved: bool,
    ) -> Result<bool, DecisionError> {
        let first = self
            .kernel
            .record_decision_async(prediction_id, approved, Utc::now())
            .await?
            .ok_or_else(|| DecisionError::UnknownPrediction(prediction_id.to_string()))?;
        let kind = if approved {
            topics::TOPIC_SUGGESTION_APPROVED
        } else {
            topics::TOPIC_SUGGESTION_REJECTED
        };
        let payload = json!({"prediction_id": prediction_id, "first_decision": first});
        self.kernel
            .log_event_async(kind, None, Some(payload.clone()), None)
            .await?;
        self.bus.publish(kind, &payload);
        Ok(first)
    }

    async fn approval_rate(&self, since: DateTime<Utc>) -> Result<(Option<f64>, i64), StoreError> {
        let (approved, total) = self.kernel.decision_counts_since_async(since).await?;
        let rate = (total > 0).then(|| approved as f64 / total as f64);
        Ok((rate, total))
    }

    fn gate(metric: &'static str, value: Option<f64>, threshold: f64, samples: i64, min: i64) -> GateStatus {
        GateStatus {
            metric,
            value,
            threshold,
            samples,
            min_samples: min,
            passed: samples >= min && value.is_some_and(|v| v > threshold),
        }
    }

    /// Refresh rolling metrics, persist them, and advance at most one stage
    /// when the current stage's gate passes.
    pub async fn evaluate(&self, now: DateTime<Utc>) -> Result<Evaluation, StoreError> {
        let _guard = self.lock.lock().await;
        let mut row = self.load_or_init(&now).await?;
        let from: Stage = row.current_stage.parse().unwrap_or_default();

        let shadow_since = now - Duration::days(self.gates.shadow_window_days.max(1));
        let stats = self.kernel.accuracy_stats_async(Some(shadow_since)).await?;
        row.shadow_accuracy_7d = (stats.total_resolved > 0).then_some(stats.overall_accuracy);
        let approval_since = now - Duration::days(self.gates.approval_window_days.max(1));
        let (approval, decisions) = self.approval_rate(approval_since).await?;
        row.suggest_approval_rate_14d = approval;

        let g = &self.gates;
        let gate = match from {
            Stage::Backtest => Some(Self::gate(
                "backtest_accuracy",
                row.backtest_accuracy,
                g.backtest_accuracy_min,
                i64::from(row.backtest_accuracy.is_some()),
                1,
            )),
            Stage::Shadow => Some(Self::gate(
                "shadow_accuracy_7d",
                row.shadow_accuracy_7d,
                g.shadow_accuracy_min,
                stats.total_resolved,
                g.shadow_min_resolved,
            )),
            Stage::SuggestAndWait => Some(Self::gate(
                "suggest_approval_rate_14d",
                approval,
                g.approval_rate_min,
                decisions,
                g.approval_min_decisions,
            )),
            Stage::AutoPromote => None,
        };

        let to = match &gate {
            Some(status) if status.passed => from.next(),
            _ => None,
        };
        if let Some(next) = to {
            row.current_stage = next.as_str().to_string();
            row.stage_entered_at = now;
        }
        row.updated_at = now;
        self.kernel.put_pipeline_state_async(row).await?;

        if let Some(next) = to {
            info!(from = from.as_str(), to = next.as_str(), "pipeline stage advanced");
            metrics::counter!("aria_pipeline_advances_total", "to" => next.as_str()).increment(1);
            self.bus.publish(
                topics::TOPIC_PIPELINE_STAGE_ADVANCED,
                &json!({"from": from.as_str(), "to": next.as_str(), "gate": gate}),
            );
        }
        Ok(Evaluation { from, to, gate })
    }

    /// Manual override; the only path that can move the stage backwards.
    pub async fn force_stage(&self, stage: Stage, now: DateTime<Utc>) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut row = self.load_or_init(&now).await?;
        let from = row.current_stage.clone();
        row.current_stage = stage.as_str().to_string();
        row.stage_entered_at = now;
        row.updated_at = now;
        self.kernel.put_pipeline_state_async(row).await?;
        warn!(from = %from, to = stage.as_str(), "pipeline stage forced");
        self.bus.publish(
            topics::TOPIC_PIPELINE_STAGE_FORCED,
            &json!({"from": from, "to": stage.as_str()}),
        );
        Ok(())
    }

    /// Gate table for the query surface: one entry per gated stage.
    pub fn gates_view(&self, state: &PipelineState) -> Value {
        let g = &self.gates;
        json!({
            "backtest": {
                "metric": "backtest_accuracy",
                "threshold": g.backtest_accuracy_min,
                "value": state.backtest_accuracy,
            },
            "shadow": {
                "metric": "shadow_accuracy_7d",
                "threshold": g.shadow_accuracy_min,
                "window_days": g.shadow_window_days,
                "min_resolved": g.shadow_min_resolved,
                "value": state.shadow_accuracy_7d,
            },
            "suggest_and_wait": {
                "metric": "suggest_approval_rate_14d",
                "threshold": g.approval_rate_min,
                "window_days": g.approval_window_days,
                "min_decisions": g.approval_min_decisions,
                "value": state.suggest_approval_rate_14d,
            },
        })
    }
}
