use std::cmp::Ordering;

use aria_events::Bus;
use aria_kernel::{AccuracyStats, Kernel, Outcome, Prediction, StoreError};
use aria_topics as topics;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

/// Candidate pool size when ranking disagreements.
pub const DISAGREEMENT_POOL: i64 = 200;

/// Keys naming the action itself; the first one present identifies it.
const ACTION_KEYS: [&str; 3] = ["action", "service", "event"];
/// Context keys that scope a prediction to part of the home.
const SCOPE_KEYS: [&str; 3] = ["entity_id", "area", "room"];

#[derive(Debug, Error)]
pub enum ShadowError {
    #[error("prediction not found: {0}")]
    NotFound(String),
    #[error("prediction {0} already resolved")]
    AlreadyResolved(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What ended a prediction's window.
#[derive(Debug, Clone)]
pub enum Observation {
    Actual(Value),
    Timeout,
}

fn action_of(v: &Value) -> Option<&Value> {
    ACTION_KEYS.iter().find_map(|k| v.get(*k))
}

/// A predicted action matches the observed one when their action identities
/// agree and every other key they share has the same value.
pub fn action_matches(predicted: &Value, actual: &Value) -> bool {
    match (predicted, actual) {
        (Value::Object(p), Value::Object(a)) => {
            if let Some(want) = action_of(predicted) {
                if action_of(actual) != Some(want) {
                    return false;
                }
            }
            p.iter()
                .filter(|(k, _)| !ACTION_KEYS.contains(&k.as_str()))
                .all(|(k, v)| a.get(k).map_or(true, |other| other == v))
        }
        _ => predicted == actual,
    }
}

/// Whether an observation concerns the part of the home a prediction is
/// scoped to. Unscoped predictions see every observation.
pub fn in_scope(context: &Value, actual: &Value) -> bool {
    SCOPE_KEYS.iter().all(|k| match (context.get(*k), actual.get(*k)) {
        (Some(want), Some(got)) => want == got,
        _ => true,
    })
}

fn domain_of(action: &str) -> &str {
    action.split_once('.').map_or(action, |(domain, _)| domain)
}

/// Whether an observation can settle a prediction at all. It must name an
/// action. A scoped prediction also needs the observation to carry one of
/// its scope keys with a matching value. Finally the observation has to touch
/// one of the predicted actions: the same action, the same domain, or the
/// same entity. Anything else leaves the prediction pending.
pub fn relates_to(prediction: &Prediction, actual: &Value) -> bool {
    let Some(action) = action_of(actual) else {
        return false;
    };
    let context = &prediction.context;
    let scoped = SCOPE_KEYS.iter().any(|k| context.get(*k).is_some());
    if scoped {
        let shares_scope = SCOPE_KEYS
            .iter()
            .any(|k| context.get(*k).is_some() && actual.get(*k).is_some());
        if !shares_scope || !in_scope(context, actual) {
            return false;
        }
    }
    let domain = action.as_str().map(domain_of);
    let entity = actual.get("entity_id");
    prediction.predicted_actions.iter().any(|predicted| {
        let want = action_of(predicted);
        want == Some(action)
            || (domain.is_some() && want.and_then(Value::as_str).map(domain_of) == domain)
            || (entity.is_some() && predicted.get("entity_id") == entity)
    })
}

fn classify(p: &Prediction, observation: &Observation, at: &DateTime<Utc>) -> Outcome {
    match observation {
        Observation::Timeout => Outcome::Nothing,
        Observation::Actual(_) if *at > p.deadline() => Outcome::Nothing,
        Observation::Actual(actual) => {
            if p.predicted_actions.iter().any(|a| action_matches(a, actual)) {
                Outcome::Correct
            } else {
                Outcome::Disagreement
            }
        }
    }
}

/// Ledger of shadow predictions: recording, resolution and accuracy.
pub struct ShadowEngine {
    kernel: Kernel,
    bus: Bus,
    default_window_seconds: i64,
}

impl ShadowEngine {
    pub fn new(kernel: Kernel, bus: Bus, default_window_seconds: i64) -> Self {
        Self {
            kernel,
            bus,
            default_window_seconds: default_window_seconds.max(1),
        }
    }

    pub fn default_window_seconds(&self) -> i64 {
        self.default_window_seconds
    }

    pub async fn record_prediction(
        &self,
        context: Value,
        predicted_actions: Vec<Value>,
        confidence: f64,
        is_exploration: bool,
        window_seconds: Option<i64>,
    ) -> Result<Prediction, ShadowError> {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        let prediction = Prediction {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            context,
            predicted_actions,
            outcome: Outcome::Pending,
            actual: None,
            confidence,
            is_exploration,
            propagated_count: 0,
            window_seconds: window_seconds.unwrap_or(self.default_window_seconds).max(1),
            resolved_at: None,
        };
        self.kernel.insert_prediction_async(prediction.clone()).await?;
        metrics::counter!("aria_predictions_recorded_total").increment(1);
        self.bus.publish(
            topics::TOPIC_PREDICTION_RECORDED,
            &json!({"id": prediction.id, "confidence": confidence, "is_exploration": is_exploration}),
        );
        Ok(prediction)
    }

    /// Resolve one prediction. An actual after the window counts as `nothing`.
    pub async fn resolve(
        &self,
        prediction_id: &str,
        observation: Observation,
        at: DateTime<Utc>,
    ) -> Result<Outcome, ShadowError> {
        let prediction = self
            .kernel
            .get_prediction_async(prediction_id)
            .await?
            .ok_or_else(|| ShadowError::NotFound(prediction_id.to_string()))?;
        self.resolve_loaded(&prediction, observation, at).await
    }

    async fn resolve_loaded(
        &self,
        prediction: &Prediction,
        observation: Observation,
        at: DateTime<Utc>,
    ) -> Result<Outcome, ShadowError> {
        if prediction.outcome.is_terminal() {
            return Err(ShadowError::AlreadyResolved(prediction.id.clone()));
        }
        let outcome = classify(prediction, &observation, &at);
        let actual = match observation {
            Observation::Actual(v) => Some(v),
            Observation::Timeout => None,
        };
        let updated = self
            .kernel
            .resolve_prediction_async(&prediction.id, outcome, actual, at)
            .await?;
        if !updated {
            return Err(ShadowError::AlreadyResolved(prediction.id.clone()));
        }
        metrics::counter!("aria_predictions_resolved_total", "outcome" => outcome.as_str())
            .increment(1);
        debug!(id = %prediction.id, outcome = outcome.as_str(), "prediction resolved");
        self.bus.publish(
            topics::TOPIC_PREDICTION_RESOLVED,
            &json!({"id": prediction.id, "outcome": outcome.as_str()}),
        );
        Ok(outcome)
    }

    /// Resolve every pending prediction whose open window contains this
    /// observation and which the observation [`relates_to`].
    pub async fn observe(
        &self,
        actual: &Value,
        at: DateTime<Utc>,
    ) -> Result<Vec<(String, Outcome)>, ShadowError> {
        let pending = self.kernel.pending_predictions_async().await?;
        let mut resolved = Vec::new();
        for p in pending {
            if p.timestamp > at || at > p.deadline() || !relates_to(&p, actual) {
                continue;
            }
            match self
                .resolve_loaded(&p, Observation::Actual(actual.clone()), at)
                .await
            {
                Ok(outcome) => resolved.push((p.id, outcome)),
                Err(ShadowError::AlreadyResolved(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(resolved)
    }

    /// Close every pending prediction whose window has elapsed as `nothing`.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<usize, ShadowError> {
        let pending = self.kernel.pending_predictions_async().await?;
        let mut expired = 0;
        for p in pending.iter().filter(|p| p.deadline() < now) {
            match self.resolve_loaded(p, Observation::Timeout, now).await {
                Ok(_) => expired += 1,
                Err(ShadowError::AlreadyResolved(_)) => {}
                Err(err) => return Err(err),
            }
        }
        if expired > 0 {
            info!(expired, "expired pending predictions");
        }
        Ok(expired)
    }

    pub async fn recent(&self, limit: i64, offset: i64) -> Result<Vec<Prediction>, StoreError> {
        self.kernel.recent_predictions_async(limit, offset, None).await
    }

    pub async fn accuracy_stats(&self, window: Option<Duration>) -> Result<AccuracyStats, StoreError> {
        let since = window.map(|w| Utc::now() - w);
        self.kernel.accuracy_stats_async(since).await
    }

    /// Most confidently wrong predictions first.
    pub async fn disagreements(&self, limit: usize) -> Result<Vec<Prediction>, StoreError> {
        let mut pool = self
            .kernel
            .recent_predictions_async(DISAGREEMENT_POOL, 0, Some(Outcome::Disagreement))
            .await?;
        pool.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
        });
        pool.truncate(limit);
        Ok(pool)
    }
}
