use std::collections::{BTreeMap, BTreeSet};

use aria_heuristics::UsefulnessComponents;
use aria_topics as topics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::hub::Hub;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStatus {
    #[default]
    Candidate,
    Promoted,
    Archived,
}

impl CapabilityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityStatus::Candidate => "candidate",
            CapabilityStatus::Promoted => "promoted",
            CapabilityStatus::Archived => "archived",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CapabilitySource {
    Seed,
    #[default]
    Organic,
}

/// One entry of the `capabilities` cache category. Fields the hub does not
/// model are kept in `extra` and written back untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Capability {
    #[serde(default)]
    pub status: CapabilityStatus,
    #[serde(default)]
    pub source: CapabilitySource,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<String>,
    #[serde(default)]
    pub usefulness: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub usefulness_components: BTreeMap<String, i64>,
    #[serde(default)]
    pub promote_streak: u32,
    #[serde(default)]
    pub archive_streak: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Capability {
    pub fn entity_set(&self) -> BTreeSet<String> {
        self.entities.iter().cloned().collect()
    }

    pub fn apply_score(&mut self, components: &UsefulnessComponents) {
        self.usefulness = aria_heuristics::compute_usefulness(components);
        self.usefulness_components = components.to_percentages();
    }
}

pub type CapabilityMap = BTreeMap<String, Capability>;

#[derive(Debug, Error, PartialEq)]
pub enum CapabilityError {
    #[error("Capabilities not found")]
    NoCapabilities,
    #[error("Unknown capability: {0}")]
    Unknown(String),
    #[error("capability {name} is {from}; only candidates can be {to}")]
    InvalidTransition {
        name: String,
        from: &'static str,
        to: &'static str,
    },
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyMode {
    Manual,
    #[default]
    SuggestAndWait,
    AutoPromote,
}

impl AutonomyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutonomyMode::Manual => "manual",
            AutonomyMode::SuggestAndWait => "suggest_and_wait",
            AutonomyMode::AutoPromote => "auto_promote",
        }
    }
}

impl std::str::FromStr for AutonomyMode {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(AutonomyMode::Manual),
            "suggest_and_wait" => Ok(AutonomyMode::SuggestAndWait),
            "auto_promote" => Ok(AutonomyMode::AutoPromote),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NamingBackend {
    #[default]
    Heuristic,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoverySettings {
    pub autonomy_mode: AutonomyMode,
    pub naming_backend: NamingBackend,
    pub promote_threshold: i64,
    pub archive_threshold: i64,
    pub promote_streak_days: u32,
    pub archive_streak_days: u32,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            autonomy_mode: AutonomyMode::SuggestAndWait,
            naming_backend: NamingBackend::Heuristic,
            promote_threshold: 50,
            archive_threshold: 10,
            promote_streak_days: 7,
            archive_streak_days: 14,
        }
    }
}

impl DiscoverySettings {
    /// Apply a partial update. Nothing is changed unless every field in the
    /// patch is known and valid.
    pub fn merged(&self, patch: &Value) -> Result<Self, String> {
        let Value::Object(fields) = patch else {
            return Err("settings update must be a JSON object".into());
        };
        let mut base = serde_json::to_value(self).map_err(|e| e.to_string())?;
        if let Value::Object(map) = &mut base {
            for (key, value) in fields {
                if !map.contains_key(key) {
                    return Err(format!("unknown setting: {key}"));
                }
                map.insert(key.clone(), value.clone());
            }
        }
        let next: DiscoverySettings =
            serde_json::from_value(base).map_err(|e| format!("invalid setting: {e}"))?;
        next.validate()?;
        Ok(next)
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, v) in [
            ("promote_threshold", self.promote_threshold),
            ("archive_threshold", self.archive_threshold),
        ] {
            if !(0..=100).contains(&v) {
                return Err(format!("{name} must be between 0 and 100"));
            }
        }
        if self.archive_threshold >= self.promote_threshold {
            return Err("archive_threshold must be below promote_threshold".into());
        }
        if self.promote_streak_days == 0 || self.archive_streak_days == 0 {
            return Err("streak lengths must be at least 1".into());
        }
        Ok(())
    }
}

/// Outcome of one streak evaluation for a candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Promote,
    Archive,
}

/// Advance the streak counters of a candidate by one evaluation cycle and
/// report whether a streak has reached its length. Non-candidates are left
/// untouched.
pub fn evaluate_streaks(cap: &mut Capability, settings: &DiscoverySettings) -> Option<Verdict> {
    if cap.status != CapabilityStatus::Candidate {
        return None;
    }
    if cap.usefulness >= settings.promote_threshold {
        cap.promote_streak = cap.promote_streak.saturating_add(1);
        cap.archive_streak = 0;
    } else if cap.usefulness <= settings.archive_threshold {
        cap.archive_streak = cap.archive_streak.saturating_add(1);
        cap.promote_streak = 0;
    } else {
        cap.promote_streak = 0;
        cap.archive_streak = 0;
    }
    if cap.promote_streak >= settings.promote_streak_days {
        Some(Verdict::Promote)
    } else if cap.archive_streak >= settings.archive_streak_days {
        Some(Verdict::Archive)
    } else {
        None
    }
}

/// Move `name` from candidate to `target`, stamping the matching timestamp.
pub fn transition(
    caps: &mut CapabilityMap,
    name: &str,
    target: CapabilityStatus,
    now: &DateTime<Utc>,
) -> Result<(), CapabilityError> {
    if caps.is_empty() {
        return Err(CapabilityError::NoCapabilities);
    }
    let cap = caps
        .get_mut(name)
        .ok_or_else(|| CapabilityError::Unknown(name.to_string()))?;
    if cap.status != CapabilityStatus::Candidate || target == CapabilityStatus::Candidate {
        return Err(CapabilityError::InvalidTransition {
            name: name.to_string(),
            from: cap.status.as_str(),
            to: target.as_str(),
        });
    }
    let stamp = aria_kernel::fmt_ts(now);
    cap.status = target;
    cap.promote_streak = 0;
    cap.archive_streak = 0;
    match target {
        CapabilityStatus::Promoted => cap.promoted_at = Some(stamp),
        CapabilityStatus::Archived => cap.archived_at = Some(stamp),
        CapabilityStatus::Candidate => {}
    }
    Ok(())
}

/// Decode the `capabilities` payload. Entries that do not decode are skipped
/// with a warning rather than failing the whole map.
pub fn decode_map(data: &Value) -> CapabilityMap {
    let mut out = CapabilityMap::new();
    if let Value::Object(entries) = data {
        for (name, raw) in entries {
            match serde_json::from_value::<Capability>(raw.clone()) {
                Ok(cap) => {
                    out.insert(name.clone(), cap);
                }
                Err(err) => warn!(capability = %name, %err, "skipping malformed capability"),
            }
        }
    }
    out
}

/// Serialized read-modify-write access to the `capabilities` category.
pub struct CapabilityLifecycle {
    write_lock: Mutex<()>,
}

impl Default for CapabilityLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityLifecycle {
    pub fn new() -> Self {
        Self {
            write_lock: Mutex::new(()),
        }
    }

    pub async fn load(&self, hub: &Hub) -> anyhow::Result<CapabilityMap> {
        Ok(hub
            .get_cache(topics::CATEGORY_CAPABILITIES)
            .await?
            .map(|entry| decode_map(&entry.data))
            .unwrap_or_default())
    }

    /// Run `f` over the current map and persist the result, unless `f` fails.
    /// Subscribers are notified after the write lock is released.
    pub async fn update<F, R, E>(&self, hub: &Hub, f: F) -> anyhow::Result<Result<R, E>>
    where
        F: FnOnce(&mut CapabilityMap) -> Result<R, E>,
    {
        let guard = self.write_lock.lock().await;
        let mut caps = self.load(hub).await?;
        let out = f(&mut caps);
        if out.is_err() {
            return Ok(out);
        }
        let data = serde_json::to_value(&caps)?;
        let version = hub
            .store_cache(
                topics::CATEGORY_CAPABILITIES,
                data,
                Some(json!({"count": caps.len(), "source": "lifecycle"})),
            )
            .await?;
        drop(guard);
        hub.notify_cache_updated(topics::CATEGORY_CAPABILITIES, version)
            .await;
        Ok(out)
    }

    pub async fn promote(&self, hub: &Hub, name: &str) -> anyhow::Result<Result<(), CapabilityError>> {
        self.manual(hub, name, CapabilityStatus::Promoted).await
    }

    pub async fn archive(&self, hub: &Hub, name: &str) -> anyhow::Result<Result<(), CapabilityError>> {
        self.manual(hub, name, CapabilityStatus::Archived).await
    }

    async fn manual(
        &self,
        hub: &Hub,
        name: &str,
        target: CapabilityStatus,
    ) -> anyhow::Result<Result<(), CapabilityError>> {
        let now = Utc::now();
        let res = self
            .update(hub, |caps| transition(caps, name, target, &now))
            .await?;
        if res.is_ok() {
            info!(capability = name, status = target.as_str(), "capability transitioned");
            let topic = match target {
                CapabilityStatus::Archived => topics::TOPIC_CAPABILITY_ARCHIVED,
                _ => topics::TOPIC_CAPABILITY_PROMOTED,
            };
            hub.emit(topic, &json!({"capability": name, "trigger": "manual"}))
                .await;
        }
        Ok(res)
    }

    pub async fn candidates(&self, hub: &Hub) -> anyhow::Result<CapabilityMap> {
        let mut caps = self.load(hub).await?;
        caps.retain(|_, cap| cap.status == CapabilityStatus::Candidate);
        Ok(caps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candidate(usefulness: i64) -> Capability {
        Capability {
            usefulness,
            ..Capability::default()
        }
    }

    fn settings(mode: AutonomyMode) -> DiscoverySettings {
        DiscoverySettings {
            autonomy_mode: mode,
            promote_streak_days: 3,
            archive_streak_days: 2,
            ..DiscoverySettings::default()
        }
    }

    #[test]
    fn decode_keeps_unknown_fields() {
        let data = json!({
            "lighting_control": {"status": "promoted", "source": "seed", "can_predict": true},
            "climate_sensors": {"status": "candidate", "source": "organic"},
            "broken": "not an object"
        });
        let caps = decode_map(&data);
        assert_eq!(caps.len(), 2);
        assert_eq!(caps["lighting_control"].source, CapabilitySource::Seed);
        assert_eq!(caps["lighting_control"].extra["can_predict"], json!(true));
        let back = serde_json::to_value(&caps["lighting_control"]).unwrap();
        assert_eq!(back["can_predict"], json!(true));
    }

    #[test]
    fn transition_stamps_and_rejects() {
        let now = Utc.with_ymd_and_hms(2026, 2, 14, 8, 0, 0).unwrap();
        let mut caps = CapabilityMap::new();
        assert_eq!(
            transition(&mut caps, "x", CapabilityStatus::Promoted, &now),
            Err(CapabilityError::NoCapabilities)
        );
        caps.insert("climate".into(), candidate(40));
        assert_eq!(
            transition(&mut caps, "nope", CapabilityStatus::Promoted, &now),
            Err(CapabilityError::Unknown("nope".into()))
        );
        transition(&mut caps, "climate", CapabilityStatus::Promoted, &now).unwrap();
        assert_eq!(caps["climate"].status, CapabilityStatus::Promoted);
        assert_eq!(
            caps["climate"].promoted_at.as_deref(),
            Some("2026-02-14T08:00:00.000Z")
        );
        assert!(matches!(
            transition(&mut caps, "climate", CapabilityStatus::Archived, &now),
            Err(CapabilityError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn error_messages_are_distinct() {
        assert_eq!(CapabilityError::NoCapabilities.to_string(), "Capabilities not found");
        assert_eq!(
            CapabilityError::Unknown("fan".into()).to_string(),
            "Unknown capability: fan"
        );
    }

    #[test]
    fn promote_streak_fires_after_consecutive_cycles() {
        let s = settings(AutonomyMode::AutoPromote);
        let mut cap = candidate(70);
        assert_eq!(evaluate_streaks(&mut cap, &s), None);
        assert_eq!(evaluate_streaks(&mut cap, &s), None);
        assert_eq!(evaluate_streaks(&mut cap, &s), Some(Verdict::Promote));
    }

    #[test]
    fn out_of_band_score_resets_streaks() {
        let s = settings(AutonomyMode::AutoPromote);
        let mut cap = candidate(70);
        evaluate_streaks(&mut cap, &s);
        evaluate_streaks(&mut cap, &s);
        cap.usefulness = 30;
        assert_eq!(evaluate_streaks(&mut cap, &s), None);
        assert_eq!(cap.promote_streak, 0);
        cap.usefulness = 5;
        assert_eq!(evaluate_streaks(&mut cap, &s), None);
        assert_eq!(evaluate_streaks(&mut cap, &s), Some(Verdict::Archive));
    }

    #[test]
    fn non_candidates_are_not_evaluated() {
        let s = settings(AutonomyMode::AutoPromote);
        let mut cap = candidate(90);
        cap.status = CapabilityStatus::Archived;
        assert_eq!(evaluate_streaks(&mut cap, &s), None);
        assert_eq!(cap.promote_streak, 0);
    }

    #[test]
    fn settings_patch_validates() {
        let base = DiscoverySettings::default();
        let next = base
            .merged(&json!({"autonomy_mode": "auto_promote", "promote_threshold": 40}))
            .unwrap();
        assert_eq!(next.autonomy_mode, AutonomyMode::AutoPromote);
        assert_eq!(next.promote_threshold, 40);
        assert_eq!(next.archive_threshold, 10);

        assert!(base.merged(&json!({"autonomy_mode": "yolo"})).is_err());
        assert!(base.merged(&json!({"promote_threshold": 101})).is_err());
        assert!(base.merged(&json!({"archive_threshold": 60})).is_err());
        assert!(base.merged(&json!({"surprise": 1})).is_err());
        assert!(base.merged(&json!([1, 2])).is_err());
    }
}
