use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use aria_heuristics::{
    best_seed_match, jaccard_similarity, validate_seeds, SeedValidation, UsefulnessComponents,
};
use aria_kernel::StoreError;
use aria_topics as topics;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::capability::{
    evaluate_streaks, transition, AutonomyMode, Capability, CapabilityMap, CapabilitySource,
    CapabilityStatus, DiscoverySettings, Verdict,
};
use crate::config::{HubConfig, ScheduleConfig};
use crate::hub::Hub;
use crate::modules::Module;
use crate::tasks;

pub const MODULE_NAME: &str = "organic_discovery";
pub const TASK_ID: &str = "organic_discovery_periodic";

/// A group of entities the clustering collaborator believes behave as one
/// capability. Behavioural signals are in [0, 1].
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub cluster_id: i64,
    pub entity_ids: Vec<String>,
    /// Silhouette score in [-1, 1].
    pub silhouette: f64,
    #[serde(default)]
    pub predictability: f64,
    #[serde(default)]
    pub stability: f64,
    #[serde(default)]
    pub activity: f64,
}

impl Cluster {
    fn entity_set(&self) -> BTreeSet<String> {
        self.entity_ids.iter().cloned().collect()
    }
}

#[async_trait]
pub trait ClusteringEngine: Send + Sync {
    /// Group the cached `entities` payload. Clusters smaller than
    /// `min_cluster_size` must not be returned.
    async fn cluster(&self, entities: &Value, min_cluster_size: usize) -> anyhow::Result<Vec<Cluster>>;
}

/// Entity ids and their records from either a map keyed by entity id or a
/// list of records carrying `entity_id`.
pub fn entity_records(entities: &Value) -> Vec<(String, Value)> {
    match entities {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let id = item.get("entity_id")?.as_str()?;
                Some((id.to_string(), item.clone()))
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn domain_of(entity_id: &str) -> &str {
    entity_id.split_once('.').map_or(entity_id, |(domain, _)| domain)
}

fn area_of(record: &Value) -> Option<&str> {
    record
        .get("area_id")
        .or_else(|| record.get("area"))
        .and_then(Value::as_str)
}

fn is_live(record: &Value) -> bool {
    !matches!(
        record.get("state").and_then(Value::as_str),
        Some("unavailable") | Some("unknown")
    )
}

/// Built-in clusterer: groups entities sharing a domain and an area.
/// Entities without an area group by domain alone.
#[derive(Debug, Default)]
pub struct DomainAreaClusterer;

#[async_trait]
impl ClusteringEngine for DomainAreaClusterer {
    async fn cluster(&self, entities: &Value, min_cluster_size: usize) -> anyhow::Result<Vec<Cluster>> {
        let mut groups: BTreeMap<(String, Option<String>), Vec<(String, bool)>> = BTreeMap::new();
        for (id, record) in entity_records(entities) {
            let key = (domain_of(&id).to_string(), area_of(&record).map(str::to_string));
            let live = is_live(&record);
            groups.entry(key).or_default().push((id, live));
        }
        let mut out = Vec::new();
        for ((_, area), members) in groups {
            if members.len() < min_cluster_size.max(1) {
                continue;
            }
            let live = members.iter().filter(|(_, l)| *l).count();
            out.push(Cluster {
                cluster_id: out.len() as i64,
                silhouette: if area.is_some() { 1.0 } else { 0.0 },
                predictability: 0.0,
                stability: 1.0,
                activity: live as f64 / members.len() as f64,
                entity_ids: members.into_iter().map(|(id, _)| id).collect(),
            });
        }
        Ok(out)
    }
}

/// One line of `discovery_history`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub timestamp: String,
    pub clusters_found: usize,
    pub new_candidates: usize,
    pub rediscovered_seeds: usize,
    pub total_merged: usize,
    #[serde(default)]
    pub promoted: Vec<String>,
    #[serde(default)]
    pub archived: Vec<String>,
    /// Per seed capability: how closely this pass reproduced it.
    #[serde(default)]
    pub seed_validation: BTreeMap<String, SeedValidation>,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Merge {
    summary: RunSummary,
    suggestions: Vec<(String, Verdict, i64)>,
}

/// Heuristic name: dominant domain plus cluster id, suffixed when taken.
pub fn heuristic_name(cluster: &Cluster, taken: &CapabilityMap) -> String {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for id in &cluster.entity_ids {
        *counts.entry(domain_of(id)).or_default() += 1;
    }
    let domain = counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map_or("mixed", |(d, _)| *d);
    let base = format!("{domain}_cluster_{}", cluster.cluster_id);
    if !taken.contains_key(&base) {
        return base;
    }
    (2..)
        .map(|n| format!("{base}_{n}"))
        .find(|name| !taken.contains_key(name))
        .unwrap_or(base)
}

fn components(cluster: &Cluster, total_entities: usize) -> UsefulnessComponents {
    let coverage = if total_entities == 0 {
        0.0
    } else {
        cluster.entity_ids.len() as f64 / total_entities as f64
    };
    UsefulnessComponents {
        predictability: cluster.predictability,
        stability: cluster.stability,
        entity_coverage: coverage,
        activity: cluster.activity,
        cohesion: (cluster.silhouette + 1.0) / 2.0,
    }
}

/// Fold one clustering pass into the capability map.
fn merge_clusters(
    caps: &mut CapabilityMap,
    clusters: &[Cluster],
    total_entities: usize,
    settings: &DiscoverySettings,
    seed_threshold: f64,
) -> Merge {
    let now = Utc::now();
    let stamp = aria_kernel::fmt_ts(&now);
    let seeds: BTreeMap<String, BTreeSet<String>> = caps
        .iter()
        .filter(|(_, c)| c.source == CapabilitySource::Seed)
        .map(|(name, c)| (name.clone(), c.entity_set()))
        .collect();
    let cluster_sets: Vec<(i64, BTreeSet<String>)> =
        clusters.iter().map(|c| (c.cluster_id, c.entity_set())).collect();
    let mut summary = RunSummary {
        timestamp: stamp.clone(),
        clusters_found: clusters.len(),
        seed_validation: validate_seeds(&seeds, &cluster_sets, seed_threshold),
        ..RunSummary::default()
    };
    for cluster in clusters {
        let members = cluster.entity_set();
        let scores = components(cluster, total_entities);
        if let Some((seed, _)) = best_seed_match(&members, &seeds, seed_threshold) {
            if let Some(cap) = caps.get_mut(seed) {
                cap.apply_score(&scores);
                cap.cluster_id = Some(cluster.cluster_id);
                cap.last_seen = Some(stamp.clone());
            }
            summary.rediscovered_seeds += 1;
            continue;
        }
        let known = caps
            .iter()
            .filter(|(_, c)| c.source == CapabilitySource::Organic)
            .map(|(name, c)| (name, jaccard_similarity(&members, &c.entity_set())))
            .filter(|(_, sim)| *sim >= seed_threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(name, _)| name.clone());
        let name = match known {
            Some(name) => name,
            None => {
                let name = heuristic_name(cluster, caps);
                caps.insert(
                    name.clone(),
                    Capability {
                        status: CapabilityStatus::Candidate,
                        source: CapabilitySource::Organic,
                        first_seen: Some(stamp.clone()),
                        layer: Some("organic".into()),
                        ..Capability::default()
                    },
                );
                summary.new_candidates += 1;
                name
            }
        };
        if let Some(cap) = caps.get_mut(&name) {
            cap.entities = cluster.entity_ids.clone();
            cap.cluster_id = Some(cluster.cluster_id);
            cap.last_seen = Some(stamp.clone());
            cap.apply_score(&scores);
        }
    }

    let mut verdicts = Vec::new();
    for (name, cap) in caps.iter_mut() {
        if let Some(verdict) = evaluate_streaks(cap, settings) {
            verdicts.push((name.clone(), verdict, cap.usefulness));
        }
    }
    let mut suggestions = Vec::new();
    for (name, verdict, usefulness) in verdicts {
        match settings.autonomy_mode {
            AutonomyMode::AutoPromote => {
                let target = match verdict {
                    Verdict::Promote => CapabilityStatus::Promoted,
                    Verdict::Archive => CapabilityStatus::Archived,
                };
                if transition(caps, &name, target, &now).is_ok() {
                    match verdict {
                        Verdict::Promote => summary.promoted.push(name),
                        Verdict::Archive => summary.archived.push(name),
                    }
                }
            }
            AutonomyMode::SuggestAndWait => suggestions.push((name, verdict, usefulness)),
            AutonomyMode::Manual => {}
        }
    }
    summary.total_merged = caps.len();
    Merge {
        summary,
        suggestions,
    }
}

/// Periodically clusters cached entities into capability candidates and
/// drives the autonomous side of the lifecycle.
pub struct OrganicDiscoveryModule {
    engine: Arc<dyn ClusteringEngine>,
    settings: RwLock<DiscoverySettings>,
    history: RwLock<Vec<RunSummary>>,
    run_lock: Mutex<()>,
    seed_threshold: f64,
    history_limit: usize,
    min_cluster_size: usize,
    interval_secs: u64,
    cluster_timeout: Duration,
}

impl OrganicDiscoveryModule {
    pub fn new(config: &HubConfig, engine: Arc<dyn ClusteringEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            settings: RwLock::new(config.organic.settings.clone()),
            history: RwLock::new(Vec::new()),
            run_lock: Mutex::new(()),
            seed_threshold: config.organic.seed_match_threshold,
            history_limit: config.organic.history_limit.max(1),
            min_cluster_size: config.organic.min_cluster_size,
            interval_secs: config.schedule.organic_discovery_secs,
            cluster_timeout: ScheduleConfig::every(config.schedule.clustering_timeout_secs),
        })
    }

    pub fn settings(&self) -> DiscoverySettings {
        self.settings.read().clone()
    }

    pub fn history(&self) -> Vec<RunSummary> {
        self.history.read().clone()
    }

    /// Validate and persist a partial settings update.
    pub async fn update_settings(&self, hub: &Hub, patch: &Value) -> Result<DiscoverySettings, SettingsError> {
        let next = self.settings().merged(patch).map_err(SettingsError::Invalid)?;
        hub.set_cache(
            topics::CATEGORY_DISCOVERY_SETTINGS,
            serde_json::to_value(&next).map_err(StoreError::from)?,
            None,
        )
        .await?;
        *self.settings.write() = next.clone();
        info!(autonomy_mode = next.autonomy_mode.as_str(), "discovery settings updated");
        hub.emit(topics::TOPIC_DISCOVERY_SETTINGS_UPDATED, &next).await;
        Ok(next)
    }

    /// One discovery pass. Concurrent calls queue behind each other.
    pub async fn run(&self, hub: &Hub) -> anyhow::Result<RunSummary> {
        let _guard = self.run_lock.lock().await;
        let settings = self.settings();
        let entities = hub
            .get_cache(topics::CATEGORY_ENTITIES)
            .await?
            .map(|e| e.data)
            .unwrap_or(Value::Null);
        let total = entity_records(&entities).len();
        let clusters = tokio::time::timeout(
            self.cluster_timeout,
            self.engine.cluster(&entities, self.min_cluster_size),
        )
        .await
        .with_context(|| format!("clustering timed out after {:?}", self.cluster_timeout))??;

        let threshold = self.seed_threshold;
        let merge = hub
            .capabilities()
            .update(hub, |caps| {
                Ok::<_, Infallible>(merge_clusters(caps, &clusters, total, &settings, threshold))
            })
            .await?;
        let Merge {
            summary,
            suggestions,
        } = match merge {
            Ok(merge) => merge,
            Err(never) => match never {},
        };

        for name in &summary.promoted {
            hub.emit(
                topics::TOPIC_CAPABILITY_PROMOTED,
                &json!({"capability": name, "trigger": "streak"}),
            )
            .await;
        }
        for name in &summary.archived {
            hub.emit(
                topics::TOPIC_CAPABILITY_ARCHIVED,
                &json!({"capability": name, "trigger": "streak"}),
            )
            .await;
        }
        for (name, verdict, usefulness) in suggestions {
            let action = match verdict {
                Verdict::Promote => "promote",
                Verdict::Archive => "archive",
            };
            info!(capability = %name, action, usefulness, "capability transition suggested");
            hub.emit(
                topics::TOPIC_CAPABILITY_SUGGESTED,
                &json!({"capability": name, "action": action, "usefulness": usefulness}),
            )
            .await;
        }

        let history = {
            let mut guard = self.history.write();
            guard.push(summary.clone());
            let excess = guard.len().saturating_sub(self.history_limit);
            guard.drain(..excess);
            guard.clone()
        };
        hub.set_cache(
            topics::CATEGORY_DISCOVERY_HISTORY,
            serde_json::to_value(&history)?,
            Some(json!({"count": history.len()})),
        )
        .await?;
        info!(
            clusters = summary.clusters_found,
            new_candidates = summary.new_candidates,
            rediscovered = summary.rediscovered_seeds,
            seeds_unmatched = summary.seed_validation.values().filter(|v| !v.matched).count(),
            "organic discovery complete"
        );
        hub.emit(topics::TOPIC_ORGANIC_DISCOVERY_COMPLETED, &summary).await;
        Ok(summary)
    }

    async fn restore(&self, hub: &Hub) -> anyhow::Result<()> {
        if let Some(entry) = hub.get_cache(topics::CATEGORY_DISCOVERY_SETTINGS).await? {
            match self.settings().merged(&entry.data) {
                Ok(saved) => *self.settings.write() = saved,
                Err(err) => warn!(%err, "ignoring persisted discovery settings"),
            }
        }
        if let Some(entry) = hub.get_cache(topics::CATEGORY_DISCOVERY_HISTORY).await? {
            match serde_json::from_value::<Vec<RunSummary>>(entry.data) {
                Ok(runs) => *self.history.write() = runs,
                Err(err) => warn!(%err, "ignoring malformed discovery history"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Module for OrganicDiscoveryModule {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    async fn initialize(self: Arc<Self>, hub: &Hub) -> anyhow::Result<()> {
        self.restore(hub).await?;
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
    use tempfile::tempdir;

    struct Fixed(Vec<Cluster>);

    #[async_trait]
    impl ClusteringEngine for Fixed {
        async fn cluster(&self, _entities: &Value, _min: usize) -> anyhow::Result<Vec<Cluster>> {
            Ok(self.0.clone())
        }
    }

    fn cluster(id: i64, ids: &[&str], signal: f64) -> Cluster {
        Cluster {
            cluster_id: id,
            entity_ids: ids.iter().map(|s| s.to_string()).collect(),
            silhouette: 1.0,
            predictability: signal,
            stability: signal,
            activity: signal,
        }
    }

    fn config(mode: AutonomyMode, streak: u32) -> HubConfig {
        let mut cfg = HubConfig::default();
        cfg.organic.settings.autonomy_mode = mode;
        cfg.organic.settings.promote_streak_days = streak;
        cfg.organic.settings.archive_streak_days = streak;
        cfg
    }

    async fn seed_entities(hub: &Hub) {
        hub.set_cache(
            topics::CATEGORY_ENTITIES,
            json!({
                "light.kitchen": {"area_id": "kitchen", "state": "on"},
                "light.hall": {"area_id": "hall", "state": "off"},
                "sensor.kitchen_temp": {"area_id": "kitchen", "state": "21"},
                "sensor.hall_temp": {"area_id": "hall", "state": "unavailable"},
            }),
            None,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn builtin_clusterer_groups_domain_and_area() {
        let entities = json!([
            {"entity_id": "light.a", "area_id": "kitchen"},
            {"entity_id": "light.b", "area_id": "kitchen", "state": "unknown"},
            {"entity_id": "light.c", "area_id": "hall"},
            {"entity_id": "switch.d"},
        ]);
        let clusters = DomainAreaClusterer.cluster(&entities, 2).await.unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].entity_ids, vec!["light.a", "light.b"]);
        assert_eq!(clusters[0].activity, 0.5);
    }

    #[test]
    fn names_follow_dominant_domain_and_avoid_collisions() {
        let c = cluster(3, &["sensor.a", "sensor.b", "light.c"], 0.5);
        let mut taken = CapabilityMap::new();
        assert_eq!(heuristic_name(&c, &taken), "sensor_cluster_3");
        taken.insert("sensor_cluster_3".into(), Capability::default());
        assert_eq!(heuristic_name(&c, &taken), "sensor_cluster_3_2");
    }

    #[tokio::test]
    async fn new_clusters_become_candidates_and_seeds_are_rediscovered() {
        let dir = tempdir().unwrap();
        let hub = test_support::hub_in(dir.path());
        seed_entities(&hub).await;
        hub.capabilities()
            .update(&hub, |caps| {
                caps.insert(
                    "lighting".into(),
                    Capability {
                        status: CapabilityStatus::Promoted,
                        source: CapabilitySource::Seed,
                        entities: vec!["light.kitchen".into(), "light.hall".into()],
                        ..Capability::default()
                    },
                );
                Ok::<_, Infallible>(())
            })
            .await
            .unwrap()
            .unwrap();

        let engine = Arc::new(Fixed(vec![
            cluster(0, &["light.kitchen", "light.hall"], 0.9),
            cluster(1, &["sensor.kitchen_temp", "sensor.hall_temp"], 0.2),
        ]));
        let module = OrganicDiscoveryModule::new(&HubConfig::default(), engine);
        let summary = module.run(&hub).await.unwrap();
        assert_eq!(summary.clusters_found, 2);
        assert_eq!(summary.rediscovered_seeds, 1);
        assert_eq!(summary.new_candidates, 1);
        assert_eq!(summary.total_merged, 2);

        let caps = hub.capabilities().load(&hub).await.unwrap();
        assert_eq!(caps["lighting"].status, CapabilityStatus::Promoted);
        assert!(caps["lighting"].usefulness > 0);
        let fresh = &caps["sensor_cluster_1"];
        assert_eq!(fresh.status, CapabilityStatus::Candidate);
        assert_eq!(fresh.source, CapabilitySource::Organic);
        assert_eq!(fresh.promote_streak, 0);

        // same cluster again merges instead of adding
        let again = module.run(&hub).await.unwrap();
        assert_eq!(again.new_candidates, 0);
        let history = hub
            .get_cache(topics::CATEGORY_DISCOVERY_HISTORY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(history.data.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn auto_promote_fires_after_streak() {
        let dir = tempdir().unwrap();
        let hub = test_support::hub_in(dir.path());
        seed_entities(&hub).await;
        let engine = Arc::new(Fixed(vec![cluster(0, &["light.kitchen", "light.hall"], 1.0)]));
        let module = OrganicDiscoveryModule::new(&config(AutonomyMode::AutoPromote, 2), engine);
        let first = module.run(&hub).await.unwrap();
        assert!(first.promoted.is_empty());
        let second = module.run(&hub).await.unwrap();
        assert_eq!(second.promoted, vec!["light_cluster_0".to_string()]);
        let caps = hub.capabilities().load(&hub).await.unwrap();
        assert_eq!(caps["light_cluster_0"].status, CapabilityStatus::Promoted);
        assert!(caps["light_cluster_0"].promoted_at.is_some());
    }

    #[tokio::test]
    async fn low_scores_archive_under_auto_promote() {
        let dir = tempdir().unwrap();
        let hub = test_support::hub_in(dir.path());
        let mut low = cluster(0, &["switch.a", "switch.b"], 0.0);
        low.silhouette = -1.0;
        let module = OrganicDiscoveryModule::new(
            &config(AutonomyMode::AutoPromote, 1),
            Arc::new(Fixed(vec![low])),
        );
        let summary = module.run(&hub).await.unwrap();
        assert_eq!(summary.archived, vec!["switch_cluster_0".to_string()]);
    }

    #[tokio::test]
    async fn manual_mode_tracks_streaks_without_transitions() {
        let dir = tempdir().unwrap();
        let hub = test_support::hub_in(dir.path());
        seed_entities(&hub).await;
        let engine = Arc::new(Fixed(vec![cluster(0, &["light.kitchen", "light.hall"], 1.0)]));
        let module = OrganicDiscoveryModule::new(&config(AutonomyMode::Manual, 1), engine);
        let summary = module.run(&hub).await.unwrap();
        assert!(summary.promoted.is_empty());
        let caps = hub.capabilities().load(&hub).await.unwrap();
        assert_eq!(caps["light_cluster_0"].status, CapabilityStatus::Candidate);
        assert_eq!(caps["light_cluster_0"].promote_streak, 1);
    }

    #[tokio::test]
    async fn settings_updates_persist_and_reject_invalid() {
        let dir = tempdir().unwrap();
        let hub = test_support::hub_in(dir.path());
        let module =
            OrganicDiscoveryModule::new(&HubConfig::default(), Arc::new(DomainAreaClusterer));
        let next = module
            .update_settings(&hub, &json!({"promote_threshold": 40}))
            .await
            .unwrap();
        assert_eq!(next.promote_threshold, 40);
        assert!(matches!(
            module
                .update_settings(&hub, &json!({"autonomy_mode": "yolo"}))
                .await,
            Err(SettingsError::Invalid(_))
        ));
        assert_eq!(module.settings().promote_threshold, 40);

        let reloaded =
            OrganicDiscoveryModule::new(&HubConfig::default(), Arc::new(DomainAreaClusterer));
        reloaded.restore(&hub).await.unwrap();
        assert_eq!(reloaded.settings().promote_threshold, 40);
    }

    #[tokio::test]
    async fn seed_validation_is_kept_in_history() {
        let dir = tempdir().unwrap();
        let hub = test_support::hub_in(dir.path());
        seed_entities(&hub).await;
        hub.capabilities()
            .update(&hub, |caps| {
                for (name, entities) in [
                    ("lighting", vec!["light.kitchen", "light.hall"]),
                    ("climate", vec!["climate.upstairs"]),
                ] {
                    caps.insert(
                        name.into(),
                        Capability {
                            status: CapabilityStatus::Promoted,
                            source: CapabilitySource::Seed,
                            entities: entities.into_iter().map(String::from).collect(),
                            ..Capability::default()
                        },
                    );
                }
                Ok::<_, Infallible>(())
            })
            .await
            .unwrap()
            .unwrap();

        let engine = Arc::new(Fixed(vec![cluster(4, &["light.kitchen", "light.hall"], 0.9)]));
        let module = OrganicDiscoveryModule::new(&HubConfig::default(), engine);
        let summary = module.run(&hub).await.unwrap();
        let lighting = &summary.seed_validation["lighting"];
        assert!(lighting.matched);
        assert_eq!(lighting.best_cluster_id, Some(4));
        let climate = &summary.seed_validation["climate"];
        assert!(!climate.matched);
        assert_eq!(climate.best_cluster_id, None);

        let reloaded = OrganicDiscoveryModule::new(&HubConfig::default(), Arc::new(Fixed(Vec::new())));
        reloaded.restore(&hub).await.unwrap();
        let history = reloaded.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].seed_validation, summary.seed_validation);
    }

    struct Stalled;

    #[async_trait]
    impl ClusteringEngine for Stalled {
        async fn cluster(&self, _entities: &Value, _min: usize) -> anyhow::Result<Vec<Cluster>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_clustering_times_out() {
        let dir = tempdir().unwrap();
        let hub = test_support::hub_in(dir.path());
        seed_entities(&hub).await;
        let module = OrganicDiscoveryModule::new(&HubConfig::default(), Arc::new(Stalled));
        let err = module.run(&hub).await.unwrap_err();
        assert!(format!("{err:#}").contains("clustering timed out"));
        assert!(module.history().is_empty());
        // the run lock is released for the next pass
        let err = module.run(&hub).await.unwrap_err();
        assert!(format!("{err:#}").contains("timed out"));
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let dir = tempdir().unwrap();
        let hub = test_support::hub_in(dir.path());
        let mut cfg = HubConfig::default();
        cfg.organic.history_limit = 2;
        let module = OrganicDiscoveryModule::new(&cfg, Arc::new(Fixed(Vec::new())));
        for _ in 0..3 {
            module.run(&hub).await.unwrap();
        }
        assert_eq!(module.history().len(), 2);
    }
}
