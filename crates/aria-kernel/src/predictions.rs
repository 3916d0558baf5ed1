use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{conversion_failure, fmt_ts, parse_json, parse_json_opt, parse_ts, Kernel, Result};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    #[default]
    Pending,
    Correct,
    Disagreement,
    Nothing,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pending => "pending",
            Outcome::Correct => "correct",
            Outcome::Disagreement => "disagreement",
            Outcome::Nothing => "nothing",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Outcome::Pending),
            "correct" => Some(Outcome::Correct),
            "disagreement" => Some(Outcome::Disagreement),
            "nothing" => Some(Outcome::Nothing),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Pending)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub context: Value,
    pub predicted_actions: Vec<Value>,
    pub outcome: Outcome,
    pub actual: Option<Value>,
    pub confidence: f64,
    pub is_exploration: bool,
    #[serde(default)]
    pub propagated_count: i64,
    pub window_seconds: i64,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Prediction {
    pub fn deadline(&self) -> DateTime<Utc> {
        self.timestamp + chrono::Duration::seconds(self.window_seconds.max(0))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DailyAccuracy {
    pub date: String,
    pub correct: i64,
    pub total: i64,
    pub accuracy: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TypeAccuracy {
    pub correct: i64,
    pub total: i64,
    pub accuracy: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct AccuracyStats {
    pub overall_accuracy: f64,
    pub total_resolved: i64,
    pub per_outcome: BTreeMap<String, i64>,
    pub by_type: BTreeMap<String, TypeAccuracy>,
    pub daily_trend: Vec<DailyAccuracy>,
}

impl AccuracyStats {
    pub fn count(&self, outcome: Outcome) -> i64 {
        self.per_outcome.get(outcome.as_str()).copied().unwrap_or(0)
    }
}

/// Persisted rollout state; the stage is kept as its slug so the hub owns the
/// stage vocabulary.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PipelineRow {
    pub current_stage: String,
    pub stage_entered_at: DateTime<Utc>,
    pub backtest_accuracy: Option<f64>,
    pub shadow_accuracy_7d: Option<f64>,
    pub suggest_approval_rate_14d: Option<f64>,
    pub autonomous_contexts: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

fn ratio(num: i64, den: i64) -> f64 {
    if den <= 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

fn prediction_from_row(row: &Row<'_>) -> rusqlite::Result<Prediction> {
    let ts: String = row.get(1)?;
    let ctx: String = row.get(2)?;
    let actions: String = row.get(3)?;
    let outcome: String = row.get(4)?;
    let resolved: Option<String> = row.get(10)?;
    Ok(Prediction {
        id: row.get(0)?,
        timestamp: parse_ts(1, &ts)?,
        context: parse_json(2, &ctx)?,
        predicted_actions: parse_json(3, &actions)?,
        outcome: Outcome::from_slug(&outcome)
            .ok_or_else(|| conversion_failure(4, format!("unknown outcome: {outcome}")))?,
        actual: parse_json_opt(5, row.get(5)?)?,
        confidence: row.get(6)?,
        is_exploration: row.get::<_, i64>(7)? != 0,
        propagated_count: row.get(8)?,
        window_seconds: row.get(9)?,
        resolved_at: resolved.map(|s| parse_ts(10, &s)).transpose()?,
    })
}

const PREDICTION_COLUMNS: &str = "id,timestamp,context,predicted_actions,outcome,actual,confidence,is_exploration,propagated_count,window_seconds,resolved_at";

impl Kernel {
    // ---------- Predictions ----------

    pub fn insert_prediction(&self, p: &Prediction) -> Result<()> {
        let ctx = serde_json::to_string(&p.context)?;
        let actions = serde_json::to_string(&p.predicted_actions)?;
        let actual = p.actual.as_ref().map(serde_json::to_string).transpose()?;
        self.write(|conn| {
            conn.execute(
                &format!("INSERT INTO predictions({PREDICTION_COLUMNS}) VALUES(?,?,?,?,?,?,?,?,?,?,?)"),
                params![
                    p.id,
                    fmt_ts(&p.timestamp),
                    ctx,
                    actions,
                    p.outcome.as_str(),
                    actual,
                    p.confidence,
                    p.is_exploration as i64,
                    p.propagated_count,
                    p.window_seconds,
                    p.resolved_at.as_ref().map(fmt_ts),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_prediction(&self, id: &str) -> Result<Option<Prediction>> {
        let conn = self.reader()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {PREDICTION_COLUMNS} FROM predictions WHERE id=?"))?;
        Ok(stmt.query_row([id], prediction_from_row).optional()?)
    }

    /// Move a pending prediction to a terminal outcome. Returns false when the
    /// id is unknown or the prediction was already resolved.
    pub fn resolve_prediction(
        &self,
        id: &str,
        outcome: Outcome,
        actual: Option<&Value>,
        resolved_at: &DateTime<Utc>,
    ) -> Result<bool> {
        let actual_s = actual.map(serde_json::to_string).transpose()?;
        self.write(|conn| {
            let n = conn.execute(
                "UPDATE predictions SET outcome=?, actual=?, resolved_at=? WHERE id=? AND outcome='pending'",
                params![outcome.as_str(), actual_s, fmt_ts(resolved_at), id],
            )?;
            Ok(n > 0)
        })
    }

    pub fn pending_predictions(&self) -> Result<Vec<Prediction>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PREDICTION_COLUMNS} FROM predictions WHERE outcome='pending' ORDER BY timestamp ASC"
        ))?;
        let rows = stmt.query_map([], prediction_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn recent_predictions(
        &self,
        limit: i64,
        offset: i64,
        outcome: Option<Outcome>,
    ) -> Result<Vec<Prediction>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PREDICTION_COLUMNS} FROM predictions
             WHERE (?1 IS NULL OR outcome=?1)
             ORDER BY timestamp DESC, id DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(
            params![outcome.map(|o| o.as_str()), limit.max(0), offset.max(0)],
            prediction_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Aggregate resolved predictions made at or after `since` (all time when
    /// `None`). Accuracy is `correct / resolved`, 0 when nothing resolved.
    pub fn accuracy_stats(&self, since: Option<&DateTime<Utc>>) -> Result<AccuracyStats> {
        let conn = self.reader()?;
        let since_s = since.map(fmt_ts);

        let mut per_outcome = BTreeMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT outcome, COUNT(*) FROM predictions
                 WHERE outcome!='pending' AND (?1 IS NULL OR timestamp>=?1)
                 GROUP BY outcome",
            )?;
            let mut rows = stmt.query(params![since_s])?;
            while let Some(r) = rows.next()? {
                per_outcome.insert(r.get::<_, String>(0)?, r.get::<_, i64>(1)?);
            }
        }
        let total_resolved: i64 = per_outcome.values().sum();
        let correct = per_outcome
            .get(Outcome::Correct.as_str())
            .copied()
            .unwrap_or(0);

        let mut by_type = BTreeMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT COALESCE(CAST(json_extract(context,'$.type') AS TEXT),'general') AS kind,
                        SUM(outcome='correct'), COUNT(*)
                 FROM predictions
                 WHERE outcome!='pending' AND (?1 IS NULL OR timestamp>=?1)
                 GROUP BY kind",
            )?;
            let mut rows = stmt.query(params![since_s])?;
            while let Some(r) = rows.next()? {
                let c: i64 = r.get(1)?;
                let t: i64 = r.get(2)?;
                by_type.insert(
                    r.get::<_, String>(0)?,
                    TypeAccuracy {
                        correct: c,
                        total: t,
                        accuracy: ratio(c, t),
                    },
                );
            }
        }

        let mut daily_trend = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT substr(timestamp,1,10) AS day, SUM(outcome='correct'), COUNT(*)
                 FROM predictions
                 WHERE outcome!='pending' AND (?1 IS NULL OR timestamp>=?1)
                 GROUP BY day ORDER BY day ASC",
            )?;
            let mut rows = stmt.query(params![since_s])?;
            while let Some(r) = rows.next()? {
                let c: i64 = r.get(1)?;
                let t: i64 = r.get(2)?;
                daily_trend.push(DailyAccuracy {
                    date: r.get(0)?,
                    correct: c,
                    total: t,
                    accuracy: ratio(c, t),
                });
            }
        }

        Ok(AccuracyStats {
            overall_accuracy: ratio(correct, total_resolved),
            total_resolved,
            per_outcome,
            by_type,
            daily_trend,
        })
    }

    // ---------- Suggestion decisions ----------

    /// Record a human decision on a suggested prediction. A later decision on
    /// the same prediction replaces the earlier one. Returns `None` when the
    /// prediction is unknown, otherwise whether this was its first decision.
    pub fn record_decision(
        &self,
        prediction_id: &str,
        approved: bool,
        at: &DateTime<Utc>,
    ) -> Result<Option<bool>> {
        self.write(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let known: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM predictions WHERE id=?)",
                [prediction_id],
                |r| r.get(0),
            )?;
            if !known {
                return Ok(None);
            }
            let decided: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM suggestion_decisions WHERE prediction_id=?)",
                [prediction_id],
                |r| r.get(0),
            )?;
            tx.execute(
                "INSERT INTO suggestion_decisions(prediction_id,approved,decided_at) VALUES(?,?,?)
                 ON CONFLICT(prediction_id) DO UPDATE SET
                   approved=excluded.approved,
                   decided_at=excluded.decided_at",
                params![prediction_id, approved as i64, fmt_ts(at)],
            )?;
            tx.commit()?;
            Ok(Some(!decided))
        })
    }

    /// `(approved, total)` over decisions made at or after `since`.
    pub fn decision_counts_since(&self, since: &DateTime<Utc>) -> Result<(i64, i64)> {
        let conn = self.reader()?;
        let counts = conn.query_row(
            "SELECT COALESCE(SUM(approved),0), COUNT(*) FROM suggestion_decisions WHERE decided_at>=?",
            [fmt_ts(since)],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(counts)
    }

    // ---------- Pipeline state ----------

    pub fn get_pipeline_state(&self) -> Result<Option<PipelineRow>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT current_stage,stage_entered_at,backtest_accuracy,shadow_accuracy_7d,
                    suggest_approval_rate_14d,autonomous_contexts,updated_at
             FROM pipeline_state WHERE id=1",
        )?;
        let row = stmt
            .query_row([], |r| {
                let entered: String = r.get(1)?;
                let updated: String = r.get(6)?;
                Ok(PipelineRow {
                    current_stage: r.get(0)?,
                    stage_entered_at: parse_ts(1, &entered)?,
                    backtest_accuracy: r.get(2)?,
                    shadow_accuracy_7d: r.get(3)?,
                    suggest_approval_rate_14d: r.get(4)?,
                    autonomous_contexts: parse_json_opt(5, r.get(5)?)?,
                    updated_at: parse_ts(6, &updated)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub fn put_pipeline_state(&self, state: &PipelineRow) -> Result<()> {
        let contexts = state
            .autonomous_contexts
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.write(|conn| {
            conn.execute(
                "INSERT INTO pipeline_state(id,current_stage,stage_entered_at,backtest_accuracy,
                    shadow_accuracy_7d,suggest_approval_rate_14d,autonomous_contexts,updated_at)
                 VALUES(1,?,?,?,?,?,?,?)
                 ON CONFLICT(id) DO UPDATE SET
                   current_stage=excluded.current_stage,
                   stage_entered_at=excluded.stage_entered_at,
                   backtest_accuracy=excluded.backtest_accuracy,
                   shadow_accuracy_7d=excluded.shadow_accuracy_7d,
                   suggest_approval_rate_14d=excluded.suggest_approval_rate_14d,
                   autonomous_contexts=excluded.autonomous_contexts,
                   updated_at=excluded.updated_at",
                params![
                    state.current_stage,
                    fmt_ts(&state.stage_entered_at),
                    state.backtest_accuracy,
                    state.shadow_accuracy_7d,
                    state.suggest_approval_rate_14d,
                    contexts,
                    fmt_ts(&state.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------

    pub async fn insert_prediction_async(&self, p: Prediction) -> Result<()> {
        self.blocking(move |k| k.insert_prediction(&p)).await
    }

    pub async fn get_prediction_async(&self, id: &str) -> Result<Option<Prediction>> {
        let id = id.to_string();
        self.blocking(move |k| k.get_prediction(&id)).await
    }

    pub async fn resolve_prediction_async(
        &self,
        id: &str,
        outcome: Outcome,
        actual: Option<Value>,
        resolved_at: DateTime<Utc>,
    ) -> Result<bool> {
        let id = id.to_string();
        self.blocking(move |k| k.resolve_prediction(&id, outcome, actual.as_ref(), &resolved_at))
            .await
    }

    pub async fn pending_predictions_async(&self) -> Result<Vec<Prediction>> {
        self.blocking(|k| k.pending_predictions()).await
    }

    pub async fn recent_predictions_async(
        &self,
        limit: i64,
        offset: i64,
        outcome: Option<Outcome>,
    ) -> Result<Vec<Prediction>> {
        self.blocking(move |k| k.recent_predictions(limit, offset, outcome))
            .await
    }

    pub async fn accuracy_stats_async(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<AccuracyStats> {
        self.blocking(move |k| k.accuracy_stats(since.as_ref())).await
    }

    pub async fn record_decision_async(
        &self,
        prediction_id: &str,
        approved: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<bool>> {
        let id = prediction_id.to_string();
        self.blocking(move |k| k.record_decision(&id, approved, &at))
            .await
    }

    pub async fn decision_counts_since_async(&self, since: DateTime<Utc>) -> Result<(i64, i64)> {
        self.blocking(move |k| k.decision_counts_since(&since)).await
    }

    pub async fn get_pipeline_state_async(&self) -> Result<Option<PipelineRow>> {
        self.blocking(|k| k.get_pipeline_state()).await
    }

    pub async fn put_pipeline_state_async(&self, state: PipelineRow) -> Result<()> {
        self.blocking(move |k| k.put_pipeline_state(&state)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreError;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    fn pred(id: &str, ts: DateTime<Utc>, confidence: f64, kind: Option<&str>) -> Prediction {
        let context = match kind {
            Some(k) => json!({"type": k, "room": "kitchen"}),
            None => json!({"room": "kitchen"}),
        };
        Prediction {
            id: id.to_string(),
            timestamp: ts,
            context,
            predicted_actions: vec![json!({"action": "light.turn_on"})],
            outcome: Outcome::Pending,
            actual: None,
            confidence,
            is_exploration: false,
            propagated_count: 0,
            window_seconds: 300,
            resolved_at: None,
        }
    }

    #[test]
    fn resolve_happens_exactly_once() {
        let dir = tempdir().unwrap();
        let kernel = Kernel::open(dir.path()).unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 2, 12, 10, 0, 0).unwrap();
        kernel.insert_prediction(&pred("p1", t0, 0.8, None)).unwrap();
        assert_eq!(kernel.pending_predictions().unwrap().len(), 1);

        let at = t0 + chrono::Duration::seconds(60);
        let actual = json!({"action": "light.turn_on"});
        assert!(kernel
            .resolve_prediction("p1", Outcome::Correct, Some(&actual), &at)
            .unwrap());
        assert!(!kernel
            .resolve_prediction("p1", Outcome::Nothing, None, &at)
            .unwrap());
        let stored = kernel.get_prediction("p1").unwrap().unwrap();
        assert_eq!(stored.outcome, Outcome::Correct);
        assert_eq!(stored.actual, Some(actual));
        assert_eq!(stored.resolved_at, Some(at));
        assert!(kernel.pending_predictions().unwrap().is_empty());
        assert!(!kernel
            .resolve_prediction("missing", Outcome::Correct, None, &at)
            .unwrap());
    }

    #[test]
    fn corrupt_prediction_rows_surface_errors() {
        let dir = tempdir().unwrap();
        let kernel = Kernel::open(dir.path()).unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 2, 12, 10, 0, 0).unwrap();
        kernel.insert_prediction(&pred("p1", t0, 0.8, None)).unwrap();
        kernel.insert_prediction(&pred("p2", t0, 0.8, None)).unwrap();
        kernel
            .write(|conn| {
                conn.execute("UPDATE predictions SET context='[oops' WHERE id='p1'", [])?;
                conn.execute("UPDATE predictions SET outcome='maybe' WHERE id='p2'", [])?;
                Ok(())
            })
            .unwrap();
        assert!(matches!(kernel.get_prediction("p1"), Err(StoreError::Sqlite(_))));
        assert!(matches!(kernel.get_prediction("p2"), Err(StoreError::Sqlite(_))));
        assert!(kernel.recent_predictions(10, 0, None).is_err());
    }

    #[test]
    fn accuracy_stats_without_resolutions_is_zero() {
        let dir = tempdir().unwrap();
        let kernel = Kernel::open(dir.path()).unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 2, 12, 10, 0, 0).unwrap();
        kernel.insert_prediction(&pred("p1", t0, 0.5, None)).unwrap();
        let stats = kernel.accuracy_stats(None).unwrap();
        assert_eq!(stats.total_resolved, 0);
        assert_eq!(stats.overall_accuracy, 0.0);
        assert!(stats.per_outcome.is_empty());
        assert!(stats.daily_trend.is_empty());
    }

    #[test]
    fn accuracy_stats_breaks_down_outcomes_types_and_days() {
        let dir = tempdir().unwrap();
        let kernel = Kernel::open(dir.path()).unwrap();
        let day1 = Utc.with_ymd_and_hms(2026, 2, 11, 9, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2026, 2, 12, 9, 0, 0).unwrap();
        let plan = [
            ("a", day1, Outcome::Correct, Some("lighting")),
            ("b", day1, Outcome::Disagreement, Some("lighting")),
            ("c", day2, Outcome::Correct, None),
            ("d", day2, Outcome::Nothing, Some("climate")),
        ];
        for (id, ts, outcome, kind) in plan {
            kernel.insert_prediction(&pred(id, ts, 0.6, kind)).unwrap();
            kernel.resolve_prediction(id, outcome, None, &ts).unwrap();
        }
        kernel
            .insert_prediction(&pred("still-pending", day2, 0.6, None))
            .unwrap();

        let stats = kernel.accuracy_stats(None).unwrap();
        assert_eq!(stats.total_resolved, 4);
        assert_eq!(stats.count(Outcome::Correct), 2);
        assert_eq!(stats.count(Outcome::Disagreement), 1);
        assert_eq!(stats.count(Outcome::Nothing), 1);
        assert!((stats.overall_accuracy - 0.5).abs() < 1e-9);
        assert_eq!(stats.by_type["lighting"].total, 2);
        assert_eq!(stats.by_type["general"].correct, 1);
        assert_eq!(stats.daily_trend.len(), 2);
        assert_eq!(stats.daily_trend[0].date, "2026-02-11");
        assert_eq!(stats.daily_trend[1].total, 2);

        let recent = kernel.accuracy_stats(Some(&day2)).unwrap();
        assert_eq!(recent.total_resolved, 2);
    }

    #[test]
    fn recent_predictions_filters_and_pages() {
        let dir = tempdir().unwrap();
        let kernel = Kernel::open(dir.path()).unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 2, 12, 0, 0, 0).unwrap();
        for i in 0..6 {
            let ts = t0 + chrono::Duration::minutes(i);
            let id = format!("p{i}");
            kernel.insert_prediction(&pred(&id, ts, 0.1 * i as f64, None)).unwrap();
            if i % 2 == 0 {
                kernel
                    .resolve_prediction(&id, Outcome::Disagreement, None, &ts)
                    .unwrap();
            }
        }
        let page = kernel.recent_predictions(2, 1, None).unwrap();
        assert_eq!(
            page.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["p4", "p3"]
        );
        let dis = kernel
            .recent_predictions(10, 0, Some(Outcome::Disagreement))
            .unwrap();
        assert_eq!(dis.len(), 3);
        assert!(dis.iter().all(|p| p.outcome == Outcome::Disagreement));
    }

    #[test]
    fn decisions_are_one_per_known_prediction() {
        let dir = tempdir().unwrap();
        let kernel = Kernel::open(dir.path()).unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 2, 12, 10, 0, 0).unwrap();
        kernel.insert_prediction(&pred("p1", t0, 0.8, None)).unwrap();
        kernel.insert_prediction(&pred("p2", t0, 0.8, None)).unwrap();

        assert_eq!(kernel.record_decision("ghost", true, &t0).unwrap(), None);
        assert_eq!(kernel.record_decision("p1", true, &t0).unwrap(), Some(true));
        assert_eq!(kernel.record_decision("p1", true, &t0).unwrap(), Some(false));
        assert_eq!(kernel.record_decision("p2", true, &t0).unwrap(), Some(true));
        // change of mind replaces the earlier decision
        assert_eq!(kernel.record_decision("p2", false, &t0).unwrap(), Some(false));
        assert_eq!(kernel.decision_counts_since(&t0).unwrap(), (1, 2));

        let later = t0 + chrono::Duration::hours(1);
        assert_eq!(kernel.decision_counts_since(&later).unwrap(), (0, 0));
    }

    #[test]
    fn pipeline_state_round_trips_as_singleton() {
        let dir = tempdir().unwrap();
        let kernel = Kernel::open(dir.path()).unwrap();
        assert!(kernel.get_pipeline_state().unwrap().is_none());
        let t0 = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();
        let mut row = PipelineRow {
            current_stage: "backtest".into(),
            stage_entered_at: t0,
            backtest_accuracy: Some(0.92),
            shadow_accuracy_7d: None,
            suggest_approval_rate_14d: None,
            autonomous_contexts: None,
            updated_at: t0,
        };
        kernel.put_pipeline_state(&row).unwrap();
        row.current_stage = "shadow".into();
        row.autonomous_contexts = Some(json!(["lighting"]));
        kernel.put_pipeline_state(&row).unwrap();
        let loaded = kernel.get_pipeline_state().unwrap().unwrap();
        assert_eq!(loaded, row);
    }
}
