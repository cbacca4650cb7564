use crate::domain::audit::{IssueKind, WatchdogActivity, WatchdogDecision, WatchdogRule};
use crate::domain::ports::AlertSeverity;
use crate::infrastructure::persistence::repositories::{get_json, get_ts, get_uuid, json_text, opt_uuid};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

pub struct SqliteWatchdogRepository {
    pool: SqlitePool,
}

impl SqliteWatchdogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Install the default rule set without disturbing operator edits.
    pub async fn seed_default_rules(&self) -> Result<()> {
        for rule in WatchdogRule::defaults() {
            sqlx::query(
                r#"
                INSERT INTO watchdog_rules
                    (issue_type, auto_fix_enabled, fix_template, max_fixes_per_hour,
                     cooldown_minutes, escalation_priority, active)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(issue_type) DO NOTHING
                "#,
            )
            .bind(rule.issue_kind.as_str())
            .bind(rule.auto_fix_enabled as i64)
            .bind(rule.fix_template.as_deref())
            .bind(rule.max_fixes_per_hour)
            .bind(rule.cooldown_minutes)
            .bind(rule.escalation_priority)
            .bind(rule.active as i64)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn all_rules(&self) -> Result<Vec<WatchdogRule>> {
        let rows = sqlx::query("SELECT * FROM watchdog_rules WHERE active = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_rule).collect()
    }

    pub async fn log_activity(&self, activity: &WatchdogActivity) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watchdog_activity
                (id, logged_at, session, cycle_id, observation_type, issues_summary,
                 decision, action_type, action_detail, action_result,
                 issue_type, issue_severity, observe_ms, act_ms, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(activity.id.to_string())
        .bind(activity.logged_at.to_rfc3339())
        .bind(&activity.session)
        .bind(activity.cycle_id.map(|u| u.to_string()))
        .bind(&activity.observation_type)
        .bind(&activity.issues_summary)
        .bind(activity.decision.as_str())
        .bind(activity.action_type.as_deref())
        .bind(activity.action_detail.as_deref())
        .bind(activity.action_result.as_deref())
        .bind(activity.issue_kind.map(|k| k.as_str()))
        .bind(activity.issue_severity.map(|s| s.as_str()))
        .bind(activity.observe_ms)
        .bind(activity.act_ms)
        .bind(json_text(&activity.metadata))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Auto-fixes applied for an issue kind since the cutoff (budget check).
    pub async fn fixes_since(&self, kind: IssueKind, since: DateTime<Utc>) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM watchdog_activity
            WHERE issue_type = ? AND decision = 'auto_fix' AND logged_at >= ?
            "#,
        )
        .bind(kind.as_str())
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn last_fix_at(&self, kind: IssueKind) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            r#"
            SELECT logged_at FROM watchdog_activity
            WHERE issue_type = ? AND decision = 'auto_fix'
            ORDER BY logged_at DESC LIMIT 1
            "#,
        )
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => Ok(Some(get_ts(&r, "logged_at")?)),
            None => Ok(None),
        }
    }

    pub async fn recent_activity(&self, limit: i64) -> Result<Vec<WatchdogActivity>> {
        let rows = sqlx::query(
            "SELECT * FROM watchdog_activity ORDER BY logged_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_activity).collect()
    }
}

fn map_rule(row: &SqliteRow) -> Result<WatchdogRule> {
    let issue_raw: String = row.try_get("issue_type")?;
    let auto_fix: i64 = row.try_get("auto_fix_enabled")?;
    let active: i64 = row.try_get("active")?;
    Ok(WatchdogRule {
        issue_kind: IssueKind::parse(&issue_raw)
            .ok_or_else(|| anyhow!("Unknown issue type: {issue_raw}"))?,
        auto_fix_enabled: auto_fix != 0,
        fix_template: row.try_get("fix_template")?,
        max_fixes_per_hour: row.try_get("max_fixes_per_hour")?,
        cooldown_minutes: row.try_get("cooldown_minutes")?,
        escalation_priority: row.try_get("escalation_priority")?,
        active: active != 0,
    })
}

fn map_activity(row: &SqliteRow) -> Result<WatchdogActivity> {
    let decision_raw: String = row.try_get("decision")?;
    let issue_raw: Option<String> = row.try_get("issue_type")?;
    let severity_raw: Option<String> = row.try_get("issue_severity")?;
    Ok(WatchdogActivity {
        id: get_uuid(row, "id")?,
        logged_at: get_ts(row, "logged_at")?,
        session: row.try_get("session")?,
        cycle_id: opt_uuid(row, "cycle_id")?,
        observation_type: row.try_get("observation_type")?,
        issues_summary: row.try_get("issues_summary")?,
        decision: WatchdogDecision::parse(&decision_raw)
            .ok_or_else(|| anyhow!("Unknown decision: {decision_raw}"))?,
        action_type: row.try_get("action_type")?,
        action_detail: row.try_get("action_detail")?,
        action_result: row.try_get("action_result")?,
        issue_kind: issue_raw.as_deref().and_then(IssueKind::parse),
        issue_severity: severity_raw.as_deref().and_then(|s| match s {
            "INFO" => Some(AlertSeverity::Info),
            "WARNING" => Some(AlertSeverity::Warning),
            "CRITICAL" => Some(AlertSeverity::Critical),
            _ => None,
        }),
        observe_ms: row.try_get("observe_ms")?,
        act_ms: row.try_get("act_ms")?,
        metadata: get_json(row, "metadata")?,
    })
}
