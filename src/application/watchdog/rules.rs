//! Auto-fix policy gate. Decisions come from the rules table (refreshed on a
//! snapshot interval), bounded by the per-hour budget and cooldown, with a
//! hard deny-list the table cannot override.

use crate::domain::audit::{IssueKind, WatchdogRule};
use crate::infrastructure::persistence::repositories::SqliteWatchdogRepository;
use anyhow::Result;
use chrono::{Duration, Utc};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;
use tracing::info;

const CACHE_TTL_SECS: u64 = 60;

pub struct RulesEngine {
    repo: Arc<SqliteWatchdogRepository>,
    cache: Mutex<Option<(Instant, Vec<WatchdogRule>)>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixGate {
    Allowed,
    Forbidden,
    Disabled,
    BudgetExhausted,
    CoolingDown,
}

impl RulesEngine {
    pub fn new(repo: Arc<SqliteWatchdogRepository>) -> Self {
        Self {
            repo,
            cache: Mutex::new(None),
        }
    }

    /// Consistent rules snapshot, refreshed at most once per minute.
    async fn rules(&self) -> Result<Vec<WatchdogRule>> {
        {
            let cache = self.cache.lock().expect("rules cache lock poisoned");
            if let Some((fetched_at, rules)) = cache.as_ref()
                && fetched_at.elapsed().as_secs() < CACHE_TTL_SECS
            {
                return Ok(rules.clone());
            }
        }
        let rules = self.repo.all_rules().await?;
        *self.cache.lock().expect("rules cache lock poisoned") =
            Some((Instant::now(), rules.clone()));
        Ok(rules)
    }

    pub async fn rule_for(&self, kind: IssueKind) -> Result<Option<WatchdogRule>> {
        Ok(self.rules().await?.into_iter().find(|r| r.issue_kind == kind))
    }

    /// May this issue kind be fixed automatically right now?
    ///
    /// The deny-list is not policy but invariant: orphan positions (and
    /// anything else `auto_fix_forbidden`) stay manual no matter what the
    /// table says.
    pub async fn gate(&self, kind: IssueKind) -> Result<FixGate> {
        if kind.auto_fix_forbidden() {
            return Ok(FixGate::Forbidden);
        }
        let Some(rule) = self.rule_for(kind).await? else {
            return Ok(FixGate::Disabled);
        };
        if !rule.active || !rule.auto_fix_enabled {
            return Ok(FixGate::Disabled);
        }

        let now = Utc::now();
        let fixes_last_hour = self
            .repo
            .fixes_since(kind, now - Duration::hours(1))
            .await?;
        if fixes_last_hour >= rule.max_fixes_per_hour {
            info!(
                "RulesEngine: {} budget exhausted ({fixes_last_hour}/{})",
                kind.as_str(),
                rule.max_fixes_per_hour
            );
            return Ok(FixGate::BudgetExhausted);
        }

        if rule.cooldown_minutes > 0
            && let Some(last) = self.repo.last_fix_at(kind).await?
            && now - last < Duration::minutes(rule.cooldown_minutes)
        {
            return Ok(FixGate::CoolingDown);
        }

        Ok(FixGate::Allowed)
    }
}
