//! Pre-trade validation. Six ordered checks; the first failure wins, records
//! a risk event with a stable reason code, and vetoes the trade.

use crate::config::SettingsStore;
use crate::domain::audit::RiskEvent;
use crate::domain::errors::RiskViolation;
use crate::domain::ports::{AccountSnapshot, AlertSeverity};
use crate::application::engine::TradeCandidate;
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::{
    SqliteCycleRepository, SqlitePositionRepository, SqliteRiskEventRepository,
    SqliteSecurityRepository,
};
use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub approved: bool,
    pub reason: Option<String>,
    pub risk_amount: Decimal,
}

impl ValidationOutcome {
    fn rejected(reason: &str, risk_amount: Decimal) -> Self {
        Self {
            approved: false,
            reason: Some(reason.to_string()),
            risk_amount,
        }
    }
}

pub struct RiskValidator {
    positions: Arc<SqlitePositionRepository>,
    securities: Arc<SqliteSecurityRepository>,
    cycles: Arc<SqliteCycleRepository>,
    risk_events: Arc<SqliteRiskEventRepository>,
    settings: Arc<SettingsStore>,
}

impl RiskValidator {
    pub fn new(db: &Database, settings: Arc<SettingsStore>) -> Self {
        Self {
            positions: Arc::new(SqlitePositionRepository::new(db.pool.clone())),
            securities: Arc::new(SqliteSecurityRepository::new(db.pool.clone())),
            cycles: Arc::new(SqliteCycleRepository::new(db.pool.clone())),
            risk_events: Arc::new(SqliteRiskEventRepository::new(db.pool.clone())),
            settings,
        }
    }

    /// Validate a candidate against the cycle's risk state. The account
    /// snapshot is fetched once per execution batch by the caller so a batch
    /// of validations does not hammer the broker.
    pub async fn validate(
        &self,
        cycle_id: Uuid,
        candidate: &TradeCandidate,
        account: &AccountSnapshot,
    ) -> Result<ValidationOutcome> {
        let settings = self.settings.snapshot();
        let risk_amount = (candidate.entry_price - candidate.stop_loss).abs() * candidate.qty;

        // 1. Cycle must be live; a stopped cycle accepts nothing.
        let cycle = self.cycles.get(cycle_id).await?;
        if cycle.state.is_terminal() {
            return self
                .reject(cycle_id, RiskViolation::CycleStopped, risk_amount)
                .await;
        }

        // 2. Position count ceiling.
        let open_count = self.positions.count_open(cycle_id).await?;
        if open_count >= settings.risk.max_positions {
            return self
                .reject(
                    cycle_id,
                    RiskViolation::MaxPositions {
                        current: open_count,
                        max: settings.risk.max_positions,
                    },
                    risk_amount,
                )
                .await;
        }

        // 3. Remaining risk budget.
        let used = self.positions.used_risk_budget(cycle_id).await?;
        let remaining = settings.risk.total_risk_budget - used;
        if risk_amount > remaining {
            return self
                .reject(
                    cycle_id,
                    RiskViolation::RiskBudgetExceeded {
                        requested: risk_amount,
                        remaining,
                    },
                    risk_amount,
                )
                .await;
        }

        // 4. One live position per security.
        let security_id = self.securities.get_or_create(&candidate.symbol).await?;
        if self
            .positions
            .live_for_security(cycle_id, security_id)
            .await?
            .is_some()
        {
            return self
                .reject(
                    cycle_id,
                    RiskViolation::DuplicatePosition {
                        symbol: candidate.symbol.to_uppercase(),
                    },
                    risk_amount,
                )
                .await;
        }

        // 5. Sector exposure against account equity.
        let sector = self
            .securities
            .sector_of(security_id)
            .await?
            .unwrap_or_else(|| "unknown".to_string());
        let candidate_value = candidate.entry_price * candidate.qty;
        let sector_value: Decimal = self
            .positions
            .sector_exposure(cycle_id)
            .await?
            .into_iter()
            .filter(|(code, _)| *code == sector)
            .map(|(_, value)| value)
            .sum();
        if account.equity > Decimal::ZERO {
            let pct = ((sector_value + candidate_value) / account.equity)
                .to_f64()
                .unwrap_or(0.0)
                * 100.0;
            if pct > settings.risk.max_sector_exposure_pct {
                return self
                    .reject(
                        cycle_id,
                        RiskViolation::SectorExposureLimit {
                            sector,
                            current_pct: pct,
                            max_pct: settings.risk.max_sector_exposure_pct,
                        },
                        risk_amount,
                    )
                    .await;
            }
        }

        // 6. Adverse case (stop hit) must not breach the daily loss limit.
        let (realized, unrealized) = self.positions.aggregate_pnl(cycle_id).await?;
        let projected = realized + unrealized - risk_amount;
        if projected < -settings.risk.max_daily_loss {
            return self
                .reject(
                    cycle_id,
                    RiskViolation::DailyLossProjection {
                        projected,
                        max: settings.risk.max_daily_loss,
                    },
                    risk_amount,
                )
                .await;
        }

        info!(
            "RiskValidator: approved {} x{} (risk ${risk_amount})",
            candidate.symbol, candidate.qty
        );
        Ok(ValidationOutcome {
            approved: true,
            reason: None,
            risk_amount,
        })
    }

    async fn reject(
        &self,
        cycle_id: Uuid,
        violation: RiskViolation,
        risk_amount: Decimal,
    ) -> Result<ValidationOutcome> {
        warn!("RiskValidator: rejected - {violation}");
        let event = RiskEvent::new(
            Some(cycle_id),
            None,
            violation.reason_code(),
            AlertSeverity::Warning,
            violation.to_string(),
        );
        self.risk_events.insert(&event).await?;
        Ok(ValidationOutcome::rejected(violation.reason_code(), risk_amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::domain::trading::cycle::{CycleMode, TradingCycle};
    use crate::domain::trading::types::{Position, PositionSide};
    use chrono::{NaiveDate, Utc};
    use rust_decimal_macros::dec;

    fn account() -> AccountSnapshot {
        AccountSnapshot {
            cash: dec!(50000),
            buying_power: dec!(100000),
            equity: dec!(50000),
            day_trade_count: 0,
        }
    }

    fn candidate(symbol: &str, qty: Decimal) -> TradeCandidate {
        TradeCandidate {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            qty,
            entry_price: dec!(150),
            stop_loss: dec!(145),
            take_profit: dec!(165),
            risk_amount: Decimal::ZERO,
            pattern: None,
            catalyst: None,
            entry_volume: None,
        }
    }

    async fn setup() -> (Database, RiskValidator, Uuid) {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let settings = SettingsStore::new(Settings::default(), None);
        let validator = RiskValidator::new(&db, settings);
        let cycles = SqliteCycleRepository::new(db.pool.clone());
        let cycle = TradingCycle::new(
            NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            CycleMode::Paper,
            serde_json::Value::Null,
        );
        cycles.create(&cycle).await.unwrap();
        (db, validator, cycle.id)
    }

    async fn insert_live_position(db: &Database, cycle_id: Uuid, symbol: &str, risk: Decimal) {
        let securities = SqliteSecurityRepository::new(db.pool.clone());
        let positions = SqlitePositionRepository::new(db.pool.clone());
        let security_id = securities.get_or_create(symbol).await.unwrap();
        let mut position = Position::new(
            cycle_id,
            security_id,
            symbol,
            PositionSide::Long,
            dec!(10),
            dec!(145),
            dec!(165),
            risk,
            Utc::now(),
        );
        position.open_on_fill(dec!(150), Utc::now()).unwrap();
        positions.insert(&position).await.unwrap();
    }

    #[tokio::test]
    async fn approves_and_computes_risk_amount() {
        let (_db, validator, cycle_id) = setup().await;
        let outcome = validator
            .validate(cycle_id, &candidate("AAPL", dec!(10)), &account())
            .await
            .unwrap();
        assert!(outcome.approved);
        // |150 - 145| * 10
        assert_eq!(outcome.risk_amount, dec!(50.00));
    }

    #[tokio::test]
    async fn stopped_cycle_rejects_everything() {
        let (db, validator, cycle_id) = setup().await;
        let cycles = SqliteCycleRepository::new(db.pool.clone());
        cycles.try_stop(cycle_id, Utc::now()).await.unwrap();

        let outcome = validator
            .validate(cycle_id, &candidate("AAPL", dec!(10)), &account())
            .await
            .unwrap();
        assert!(!outcome.approved);
        assert_eq!(outcome.reason.as_deref(), Some("cycle_stopped"));
    }

    #[tokio::test]
    async fn max_positions_ceiling() {
        let (db, validator, cycle_id) = setup().await;
        for symbol in ["A1", "A2", "A3", "A4", "A5"] {
            insert_live_position(&db, cycle_id, symbol, dec!(50)).await;
        }
        let outcome = validator
            .validate(cycle_id, &candidate("AAPL", dec!(10)), &account())
            .await
            .unwrap();
        assert!(!outcome.approved);
        assert_eq!(outcome.reason.as_deref(), Some("max_positions"));
    }

    #[tokio::test]
    async fn risk_budget_is_finite() {
        let (db, validator, cycle_id) = setup().await;
        insert_live_position(&db, cycle_id, "BIG", dec!(9980)).await;

        let outcome = validator
            .validate(cycle_id, &candidate("AAPL", dec!(10)), &account())
            .await
            .unwrap();
        assert!(!outcome.approved);
        assert_eq!(outcome.reason.as_deref(), Some("risk_budget_exceeded"));
    }

    #[tokio::test]
    async fn duplicate_security_rejected() {
        let (db, validator, cycle_id) = setup().await;
        insert_live_position(&db, cycle_id, "AAPL", dec!(50)).await;

        let outcome = validator
            .validate(cycle_id, &candidate("aapl", dec!(10)), &account())
            .await
            .unwrap();
        assert!(!outcome.approved);
        assert_eq!(outcome.reason.as_deref(), Some("duplicate_position"));
    }

    #[tokio::test]
    async fn sector_exposure_ceiling() {
        let (db, validator, cycle_id) = setup().await;
        let securities = SqliteSecurityRepository::new(db.pool.clone());
        securities.get_or_create("NVDA").await.unwrap();
        securities.set_sector("NVDA", "tech", "Technology").await.unwrap();
        securities.get_or_create("AMD").await.unwrap();
        securities.set_sector("AMD", "tech", "Technology").await.unwrap();

        // 19500 of tech on a 50k account = 39%; the next tech candidate
        // (1500) pushes it to 42% > 40%.
        insert_live_position(&db, cycle_id, "NVDA", dec!(50)).await;
        let positions = SqlitePositionRepository::new(db.pool.clone());
        let nvda = &positions.list_open(Some(cycle_id)).await.unwrap()[0];
        let stamp = nvda.updated_at;
        let mut nvda = nvda.clone();
        nvda.qty = dec!(130);
        positions.update(&nvda, stamp).await.unwrap();

        let outcome = validator
            .validate(cycle_id, &candidate("AMD", dec!(10)), &account())
            .await
            .unwrap();
        assert!(!outcome.approved);
        assert_eq!(outcome.reason.as_deref(), Some("sector_exposure"));

        // A different sector is fine.
        let outcome = validator
            .validate(cycle_id, &candidate("XOM", dec!(10)), &account())
            .await
            .unwrap();
        assert!(outcome.approved);
    }

    #[tokio::test]
    async fn projected_daily_loss_guard() {
        let (db, validator, cycle_id) = setup().await;
        // Existing losses of 1990; a 50-risk trade projects past the 2000
        // limit on the adverse case.
        let securities = SqliteSecurityRepository::new(db.pool.clone());
        let positions = SqlitePositionRepository::new(db.pool.clone());
        let security_id = securities.get_or_create("LOSS").await.unwrap();
        let mut position = Position::new(
            cycle_id,
            security_id,
            "LOSS",
            PositionSide::Long,
            dec!(10),
            dec!(145),
            dec!(165),
            dec!(50),
            Utc::now(),
        );
        position.open_on_fill(dec!(150), Utc::now()).unwrap();
        position.realized_pnl = dec!(-1990);
        positions.insert(&position).await.unwrap();

        let outcome = validator
            .validate(cycle_id, &candidate("AAPL", dec!(10)), &account())
            .await
            .unwrap();
        assert!(!outcome.approved);
        assert_eq!(outcome.reason.as_deref(), Some("daily_loss_projection"));
    }

    #[tokio::test]
    async fn failures_leave_risk_events() {
        let (db, validator, cycle_id) = setup().await;
        insert_live_position(&db, cycle_id, "AAPL", dec!(50)).await;
        validator
            .validate(cycle_id, &candidate("AAPL", dec!(10)), &account())
            .await
            .unwrap();

        let events = SqliteRiskEventRepository::new(db.pool.clone())
            .list_for_cycle(cycle_id)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "duplicate_position");
    }
}
