//! Market-time reasoning behind a `Clock` trait so tests can inject a fake.

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketPhase {
    PreMarket,
    Open,
    LunchBreak,
    AfterHours,
    Closed,
}

impl MarketPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketPhase::PreMarket => "pre_market",
            MarketPhase::Open => "open",
            MarketPhase::LunchBreak => "lunch_break",
            MarketPhase::AfterHours => "after_hours",
            MarketPhase::Closed => "closed",
        }
    }
}

/// Exchange session parameters in UTC wall-clock time. Exchange differences
/// (HKEX lunch break, different hours) are configuration, not code branches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSpec {
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub pre_market_open: NaiveTime,
    pub after_hours_close: NaiveTime,
    pub lunch: Option<(NaiveTime, NaiveTime)>,
}

impl SessionSpec {
    /// US equities regular session, expressed in UTC (09:30-16:00 ET during DST).
    pub fn us_equities() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(13, 30, 0).unwrap(),
            close: NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            pre_market_open: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            after_hours_close: NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
            lunch: None,
        }
    }

    pub fn phase_at(&self, ts: DateTime<Utc>) -> MarketPhase {
        let weekday = ts.weekday();
        if weekday == Weekday::Sat || weekday == Weekday::Sun {
            return MarketPhase::Closed;
        }
        let t = ts.time();
        if let Some((lunch_start, lunch_end)) = self.lunch
            && t >= lunch_start
            && t < lunch_end
        {
            return MarketPhase::LunchBreak;
        }
        if t >= self.open && t < self.close {
            MarketPhase::Open
        } else if t >= self.pre_market_open && t < self.open {
            MarketPhase::PreMarket
        } else if t >= self.close && t <= self.after_hours_close {
            MarketPhase::AfterHours
        } else {
            MarketPhase::Closed
        }
    }

    pub fn minutes_to_close(&self, ts: DateTime<Utc>) -> Option<i64> {
        if self.phase_at(ts) != MarketPhase::Open {
            return None;
        }
        let t = ts.time();
        let remaining = self.close.num_seconds_from_midnight() as i64
            - t.num_seconds_from_midnight() as i64;
        Some(remaining / 60)
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn session(&self) -> &SessionSpec;

    fn phase(&self) -> MarketPhase {
        self.session().phase_at(self.now())
    }

    fn in_market_hours(&self) -> bool {
        self.phase() == MarketPhase::Open
    }

    /// True strictly within the final `n` minutes of the regular session.
    fn in_final_minutes(&self, n: i64) -> bool {
        match self.session().minutes_to_close(self.now()) {
            Some(remaining) => remaining < n,
            None => false,
        }
    }
}

pub struct SystemClock {
    session: SessionSpec,
}

impl SystemClock {
    pub fn new(session: SessionSpec) -> Self {
        Self { session }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn session(&self) -> &SessionSpec {
        &self.session
    }
}

/// Deterministic clock for tests: time only moves when told to.
pub struct FixedClock {
    now: std::sync::Mutex<DateTime<Utc>>,
    session: SessionSpec,
}

impl FixedClock {
    pub fn at(now: DateTime<Utc>, session: SessionSpec) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
            session,
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance_minutes(&self, minutes: i64) {
        let mut guard = self.now.lock().unwrap();
        *guard += chrono::Duration::minutes(minutes);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn session(&self) -> &SessionSpec {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        // 2025-03-10 is a Monday.
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn us_session_phases() {
        let session = SessionSpec::us_equities();
        assert_eq!(session.phase_at(utc(9, 0)), MarketPhase::PreMarket);
        assert_eq!(session.phase_at(utc(13, 30)), MarketPhase::Open);
        assert_eq!(session.phase_at(utc(19, 59)), MarketPhase::Open);
        assert_eq!(session.phase_at(utc(20, 0)), MarketPhase::AfterHours);
        assert_eq!(session.phase_at(utc(4, 0)), MarketPhase::Closed);
    }

    #[test]
    fn weekend_is_closed() {
        let session = SessionSpec::us_equities();
        let saturday = Utc.with_ymd_and_hms(2025, 3, 8, 14, 0, 0).unwrap();
        assert_eq!(session.phase_at(saturday), MarketPhase::Closed);
    }

    #[test]
    fn lunch_break_sessions() {
        let mut session = SessionSpec::us_equities();
        session.lunch = Some((
            NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
        ));
        assert_eq!(session.phase_at(utc(16, 30)), MarketPhase::LunchBreak);
        assert_eq!(session.phase_at(utc(17, 0)), MarketPhase::Open);
    }

    #[test]
    fn final_minutes_window_is_strict() {
        let clock = FixedClock::at(utc(19, 46), SessionSpec::us_equities());
        assert!(clock.in_final_minutes(15)); // 14 minutes remain

        clock.set(utc(19, 45));
        assert!(!clock.in_final_minutes(15)); // exactly 15 remain: not yet final

        clock.set(utc(15, 0));
        assert!(!clock.in_final_minutes(15));

        clock.set(utc(21, 0));
        assert!(!clock.in_final_minutes(15)); // after close: no window
    }

    #[test]
    fn minutes_to_close_only_while_open() {
        let session = SessionSpec::us_equities();
        assert_eq!(session.minutes_to_close(utc(19, 0)), Some(60));
        assert_eq!(session.minutes_to_close(utc(21, 0)), None);
    }

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::at(utc(14, 0), SessionSpec::us_equities());
        clock.advance_minutes(30);
        assert_eq!(clock.now(), utc(14, 30));
    }
}
