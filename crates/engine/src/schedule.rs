//! Temporal edge gating.
//!
//! An edge carrying a [`ScheduleConstraint`] is traversable only when "now"
//! falls within `tolerance` of one of the cron expression's fire times,
//! evaluated in the constraint's timezone. Named zones follow daylight
//! saving; fixed offsets do not. An optional [`EdgeCondition`] is
//! consulted afterwards and ANDed in.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::{EngineError, models::Edge};

const DEFAULT_TOLERANCE_SECS: u64 = 60;
/// Longer windows make little sense for an edge gate and would overflow
/// date arithmetic near the calendar limits.
const MAX_TOLERANCE_SECS: u64 = 366 * 24 * 60 * 60;

fn default_tolerance_secs() -> u64 {
    DEFAULT_TOLERANCE_SECS
}

/// Extra predicate evaluated after the cron window check passes.
#[async_trait]
pub trait EdgeCondition: Send + Sync {
    async fn evaluate(&self, edge: &Edge, now: DateTime<Utc>) -> bool;
}

/// [`EdgeCondition`] backed by an async closure.
pub struct FnCondition<F>(pub F);

#[async_trait]
impl<F, Fut> EdgeCondition for FnCondition<F>
where
    F: Fn(DateTime<Utc>) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    async fn evaluate(&self, _edge: &Edge, now: DateTime<Utc>) -> bool {
        (self.0)(now).await
    }
}

/// Cron gate attached to an edge.
#[derive(Clone, Serialize, Deserialize)]
pub struct ScheduleConstraint {
    /// Standard 5-field cron (seconds implied as 0), or 6/7 fields with
    /// seconds and optional year.
    pub cron: String,
    /// An IANA zone such as `Europe/Berlin`, `UTC`, `Z`, or a fixed offset
    /// such as `+02:00`. Defaults to UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Half-width of the window around a fire time.
    #[serde(default = "default_tolerance_secs")]
    pub tolerance_secs: u64,
    #[serde(skip)]
    pub condition: Option<Arc<dyn EdgeCondition>>,
}

impl fmt::Debug for ScheduleConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleConstraint")
            .field("cron", &self.cron)
            .field("timezone", &self.timezone)
            .field("tolerance_secs", &self.tolerance_secs)
            .field("condition", &self.condition.is_some())
            .finish()
    }
}

impl ScheduleConstraint {
    pub fn new(cron: impl Into<String>) -> Self {
        Self {
            cron: cron.into(),
            timezone: None,
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
            condition: None,
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    pub fn with_tolerance(mut self, tolerance: std::time::Duration) -> Self {
        self.tolerance_secs = tolerance.as_secs();
        self
    }

    pub fn with_condition(mut self, condition: Arc<dyn EdgeCondition>) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Parse the cron expression and timezone.
    ///
    /// `from`/`to` only label the error.
    pub fn compile(&self, from: &str, to: &str) -> Result<CompiledSchedule, EngineError> {
        let invalid = |message: String| EngineError::InvalidSchedule {
            from: from.to_owned(),
            to: to.to_owned(),
            message,
        };

        let expression = normalize_cron(&self.cron);
        let schedule = Schedule::from_str(&expression)
            .map_err(|e| invalid(format!("cron '{}': {e}", self.cron)))?;

        let zone = match self.timezone.as_deref() {
            None => Zone::Fixed(utc()),
            Some(tz) => parse_zone(tz).ok_or_else(|| invalid(format!("timezone '{tz}'")))?,
        };

        let secs = self.tolerance_secs.min(MAX_TOLERANCE_SECS) as i64;

        Ok(CompiledSchedule {
            schedule,
            zone,
            tolerance: Duration::seconds(secs),
            condition: self.condition.clone(),
        })
    }
}

/// Timezone a schedule is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Zone {
    Fixed(FixedOffset),
    Named(Tz),
}

/// A [`ScheduleConstraint`] ready for evaluation.
#[derive(Clone)]
pub struct CompiledSchedule {
    schedule: Schedule,
    zone: Zone,
    tolerance: Duration,
    condition: Option<Arc<dyn EdgeCondition>>,
}

impl fmt::Debug for CompiledSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledSchedule")
            .field("schedule", &self.schedule.to_string())
            .field("zone", &self.zone)
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl CompiledSchedule {
    /// The fire time closest to `now` that lies within the tolerance
    /// window, if any. On a tie the earlier fire time wins.
    pub fn nearest_fire_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let (previous, next) = match self.zone {
            Zone::Fixed(offset) => neighbours(&self.schedule, &now.with_timezone(&offset))?,
            Zone::Named(tz) => neighbours(&self.schedule, &now.with_timezone(&tz))?,
        };
        let tolerance = self.tolerance.num_milliseconds();

        [previous, next]
            .into_iter()
            .flatten()
            .map(|fire| (fire, (fire - now).num_milliseconds().abs()))
            .filter(|(_, distance)| *distance <= tolerance)
            .min_by_key(|(_, distance)| *distance)
            .map(|(fire, _)| fire)
    }

    /// Whether `edge` may be traversed at `now`. The additional condition is
    /// only awaited once the cron window check has passed.
    pub async fn can_traverse(&self, edge: &Edge, now: DateTime<Utc>) -> bool {
        if self.nearest_fire_time(now).is_none() {
            return false;
        }
        match &self.condition {
            Some(condition) => condition.evaluate(edge, now).await,
            None => true,
        }
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

/// Last fire time before `local` and first fire time at or after it.
fn neighbours<Z: TimeZone>(
    schedule: &Schedule,
    local: &DateTime<Z>,
) -> Option<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
    // cron starts searching at the next whole second, so step back one to
    // include a fire time landing exactly on `local`.
    let from = local.clone().checked_sub_signed(Duration::seconds(1))?;
    let previous = schedule.after(local).next_back().map(|fire| fire.with_timezone(&Utc));
    let next = schedule.after(&from).next().map(|fire| fire.with_timezone(&Utc));
    Some((previous, next))
}

fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_owned()
    }
}

fn parse_zone(raw: &str) -> Option<Zone> {
    parse_offset(raw)
        .map(Zone::Fixed)
        .or_else(|| raw.trim().parse::<Tz>().ok().map(Zone::Named))
}

fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let s = raw.trim();
    if s.eq_ignore_ascii_case("utc") || s == "Z" {
        return Some(utc());
    }
    let s = s.strip_prefix("UTC").unwrap_or(s);

    let (sign, rest) = match s.chars().next()? {
        '+' => (1, &s[1..]),
        '-' => (-1, &s[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !(digits.len() == 2 || digits.len() == 4) || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = if digits.len() == 4 { digits[2..].parse().ok()? } else { 0 };
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, h, m, s).unwrap()
    }

    fn edge() -> Edge {
        Edge::new("a", "b")
    }

    #[tokio::test]
    async fn traversable_within_tolerance_of_a_fire_time() {
        let compiled = ScheduleConstraint::new("*/15 * * * *").compile("a", "b").unwrap();
        assert!(compiled.can_traverse(&edge(), at(10, 15, 30)).await);
        assert!(compiled.can_traverse(&edge(), at(10, 14, 10)).await);
        assert!(compiled.can_traverse(&edge(), at(10, 16, 0)).await);
        assert!(!compiled.can_traverse(&edge(), at(10, 20, 0)).await);
    }

    #[test]
    fn nearest_fire_time_picks_the_closest() {
        let compiled = ScheduleConstraint::new("0 * * * * *")
            .with_tolerance(std::time::Duration::from_secs(90))
            .compile("a", "b")
            .unwrap();
        assert_eq!(compiled.nearest_fire_time(at(10, 0, 40)), Some(at(10, 1, 0)));
        assert_eq!(compiled.nearest_fire_time(at(10, 0, 20)), Some(at(10, 0, 0)));
    }

    #[tokio::test]
    async fn timezone_shifts_the_fire_times() {
        let compiled = ScheduleConstraint::new("0 9 * * *")
            .with_timezone("+02:00")
            .compile("a", "b")
            .unwrap();
        assert!(compiled.can_traverse(&edge(), at(7, 0, 20)).await);
        assert!(!compiled.can_traverse(&edge(), at(9, 0, 0)).await);
    }

    #[tokio::test]
    async fn condition_runs_only_after_the_cron_check() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let condition = FnCondition(move |_now: DateTime<Utc>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { false }
        });
        let compiled = ScheduleConstraint::new("*/15 * * * *")
            .with_condition(Arc::new(condition))
            .compile("a", "b")
            .unwrap();

        assert!(!compiled.can_traverse(&edge(), at(10, 20, 0)).await);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(!compiled.can_traverse(&edge(), at(10, 15, 0)).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn passing_condition_allows_traversal() {
        let compiled = ScheduleConstraint::new("*/15 * * * *")
            .with_condition(Arc::new(FnCondition(|_now: DateTime<Utc>| async { true })))
            .compile("a", "b")
            .unwrap();
        assert!(compiled.can_traverse(&edge(), at(10, 30, 5)).await);
    }

    #[test]
    fn invalid_cron_and_timezone_are_rejected() {
        assert!(matches!(
            ScheduleConstraint::new("not a cron").compile("a", "b"),
            Err(EngineError::InvalidSchedule { .. })
        ));
        assert!(matches!(
            ScheduleConstraint::new("* * * * *").with_timezone("Mars/Olympus").compile("a", "b"),
            Err(EngineError::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn nearest_fire_time_is_exact_for_dense_schedules_and_wide_windows() {
        let compiled = ScheduleConstraint::new("* * * * * *")
            .with_tolerance(std::time::Duration::from_secs(3 * 60 * 60))
            .compile("a", "b")
            .unwrap();
        assert_eq!(compiled.nearest_fire_time(at(10, 0, 0)), Some(at(10, 0, 0)));
        assert_eq!(compiled.nearest_fire_time(at(23, 59, 59)), Some(at(23, 59, 59)));
    }

    #[tokio::test]
    async fn named_timezones_follow_daylight_saving() {
        let compiled = ScheduleConstraint::new("0 9 * * *")
            .with_timezone("America/New_York")
            .compile("a", "b")
            .unwrap();

        // May: EDT, UTC-4
        assert!(compiled.can_traverse(&edge(), at(13, 0, 20)).await);
        assert!(!compiled.can_traverse(&edge(), at(14, 0, 20)).await);

        // January: EST, UTC-5
        let winter = Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 10).unwrap();
        assert!(compiled.can_traverse(&edge(), winter).await);
        assert_eq!(compiled.nearest_fire_time(winter), Some(Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap()));
    }

    #[test]
    fn zones_parse_as_offsets_first_then_names() {
        assert_eq!(parse_zone("UTC"), Some(Zone::Fixed(utc())));
        assert_eq!(parse_zone("+02:00"), FixedOffset::east_opt(2 * 3600).map(Zone::Fixed));
        assert_eq!(parse_zone("Europe/Berlin"), Some(Zone::Named(chrono_tz::Europe::Berlin)));
        assert_eq!(parse_zone("Mars/Olympus"), None);
    }

    #[test]
    fn offsets_parse() {
        assert_eq!(parse_offset("UTC"), Some(utc()));
        assert_eq!(parse_offset("+0530"), FixedOffset::east_opt(5 * 3600 + 30 * 60));
        assert_eq!(parse_offset("UTC-03:00"), FixedOffset::east_opt(-3 * 3600));
        assert_eq!(parse_offset("+25:00"), None);
    }
}
