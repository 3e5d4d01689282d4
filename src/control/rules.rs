//! Rule rows and their runtime state.
//!
//! The rule store supplies plain rows ([`ThresholdSpec`], [`ConditionSpec`]);
//! [`RuleSet::build`] compiles them into runtime rules carrying the mutable
//! evaluation state: the per-threshold matched flag, the per-condition
//! consecutive-match counter, and one [`TrafficPeriod`] per schedule window
//! with its re-entrancy guard.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::expr::ConditionExpr;
use crate::error::{Result, SignalError};
use crate::services::FlowSegment;

/// Which plan table a calendar day selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DayType {
    Weekday,
    Holiday,
}

impl DayType {
    /// Weekends count as holidays; a richer holiday calendar is the plan
    /// store's concern.
    pub fn for_date(date: NaiveDate) -> Self {
        match date.weekday() {
            Weekday::Sat | Weekday::Sun => DayType::Holiday,
            _ => DayType::Weekday,
        }
    }
}

/// Comparison operator of a threshold rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "==")]
    Equal,
}

impl Comparator {
    pub fn compare(self, flow: f64, threshold: f64) -> bool {
        match self {
            Comparator::Greater => flow > threshold,
            Comparator::GreaterOrEqual => flow >= threshold,
            Comparator::Less => flow < threshold,
            Comparator::LessOrEqual => flow <= threshold,
            Comparator::Equal => flow == threshold,
        }
    }
}

/// A daily time window. `start == end` never matches; a window whose end is
/// before its start wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ScheduleWindow {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= time && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// One threshold rule row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSpec {
    pub program: String,
    /// Id the program's condition expression references.
    #[serde(rename = "subId")]
    pub sub_id: u32,
    pub detectors: Vec<String>,
    /// `"ALL"` or `"<from>-<to>"` segment names, one flow query each.
    pub directions: Vec<String>,
    #[serde(rename = "intervalMinutes")]
    pub interval_minutes: u32,
    pub comparator: Comparator,
    pub threshold: f64,
    pub windows: Vec<ScheduleWindow>,
}

/// One condition rule row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub program: String,
    pub expression: String,
    #[serde(rename = "requiredConsecutive")]
    pub required_consecutive: u32,
}

/// A device-to-plan assignment inside a program's day-type table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanAssignment {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "planId")]
    pub plan_id: u8,
    pub window: ScheduleWindow,
}

/// Parse a direction into the flow query's segment restriction.
pub fn parse_direction(text: &str) -> Result<Option<FlowSegment>> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("ALL") {
        return Ok(None);
    }
    match text.split_once('-') {
        Some((from, to)) if !from.is_empty() && !to.is_empty() => {
            Ok(Some(FlowSegment { from: from.to_string(), to: to.to_string() }))
        }
        _ => Err(SignalError::Rule {
            context: "direction".to_string(),
            details: format!("'{text}' is neither ALL nor <from>-<to>"),
        }),
    }
}

/// A threshold rule with its matched flag.
#[derive(Debug)]
pub struct ThresholdRule {
    pub spec: ThresholdSpec,
    matched: AtomicBool,
}

impl ThresholdRule {
    fn new(spec: ThresholdSpec) -> Self {
        Self { spec, matched: AtomicBool::new(false) }
    }

    pub fn set_matched(&self, matched: bool) {
        self.matched.store(matched, Ordering::Release);
    }

    pub fn is_matched(&self) -> bool {
        self.matched.load(Ordering::Acquire)
    }
}

/// A condition rule with its compiled expression and consecutive counter.
#[derive(Debug)]
pub struct ConditionRule {
    pub spec: ConditionSpec,
    pub expr: ConditionExpr,
    consecutive: AtomicU32,
}

impl ConditionRule {
    fn new(spec: ConditionSpec) -> Result<Self> {
        let expr = ConditionExpr::parse(&spec.expression)?;
        Ok(Self { spec, expr, consecutive: AtomicU32::new(0) })
    }

    /// Count one matching tick. Returns true when the required run length is
    /// reached; the counter resets on fire.
    pub fn record_match(&self) -> bool {
        let count = self.consecutive.fetch_add(1, Ordering::AcqRel) + 1;
        if count >= self.spec.required_consecutive.max(1) {
            self.consecutive.store(0, Ordering::Release);
            return true;
        }
        false
    }

    /// A non-matching tick resets the run.
    pub fn record_miss(&self) {
        self.consecutive.store(0, Ordering::Release);
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive.load(Ordering::Acquire)
    }
}

/// One evaluation slot: a threshold's schedule window with the re-entrancy
/// guard the scheduler honors.
#[derive(Debug)]
pub struct TrafficPeriod {
    pub program: String,
    pub sub_id: u32,
    pub window: ScheduleWindow,
    in_progress: AtomicBool,
}

impl TrafficPeriod {
    fn new(program: String, sub_id: u32, window: ScheduleWindow) -> Self {
        Self { program, sub_id, window, in_progress: AtomicBool::new(false) }
    }

    pub fn is_active_at(&self, time: NaiveTime) -> bool {
        self.window.contains(time)
    }

    /// Claim the period for evaluation. `None` while another evaluation is
    /// still running; the guard releases the claim on every exit path.
    pub fn try_begin(self: &Arc<Self>) -> Option<PeriodGuard> {
        if self.in_progress.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
        {
            Some(PeriodGuard { period: Arc::clone(self) })
        } else {
            None
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }
}

/// RAII claim on a [`TrafficPeriod`].
#[derive(Debug)]
pub struct PeriodGuard {
    period: Arc<TrafficPeriod>,
}

impl Drop for PeriodGuard {
    fn drop(&mut self) {
        self.period.in_progress.store(false, Ordering::Release);
    }
}

/// The compiled rule state for one load generation.
#[derive(Debug, Default)]
pub struct RuleSet {
    thresholds: HashMap<(String, u32), Arc<ThresholdRule>>,
    conditions: Vec<Arc<ConditionRule>>,
    periods: Vec<Arc<TrafficPeriod>>,
}

impl RuleSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile rule rows. Every condition expression must parse, and every
    /// variable it references must have a threshold row in the same program.
    pub fn build(
        thresholds: Vec<ThresholdSpec>,
        conditions: Vec<ConditionSpec>,
    ) -> Result<Self> {
        let mut threshold_map = HashMap::new();
        let mut periods = Vec::new();
        for spec in thresholds {
            for window in &spec.windows {
                periods.push(Arc::new(TrafficPeriod::new(
                    spec.program.clone(),
                    spec.sub_id,
                    *window,
                )));
            }
            threshold_map
                .insert((spec.program.clone(), spec.sub_id), Arc::new(ThresholdRule::new(spec)));
        }

        let mut compiled = Vec::with_capacity(conditions.len());
        for spec in conditions {
            let rule = ConditionRule::new(spec)?;
            for id in rule.expr.variables() {
                if !threshold_map.contains_key(&(rule.spec.program.clone(), id)) {
                    return Err(SignalError::Rule {
                        context: format!("program {}", rule.spec.program),
                        details: format!(
                            "expression '{}' references missing sub-threshold {id}",
                            rule.spec.expression
                        ),
                    });
                }
            }
            compiled.push(Arc::new(rule));
        }

        debug!(
            thresholds = threshold_map.len(),
            conditions = compiled.len(),
            periods = periods.len(),
            "rule set compiled"
        );
        Ok(Self { thresholds: threshold_map, conditions: compiled, periods })
    }

    pub fn threshold(&self, program: &str, sub_id: u32) -> Option<&Arc<ThresholdRule>> {
        self.thresholds.get(&(program.to_string(), sub_id))
    }

    pub fn conditions(&self) -> &[Arc<ConditionRule>] {
        &self.conditions
    }

    pub fn periods(&self) -> &[Arc<TrafficPeriod>] {
        &self.periods
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(start: (u32, u32), end: (u32, u32)) -> ScheduleWindow {
        ScheduleWindow {
            start: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            end: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
        }
    }

    fn threshold(program: &str, sub_id: u32) -> ThresholdSpec {
        ThresholdSpec {
            program: program.to_string(),
            sub_id,
            detectors: vec!["D-1".to_string()],
            directions: vec!["ALL".to_string()],
            interval_minutes: 10,
            comparator: Comparator::GreaterOrEqual,
            threshold: 100.0,
            windows: vec![window((7, 0), (9, 0))],
        }
    }

    fn condition(program: &str, expression: &str, required: u32) -> ConditionSpec {
        ConditionSpec {
            program: program.to_string(),
            expression: expression.to_string(),
            required_consecutive: required,
        }
    }

    #[test]
    fn day_type_treats_weekends_as_holidays() {
        // 2026-08-24 is a Monday.
        assert_eq!(DayType::for_date(NaiveDate::from_ymd_opt(2026, 8, 24).unwrap()), DayType::Weekday);
        assert_eq!(DayType::for_date(NaiveDate::from_ymd_opt(2026, 8, 29).unwrap()), DayType::Holiday);
        assert_eq!(DayType::for_date(NaiveDate::from_ymd_opt(2026, 8, 30).unwrap()), DayType::Holiday);
    }

    #[test]
    fn windows_handle_midnight_wrap() {
        let day = window((7, 0), (9, 0));
        assert!(day.contains(NaiveTime::from_hms_opt(8, 0, 0).unwrap()));
        assert!(!day.contains(NaiveTime::from_hms_opt(9, 0, 0).unwrap()));

        let night = window((22, 0), (6, 0));
        assert!(night.contains(NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(night.contains(NaiveTime::from_hms_opt(2, 0, 0).unwrap()));
        assert!(!night.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn threshold_rows_deserialize_with_time_windows() {
        let yaml = "\
program: P1
subId: 1
detectors: [D-1]
directions: [ALL]
intervalMinutes: 10
comparator: \">=\"
threshold: 100.0
windows:
  - start: \"07:00:00\"
    end: \"09:00:00\"
";
        let spec: ThresholdSpec = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(spec.comparator, Comparator::GreaterOrEqual);
        assert_eq!(spec.windows, vec![window((7, 0), (9, 0))]);
    }

    #[test]
    fn direction_parsing() {
        assert_eq!(parse_direction("ALL").unwrap(), None);
        assert_eq!(parse_direction("all").unwrap(), None);
        assert_eq!(
            parse_direction("N12-S04").unwrap(),
            Some(FlowSegment { from: "N12".to_string(), to: "S04".to_string() })
        );
        assert!(parse_direction("N12-").is_err());
        assert!(parse_direction("sideways").is_err());
    }

    #[test]
    fn consecutive_counter_fires_at_required_and_resets() {
        let rule = ConditionRule::new(condition("P1", "1 || 2", 2)).unwrap();
        assert!(!rule.record_match());
        assert_eq!(rule.consecutive(), 1);
        assert!(rule.record_match());
        assert_eq!(rule.consecutive(), 0);
    }

    #[test]
    fn a_miss_resets_the_run() {
        let rule = ConditionRule::new(condition("P1", "1", 3)).unwrap();
        assert!(!rule.record_match());
        assert!(!rule.record_match());
        rule.record_miss();
        assert_eq!(rule.consecutive(), 0);
        assert!(!rule.record_match());
    }

    #[test]
    fn required_count_of_zero_fires_immediately() {
        let rule = ConditionRule::new(condition("P1", "1", 0)).unwrap();
        assert!(rule.record_match());
    }

    #[test]
    fn period_guard_blocks_reentry_until_dropped() {
        let period = Arc::new(TrafficPeriod::new("P1".to_string(), 1, window((0, 0), (23, 59))));
        let guard = period.try_begin().expect("first claim succeeds");
        assert!(period.is_in_progress());
        assert!(period.try_begin().is_none());
        drop(guard);
        assert!(!period.is_in_progress());
        assert!(period.try_begin().is_some());
    }

    #[test]
    fn build_derives_one_period_per_window() {
        let mut spec = threshold("P1", 1);
        spec.windows.push(window((17, 0), (19, 0)));
        let rules = RuleSet::build(vec![spec, threshold("P1", 2)], vec![condition("P1", "1 && 2", 2)])
            .unwrap();
        assert_eq!(rules.periods().len(), 3);
        assert_eq!(rules.conditions().len(), 1);
        assert!(rules.threshold("P1", 1).is_some());
        assert!(rules.threshold("P1", 3).is_none());
    }

    #[test]
    fn build_rejects_expressions_referencing_missing_thresholds() {
        let err =
            RuleSet::build(vec![threshold("P1", 1)], vec![condition("P1", "1 || 2", 1)]).unwrap_err();
        assert!(matches!(err, SignalError::Rule { .. }));
        assert!(err.to_string().contains("sub-threshold 2"));
    }

    #[test]
    fn matched_flag_is_recomputed_not_latched() {
        let rules = RuleSet::build(vec![threshold("P1", 1)], vec![]).unwrap();
        let rule = rules.threshold("P1", 1).unwrap();
        assert!(!rule.is_matched());
        rule.set_matched(true);
        assert!(rule.is_matched());
        rule.set_matched(false);
        assert!(!rule.is_matched());
    }
}
