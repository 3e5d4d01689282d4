//! Adaptive control: scheduled threshold evaluation, condition aggregation,
//! and the plan-change handshake.
//!
//! Every tick the orchestrator claims each active [`rules::TrafficPeriod`],
//! sums the configured flow queries, and recomputes the threshold's matched
//! flag. Programs whose periods were evaluated then get their condition
//! expression checked; a condition that has matched for the required number
//! of consecutive ticks fires a trigger pass over the program's plan table.
//!
//! The trigger runs a 5-step handshake per device, verified step by step
//! because the wire has no transactions: enable dynamic mode, read the
//! strategy back, push the plan parameters, read them back field by field,
//! activate. A device whose handshake fails (after the configured whole-
//! handshake retries) gets one best-effort command reverting it to its
//! built-in time-of-day tables, and the pass moves on to the next device.

pub mod expr;
pub mod rules;

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Local};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ControlConfig;
use crate::connection::ConnectionManager;
use crate::error::{Result, SignalError};
use crate::protocol::payload::{PlanReadback, SignalPlanParameters};
use crate::protocol::ControlStrategy;
use crate::sender::CommandSender;
use crate::services::{AuditSink, Device, DeviceDirectory, FlowQuery, PlanStore, RuleStore};
use rules::{ConditionRule, DayType, RuleSet, TrafficPeriod};

/// Effect time sent with every strategy switch. The device family ignores
/// other values in dynamic mode, so it is not configurable.
pub(crate) const STRATEGY_EFFECT_TIME: u8 = 5;

/// Dynamic control always targets the device's plan slot 0; the configured
/// plan id only selects which parameter set is pushed into it.
pub(crate) const DYNAMIC_PLAN_SLOT: u8 = 0;

/// Compare a pushed parameter set against the device's echo, field by field.
/// Returns one line per mismatched field.
pub(crate) fn verify_plan_echo(sent: &SignalPlanParameters, echo: &PlanReadback) -> Vec<String> {
    fn check(out: &mut Vec<String>, field: &str, expected: String, actual: String) {
        if expected != actual {
            out.push(format!("{field} mismatch: expected={expected}, actual={actual}"));
        }
    }

    let mut mismatches = Vec::new();
    check(&mut mismatches, "planId", sent.plan_id.to_string(), echo.plan_id.to_string());
    check(&mut mismatches, "direct", sent.direct.to_string(), echo.direct.to_string());
    match sent.phase_order_byte() {
        Ok(expected) => {
            check(&mut mismatches, "phaseOrder", expected.to_string(), echo.phase_order.to_string())
        }
        Err(_) => mismatches.push(format!("phaseOrder '{}' unparseable", sent.phase_order)),
    }
    check(&mut mismatches, "cycleTime", sent.cycle_time.to_string(), echo.cycle_time.to_string());
    check(&mut mismatches, "offset", sent.offset.to_string(), echo.offset.to_string());
    check(
        &mut mismatches,
        "subPhaseCount",
        sent.subphases.len().to_string(),
        echo.subphase_count_extended.to_string(),
    );
    check(
        &mut mismatches,
        "subPhaseCount",
        sent.subphases.len().to_string(),
        echo.subphase_count_summary.to_string(),
    );

    for (i, sp) in sent.subphases.iter().enumerate() {
        let m = &mut mismatches;
        if let Some(green) = echo.green.get(i) {
            check(m, &format!("green[{i}]"), sp.green.to_string(), green.to_string());
        }
        let Some(actual) = echo.subphases.get(i) else { continue };
        check(m, &format!("minGreen[{i}]"), sp.min_green.to_string(), actual.min_green.to_string());
        check(m, &format!("maxGreen[{i}]"), sp.max_green.to_string(), actual.max_green.to_string());
        check(m, &format!("yellow[{i}]"), sp.yellow.to_string(), actual.yellow.to_string());
        check(m, &format!("allRed[{i}]"), sp.all_red.to_string(), actual.all_red.to_string());
        check(
            m,
            &format!("pedGreenFlash[{i}]"),
            sp.ped_green_flash.to_string(),
            actual.ped_green_flash.to_string(),
        );
        check(m, &format!("pedRed[{i}]"), sp.ped_red.to_string(), actual.ped_red.to_string());
    }
    mismatches
}

/// Drives the adaptive control loop.
pub struct Orchestrator {
    sender: Arc<CommandSender>,
    manager: Arc<ConnectionManager>,
    directory: Arc<dyn DeviceDirectory>,
    flow: Arc<dyn FlowQuery>,
    rule_store: Arc<dyn RuleStore>,
    plan_store: Arc<dyn PlanStore>,
    audit: Arc<dyn AuditSink>,
    config: ControlConfig,
    rules: RwLock<Arc<RuleSet>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sender: Arc<CommandSender>,
        manager: Arc<ConnectionManager>,
        directory: Arc<dyn DeviceDirectory>,
        flow: Arc<dyn FlowQuery>,
        rule_store: Arc<dyn RuleStore>,
        plan_store: Arc<dyn PlanStore>,
        audit: Arc<dyn AuditSink>,
        config: ControlConfig,
    ) -> Self {
        Self {
            sender,
            manager,
            directory,
            flow,
            rule_store,
            plan_store,
            audit,
            config,
            rules: RwLock::new(Arc::new(RuleSet::empty())),
            shutdown: CancellationToken::new(),
        }
    }

    fn rules(&self) -> Arc<RuleSet> {
        Arc::clone(&self.rules.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Rebuild the compiled rule set from the rule store. Evaluation state
    /// (matched flags, consecutive counters) starts fresh.
    pub async fn reload(&self) -> Result<()> {
        let thresholds = self.rule_store.thresholds().await?;
        let conditions = self.rule_store.conditions().await?;
        let compiled = RuleSet::build(thresholds, conditions)?;
        info!(
            conditions = compiled.conditions().len(),
            periods = compiled.periods().len(),
            "rules reloaded"
        );
        *self.rules.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(compiled);
        Ok(())
    }

    /// Scheduler loop. Runs until [`Orchestrator::stop`].
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => self.tick(Local::now()).await,
            }
        }
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// One scheduler sweep at wall-clock `now`.
    pub async fn tick(&self, now: DateTime<Local>) {
        let rules = self.rules();
        let time = now.time();
        let mut touched_programs: HashSet<String> = HashSet::new();

        for period in rules.periods() {
            if !period.is_active_at(time) {
                continue;
            }
            let Some(guard) = period.try_begin() else {
                debug!(
                    program = %period.program,
                    sub_id = period.sub_id,
                    "evaluation still in progress, skipping"
                );
                continue;
            };
            match self.evaluate_period(&rules, period, now).await {
                Ok(()) => {
                    touched_programs.insert(period.program.clone());
                }
                Err(e) => {
                    warn!(
                        program = %period.program,
                        sub_id = period.sub_id,
                        error = %e,
                        "threshold evaluation failed"
                    );
                }
            }
            drop(guard);
        }

        for condition in rules.conditions() {
            if touched_programs.contains(&condition.spec.program) {
                self.check_condition(&rules, condition, now).await;
            }
        }
    }

    /// Sum the period's flow queries and recompute its matched flag.
    async fn evaluate_period(
        &self,
        rules: &RuleSet,
        period: &Arc<TrafficPeriod>,
        now: DateTime<Local>,
    ) -> Result<()> {
        let threshold = rules.threshold(&period.program, period.sub_id).ok_or_else(|| {
            SignalError::Rule {
                context: format!("program {}", period.program),
                details: format!("period references missing sub-threshold {}", period.sub_id),
            }
        })?;
        let spec = &threshold.spec;

        let mut total = 0.0;
        for detector in &spec.detectors {
            for direction in &spec.directions {
                let segment = rules::parse_direction(direction)?;
                total += self
                    .flow
                    .sum_flow(detector, now, spec.interval_minutes, segment.as_ref())
                    .await?;
            }
        }
        let matched = spec.comparator.compare(total, spec.threshold);
        threshold.set_matched(matched);
        debug!(
            program = %spec.program,
            sub_id = spec.sub_id,
            flow = total,
            threshold = spec.threshold,
            matched,
            "threshold evaluated"
        );
        Ok(())
    }

    /// Evaluate one condition and fire its trigger when the consecutive run
    /// reaches the required length.
    async fn check_condition(
        &self,
        rules: &RuleSet,
        condition: &Arc<ConditionRule>,
        now: DateTime<Local>,
    ) {
        let program = &condition.spec.program;
        let matched = condition
            .expr
            .evaluate(&|id| rules.threshold(program, id).map(|t| t.is_matched()).unwrap_or(false));
        if !matched {
            condition.record_miss();
            debug!(program = %program, "condition not matched, run reset");
            return;
        }
        if condition.record_match() {
            info!(program = %program, expression = condition.expr.text(), "condition fired");
            self.trigger(program, now).await;
        } else {
            debug!(
                program = %program,
                consecutive = condition.consecutive(),
                required = condition.spec.required_consecutive,
                "condition matched, run continuing"
            );
        }
    }

    /// Run the plan-change handshake for every device in the program's plan
    /// table. Per-device failures are logged and do not stop the pass.
    pub async fn trigger(&self, program: &str, now: DateTime<Local>) {
        let day_type = DayType::for_date(now.date_naive());
        let assignments = match self.plan_store.assignments(program, day_type).await {
            Ok(assignments) => assignments,
            Err(e) => {
                warn!(program, ?day_type, error = %e, "plan table unavailable");
                return;
            }
        };

        let mut first = true;
        for assignment in &assignments {
            if !assignment.window.contains(now.time()) {
                continue;
            }
            if !std::mem::take(&mut first) {
                tokio::time::sleep(self.config.device_pacing()).await;
            }

            let device = match self.directory.find_by_id(&assignment.device_id).await {
                Ok(Some(device)) => device,
                Ok(None) => {
                    warn!(device = %assignment.device_id, "assigned device not in directory");
                    continue;
                }
                Err(e) => {
                    warn!(device = %assignment.device_id, error = %e, "directory lookup failed");
                    continue;
                }
            };
            if !device.enabled || !device.dynamic_enabled {
                debug!(device = %device.id, "dynamic control disabled, skipping");
                continue;
            }
            if !self.manager.is_connected(&device.id) {
                warn!(device = %device.id, "not connected, skipping");
                self.audit.control_outcome(&device.id, program, false, "device unreachable").await;
                continue;
            }

            match self.handshake_with_retry(&device, program, assignment.plan_id).await {
                Ok(()) => {
                    info!(device = %device.id, program, plan = assignment.plan_id, "plan applied");
                    self.audit
                        .control_outcome(
                            &device.id,
                            program,
                            true,
                            &format!("plan {} applied", assignment.plan_id),
                        )
                        .await;
                }
                Err(e) => {
                    error!(device = %device.id, program, error = %e, "handshake failed");
                    self.audit.control_outcome(&device.id, program, false, &e.to_string()).await;
                    self.fallback_to_time_of_day(&device).await;
                }
            }
        }
    }

    async fn handshake_with_retry(
        &self,
        device: &Device,
        program: &str,
        plan_id: u8,
    ) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=self.config.handshake_attempts.max(1) {
            if attempt > 1 {
                tokio::time::sleep(self.config.step_pacing()).await;
            }
            match self.run_handshake(device, program, plan_id).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(device = %device.id, attempt, error = %e, "handshake attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| SignalError::RetriesExhausted {
            device: device.id.clone(),
            command: "handshake".to_string(),
            attempts: self.config.handshake_attempts,
        }))
    }

    /// The 5-step plan-change handshake against one device.
    async fn run_handshake(&self, device: &Device, program: &str, plan_id: u8) -> Result<()> {
        let pace = self.config.step_pacing();

        // 1. Switch the device into dynamic mode.
        self.sender
            .enable_strategy(&device.id, ControlStrategy::Dynamic, STRATEGY_EFFECT_TIME)
            .await?;
        tokio::time::sleep(pace).await;

        // 2. Read the strategy back; the switch is only real once echoed.
        let status = self.sender.query_strategy(&device.id).await?;
        let mut mismatches = Vec::new();
        if status.control_strategy != ControlStrategy::Dynamic.code() {
            mismatches.push(format!(
                "controlStrategy mismatch: expected={}, actual={}",
                ControlStrategy::Dynamic.code(),
                status.control_strategy
            ));
        }
        if status.effect_time != STRATEGY_EFFECT_TIME {
            mismatches.push(format!(
                "effectTime mismatch: expected={STRATEGY_EFFECT_TIME}, actual={}",
                status.effect_time
            ));
        }
        if !mismatches.is_empty() {
            return Err(SignalError::Verification { device: device.id.clone(), mismatches });
        }
        tokio::time::sleep(pace).await;

        // 3. Push the configured parameters into the dynamic plan slot.
        let mut params = self
            .plan_store
            .parameters(program, &device.id, plan_id)
            .await?
            .ok_or_else(|| SignalError::Rule {
                context: format!("program {program}"),
                details: format!("no parameters for device {} plan {plan_id}", device.id),
            })?;
        params.plan_id = DYNAMIC_PLAN_SLOT;
        self.sender.set_plan(&device.id, &params).await?;
        tokio::time::sleep(pace).await;

        // 4. Read the plan back and require a field-exact echo.
        let echo = self.sender.read_plan(&device.id, DYNAMIC_PLAN_SLOT).await?;
        let mismatches = verify_plan_echo(&params, &echo);
        if !mismatches.is_empty() {
            return Err(SignalError::Verification { device: device.id.clone(), mismatches });
        }
        tokio::time::sleep(pace).await;

        // 5. Activate.
        self.sender.activate_plan(&device.id, DYNAMIC_PLAN_SLOT).await
    }

    /// Best-effort revert to the device's built-in time-of-day tables. Not
    /// retried beyond the sender's own budget; failure only logs.
    async fn fallback_to_time_of_day(&self, device: &Device) {
        info!(device = %device.id, "reverting to time-of-day strategy");
        if let Err(e) = self
            .sender
            .enable_strategy(&device.id, ControlStrategy::TimeOfDay, STRATEGY_EFFECT_TIME)
            .await
        {
            error!(device = %device.id, error = %e, "time-of-day fallback failed");
            self.audit
                .control_outcome(&device.id, "fallback", false, &e.to_string())
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::payload::{SubphaseEcho, SubphaseTiming};

    fn sent() -> SignalPlanParameters {
        SignalPlanParameters {
            plan_id: 0,
            direct: 1,
            phase_order: "1A".to_string(),
            cycle_time: 60,
            offset: 10,
            subphases: vec![SubphaseTiming {
                green: 30,
                min_green: 10,
                max_green: 300,
                yellow: 3,
                all_red: 2,
                ped_green_flash: 5,
                ped_red: 12,
            }],
        }
    }

    fn echo() -> PlanReadback {
        PlanReadback {
            plan_id: 0,
            direct: 1,
            phase_order: 0x1A,
            cycle_time: 60,
            offset: 10,
            subphase_count_extended: 1,
            subphase_count_summary: 1,
            green: vec![30],
            subphases: vec![SubphaseEcho {
                min_green: 10,
                max_green: 300,
                yellow: 3,
                all_red: 2,
                ped_green_flash: 5,
                ped_red: 12,
            }],
        }
    }

    #[test]
    fn matching_echo_verifies_clean() {
        assert!(verify_plan_echo(&sent(), &echo()).is_empty());
    }

    #[test]
    fn cycle_time_mismatch_is_reported_with_both_values() {
        let mut echo = echo();
        echo.cycle_time = 61;
        let mismatches = verify_plan_echo(&sent(), &echo);
        assert_eq!(mismatches, vec!["cycleTime mismatch: expected=60, actual=61".to_string()]);
    }

    #[test]
    fn every_differing_field_is_listed() {
        let mut echo = echo();
        echo.green = vec![31];
        echo.subphases[0].yellow = 4;
        echo.phase_order = 0x1B;
        let mismatches = verify_plan_echo(&sent(), &echo);
        assert_eq!(mismatches.len(), 3);
        assert!(mismatches.iter().any(|m| m.starts_with("phaseOrder mismatch")));
        assert!(mismatches.iter().any(|m| m == "green[0] mismatch: expected=30, actual=31"));
        assert!(mismatches.iter().any(|m| m == "yellow[0] mismatch: expected=3, actual=4"));
    }

    #[test]
    fn unparseable_phase_order_is_reported_alongside_field_checks() {
        let mut sent = sent();
        sent.phase_order = "XZ".to_string();
        let mut echo = echo();
        echo.offset = 11;
        let mismatches = verify_plan_echo(&sent, &echo);
        assert_eq!(mismatches.len(), 2);
        assert!(mismatches.contains(&"phaseOrder 'XZ' unparseable".to_string()));
        assert!(mismatches.contains(&"offset mismatch: expected=10, actual=11".to_string()));
    }

    #[test]
    fn subphase_count_mismatch_is_caught_for_both_frames() {
        let mut echo = echo();
        echo.subphase_count_summary = 2;
        let mismatches = verify_plan_echo(&sent(), &echo);
        assert_eq!(mismatches, vec!["subPhaseCount mismatch: expected=1, actual=2".to_string()]);
    }
}
