//! Per-command payload layouts and status-reply decoding.
//!
//! Command frames (host → controller):
//!
//! | Command | Frame length | Payload |
//! |---|---|---|
//! | 5F10 EnableStrategy | 14 | strategy(1), effectTime(1) |
//! | 5F14 SetSubphaseExtended | 14 + 7N | planId(1), N(1), N × {minGreen(1), maxGreen(2 BE), yellow(1), allRed(1), pedGreenFlash(1), pedRed(1)} |
//! | 5F15 SetPlanSummary | 20 + 2N | planId(1), direct(1), phaseOrder(1), N(1), N × green(2 BE), cycleTime(2 BE), offset(2 BE) |
//! | 5F18 ActivatePlan | 13 | planId(1) |
//! | 5F40 QueryStrategy | 12 | — |
//! | 5F44 QuerySubphaseExtended | 13 | planId(1) |
//! | 5F45 QueryPlanSummary | 13 | planId(1) |
//!
//! Status frames (controller → host) are decoded from the *destuffed* frame:
//! 5FC0 answers 5F40, 5FC4 answers 5F44, 5FC5 answers 5F45. 5FC4 and 5FC5 are
//! two physical frames describing one logical plan readback; [`PlanReadback`]
//! merges them under the shared plan id before the sender reports the read as
//! complete.

use serde::{Deserialize, Serialize};

use super::{CommandId, HEADER_LEN};
use crate::error::{Result, SignalError};

/// Per-subphase timing set, as configured and as pushed to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubphaseTiming {
    pub green: u16,
    #[serde(rename = "minGreen")]
    pub min_green: u8,
    #[serde(rename = "maxGreen")]
    pub max_green: u16,
    pub yellow: u8,
    #[serde(rename = "allRed")]
    pub all_red: u8,
    #[serde(rename = "pedGreenFlash")]
    pub ped_green_flash: u8,
    #[serde(rename = "pedRed")]
    pub ped_red: u8,
}

/// Complete parameter set for one signal plan: what a plan push sends and a
/// plan readback must echo.
///
/// `phase_order` is kept as the two-digit hex text the plan tables use; it is
/// parsed to a byte at encode time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalPlanParameters {
    #[serde(rename = "planId")]
    pub plan_id: u8,
    pub direct: u8,
    #[serde(rename = "phaseOrder")]
    pub phase_order: String,
    #[serde(rename = "cycleTime")]
    pub cycle_time: u16,
    pub offset: u16,
    #[serde(rename = "subPhases")]
    pub subphases: Vec<SubphaseTiming>,
}

impl SignalPlanParameters {
    /// Parse the hex `phase_order` text into its wire byte.
    pub fn phase_order_byte(&self) -> Result<u8> {
        u8::from_str_radix(self.phase_order.trim(), 16).map_err(|e| SignalError::Encode {
            command: CommandId::SetPlanSummary.label().to_string(),
            details: format!("phaseOrder '{}' is not a hex byte: {e}", self.phase_order),
        })
    }
}

/// A command with its payload fields, ready for encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// 5F10 — switch control strategy.
    EnableStrategy { strategy: u8, effect_time: u8 },
    /// 5F14 — push per-subphase extended timings.
    SetSubphaseExtended { plan_id: u8, subphases: Vec<SubphaseTiming> },
    /// 5F15 — push the plan summary.
    SetPlanSummary {
        plan_id: u8,
        direct: u8,
        phase_order: u8,
        green: Vec<u16>,
        cycle_time: u16,
        offset: u16,
    },
    /// 5F18 — activate a plan.
    ActivatePlan { plan_id: u8 },
    /// 5F40 — query the active strategy.
    QueryStrategy,
    /// 5F44 — query subphase timings.
    QuerySubphaseExtended { plan_id: u8 },
    /// 5F45 — query the plan summary.
    QueryPlanSummary { plan_id: u8 },
}

impl Command {
    pub fn id(&self) -> CommandId {
        match self {
            Command::EnableStrategy { .. } => CommandId::EnableStrategy,
            Command::SetSubphaseExtended { .. } => CommandId::SetSubphaseExtended,
            Command::SetPlanSummary { .. } => CommandId::SetPlanSummary,
            Command::ActivatePlan { .. } => CommandId::ActivatePlan,
            Command::QueryStrategy => CommandId::QueryStrategy,
            Command::QuerySubphaseExtended { .. } => CommandId::QuerySubphaseExtended,
            Command::QueryPlanSummary { .. } => CommandId::QueryPlanSummary,
        }
    }

    /// Encode the payload bytes following the command family.
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Command::EnableStrategy { strategy, effect_time } => vec![*strategy, *effect_time],
            Command::SetSubphaseExtended { plan_id, subphases } => {
                let mut buf = Vec::with_capacity(2 + 7 * subphases.len());
                buf.push(*plan_id);
                buf.push(subphases.len() as u8);
                for sp in subphases {
                    buf.push(sp.min_green);
                    buf.extend_from_slice(&sp.max_green.to_be_bytes());
                    buf.push(sp.yellow);
                    buf.push(sp.all_red);
                    buf.push(sp.ped_green_flash);
                    buf.push(sp.ped_red);
                }
                buf
            }
            Command::SetPlanSummary { plan_id, direct, phase_order, green, cycle_time, offset } => {
                let mut buf = Vec::with_capacity(8 + 2 * green.len());
                buf.push(*plan_id);
                buf.push(*direct);
                buf.push(*phase_order);
                buf.push(green.len() as u8);
                for g in green {
                    buf.extend_from_slice(&g.to_be_bytes());
                }
                buf.extend_from_slice(&cycle_time.to_be_bytes());
                buf.extend_from_slice(&offset.to_be_bytes());
                buf
            }
            Command::ActivatePlan { plan_id }
            | Command::QuerySubphaseExtended { plan_id }
            | Command::QueryPlanSummary { plan_id } => vec![*plan_id],
            Command::QueryStrategy => Vec::new(),
        }
    }

    /// The two frames that push a plan: 5F14 followed by 5F15.
    pub fn plan_push_pair(params: &SignalPlanParameters) -> Result<(Command, Command)> {
        let phase_order = params.phase_order_byte()?;
        let first = Command::SetSubphaseExtended {
            plan_id: params.plan_id,
            subphases: params.subphases.clone(),
        };
        let second = Command::SetPlanSummary {
            plan_id: params.plan_id,
            direct: params.direct,
            phase_order,
            green: params.subphases.iter().map(|sp| sp.green).collect(),
            cycle_time: params.cycle_time,
            offset: params.offset,
        };
        Ok((first, second))
    }
}

/// Decoded 5FC0 strategy report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyStatus {
    pub control_strategy: u8,
    pub effect_time: u8,
}

/// Decoded 5FC4 subphase echo for one subphase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubphaseEcho {
    pub min_green: u8,
    pub max_green: u16,
    pub yellow: u8,
    pub all_red: u8,
    pub ped_green_flash: u8,
    pub ped_red: u8,
}

/// Decoded 5FC4 frame: per-subphase extended timings for one plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubphaseReadback {
    pub plan_id: u8,
    pub subphases: Vec<SubphaseEcho>,
}

/// Decoded 5FC5 frame: plan-level summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSummaryReadback {
    pub plan_id: u8,
    pub direct: u8,
    pub phase_order: u8,
    pub green: Vec<u16>,
    pub cycle_time: u16,
    pub offset: u16,
}

/// The merged 5FC4 + 5FC5 view of a plan as the device reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanReadback {
    pub plan_id: u8,
    pub direct: u8,
    pub phase_order: u8,
    pub cycle_time: u16,
    pub offset: u16,
    pub subphase_count_extended: u8,
    pub subphase_count_summary: u8,
    pub green: Vec<u16>,
    pub subphases: Vec<SubphaseEcho>,
}

impl PlanReadback {
    /// Merge the two physical frames of a plan read into one logical reply.
    ///
    /// The plan id is taken from the summary frame; both frames were
    /// correlated under the same plan id before this is called.
    pub fn merge(extended: SubphaseReadback, summary: PlanSummaryReadback) -> Self {
        Self {
            plan_id: summary.plan_id,
            direct: summary.direct,
            phase_order: summary.phase_order,
            cycle_time: summary.cycle_time,
            offset: summary.offset,
            subphase_count_extended: extended.subphases.len() as u8,
            subphase_count_summary: summary.green.len() as u8,
            green: summary.green,
            subphases: extended.subphases,
        }
    }
}

/// Decoded 0F80 (positive) / 0F81 (negative) command result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub positive: bool,
    /// The echoed command this result answers.
    pub echoed: [u8; 2],
    /// Rejection detail, only present on 0F81.
    pub error_code: u8,
    pub parameter_number: u8,
    /// Hex dump of the result bytes as published on the bridge.
    pub res_data: String,
}

fn require_len(frame: &[u8], need: usize, context: &str) -> Result<()> {
    if frame.len() < need {
        return Err(SignalError::decode_error(
            context,
            format!("frame too short: need {need} bytes, have {}", frame.len()),
        ));
    }
    Ok(())
}

fn be_u16(frame: &[u8], offset: usize) -> u16 {
    u16::from(frame[offset]) << 8 | u16::from(frame[offset + 1])
}

fn hex_span(frame: &[u8], range: std::ops::Range<usize>) -> String {
    frame[range].iter().map(|b| format!("{b:02x}")).collect()
}

/// Decode a destuffed 5FC0 frame.
pub fn decode_strategy_status(frame: &[u8]) -> Result<StrategyStatus> {
    require_len(frame, HEADER_LEN + 2, "5fc0")?;
    Ok(StrategyStatus { control_strategy: frame[9], effect_time: frame[10] })
}

/// Decode a destuffed 5FC4 frame.
pub fn decode_subphase_readback(frame: &[u8]) -> Result<SubphaseReadback> {
    require_len(frame, HEADER_LEN + 2, "5fc4")?;
    let plan_id = frame[9];
    let count = usize::from(frame[10]);
    require_len(frame, HEADER_LEN + 2 + 7 * count, "5fc4")?;

    let mut subphases = Vec::with_capacity(count);
    let mut at = 11;
    for _ in 0..count {
        subphases.push(SubphaseEcho {
            min_green: frame[at],
            max_green: be_u16(frame, at + 1),
            yellow: frame[at + 3],
            all_red: frame[at + 4],
            ped_green_flash: frame[at + 5],
            ped_red: frame[at + 6],
        });
        at += 7;
    }
    Ok(SubphaseReadback { plan_id, subphases })
}

/// Decode a destuffed 5FC5 frame.
pub fn decode_plan_summary_readback(frame: &[u8]) -> Result<PlanSummaryReadback> {
    require_len(frame, HEADER_LEN + 4, "5fc5")?;
    let plan_id = frame[9];
    let direct = frame[10];
    let phase_order = frame[11];
    let count = usize::from(frame[12]);
    require_len(frame, HEADER_LEN + 4 + 2 * count + 4, "5fc5")?;

    let mut green = Vec::with_capacity(count);
    let mut at = 13;
    for _ in 0..count {
        green.push(be_u16(frame, at));
        at += 2;
    }
    let cycle_time = be_u16(frame, at);
    let offset = be_u16(frame, at + 2);
    Ok(PlanSummaryReadback { plan_id, direct, phase_order, green, cycle_time, offset })
}

/// Decode a destuffed 0F80/0F81 frame.
pub fn decode_command_result(frame: &[u8]) -> Result<CommandResult> {
    require_len(frame, HEADER_LEN + 2, "0f8x")?;
    let positive = match frame[8] {
        0x80 => true,
        0x81 => false,
        other => {
            return Err(SignalError::decode_error(
                "0f8x",
                format!("unexpected result family byte {other:#04x}"),
            ));
        }
    };
    let echoed = [frame[9], frame[10]];
    if positive {
        Ok(CommandResult {
            positive,
            echoed,
            error_code: 0,
            parameter_number: 0,
            res_data: hex_span(frame, 7..11),
        })
    } else {
        require_len(frame, HEADER_LEN + 4, "0f81")?;
        Ok(CommandResult {
            positive,
            echoed,
            error_code: frame[11],
            parameter_number: frame[12],
            res_data: hex_span(frame, 7..13),
        })
    }
}
