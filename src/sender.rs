//! Command transmission with correlated-reply waits, timeouts, and retries.
//!
//! A logical send draws one sequence number, encodes one frame, and transmits
//! it up to the configured attempt budget. Between attempts the sender waits
//! for whichever correlation key resolves first: the positive result, the
//! negative result, or a transport NAK echoing our sequence. Timeouts and
//! negative replies consume an attempt; the frame itself is byte-identical
//! across attempts so the device sees a straight retransmission.
//!
//! Two-frame handshakes (5F14+5F15 plan push, 5F44+5F45 plan read) send the
//! first frame, require its success, then send the second and report only the
//! second frame's outcome. The first half's table entry is held until the
//! second half resolves.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::ProtocolConfig;
use crate::connection::registry::{
    nak_key, plan_readback_key, result_key, strategy_status_key, subphase_readback_key, Response,
};
use crate::connection::{ConnectionHandle, ConnectionManager};
use crate::error::{FrameErrorCode, Result, SignalError};
use crate::protocol::frame::encode;
use crate::protocol::payload::{
    decode_command_result, decode_strategy_status, Command, CommandResult, PlanReadback,
    SignalPlanParameters, StrategyStatus,
};
use crate::protocol::{CommandId, ControlStrategy, SequenceCounter};
use crate::services::AuditSink;

/// Outcome notifications the bridge publishes to the outside world.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// A device acknowledged (0F80) or rejected (0F81) a command.
    CommandResult { device_id: String, command: CommandId, result: CommandResult },
    /// A device reported its active strategy (5FC0).
    StrategyReport { device_id: String, status: StrategyStatus, res_data: String },
}

/// Sends commands to controllers through the [`ConnectionManager`].
pub struct CommandSender {
    manager: Arc<ConnectionManager>,
    audit: Arc<dyn AuditSink>,
    config: ProtocolConfig,
    seq: SequenceCounter,
    events: mpsc::UnboundedSender<BridgeEvent>,
}

impl CommandSender {
    /// Build a sender and the event stream the bridge consumes.
    pub fn new(
        manager: Arc<ConnectionManager>,
        audit: Arc<dyn AuditSink>,
        config: ProtocolConfig,
    ) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (Self { manager, audit, config, seq: SequenceCounter::new(), events }, receiver)
    }

    /// 5F10: switch the device's control strategy.
    pub async fn enable_strategy(
        &self,
        device_id: &str,
        strategy: ControlStrategy,
        effect_time: u8,
    ) -> Result<()> {
        let handle = self.manager.handle(device_id)?;
        let command = Command::EnableStrategy { strategy: strategy.code(), effect_time };
        let success = [result_key(true, command.id().label())];
        let response = self
            .transmit_and_wait(&handle, &command, &success, self.config.ack_timeout(), false)
            .await?;
        self.emit_result(device_id, command.id(), &response);
        Ok(())
    }

    /// 5F18: activate a plan.
    pub async fn activate_plan(&self, device_id: &str, plan_id: u8) -> Result<()> {
        let handle = self.manager.handle(device_id)?;
        let command = Command::ActivatePlan { plan_id };
        let success = [result_key(true, command.id().label())];
        let response = self
            .transmit_and_wait(&handle, &command, &success, self.config.ack_timeout(), false)
            .await?;
        self.emit_result(device_id, command.id(), &response);
        Ok(())
    }

    /// 5F14 + 5F15: push a complete plan parameter set.
    pub async fn set_plan(&self, device_id: &str, params: &SignalPlanParameters) -> Result<()> {
        let handle = self.manager.handle(device_id)?;
        let (first, second) = Command::plan_push_pair(params)?;

        let first_success = [result_key(true, first.id().label())];
        self.transmit_and_wait(&handle, &first, &first_success, self.config.ack_timeout(), true)
            .await?;

        let second_success = [result_key(true, second.id().label())];
        let outcome = self
            .transmit_and_wait(&handle, &second, &second_success, self.config.ack_timeout(), false)
            .await;
        // Whichever way the pair ended, nothing may linger for its first half.
        handle.table().remove(&first_success[0]);

        let response = outcome?;
        self.emit_result(device_id, second.id(), &response);
        Ok(())
    }

    /// 5F40: read the device's active strategy.
    pub async fn query_strategy(&self, device_id: &str) -> Result<StrategyStatus> {
        let handle = self.manager.handle(device_id)?;
        let command = Command::QueryStrategy;
        let success = [strategy_status_key()];
        let response = self
            .transmit_and_wait(&handle, &command, &success, self.config.readback_timeout(), false)
            .await?;
        let frame = frame_bytes(response, "5fc0")?;
        let status = decode_strategy_status(&frame)?;
        let res_data = hex_span(&frame, 7..11);
        let _ = self.events.send(BridgeEvent::StrategyReport {
            device_id: device_id.to_string(),
            status,
            res_data,
        });
        Ok(status)
    }

    /// 5F44 + 5F45: read a plan back as one merged readback.
    pub async fn read_plan(&self, device_id: &str, plan_id: u8) -> Result<PlanReadback> {
        let handle = self.manager.handle(device_id)?;

        let first = Command::QuerySubphaseExtended { plan_id };
        // The subphase echo stays in the table: the read loop consumes it
        // when the matching summary arrives.
        let first_success = [subphase_readback_key(plan_id)];
        self.transmit_and_wait(
            &handle,
            &first,
            &first_success,
            self.config.readback_timeout(),
            true,
        )
        .await?;

        let second = Command::QueryPlanSummary { plan_id };
        let second_success = [plan_readback_key(plan_id)];
        let outcome = self
            .transmit_and_wait(
                &handle,
                &second,
                &second_success,
                self.config.readback_timeout(),
                false,
            )
            .await;
        handle.table().remove(&first_success[0]);

        match outcome? {
            Response::Plan(plan) => Ok(plan),
            Response::Frame(_) => {
                Err(SignalError::decode_error("plan readback", "expected a merged plan reply"))
            }
        }
    }

    /// One logical send: encode once, transmit up to the attempt budget, wait
    /// for the first of success / negative result / transport NAK.
    async fn transmit_and_wait(
        &self,
        handle: &Arc<ConnectionHandle>,
        command: &Command,
        success_keys: &[String],
        timeout: std::time::Duration,
        hold_success: bool,
    ) -> Result<Response> {
        let device_id = handle.device_id().to_string();
        let label = command.id().label();
        let seq = self.seq.next();
        let frame = encode(seq, handle.protocol_address(), command.id().code(), &command.encode_payload());

        let fail = result_key(false, label);
        let nak = nak_key(seq);
        let mut keys: Vec<String> = success_keys.to_vec();
        keys.push(fail.clone());
        keys.push(nak.clone());

        // Entries from earlier, abandoned sends must not satisfy this wait.
        for key in &keys {
            handle.table().remove(key);
        }

        let mut last_error: Option<SignalError> = None;
        for attempt in 1..=self.config.send_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.retry_pacing()).await;
            }
            debug!(device = %device_id, command = label, seq, attempt, "sending frame");
            handle.write_frame(&frame).await?;
            self.audit.frame_sent(&device_id, &frame).await;

            match handle.table().wait_any(&keys, timeout).await {
                None => {
                    warn!(device = %device_id, command = label, attempt, ?timeout, "no reply");
                    last_error = Some(SignalError::timeout(&device_id, label, timeout));
                }
                Some((key, response)) if key == nak => {
                    handle.table().remove(&nak);
                    let code = nak_code(&response);
                    warn!(
                        device = %device_id,
                        command = label,
                        attempt,
                        code = code as u8,
                        detail = code.description(),
                        "transport NAK"
                    );
                    last_error = Some(SignalError::Nak {
                        device: device_id.clone(),
                        command: label.to_string(),
                        code,
                    });
                }
                Some((key, response)) if key == fail => {
                    handle.table().remove(&fail);
                    last_error = Some(self.handle_rejection(&device_id, command.id(), &response));
                }
                Some((key, response)) => {
                    if !hold_success {
                        handle.table().remove(&key);
                    }
                    debug!(device = %device_id, command = label, attempt, "command resolved");
                    return Ok(response);
                }
            }
        }

        let attempts = self.config.send_attempts;
        if let Some(e) = &last_error {
            error!(device = %device_id, command = label, attempts, last_error = %e, "giving up");
        }
        Err(SignalError::RetriesExhausted {
            device: device_id,
            command: label.to_string(),
            attempts,
        })
    }

    fn handle_rejection(
        &self,
        device_id: &str,
        command: CommandId,
        response: &Response,
    ) -> SignalError {
        let reported = reported_command(command);
        match response {
            Response::Frame(frame) => match decode_command_result(frame) {
                Ok(result) => {
                    warn!(
                        device = device_id,
                        command = %reported,
                        error_code = result.error_code,
                        parameter = result.parameter_number,
                        "device rejected command"
                    );
                    let _ = self.events.send(BridgeEvent::CommandResult {
                        device_id: device_id.to_string(),
                        command: reported,
                        result: result.clone(),
                    });
                    SignalError::Rejected {
                        device: device_id.to_string(),
                        command: reported.label().to_string(),
                        error_code: result.error_code,
                        parameter_number: result.parameter_number,
                    }
                }
                Err(e) => e,
            },
            Response::Plan(_) => {
                SignalError::decode_error(reported.label(), "plan reply under a result key")
            }
        }
    }

    fn emit_result(&self, device_id: &str, command: CommandId, response: &Response) {
        let reported = reported_command(command);
        if let Response::Frame(frame) = response {
            match decode_command_result(frame) {
                Ok(result) => {
                    let _ = self.events.send(BridgeEvent::CommandResult {
                        device_id: device_id.to_string(),
                        command: reported,
                        result,
                    });
                }
                Err(e) => {
                    warn!(device = device_id, command = %reported, error = %e, "bad result frame")
                }
            }
        }
    }
}

/// Devices answer both halves of the plan push under the summary command, so
/// results for the subphase frame are reported as 5F15.
fn reported_command(command: CommandId) -> CommandId {
    match command {
        CommandId::SetSubphaseExtended => CommandId::SetPlanSummary,
        other => other,
    }
}

fn nak_code(response: &Response) -> FrameErrorCode {
    match response {
        Response::Frame(frame) if frame.len() > 7 => {
            FrameErrorCode::from_wire(frame[7]).unwrap_or(FrameErrorCode::Frame)
        }
        _ => FrameErrorCode::Frame,
    }
}

fn frame_bytes(response: Response, context: &str) -> Result<Vec<u8>> {
    match response {
        Response::Frame(frame) => Ok(frame),
        Response::Plan(_) => {
            Err(SignalError::decode_error(context, "expected a raw frame reply"))
        }
    }
}

fn hex_span(frame: &[u8], range: std::ops::Range<usize>) -> String {
    frame[range].iter().map(|b| format!("{b:02x}")).collect()
}
