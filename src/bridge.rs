//! Pub/sub gateway: inbound command requests and outbound outcome events.
//!
//! Inbound messages are JSON objects `{"messageId": "...", "value":
//! {"deviceId": "...", ...}}` whose message id names a command family; the
//! bridge maps them 1:1 onto [`CommandSender`] calls. Outbound, the bridge
//! pumps the sender's [`BridgeEvent`] stream into per-device topics
//! (`<prefix><deviceId>`): device acknowledgements (0F80), rejections (0F81
//! with errorCode and parameterNumber), and strategy reports (5FC0).
//!
//! Subscribing to the inbound channel is the embedder's wiring; it hands each
//! received payload to [`Bridge::handle_request`].

use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::{Result, SignalError};
use crate::protocol::payload::SignalPlanParameters;
use crate::protocol::ControlStrategy;
use crate::sender::{BridgeEvent, CommandSender};
use crate::services::Publisher;

#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    #[serde(rename = "messageId")]
    message_id: String,
    value: serde_json::Value,
}

/// A decoded inbound request.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BridgeCommand {
    EnableStrategy { strategy: ControlStrategy, effect_time: u8 },
    SetPlan(SignalPlanParameters),
    ActivatePlan { plan_id: u8 },
    QueryStrategy,
    ReadPlan { plan_id: u8 },
}

fn bad_request(details: impl Into<String>) -> SignalError {
    SignalError::decode_error("bridge request", details)
}

fn field_u8(value: &serde_json::Value, name: &str) -> Result<u8> {
    value
        .get(name)
        .and_then(|v| v.as_u64())
        .and_then(|v| u8::try_from(v).ok())
        .ok_or_else(|| bad_request(format!("missing or invalid '{name}'")))
}

/// Decode one inbound payload into the target device and its command.
pub(crate) fn parse_request(payload: &str) -> Result<(String, BridgeCommand)> {
    let envelope: InboundEnvelope = serde_json::from_str(payload)
        .map_err(|e| bad_request(format!("malformed envelope: {e}")))?;
    let device_id = envelope
        .value
        .get("deviceId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| bad_request("missing 'deviceId'"))?
        .to_string();

    let command = match envelope.message_id.to_uppercase().as_str() {
        "5F10" => {
            let code = field_u8(&envelope.value, "controlStrategy")?;
            let strategy = ControlStrategy::from_code(code)
                .ok_or_else(|| bad_request(format!("unknown controlStrategy {code}")))?;
            let effect_time = field_u8(&envelope.value, "effectTime")?;
            BridgeCommand::EnableStrategy { strategy, effect_time }
        }
        // Both halves of the plan push arrive as one request carrying the
        // full parameter set.
        "5F14" | "5F15" => {
            let params: SignalPlanParameters = serde_json::from_value(envelope.value)
                .map_err(|e| bad_request(format!("invalid plan parameters: {e}")))?;
            BridgeCommand::SetPlan(params)
        }
        "5F18" => BridgeCommand::ActivatePlan { plan_id: field_u8(&envelope.value, "planId")? },
        "5F40" => BridgeCommand::QueryStrategy,
        "5F44" | "5F45" => BridgeCommand::ReadPlan { plan_id: field_u8(&envelope.value, "planId")? },
        other => return Err(bad_request(format!("unknown messageId '{other}'"))),
    };
    Ok((device_id, command))
}

/// Build the outbound JSON for one event: `(device_id, message)`.
pub(crate) fn outbound_message(
    event: &BridgeEvent,
    now: DateTime<Local>,
) -> (String, serde_json::Value) {
    let message_time = now.format("%Y-%m-%d %H:%M:%S").to_string();
    match event {
        BridgeEvent::CommandResult { device_id, command, result } => {
            let mut value = json!({
                "deviceId": device_id,
                "status": if result.positive { "success" } else { "fail" },
                "resData": result.res_data,
            });
            if !result.positive {
                value["errorCode"] = json!(result.error_code);
                value["parameterNumber"] = json!(result.parameter_number);
            }
            let message = json!({
                "messageTime": message_time,
                "messageId": command.wire_name(),
                "value": value,
            });
            (device_id.clone(), message)
        }
        BridgeEvent::StrategyReport { device_id, status, res_data } => {
            let message = json!({
                "messageTime": message_time,
                "messageId": "5FC0",
                "value": {
                    "deviceId": device_id,
                    "status": "success",
                    "resData": res_data,
                    "controlStrategy": status.control_strategy,
                    "effectTime": status.effect_time,
                },
            });
            (device_id.clone(), message)
        }
    }
}

/// Connects the pub/sub channel to the command sender.
pub struct Bridge {
    sender: Arc<CommandSender>,
    publisher: Arc<dyn Publisher>,
    config: BridgeConfig,
}

impl Bridge {
    pub fn new(
        sender: Arc<CommandSender>,
        publisher: Arc<dyn Publisher>,
        config: BridgeConfig,
    ) -> Self {
        Self { sender, publisher, config }
    }

    /// Execute one inbound request payload.
    pub async fn handle_request(&self, payload: &str) -> Result<()> {
        let (device_id, command) = parse_request(payload)?;
        debug!(device = %device_id, ?command, "bridge request");
        match command {
            BridgeCommand::EnableStrategy { strategy, effect_time } => {
                self.sender.enable_strategy(&device_id, strategy, effect_time).await
            }
            BridgeCommand::SetPlan(params) => self.sender.set_plan(&device_id, &params).await,
            BridgeCommand::ActivatePlan { plan_id } => {
                self.sender.activate_plan(&device_id, plan_id).await
            }
            BridgeCommand::QueryStrategy => {
                // The report itself flows out through the event pump.
                self.sender.query_strategy(&device_id).await.map(|_| ())
            }
            BridgeCommand::ReadPlan { plan_id } => {
                let plan = self.sender.read_plan(&device_id, plan_id).await?;
                info!(
                    device = %device_id,
                    plan = plan.plan_id,
                    cycle_time = plan.cycle_time,
                    "plan read back"
                );
                Ok(())
            }
        }
    }

    /// Pump sender events to the outbound channel until the stream closes.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<BridgeEvent>) {
        while let Some(event) = events.recv().await {
            self.publish_event(&event, Local::now()).await;
        }
        debug!("bridge event stream closed");
    }

    async fn publish_event(&self, event: &BridgeEvent, now: DateTime<Local>) {
        let (device_id, message) = outbound_message(event, now);
        let topic = format!("{}{}", self.config.topic_prefix, device_id);
        let payload = message.to_string();
        if let Err(e) = self.publisher.publish(&topic, &payload).await {
            warn!(topic = %topic, error = %e, "publish failed");
        }
    }
}
