//! Capability traits the embedding application provides.
//!
//! Persistence, time-series flow storage, audit logging, and the outbound
//! pub/sub channel live outside this crate. The core consumes them through
//! these async traits as `Arc<dyn …>` handles, so embedders can back them
//! with whatever store or broker they run.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::control::rules::{ConditionSpec, DayType, PlanAssignment, ThresholdSpec};
use crate::error::Result;
use crate::protocol::payload::SignalPlanParameters;

/// A managed roadside controller, as the device directory describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub ip: String,
    pub port: u16,
    /// The 16-bit address the device expects in every frame it receives and
    /// stamps into every frame it sends.
    #[serde(rename = "protocolAddress")]
    pub protocol_address: u16,
    pub enabled: bool,
    /// Whether adaptive control may rewrite this device's plans.
    #[serde(rename = "dynamicEnabled")]
    pub dynamic_enabled: bool,
}

/// Read-only lookup over the device inventory.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn find_by_ip(&self, ip: &str) -> Result<Option<Device>>;
    async fn find_by_id(&self, id: &str) -> Result<Option<Device>>;
    async fn enabled_devices(&self) -> Result<Vec<Device>>;
}

/// A road segment restricting a flow query to one travel direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSegment {
    pub from: String,
    pub to: String,
}

/// Windowed traffic-flow aggregation from the external time-series store.
#[async_trait]
pub trait FlowQuery: Send + Sync {
    /// Total vehicles seen by `detector` in the `window_minutes` ending at
    /// `end_time`, optionally restricted to one segment.
    async fn sum_flow(
        &self,
        detector: &str,
        end_time: DateTime<Local>,
        window_minutes: u32,
        segment: Option<&FlowSegment>,
    ) -> Result<f64>;
}

/// Source of threshold and condition rule rows.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn thresholds(&self) -> Result<Vec<ThresholdSpec>>;
    async fn conditions(&self) -> Result<Vec<ConditionSpec>>;
}

/// Source of per-program plan tables.
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Device-to-plan assignments for `program` on the given day type.
    async fn assignments(&self, program: &str, day_type: DayType) -> Result<Vec<PlanAssignment>>;

    /// The configured parameter set for one plan of one device.
    async fn parameters(
        &self,
        program: &str,
        device_id: &str,
        plan_id: u8,
    ) -> Result<Option<SignalPlanParameters>>;
}

/// Append-only audit trail. Fire-and-forget: the core reports, the sink owns
/// its own failures.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn frame_sent(&self, device_id: &str, frame: &[u8]);
    async fn frame_received(&self, device_id: &str, frame: &[u8]);
    async fn control_outcome(&self, device_id: &str, program: &str, success: bool, detail: &str);
}

/// Outbound pub/sub channel for bridge events.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;
}

/// An [`AuditSink`] that drops everything. Useful for embedders that do not
/// keep an audit trail, and for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn frame_sent(&self, _device_id: &str, _frame: &[u8]) {}
    async fn frame_received(&self, _device_id: &str, _frame: &[u8]) {}
    async fn control_outcome(&self, _device_id: &str, _program: &str, _success: bool, _detail: &str) {
    }
}
