//! Adaptive control driver for roadside traffic-signal controllers.
//!
//! This crate operates a fleet of signal controllers over a proprietary
//! binary TCP protocol and runs the adaptive control loop that rewrites a
//! controller's active plan when live traffic-flow conditions match
//! configured rules.
//!
//! # Layers
//!
//! - [`protocol`] — the wire format: delimiter-framed, checksummed,
//!   byte-stuffed frames and the per-command payload layouts.
//! - [`connection`] — one socket per device, per-connection read loops,
//!   reply correlation, and the health-check/reconnect sweep.
//! - [`sender`] — command transmission with timeout-bounded correlated
//!   waits, bounded retries, and the two-frame handshakes.
//! - [`control`] — the scheduler: threshold evaluation, boolean condition
//!   aggregation with consecutive-match counting, and the verified 5-step
//!   plan-change handshake with time-of-day fallback.
//! - [`bridge`] — JSON pub/sub gateway for externally requested commands
//!   and outbound outcome events.
//! - [`services`] — capability traits (device directory, flow store, rule
//!   and plan stores, audit sink, publisher) the embedder implements.
//!
//! # Example
//!
//! Framing a strategy query and validating it the way a device would:
//!
//! ```
//! use greenwave::protocol::frame::{encode, validate};
//!
//! let frame = encode(1, 0x0001, [0x5F, 0x40], &[]);
//! assert_eq!(frame.len(), 12);
//! assert!(validate(&frame, 0x0001).is_ok());
//! ```

pub mod bridge;
pub mod config;
pub mod connection;
pub mod control;
pub mod driver;
pub mod error;
pub mod protocol;
pub mod sender;
pub mod services;

pub use bridge::Bridge;
pub use config::{BridgeConfig, Config, ConnectionConfig, ControlConfig, ProtocolConfig};
pub use connection::{ConnectionHandle, ConnectionManager};
pub use control::rules::{
    Comparator, ConditionSpec, DayType, PlanAssignment, RuleSet, ScheduleWindow, ThresholdSpec,
};
pub use control::Orchestrator;
pub use driver::{Capabilities, Driver};
pub use error::{FrameErrorCode, Result, SignalError};
pub use protocol::payload::{
    CommandResult, PlanReadback, SignalPlanParameters, StrategyStatus, SubphaseTiming,
};
pub use protocol::{CommandId, ControlStrategy};
pub use sender::{BridgeEvent, CommandSender};
pub use services::{
    AuditSink, Device, DeviceDirectory, FlowQuery, FlowSegment, NullAuditSink, PlanStore,
    Publisher, RuleStore,
};
