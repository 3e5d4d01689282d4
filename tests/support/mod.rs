//! In-process mock controller and capability stubs for integration tests.
//!
//! The mock controller speaks the real wire protocol over a loopback TCP
//! socket: it destuffs and parses inbound frames, tracks the strategy and
//! plan state a real device would, and answers with the matching result and
//! status frames.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use greenwave::protocol::frame::{destuff, encode, encode_nak};
use greenwave::{
    AuditSink, ConditionSpec, Device, DeviceDirectory, FlowQuery, FlowSegment, FrameErrorCode,
    PlanAssignment, PlanStore, Publisher, Result, RuleStore, SignalPlanParameters, ThresholdSpec,
};

/// Observable device state the tests assert against.
#[derive(Debug, Default)]
pub struct TcState {
    pub strategy: u8,
    pub effect_time: u8,
    /// Raw 5F14 payload: planId, N, then 7 bytes per subphase.
    pub subphase_payload: Option<Vec<u8>>,
    /// Raw 5F15 payload: planId, direct, phaseOrder, N, greens, cycle, offset.
    pub summary_payload: Option<Vec<u8>>,
    pub activated_plan: Option<u8>,
}

/// Fault injection knobs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcBehavior {
    /// Answer every frame with a transport NAK.
    pub nak_every_frame: bool,
    /// Echo the plan summary with cycleTime off by one.
    pub corrupt_cycle_time: bool,
    /// Reject 5F18 with a 0F81.
    pub reject_activate: bool,
}

pub struct MockController {
    pub port: u16,
    pub state: Arc<Mutex<TcState>>,
}

impl MockController {
    pub async fn start(behavior: TcBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(TcState {
            strategy: 5,
            effect_time: 0,
            ..TcState::default()
        }));
        let serve_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                serve(socket, Arc::clone(&serve_state), behavior).await;
            }
        });
        Self { port, state }
    }

    pub fn device(&self, id: &str) -> Device {
        Device {
            id: id.to_string(),
            ip: "127.0.0.1".to_string(),
            port: self.port,
            protocol_address: 1,
            enabled: true,
            dynamic_enabled: true,
        }
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, TcState> {
        self.state.lock().unwrap()
    }
}

async fn read_frame(socket: &mut TcpStream) -> Option<Vec<u8>> {
    let mut head = [0u8; 7];
    socket.read_exact(&mut head).await.ok()?;
    let declared = (usize::from(head[5]) << 8) | usize::from(head[6]);
    if declared < head.len() {
        return None;
    }
    let mut rest = vec![0u8; declared - head.len()];
    socket.read_exact(&mut rest).await.ok()?;
    let mut frame = head.to_vec();
    frame.extend_from_slice(&rest);
    Some(frame)
}

async fn serve(mut socket: TcpStream, state: Arc<Mutex<TcState>>, behavior: TcBehavior) {
    while let Some(frame) = read_frame(&mut socket).await {
        // Transport ACK/NAK replies from the driver need no answer.
        if frame[1] != 0xBB {
            continue;
        }
        let frame = destuff(&frame);
        let seq = frame[2];
        if behavior.nak_every_frame {
            let nak = encode_nak(seq, frame[3], frame[4], FrameErrorCode::Checksum);
            if socket.write_all(&nak).await.is_err() {
                return;
            }
            continue;
        }
        let payload = frame[9..frame.len() - 3].to_vec();
        let reply = match (frame[7], frame[8]) {
            (0x5F, 0x10) => {
                let mut state = state.lock().unwrap();
                state.strategy = payload[0];
                state.effect_time = payload[1];
                encode(seq, 1, [0x0F, 0x80], &[0x5F, 0x10])
            }
            (0x5F, 0x40) => {
                let state = state.lock().unwrap();
                encode(seq, 1, [0x5F, 0xC0], &[state.strategy, state.effect_time])
            }
            (0x5F, 0x14) => {
                state.lock().unwrap().subphase_payload = Some(payload);
                encode(seq, 1, [0x0F, 0x80], &[0x5F, 0x14])
            }
            (0x5F, 0x15) => {
                state.lock().unwrap().summary_payload = Some(payload);
                encode(seq, 1, [0x0F, 0x80], &[0x5F, 0x15])
            }
            (0x5F, 0x44) => {
                let stored = state.lock().unwrap().subphase_payload.clone();
                let echo = stored.unwrap_or_else(|| vec![payload[0], 0]);
                encode(seq, 1, [0x5F, 0xC4], &echo)
            }
            (0x5F, 0x45) => {
                let stored = state.lock().unwrap().summary_payload.clone();
                let mut echo = stored.unwrap_or_else(|| vec![payload[0], 0, 0, 0, 0, 0, 0, 0]);
                if behavior.corrupt_cycle_time {
                    // cycleTime low byte sits just before the 2-byte offset.
                    let at = echo.len() - 3;
                    echo[at] = echo[at].wrapping_add(1);
                }
                encode(seq, 1, [0x5F, 0xC5], &echo)
            }
            (0x5F, 0x18) => {
                if behavior.reject_activate {
                    encode(seq, 1, [0x0F, 0x81], &[0x5F, 0x18, 0x02, 0x01])
                } else {
                    state.lock().unwrap().activated_plan = Some(payload[0]);
                    encode(seq, 1, [0x0F, 0x80], &[0x5F, 0x18])
                }
            }
            _ => continue,
        };
        if socket.write_all(&reply).await.is_err() {
            return;
        }
    }
}

pub struct StaticDirectory(pub Vec<Device>);

#[async_trait]
impl DeviceDirectory for StaticDirectory {
    async fn find_by_ip(&self, ip: &str) -> Result<Option<Device>> {
        Ok(self.0.iter().find(|d| d.ip == ip).cloned())
    }
    async fn find_by_id(&self, id: &str) -> Result<Option<Device>> {
        Ok(self.0.iter().find(|d| d.id == id).cloned())
    }
    async fn enabled_devices(&self) -> Result<Vec<Device>> {
        Ok(self.0.iter().filter(|d| d.enabled).cloned().collect())
    }
}

/// Flow store returning one fixed value per query, counting calls. The
/// optional delay makes overlapping evaluations observable.
pub struct FixedFlow {
    pub value: Mutex<f64>,
    pub calls: AtomicU32,
    pub delay: Duration,
}

impl FixedFlow {
    pub fn new(value: f64) -> Self {
        Self { value: Mutex::new(value), calls: AtomicU32::new(0), delay: Duration::ZERO }
    }

    pub fn with_delay(value: f64, delay: Duration) -> Self {
        Self { delay, ..Self::new(value) }
    }

    pub fn set(&self, value: f64) {
        *self.value.lock().unwrap() = value;
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FlowQuery for FixedFlow {
    async fn sum_flow(
        &self,
        _detector: &str,
        _end_time: DateTime<Local>,
        _window_minutes: u32,
        _segment: Option<&FlowSegment>,
    ) -> Result<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(*self.value.lock().unwrap())
    }
}

pub struct StaticRules {
    pub thresholds: Vec<ThresholdSpec>,
    pub conditions: Vec<ConditionSpec>,
}

#[async_trait]
impl RuleStore for StaticRules {
    async fn thresholds(&self) -> Result<Vec<ThresholdSpec>> {
        Ok(self.thresholds.clone())
    }
    async fn conditions(&self) -> Result<Vec<ConditionSpec>> {
        Ok(self.conditions.clone())
    }
}

pub struct StaticPlans {
    pub program: String,
    pub assignments: Vec<PlanAssignment>,
    pub parameters: Vec<(String, u8, SignalPlanParameters)>,
}

#[async_trait]
impl PlanStore for StaticPlans {
    async fn assignments(
        &self,
        program: &str,
        _day_type: greenwave::DayType,
    ) -> Result<Vec<PlanAssignment>> {
        if program == self.program {
            Ok(self.assignments.clone())
        } else {
            Ok(Vec::new())
        }
    }

    async fn parameters(
        &self,
        program: &str,
        device_id: &str,
        plan_id: u8,
    ) -> Result<Option<SignalPlanParameters>> {
        if program != self.program {
            return Ok(None);
        }
        Ok(self
            .parameters
            .iter()
            .find(|(device, plan, _)| device == device_id && *plan == plan_id)
            .map(|(_, _, params)| params.clone()))
    }
}

/// Records control outcomes for assertion; frame traffic is dropped.
#[derive(Default)]
pub struct RecordingAudit {
    pub outcomes: Mutex<Vec<(String, String, bool, String)>>,
}

#[async_trait]
impl AuditSink for RecordingAudit {
    async fn frame_sent(&self, _device_id: &str, _frame: &[u8]) {}
    async fn frame_received(&self, _device_id: &str, _frame: &[u8]) {}
    async fn control_outcome(&self, device_id: &str, program: &str, success: bool, detail: &str) {
        self.outcomes.lock().unwrap().push((
            device_id.to_string(),
            program.to_string(),
            success,
            detail.to_string(),
        ));
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    pub messages: Mutex<Vec<(String, String)>>,
}

impl RecordingPublisher {
    pub fn on_topic(&self, topic: &str) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        self.messages.lock().unwrap().push((topic.to_string(), payload.to_string()));
        Ok(())
    }
}
