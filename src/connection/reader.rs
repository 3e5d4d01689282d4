//! Per-connection read loop: byte-at-a-time frame reassembly, validation,
//! ACK/NAK replies, and reply dispatch into the [`ResponseTable`].
//!
//! The stream is reassembled one byte at a time because the protocol has no
//! out-of-band length prefix: the declared length sits inside the frame and
//! can itself be wrong, so the only trustworthy frame boundary is the footer
//! (`DLE ETX <cks>` closing an odd-length DLE run).

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tracing::{debug, trace, warn};

use super::registry::{
    nak_key, plan_readback_key, plan_summary_readback_key, result_key, strategy_status_key,
    subphase_readback_key, Response, ResponseTable,
};
use super::ConnectionHandle;
use crate::protocol::frame::{
    declared_length, destuff, encode_ack, encode_nak, footer_complete, looks_like_footer, validate,
};
use crate::protocol::payload::{
    decode_plan_summary_readback, decode_subphase_readback, PlanReadback,
};
use crate::protocol::{ACK, ACK_FRAME_LEN, DLE, HEADER_LEN, NAK, NAK_FRAME_LEN, STX};
use crate::services::AuditSink;

/// What the assembler recognized after consuming one byte.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Step {
    /// Mid-frame, keep feeding bytes.
    Pending,
    /// A complete 8-byte transport ACK.
    Ack { seq: u8 },
    /// A complete 9-byte transport NAK.
    Nak(Vec<u8>),
    /// A complete stuffed data frame, not yet validated.
    Complete(Vec<u8>),
}

/// Frame reassembly state. Bytes before a DLE are noise and are dropped.
#[derive(Debug, Default)]
pub(crate) struct Assembler {
    buf: Vec<u8>,
}

impl Assembler {
    /// Upper bound on a buffered frame; past this the stream is garbage and
    /// the accumulator resets.
    const MAX_FRAME: usize = 4096;

    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, byte: u8) -> Step {
        if self.buf.is_empty() {
            if byte == DLE {
                self.buf.push(byte);
            }
            return Step::Pending;
        }
        if self.buf.len() == 1 && !matches!(byte, STX | ACK | NAK) {
            // A lone DLE followed by a non-type byte is noise. The byte may
            // itself start a real frame.
            self.buf.clear();
            if byte == DLE {
                self.buf.push(byte);
            }
            return Step::Pending;
        }
        self.buf.push(byte);

        let len = self.buf.len();
        if len == ACK_FRAME_LEN && self.buf[1] == ACK {
            let frame = std::mem::take(&mut self.buf);
            return Step::Ack { seq: frame[2] };
        }
        if len == NAK_FRAME_LEN && self.buf[1] == NAK {
            return Step::Nak(std::mem::take(&mut self.buf));
        }
        if len > NAK_FRAME_LEN && self.buf[1] == STX {
            if footer_complete(&self.buf) {
                return Step::Complete(std::mem::take(&mut self.buf));
            }
            // Corrupt length field: once the declared byte count has arrived,
            // accept anything footer-shaped and let validation answer NAK.
            if let Some(declared) = declared_length(&self.buf)
                && len >= declared
                && looks_like_footer(&self.buf)
            {
                return Step::Complete(std::mem::take(&mut self.buf));
            }
        }
        if len >= Self::MAX_FRAME {
            warn!(buffered = len, "no frame boundary found, dropping buffer");
            self.buf.clear();
        }
        Step::Pending
    }
}

/// Store a validated, destuffed frame under its correlation key.
pub(crate) fn dispatch(device_id: &str, table: &ResponseTable, frame: Vec<u8>) {
    if frame.len() < HEADER_LEN {
        warn!(device = device_id, len = frame.len(), "destuffed frame shorter than header");
        return;
    }
    match (frame[7], frame[8]) {
        (0x5F, 0xC0) => {
            debug!(device = device_id, "strategy status received");
            table.insert(strategy_status_key(), Response::Frame(frame));
        }
        (0x5F, 0xC4) => match decode_subphase_readback(&frame) {
            Ok(readback) => {
                debug!(device = device_id, plan = readback.plan_id, "subphase echo received");
                table.insert(subphase_readback_key(readback.plan_id), Response::Frame(frame));
            }
            Err(e) => warn!(device = device_id, error = %e, "undecodable subphase echo"),
        },
        (0x5F, 0xC5) => {
            let summary = match decode_plan_summary_readback(&frame) {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(device = device_id, error = %e, "undecodable plan summary echo");
                    return;
                }
            };
            let plan_id = summary.plan_id;
            match table.take(&subphase_readback_key(plan_id)) {
                Some(Response::Frame(first)) => match decode_subphase_readback(&first) {
                    Ok(extended) => {
                        debug!(device = device_id, plan = plan_id, "plan readback complete");
                        table.insert(
                            plan_readback_key(plan_id),
                            Response::Plan(PlanReadback::merge(extended, summary)),
                        );
                    }
                    Err(e) => {
                        warn!(device = device_id, error = %e, "stored subphase echo undecodable")
                    }
                },
                _ => {
                    warn!(device = device_id, plan = plan_id, "plan summary without subphase echo");
                    table.insert(plan_summary_readback_key(plan_id), Response::Frame(frame));
                }
            }
        }
        (0x0F, family @ (0x80 | 0x81)) => {
            if frame.len() < HEADER_LEN + 2 {
                warn!(device = device_id, "command result too short to carry the echoed command");
                return;
            }
            let label = format!("{:02x}{:02x}", frame[9], frame[10]);
            let positive = family == 0x80;
            debug!(device = device_id, command = %label, positive, "command result received");
            if label == "5f15" {
                // The first half of the plan-push pair is superseded once the
                // second half resolves.
                table.remove(&result_key(true, "5f14"));
                table.remove(&result_key(false, "5f14"));
            }
            table.insert(result_key(positive, &label), Response::Frame(frame));
        }
        (c1, c2) => {
            debug!(device = device_id, command = format!("{c1:02x}{c2:02x}"), "unhandled frame");
        }
    }
}

async fn handle_frame(handle: &ConnectionHandle, audit: &dyn AuditSink, frame: Vec<u8>) {
    audit.frame_received(handle.device_id(), &frame).await;
    let seq = frame[2];
    let (addr_hi, addr_lo) = (frame[3], frame[4]);
    match validate(&frame, handle.protocol_address()) {
        Err(code) => {
            warn!(
                device = handle.device_id(),
                seq,
                code = code as u8,
                detail = code.description(),
                "invalid frame, replying NAK"
            );
            let nak = encode_nak(seq, addr_hi, addr_lo, code);
            match handle.write_frame(&nak).await {
                Ok(()) => audit.frame_sent(handle.device_id(), &nak).await,
                Err(e) => warn!(device = handle.device_id(), error = %e, "failed to send NAK"),
            }
        }
        Ok(()) => {
            let ack = encode_ack(seq, addr_hi, addr_lo);
            match handle.write_frame(&ack).await {
                Ok(()) => audit.frame_sent(handle.device_id(), &ack).await,
                Err(e) => warn!(device = handle.device_id(), error = %e, "failed to send ACK"),
            }
            dispatch(handle.device_id(), handle.table(), destuff(&frame));
        }
    }
}

/// Run the read loop until the socket closes or the connection is cancelled.
pub(crate) async fn run<R>(handle: Arc<ConnectionHandle>, read: R, audit: Arc<dyn AuditSink>)
where
    R: AsyncRead + Unpin + Send,
{
    let mut read = BufReader::new(read);
    let mut assembler = Assembler::new();
    let cancel = handle.cancel_token();
    loop {
        let byte = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(device = handle.device_id(), "read loop cancelled");
                break;
            }
            result = read.read_u8() => match result {
                Ok(byte) => byte,
                Err(e) => {
                    debug!(device = handle.device_id(), error = %e, "socket closed");
                    break;
                }
            }
        };
        match assembler.push(byte) {
            Step::Pending => {}
            Step::Ack { seq } => {
                trace!(device = handle.device_id(), seq, "transport ACK");
            }
            Step::Nak(frame) => {
                audit.frame_received(handle.device_id(), &frame).await;
                let seq = frame[2];
                warn!(device = handle.device_id(), seq, code = frame[7], "transport NAK");
                handle.table().insert(nak_key(seq), Response::Frame(frame));
            }
            Step::Complete(frame) => handle_frame(&handle, audit.as_ref(), frame).await,
        }
    }
    handle.mark_closed();
}
