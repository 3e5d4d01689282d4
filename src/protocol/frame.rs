//! Generic framing layer: header/footer layout, checksum, byte stuffing.
//!
//! ## Frame layout
//!
//! ```text
//! ┌──────┬──────┬──────┬─────────┬─────────┬─────────┬─────────┬──────┬──────┬──────┐
//! │ DLE  │ STX  │ seq  │ addr(2) │ len(2)  │ cmd(2)  │ payload │ DLE  │ ETX  │ cks  │
//! └──────┴──────┴──────┴─────────┴─────────┴─────────┴─────────┴──────┴──────┴──────┘
//!   0      1      2      3..5      5..7      7..9      9..        -3     -2     -1
//! ```
//!
//! `len` counts the whole frame including markers and checksum, after
//! stuffing. `cks` is the XOR fold of every preceding byte.
//!
//! ## Stuffing
//!
//! Any `DLE` (0xAA) byte in the stuffed region (offsets 7 through
//! `len - 4` of the unstuffed frame, i.e. command bytes plus payload) is
//! duplicated in place; the length field grows by the number of inserted
//! bytes and the checksum is recomputed over the stuffed frame. Destuffing
//! collapses each escape pair back to one byte, alternating through longer
//! marker runs.
//!
//! Because stuffing only ever duplicates, every in-payload `DLE` run of the
//! stuffed frame has even length. The footer contributes exactly one more
//! `DLE`, so a frame terminates precisely where a trailing `DLE` run of odd
//! length is followed by `ETX` and the checksum byte. [`footer_complete`]
//! implements that rule; the reader uses it to find frame boundaries in the
//! byte stream.

use super::{ACK, ACK_FRAME_LEN, DLE, ETX, FOOTER_LEN, HEADER_LEN, NAK, NAK_FRAME_LEN, STX};
use crate::error::FrameErrorCode;

/// Index of the first stuffed byte (the first command byte).
const STUFF_REGION_START: usize = 7;

/// XOR fold over a byte slice.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |cks, b| cks ^ b)
}

/// Declared frame length from the two big-endian length bytes.
///
/// Returns `None` when the buffer is too short to carry a length field.
pub fn declared_length(frame: &[u8]) -> Option<usize> {
    if frame.len() < 7 {
        return None;
    }
    Some(usize::from(frame[5]) << 8 | usize::from(frame[6]))
}

/// Declared device address from the two big-endian address bytes.
pub fn declared_address(frame: &[u8]) -> Option<u16> {
    if frame.len() < 5 {
        return None;
    }
    Some(u16::from(frame[3]) << 8 | u16::from(frame[4]))
}

/// Build a complete, stuffed command frame ready for the wire.
///
/// `payload` is the raw (unstuffed) field data following the command bytes.
pub fn encode(seq: u8, address: u16, command: [u8; 2], payload: &[u8]) -> Vec<u8> {
    let declared = HEADER_LEN + payload.len() + FOOTER_LEN;
    let mut frame = Vec::with_capacity(declared + payload.len() / 8 + 1);
    frame.push(DLE);
    frame.push(STX);
    frame.push(seq);
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&(declared as u16).to_be_bytes());
    frame.extend_from_slice(&command);
    frame.extend_from_slice(payload);
    frame.push(DLE);
    frame.push(ETX);
    let cks = checksum(&frame);
    frame.push(cks);
    stuff(frame)
}

/// Duplicate in-payload marker bytes and fix up length and checksum.
///
/// Operates on a complete unstuffed frame (checksum already present). The
/// stuffed region is offsets 7 through `declared_len - 4` of the input; the
/// footer and checksum are never stuffed.
pub fn stuff(frame: Vec<u8>) -> Vec<u8> {
    let declared = match declared_length(&frame) {
        Some(len) => len,
        None => return frame,
    };

    let mut stuffed = Vec::with_capacity(frame.len() + 4);
    let mut inserted = 0usize;
    for (i, &b) in frame.iter().enumerate() {
        if i >= STUFF_REGION_START && i < declared.saturating_sub(FOOTER_LEN) && b == DLE {
            stuffed.push(b);
            inserted += 1;
        }
        stuffed.push(b);
    }

    if inserted > 0 {
        let new_len = (declared + inserted) as u16;
        stuffed[5] = (new_len >> 8) as u8;
        stuffed[6] = (new_len & 0xFF) as u8;
        // Checksum covers the stuffed bytes and the updated length field.
        stuffed.pop();
        let cks = checksum(&stuffed);
        stuffed.push(cks);
    }
    stuffed
}

/// Collapse duplicated marker bytes, reconstructing the unstuffed frame.
///
/// A `DLE` in the stuffed region is dropped when it escapes a `DLE` that was
/// *kept* as data; the pairing then restarts, so a run of 2N stuffed bytes
/// collapses to N (and the footer `DLE` closing a 2N+1 run survives).
pub fn destuff(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len());
    let mut escape_open = false;
    for (i, &b) in frame.iter().enumerate() {
        if b == DLE && i > STUFF_REGION_START && escape_open {
            escape_open = false;
            continue;
        }
        escape_open = b == DLE;
        out.push(b);
    }
    out
}

/// Check whether an accumulated buffer ends on a complete frame footer.
///
/// True exactly when the buffer ends with `... DLE ETX cks` where the `DLE`
/// closes an odd-length marker run (see module docs). The buffer must hold at
/// least one byte beyond the minimal header.
pub fn footer_complete(buf: &[u8]) -> bool {
    let len = buf.len();
    if len <= HEADER_LEN {
        return false;
    }
    if buf[len - 2] != ETX || buf[len - 3] != DLE {
        return false;
    }
    let mut run = 0usize;
    let mut i = len - 3;
    while buf[i] == DLE {
        run += 1;
        if i == STUFF_REGION_START {
            break;
        }
        i -= 1;
    }
    run % 2 == 1
}

/// Loose footer check used to flush garbage that never validated as a frame.
pub fn looks_like_footer(buf: &[u8]) -> bool {
    let len = buf.len();
    len >= 3 && buf[len - 3] == DLE && buf[len - 2] == ETX
}

/// Validate a received (still stuffed) frame.
///
/// Checks run in a fixed order and the first failure wins: checksum, frame
/// markers, declared length, declared address. The codes are power-of-two
/// values so a future revision could OR-combine them, but this implementation
/// deliberately preserves the single-code contract the devices expect in NAK
/// replies.
pub fn validate(frame: &[u8], expected_address: u16) -> Result<(), FrameErrorCode> {
    let len = frame.len();
    if len < HEADER_LEN + FOOTER_LEN {
        return Err(FrameErrorCode::Frame);
    }

    let cks = checksum(&frame[..len - 1]);
    if cks != frame[len - 1] {
        return Err(FrameErrorCode::Checksum);
    }
    if frame[0] != DLE || frame[len - 3] != DLE || frame[len - 2] != ETX {
        return Err(FrameErrorCode::Frame);
    }
    if declared_length(frame) != Some(len) {
        return Err(FrameErrorCode::Length);
    }
    if declared_address(frame) != Some(expected_address) {
        return Err(FrameErrorCode::Address);
    }
    Ok(())
}

/// Build a transport ACK reply echoing the received frame's sequence/address.
pub fn encode_ack(seq: u8, addr_hi: u8, addr_lo: u8) -> [u8; ACK_FRAME_LEN] {
    let mut ack = [DLE, ACK, seq, addr_hi, addr_lo, 0x00, ACK_FRAME_LEN as u8, 0];
    ack[ACK_FRAME_LEN - 1] = checksum(&ack[..ACK_FRAME_LEN - 1]);
    ack
}

/// Build a transport NAK reply carrying one validation error code.
pub fn encode_nak(seq: u8, addr_hi: u8, addr_lo: u8, code: FrameErrorCode) -> [u8; NAK_FRAME_LEN] {
    let mut nak = [DLE, NAK, seq, addr_hi, addr_lo, 0x00, NAK_FRAME_LEN as u8, code as u8, 0];
    nak[NAK_FRAME_LEN - 1] = checksum(&nak[..NAK_FRAME_LEN - 1]);
    nak
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ADDR: u16 = 0x0102;

    fn frame_with_payload(payload: &[u8]) -> Vec<u8> {
        encode(7, ADDR, [0x5F, 0x14], payload)
    }

    #[test]
    fn encode_minimal_query_frame() {
        // 5F40 has an empty payload: declared length 12.
        let frame = encode(1, 33, [0x5F, 0x40], &[]);
        assert_eq!(frame.len(), 12);
        assert_eq!(frame[0], DLE);
        assert_eq!(frame[1], STX);
        assert_eq!(frame[2], 1);
        assert_eq!(&frame[3..5], &[0, 33]);
        assert_eq!(&frame[5..7], &[0, 12]);
        assert_eq!(&frame[7..9], &[0x5F, 0x40]);
        assert_eq!(frame[9], DLE);
        assert_eq!(frame[10], ETX);
        assert_eq!(frame[11], checksum(&frame[..11]));
    }

    #[test]
    fn stuffing_duplicates_payload_markers_and_grows_length() {
        // Payload with three DLE bytes: stuffed frame carries them twice each.
        let payload = [DLE, 0x01, DLE, DLE];
        let frame = frame_with_payload(&payload);

        let base_len = HEADER_LEN + payload.len() + FOOTER_LEN;
        assert_eq!(declared_length(&frame), Some(base_len + 3));
        assert_eq!(frame.len(), base_len + 3);

        // The stuffed region holds 2N marker bytes; the footer adds one more.
        let marker_count =
            frame[STUFF_REGION_START..frame.len() - FOOTER_LEN].iter().filter(|&&b| b == DLE).count();
        assert_eq!(marker_count, 6);

        // Checksum was recomputed over the stuffed frame.
        assert_eq!(frame[frame.len() - 1], checksum(&frame[..frame.len() - 1]));
    }

    #[test]
    fn destuff_collapses_pairs_against_input_positions() {
        let payload = [DLE, DLE, 0x05];
        let frame = frame_with_payload(&payload);
        let restored = destuff(&frame);
        assert_eq!(&restored[HEADER_LEN..HEADER_LEN + payload.len()], &payload);
        assert_eq!(restored.len(), frame.len() - 2);
    }

    #[test]
    fn adjacent_payload_markers_survive_the_round_trip() {
        // Two data 0xAA bytes stuff to a run of four; each escape pair must
        // collapse independently, not the whole run to one byte.
        let payload = [DLE, DLE];
        let frame = frame_with_payload(&payload);
        let restored = destuff(&frame);
        assert_eq!(&restored[HEADER_LEN..HEADER_LEN + 2], &payload);

        // A marker run running straight into the footer DLE keeps the footer.
        let payload = [0x01, DLE, DLE];
        let restored = destuff(&frame_with_payload(&payload));
        assert_eq!(&restored[HEADER_LEN..HEADER_LEN + 3], &payload);
        assert_eq!(restored[restored.len() - 3], DLE);
        assert_eq!(restored[restored.len() - 2], ETX);
    }

    #[test]
    fn validate_passes_for_encoded_frames() {
        let frame = frame_with_payload(&[1, 2, 3, DLE, 4]);
        assert_eq!(validate(&frame, ADDR), Ok(()));
    }

    #[test]
    fn validate_reports_first_failure_only() {
        let mut frame = frame_with_payload(&[1, 2, 3]);

        // Corrupt the address: checksum breaks first, so code 1 is reported
        // even though the address check would also fail.
        frame[3] ^= 0xFF;
        assert_eq!(validate(&frame, ADDR), Err(FrameErrorCode::Checksum));

        // Fix the checksum: now the address check is the first failure.
        let last = frame.len() - 1;
        frame[last] = checksum(&frame[..last]);
        assert_eq!(validate(&frame, ADDR), Err(FrameErrorCode::Address));
    }

    #[test]
    fn validate_reports_length_mismatch() {
        let mut frame = frame_with_payload(&[9, 9]);
        let declared = declared_length(&frame).unwrap() as u16 + 1;
        frame[5] = (declared >> 8) as u8;
        frame[6] = (declared & 0xFF) as u8;
        let last = frame.len() - 1;
        frame[last] = checksum(&frame[..last]);
        assert_eq!(validate(&frame, ADDR), Err(FrameErrorCode::Length));
    }

    #[test]
    fn footer_detection_requires_odd_marker_run() {
        // Payload ending in a stuffed pair followed by a raw ETX byte must not
        // be mistaken for a footer.
        let frame = frame_with_payload(&[DLE, ETX, 0x01]);
        for end in HEADER_LEN + 1..frame.len() {
            assert!(!footer_complete(&frame[..end]), "false boundary at {end}");
        }
        assert!(footer_complete(&frame));

        // Payload ending in a stuffed DLE directly before the footer yields a
        // three-marker run, still odd.
        let frame = frame_with_payload(&[0x01, DLE]);
        for end in HEADER_LEN + 1..frame.len() {
            assert!(!footer_complete(&frame[..end]), "false boundary at {end}");
        }
        assert!(footer_complete(&frame));
    }

    #[test]
    fn ack_and_nak_frames_are_checksummed() {
        let ack = encode_ack(3, 0x01, 0x02);
        assert_eq!(ack[1], ACK);
        assert_eq!(ack[7], checksum(&ack[..7]));

        let nak = encode_nak(3, 0x01, 0x02, FrameErrorCode::Length);
        assert_eq!(nak[1], NAK);
        assert_eq!(nak[7], 4);
        assert_eq!(nak[8], checksum(&nak[..8]));
    }

    proptest! {
        #[test]
        fn round_trip_restores_payload(payload in prop::collection::vec(any::<u8>(), 0..64)) {
            let frame = frame_with_payload(&payload);
            prop_assert_eq!(validate(&frame, ADDR), Ok(()));

            let restored = destuff(&frame);
            prop_assert_eq!(&restored[HEADER_LEN..restored.len() - FOOTER_LEN], payload.as_slice());
        }

        #[test]
        fn stuffing_is_idempotent_under_destuff(payload in prop::collection::vec(any::<u8>(), 0..64)) {
            let frame = frame_with_payload(&payload);
            let mut unstuffed = destuff(&frame);
            // Restore the pre-stuff length and checksum, then re-stuff.
            let declared = unstuffed.len() as u16;
            unstuffed[5] = (declared >> 8) as u8;
            unstuffed[6] = (declared & 0xFF) as u8;
            let last = unstuffed.len() - 1;
            unstuffed[last] = checksum(&unstuffed[..last]);
            let restuffed = stuff(unstuffed);
            prop_assert_eq!(restuffed, frame);
        }

        #[test]
        fn stuffed_marker_count_doubles(n in 0usize..20) {
            let payload = vec![DLE; n];
            let frame = frame_with_payload(&payload);
            let declared = HEADER_LEN + n + FOOTER_LEN;
            prop_assert_eq!(declared_length(&frame), Some(declared + n));
            let in_region = frame[STUFF_REGION_START..frame.len() - FOOTER_LEN]
                .iter()
                .filter(|&&b| b == DLE)
                .count();
            prop_assert_eq!(in_region, 2 * n);
        }

        #[test]
        fn corrupting_any_byte_fails_checksum_first(
            payload in prop::collection::vec(any::<u8>(), 1..32),
            flip in any::<u8>().prop_filter("non-zero flip", |f| *f != 0),
        ) {
            let frame = frame_with_payload(&payload);
            for idx in 0..frame.len() - 1 {
                let mut corrupted = frame.clone();
                corrupted[idx] ^= flip;
                prop_assert_eq!(validate(&corrupted, ADDR), Err(FrameErrorCode::Checksum));
            }
        }

        #[test]
        fn no_false_frame_boundary_inside_stuffed_frames(
            payload in prop::collection::vec(prop::sample::select(vec![DLE, ETX, STX, 0x00, 0x5F]), 0..32)
        ) {
            let frame = frame_with_payload(&payload);
            for end in HEADER_LEN + 1..frame.len() {
                prop_assert!(!footer_complete(&frame[..end]), "false boundary at {}", end);
            }
            prop_assert!(footer_complete(&frame));
        }
    }
}
