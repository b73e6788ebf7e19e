// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! YMODEM packet codec: frame construction, frame reception and
//! validation, and the shared response wait.

use std::time::Duration;
use crate::crc::crc16;
use crate::protocol::*;
use crate::serial::Link;

// ============================================================================
// Encoding
// ============================================================================

/// Builds the header packet: SOH, sequence 0x00/0xFF, a 128-byte payload
/// holding `filename`, NUL, the decimal size and a trailing space, then
/// the big-endian CRC. The filename is truncated if the size field would
/// not fit.
pub fn header_packet(filename: &str, size: u32) -> [u8; PACKET_SIZE + PACKET_OVERHEAD] {
    let mut frame = [0u8; PACKET_SIZE + PACKET_OVERHEAD];
    frame[0] = SOH;
    frame[1] = 0x00;
    frame[2] = 0xFF;

    let size_field = size.to_string();
    let name = filename.as_bytes();
    let name_len = name.len().min(PACKET_SIZE - size_field.len() - 2);

    let payload = &mut frame[PACKET_HEADER..PACKET_HEADER + PACKET_SIZE];
    payload[..name_len].copy_from_slice(&name[..name_len]);
    let at = name_len + 1;
    payload[at..at + size_field.len()].copy_from_slice(size_field.as_bytes());
    payload[at + size_field.len()] = b' ';

    seal(&mut frame, PACKET_SIZE);
    frame
}

/// Builds the empty closing packet: header framing with an all-zero
/// payload, the end-of-batch signal.
pub fn closing_packet() -> [u8; PACKET_SIZE + PACKET_OVERHEAD] {
    let mut frame = [0u8; PACKET_SIZE + PACKET_OVERHEAD];
    frame[0] = SOH;
    frame[1] = 0x00;
    frame[2] = 0xFF;
    seal(&mut frame, PACKET_SIZE);
    frame
}

/// Builds a 1K data packet for block `block`. `data` holds up to 1024
/// bytes; the payload is zero-padded to the full block size. Encoding is
/// a pure function of its inputs, so a resend is byte-identical.
pub fn data_packet(block: u8, data: &[u8]) -> [u8; FRAME_MAX] {
    debug_assert!(data.len() <= PACKET_1K_SIZE);

    let mut frame = [0u8; FRAME_MAX];
    frame[0] = STX;
    frame[1] = block;
    frame[2] = !block;
    frame[PACKET_HEADER..PACKET_HEADER + data.len()].copy_from_slice(data);
    seal(&mut frame, PACKET_1K_SIZE);
    frame
}

/// Appends the big-endian CRC over the payload.
fn seal(frame: &mut [u8], payload_len: usize) {
    let crc = crc16(&frame[PACKET_HEADER..PACKET_HEADER + payload_len]);
    frame[PACKET_HEADER + payload_len] = (crc >> 8) as u8;
    frame[PACKET_HEADER + payload_len + 1] = (crc & 0xFF) as u8;
}

// ============================================================================
// Decoding
// ============================================================================

/// A successfully decoded wire event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    /// A validated frame is in the buffer; the value is the payload length
    Received(usize),
    EndOfTransmission,
    Aborted,
}

/// Receives and validates one frame into `frame`. Everything that went
/// wrong, recoverable or not, comes back as a [`TransferError`]; the
/// caller decides which kinds to retry.
///
/// The sequence/complement pair is checked before the CRC, so a frame
/// failing both reports the sequence error.
pub fn read_packet(
    link: &mut Link,
    frame: &mut [u8],
    timeout: Duration,
) -> Result<PacketStatus, TransferError> {
    let first = link.receive_byte(timeout)?;

    let payload_len = match first {
        SOH => PACKET_SIZE,
        STX => PACKET_1K_SIZE,
        EOT => return Ok(PacketStatus::EndOfTransmission),
        CAN => {
            // A lone CAN is line noise; only the pair aborts
            return match link.receive_byte(timeout)? {
                CAN => Ok(PacketStatus::Aborted),
                _ => Err(TransferError::InvalidHeader),
            };
        }
        ABORT1 | ABORT2 => return Ok(PacketStatus::Aborted),
        _ => {
            // Unknown header: let the line settle, then flush it
            std::thread::sleep(SETTLE_DELAY);
            link.drain()?;
            return Err(TransferError::InvalidHeader);
        }
    };

    let total = payload_len + PACKET_OVERHEAD;
    if total > frame.len() {
        return Err(TransferError::BufferOverflow);
    }

    frame[0] = first;
    for slot in frame[1..total].iter_mut() {
        *slot = link.receive_byte(timeout)?;
    }

    if frame[PACKET_SEQNO_INDEX] != frame[PACKET_SEQNO_COMP_INDEX] ^ 0xFF {
        return Err(TransferError::SequenceError);
    }
    if crc16(&frame[PACKET_HEADER..total]) != 0 {
        return Err(TransferError::CrcError);
    }

    Ok(PacketStatus::Received(payload_len))
}

// ============================================================================
// Response wait
// ============================================================================

/// A non-fatal answer from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// The expected byte arrived
    Expected,
    /// NAK: resend the last packet
    RetryRequested,
}

/// Waits for a single response byte, retrying individual receive timeouts
/// up to `retries` times. A CAN is echoed back as a full cancel before
/// reporting the peer's abort; any byte other than `expected`, NAK or CAN
/// is an unexpected response.
pub fn wait_for_response(
    link: &mut Link,
    expected: u8,
    retries: u32,
    timeout: Duration,
) -> Result<Response, TransferError> {
    let mut timeouts = 0;
    loop {
        match link.receive_byte(timeout) {
            Ok(b) if b == expected => return Ok(Response::Expected),
            Ok(CAN) => {
                link.send_cancel()?;
                return Err(TransferError::AbortedByPeer);
            }
            Ok(NAK) => return Ok(Response::RetryRequested),
            Ok(_) => return Err(TransferError::InvalidHeader),
            Err(TransferError::Timeout) => {
                timeouts += 1;
                if timeouts >= retries {
                    return Err(TransferError::Timeout);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
