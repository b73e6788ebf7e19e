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

//! YMODEM protocol constants, tunables and status codes

use std::time::Duration;

/// Start of header - begins a 128-byte packet (header or closing packet)
pub const SOH: u8 = 0x01;

/// Start of text - begins a 1024-byte data packet
pub const STX: u8 = 0x02;

/// End of transmission - sent alone, no framing
pub const EOT: u8 = 0x04;

/// Acknowledge
pub const ACK: u8 = 0x06;

/// Negative acknowledge - request retransmission
pub const NAK: u8 = 0x15;

/// Cancel - two in succession abort the transfer
pub const CAN: u8 = 0x18;

/// 'C' - request/confirm 16-bit CRC mode
pub const CRC_REQUEST: u8 = 0x43;

/// 'A' - abort by sender
pub const ABORT1: u8 = 0x41;

/// 'a' - abort by receiver
pub const ABORT2: u8 = 0x61;

/// Sequence number index within a frame
pub const PACKET_SEQNO_INDEX: usize = 1;

/// Sequence number complement index within a frame
pub const PACKET_SEQNO_COMP_INDEX: usize = 2;

/// Frame bytes before the payload (header, seq, ~seq)
pub const PACKET_HEADER: usize = 3;

/// Frame bytes after the payload (CRC hi, CRC lo)
pub const PACKET_TRAILER: usize = 2;

/// Total framing overhead per packet
pub const PACKET_OVERHEAD: usize = PACKET_HEADER + PACKET_TRAILER;

/// Payload size of a SOH packet
pub const PACKET_SIZE: usize = 128;

/// Payload size of a STX packet
pub const PACKET_1K_SIZE: usize = 1024;

/// Largest frame on the wire
pub const FRAME_MAX: usize = PACKET_1K_SIZE + PACKET_OVERHEAD;

/// Per-byte receive timeout
pub const NAK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Settle delay before flushing the line after an unrecognized header byte
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Read timeout used while draining pending inbound bytes
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Session-wide error ceiling
pub const MAX_ERRORS: u32 = 100;

/// Error ceiling for rejected packets during the header phase
pub const HEADER_ERROR_LIMIT: u32 = 5;

/// CRC-mode handshake attempt ceiling
pub const HANDSHAKE_RETRIES: u32 = 45;

/// Receive attempts per response wait
pub const RESPONSE_RETRIES: u32 = 10;

/// Longest filename accepted from a header packet
pub const FILENAME_LIMIT: usize = 64;

/// Default ceiling on a received file's declared size
pub const MAX_FILE_SIZE: u32 = 10 * 1024 * 1024;

// ============================================================================
// Tunables
// ============================================================================

/// Protocol tunables. The defaults match the reference behavior; the
/// non-obvious ones (error ceilings, first-EOT handling, filename cap)
/// are fields rather than constants because observed implementations
/// disagree on them.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Timeout for each single-byte receive
    pub byte_timeout: Duration,
    /// Errors tolerated across one whole session
    pub max_errors: u32,
    /// Rejected packets tolerated while waiting for the header packet
    pub header_error_limit: u32,
    /// CRC-mode handshake attempts before giving up
    pub handshake_retries: u32,
    /// Receive attempts per response wait
    pub response_retries: u32,
    /// Filename length cap when parsing a header packet
    pub filename_limit: usize,
    /// Reply NAK to the first EOT and require a second one
    pub nak_first_eot: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            byte_timeout: NAK_TIMEOUT,
            max_errors: MAX_ERRORS,
            header_error_limit: HEADER_ERROR_LIMIT,
            handshake_retries: HANDSHAKE_RETRIES,
            response_retries: RESPONSE_RETRIES,
            filename_limit: FILENAME_LIMIT,
            nak_first_eot: true,
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

/// Transfer status, shared by the codec, both state machines and the
/// session entry points.
#[derive(Debug)]
pub enum TransferError {
    Io(std::io::Error),
    Timeout,
    SequenceError,
    CrcError,
    SizeNull,
    SizeOverflow,
    BufferOverflow,
    WriteError,
    ReadError,
    MaxErrorsReached,
    AbortedByPeer,
    InvalidHeader,
    TransferComplete,
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::Io(e) => write!(f, "I/O error: {}", e),
            TransferError::Timeout => write!(f, "Timed out waiting for the peer"),
            TransferError::SequenceError => write!(f, "Packet sequence number mismatch"),
            TransferError::CrcError => write!(f, "Packet CRC mismatch"),
            TransferError::SizeNull => write!(f, "Declared file size is zero or unreadable"),
            TransferError::SizeOverflow => write!(f, "Declared file size exceeds the allowed maximum"),
            TransferError::BufferOverflow => write!(f, "Packet larger than the receive buffer"),
            TransferError::WriteError => write!(f, "Failed writing to the destination file"),
            TransferError::ReadError => write!(f, "Failed reading from the source file"),
            TransferError::MaxErrorsReached => write!(f, "Too many errors, transfer cancelled"),
            TransferError::AbortedByPeer => write!(f, "Transfer aborted by the peer"),
            TransferError::InvalidHeader => write!(f, "Unexpected response from the peer"),
            TransferError::TransferComplete => write!(f, "Transfer complete"),
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransferError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            TransferError::Timeout
        } else {
            TransferError::Io(err)
        }
    }
}
