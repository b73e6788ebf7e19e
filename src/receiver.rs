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

use std::marker::PhantomData;
use crate::packet::{PacketStatus, read_packet};
use crate::protocol::*;
use crate::serial::Link;
use crate::storage::FileHandle;

// ============================================================================
// Result Structure
// ============================================================================

/// What a receive session produced so far: the filename announced by the
/// sender and the bytes written to the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub filename: String,
    pub size: u32,
}

// ============================================================================
// States
// ============================================================================

pub struct AwaitHeader;
pub struct ReceivingData;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct ReceiverFsm<State> {
    state: PhantomData<State>,
    link: Link,
    dest: Box<dyn FileHandle>,
    max_size: u32,
    config: Config,
    frame: [u8; FRAME_MAX],
    filename: String,
    file_size: u32,
    bytes_written: u32,
    errors: u32,
    header_errors: u32,
    eot_seen: bool,
    debug: bool,
}

// ============================================================================
// Trait
// ============================================================================

pub trait ReceiverState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, TransferError>;

    /// Snapshot of the transfer so far; the session keeps the last one as
    /// its result when the machine signals completion.
    fn received(&self) -> Received;
}

// ============================================================================
// Helpers shared by all states
// ============================================================================

impl<S> ReceiverFsm<S> {
    fn transition<T>(self) -> Box<ReceiverFsm<T>> {
        Box::new(ReceiverFsm {
            state: PhantomData,
            link: self.link,
            dest: self.dest,
            max_size: self.max_size,
            config: self.config,
            frame: self.frame,
            filename: self.filename,
            file_size: self.file_size,
            bytes_written: self.bytes_written,
            errors: self.errors,
            header_errors: self.header_errors,
            eot_seen: self.eot_seen,
            debug: self.debug,
        })
    }

    fn snapshot(&self) -> Received {
        Received {
            filename: self.filename.clone(),
            size: self.bytes_written,
        }
    }
}

impl<S> ReceiverFsm<S>
where
    ReceiverFsm<S>: ReceiverState + 'static,
{
    /// Rejects the current packet with NAK: bad sequence, bad CRC or an
    /// empty header packet. During the header phase these count against
    /// the tighter header ceiling as well as the session ceiling.
    fn reject(mut self, header_phase: bool) -> Result<Box<dyn ReceiverState>, TransferError> {
        self.errors += 1;
        if header_phase {
            self.header_errors += 1;
        }
        if self.errors > self.config.max_errors
            || (header_phase && self.header_errors > self.config.header_error_limit)
        {
            self.link.send_cancel()?;
            return Err(TransferError::MaxErrorsReached);
        }
        self.link.send_nak()?;
        Ok(Box::new(self))
    }

    /// Answers a timeout or garbled header with the CRC-request byte.
    /// This doubles as the receiver's half of the CRC-mode handshake: a
    /// sender still pinging for 'C' gets its answer here.
    fn resync(mut self) -> Result<Box<dyn ReceiverState>, TransferError> {
        self.errors += 1;
        if self.errors > self.config.max_errors {
            self.link.send_cancel()?;
            return Err(TransferError::MaxErrorsReached);
        }
        self.link.send_crc_request()?;
        Ok(Box::new(self))
    }

    fn handle_eot(mut self) -> Result<Box<dyn ReceiverState>, TransferError> {
        if self.config.nak_first_eot && !self.eot_seen {
            // The first EOT is NAK'd on purpose; the resend confirms it
            self.eot_seen = true;
            if self.debug { println!("Received: EOT - requesting confirmation"); }
            self.link.send_nak()?;
            return Ok(Box::new(self));
        }
        if self.debug { println!("Received: EOT - file complete"); }
        self.link.send_ack()?;
        Err(TransferError::TransferComplete)
    }

    fn peer_abort(mut self) -> Result<Box<dyn ReceiverState>, TransferError> {
        // Acknowledged so the peer stops resending the cancel
        if self.debug { println!("Peer aborted the transfer"); }
        self.link.send_ack()?;
        Err(TransferError::AbortedByPeer)
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl ReceiverState for ReceiverFsm<AwaitHeader> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, TransferError> {
        let mut fsm = *self;

        match read_packet(&mut fsm.link, &mut fsm.frame, fsm.config.byte_timeout) {
            Ok(PacketStatus::Received(len)) => {
                // Whatever arrives first is the header packet
                if fsm.frame[PACKET_HEADER] == 0 {
                    if fsm.debug { println!("Received: empty header packet"); }
                    return fsm.reject(true);
                }

                let (filename, size) = parse_file_info(
                    &fsm.frame[PACKET_HEADER..PACKET_HEADER + len],
                    fsm.config.filename_limit,
                );

                if size == 0 {
                    fsm.link.send_cancel()?;
                    return Err(TransferError::SizeNull);
                }
                if size > fsm.max_size {
                    fsm.link.send_cancel()?;
                    return Err(TransferError::SizeOverflow);
                }

                if fsm.debug { println!("Receiving \"{}\" ({} bytes)", filename, size); }
                fsm.filename = filename;
                fsm.file_size = size;
                fsm.link.send_ack_crc_request()?;

                let next = fsm.transition::<ReceivingData>();
                Ok(next as Box<dyn ReceiverState>)
            }
            Ok(PacketStatus::EndOfTransmission) => fsm.handle_eot(),
            Ok(PacketStatus::Aborted) => fsm.peer_abort(),
            Err(e @ (TransferError::SequenceError | TransferError::CrcError)) => {
                if fsm.debug { println!("Rejected header packet: {}", e); }
                fsm.reject(true)
            }
            Err(TransferError::Timeout | TransferError::InvalidHeader) => fsm.resync(),
            Err(TransferError::BufferOverflow) => {
                fsm.link.send_cancel()?;
                Err(TransferError::BufferOverflow)
            }
            Err(e) => Err(e),
        }
    }

    fn received(&self) -> Received {
        self.snapshot()
    }
}

impl ReceiverState for ReceiverFsm<ReceivingData> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, TransferError> {
        let mut fsm = *self;

        match read_packet(&mut fsm.link, &mut fsm.frame, fsm.config.byte_timeout) {
            Ok(PacketStatus::Received(len)) => {
                let remaining = fsm.file_size - fsm.bytes_written;
                if remaining > 0 {
                    // The final block's zero padding is never written out
                    let take = (len as u32).min(remaining) as usize;
                    let chunk = &fsm.frame[PACKET_HEADER..PACKET_HEADER + take];
                    match fsm.dest.write(chunk) {
                        Ok(n) if n == take => fsm.bytes_written += take as u32,
                        _ => {
                            fsm.link.send_cancel()?;
                            return Err(TransferError::WriteError);
                        }
                    }
                }

                if fsm.debug {
                    println!("Received block ({} of {} bytes)", fsm.bytes_written, fsm.file_size);
                }
                fsm.link.send_ack()?;
                Ok(Box::new(fsm) as Box<dyn ReceiverState>)
            }
            Ok(PacketStatus::EndOfTransmission) => fsm.handle_eot(),
            Ok(PacketStatus::Aborted) => fsm.peer_abort(),
            Err(e @ (TransferError::SequenceError | TransferError::CrcError)) => {
                if fsm.debug { println!("Rejected data packet: {}", e); }
                fsm.reject(false)
            }
            Err(TransferError::Timeout | TransferError::InvalidHeader) => fsm.resync(),
            Err(TransferError::BufferOverflow) => {
                fsm.link.send_cancel()?;
                Err(TransferError::BufferOverflow)
            }
            Err(e) => Err(e),
        }
    }

    fn received(&self) -> Received {
        self.snapshot()
    }
}

// ============================================================================
// Constructor
// ============================================================================

impl ReceiverFsm<AwaitHeader> {
    pub fn new(
        link: Link,
        dest: Box<dyn FileHandle>,
        max_size: u32,
        config: Config,
        debug: bool,
    ) -> Box<dyn ReceiverState> {
        Box::new(ReceiverFsm {
            state: PhantomData::<AwaitHeader>,
            link,
            dest,
            max_size,
            config,
            frame: [0; FRAME_MAX],
            filename: String::new(),
            file_size: 0,
            bytes_written: 0,
            errors: 0,
            header_errors: 0,
            eot_seen: false,
            debug,
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Extracts the filename and declared size from a header packet payload.
/// The name runs to the first NUL, capped at `name_limit` characters; the
/// decimal size field follows the NUL and ends at a space. An absent or
/// malformed size field yields 0.
fn parse_file_info(payload: &[u8], name_limit: usize) -> (String, u32) {
    let name_end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    let name = String::from_utf8_lossy(&payload[..name_end.min(name_limit)]).into_owned();

    let rest = &payload[(name_end + 1).min(payload.len())..];
    let size_end = rest.iter().position(|&b| b == b' ').unwrap_or(rest.len());
    let size = std::str::from_utf8(&rest[..size_end])
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);

    (name, size)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::path::Path;
    use crate::packet::{closing_packet, data_packet, header_packet};
    use crate::serial::MockSerialPort;

    fn run_receiver(mut fsm: Box<dyn ReceiverState>) -> Result<Received, TransferError> {
        loop {
            let progress = fsm.received();
            match fsm.step() {
                Ok(next) => fsm = next,
                Err(TransferError::TransferComplete) => return Ok(progress),
                Err(e) => return Err(e),
            }
        }
    }

    fn receiver(
        responses: Vec<Option<u8>>,
        expected_writes: Vec<u8>,
        dest: &Path,
        max_size: u32,
        config: Config,
    ) -> Box<dyn ReceiverState> {
        let mock = Box::new(MockSerialPort::new(responses, expected_writes));
        let dest = Box::new(File::create(dest).unwrap());
        ReceiverFsm::new(Link::new(mock), dest, max_size, config, true)
    }

    fn feed(frame: &[u8]) -> Vec<Option<u8>> {
        frame.iter().map(|&b| Some(b)).collect()
    }

    #[test]
    fn test_parse_file_info() {
        let mut payload = [0u8; 128];
        payload[..9].copy_from_slice(b"small.txt");
        payload[10..12].copy_from_slice(b"9 ");
        assert_eq!(parse_file_info(&payload, 64), ("small.txt".to_string(), 9));

        // Name longer than the cap is truncated, size still found
        let mut payload = [0u8; 128];
        payload[..70].fill(b'n');
        payload[71..76].copy_from_slice(b"2500 ");
        let (name, size) = parse_file_info(&payload, 64);
        assert_eq!(name.len(), 64);
        assert_eq!(size, 2500);

        // Non-decimal size field yields 0
        let mut payload = [0u8; 128];
        payload[..4].copy_from_slice(b"f.px");
        payload[5..9].copy_from_slice(b"12a ");
        assert_eq!(parse_file_info(&payload, 64).1, 0);

        // No NUL terminator at all yields 0
        let payload = [b'x'; 128];
        assert_eq!(parse_file_info(&payload, 64).1, 0);
    }

    #[test]
    fn test_receiver_full_transfer() {
        let path = std::env::temp_dir().join("receiver_small.bin");

        let mut responses = feed(&header_packet("small.txt", 9));
        responses.extend(feed(&data_packet(1, b"Test data")));
        responses.push(Some(EOT));
        responses.push(Some(EOT));

        let expected_writes = vec![ACK, CRC_REQUEST, ACK, NAK, ACK];

        let fsm = receiver(responses, expected_writes, &path, MAX_FILE_SIZE, Config::default());
        let result = run_receiver(fsm).expect("transfer should succeed");

        assert_eq!(result.filename, "small.txt");
        assert_eq!(result.size, 9);

        // Exactly the declared size, none of the block padding
        let content = std::fs::read(&path).unwrap();
        assert_eq!(content, b"Test data");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_receiver_three_blocks() {
        let path = std::env::temp_dir().join("receiver_2500.bin");

        let content: Vec<u8> = (0..2500).map(|i| (i % 256) as u8).collect();

        let mut responses = feed(&header_packet("firmware.bin", 2500));
        responses.extend(feed(&data_packet(1, &content[..1024])));
        responses.extend(feed(&data_packet(2, &content[1024..2048])));
        responses.extend(feed(&data_packet(3, &content[2048..])));
        responses.push(Some(EOT));
        responses.push(Some(EOT));

        let expected_writes = vec![ACK, CRC_REQUEST, ACK, ACK, ACK, NAK, ACK];

        let fsm = receiver(responses, expected_writes, &path, 1_000_000, Config::default());
        let result = run_receiver(fsm).expect("transfer should succeed");

        assert_eq!(result.size, 2500);
        let received = std::fs::read(&path).unwrap();
        assert_eq!(received, content);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_receiver_crc_error_naks_once_then_accepts_resend() {
        let path = std::env::temp_dir().join("receiver_crcretry.bin");

        let good = data_packet(1, b"Bad luck block");
        let mut bad = good;
        bad[FRAME_MAX - 1] ^= 0xFF;

        let mut responses = feed(&header_packet("retry.bin", 14));
        responses.extend(feed(&bad));
        responses.extend(feed(&good));
        responses.push(Some(EOT));
        responses.push(Some(EOT));

        let expected_writes = vec![ACK, CRC_REQUEST, NAK, ACK, NAK, ACK];

        let fsm = receiver(responses, expected_writes, &path, MAX_FILE_SIZE, Config::default());
        let result = run_receiver(fsm).expect("transfer should succeed");

        assert_eq!(result.size, 14);
        assert_eq!(std::fs::read(&path).unwrap(), b"Bad luck block");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_receiver_rejects_zero_size() {
        let path = std::env::temp_dir().join("receiver_zero.bin");

        let responses = feed(&header_packet("empty.bin", 0));
        let expected_writes = vec![CAN, CAN];

        let fsm = receiver(responses, expected_writes, &path, MAX_FILE_SIZE, Config::default());
        assert!(matches!(run_receiver(fsm), Err(TransferError::SizeNull)));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_receiver_rejects_size_over_limit() {
        let path = std::env::temp_dir().join("receiver_over.bin");

        let responses = feed(&header_packet("big.bin", 1001));
        let expected_writes = vec![CAN, CAN];

        let fsm = receiver(responses, expected_writes, &path, 1000, Config::default());
        assert!(matches!(run_receiver(fsm), Err(TransferError::SizeOverflow)));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_receiver_accepts_size_at_limit() {
        let path = std::env::temp_dir().join("receiver_atlimit.bin");

        let mut responses = feed(&header_packet("exact.bin", 9));
        responses.extend(feed(&data_packet(1, b"123456789")));
        responses.push(Some(EOT));
        responses.push(Some(EOT));

        let expected_writes = vec![ACK, CRC_REQUEST, ACK, NAK, ACK];

        let fsm = receiver(responses, expected_writes, &path, 9, Config::default());
        let result = run_receiver(fsm).expect("size equal to the limit is allowed");
        assert_eq!(result.size, 9);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_receiver_peer_abort() {
        let path = std::env::temp_dir().join("receiver_abort.bin");

        let mut responses = feed(&header_packet("gone.bin", 100));
        responses.push(Some(CAN));
        responses.push(Some(CAN));

        let expected_writes = vec![ACK, CRC_REQUEST, ACK];

        let fsm = receiver(responses, expected_writes, &path, MAX_FILE_SIZE, Config::default());
        assert!(matches!(run_receiver(fsm), Err(TransferError::AbortedByPeer)));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_receiver_write_failure_cancels() {
        let path = std::env::temp_dir().join("receiver_readonly.bin");
        std::fs::write(&path, b"").unwrap();

        let mut responses = feed(&header_packet("denied.bin", 4));
        responses.extend(feed(&data_packet(1, b"data")));

        let expected_writes = vec![ACK, CRC_REQUEST, CAN, CAN];

        // A read-only handle rejects the first data write
        let mock = Box::new(MockSerialPort::new(responses, expected_writes));
        let dest = Box::new(File::open(&path).unwrap());
        let fsm = ReceiverFsm::new(Link::new(mock), dest, MAX_FILE_SIZE, Config::default(), true);

        assert!(matches!(run_receiver(fsm), Err(TransferError::WriteError)));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_receiver_silence_fails_after_bounded_retries() {
        let path = std::env::temp_dir().join("receiver_silent.bin");

        let config = Config {
            max_errors: 3,
            ..Config::default()
        };

        // Each timeout answers with 'C'; the fourth breaches the ceiling
        let responses = vec![None, None, None, None];
        let expected_writes = vec![CRC_REQUEST, CRC_REQUEST, CRC_REQUEST, CAN, CAN];

        let fsm = receiver(responses, expected_writes, &path, MAX_FILE_SIZE, config);
        assert!(matches!(run_receiver(fsm), Err(TransferError::MaxErrorsReached)));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_receiver_garbage_header_resyncs() {
        let path = std::env::temp_dir().join("receiver_garbage.bin");

        // Noise byte, quiet line while flushing, then a clean exchange
        let mut responses = vec![Some(0x99), None];
        responses.extend(feed(&header_packet("noise.bin", 4)));
        responses.extend(feed(&data_packet(1, b"data")));
        responses.push(Some(EOT));
        responses.push(Some(EOT));

        let expected_writes = vec![CRC_REQUEST, ACK, CRC_REQUEST, ACK, NAK, ACK];

        let fsm = receiver(responses, expected_writes, &path, MAX_FILE_SIZE, Config::default());
        let result = run_receiver(fsm).expect("transfer should succeed");
        assert_eq!(result.size, 4);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_receiver_empty_header_hits_header_ceiling() {
        let path = std::env::temp_dir().join("receiver_emptyhdr.bin");

        let mut responses = Vec::new();
        for _ in 0..6 {
            responses.extend(feed(&closing_packet()));
        }
        let expected_writes = vec![NAK, NAK, NAK, NAK, NAK, CAN, CAN];

        let fsm = receiver(responses, expected_writes, &path, MAX_FILE_SIZE, Config::default());
        assert!(matches!(run_receiver(fsm), Err(TransferError::MaxErrorsReached)));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_receiver_single_eot_when_configured() {
        let path = std::env::temp_dir().join("receiver_oneeot.bin");

        let config = Config {
            nak_first_eot: false,
            ..Config::default()
        };

        let mut responses = feed(&header_packet("quick.bin", 4));
        responses.extend(feed(&data_packet(1, b"data")));
        responses.push(Some(EOT));

        let expected_writes = vec![ACK, CRC_REQUEST, ACK, ACK];

        let fsm = receiver(responses, expected_writes, &path, MAX_FILE_SIZE, config);
        let result = run_receiver(fsm).expect("single EOT completes in this mode");
        assert_eq!(result.size, 4);

        std::fs::remove_file(&path).ok();
    }
}
