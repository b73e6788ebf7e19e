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

use std::io::Write;
use std::marker::PhantomData;
use std::time::Instant;
use crate::packet::{Response, closing_packet, data_packet, header_packet, wait_for_response};
use crate::protocol::*;
use crate::serial::Link;
use crate::storage::FileHandle;

// ============================================================================
// States
// ============================================================================

pub struct AwaitCrcMode;
pub struct SendHeader;
pub struct SendBlocks;
pub struct SendEot;
pub struct SendClosing;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct SenderFsm<State> {
    state: PhantomData<State>,
    link: Link,
    source: Box<dyn FileHandle>,
    filename: String,
    file_size: u32,
    remaining: u32,
    offset: u32,
    block: u8,
    // The frame on the wire; kept so a NAK resends the identical bytes
    frame: [u8; FRAME_MAX],
    frame_len: usize,
    chunk: usize,
    retransmit: bool,
    attempts: u32,
    started: Instant,
    config: Config,
    debug: bool,
}

// ============================================================================
// Trait
// ============================================================================

pub trait SenderState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, TransferError>;
}

// ============================================================================
// Helpers shared by all states
// ============================================================================

impl<S> SenderFsm<S> {
    fn transition<T>(self) -> Box<SenderFsm<T>> {
        Box::new(SenderFsm {
            state: PhantomData,
            link: self.link,
            source: self.source,
            filename: self.filename,
            file_size: self.file_size,
            remaining: self.remaining,
            offset: self.offset,
            block: self.block,
            frame: self.frame,
            frame_len: self.frame_len,
            chunk: self.chunk,
            retransmit: self.retransmit,
            attempts: self.attempts,
            started: self.started,
            config: self.config,
            debug: self.debug,
        })
    }

    /// Waits for `expected`, cancelling the transfer on timeout or an
    /// unexpected byte. A peer abort is passed through without echoing a
    /// second cancel back.
    fn expect(&mut self, expected: u8) -> Result<Response, TransferError> {
        match wait_for_response(
            &mut self.link,
            expected,
            self.config.response_retries,
            self.config.byte_timeout,
        ) {
            Ok(r) => Ok(r),
            Err(TransferError::AbortedByPeer) => Err(TransferError::AbortedByPeer),
            Err(e) => {
                self.link.send_cancel()?;
                Err(e)
            }
        }
    }

    fn show_progress(&self) {
        if self.file_size == 0 {
            return;
        }
        let sent = (self.file_size - self.remaining) as u64;
        let total = self.file_size as u64;
        let percent = sent * 100 / total;

        let elapsed = self.started.elapsed().as_secs();
        let eta = if sent > 0 && sent < total {
            elapsed * total / sent - elapsed
        } else {
            0
        };

        print!(
            "\rSent {}/{} bytes ({}%), about {}m {}s left   ",
            sent,
            total,
            percent,
            eta / 60,
            eta % 60
        );
        std::io::stdout().flush().ok();
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl SenderState for SenderFsm<AwaitCrcMode> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, TransferError> {
        let mut fsm = *self;

        fsm.link.send_crc_request()?;
        if fsm.debug { println!("Sent: 'C'"); }

        match fsm.link.receive_byte(fsm.config.byte_timeout) {
            Ok(CRC_REQUEST) => {
                if fsm.debug { println!("Received: 'C' - receiver ready"); }
                let header = header_packet(&fsm.filename, fsm.file_size);
                fsm.frame[..header.len()].copy_from_slice(&header);
                fsm.frame_len = header.len();
                let next = fsm.transition::<SendHeader>();
                Ok(next as Box<dyn SenderState>)
            }
            Ok(_) => {
                // Anything but 'C' means the peer cannot do CRC mode
                fsm.link.send_cancel()?;
                Err(TransferError::CrcError)
            }
            Err(TransferError::Timeout) => {
                fsm.attempts += 1;
                if fsm.attempts >= fsm.config.handshake_retries {
                    fsm.link.send_cancel()?;
                    Err(TransferError::Timeout)
                } else {
                    println!("Receiver not ready");
                    Ok(Box::new(fsm) as Box<dyn SenderState>)
                }
            }
            Err(e) => Err(e),
        }
    }
}

impl SenderState for SenderFsm<SendHeader> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, TransferError> {
        let mut fsm = *self;

        fsm.link.send_bytes(&fsm.frame[..fsm.frame_len])?;
        if fsm.debug { println!("Sent: header packet for \"{}\"", fsm.filename); }

        match fsm.expect(ACK)? {
            Response::RetryRequested => {
                if fsm.debug { println!("Received: NAK - resending header"); }
                Ok(Box::new(fsm) as Box<dyn SenderState>)
            }
            Response::Expected => {
                if fsm.debug { println!("Received: ACK"); }
                // The receiver confirms 1K block mode with a second 'C'
                match fsm.expect(CRC_REQUEST)? {
                    Response::Expected => {
                        if fsm.debug { println!("Received: 'C' - sending data"); }
                        let next = fsm.transition::<SendBlocks>();
                        Ok(next as Box<dyn SenderState>)
                    }
                    Response::RetryRequested => {
                        fsm.link.send_cancel()?;
                        Err(TransferError::InvalidHeader)
                    }
                }
            }
        }
    }
}

impl SenderState for SenderFsm<SendBlocks> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, TransferError> {
        let mut fsm = *self;

        if fsm.remaining == 0 {
            let next = fsm.transition::<SendEot>();
            return Ok(next as Box<dyn SenderState>);
        }

        if !fsm.retransmit {
            let chunk = (fsm.remaining as usize).min(PACKET_1K_SIZE);
            let mut buffer = [0u8; PACKET_1K_SIZE];
            if fsm.source.seek(fsm.offset as u64).is_err()
                || fsm.source.read_exact(&mut buffer[..chunk]).is_err()
            {
                fsm.link.send_cancel()?;
                return Err(TransferError::ReadError);
            }
            fsm.frame = data_packet(fsm.block, &buffer[..chunk]);
            fsm.frame_len = FRAME_MAX;
            fsm.chunk = chunk;
        }
        fsm.retransmit = false;

        fsm.link.send_bytes(&fsm.frame[..fsm.frame_len])?;
        if fsm.debug { println!("Sent: block {} ({} bytes)", fsm.block, fsm.chunk); }

        match fsm.expect(ACK)? {
            Response::RetryRequested => {
                if fsm.debug { println!("Received: NAK - resending block {}", fsm.block); }
                fsm.retransmit = true;
                Ok(Box::new(fsm) as Box<dyn SenderState>)
            }
            Response::Expected => {
                fsm.offset += fsm.chunk as u32;
                fsm.remaining -= fsm.chunk as u32;
                fsm.block = fsm.block.wrapping_add(1);
                fsm.show_progress();
                Ok(Box::new(fsm) as Box<dyn SenderState>)
            }
        }
    }
}

impl SenderState for SenderFsm<SendEot> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, TransferError> {
        let mut fsm = *self;

        fsm.link.send_eot()?;
        if fsm.debug { println!("Sent: EOT"); }

        match fsm.expect(ACK)? {
            Response::RetryRequested => {
                // Receivers NAK the first EOT and expect it again
                if fsm.debug { println!("Received: NAK - resending EOT"); }
                Ok(Box::new(fsm) as Box<dyn SenderState>)
            }
            Response::Expected => {
                if fsm.debug { println!("Received: ACK"); }
                // The receiver's next-file request closes the batch
                match fsm.expect(CRC_REQUEST)? {
                    Response::Expected => {
                        let closing = closing_packet();
                        fsm.frame[..closing.len()].copy_from_slice(&closing);
                        fsm.frame_len = closing.len();
                        let next = fsm.transition::<SendClosing>();
                        Ok(next as Box<dyn SenderState>)
                    }
                    Response::RetryRequested => {
                        fsm.link.send_cancel()?;
                        Err(TransferError::InvalidHeader)
                    }
                }
            }
        }
    }
}

impl SenderState for SenderFsm<SendClosing> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>, TransferError> {
        let mut fsm = *self;

        fsm.link.send_bytes(&fsm.frame[..fsm.frame_len])?;
        if fsm.debug { println!("Sent: closing packet"); }

        match fsm.expect(ACK)? {
            Response::RetryRequested => Ok(Box::new(fsm) as Box<dyn SenderState>),
            Response::Expected => Err(TransferError::TransferComplete),
        }
    }
}

// ============================================================================
// Constructor
// ============================================================================

impl SenderFsm<AwaitCrcMode> {
    pub fn new(
        link: Link,
        source: Box<dyn FileHandle>,
        filename: &str,
        file_size: u32,
        config: Config,
        debug: bool,
    ) -> Box<dyn SenderState> {
        Box::new(SenderFsm {
            state: PhantomData::<AwaitCrcMode>,
            link,
            source,
            filename: filename.to_string(),
            file_size,
            remaining: file_size,
            offset: 0,
            block: 1,
            frame: [0; FRAME_MAX],
            frame_len: 0,
            chunk: 0,
            retransmit: false,
            attempts: 0,
            started: Instant::now(),
            config,
            debug,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::path::Path;
    use crate::serial::MockSerialPort;

    fn run_sender(mut fsm: Box<dyn SenderState>) -> Result<(), TransferError> {
        loop {
            match fsm.step() {
                Ok(next) => fsm = next,
                Err(TransferError::TransferComplete) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn sender(
        responses: Vec<Option<u8>>,
        expected_writes: Vec<u8>,
        source: &Path,
        name: &str,
        size: u32,
        config: Config,
    ) -> Box<dyn SenderState> {
        let mock = Box::new(MockSerialPort::new(responses, expected_writes));
        let file = Box::new(File::open(source).unwrap());
        SenderFsm::new(Link::new(mock), file, name, size, config, true)
    }

    #[test]
    fn test_sender_full_transfer() {
        let path = std::env::temp_dir().join("sender_small.bin");
        std::fs::write(&path, b"Test data").unwrap();

        let responses = vec![
            Some(CRC_REQUEST),
            Some(ACK),
            Some(CRC_REQUEST),
            Some(ACK),
            Some(ACK),
            Some(CRC_REQUEST),
            Some(ACK),
        ];

        let mut expected_writes = vec![CRC_REQUEST];
        expected_writes.extend_from_slice(&header_packet("small.bin", 9));
        expected_writes.extend_from_slice(&data_packet(1, b"Test data"));
        expected_writes.push(EOT);
        expected_writes.extend_from_slice(&closing_packet());

        let fsm = sender(responses, expected_writes, &path, "small.bin", 9, Config::default());
        run_sender(fsm).expect("transfer should succeed");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_sender_nak_resends_identical_block() {
        let path = std::env::temp_dir().join("sender_nak.bin");
        std::fs::write(&path, b"retry me").unwrap();

        let responses = vec![
            Some(CRC_REQUEST),
            Some(ACK),
            Some(CRC_REQUEST),
            Some(NAK),
            Some(ACK),
            Some(ACK),
            Some(CRC_REQUEST),
            Some(ACK),
        ];

        let block = data_packet(1, b"retry me");
        let mut expected_writes = vec![CRC_REQUEST];
        expected_writes.extend_from_slice(&header_packet("nak.bin", 8));
        expected_writes.extend_from_slice(&block);
        expected_writes.extend_from_slice(&block);
        expected_writes.push(EOT);
        expected_writes.extend_from_slice(&closing_packet());

        let fsm = sender(responses, expected_writes, &path, "nak.bin", 8, Config::default());
        run_sender(fsm).expect("transfer should succeed");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_sender_multiple_blocks() {
        let path = std::env::temp_dir().join("sender_2500.bin");
        let content: Vec<u8> = (0..2500).map(|i| (i % 256) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let responses = vec![
            Some(CRC_REQUEST),
            Some(ACK),
            Some(CRC_REQUEST),
            Some(ACK),
            Some(ACK),
            Some(ACK),
            Some(ACK),
            Some(CRC_REQUEST),
            Some(ACK),
        ];

        let mut expected_writes = vec![CRC_REQUEST];
        expected_writes.extend_from_slice(&header_packet("big.bin", 2500));
        expected_writes.extend_from_slice(&data_packet(1, &content[..1024]));
        expected_writes.extend_from_slice(&data_packet(2, &content[1024..2048]));
        expected_writes.extend_from_slice(&data_packet(3, &content[2048..]));
        expected_writes.push(EOT);
        expected_writes.extend_from_slice(&closing_packet());

        let fsm = sender(responses, expected_writes, &path, "big.bin", 2500, Config::default());
        run_sender(fsm).expect("transfer should succeed");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_sender_handshake_gives_up() {
        let path = std::env::temp_dir().join("sender_nopeer.bin");
        std::fs::write(&path, b"unsent").unwrap();

        let config = Config {
            handshake_retries: 3,
            ..Config::default()
        };

        let responses = vec![None, None, None];
        let expected_writes = vec![CRC_REQUEST, CRC_REQUEST, CRC_REQUEST, CAN, CAN];

        let fsm = sender(responses, expected_writes, &path, "nopeer.bin", 6, config);
        assert!(matches!(run_sender(fsm), Err(TransferError::Timeout)));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_sender_handshake_rejects_non_crc_peer() {
        let path = std::env::temp_dir().join("sender_checksum_peer.bin");
        std::fs::write(&path, b"legacy").unwrap();

        // A checksum-mode receiver answers with NAK instead of 'C'
        let responses = vec![Some(NAK)];
        let expected_writes = vec![CRC_REQUEST, CAN, CAN];

        let fsm = sender(responses, expected_writes, &path, "legacy.bin", 6, Config::default());
        assert!(matches!(run_sender(fsm), Err(TransferError::CrcError)));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_sender_peer_abort_mid_transfer() {
        let path = std::env::temp_dir().join("sender_abort.bin");
        std::fs::write(&path, b"doomed").unwrap();

        let responses = vec![
            Some(CRC_REQUEST),
            Some(ACK),
            Some(CRC_REQUEST),
            Some(CAN),
        ];

        let mut expected_writes = vec![CRC_REQUEST];
        expected_writes.extend_from_slice(&header_packet("abort.bin", 6));
        expected_writes.extend_from_slice(&data_packet(1, b"doomed"));
        expected_writes.push(CAN);
        expected_writes.push(CAN);

        let fsm = sender(responses, expected_writes, &path, "abort.bin", 6, Config::default());
        assert!(matches!(run_sender(fsm), Err(TransferError::AbortedByPeer)));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_sender_eot_nak_handshake() {
        let path = std::env::temp_dir().join("sender_eot.bin");
        std::fs::write(&path, b"eot").unwrap();

        let responses = vec![
            Some(CRC_REQUEST),
            Some(ACK),
            Some(CRC_REQUEST),
            Some(ACK),
            Some(NAK),
            Some(ACK),
            Some(CRC_REQUEST),
            Some(ACK),
        ];

        let mut expected_writes = vec![CRC_REQUEST];
        expected_writes.extend_from_slice(&header_packet("eot.bin", 3));
        expected_writes.extend_from_slice(&data_packet(1, b"eot"));
        expected_writes.push(EOT);
        expected_writes.push(EOT);
        expected_writes.extend_from_slice(&closing_packet());

        let fsm = sender(responses, expected_writes, &path, "eot.bin", 3, Config::default());
        run_sender(fsm).expect("transfer should succeed");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_sender_header_timeout_cancels() {
        let path = std::env::temp_dir().join("sender_hdrtimeout.bin");
        std::fs::write(&path, b"stuck").unwrap();

        let config = Config {
            response_retries: 2,
            ..Config::default()
        };

        let responses = vec![Some(CRC_REQUEST), None, None];

        let mut expected_writes = vec![CRC_REQUEST];
        expected_writes.extend_from_slice(&header_packet("stuck.bin", 5));
        expected_writes.push(CAN);
        expected_writes.push(CAN);

        let fsm = sender(responses, expected_writes, &path, "stuck.bin", 5, config);
        assert!(matches!(run_sender(fsm), Err(TransferError::Timeout)));

        std::fs::remove_file(&path).ok();
    }
}
