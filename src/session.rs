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

//! Session entry points: run one state machine to completion per call.

use crate::protocol::{Config, TransferError};
use crate::receiver::{Received, ReceiverFsm, ReceiverState};
use crate::sender::{SenderFsm, SenderState};
use crate::serial::{Link, SerialPort};
use crate::storage::FileHandle;

// ============================================================================
// Activity Indicator
// ============================================================================

/// Observational transfer-activity output (an LED on embedded peers).
/// Toggled once per packet exchange and restored when the session ends.
pub trait ActivityIndicator {
    fn toggle(&mut self);

    fn restore(&mut self) {}
}

/// Indicator that does nothing.
pub struct NoIndicator;

impl ActivityIndicator for NoIndicator {
    fn toggle(&mut self) {}
}

// ============================================================================
// Entry Points
// ============================================================================

/// Receives one file into `dest`, rejecting any transfer whose declared
/// size exceeds `max_size`. Returns the announced filename and the bytes
/// written. The caller owns `dest` cleanup on failure; partial data may
/// have been written.
pub fn receive(
    serial: Box<dyn SerialPort>,
    dest: Box<dyn FileHandle>,
    max_size: u32,
    config: Config,
    indicator: &mut dyn ActivityIndicator,
    debug: bool,
) -> Result<Received, TransferError> {
    let mut fsm = ReceiverFsm::new(Link::new(serial), dest, max_size, config, debug);

    let result = loop {
        indicator.toggle();
        let progress = fsm.received();
        match fsm.step() {
            Ok(next) => fsm = next,
            Err(TransferError::TransferComplete) => break Ok(progress),
            Err(e) => break Err(e),
        }
    };

    indicator.restore();
    result
}

/// Transmits `source` as one file named `filename` (a single leading
/// path separator is stripped; wire filenames are relative). Returns the
/// number of bytes sent.
pub fn transmit(
    serial: Box<dyn SerialPort>,
    filename: &str,
    mut source: Box<dyn FileHandle>,
    config: Config,
    indicator: &mut dyn ActivityIndicator,
    debug: bool,
) -> Result<u32, TransferError> {
    let size = source.size().map_err(|_| TransferError::ReadError)?;
    let size = u32::try_from(size).map_err(|_| TransferError::SizeOverflow)?;

    let wire_name = filename.strip_prefix('/').unwrap_or(filename);

    let mut fsm = SenderFsm::new(Link::new(serial), source, wire_name, size, config, debug);

    let result = loop {
        indicator.toggle();
        match fsm.step() {
            Ok(next) => fsm = next,
            Err(TransferError::TransferComplete) => break Ok(size),
            Err(e) => break Err(e),
        }
    };

    indicator.restore();
    result
}

// ============================================================================
// Tests
// ============================================================================
