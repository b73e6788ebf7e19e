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

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

// ============================================================================
// FileHandle Trait
// ============================================================================

/// Capability interface over one open file, the only storage surface the
/// protocol core touches. A transfer owns its handle exclusively for the
/// duration of the session.
pub trait FileHandle: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Positions the handle at `offset` from the start.
    fn seek(&mut self, offset: u64) -> io::Result<()>;

    fn size(&mut self) -> io::Result<u64>;

    /// Fills `buf` completely or fails.
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut pos = 0;
        while pos < buf.len() {
            let n = self.read(&mut buf[pos..])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "source file ended early",
                ));
            }
            pos += n;
        }
        Ok(())
    }
}

impl FileHandle for fs::File {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }

    fn seek(&mut self, offset: u64) -> io::Result<()> {
        Seek::seek(self, SeekFrom::Start(offset)).map(|_| ())
    }

    fn size(&mut self) -> io::Result<u64> {
        self.metadata().map(|m| m.len())
    }
}

/// Size of the file at `path`, 0 if it does not exist.
pub fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

// ============================================================================
// Tests
// ============================================================================
