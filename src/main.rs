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

// YMODEM file transfer over a serial link
mod crc;
mod packet;
mod protocol;
mod receiver;
mod sender;
mod serial;
mod session;
mod storage;

use clap::{Parser, Subcommand};
use serialport::{DataBits, Parity, StopBits};
use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;
use protocol::{Config, MAX_FILE_SIZE};
use serial::RealSerialPort;
use session::NoIndicator;

#[derive(Parser)]
#[command(name = "ymolink")]
#[command(about = "YMODEM file transfer over a serial link", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name = "BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name = "BITS")]
    stop_bits: u8,

    /// Per-byte receive timeout in milliseconds
    #[arg(long, default_value = "1000", value_name = "MS")]
    timeout: u64,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file to a YMODEM receiver
    Send {
        /// File to send
        file: PathBuf,
    },
    /// Receive a file from a YMODEM sender
    Receive {
        /// Destination file for the received data
        #[arg(short, long, default_value = "received.bin")]
        output: PathBuf,

        /// Largest declared file size to accept, in bytes
        #[arg(long, default_value_t = MAX_FILE_SIZE, value_name = "BYTES")]
        max_size: u32,
    },
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn main() {
    let cli = Cli::parse();

    let data_bits = match parse_data_bits(cli.data_bits) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let parity = match parse_parity(&cli.parity) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let stop_bits = match parse_stop_bits(cli.stop_bits) {
        Ok(sb) => sb,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    println!("Opening serial port: {}", cli.port);
    println!("Settings: {} baud, {:?}, {:?}, {:?}", cli.baud, data_bits, parity, stop_bits);

    let serial_port = match RealSerialPort::open(&cli.port, cli.baud, data_bits, parity, stop_bits) {
        Ok(port) => port,
        Err(e) => {
            eprintln!("Failed to open serial port: {}", e);
            std::process::exit(1);
        }
    };

    let config = Config {
        byte_timeout: Duration::from_millis(cli.timeout),
        ..Config::default()
    };

    let mut indicator = NoIndicator;

    match cli.command {
        Commands::Send { file } => {
            if storage::file_size(&file) == 0 {
                eprintln!("Error: {} is missing or empty", file.display());
                std::process::exit(1);
            }

            let source = match File::open(&file) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Failed to open {}: {}", file.display(), e);
                    std::process::exit(1);
                }
            };

            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unnamed.bin")
                .to_string();

            println!("\nSending file: {}", file.display());
            match session::transmit(
                Box::new(serial_port),
                &name,
                Box::new(source),
                config,
                &mut indicator,
                cli.debug,
            ) {
                Ok(size) => println!("\nSent \"{}\" ({} bytes)", name, size),
                Err(e) => {
                    eprintln!("\nSend failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Receive { output, max_size } => {
            let dest = match File::create(&output) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Failed to create {}: {}", output.display(), e);
                    std::process::exit(1);
                }
            };

            println!("\nReceiving into: {}", output.display());
            match session::receive(
                Box::new(serial_port),
                Box::new(dest),
                max_size,
                config,
                &mut indicator,
                cli.debug,
            ) {
                Ok(rx) => {
                    println!("\nReceived \"{}\" ({} bytes) into {}", rx.filename, rx.size, output.display());
                }
                Err(e) => {
                    // Whatever partial data was written is not worth keeping
                    std::fs::remove_file(&output).ok();
                    eprintln!("\nReceive failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}
