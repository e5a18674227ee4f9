//! Collects measurement records from a link sweep node.
//!
//! Listens on the node's record port and writes every session to
//! `<output>/<name>.csv`.

mod protocol;
mod session;

use std::io::{ErrorKind, Read};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;

use protocol::{cobs_decode, parse_frame, FrameAccumulator};
use session::{Progress, SessionWriter};

#[derive(Parser)]
#[command(name = "collector")]
#[command(about = "Collects measurement records from a link sweep node")]
struct Args {
    /// Serial port of the node's record interface (use "auto" to pick the first one)
    #[arg(short, long, default_value = "auto")]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// Directory for the session files
    #[arg(short, long, default_value = "results")]
    output: PathBuf,
}

/// Resolve a port argument - returns the port path if not "auto", otherwise
/// the first CDC-ACM device, which is the record interface.
fn resolve_port(port_arg: &str) -> Result<String> {
    if port_arg != "auto" {
        return Ok(port_arg.to_string());
    }

    let mut ports: Vec<String> = serialport::available_ports()?
        .into_iter()
        .map(|p| p.port_name)
        .filter(|name| name.contains("ttyACM") || name.contains("usbmodem"))
        .collect();
    ports.sort();
    match ports.into_iter().next() {
        Some(port) => Ok(port),
        None => anyhow::bail!("No record port found - ensure the node is connected"),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let port_name = resolve_port(&args.port)?;

    println!("{}", "Link Sweep Collector".bold());
    println!("Port: {}", port_name);
    println!("Baud: {}", args.baud);
    println!("Output: {}", args.output.display());
    println!();

    let mut port = serialport::new(&port_name, args.baud)
        .timeout(Duration::from_millis(500))
        .open()?;
    // Holding DTR tells the node a collector is listening
    port.write_data_terminal_ready(true)?;
    println!("{}", "Connected, waiting for sessions...".green());

    let mut writer = SessionWriter::new(&args.output)?;
    let mut accumulator = FrameAccumulator::new();
    let mut buf = [0u8; 256];

    loop {
        let n = match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::TimedOut => continue,
            Err(e) => return Err(e.into()),
        };

        for &byte in &buf[..n] {
            let Some(encoded) = accumulator.push(byte) else {
                continue;
            };

            let frame = match cobs_decode(&encoded).and_then(|raw| parse_frame(&raw)) {
                Ok(frame) => frame,
                Err(e) => {
                    println!("{} {}", "Dropped frame:".yellow(), e);
                    continue;
                }
            };

            match writer.handle(&frame)? {
                Progress::Opened(path) => println!("{} {}", "Session".cyan().bold(), path.display()),
                Progress::Flushed(lines) => println!("  {} {} lines", "+".green(), lines),
                Progress::Closed { name, lines } => {
                    println!("{} {} ({} lines)", "Closed".cyan().bold(), name, lines)
                }
                Progress::Ignored => println!("{}", "Frame outside a session ignored".yellow()),
                Progress::Line => {}
            }
        }
    }
}
