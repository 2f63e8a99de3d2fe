//! Send one message through a running busgate daemon
//!
//! Usage:
//!   busgate-send --dest 0x22 hello
//!   busgate-send --socket /run/busgate.sock --dest 34 --timeout-secs 5 hello

use anyhow::{bail, Context, Result};
use busgate::{Delivery, GatewayClient};
use busgate_codec::{OutgoingResultCode, DATA_MAX_LENGTH};
use busgate_network::DEFAULT_SOCKET_PATH;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "busgate-send")]
#[command(about = "Submit one message to the busgate daemon and wait for its result")]
#[command(version)]
struct Args {
    /// Gateway socket path
    #[arg(short, long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Destination bus address, decimal or 0x-prefixed hex
    #[arg(short, long, value_parser = parse_address)]
    dest: u8,

    /// Seconds to wait for the delivery result
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Message text
    message: String,
}

fn parse_address(value: &str) -> Result<u8, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => value.parse::<u8>(),
    };
    parsed.map_err(|e| format!("invalid bus address {:?}: {}", value, e))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if args.message.len() > DATA_MAX_LENGTH {
        bail!(
            "message is {} bytes, the gateway accepts at most {}",
            args.message.len(),
            DATA_MAX_LENGTH
        );
    }

    let mut client = GatewayClient::connect(&args.socket)
        .await
        .with_context(|| format!("Failed to connect to {:?}", args.socket))?;
    debug!(version = client.version(), "Handshake complete");

    let (delivery, skipped) = client
        .deliver(
            args.dest,
            args.message.as_bytes(),
            Duration::from_secs(args.timeout_secs),
        )
        .await
        .context("No result from gateway")?;
    for packet in skipped {
        eprintln!("gateway: {}", packet);
    }

    let code = match delivery {
        Delivery::Result(code) => code,
        Delivery::Rejected => bail!(
            "gateway rejected the message for 0x{:02x}: another request is pending or the queue is full",
            args.dest
        ),
    };
    match OutgoingResultCode::try_from(code) {
        Ok(OutgoingResultCode::Success) => {
            println!("delivered to 0x{:02x}", args.dest);
            Ok(())
        }
        Ok(other) => bail!("delivery to 0x{:02x} failed: {:?}", args.dest, other),
        Err(_) => bail!("delivery to 0x{:02x} failed: result code 0x{:04x}", args.dest, code),
    }
}

#[cfg(test)]
mod tests {
    use super::parse_address;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x22"), Ok(0x22));
        assert_eq!(parse_address("34"), Ok(34));
        assert!(parse_address("0x100").is_err());
        assert!(parse_address("bus").is_err());
    }
}
