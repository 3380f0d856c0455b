//! Collar bring-up tool
//!
//! Prints the challenge response a paired device must present, so firmware
//! output can be compared against the server's expectation.
//!
//! Usage:
//!   cargo run --bin nfc-sign -- --secret <base64> --challenge <hex>
//!   cargo run --bin nfc-sign -- --secret <base64> --challenge <hex> --timestamp 1714564800 --json

use anyhow::Context;
use clap::Parser;
use petgate::services::device_trust::compute_response;

#[derive(Parser, Debug)]
#[command(name = "nfc-sign", version, about = "Compute a device challenge response")]
struct Args {
    /// Shared secret returned at pairing (base64)
    #[arg(short, long)]
    secret: String,

    /// Challenge bytes (hex)
    #[arg(short, long)]
    challenge: String,

    /// Device clock in epoch seconds (default: now)
    #[arg(short, long)]
    timestamp: Option<i64>,

    /// Print the full verify request body instead of just the response
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let challenge = hex::decode(args.challenge.trim()).context("challenge must be hex")?;
    let timestamp = args.timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp());
    let response = compute_response(args.secret.trim(), &challenge, timestamp)?;

    if args.json {
        let body = serde_json::json!({
            "challenge": hex::encode(&challenge),
            "response": response,
            "timestamp": timestamp,
        });
        println!("{body}");
    } else {
        println!("{response}");
    }
    Ok(())
}
