//! Raw Galil protocol test - minimal queries to debug communication

use anyhow::Result;
use clap::Parser;
use hardware::galil::{CommandChannel, TcpChannel, DEFAULT_PORT};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Send a few raw queries to a Galil controller")]
struct Args {
    /// Controller IP address
    #[arg(long, default_value = "192.168.0.100")]
    ip: String,

    /// TCP port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Extra raw commands to send after the standard queries
    commands: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    info!("Connecting to Galil controller at {}:{}...", args.ip, args.port);
    let mut channel = TcpChannel::connect((args.ip.as_str(), args.port))?;

    for command in ["MG _FW", "MG _BN", "TP", "MG _BGA"]
        .into_iter()
        .map(str::to_string)
        .chain(args.commands)
    {
        info!("Sending {command}...");
        let reply = channel.send(&command)?;
        info!("Got: {reply:?}");
    }

    info!("Done!");
    Ok(())
}
