use anyhow::Context;
use std::path::PathBuf;

pub(crate) const DEFAULT_CONFIG_PATH: &str = "./config/relay.toml";

pub(crate) struct Args {
    pub config_path: PathBuf,
    pub room_id: String,
    pub peer_id: String,
    pub signaling_url: String,
    pub bot_token: Option<String>,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut room_id = None;
    let mut peer_id = None;
    let mut signaling_url = None;
    let mut bot_token = None;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("relay-node {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("relay-node - LAN relay reference node");
                println!();
                println!("USAGE:");
                println!("    relay-node [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    --config <PATH>              Config file [default: ./config/relay.toml]");
                println!("    --room <ID>                  Room identifier (required)");
                println!("    --peer-id <ID>                Local peer identifier (required)");
                println!("    --signaling-url <URL>         Signaling server WebSocket URL (required)");
                println!("    --bot-token <TOKEN>           Bot auth token (prefer RELAY_BOT_TOKEN env)");
                println!("    -V, --version                Print version and exit");
                println!("    -h, --help                    Print this help and exit");
                std::process::exit(0);
            }
            "--config" => {
                i += 1;
                config_path = PathBuf::from(args.get(i).context("Missing --config value")?);
            }
            "--room" => {
                i += 1;
                room_id = Some(args.get(i).context("Missing --room value")?.clone());
            }
            "--peer-id" => {
                i += 1;
                peer_id = Some(args.get(i).context("Missing --peer-id value")?.clone());
            }
            "--signaling-url" => {
                i += 1;
                signaling_url = Some(args.get(i).context("Missing --signaling-url value")?.clone());
            }
            "--bot-token" => {
                // Legacy CLI support (prefer RELAY_BOT_TOKEN env var)
                i += 1;
                bot_token = Some(args.get(i).context("Missing --bot-token value")?.clone());
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    // Prefer env var for the bot token (CLI args are visible in /proc)
    if bot_token.is_none() {
        bot_token = std::env::var("RELAY_BOT_TOKEN").ok();
    }

    Ok(Args {
        config_path,
        room_id: room_id.context("--room is required")?,
        peer_id: peer_id.context("--peer-id is required")?,
        signaling_url: signaling_url.context("--signaling-url is required")?,
        bot_token,
    })
}
