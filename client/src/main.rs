use clap::Parser;
use client::network::{Claimer, ClaimerConfig};
use log::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Route endpoint that hands out worker ports
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Drop server address for dispatch notices
    #[arg(short = 'd', long, default_value = "127.0.0.1:8090")]
    dispatch: String,

    /// User id to log in with (defaults to one derived from the process id)
    #[arg(short = 'u', long)]
    user_id: Option<String>,

    /// In-game player name reported in the lobby
    #[arg(short = 'n', long, default_value = "Player")]
    name: String,

    #[arg(long, default_value = "lobby")]
    lobby: String,

    /// Delay before answering a dispatch notice, in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Exit after this many drops were ranked
    #[arg(long)]
    drops: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let user_id = args
        .user_id
        .unwrap_or_else(|| format!("user-{}", std::process::id()));

    info!("Starting claimer {} ({})", args.name, user_id);
    if args.fake_ping > 0 {
        info!("Simulating {}ms claim latency", args.fake_ping);
    }

    let mut claimer = Claimer::new(ClaimerConfig {
        route_addr: args.server,
        dispatch_addr: args.dispatch,
        user_id,
        name: args.name,
        lobby_key: args.lobby,
        fake_ping_ms: args.fake_ping,
        max_drops: args.drops,
    });
    claimer.run().await?;

    for (drop_id, report) in claimer.reports() {
        info!("Drop {}: {:?}", drop_id, report);
    }
    Ok(())
}
