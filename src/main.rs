use std::path::PathBuf;

use actix_web::web;
use clap::Parser;

use chat_relay::config::{self, RelayConfig};
use chat_relay::relay_state::RelayState;
use chat_relay::server;

#[derive(Parser)]
#[command(name = "chat-relay", about = "OpenAI-compatible chat-completion relay")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// JSON channel registry file.
    #[arg(long, value_name = "FILE")]
    channels: PathBuf,

    /// Upstream request timeout in seconds.
    #[arg(long, default_value_t = 600)]
    timeout: u64,

    /// Seconds between periodic stats log lines.
    #[arg(long, default_value_t = 60)]
    log_interval: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let channels = config::load_channels(&args.channels)?;
    let (preprompt, guideline) = RelayConfig::augmentation_from_env();
    let config = RelayConfig {
        host: args.host,
        port: args.port,
        timeout: args.timeout,
        log_interval: args.log_interval,
        preprompt,
        guideline,
        channels,
    };

    let state = RelayState::new(&config)?;
    let app_state = web::Data::new(state);
    let log_interval = config.log_interval;
    actix_web::rt::System::new().block_on(async move {
        tokio::spawn(server::periodic_logging(app_state.clone(), log_interval));
        server::startup(config, app_state).await
    })?;
    Ok(())
}
