//! modelbus-call: one-shot client
//!
//! Sends a single request to a model service over the configured broker and
//! prints the JSON reply. With `--broadcast` the request goes to every
//! running worker and the number of receivers is printed instead.
//!
//! ## Configuration
//! - MODELBUS_CONFIG: Path to a YAML config file (optional)
//! - MODELBUS__BROKER__TYPE / MODELBUS__BROKER__REDIS__URL: Broker selection
//! - MODELBUS_LOG: Log filter (default: info)

use clap::Parser;
use serde_json::{Map, Value};
use tracing::info;

use modelbus::broker::init_broker;
use modelbus::config::Config;
use modelbus::utils::bootstrap::init_tracing;
use modelbus::Dispatcher;

#[derive(Debug, Parser)]
#[command(name = "modelbus-call", version, about = "Call a model service over the broker")]
struct Args {
    /// Method to invoke, e.g. predict or enabled_version.
    method: String,

    /// Arguments as a JSON object.
    #[arg(default_value = "{}")]
    args: String,

    /// Publish to every worker instead of waiting on one reply.
    #[arg(long)]
    broadcast: bool,

    /// Configuration file.
    #[arg(long, short)]
    config: Option<String>,

    /// Target service, overriding the configured name.
    #[arg(long, env = "MODELBUS_SERVICE")]
    service: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    init_tracing();

    let config = Config::load(args.config.as_deref())?;
    let payload: Map<String, Value> = serde_json::from_str(&args.args)?;
    let service = args.service.unwrap_or(config.service.name);

    let broker = init_broker(&config.broker).await?;
    let dispatcher =
        Dispatcher::new(broker, service.as_str()).with_reply_backoff(config.dispatch.reply_backoff);

    info!(service = %service, method = %args.method, broadcast = args.broadcast, "Calling");

    if args.broadcast {
        let receivers = dispatcher.broadcast(&args.method, payload).await?;
        println!("{}", receivers);
    } else {
        let reply = dispatcher.dispatch(&args.method, payload).await?;
        println!("{}", serde_json::to_string_pretty(&reply)?);
    }

    Ok(())
}
