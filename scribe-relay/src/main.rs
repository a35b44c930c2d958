//! Scribe relay binary.
//!
//! Routes collaborative editing traffic between the members of each
//! document room. Holds no document state.

use clap::Parser;
use log::info;
use scribe_collab::server::{RelayServer, ServerConfig};

/// Relay command line arguments.
#[derive(Parser, Debug)]
#[command(name = "scribe-relay")]
#[command(about = "WebSocket relay for collaborative document editing")]
struct Args {
    /// Address to listen on
    #[arg(short, long, env = "SCRIBE_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// Frames a slow member may fall behind before losing them
    #[arg(long, env = "SCRIBE_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,

    /// Seconds between WebSocket pings
    #[arg(long, env = "SCRIBE_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            bind_addr: args.bind,
            broadcast_capacity: args.broadcast_capacity.max(1),
            heartbeat_interval_secs: args.heartbeat_secs.max(1),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Args::parse());
    info!("Starting scribe-relay on {}", config.bind_addr);

    let server = RelayServer::new(config);
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            let stats = server.stats().await;
            info!(
                "Served {} connections, {} messages",
                stats.total_connections, stats.total_messages
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_server_config() {
        let config = ServerConfig::from(Args::parse_from(["scribe-relay"]));
        let defaults = ServerConfig::default();
        assert_eq!(config.bind_addr, defaults.bind_addr);
        assert_eq!(config.broadcast_capacity, defaults.broadcast_capacity);
        assert_eq!(config.heartbeat_interval_secs, defaults.heartbeat_interval_secs);
    }

    #[test]
    fn test_flags_override() {
        let args = Args::parse_from([
            "scribe-relay",
            "--bind",
            "0.0.0.0:7000",
            "--broadcast-capacity",
            "16",
            "--heartbeat-secs",
            "0",
        ]);
        let config = ServerConfig::from(args);
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.broadcast_capacity, 16);
        assert_eq!(config.heartbeat_interval_secs, 1);
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
