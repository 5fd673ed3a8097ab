use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::error::{BrokerError, Result};
use crate::rooms::broker::Arbitration;
use crate::rooms::snapshot::DEFAULT_SNAPSHOT_SIZE;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SOCKET_PORT: u16 = 3000;
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

#[derive(Parser, Debug, Clone)]
#[command(name = "roomcast", version, about = "Room subscription broker over Redis pub/sub")]
pub struct Cli {
    /// Redis connection string for the shared store and the upstream bus
    #[arg(long, env = "REDIS_CONNECTION_STRING", default_value = DEFAULT_REDIS_URL, global = true)]
    pub redis_url: String,

    /// Backend for shared state and upstream channels
    #[arg(long, env = "ROOMCAST_STORE", value_enum, default_value_t = StoreBackend::Redis, global = true)]
    pub store: StoreBackend,

    /// Upper bound on a single store or bus round-trip, in milliseconds
    #[arg(long, env = "ROOMCAST_STORE_TIMEOUT_MS", default_value_t = 5_000, global = true)]
    pub store_timeout_ms: u64,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "ROOMCAST_LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "ROOMCAST_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(flatten)]
    pub serve: ServeArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind the WebSocket listener on
    #[arg(long, env = "ROOMCAST_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// WebSocket listener port
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Port of the web client, used for the default allowed origin
    #[arg(long, env = "SOCKET_PORT", default_value_t = DEFAULT_SOCKET_PORT)]
    pub socket_port: u16,

    /// Allowed handshake origins (comma-separated, `*` for any)
    #[arg(long = "allowed-origin", env = "ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    /// Max concurrent connections on this instance
    #[arg(long, env = "ROOMCAST_MAX_CONNECTIONS", default_value_t = 10_000)]
    pub max_connections: usize,

    /// How a join decides to create the upstream subscription
    #[arg(long, env = "ROOMCAST_ARBITRATION", value_enum, default_value_t = Arbitration::Snapshot)]
    pub arbitration: Arbitration,

    /// Entries returned per snapshot request
    #[arg(long, env = "ROOMCAST_SNAPSHOT_SIZE", default_value_t = DEFAULT_SNAPSHOT_SIZE)]
    pub snapshot_size: usize,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the WebSocket server (default)
    Serve,
    /// Publish one payload to a room's upstream channel
    Publish { room: String, payload: String },
    /// Print a room's initial snapshot as JSON
    Snapshot { room: String },
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Cli {
    pub fn action(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store_timeout_ms == 0 {
            return Err(BrokerError::Config("store timeout must be positive".into()));
        }
        if self.serve.max_connections == 0 {
            return Err(BrokerError::Config("max connections must be positive".into()));
        }
        self.serve.listen_addr().map(|_| ())
    }
}

impl ServeArgs {
    /// Configured origins, or the local web client's origin when none given.
    pub fn origins(&self) -> Vec<String> {
        let origins: Vec<String> = self
            .allowed_origins
            .iter()
            .map(|o| o.trim().to_owned())
            .filter(|o| !o.is_empty())
            .collect();
        if origins.is_empty() {
            vec![format!("http://localhost:{}", self.socket_port)]
        } else {
            origins
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|e| BrokerError::Config(format!("invalid host {:?}: {e}", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["roomcast"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&[]);
        assert_eq!(cli.action(), Command::Serve);
        assert_eq!(cli.store, StoreBackend::Redis);
        assert_eq!(cli.store_timeout(), Duration::from_secs(5));
        assert_eq!(cli.serve.max_connections, 10_000);
        assert_eq!(cli.serve.snapshot_size, 50);
        assert_eq!(cli.serve.arbitration, Arbitration::Snapshot);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_default_origin_follows_socket_port() {
        let cli = parse(&["--socket-port", "4000"]);
        assert_eq!(cli.serve.origins(), vec!["http://localhost:4000".to_string()]);
    }

    #[test]
    fn test_allowed_origins_comma_separated() {
        let cli = parse(&["--allowed-origin", "http://a.test, http://b.test"]);
        assert_eq!(
            cli.serve.origins(),
            vec!["http://a.test".to_string(), "http://b.test".to_string()]
        );
    }

    #[test]
    fn test_publish_subcommand_with_global_flags() {
        let cli = parse(&["publish", "alpha", "hello", "--store", "memory"]);
        assert_eq!(
            cli.action(),
            Command::Publish {
                room: "alpha".into(),
                payload: "hello".into()
            }
        );
        assert_eq!(cli.store, StoreBackend::Memory);
    }

    #[test]
    fn test_arbitration_and_log_format_values() {
        let cli = parse(&["--arbitration", "counter", "--log-format", "json"]);
        assert_eq!(cli.serve.arbitration, Arbitration::Counter);
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn test_listen_addr() {
        let cli = parse(&["--host", "127.0.0.1", "--port", "9001"]);
        assert_eq!(
            cli.serve.listen_addr().unwrap(),
            "127.0.0.1:9001".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(matches!(
            parse(&["--host", "not-an-ip"]).validate(),
            Err(BrokerError::Config(_))
        ));
        assert!(parse(&["--max-connections", "0"]).validate().is_err());
        assert!(parse(&["--store-timeout-ms", "0"]).validate().is_err());
    }
}
