//! Command-line interface.
//!
//! Every setting resolves as explicit flag, then environment variable, then default.

use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Default backend socket, relative to the working directory.
pub const DEFAULT_BACKEND_SOCKET: &str = "testing/.cache/sockets/backend.sock";
/// Default web front socket, relative to the working directory.
pub const DEFAULT_WEB_SOCKET: &str = "testing/.cache/sockets/web.sock";

/// Services that authenticate each other with workload identity mTLS instead of API keys.
#[derive(Parser, Debug)]
#[command(name = "workload-mtls-demo")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level or `EnvFilter` directive (overridden by `RUST_LOG`)
    #[arg(long, default_value = "info", env = "LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format
    #[arg(
        long,
        value_enum,
        default_value_t = LogFormat::Text,
        env = "LOG_FORMAT",
        global = true
    )]
    pub log_format: LogFormat,

    /// Seconds to wait for the first identity from the workload socket
    #[arg(
        long,
        default_value_t = 10,
        env = "WORKLOAD_INITIAL_FETCH_TIMEOUT_SECS",
        global = true
    )]
    pub initial_fetch_timeout_secs: u64,

    /// Role to run
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Initial fetch timeout as a `Duration`.
    pub fn initial_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.initial_fetch_timeout_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

/// Service roles.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Backend: mTLS listener accepting only approved client identities
    Server(ServerArgs),
    /// Web front: plain HTTP listener calling the backend over mTLS
    Client(ClientArgs),
}

/// Backend settings.
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Workload API socket address
    #[arg(long, env = "WORKLOAD_API_SOCKET")]
    pub workload_socket: Option<String>,

    /// Legacy socket setting, used when `--workload-socket` is unset
    #[arg(long, env = "BACKEND_SOCKET_PATH", hide = true)]
    pub backend_socket_path: Option<String>,

    /// Client subject ids allowed to connect (comma-separated)
    #[arg(
        long = "approved-client-id",
        env = "BACKEND_APPROVED_CLIENT_SPIFFEID",
        value_delimiter = ',',
        required = true
    )]
    pub approved_client_ids: Vec<String>,

    /// Display name reported by `/`
    #[arg(long, env = "BACKEND_NAME", default_value = "")]
    pub name: String,

    /// Infrastructure label reported by `/`
    #[arg(long, env = "BACKEND_INFRA", default_value = "")]
    pub infra: String,

    /// TLS port
    #[arg(long, env = "BACKEND_PORT", default_value_t = 8443)]
    pub port: u16,
}

impl ServerArgs {
    /// The socket to use: flag or `WORKLOAD_API_SOCKET`, then `BACKEND_SOCKET_PATH`, then
    /// the default.
    pub fn workload_socket(&self) -> &str {
        self.workload_socket
            .as_deref()
            .or(self.backend_socket_path.as_deref())
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_BACKEND_SOCKET)
    }
}

/// Web front settings.
#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Workload API socket address
    #[arg(long, env = "WEB_WORKLOAD_SOCKET")]
    pub workload_socket: Option<String>,

    /// Shared socket setting, used when `--workload-socket` is unset
    #[arg(long, env = "WORKLOAD_API_SOCKET", hide = true)]
    pub shared_workload_socket: Option<String>,

    /// HTTP port
    #[arg(long, env = "WEB_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Backend base URL
    #[arg(long, env = "BACKEND_URL", default_value = "https://backend:8443")]
    pub backend_url: String,

    /// Subject id the backend must present
    #[arg(
        long,
        env = "BACKEND_SPIFFE_ID",
        default_value = "spiffe://example.com/backend"
    )]
    pub backend_id: String,
}

impl ClientArgs {
    /// The socket to use: flag or `WEB_WORKLOAD_SOCKET`, then `WORKLOAD_API_SOCKET`, then the
    /// default.
    pub fn workload_socket(&self) -> &str {
        self.workload_socket
            .as_deref()
            .or(self.shared_workload_socket.as_deref())
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_WEB_SOCKET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn server_flags_and_defaults() {
        let cli = Cli::try_parse_from([
            "demo",
            "server",
            "--approved-client-id",
            "spiffe://example.org/web,spiffe://example.org/cli",
        ])
        .unwrap();

        assert_eq!(cli.log_format, LogFormat::Text);
        assert_eq!(cli.initial_fetch_timeout(), Duration::from_secs(10));
        let Command::Server(args) = cli.command else {
            panic!("expected server role");
        };
        assert_eq!(
            args.approved_client_ids,
            ["spiffe://example.org/web", "spiffe://example.org/cli"]
        );
        assert_eq!(args.port, 8443);
        assert_eq!(args.name, "");
    }

    #[test]
    fn explicit_socket_beats_legacy_setting() {
        let args = ServerArgs {
            workload_socket: Some("unix:///run/new.sock".into()),
            backend_socket_path: Some("/run/old.sock".into()),
            approved_client_ids: vec![],
            name: String::new(),
            infra: String::new(),
            port: 8443,
        };
        assert_eq!(args.workload_socket(), "unix:///run/new.sock");

        let legacy = ServerArgs {
            workload_socket: None,
            ..args.clone()
        };
        assert_eq!(legacy.workload_socket(), "/run/old.sock");

        let neither = ServerArgs {
            backend_socket_path: None,
            ..legacy
        };
        assert_eq!(neither.workload_socket(), DEFAULT_BACKEND_SOCKET);
    }

    #[test]
    fn client_defaults() {
        let cli = Cli::try_parse_from(["demo", "--log-format", "json", "client"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        let Command::Client(args) = cli.command else {
            panic!("expected client role");
        };
        assert_eq!(args.port, 8080);
        assert_eq!(args.backend_url, "https://backend:8443");
        assert_eq!(args.backend_id, "spiffe://example.com/backend");
    }

    #[test]
    fn server_requires_approved_ids() {
        assert!(Cli::try_parse_from(["demo", "server"]).is_err());
    }
}
