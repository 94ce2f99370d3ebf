// Configuration management for dev-proxy
// Supports CLI arguments and environment variables

use crate::routes::store::ROUTE_FILE_NAME;
use crate::system::hosts::DEFAULT_HOSTS_FILE;
use crate::system::loopback::default_interface;
use anyhow::Context;
use clap::{Parser, Subcommand};
use nix::unistd::{User, geteuid};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Directory under the user's home holding the route table
pub const CONFIG_DIR_NAME: &str = ".devproxy";

/// dev-proxy - give local services memorable hostnames on their own loopback address
#[derive(Parser, Debug, Clone)]
#[command(name = "dev-proxy")]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding the route table [default: ~/.devproxy of the invoking user]
    #[arg(long, global = true, env = "DEVPROXY_HOME")]
    pub config_dir: Option<PathBuf>,

    /// Static name resolution table to register hostnames in
    #[arg(long, global = true, default_value = DEFAULT_HOSTS_FILE, env = "DEVPROXY_HOSTS_FILE")]
    pub hosts_file: PathBuf,

    /// Loopback interface to alias virtual IPs on
    #[arg(long, global = true, default_value = default_interface(), env = "DEVPROXY_INTERFACE")]
    pub interface: String,

    /// Logging level (error, warn, info, debug, trace) or filter directives
    /// such as `dev_proxy=debug`
    #[arg(short, long, global = true, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Register a hostname for a local port
    Add {
        /// Hostname that will resolve to a virtual IP
        #[arg(long, default_value = "dev.internal")]
        host: String,

        /// Local port to proxy to
        #[arg(long, default_value = "8080", value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,
    },
    /// Activate every registered route (needs sudo)
    Up,
    /// Show hosts entries, loopback aliases and redirect rules (needs sudo)
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove all aliases and redirect rules; routes stay registered (needs sudo)
    Reset,
    /// Print the version
    Version,
}

impl Command {
    /// Whether the command changes or inspects system state and so needs root
    pub fn needs_root(&self) -> bool {
        matches!(self, Command::Up | Command::Status { .. } | Command::Reset)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Add { .. } => "add",
            Command::Up => "up",
            Command::Status { .. } => "status",
            Command::Reset => "reset",
            Command::Version => "version",
        }
    }
}

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub command: Command,
    pub config_dir: PathBuf,
    pub hosts_file: PathBuf,
    pub interface: String,
    /// `EnvFilter` directives for the subscriber
    pub log_filter: String,
}

impl Config {
    /// Load configuration from CLI args, environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(args: CliArgs) -> anyhow::Result<Self> {
        let log_filter = parse_log_filter(&args.log_level)?;

        let config_dir = match args.config_dir {
            Some(dir) => dir,
            None => invoking_user_home()
                .context("cannot find the home directory; pass --config-dir")?
                .join(CONFIG_DIR_NAME),
        };

        Ok(Config {
            command: args.command,
            config_dir,
            hosts_file: args.hosts_file,
            interface: args.interface,
            log_filter,
        })
    }

    pub fn route_file(&self) -> PathBuf {
        self.config_dir.join(ROUTE_FILE_NAME)
    }
}

fn parse_log_level(level_str: &str) -> anyhow::Result<Level> {
    match level_str.to_lowercase().as_str() {
        "error" => Ok(Level::ERROR),
        "warn" => Ok(Level::WARN),
        "info" => Ok(Level::INFO),
        "debug" => Ok(Level::DEBUG),
        "trace" => Ok(Level::TRACE),
        _ => Err(anyhow::anyhow!("Invalid log level: {}", level_str)),
    }
}

/// Accept a bare level or full `EnvFilter` directives, since `RUST_LOG`
/// commonly holds the latter
fn parse_log_filter(value: &str) -> anyhow::Result<String> {
    if let Ok(level) = parse_log_level(value) {
        return Ok(level.as_str().to_lowercase());
    }
    EnvFilter::try_new(value)
        .map_err(|e| anyhow::anyhow!("Invalid log level: {}: {}", value, e))?;
    Ok(value.to_string())
}

pub fn is_root() -> bool {
    geteuid().is_root()
}

/// Home directory of the user who ran the command. Under sudo that is
/// `$SUDO_USER`, so `sudo dev-proxy up` reads the table `dev-proxy add`
/// wrote.
fn invoking_user_home() -> Option<PathBuf> {
    match std::env::var("SUDO_USER") {
        Ok(user) if !user.is_empty() => home_of(&user),
        _ => std::env::var_os("HOME")
            .filter(|home| !home.is_empty())
            .map(PathBuf::from),
    }
}

/// Look a user's home directory up in the password database
fn home_of(user: &str) -> Option<PathBuf> {
    User::from_name(user).ok().flatten().map(|u| u.dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("dev-proxy").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_add_defaults() {
        let args = parse(&["add", "--config-dir", "/tmp/dp"]);
        assert_eq!(
            args.command,
            Command::Add {
                host: "dev.internal".to_string(),
                port: 8080
            }
        );
        assert_eq!(args.config_dir, Some(PathBuf::from("/tmp/dp")));
    }

    #[test]
    fn test_add_rejects_port_zero() {
        let result = CliArgs::try_parse_from(["dev-proxy", "add", "--host", "api.dev", "--port", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_from_args_uses_explicit_config_dir() {
        let config = Config::from_args(parse(&[
            "status",
            "--json",
            "--config-dir",
            "/tmp/dp",
            "--hosts-file",
            "/tmp/hosts",
            "--log-level",
            "debug",
        ]))
        .unwrap();
        assert_eq!(config.command, Command::Status { json: true });
        assert_eq!(config.route_file(), PathBuf::from("/tmp/dp/config.toml"));
        assert_eq!(config.hosts_file, PathBuf::from("/tmp/hosts"));
        assert_eq!(config.log_filter, "debug");
    }

    #[test]
    fn test_privileged_commands() {
        assert!(Command::Up.needs_root());
        assert!(Command::Reset.needs_root());
        assert!(Command::Status { json: false }.needs_root());
        assert!(!Command::Version.needs_root());
        assert!(
            !Command::Add {
                host: "api.dev".to_string(),
                port: 3000
            }
            .needs_root()
        );
    }

    #[test]
    fn test_home_of_root() {
        assert!(home_of("root").is_some());
        assert!(home_of("no-such-user-dev-proxy").is_none());
        assert!(home_of("bad\0name").is_none());
    }

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("info"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("DEBUG"), Ok(Level::DEBUG)));
        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn test_log_level_accepts_filter_directives() {
        let config = Config::from_args(parse(&[
            "version",
            "--config-dir",
            "/tmp/dp",
            "--log-level",
            "dev_proxy=debug,warn",
        ]))
        .unwrap();
        assert_eq!(config.log_filter, "dev_proxy=debug,warn");

        assert_eq!(parse_log_filter("WARN").unwrap(), "warn");
        assert!(parse_log_filter("dev_proxy=loud").is_err());
    }
}
