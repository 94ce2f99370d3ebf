// Error types for dev-proxy

use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("dev-proxy is not configured: no routes in {0}")]
    NotConfigured(PathBuf),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse route table {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Failed to serialize route table: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Loopback interface error: {0}")]
    Interface(String),

    #[error("Firewall error: {0}")]
    Firewall(String),

    #[error("No virtual IP left in 127.0.0.2-127.0.0.255 for {hostname}")]
    AddressSpaceExhausted { hostname: String },

    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    #[error("{0}")]
    Privilege(String),
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Attach a description of the failed operation to an I/O error
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        AppError::Io {
            context: context.into(),
            source,
        }
    }

    /// Collect failed alias removals into a single error
    pub fn unremovable_aliases(failures: &[(Ipv4Addr, String)]) -> Self {
        let detail = failures
            .iter()
            .map(|(ip, reason)| format!("{}: {}", ip, reason))
            .collect::<Vec<_>>()
            .join("; ");
        AppError::Interface(format!(
            "failed to remove {} alias(es): {}",
            failures.len(),
            detail
        ))
    }

    /// Prefix the error with the route it was raised for
    pub fn for_host(self, hostname: &str) -> Self {
        match self {
            AppError::Interface(msg) => AppError::Interface(format!("[{}] {}", hostname, msg)),
            AppError::Firewall(msg) => AppError::Firewall(format!("[{}] {}", hostname, msg)),
            AppError::Io { context, source } => AppError::Io {
                context: format!("[{}] {}", hostname, context),
                source,
            },
            other => other,
        }
    }

    /// Convert error to user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            AppError::NotConfigured(_) => {
                "No routes configured. Run `dev-proxy add --host <name> --port <n>` first.".to_string()
            }
            AppError::Io { .. } => {
                "File system error. Check permissions on the route table and hosts file.".to_string()
            }
            AppError::Parse { path, .. } => {
                format!("The route table at {} is corrupt. Fix or remove it.", path.display())
            }
            AppError::Serialize(_) => {
                "Could not write the route table. This might be a bug, please report it.".to_string()
            }
            AppError::Interface(_) => {
                "Could not change loopback aliases. Make sure you run this with sudo.".to_string()
            }
            AppError::Firewall(_) => {
                "Could not load redirect rules. Make sure pfctl is installed and you run this with sudo.".to_string()
            }
            AppError::AddressSpaceExhausted { .. } => {
                "All loopback addresses are taken. Remove routes from the route table.".to_string()
            }
            AppError::InvalidRoute(msg) => format!("Invalid route: {}.", msg),
            AppError::Privilege(msg) => msg.clone(),
        }
    }

    /// Whether the user can fix this without touching the machine state
    pub fn is_user_recoverable(&self) -> bool {
        matches!(
            self,
            AppError::NotConfigured(_) | AppError::InvalidRoute(_) | AppError::Privilege(_)
        )
    }
}
