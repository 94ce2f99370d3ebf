// Persistent route table: one TOML table per short hostname

use super::{Route, RouteTable};
use crate::error::{AppError, AppResult};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const ROUTE_FILE_NAME: &str = "config.toml";

pub struct RouteStore {
    path: PathBuf,
}

impl RouteStore {
    /// Store rooted at a per-user configuration directory
    pub fn new(config_dir: &Path) -> Self {
        RouteStore {
            path: config_dir.join(ROUTE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted table; a missing or empty table is `NotConfigured`
    pub fn load(&self) -> AppResult<RouteTable> {
        match self.read()? {
            Some(table) if !table.is_empty() => Ok(table),
            _ => Err(AppError::NotConfigured(self.path.clone())),
        }
    }

    /// Add or update the route for `hostname` and persist the table
    pub fn upsert(&self, hostname: &str, local_port: u16) -> AppResult<Route> {
        let mut table = self.read()?.unwrap_or_default();
        let route = table.upsert(hostname, local_port)?;
        self.save(&table)?;

        tracing::info!(
            hostname = %route.hostname,
            port = route.local_port,
            virtual_ip = %route.virtual_ip,
            "Route table updated"
        );
        Ok(route)
    }

    fn read(&self) -> AppResult<Option<RouteTable>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AppError::io(
                    format!("Failed to read route table {}", self.path.display()),
                    e,
                ));
            }
        };
        self.parse(&content).map(Some)
    }

    fn parse(&self, content: &str) -> AppResult<RouteTable> {
        let corrupt = |message: String| AppError::Parse {
            path: self.path.clone(),
            message,
        };

        let sections: toml::Table = toml::from_str(content).map_err(|e| corrupt(e.to_string()))?;

        let mut table = RouteTable::new();
        for (key, value) in sections {
            let route: Route = value
                .try_into()
                .map_err(|e: toml::de::Error| corrupt(format!("section [{}]: {}", key, e)))?;
            if route.short_name() != key {
                return Err(corrupt(format!(
                    "section [{}] holds hostname {}",
                    key, route.hostname
                )));
            }
            table.push_loaded(route).map_err(corrupt)?;
        }

        tracing::debug!(path = %self.path.display(), routes = table.len(), "Loaded route table");
        Ok(table)
    }

    /// Write to a sibling file and rename it over the table, so a failed
    /// write never leaves a truncated table behind.
    fn save(&self, table: &RouteTable) -> AppResult<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                AppError::io(format!("Failed to create directory {}", dir.display()), e)
            })?;
        }

        let mut sections = toml::Table::new();
        for route in table {
            sections.insert(route.short_name().to_string(), toml::Value::try_from(route)?);
        }
        let content = toml::to_string(&sections)?;

        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, content)
            .map_err(|e| AppError::io(format!("Failed to write {}", tmp.display()), e))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            AppError::io(format!("Failed to replace {}", self.path.display()), e)
        })
    }
}
