mod commands;
mod config;
mod error;
mod routes;
mod system;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use commands::SystemState;
use config::{Command, Config, is_root};
use error::AppError;
use routes::store::RouteStore;
use routes::{LOOPBACK, VIRTUAL_PORT};
use system::{HostsFile, Pfctl, SystemLoopback};

fn main() -> anyhow::Result<()> {
    let config = Config::load()?;

    // Logs go to stderr so the status report stays clean on stdout
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log_filter))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let Err(e) = run(&config) else {
        return Ok(());
    };

    let hint = e
        .downcast_ref::<AppError>()
        .map(|app| (app.is_user_recoverable(), app.user_message()));

    match hint {
        Some((true, message)) => {
            eprintln!("{}", message);
            std::process::exit(1);
        }
        Some((false, message)) => {
            eprintln!("hint: {}", message);
            Err(e.context(format!("dev-proxy {} failed", config.command.name())))
        }
        None => Err(e),
    }
}

fn run(config: &Config) -> anyhow::Result<()> {
    check_privilege(&config.command)?;

    let store = RouteStore::new(&config.config_dir);
    tracing::debug!(
        route_file = %config.route_file().display(),
        hosts_file = %config.hosts_file.display(),
        interface = %config.interface,
        "Using configuration"
    );

    let system = SystemState::new(
        SystemLoopback::new(config.interface.clone()),
        HostsFile::new(config.hosts_file.clone()),
        Pfctl,
    );

    match &config.command {
        Command::Add { host, port } => {
            let route = commands::add(&store, host, *port)?;
            println!(
                "==> Dev proxy: {} => {} (port {}) saved to {}",
                route.hostname,
                route.virtual_ip,
                route.local_port,
                store.path().display()
            );
        }
        Command::Up => {
            let routes = commands::up(&store, &system)?;
            for route in &routes {
                println!(
                    "{} => {}:{} => {}:{}",
                    route.hostname, route.virtual_ip, VIRTUAL_PORT, LOOPBACK, route.local_port
                );
            }
            println!("\nDev proxy: running!");
        }
        Command::Status { json } => {
            let report = commands::status(&store, &system)?;
            if *json {
                let out = serde_json::to_string_pretty(&report)
                    .context("failed to encode status report")?;
                println!("{}", out);
            } else {
                print!("{}", report);
            }
        }
        Command::Reset => {
            let removed = commands::reset(&system)?;
            for ip in &removed {
                println!("Removed alias: {}", ip);
            }
            println!("Dev proxy: stopped. Routes remain registered; run `dev-proxy up` to restore them.");
        }
        Command::Version => {
            println!("version: {}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}

fn check_privilege(command: &Command) -> Result<(), AppError> {
    let root = is_root();
    if command.needs_root() && !root {
        return Err(AppError::Privilege(format!(
            "dev-proxy {} needs to be run as sudo",
            command.name()
        )));
    }
    if matches!(command, Command::Add { .. }) && root {
        return Err(AppError::Privilege(
            "dev-proxy add must not be run as sudo; the route table belongs to your user".to_string(),
        ));
    }
    Ok(())
}
