//! CueTimer - Standalone Timer Node
//!
//! Runs a parent or child timer session with a terminal dashboard.
//!
//! Usage:
//!   cargo run --release -- --parent [--port 47820] [--demo-sheet]
//!   cargo run --release -- --child 192.168.1.20:47820
//!   cargo run --release -- --child host:port --no-dashboard  # Plain logging mode

mod dashboard;
mod metrics;
mod node;

use cuetimer_core::config::DEFAULT_LISTEN_PORT;
use cuetimer_core::network::parse_port;
use cuetimer_core::sync::Role;
use parking_lot::RwLock;
use std::sync::Arc;

use node::NodeOptions;

const USAGE: &str = "usage: cuetimer-node (--parent [--port N] [--demo-sheet] | --child HOST:PORT) [--name NAME] [--no-dashboard]";

/// Parse command line flags; `CUETIMER_PORT` supplies the default port
fn parse_args(args: &[String], env_port: Option<String>) -> Result<(NodeOptions, bool), String> {
    let mut options = NodeOptions {
        name: "cuetimer-node".to_string(),
        role: Role::Parent,
        port: DEFAULT_LISTEN_PORT,
        target: None,
        demo_sheet: false,
    };
    let mut use_dashboard = true;

    if let Some(port) = env_port {
        options.port = parse_port(&port).map_err(|e| e.to_string())?;
    }

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--parent" => options.role = Role::Parent,
            "--child" => {
                let target = iter.next().ok_or("--child needs HOST:PORT")?;
                options.role = Role::Child;
                options.target = Some(target.clone());
            }
            "--port" => {
                let port = iter.next().ok_or("--port needs a value")?;
                options.port = parse_port(port).map_err(|e| e.to_string())?;
            }
            "--name" => {
                options.name = iter.next().ok_or("--name needs a value")?.clone();
            }
            "--demo-sheet" => options.demo_sheet = true,
            "--no-dashboard" => use_dashboard = false,
            other => return Err(format!("unknown argument: {}", other)),
        }
    }

    Ok((options, use_dashboard))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let (options, use_dashboard) = match parse_args(&args, std::env::var("CUETIMER_PORT").ok()) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("{}\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    // Shared metrics state
    let metrics = Arc::new(RwLock::new(metrics::Metrics::new(options.name.clone())));

    if use_dashboard {
        // Run with TUI dashboard
        dashboard::run(options, metrics).await
    } else {
        // Run with plain logging
        node::run_with_logging(options, metrics).await
    }
}
