//! Session driver for the timer node

use crate::metrics::{format_elapsed, LogLevel, Metrics, NodeStatus};
use cuetimer_core::config::{LinkConfig, SyncConfig};
use cuetimer_core::network::LinkStatus;
use cuetimer_core::session::{SessionEvent, SessionHandle, SyncSession};
use cuetimer_core::sync::{CueSheet, Event, EventKind, Role, TimerPhase};
use parking_lot::RwLock;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long the hold key freezes the timer
const HOLD_FOR: Duration = Duration::from_secs(5);

/// Dashboard refresh of display and diagnostics
const REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// How this node joins the link
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub name: String,
    pub role: Role,
    pub port: u16,
    /// Parent address when starting as a child
    pub target: Option<String>,
    /// Load a small cue sheet at startup (parent only)
    pub demo_sheet: bool,
}

/// Operator actions from the dashboard
#[derive(Debug, Clone, Copy)]
pub enum NodeCommand {
    StartOrPause,
    Reset,
    Hold,
    Burst,
    SwitchRole,
    Quit,
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::Parent => "parent",
        Role::Child => "child",
    }
}

fn demo_sheet() -> CueSheet {
    let mut sheet = CueSheet::new("demo", "Demo Sheet");
    sheet.stop_events = vec![
        Event::new("stop-1", 30.0, EventKind::Stop).with_duration(5.0),
        Event::new("stop-2", 90.0, EventKind::Stop).with_duration(5.0),
    ];
    sheet.cue_events = vec![Event::new("cue-1", 10.0, EventKind::Cue)];
    sheet
}

/// Run the session, feeding metrics and obeying dashboard commands
pub async fn run_with_dashboard(
    options: NodeOptions,
    metrics: Arc<RwLock<Metrics>>,
    mut command_rx: mpsc::UnboundedReceiver<NodeCommand>,
) -> Result<(), Box<dyn Error>> {
    let link = LinkConfig {
        listen_port: options.port,
        ..LinkConfig::default()
    };
    let session = SyncSession::new(options.name.clone(), link, SyncConfig::default()).with_role(options.role);
    let local_id = session.local_id();

    info!("CueTimer node starting as {}...", role_name(options.role));
    info!("Peer ID: {}", local_id);

    {
        let mut m = metrics.write();
        m.peer_id = Some(local_id.to_string());
        m.role = role_name(options.role);
        m.log(LogLevel::Info, format!("Peer ID: {}", local_id));
    }

    let (handle, mut events) = session.start();

    match (options.role, options.target.as_deref()) {
        (Role::Parent, _) => {
            if options.demo_sheet {
                handle.load_cue_sheet(demo_sheet()).await?;
                metrics.write().log(LogLevel::Info, "Loaded demo cue sheet");
            }
            handle.enable_parent(&options.port.to_string())?;
        }
        (Role::Child, Some(target)) => {
            handle.enable_child(target)?;
            metrics.write().address = Some(target.to_string());
        }
        (Role::Child, None) => return Err("a child needs a parent address".into()),
    }

    let display = handle.display();
    let mut refresh = tokio::time::interval(REFRESH_INTERVAL);

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                handle_event(event, &metrics);
            }

            cmd = command_rx.recv() => match cmd {
                Some(NodeCommand::Quit) | None => break,
                Some(cmd) => handle_command(cmd, &handle, &metrics).await,
            },

            _ = refresh.tick() => {
                let current = display.borrow().clone();
                let snapshot = handle.snapshot().await;
                let mut m = metrics.write();
                m.update_timer(&current);
                if let Ok(snapshot) = snapshot {
                    m.diagnostics = snapshot.diagnostics;
                    m.role = role_name(snapshot.role);
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    handle.shutdown();
    Ok(())
}

fn handle_event(event: SessionEvent, metrics: &Arc<RwLock<Metrics>>) {
    let mut m = metrics.write();
    match event {
        SessionEvent::LinkStatusChanged(status) => {
            info!("Link status: {}", status);
            m.link_status = status.to_string();
            match status {
                LinkStatus::Failed(cause) => {
                    warn!("Link failed: {}", cause);
                    m.status = NodeStatus::Error;
                    m.log(LogLevel::Warning, format!("Link failed: {}", cause));
                }
                LinkStatus::NotConnected => {
                    m.status = NodeStatus::Starting;
                }
                _ => {
                    m.status = NodeStatus::Running;
                    m.log(LogLevel::Info, format!("Link {}", status));
                }
            }
        }

        SessionEvent::Listening { addr } => {
            info!("Listening on: {}", addr);
            m.address = Some(addr.to_string());
            m.log(LogLevel::Info, format!("Listening: {}", addr));
        }

        SessionEvent::RoleChanged(role) => {
            info!("Role changed to {}", role_name(role));
            m.role = role_name(role);
            m.log(LogLevel::Info, format!("Now {}", role_name(role)));
        }

        SessionEvent::PeersChanged(peers) => {
            m.peers_changed(&peers);
        }

        SessionEvent::TimerMessage(msg) => {
            debug!("Timer message: {:?}", msg.action);
            if msg.is_control() {
                m.log(
                    LogLevel::Timer,
                    format!(
                        "{:?} #{} at {}",
                        msg.action,
                        msg.action_seq.unwrap_or_default(),
                        format_elapsed(msg.remaining_or_elapsed)
                    ),
                );
            }
        }

        SessionEvent::SyncEnvelope(envelope) => {
            debug!("Sync envelope #{}", envelope.seq);
        }

        SessionEvent::PlaybackChanged(display) => {
            m.update_timer(&display);
        }

        SessionEvent::EventReached { event_id } => {
            info!("Reached stop event {}", event_id);
            m.events_reached += 1;
            m.log(LogLevel::Timer, format!("Reached: {}", event_id));
        }

        SessionEvent::Error(message) => {
            warn!("Session error: {}", message);
            m.log(LogLevel::Error, message);
        }
    }
}

async fn handle_command(cmd: NodeCommand, handle: &SessionHandle, metrics: &Arc<RwLock<Metrics>>) {
    let phase = metrics.read().timer.phase;
    let result = match cmd {
        NodeCommand::StartOrPause if phase == TimerPhase::Running => handle.pause_timer().await,
        NodeCommand::StartOrPause => handle.start_timer().await,
        NodeCommand::Reset => handle.reset_timer().await,
        NodeCommand::Hold => handle.hold_for_stop(HOLD_FOR).await,
        NodeCommand::SwitchRole => handle.switch_role(None),
        NodeCommand::Burst => {
            let config = SyncConfig::default();
            handle
                .request_burst_sync_samples(config.burst_count, config.burst_spacing)
                .await
                .map(|report| {
                    metrics.write().log(
                        LogLevel::Info,
                        format!("Burst: {} sampled, {} timed out", report.sampled, report.timed_out),
                    );
                })
        }
        NodeCommand::Quit => Ok(()),
    };

    if let Err(e) = result {
        warn!("{:?} failed: {}", cmd, e);
        metrics.write().log(LogLevel::Warning, format!("{:?}: {}", cmd, e));
    }
}

/// Run with plain logging (no dashboard)
pub async fn run_with_logging(options: NodeOptions, metrics: Arc<RwLock<Metrics>>) -> Result<(), Box<dyn Error>> {
    // Initialize tracing for logging mode
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cuetimer_node=info".parse()?)
                .add_directive("cuetimer_core=info".parse()?),
        )
        .init();

    let (_tx, rx) = mpsc::unbounded_channel();
    run_with_dashboard(options, metrics, rx).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_sheet_is_ordered() {
        let sheet = demo_sheet();
        assert!(sheet.stop_events.windows(2).all(|w| w[0].fire_time <= w[1].fire_time));
        assert!(sheet.stop_events.iter().all(|e| e.duration.is_some()));
    }

    #[tokio::test]
    async fn test_parent_node_logs_listening_and_quits() {
        let metrics = Arc::new(RwLock::new(Metrics::new("Stage")));
        let options = NodeOptions {
            name: "Stage".into(),
            role: Role::Parent,
            port: 0,
            target: None,
            demo_sheet: true,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let node_metrics = Arc::clone(&metrics);
        let task = tokio::spawn(async move { run_with_dashboard(options, node_metrics, rx).await.is_ok() });

        tokio::time::timeout(Duration::from_secs(5), async {
            while metrics.read().address.is_none() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        tx.send(NodeCommand::StartOrPause).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while metrics.read().timer.phase != TimerPhase::Running {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        tx.send(NodeCommand::Quit).unwrap();
        assert!(task.await.unwrap());
        assert_eq!(metrics.read().role, "parent");
    }

    #[tokio::test]
    async fn test_child_without_target_is_rejected() {
        let metrics = Arc::new(RwLock::new(Metrics::new("Booth")));
        let options = NodeOptions {
            name: "Booth".into(),
            role: Role::Child,
            port: 0,
            target: None,
            demo_sheet: false,
        };
        let (_tx, rx) = mpsc::unbounded_channel();
        assert!(run_with_dashboard(options, metrics, rx).await.is_err());
    }
}
