//! Link Manager
//!
//! Owns the one logical parent<->child link over a framed byte stream.
//! The parent listens and tracks every accepted child connection; the child
//! dials one target, retries with backoff, and runs a keep-alive ticker
//! that re-triggers a dial while the link is enabled but not established.
//!
//! Everything runs as one actor. Listener, dial, retry and keep-alive tasks
//! report back through an internal channel tagged with the generation they
//! were started in; enabling or disabling bumps the generation so late
//! reports from cancelled work are ignored.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use crate::clock::now_ns;
use crate::clock::Nanos;
use crate::config::LinkConfig;
use crate::frame::{decode_message, FrameCodec, FrameError};
use crate::sync::{Role, WireMessage};

pub type ConnectionId = u64;

/// Link-related errors
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Link task closed")]
    ChannelClosed,

    #[error("Notification transport failed: {0}")]
    Notification(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Which physical channel a frame came over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Ordered, framed byte stream
    Stream,
    /// Unordered, possibly duplicated notifications
    Notification,
}

/// Named reasons a link is down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCause {
    NoLocalNetwork,
    RadioOff,
    Timeout,
    Refused,
    InvalidAddress,
}

impl FailureCause {
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrNotAvailable => FailureCause::NoLocalNetwork,
            io::ErrorKind::InvalidInput => FailureCause::InvalidAddress,
            io::ErrorKind::TimedOut => FailureCause::Timeout,
            _ => FailureCause::Refused,
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::NoLocalNetwork => write!(f, "no local network"),
            FailureCause::RadioOff => write!(f, "radio off"),
            FailureCause::Timeout => write!(f, "timed out"),
            FailureCause::Refused => write!(f, "connection refused"),
            FailureCause::InvalidAddress => write!(f, "invalid address"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    NotConnected,
    Connecting,
    Connected,
    Failed(FailureCause),
}

impl LinkStatus {
    pub fn is_established(&self) -> bool {
        matches!(self, LinkStatus::Connected)
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::NotConnected => write!(f, "not connected"),
            LinkStatus::Connecting => write!(f, "connecting"),
            LinkStatus::Connected => write!(f, "connected"),
            LinkStatus::Failed(cause) => write!(f, "failed: {}", cause),
        }
    }
}

/// Where a child dials: `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialTarget {
    pub host: String,
    pub port: u16,
}

impl FromStr for DialTarget {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, LinkError> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| LinkError::InvalidAddress(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(LinkError::InvalidAddress(s.to_string()));
        }
        let port = parse_port(port).map_err(|_| LinkError::InvalidAddress(s.to_string()))?;
        if port == 0 {
            return Err(LinkError::InvalidAddress(s.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for DialTarget {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

/// Parse a listen port (0 = any free port)
pub fn parse_port(s: &str) -> Result<u16, LinkError> {
    s.trim()
        .parse::<u16>()
        .map_err(|_| LinkError::InvalidPort(s.to_string()))
}

/// Events emitted by the link manager
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Parent endpoint bound; the address can be shared out of band
    Listening { addr: SocketAddr },
    StatusChanged(LinkStatus),
    PeerConnected { conn: ConnectionId, addr: SocketAddr },
    PeerDisconnected { conn: ConnectionId },
    /// A decoded frame, stamped with local uptime on arrival
    Frame {
        conn: ConnectionId,
        via: TransportKind,
        message: WireMessage,
        received_at: Nanos,
    },
    /// A frame that is not any known message; the connection stays up
    MalformedFrame { conn: ConnectionId, error: String },
}

/// Commands sent to the link manager
#[derive(Debug)]
pub enum LinkCommand {
    EnableParent { port: u16 },
    EnableChild { target: DialTarget },
    Disable,
    /// Stop, flip role, and restart in the new role if the link was enabled
    SwitchRole { target: Option<DialTarget> },
    Send { conn: ConnectionId, message: WireMessage },
    Broadcast { message: WireMessage },
    Shutdown,
}

/// Handle to communicate with the running link manager
#[derive(Clone)]
pub struct LinkHandle {
    command_tx: mpsc::UnboundedSender<LinkCommand>,
}

impl LinkHandle {
    fn send_command(&self, cmd: LinkCommand) -> Result<(), LinkError> {
        self.command_tx.send(cmd).map_err(|_| LinkError::ChannelClosed)
    }

    /// Listen on `port`. Rejects an unparseable port without touching the link.
    pub fn enable_parent(&self, port: &str) -> Result<(), LinkError> {
        self.listen(parse_port(port)?)
    }

    /// Dial `host:port`. Rejects a malformed target without touching the link.
    pub fn enable_child(&self, target: &str) -> Result<(), LinkError> {
        self.dial(target.parse()?)
    }

    pub fn listen(&self, port: u16) -> Result<(), LinkError> {
        self.send_command(LinkCommand::EnableParent { port })
    }

    pub fn dial(&self, target: DialTarget) -> Result<(), LinkError> {
        self.send_command(LinkCommand::EnableChild { target })
    }

    pub fn disable(&self) -> Result<(), LinkError> {
        self.send_command(LinkCommand::Disable)
    }

    pub fn switch_role(&self, target: Option<&str>) -> Result<(), LinkError> {
        let target = target.map(str::parse::<DialTarget>).transpose()?;
        self.flip_role(target)
    }

    pub fn flip_role(&self, target: Option<DialTarget>) -> Result<(), LinkError> {
        self.send_command(LinkCommand::SwitchRole { target })
    }

    pub fn send(&self, conn: ConnectionId, message: WireMessage) -> Result<(), LinkError> {
        self.send_command(LinkCommand::Send { conn, message })
    }

    pub fn broadcast(&self, message: WireMessage) -> Result<(), LinkError> {
        self.send_command(LinkCommand::Broadcast { message })
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(LinkCommand::Shutdown);
    }
}

/// Reports from tasks spawned by the manager
#[derive(Debug)]
enum Internal {
    Accepted {
        generation: u64,
        stream: TcpStream,
        addr: SocketAddr,
    },
    DialFinished {
        generation: u64,
        result: Result<(TcpStream, SocketAddr), FailureCause>,
    },
    RetryFire { generation: u64 },
    KeepAlive { generation: u64 },
    ConnectionClosed { conn: ConnectionId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkMode {
    Disabled,
    Parent { port: u16 },
    Child { target: DialTarget },
}

struct Connection {
    addr: SocketAddr,
    writer: mpsc::UnboundedSender<WireMessage>,
    tasks: [JoinHandle<()>; 2],
}

impl Connection {
    fn close(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct Outbox {
    events: mpsc::UnboundedSender<LinkEvent>,
    internal: mpsc::UnboundedSender<Internal>,
}

impl Outbox {
    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }
}

/// Manages the link - runs in a background task
pub struct LinkManager {
    config: LinkConfig,
    mode: LinkMode,
    /// Role of the most recent enable; flipped by a role switch
    role: Role,
    generation: u64,
    next_conn: ConnectionId,
    connections: HashMap<ConnectionId, Connection>,
    listener_task: Option<JoinHandle<()>>,
    dial_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
    keepalive_task: Option<JoinHandle<()>>,
    backoff: Backoff,
    status: LinkStatus,
    last_target: Option<DialTarget>,
    last_port: u16,
}

impl LinkManager {
    pub fn new(config: LinkConfig) -> Self {
        let backoff = Backoff::from_config(&config);
        let last_port = config.listen_port;
        Self {
            config,
            mode: LinkMode::Disabled,
            role: Role::Child,
            generation: 0,
            next_conn: 1,
            connections: HashMap::new(),
            listener_task: None,
            dial_task: None,
            retry_task: None,
            keepalive_task: None,
            backoff,
            status: LinkStatus::NotConnected,
            last_target: None,
            last_port,
        }
    }

    /// Start the manager and return a handle for communication
    pub fn start(self) -> (LinkHandle, mpsc::UnboundedReceiver<LinkEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            self.run(event_tx, command_rx).await;
        });

        (LinkHandle { command_tx }, event_rx)
    }

    async fn run(
        mut self,
        event_tx: mpsc::UnboundedSender<LinkEvent>,
        mut command_rx: mpsc::UnboundedReceiver<LinkCommand>,
    ) {
        let (internal_tx, mut internal_rx) = mpsc::unbounded_channel();
        let out = Outbox {
            events: event_tx,
            internal: internal_tx,
        };

        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    let Some(cmd) = cmd else {
                        debug!("Link: all handles dropped");
                        break;
                    };
                    if !self.handle_command(cmd, &out).await {
                        break;
                    }
                }
                Some(event) = internal_rx.recv() => {
                    self.handle_internal(event, &out).await;
                }
            }
        }

        self.disable(&out);
        info!("Link manager stopped");
    }

    /// Returns false on shutdown
    async fn handle_command(&mut self, cmd: LinkCommand, out: &Outbox) -> bool {
        match cmd {
            LinkCommand::EnableParent { port } => {
                self.disable(out);
                self.enable_parent(port, out).await;
            }
            LinkCommand::EnableChild { target } => {
                self.disable(out);
                self.enable_child(target, out);
            }
            LinkCommand::Disable => {
                info!("Link: disabling");
                self.disable(out);
            }
            LinkCommand::SwitchRole { target } => {
                self.switch_role(target, out).await;
            }
            LinkCommand::Send { conn, message } => match self.connections.get(&conn) {
                Some(connection) => {
                    let _ = connection.writer.send(message);
                }
                None => debug!("Link: send to unknown connection {}", conn),
            },
            LinkCommand::Broadcast { message } => {
                for connection in self.connections.values() {
                    let _ = connection.writer.send(message.clone());
                }
            }
            LinkCommand::Shutdown => {
                info!("Link shutting down");
                return false;
            }
        }
        true
    }

    async fn handle_internal(&mut self, event: Internal, out: &Outbox) {
        match event {
            Internal::Accepted {
                generation,
                stream,
                addr,
            } => {
                if generation != self.generation || !matches!(self.mode, LinkMode::Parent { .. }) {
                    return;
                }
                info!("Child connected: {}", addr);
                self.add_connection(stream, addr, out);
            }
            Internal::DialFinished { generation, result } => {
                if generation != self.generation {
                    return;
                }
                self.dial_task = None;
                match result {
                    Ok((stream, addr)) => {
                        info!("Connected to parent at {}", addr);
                        self.backoff.reset();
                        self.cancel(TaskSlot::Retry);
                        self.add_connection(stream, addr, out);
                    }
                    Err(cause) => {
                        debug!("Link: dial failed ({})", cause);
                        self.set_status(LinkStatus::Failed(cause), out);
                        self.schedule_retry(out);
                    }
                }
            }
            Internal::RetryFire { generation } => {
                if generation != self.generation || self.is_established() {
                    return;
                }
                self.retry_task = None;
                match self.mode.clone() {
                    LinkMode::Child { .. } if !self.dial_in_flight() => self.start_dial(out),
                    LinkMode::Parent { port } if self.listener_task.is_none() => {
                        self.bind_listener(port, out).await;
                    }
                    _ => {}
                }
            }
            Internal::KeepAlive { generation } => {
                if generation != self.generation {
                    return;
                }
                if self.is_established() || !matches!(self.mode, LinkMode::Child { .. }) {
                    self.cancel(TaskSlot::KeepAlive);
                    return;
                }
                if !self.dial_in_flight() {
                    debug!("Link: keep-alive re-dial");
                    self.start_dial(out);
                }
            }
            Internal::ConnectionClosed { conn } => {
                let Some(connection) = self.connections.remove(&conn) else {
                    return;
                };
                info!("Peer disconnected: {}", connection.addr);
                connection.close();
                out.emit(LinkEvent::PeerDisconnected { conn });

                if self.connections.is_empty() {
                    match self.mode {
                        LinkMode::Parent { .. } => self.set_status(LinkStatus::Connecting, out),
                        LinkMode::Child { .. } => {
                            self.set_status(LinkStatus::NotConnected, out);
                            self.schedule_retry(out);
                            self.start_keepalive(out);
                        }
                        LinkMode::Disabled => {}
                    }
                }
            }
        }
    }

    async fn enable_parent(&mut self, port: u16, out: &Outbox) {
        self.mode = LinkMode::Parent { port };
        self.role = Role::Parent;
        self.last_port = port;
        self.set_status(LinkStatus::Connecting, out);
        self.bind_listener(port, out).await;
    }

    async fn bind_listener(&mut self, port: u16, out: &Outbox) {
        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Failed to listen on port {}: {}", port, e);
                self.set_status(LinkStatus::Failed(FailureCause::from_io(&e)), out);
                self.schedule_retry(out);
                return;
            }
        };

        match listener.local_addr() {
            Ok(addr) => {
                info!("Listening on {}", addr);
                out.emit(LinkEvent::Listening { addr });
            }
            Err(e) => warn!("Listener has no local address: {}", e),
        }
        self.set_status(LinkStatus::Connecting, out);

        let generation = self.generation;
        let internal = out.internal.clone();
        self.listener_task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let accepted = Internal::Accepted {
                            generation,
                            stream,
                            addr,
                        };
                        if internal.send(accepted).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Accept error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }));
    }

    fn enable_child(&mut self, target: DialTarget, out: &Outbox) {
        info!("Link: dialing parent at {}", target);
        self.mode = LinkMode::Child {
            target: target.clone(),
        };
        self.role = Role::Child;
        self.last_target = Some(target);
        self.start_dial(out);
        self.start_keepalive(out);
    }

    /// Cancel any pending retry or stale dial, then dial now
    fn start_dial(&mut self, out: &Outbox) {
        let LinkMode::Child { target } = &self.mode else {
            return;
        };
        let target = target.clone();
        self.cancel(TaskSlot::Retry);
        self.cancel(TaskSlot::Dial);
        self.set_status(LinkStatus::Connecting, out);

        let timeout = self.config.dial_timeout;
        let generation = self.generation;
        let internal = out.internal.clone();
        self.dial_task = Some(tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, dial(&target)).await {
                Ok(result) => result,
                Err(_) => Err(FailureCause::Timeout),
            };
            let _ = internal.send(Internal::DialFinished { generation, result });
        }));
    }

    fn schedule_retry(&mut self, out: &Outbox) {
        if matches!(self.mode, LinkMode::Disabled) {
            return;
        }
        self.cancel(TaskSlot::Retry);
        let delay = self.backoff.next_delay();
        debug!("Link: retry #{} in {:?}", self.backoff.attempt(), delay);

        let generation = self.generation;
        let internal = out.internal.clone();
        self.retry_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(Internal::RetryFire { generation });
        }));
    }

    fn start_keepalive(&mut self, out: &Outbox) {
        if self.keepalive_task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let period = self.config.keep_alive_interval;
        let generation = self.generation;
        let internal = out.internal.clone();
        self.keepalive_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if internal.send(Internal::KeepAlive { generation }).is_err() {
                    break;
                }
            }
        }));
    }

    fn add_connection(&mut self, stream: TcpStream, addr: SocketAddr, out: &Outbox) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        let conn = self.next_conn;
        self.next_conn += 1;

        let (read_half, write_half) = stream.into_split();
        let max_frame_len = self.config.max_frame_len;

        let events = out.events.clone();
        let internal = out.internal.clone();
        let reader = tokio::spawn(async move {
            let mut frames = FramedRead::new(read_half, FrameCodec::with_max_frame_len(max_frame_len));
            while let Some(frame) = frames.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("Read error on connection {}: {}", conn, e);
                        break;
                    }
                };
                let received_at = now_ns();
                let event = match decode_message(&frame) {
                    Ok(message) => LinkEvent::Frame {
                        conn,
                        via: TransportKind::Stream,
                        message,
                        received_at,
                    },
                    Err(e) => LinkEvent::MalformedFrame {
                        conn,
                        error: e.to_string(),
                    },
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            let _ = internal.send(Internal::ConnectionClosed { conn });
        });

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<WireMessage>();
        let internal = out.internal.clone();
        let writer = tokio::spawn(async move {
            let mut sink = FramedWrite::new(write_half, FrameCodec::with_max_frame_len(max_frame_len));
            while let Some(message) = writer_rx.recv().await {
                match sink.send(message).await {
                    Ok(()) => {}
                    Err(FrameError::Io(e)) => {
                        debug!("Write error on connection {}: {}", conn, e);
                        let _ = internal.send(Internal::ConnectionClosed { conn });
                        break;
                    }
                    Err(e) => warn!("Dropping outbound frame: {}", e),
                }
            }
        });

        self.connections.insert(
            conn,
            Connection {
                addr,
                writer: writer_tx,
                tasks: [reader, writer],
            },
        );
        out.emit(LinkEvent::PeerConnected { conn, addr });
        self.set_status(LinkStatus::Connected, out);
        self.cancel(TaskSlot::KeepAlive);
    }

    async fn switch_role(&mut self, target: Option<DialTarget>, out: &Outbox) {
        let was_enabled = self.mode != LinkMode::Disabled;
        self.disable(out);
        self.role = self.role.flipped();
        info!("Link: role switched to {}", self.role);

        if let Some(target) = &target {
            self.last_target = Some(target.clone());
        }
        if !was_enabled {
            return;
        }
        match self.role {
            Role::Parent => self.enable_parent(self.last_port, out).await,
            Role::Child => match self.last_target.clone() {
                Some(target) => self.enable_child(target, out),
                None => warn!("Link: no parent address known; staying disabled"),
            },
        }
    }

    /// Stop everything, in order: retry, keep-alive, dial, listener, connections
    fn disable(&mut self, out: &Outbox) {
        self.generation += 1;
        self.cancel(TaskSlot::Retry);
        self.cancel(TaskSlot::KeepAlive);
        self.cancel(TaskSlot::Dial);
        self.cancel(TaskSlot::Listener);

        for (conn, connection) in self.connections.drain() {
            connection.close();
            out.emit(LinkEvent::PeerDisconnected { conn });
        }
        self.backoff.reset();
        self.mode = LinkMode::Disabled;
        self.set_status(LinkStatus::NotConnected, out);
    }

    fn cancel(&mut self, slot: TaskSlot) {
        let task = match slot {
            TaskSlot::Listener => self.listener_task.take(),
            TaskSlot::Dial => self.dial_task.take(),
            TaskSlot::Retry => self.retry_task.take(),
            TaskSlot::KeepAlive => self.keepalive_task.take(),
        };
        if let Some(task) = task {
            task.abort();
        }
    }

    fn dial_in_flight(&self) -> bool {
        self.dial_task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn is_established(&self) -> bool {
        !self.connections.is_empty()
    }

    fn set_status(&mut self, status: LinkStatus, out: &Outbox) {
        if self.status != status {
            self.status = status;
            out.emit(LinkEvent::StatusChanged(status));
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum TaskSlot {
    Listener,
    Dial,
    Retry,
    KeepAlive,
}

async fn dial(target: &DialTarget) -> Result<(TcpStream, SocketAddr), FailureCause> {
    let mut addrs = tokio::net::lookup_host((target.host.as_str(), target.port))
        .await
        .map_err(|e| {
            debug!("Failed to resolve {}: {}", target, e);
            FailureCause::InvalidAddress
        })?;
    let addr = addrs.next().ok_or(FailureCause::InvalidAddress)?;
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| FailureCause::from_io(&e))?;
    Ok((stream, addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{Hello, Role};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use uuid::Uuid;

    fn fast_config() -> LinkConfig {
        LinkConfig {
            listen_port: 0,
            backoff_base: Duration::from_millis(20),
            backoff_cap: Duration::from_millis(60),
            keep_alive_interval: Duration::from_millis(100),
            dial_timeout: Duration::from_secs(2),
            ..LinkConfig::default()
        }
    }

    async fn next_matching<F>(rx: &mut mpsc::UnboundedReceiver<LinkEvent>, mut pred: F) -> LinkEvent
    where
        F: FnMut(&LinkEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("link events closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for link event")
    }

    async fn listening_port(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> u16 {
        match next_matching(rx, |e| matches!(e, LinkEvent::Listening { .. })).await {
            LinkEvent::Listening { addr } => addr.port(),
            _ => unreachable!(),
        }
    }

    fn hello() -> WireMessage {
        WireMessage::Hello(Hello {
            peer_id: Uuid::new_v4(),
            role: Role::Child,
            display_name: "Booth".to_string(),
            epoch: Uuid::new_v4(),
        })
    }

    #[test]
    fn test_dial_target_parsing() {
        let target: DialTarget = "192.168.1.20:47820".parse().unwrap();
        assert_eq!(target.port, 47820);
        assert_eq!(target.to_string(), "192.168.1.20:47820");

        let v6: DialTarget = "[::1]:9000".parse().unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "[::1]:9000");

        assert!("no-port".parse::<DialTarget>().is_err());
        assert!("host:99999".parse::<DialTarget>().is_err());
        assert!(":4000".parse::<DialTarget>().is_err());
        assert!(matches!(parse_port("abc"), Err(LinkError::InvalidPort(_))));
        assert_eq!(parse_port(" 0 ").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_configuration_rejected_immediately() {
        let (handle, mut events) = LinkManager::new(fast_config()).start();
        assert!(matches!(handle.enable_parent("port"), Err(LinkError::InvalidPort(_))));
        assert!(matches!(handle.enable_child("nowhere"), Err(LinkError::InvalidAddress(_))));

        // Nothing reached the actor
        handle.shutdown();
        while let Some(event) = events.recv().await {
            assert!(!matches!(event, LinkEvent::StatusChanged(LinkStatus::Connecting)));
        }
    }

    #[tokio::test]
    async fn test_parent_and_child_exchange_frames() {
        let (parent, mut parent_events) = LinkManager::new(fast_config()).start();
        parent.enable_parent("0").unwrap();
        let port = listening_port(&mut parent_events).await;

        let (child, mut child_events) = LinkManager::new(fast_config()).start();
        child.enable_child(&format!("127.0.0.1:{}", port)).unwrap();

        let child_conn = match next_matching(&mut child_events, |e| matches!(e, LinkEvent::PeerConnected { .. })).await {
            LinkEvent::PeerConnected { conn, .. } => conn,
            _ => unreachable!(),
        };
        next_matching(&mut child_events, |e| {
            matches!(e, LinkEvent::StatusChanged(LinkStatus::Connected))
        })
        .await;
        next_matching(&mut parent_events, |e| matches!(e, LinkEvent::PeerConnected { .. })).await;

        let greeting = hello();
        child.send(child_conn, greeting.clone()).unwrap();
        match next_matching(&mut parent_events, |e| matches!(e, LinkEvent::Frame { .. })).await {
            LinkEvent::Frame { message, via, .. } => {
                assert_eq!(message, greeting);
                assert_eq!(via, TransportKind::Stream);
            }
            _ => unreachable!(),
        }

        parent.broadcast(greeting.clone()).unwrap();
        next_matching(&mut child_events, |e| matches!(e, LinkEvent::Frame { .. })).await;

        parent.shutdown();
        child.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection() {
        let (parent, mut events) = LinkManager::new(fast_config()).start();
        parent.enable_parent("0").unwrap();
        let port = listening_port(&mut events).await;

        let mut raw = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        raw.write_all(b"{\"type\":\"nonsense\"}\n").await.unwrap();
        raw.write_all(&crate::frame::encode_message(&hello()).unwrap()).await.unwrap();

        next_matching(&mut events, |e| matches!(e, LinkEvent::MalformedFrame { .. })).await;
        next_matching(&mut events, |e| matches!(e, LinkEvent::Frame { .. })).await;
        parent.shutdown();
    }

    #[tokio::test]
    async fn test_child_retries_until_parent_appears() {
        // Reserve a port, then free it so the first dials are refused
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let (child, mut child_events) = LinkManager::new(fast_config()).start();
        child.enable_child(&format!("127.0.0.1:{}", port)).unwrap();
        next_matching(&mut child_events, |e| {
            matches!(e, LinkEvent::StatusChanged(LinkStatus::Failed(_)))
        })
        .await;

        let config = LinkConfig {
            listen_port: port,
            ..fast_config()
        };
        let (parent, mut parent_events) = LinkManager::new(config).start();
        parent.enable_parent(&port.to_string()).unwrap();
        listening_port(&mut parent_events).await;

        next_matching(&mut child_events, |e| {
            matches!(e, LinkEvent::StatusChanged(LinkStatus::Connected))
        })
        .await;

        parent.shutdown();
        child.shutdown();
    }

    #[tokio::test]
    async fn test_disable_silences_retry_and_keepalive() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let (child, mut events) = LinkManager::new(fast_config()).start();
        child.enable_child(&format!("127.0.0.1:{}", port)).unwrap();
        next_matching(&mut events, |e| matches!(e, LinkEvent::StatusChanged(LinkStatus::Failed(_)))).await;

        child.disable().unwrap();
        next_matching(&mut events, |e| {
            matches!(e, LinkEvent::StatusChanged(LinkStatus::NotConnected))
        })
        .await;

        // Well past the backoff cap and several keep-alive periods
        let quiet = tokio::time::timeout(Duration::from_millis(400), async {
            loop {
                match events.recv().await {
                    Some(LinkEvent::StatusChanged(status)) => return Some(status),
                    Some(_) => continue,
                    None => return None,
                }
            }
        })
        .await;
        assert!(quiet.is_err(), "link woke up after disable: {:?}", quiet);

        child.shutdown();
    }

    #[tokio::test]
    async fn test_parent_disable_drops_children() {
        let (parent, mut parent_events) = LinkManager::new(fast_config()).start();
        parent.enable_parent("0").unwrap();
        let port = listening_port(&mut parent_events).await;

        let (child, mut child_events) = LinkManager::new(fast_config()).start();
        child.enable_child(&format!("127.0.0.1:{}", port)).unwrap();
        next_matching(&mut child_events, |e| {
            matches!(e, LinkEvent::StatusChanged(LinkStatus::Connected))
        })
        .await;

        parent.disable().unwrap();
        next_matching(&mut parent_events, |e| {
            matches!(e, LinkEvent::StatusChanged(LinkStatus::NotConnected))
        })
        .await;
        next_matching(&mut child_events, |e| matches!(e, LinkEvent::PeerDisconnected { .. })).await;
        // The child keeps trying on its own
        next_matching(&mut child_events, |e| {
            matches!(e, LinkEvent::StatusChanged(LinkStatus::Connecting))
        })
        .await;

        parent.shutdown();
        child.shutdown();
    }

    #[tokio::test]
    async fn test_switch_role_restarts_in_new_role() {
        let (node, mut events) = LinkManager::new(fast_config()).start();
        node.enable_parent("0").unwrap();
        let port = listening_port(&mut events).await;

        // Parent -> child with a target dials it
        let (other, mut other_events) = LinkManager::new(fast_config()).start();
        other.enable_parent("0").unwrap();
        let other_port = listening_port(&mut other_events).await;
        assert_ne!(port, other_port);

        node.switch_role(Some(&format!("127.0.0.1:{}", other_port))).unwrap();
        next_matching(&mut other_events, |e| matches!(e, LinkEvent::PeerConnected { .. })).await;

        // Child -> parent listens again
        node.switch_role(None).unwrap();
        listening_port(&mut events).await;

        node.shutdown();
        other.shutdown();
    }
}
