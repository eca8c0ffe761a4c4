//! Device-side forwarder.
//!
//! Runs next to the forwarded services. It listens on one command port plus
//! N forwarded ports; the host dials the command port (through whatever
//! transport links the two machines) and the device announces every
//! connection accepted on a forwarded port with `OPEN_CHANNEL`, then splices
//! it to the matching ack that arrives as a *later* connection on the
//! command port.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::reactor::{TunnelEntry, TunnelRegistry};
use crate::wire::{self, Frame};
use crate::{ForwardError, Result, TunnelId};

/// How long to wait for the host to dial the command port before giving up.
/// This is the only timeout in the subsystem.
pub const COMMAND_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct DeviceForwarderConfig {
    /// Address the command and forward listeners bind on.
    pub bind_addr: IpAddr,
    /// Port the host's command connection (and its tunnel acks) arrive on.
    pub command_port: u16,
    /// Device-local ports to forward. Port 0 binds an ephemeral port.
    pub forward_ports: Vec<u16>,
    /// See [`COMMAND_CONNECTION_TIMEOUT`].
    pub command_timeout: Duration,
}

impl DeviceForwarderConfig {
    pub fn new(command_port: u16, forward_ports: Vec<u16>) -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            command_port,
            forward_ports,
            command_timeout: COMMAND_CONNECTION_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub struct DeviceForwarder {
    command_listener: TcpListener,
    command_addr: SocketAddr,
    forward_listeners: Vec<TcpListener>,
    forward_addrs: Vec<SocketAddr>,
    command_timeout: Duration,
}

enum DeviceEvent {
    Command(Frame),
    CommandLost(ForwardError),
    ForwardConn { port: u16, stream: TcpStream },
    PendingConn { stream: TcpStream },
    PendingAck { stream: TcpStream, preamble: [u8; wire::ACK_LEN] },
}

#[derive(Clone, Copy)]
enum AcceptKind {
    /// Later connections on the command port: tunnel acks from the host.
    Pending,
    /// Connections on a forwarded port: new tunnels to announce.
    Forward { port: u16 },
}

impl DeviceForwarder {
    /// Bind the command listener and every forward listener.
    ///
    /// Nothing is accepted yet; bind failures surface before any handshake.
    pub async fn bind(config: DeviceForwarderConfig) -> Result<Self> {
        let command_listener = TcpListener::bind((config.bind_addr, config.command_port)).await?;
        let command_addr = command_listener.local_addr()?;

        let mut forward_listeners = Vec::with_capacity(config.forward_ports.len());
        let mut forward_addrs = Vec::with_capacity(config.forward_ports.len());
        for port in &config.forward_ports {
            let listener = TcpListener::bind((config.bind_addr, *port)).await?;
            forward_addrs.push(listener.local_addr()?);
            forward_listeners.push(listener);
        }

        info!(%command_addr, forwards = ?forward_addrs, "device forwarder bound");
        Ok(Self {
            command_listener,
            command_addr,
            forward_listeners,
            forward_addrs,
            command_timeout: config.command_timeout,
        })
    }

    /// Actual command listener address (relevant when binding port 0).
    pub fn command_addr(&self) -> SocketAddr {
        self.command_addr
    }

    /// Actual forward listener addresses, in `forward_ports` order.
    pub fn forward_addrs(&self) -> &[SocketAddr] {
        &self.forward_addrs
    }

    /// Serve until the command connection is lost (or never arrives).
    ///
    /// Individual tunnel failures are handled in place; only command-channel
    /// transport errors end the forwarder. All listeners, tunnels, and
    /// helper tasks are torn down before this returns.
    pub async fn run(self) -> Result<()> {
        let shutdown = CancellationToken::new();
        let (closed_tx, mut closed_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut registry = TunnelRegistry::new(closed_tx);

        let result = run_reactor(self, &shutdown, &mut registry, &mut closed_rx).await;

        // Teardown is best-effort: cancel acceptors, pending readers and the
        // command reader, then close every tunnel.
        shutdown.cancel();
        registry.done();
        result
    }
}

async fn run_reactor(
    forwarder: DeviceForwarder,
    shutdown: &CancellationToken,
    registry: &mut TunnelRegistry,
    closed_rx: &mut mpsc::Receiver<TunnelId>,
) -> Result<()> {
    let DeviceForwarder {
        command_listener,
        command_addr,
        forward_listeners,
        command_timeout,
        ..
    } = forwarder;

    info!(%command_addr, "waiting for command connection");
    let accepted = tokio::time::timeout(command_timeout, command_listener.accept()).await;
    let (command_stream, peer) = match accepted {
        Ok(Ok(conn)) => conn,
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => return Err(ForwardError::CommandConnectionTimeout),
    };
    info!(%peer, "command connection established");
    let _ = command_stream.set_nodelay(true);

    let (command_rx, mut command_tx) = command_stream.into_split();
    command_tx.write_all(&Frame::Hello.encode()).await?;

    let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    tokio::spawn(command_read_loop(
        command_rx,
        events_tx.clone(),
        shutdown.clone(),
    ));

    // Later connections on the command port carry tunnel acks.
    tokio::spawn(accept_loop(
        command_listener,
        AcceptKind::Pending,
        events_tx.clone(),
        shutdown.clone(),
    ));

    // Only now do the forwarded ports start accepting: a connection taken
    // before the command connection exists could never be forwarded.
    for listener in forward_listeners {
        let port = listener.local_addr()?.port();
        tokio::spawn(accept_loop(
            listener,
            AcceptKind::Forward { port },
            events_tx.clone(),
            shutdown.clone(),
        ));
    }

    loop {
        tokio::select! {
            Some(id) = closed_rx.recv() => registry.remove_closed(id),
            event = events_rx.recv() => {
                // `events_tx` is still held here, so the channel cannot close.
                let Some(event) = event else { return Ok(()) };
                match event {
                    DeviceEvent::CommandLost(err) => return Err(err),
                    DeviceEvent::Command(frame) => {
                        handle_command(frame, registry, &mut command_tx).await?;
                    }
                    DeviceEvent::ForwardConn { port, stream } => {
                        let _ = stream.set_nodelay(true);
                        let id = registry.insert(None, TunnelEntry::AwaitingPeer { right: stream })?;
                        info!(tunnel = id, port, "opening tunnel");
                        let frame = Frame::OpenChannel { source_port: port, tunnel_id: id };
                        command_tx.write_all(&frame.encode()).await?;
                    }
                    DeviceEvent::PendingConn { stream } => {
                        debug!("pending channel accepted");
                        tokio::spawn(pending_read(stream, events_tx.clone(), shutdown.clone()));
                    }
                    DeviceEvent::PendingAck { stream, preamble } => {
                        promote_pending(registry, stream, &preamble);
                    }
                }
            }
        }
    }
}

/// Command-channel opcodes the device acts on. Everything else gets the
/// shared fallback: echo the opcode back in an `UNKNOWN` reply.
async fn handle_command(
    frame: Frame,
    registry: &mut TunnelRegistry,
    command_tx: &mut OwnedWriteHalf,
) -> Result<()> {
    match frame {
        Frame::OpenChannelFail { tunnel_id } => {
            warn!(tunnel = tunnel_id, "opening tunnel {tunnel_id} failed");
            registry.close_tunnel(tunnel_id);
        }
        Frame::Unknown { opcode } => {
            warn!(opcode, "peer did not recognize our command");
        }
        Frame::Hello => reply_unknown(command_tx, wire::CMD_HELLO).await?,
        Frame::OpenChannel { .. } | Frame::OpenChannelInvalid { .. } => {
            reply_unknown(command_tx, wire::CMD_OPEN_CHANNEL).await?
        }
        Frame::Unrecognized { opcode } => reply_unknown(command_tx, opcode).await?,
    }
    Ok(())
}

async fn reply_unknown(command_tx: &mut OwnedWriteHalf, opcode: u8) -> Result<()> {
    warn!(opcode, "unsupported command");
    command_tx
        .write_all(&Frame::Unknown { opcode }.encode())
        .await?;
    Ok(())
}

/// Attach an acked pending channel as its tunnel's left leg.
///
/// A malformed preamble, an unknown tunnel, or a tunnel that already has
/// both legs is a protocol error local to this channel: the socket (and the
/// tunnel, if any) is dropped and the forwarder keeps running.
fn promote_pending(registry: &mut TunnelRegistry, stream: TcpStream, preamble: &[u8; wire::ACK_LEN]) {
    let tunnel_id = match wire::parse_ack(preamble) {
        Ok(id) => id,
        Err(err) => {
            warn!("dropping pending channel: {err}");
            return;
        }
    };
    match registry.claim_awaiting(tunnel_id) {
        Ok(right) => {
            debug!(tunnel = tunnel_id, "tunnel active");
            registry.activate(tunnel_id, stream, right);
        }
        Err(err) => {
            warn!(tunnel = tunnel_id, "dropping pending channel: {err}");
            registry.close_tunnel(tunnel_id);
        }
    }
}

async fn command_read_loop(
    mut reader: OwnedReadHalf,
    events_tx: mpsc::Sender<DeviceEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return,
            frame = wire::read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(frame) => {
                if events_tx.send(DeviceEvent::Command(frame)).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = events_tx.send(DeviceEvent::CommandLost(err)).await;
                return;
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    kind: AcceptKind,
    events_tx: mpsc::Sender<DeviceEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            res = listener.accept() => res,
        };
        match accepted {
            Ok((stream, _peer)) => {
                let event = match kind {
                    AcceptKind::Pending => DeviceEvent::PendingConn { stream },
                    AcceptKind::Forward { port } => DeviceEvent::ForwardConn { port, stream },
                };
                if events_tx.send(event).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                // Transient accept failures (e.g. fd exhaustion) must not
                // kill the listener.
                warn!("accept failed: {err}");
            }
        }
    }
}

/// Read the 5-byte ack preamble off a pending channel, then hand the socket
/// back to the reactor for promotion.
async fn pending_read(
    mut stream: TcpStream,
    events_tx: mpsc::Sender<DeviceEvent>,
    shutdown: CancellationToken,
) {
    let mut preamble = [0u8; wire::ACK_LEN];
    let read = tokio::select! {
        _ = shutdown.cancelled() => return,
        res = stream.read_exact(&mut preamble) => res,
    };
    match read {
        Ok(_) => {
            let _ = events_tx
                .send(DeviceEvent::PendingAck { stream, preamble })
                .await;
        }
        Err(err) => debug!("pending channel closed before ack: {err}"),
    }
}
