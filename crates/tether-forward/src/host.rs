//! Host-side forwarder.
//!
//! Dials the device's command port as published on the host by the
//! underlying transport, then completes every tunnel the device announces:
//! one connection to the real target, one rendezvous connection back through
//! the transport, an ack preamble written into the rendezvous leg, and the
//! two sockets spliced together.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::reactor::{TunnelEntry, TunnelRegistry};
use crate::wire::{self, Frame};
use crate::{ForwardError, Result, TunnelId};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A static mapping from a device-known port to the real target the host
/// should splice it to. Immutable once the forwarder is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub remote_host: String,
    pub remote_port: u16,
    /// Key: the device-side listener port announced in `OPEN_CHANNEL`, and
    /// the port the rendezvous leg dials back through the transport.
    pub device_port: u16,
}

impl Forward {
    pub fn new(remote_host: impl Into<String>, remote_port: u16, device_port: u16) -> Self {
        Self {
            remote_host: remote_host.into(),
            remote_port,
            device_port,
        }
    }
}

/// Handle to a running host forwarder reactor.
#[derive(Debug)]
pub struct HostForwarder {
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

enum HostEvent {
    Command(Frame),
    CommandLost(ForwardError),
    Connected {
        tunnel_id: TunnelId,
        result: io::Result<(TcpStream, TcpStream)>,
    },
}

impl HostForwarder {
    /// Dial the device command port on localhost and start the reactor.
    pub async fn start(command_port: u16, forwards: Vec<Forward>) -> Result<Self> {
        Self::start_at(
            SocketAddr::from((Ipv4Addr::LOCALHOST, command_port)),
            forwards,
        )
        .await
    }

    /// Like [`HostForwarder::start`] with an explicit command address.
    ///
    /// Rendezvous legs dial `command_addr`'s IP: whatever carried the
    /// command connection is assumed to carry the per-tunnel connections as
    /// well.
    pub async fn start_at(command_addr: SocketAddr, forwards: Vec<Forward>) -> Result<Self> {
        let mut by_device_port = HashMap::with_capacity(forwards.len());
        for forward in forwards {
            if let Some(previous) = by_device_port.insert(forward.device_port, forward) {
                return Err(ForwardError::Protocol(format!(
                    "two forwards registered for device port {}",
                    previous.device_port
                )));
            }
        }

        let stream = TcpStream::connect(command_addr).await?;
        let _ = stream.set_nodelay(true);
        info!(%command_addr, forwards = by_device_port.len(), "command connection established");

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_reactor(
            stream,
            command_addr.ip(),
            by_device_port,
            shutdown.clone(),
        ));
        Ok(Self { shutdown, task })
    }

    /// Stop the reactor and tear down every tunnel.
    ///
    /// Returns the reactor's exit status: `Ok` for a clean stop, or the
    /// transport error that already ended it.
    pub async fn dispose(self) -> Result<()> {
        self.shutdown.cancel();
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(io::Error::other(err).into()),
        }
    }
}

async fn run_reactor(
    command_stream: TcpStream,
    rendezvous_ip: IpAddr,
    forwards: HashMap<u16, Forward>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (command_rx, mut command_tx) = command_stream.into_split();
    let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (closed_tx, mut closed_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let mut registry = TunnelRegistry::new(closed_tx);

    tokio::spawn(command_read_loop(
        command_rx,
        events_tx.clone(),
        shutdown.clone(),
    ));

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            Some(id) = closed_rx.recv() => registry.remove_closed(id),
            event = events_rx.recv() => {
                // `events_tx` is still held here, so the channel cannot close.
                let Some(event) = event else { break Ok(()) };
                match event {
                    HostEvent::CommandLost(err) => break Err(err),
                    HostEvent::Command(frame) => {
                        if let Err(err) = handle_command(
                            frame,
                            &mut registry,
                            &forwards,
                            rendezvous_ip,
                            &events_tx,
                            &mut command_tx,
                        )
                        .await
                        {
                            break Err(err);
                        }
                    }
                    HostEvent::Connected { tunnel_id, result: legs } => {
                        if let Err(err) =
                            finish_open(tunnel_id, legs, &mut registry, &mut command_tx).await
                        {
                            break Err(err);
                        }
                    }
                }
            }
        }
    };

    // Stops the command reader (and any connect tasks' sends) even when the
    // loop ended on a transport error rather than through dispose().
    shutdown.cancel();
    registry.done();
    result
}

/// Command-channel opcodes the host acts on. Everything else gets the
/// shared fallback: echo the opcode back in an `UNKNOWN` reply.
async fn handle_command(
    frame: Frame,
    registry: &mut TunnelRegistry,
    forwards: &HashMap<u16, Forward>,
    rendezvous_ip: IpAddr,
    events_tx: &mpsc::Sender<HostEvent>,
    command_tx: &mut OwnedWriteHalf,
) -> Result<()> {
    match frame {
        Frame::OpenChannel {
            source_port: device_port,
            tunnel_id,
        } => {
            if let Err(err) = registry.insert(Some(tunnel_id), TunnelEntry::Connecting) {
                warn!(tunnel = tunnel_id, "rejecting open request: {err}");
                send_fail(command_tx, tunnel_id).await?;
                return Ok(());
            }
            let Some(forward) = forwards.get(&device_port) else {
                warn!(
                    tunnel = tunnel_id,
                    "{}",
                    ForwardError::UnknownForward(device_port)
                );
                registry.close_tunnel(tunnel_id);
                send_fail(command_tx, tunnel_id).await?;
                return Ok(());
            };
            info!(
                tunnel = tunnel_id,
                device_port,
                "opening tunnel to {}:{}",
                forward.remote_host,
                forward.remote_port
            );
            let target_host = forward.remote_host.clone();
            let target_port = forward.remote_port;
            let events_tx = events_tx.clone();
            tokio::spawn(async move {
                let result =
                    connect_legs(target_host, target_port, rendezvous_ip, device_port, tunnel_id)
                        .await;
                let _ = events_tx
                    .send(HostEvent::Connected { tunnel_id, result })
                    .await;
            });
        }
        Frame::OpenChannelInvalid {
            source_port,
            tunnel_id,
        } => {
            // Local to this request: the tunnel can never be completed,
            // but the command channel is fine.
            warn!(
                tunnel = tunnel_id,
                "rejecting open request for out-of-range port {source_port}"
            );
            send_fail(command_tx, tunnel_id).await?;
        }
        Frame::Hello => debug!("device handshake received"),
        Frame::Unknown { opcode } => warn!(opcode, "peer did not recognize our command"),
        Frame::OpenChannelFail { .. } => {
            reply_unknown(command_tx, wire::CMD_OPEN_CHANNEL_FAIL).await?;
        }
        Frame::Unrecognized { opcode } => reply_unknown(command_tx, opcode).await?,
    }
    Ok(())
}

/// Dial both tunnel legs: the real target first, then the rendezvous port
/// back through the transport. The ack preamble goes out on the rendezvous
/// leg before any spooled bytes so the device can attribute the connection.
async fn connect_legs(
    target_host: String,
    target_port: u16,
    rendezvous_ip: IpAddr,
    device_port: u16,
    tunnel_id: TunnelId,
) -> io::Result<(TcpStream, TcpStream)> {
    let target = TcpStream::connect((target_host.as_str(), target_port)).await?;
    let _ = target.set_nodelay(true);

    let mut rendezvous = TcpStream::connect((rendezvous_ip, device_port)).await?;
    let _ = rendezvous.set_nodelay(true);
    rendezvous.write_all(&wire::encode_ack(tunnel_id)).await?;

    Ok((target, rendezvous))
}

async fn finish_open(
    tunnel_id: TunnelId,
    legs: io::Result<(TcpStream, TcpStream)>,
    registry: &mut TunnelRegistry,
    command_tx: &mut OwnedWriteHalf,
) -> Result<()> {
    if !registry.contains(tunnel_id) {
        // Closed while the legs were being dialed; drop them here.
        debug!(tunnel = tunnel_id, "discarding legs of a closed tunnel");
        return Ok(());
    }
    match legs {
        Ok((target, rendezvous)) => {
            debug!(tunnel = tunnel_id, "tunnel active");
            registry.activate(tunnel_id, target, rendezvous);
        }
        Err(err) => {
            warn!(tunnel = tunnel_id, "opening tunnel {tunnel_id} failed: {err}");
            registry.close_tunnel(tunnel_id);
            send_fail(command_tx, tunnel_id).await?;
        }
    }
    Ok(())
}

async fn send_fail(command_tx: &mut OwnedWriteHalf, tunnel_id: TunnelId) -> Result<()> {
    command_tx
        .write_all(&Frame::OpenChannelFail { tunnel_id }.encode())
        .await?;
    Ok(())
}

async fn reply_unknown(command_tx: &mut OwnedWriteHalf, opcode: u8) -> Result<()> {
    warn!(opcode, "unsupported command");
    command_tx
        .write_all(&Frame::Unknown { opcode }.encode())
        .await?;
    Ok(())
}

async fn command_read_loop(
    mut reader: OwnedReadHalf,
    events_tx: mpsc::Sender<HostEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return,
            frame = wire::read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(frame) => {
                if events_tx.send(HostEvent::Command(frame)).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = events_tx.send(HostEvent::CommandLost(err)).await;
                return;
            }
        }
    }
}
