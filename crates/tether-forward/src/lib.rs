//! Reverse port-forwarding tunnel between a host machine and a remote device.
//!
//! A device-side forwarder ([`DeviceForwarder`]) listens on a set of
//! device-local ports plus one command port. A host-side forwarder
//! ([`HostForwarder`]) dials the command port (published on the host by
//! whatever transport carries traffic to the device, e.g. a USB relay) and
//! completes each forwarded connection the device announces, so services
//! listening behind the device become reachable from the host without a
//! direct route between the two networks.
//!
//! The two sides speak a small opcode protocol over the single command
//! connection (see [`wire`]); every forwarded connection becomes a tunnel:
//! a pair of sockets spliced together with bounded buffers (see
//! [`tunnel::spool`]). The protocol provides no encryption or
//! authentication, and a broken command connection terminates every tunnel:
//! the transport underneath is assumed to be point-to-point and trusted.

pub mod device;
pub mod host;
mod reactor;
pub mod tunnel;
pub mod wire;

use std::io;

use thiserror::Error;

pub use device::{DeviceForwarder, DeviceForwarderConfig};
pub use host::{Forward, HostForwarder};
pub use reactor::TunnelId;

#[derive(Debug, Error)]
pub enum ForwardError {
    /// No peer dialed the command port within the configured window.
    #[error("command connection timed out")]
    CommandConnectionTimeout,
    /// The command connection reached EOF; all tunnels are torn down.
    #[error("command connection closed by peer")]
    CommandConnectionClosed,
    #[error("duplicate tunnel id {0}")]
    DuplicateTunnel(TunnelId),
    #[error("unknown tunnel id {0}")]
    UnknownTunnel(TunnelId),
    #[error("no forward registered for device port {0}")]
    UnknownForward(u16),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ForwardError>;
