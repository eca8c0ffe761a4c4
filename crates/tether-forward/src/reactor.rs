//! Tunnel registry: the bookkeeping shared by both forwarder roles.
//!
//! A registry is owned exclusively by one forwarder's reactor task; all
//! mutation happens there. Spool tasks it spawns report completion through
//! the `closed` channel handed to [`TunnelRegistry::new`], and the reactor
//! feeds those ids back into [`TunnelRegistry::remove_closed`].

use std::collections::HashMap;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::tunnel;
use crate::{ForwardError, Result};

pub type TunnelId = u32;

/// Registry entry for one forwarded connection.
#[derive(Debug)]
pub(crate) enum TunnelEntry {
    /// Device side: the accepted right leg, waiting for the host's ack to
    /// arrive on a pending channel.
    AwaitingPeer { right: TcpStream },
    /// Host side: both legs are being dialed by a connect task.
    Connecting,
    /// Both legs are attached and the spool task is running.
    Active { task: JoinHandle<()> },
}

#[derive(Debug)]
pub(crate) struct TunnelRegistry {
    tunnels: HashMap<TunnelId, TunnelEntry>,
    next_id: TunnelId,
    closed_tx: mpsc::Sender<TunnelId>,
}

impl TunnelRegistry {
    pub(crate) fn new(closed_tx: mpsc::Sender<TunnelId>) -> Self {
        Self {
            tunnels: HashMap::new(),
            next_id: 1,
            closed_tx,
        }
    }

    /// Register a tunnel, allocating an id when none is given.
    ///
    /// Ids are monotonically increasing per registry; they are not unique
    /// across forwarder restarts, which is fine because every run starts
    /// with a fresh command handshake.
    pub(crate) fn insert(
        &mut self,
        explicit_id: Option<TunnelId>,
        entry: TunnelEntry,
    ) -> Result<TunnelId> {
        let id = match explicit_id {
            Some(id) => {
                if self.tunnels.contains_key(&id) {
                    return Err(ForwardError::DuplicateTunnel(id));
                }
                id
            }
            None => {
                while self.tunnels.contains_key(&self.next_id) {
                    self.next_id = self.next_id.wrapping_add(1);
                }
                let id = self.next_id;
                self.next_id = self.next_id.wrapping_add(1);
                id
            }
        };
        self.tunnels.insert(id, entry);
        Ok(id)
    }

    pub(crate) fn contains(&self, id: TunnelId) -> bool {
        self.tunnels.contains_key(&id)
    }

    /// Take the waiting right leg out of an [`TunnelEntry::AwaitingPeer`]
    /// entry so the caller can attach the just-promoted left leg.
    ///
    /// Unknown ids and tunnels whose left leg is already set are protocol
    /// errors; the caller closes the offending channel (and the tunnel).
    pub(crate) fn claim_awaiting(&mut self, id: TunnelId) -> Result<TcpStream> {
        match self.tunnels.remove(&id) {
            None => Err(ForwardError::UnknownTunnel(id)),
            Some(TunnelEntry::AwaitingPeer { right }) => Ok(right),
            Some(entry) => {
                self.tunnels.insert(id, entry);
                Err(ForwardError::Protocol(format!(
                    "tunnel {id} already has both legs"
                )))
            }
        }
    }

    /// Attach both legs and start spooling. Replaces whatever entry the id
    /// currently holds.
    pub(crate) fn activate(&mut self, id: TunnelId, left: TcpStream, right: TcpStream) {
        let closed_tx = self.closed_tx.clone();
        let task = tokio::spawn(async move {
            match tunnel::spool(left, right).await {
                Ok((to_right, to_left)) => {
                    debug!(tunnel = id, to_right, to_left, "tunnel drained");
                }
                Err(err) => debug!(tunnel = id, "tunnel closed: {err}"),
            }
            // The registry may already be gone on shutdown; nothing to do then.
            let _ = closed_tx.send(id).await;
        });
        self.tunnels.insert(id, TunnelEntry::Active { task });
    }

    /// Close a tunnel: abort its spool task (dropping both sockets) or drop
    /// its waiting leg. Best-effort and idempotent; unknown ids are a no-op.
    pub(crate) fn close_tunnel(&mut self, id: TunnelId) -> bool {
        match self.tunnels.remove(&id) {
            None => false,
            Some(TunnelEntry::Active { task }) => {
                task.abort();
                true
            }
            // AwaitingPeer drops the socket here. A Connecting tunnel has
            // no sockets yet; when its legs come back to the reactor it
            // finds the entry gone and discards them.
            Some(_) => true,
        }
    }

    /// Forget a tunnel whose spool task finished on its own.
    pub(crate) fn remove_closed(&mut self, id: TunnelId) {
        if let Some(TunnelEntry::Active { .. }) = self.tunnels.get(&id) {
            self.tunnels.remove(&id);
        }
    }

    /// Close every tunnel and clear the registry. Safe to call repeatedly.
    pub(crate) fn done(&mut self) {
        for (id, entry) in self.tunnels.drain() {
            if let TunnelEntry::Active { task } = entry {
                debug!(tunnel = id, "closing tunnel on shutdown");
                task.abort();
            }
        }
    }
}
