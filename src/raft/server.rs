use super::message::{Envelope, ReplicaId};
use super::node::{Node, Options};
use super::state::KvStore;
use super::transport::Transport;
use super::{Log, RECEIVE_TIMEOUT};
use crate::error::Result;

use crossbeam::channel::Receiver;
use log::{debug, error, info};
use std::collections::HashSet;

/// A replica server: a single Raft node driven by a cooperative event loop.
/// Each iteration runs the node's periodic work, forwards its outbound
/// messages to the transport, and dispatches at most one inbound message.
pub struct Server {
    node: Node,
    node_rx: Receiver<Envelope>,
    transport: Box<dyn Transport>,
}

impl Server {
    /// Creates a new replica server with an empty log and key/value store.
    pub fn new(
        id: ReplicaId,
        peers: HashSet<ReplicaId>,
        transport: Box<dyn Transport>,
        opts: Options,
    ) -> Result<Self> {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let node = Node::new(id, peers, Log::new(), Box::new(KvStore::new()), node_tx, opts)?;
        Ok(Self { node, node_rx, transport })
    }

    /// Serves requests until the process is killed.
    pub fn serve(self) -> Result<()> {
        let Server { mut node, node_rx, mut transport } = self;
        info!("Replica {} serving requests", node.id());
        loop {
            node = node.tick()?;
            Self::drain(&node_rx, transport.as_mut());
            match transport.recv(RECEIVE_TIMEOUT) {
                Ok(Some(envelope)) => {
                    debug!("Received {envelope:?}");
                    node = node.step(envelope)?;
                    Self::drain(&node_rx, transport.as_mut());
                }
                Ok(None) => {}
                Err(err) => error!("Receive failed: {err}"),
            }
        }
    }

    /// Forwards outbound node messages to the transport. Send failures are
    /// logged and the message dropped; the protocol absorbs lost messages.
    fn drain(node_rx: &Receiver<Envelope>, transport: &mut dyn Transport) {
        while let Ok(envelope) = node_rx.try_recv() {
            if let Err(err) = transport.send(envelope) {
                error!("Send failed: {err}");
            }
        }
    }
}
