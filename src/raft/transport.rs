use super::message::{Envelope, ReplicaId};
use super::MAX_MESSAGE_SIZE;
use crate::errdata;
use crate::error::Result;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

/// A transport for exchanging framed messages with named endpoints: one UTF-8
/// JSON message per datagram, at most MAX_MESSAGE_SIZE bytes. Send, so a
/// server can run its event loop on a dedicated thread.
pub trait Transport: Send {
    /// Sends a message to its dst endpoint, or to all peers when dst is the
    /// broadcast ID. Delivery is best-effort; the protocol absorbs loss.
    fn send(&mut self, envelope: Envelope) -> Result<()>;

    /// Receives the next inbound message, waiting up to the given (non-zero)
    /// timeout. Malformed messages are logged and dropped, surfacing as None.
    fn recv(&mut self, timeout: Duration) -> Result<Option<Envelope>>;
}

/// A standalone datagram transport over loopback UDP, standing in for an
/// external cluster fabric. Each endpoint name maps into the dynamic port
/// range: endpoint `id` listens on port `0xC000 | (id & 0x3FFF)`, so IDs
/// collide only when they differ solely in their top two bits.
pub struct Udp {
    socket: UdpSocket,
    peers: Vec<ReplicaId>,
    buf: Vec<u8>,
}

impl Udp {
    /// Binds the datagram endpoint for the given ID.
    pub fn new(id: ReplicaId, peers: &[ReplicaId]) -> Result<Self> {
        let socket = UdpSocket::bind(Self::addr(id))?;
        Ok(Self { socket, peers: peers.to_vec(), buf: vec![0; MAX_MESSAGE_SIZE] })
    }

    /// Maps an endpoint name to its loopback address.
    fn addr(id: ReplicaId) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0xc000 | (u16::from(id) & 0x3fff)))
    }
}

impl Transport for Udp {
    fn send(&mut self, envelope: Envelope) -> Result<()> {
        let frame = serde_json::to_vec(&envelope)?;
        if frame.len() > MAX_MESSAGE_SIZE {
            return errdata!("message of {} bytes exceeds frame limit", frame.len());
        }
        if envelope.dst == ReplicaId::BROADCAST {
            for peer in &self.peers {
                self.socket.send_to(&frame, Self::addr(*peer))?;
            }
        } else {
            self.socket.send_to(&frame, Self::addr(envelope.dst))?;
        }
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Envelope>> {
        self.socket.set_read_timeout(Some(timeout))?;
        let len = match self.socket.recv(&mut self.buf) {
            Ok(len) => len,
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Ok(None)
            }
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice(&self.buf[..len]) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(err) => {
                error!("Dropping malformed message: {err}");
                Ok(None)
            }
        }
    }
}

/// An in-memory full-mesh fabric over channels, for tests and in-process
/// clusters. Messages to unknown or departed endpoints are dropped, like
/// datagrams to a dead host.
pub struct Channel {
    id: ReplicaId,
    rx: Receiver<Envelope>,
    txs: HashMap<ReplicaId, Sender<Envelope>>,
}

impl Channel {
    /// Builds a full mesh between the given endpoints.
    pub fn mesh(ids: &[ReplicaId]) -> HashMap<ReplicaId, Channel> {
        let mut txs = HashMap::new();
        let mut rxs = HashMap::new();
        for id in ids {
            let (tx, rx) = crossbeam::channel::unbounded();
            txs.insert(*id, tx);
            rxs.insert(*id, rx);
        }
        rxs.into_iter()
            .map(|(id, rx)| (id, Channel { id, rx, txs: txs.clone() }))
            .collect()
    }
}

impl Transport for Channel {
    fn send(&mut self, envelope: Envelope) -> Result<()> {
        let dsts: Vec<ReplicaId> = if envelope.dst == ReplicaId::BROADCAST {
            self.txs.keys().copied().filter(|id| *id != self.id).collect()
        } else {
            vec![envelope.dst]
        };
        for dst in dsts {
            match self.txs.get(&dst) {
                Some(tx) => {
                    // A dropped receiver behaves like a dead host.
                    let _ = tx.send(envelope.clone());
                }
                None => debug!("Dropping message for unknown endpoint {dst}"),
            }
        }
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Envelope>> {
        match self.rx.recv_timeout(timeout) {
            Ok(envelope) => Ok(Some(envelope)),
            // We hold a sender to ourselves, so disconnection can't happen;
            // treat it like a timeout regardless.
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::message::Message;

    fn envelope(src: u16, dst: u16) -> Envelope {
        Envelope {
            src: src.into(),
            dst: dst.into(),
            leader: ReplicaId::BROADCAST,
            term: 1,
            message: Message::ResponseVote { value: true },
        }
    }

    #[test]
    fn channel_delivers_point_to_point() {
        let ids: Vec<ReplicaId> = [1u16, 2, 3].map(ReplicaId::from).to_vec();
        let mut mesh = Channel::mesh(&ids);
        let mut a = mesh.remove(&1.into()).unwrap();
        let mut b = mesh.remove(&2.into()).unwrap();
        let mut c = mesh.remove(&3.into()).unwrap();

        a.send(envelope(1, 2)).unwrap();
        assert_eq!(b.recv(Duration::from_millis(100)).unwrap(), Some(envelope(1, 2)));
        assert_eq!(c.recv(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn channel_broadcast_reaches_all_but_sender() {
        let ids: Vec<ReplicaId> = [1u16, 2, 3].map(ReplicaId::from).to_vec();
        let mut mesh = Channel::mesh(&ids);
        let mut a = mesh.remove(&1.into()).unwrap();
        let mut b = mesh.remove(&2.into()).unwrap();
        let mut c = mesh.remove(&3.into()).unwrap();

        a.send(envelope(1, 0xffff)).unwrap();
        assert!(b.recv(Duration::from_millis(100)).unwrap().is_some());
        assert!(c.recv(Duration::from_millis(100)).unwrap().is_some());
        assert_eq!(a.recv(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn channel_drops_messages_to_unknown_endpoints() {
        let ids: Vec<ReplicaId> = [1u16].map(ReplicaId::from).to_vec();
        let mut mesh = Channel::mesh(&ids);
        let mut a = mesh.remove(&1.into()).unwrap();
        a.send(envelope(1, 9)).unwrap();
        assert_eq!(a.recv(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn udp_roundtrip() {
        let a_id = ReplicaId::from(0x2e01);
        let b_id = ReplicaId::from(0x2e02);
        let mut a = Udp::new(a_id, &[b_id]).unwrap();
        let mut b = Udp::new(b_id, &[a_id]).unwrap();

        a.send(envelope(0x2e01, 0x2e02)).unwrap();
        assert_eq!(
            b.recv(Duration::from_millis(1000)).unwrap(),
            Some(envelope(0x2e01, 0x2e02))
        );
        assert_eq!(a.recv(Duration::from_millis(10)).unwrap(), None);
    }
}
