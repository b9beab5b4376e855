//! End-to-end cluster tests: real servers on threads, wired up over the
//! in-memory channel fabric, driven by a scripted client.

use raftkv::error::Result;
use raftkv::raft::{Channel, Envelope, Message, Options, ReplicaId, Server, Transport};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a scenario may take before it fails. Elections finish in well
/// under a second; this leaves room for slow CI machines.
const SCENARIO_TIMEOUT: Duration = Duration::from_secs(15);

/// A transport wrapper with a kill switch. Once blown, the endpoint stops
/// sending and receiving, as if the host died or was partitioned off.
struct Fused {
    inner: Channel,
    blown: Arc<AtomicBool>,
}

impl Transport for Fused {
    fn send(&mut self, envelope: Envelope) -> Result<()> {
        if self.blown.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.inner.send(envelope)
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Envelope>> {
        if self.blown.load(Ordering::Relaxed) {
            std::thread::sleep(timeout);
            return Ok(None);
        }
        let envelope = self.inner.recv(timeout)?;
        if self.blown.load(Ordering::Relaxed) {
            return Ok(None);
        }
        Ok(envelope)
    }
}

/// A test cluster: replica servers on background threads, a client endpoint,
/// and one kill switch per replica.
struct TestCluster {
    replicas: Vec<ReplicaId>,
    kills: Vec<Arc<AtomicBool>>,
    client: Client,
}

impl TestCluster {
    fn run(replicas: &[u16], client_id: u16) -> Self {
        let replicas: Vec<ReplicaId> = replicas.iter().map(|id| (*id).into()).collect();
        let ids: Vec<ReplicaId> =
            replicas.iter().copied().chain([client_id.into()]).collect();
        let mut mesh = Channel::mesh(&ids);

        let mut kills = Vec::new();
        for id in &replicas {
            let blown = Arc::new(AtomicBool::new(false));
            kills.push(blown.clone());
            let transport =
                Fused { inner: mesh.remove(id).expect("endpoint not in mesh"), blown };
            let peers = replicas.iter().copied().filter(|peer| peer != id).collect();
            let server = Server::new(*id, peers, Box::new(transport), Options::default())
                .expect("server failed");
            std::thread::spawn(move || server.serve());
        }

        let client = Client {
            id: client_id.into(),
            transport: mesh.remove(&client_id.into()).expect("client endpoint missing"),
            replicas: replicas.clone(),
            target: 0,
            seq: 0,
        };
        Self { replicas, kills, client }
    }

    /// Kills the replica the client last got a response from (the leader,
    /// after a successful request).
    fn kill_target(&mut self) {
        let target = self.client.target;
        self.kills[target].store(true, Ordering::Relaxed);
        // Don't keep talking to the corpse.
        self.client.target = (target + 1) % self.replicas.len();
    }
}

/// A scripted client: sends a request, follows redirects, backs off on fails,
/// rotates to another replica when one stops answering, and retries with the
/// same MID until it gets an ok.
struct Client {
    id: ReplicaId,
    transport: Channel,
    replicas: Vec<ReplicaId>,
    target: usize,
    seq: u64,
}

impl Client {
    fn put(&mut self, key: &str, value: &str) {
        let mid = self.mid();
        self.request(Message::Put { mid, key: key.into(), value: value.into() });
    }

    /// Re-sends a put with an explicit MID, for idempotent retry tests.
    fn put_with_mid(&mut self, mid: &str, key: &str, value: &str) {
        self.request(Message::Put { mid: mid.into(), key: key.into(), value: value.into() });
    }

    fn get(&mut self, key: &str) -> String {
        let mid = self.mid();
        match self.request(Message::Get { mid, key: key.into() }) {
            Message::Ok { value, .. } => value.unwrap_or_default(),
            message => panic!("unexpected get response {message:?}"),
        }
    }

    fn mid(&mut self) -> String {
        self.seq += 1;
        format!("{}-{}", self.id, self.seq)
    }

    fn request(&mut self, message: Message) -> Message {
        let deadline = Instant::now() + SCENARIO_TIMEOUT;
        loop {
            assert!(Instant::now() < deadline, "request timed out: {message:?}");

            let target = self.replicas[self.target];
            self.transport
                .send(Envelope {
                    src: self.id,
                    dst: target,
                    leader: ReplicaId::BROADCAST,
                    term: 0,
                    message: message.clone(),
                })
                .expect("send failed");

            // Wait for an answer to this request, then follow it.
            let attempt = Instant::now() + Duration::from_millis(800);
            let mut answered = false;
            while Instant::now() < attempt && !answered {
                let Some(envelope) =
                    self.transport.recv(Duration::from_millis(50)).expect("recv failed")
                else {
                    continue;
                };
                if envelope.message.mid() != message.mid() {
                    continue; // stale reply from an earlier attempt
                }
                match envelope.message {
                    ok @ Message::Ok { .. } => return ok,
                    Message::Redirect { .. } => {
                        if let Some(leader) =
                            self.replicas.iter().position(|id| Some(*id) == envelope.leader_hint())
                        {
                            self.target = leader;
                        }
                        answered = true;
                    }
                    Message::Fail { .. } => {
                        // No leader right now (or it just changed); back off
                        // briefly and retry.
                        std::thread::sleep(Duration::from_millis(100));
                        answered = true;
                    }
                    _ => {}
                }
            }
            if !answered {
                // The target isn't answering at all; try another replica.
                self.target = (self.target + 1) % self.replicas.len();
            }
        }
    }
}

/// A single replica with no peers forms a quorum of one and serves
/// immediately.
#[test]
fn single_replica_serves() {
    let mut cluster = TestCluster::run(&[0x0101], 0x0a01);
    cluster.client.put("k", "v");
    assert_eq!(cluster.client.get("k"), "v");
    assert_eq!(cluster.client.get("missing"), "");
}

/// Three replicas elect a leader and serve a put followed by a get.
#[test]
fn bootstrap_put_get() {
    let mut cluster = TestCluster::run(&[0x0201, 0x0202, 0x0203], 0x0a02);
    cluster.client.put("alpha", "1");
    assert_eq!(cluster.client.get("alpha"), "1");

    cluster.client.put("alpha", "2");
    assert_eq!(cluster.client.get("alpha"), "2");
}

/// Requests sent to followers are redirected to the leader and still succeed.
#[test]
fn followers_redirect_to_leader() {
    let mut cluster = TestCluster::run(&[0x0301, 0x0302, 0x0303], 0x0a03);
    // Target each replica in turn; at least two of them are followers.
    for (i, value) in ["a", "b", "c"].iter().enumerate() {
        cluster.client.target = i;
        cluster.client.put("k", value);
        assert_eq!(cluster.client.get("k"), *value);
    }
}

/// Retrying a put with the same MID acknowledges without a second write.
#[test]
fn duplicate_mid_is_idempotent() {
    let mut cluster = TestCluster::run(&[0x0401, 0x0402, 0x0403], 0x0a04);
    cluster.client.put_with_mid("dup-1", "gamma", "7");
    cluster.client.put_with_mid("dup-1", "gamma", "7");
    assert_eq!(cluster.client.get("gamma"), "7");
}

/// A five-replica cluster keeps serving committed data after losing its
/// leader: a new leader is elected and answers reads with the old write.
#[test]
fn survives_leader_crash() {
    let mut cluster =
        TestCluster::run(&[0x0501, 0x0502, 0x0503, 0x0504, 0x0505], 0x0a05);
    cluster.client.put("beta", "42");
    assert_eq!(cluster.client.get("beta"), "42");

    // The last successful response came from the leader; kill it.
    cluster.kill_target();
    assert_eq!(cluster.client.get("beta"), "42");
    cluster.client.put("beta", "43");
    assert_eq!(cluster.client.get("beta"), "43");
}

/// Sequential writes through the cluster all take effect in order.
#[test]
fn sequential_writes_converge() {
    let mut cluster = TestCluster::run(&[0x0601, 0x0602, 0x0603], 0x0a06);
    for i in 0..20 {
        cluster.client.put("counter", &i.to_string());
    }
    assert_eq!(cluster.client.get("counter"), "19");
}
