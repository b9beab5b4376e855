use super::log::{Entry, Index, Term};
use crate::errinput;
use crate::error::{Error, Result};

use serde::{de, Deserialize, Serialize};

/// A client-assigned request ID, opaque to replicas. Clients reuse the ID when
/// retrying a request, which makes retries idempotent.
pub type RequestId = String;

/// A replica or client endpoint ID: four hex digits, e.g. 01A3. The reserved
/// ID FFFF addresses all peers and doubles as "leader unknown".
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReplicaId(u16);

impl ReplicaId {
    /// The broadcast and unknown-leader ID.
    pub const BROADCAST: ReplicaId = ReplicaId(0xffff);
}

impl Default for ReplicaId {
    fn default() -> Self {
        Self::BROADCAST
    }
}

impl From<u16> for ReplicaId {
    fn from(raw: u16) -> Self {
        ReplicaId(raw)
    }
}

impl From<ReplicaId> for u16 {
    fn from(id: ReplicaId) -> Self {
        id.0
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

impl std::str::FromStr for ReplicaId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 4 {
            return errinput!("invalid endpoint ID {s}");
        }
        let Ok(raw) = u16::from_str_radix(s, 16) else {
            return errinput!("invalid endpoint ID {s}");
        };
        Ok(ReplicaId(raw))
    }
}

impl Serialize for ReplicaId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ReplicaId {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer)?.parse().map_err(de::Error::custom)
    }
}

/// A message between endpoints (replicas and clients): one UTF-8 JSON object
/// per transport datagram. Every message carries the addressing fields below;
/// the payload fields depend on the message type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub src: ReplicaId,
    /// The recipient, or FFFF for broadcasts.
    pub dst: ReplicaId,
    /// The sender's believed leader, or FFFF when unknown.
    #[serde(default)]
    pub leader: ReplicaId,
    /// The sender's current term. Clients typically omit it, parsing as 0.
    #[serde(default)]
    pub term: Term,
    /// The message payload, tagged by the wire field "type".
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    /// Returns the sender's believed leader, if it names one.
    pub fn leader_hint(&self) -> Option<ReplicaId> {
        (self.leader != ReplicaId::BROADCAST).then_some(self.leader)
    }
}

/// A message payload. `ok` and `fail` do double duty: towards clients they
/// answer `get`/`put` requests, between replicas they answer `append_entries`
/// (success echoes the request so the leader can derive the new match index,
/// failure carries a conflict hint for next-index back-off).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// A client read.
    Get {
        #[serde(rename = "MID")]
        mid: RequestId,
        key: String,
    },

    /// A client write.
    Put {
        #[serde(rename = "MID")]
        mid: RequestId,
        key: String,
        value: String,
    },

    /// A positive reply, to a client request or an append_entries.
    Ok {
        #[serde(rename = "MID", default, skip_serializing_if = "Option::is_none")]
        mid: Option<RequestId>,
        /// The read value, for get replies.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        /// The echoed append base index, for append_entries replies.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prev_log_idx: Option<Index>,
        /// The echoed appended entries, for append_entries replies.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entries: Option<Vec<Entry>>,
    },

    /// A negative reply, to a client request or an append_entries.
    Fail {
        #[serde(rename = "MID", default, skip_serializing_if = "Option::is_none")]
        mid: Option<RequestId>,
        /// The first index of the conflicting term, for append_entries
        /// replies. The leader rewinds its next index using this hint.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        term_first_idx: Option<Index>,
    },

    /// Tells a client to retry against the envelope's leader.
    Redirect {
        #[serde(rename = "MID")]
        mid: RequestId,
    },

    /// A candidate solicits votes from all peers.
    RequestVote { last_log_idx: Index, last_log_term: Term },

    /// Answers a request_vote; true grants the vote.
    ResponseVote { value: bool },

    /// The leader replicates entries and asserts its leadership.
    AppendEntries {
        prev_log_idx: Index,
        prev_log_term: Term,
        entries: Vec<Entry>,
        leader_commit: Index,
    },
}

impl Message {
    /// Returns the client request ID this message carries, if any.
    pub fn mid(&self) -> Option<&str> {
        match self {
            Message::Get { mid, .. } | Message::Put { mid, .. } | Message::Redirect { mid } => {
                Some(mid)
            }
            Message::Ok { mid, .. } | Message::Fail { mid, .. } => mid.as_deref(),
            Message::RequestVote { .. }
            | Message::ResponseVote { .. }
            | Message::AppendEntries { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::log::Command;
    use serde_json::json;
    use test_case::test_case;

    #[test_case("0000", Some(0x0000); "zero")]
    #[test_case("01A3", Some(0x01a3); "mixed")]
    #[test_case("01a3", Some(0x01a3); "lowercase accepted")]
    #[test_case("FFFF", Some(0xffff); "broadcast")]
    #[test_case("1A3", None; "too short")]
    #[test_case("01A34", None; "too long")]
    #[test_case("01G3", None; "not hex")]
    fn replica_id_parse(s: &str, expect: Option<u16>) {
        assert_eq!(s.parse::<ReplicaId>().ok(), expect.map(ReplicaId::from));
    }

    #[test]
    fn replica_id_display_roundtrip() {
        let id = ReplicaId::from(0x01a3);
        assert_eq!(id.to_string(), "01A3");
        assert_eq!(id.to_string().parse::<ReplicaId>().unwrap(), id);
    }

    /// Client messages may omit leader and term.
    #[test]
    fn parse_client_put() {
        let raw = r#"{"src":"001A","dst":"0001","type":"put","MID":"m-1","key":"k","value":"v"}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.src, ReplicaId::from(0x001a));
        assert_eq!(envelope.dst, ReplicaId::from(0x0001));
        assert_eq!(envelope.leader, ReplicaId::BROADCAST);
        assert_eq!(envelope.term, 0);
        assert_eq!(
            envelope.message,
            Message::Put { mid: "m-1".into(), key: "k".into(), value: "v".into() }
        );
    }

    /// The append_entries wire shape, field for field.
    #[test]
    fn append_entries_wire_format() {
        let envelope = Envelope {
            src: ReplicaId::from(1),
            dst: ReplicaId::from(2),
            leader: ReplicaId::from(1),
            term: 2,
            message: Message::AppendEntries {
                prev_log_idx: 1,
                prev_log_term: 1,
                entries: vec![
                    Entry { term: 2, command: Some(Command::NoOp) },
                    Entry {
                        term: 2,
                        command: Some(Command::Put {
                            src: ReplicaId::from(0xaa),
                            mid: "m-1".into(),
                            key: "k".into(),
                            value: "v".into(),
                        }),
                    },
                ],
                leader_commit: 1,
            },
        };
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({
                "src": "0001",
                "dst": "0002",
                "leader": "0001",
                "term": 2,
                "type": "append_entries",
                "prev_log_idx": 1,
                "prev_log_term": 1,
                "leader_commit": 1,
                "entries": [
                    {"term": 2, "command": "NO_OP"},
                    {"term": 2, "command": "put", "src": "00AA", "MID": "m-1", "key": "k", "value": "v"},
                ],
            })
        );
    }

    /// Absent optional fields stay off the wire.
    #[test]
    fn ok_reply_skips_absent_fields() {
        let envelope = Envelope {
            src: ReplicaId::from(1),
            dst: ReplicaId::from(0xaa),
            leader: ReplicaId::from(1),
            term: 3,
            message: Message::Ok {
                mid: Some("m-1".into()),
                value: None,
                prev_log_idx: None,
                entries: None,
            },
        };
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({
                "src": "0001",
                "dst": "00AA",
                "leader": "0001",
                "term": 3,
                "type": "ok",
                "MID": "m-1",
            })
        );
    }

    #[test]
    fn vote_messages_roundtrip() {
        for message in [
            Message::RequestVote { last_log_idx: 7, last_log_term: 2 },
            Message::ResponseVote { value: true },
            Message::Fail { mid: None, term_first_idx: Some(3) },
            Message::Redirect { mid: "m-9".into() },
        ] {
            let envelope = Envelope {
                src: ReplicaId::from(1),
                dst: ReplicaId::from(2),
                leader: ReplicaId::BROADCAST,
                term: 2,
                message,
            };
            let raw = serde_json::to_string(&envelope).unwrap();
            assert_eq!(serde_json::from_str::<Envelope>(&raw).unwrap(), envelope);
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = r#"{"src":"0001","dst":"0002","type":"gossip"}"#;
        assert!(serde_json::from_str::<Envelope>(raw).is_err());
    }
}
