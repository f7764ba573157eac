use serde::{Deserialize, Serialize};

use super::clock::Timestamp;
use super::errors::CodecError;

/// Stable identity of a replica: its position in the cluster file.
pub type ReplicaId = u32;

/// Value of the `nServers` wire field when no replica count is carried.
const NO_REPLICA_COUNT: i64 = -1;

/// Kind of a peer protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Ask every peer for permission to enter the critical section.
    Request,
    /// Acknowledge a peer's request.
    Ack,
    /// Leave the critical section; carries the post-mutation state.
    Release,
    /// First line on a new outbound link.
    JoinRequest,
    /// Reply to a join; carries the responder's state and live-peer count.
    JoinResponse,
}

/// Ordering key of a pending request.
///
/// Derived `Ord` compares the timestamp first and breaks ties on the
/// replica id, which makes the order total across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestKey {
    /// Lamport timestamp at which the request was issued.
    pub timestamp: Timestamp,
    /// Requesting replica.
    pub origin: ReplicaId,
}

/// A message exchanged between replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    /// Replica that sent the message.
    pub origin: ReplicaId,
    /// Sender's clock when the message was built.
    pub timestamp: Timestamp,
    /// Opaque application state (RELEASE, JOIN_RESPONSE); empty otherwise.
    pub payload: String,
    /// Responder's live-peer count (JOIN_RESPONSE only).
    pub replica_count: Option<u32>,
}

/// On-the-wire shape: one JSON object per line.
#[derive(Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(rename = "serverID")]
    server_id: ReplicaId,
    clock: Timestamp,
    #[serde(default)]
    data: String,
    #[serde(rename = "nServers", default = "no_replica_count")]
    n_servers: i64,
}

fn no_replica_count() -> i64 {
    NO_REPLICA_COUNT
}

impl Message {
    fn new(kind: MessageKind, origin: ReplicaId, timestamp: Timestamp) -> Self {
        Message {
            kind,
            origin,
            timestamp,
            payload: String::new(),
            replica_count: None,
        }
    }

    pub fn request(origin: ReplicaId, timestamp: Timestamp) -> Self {
        Self::new(MessageKind::Request, origin, timestamp)
    }

    pub fn ack(origin: ReplicaId, timestamp: Timestamp) -> Self {
        Self::new(MessageKind::Ack, origin, timestamp)
    }

    pub fn release(origin: ReplicaId, timestamp: Timestamp, state: String) -> Self {
        Message {
            payload: state,
            ..Self::new(MessageKind::Release, origin, timestamp)
        }
    }

    pub fn join_request(origin: ReplicaId, timestamp: Timestamp) -> Self {
        Self::new(MessageKind::JoinRequest, origin, timestamp)
    }

    pub fn join_response(
        origin: ReplicaId,
        timestamp: Timestamp,
        replica_count: u32,
        state: String,
    ) -> Self {
        Message {
            payload: state,
            replica_count: Some(replica_count),
            ..Self::new(MessageKind::JoinResponse, origin, timestamp)
        }
    }

    /// Position of this message in the request order.
    #[inline]
    pub fn key(&self) -> RequestKey {
        RequestKey {
            timestamp: self.timestamp,
            origin: self.origin,
        }
    }

    /// Encode as a single JSON line, without the trailing newline.
    pub fn encode(&self) -> String {
        let wire = WireMessage {
            kind: self.kind,
            server_id: self.origin,
            clock: self.timestamp,
            data: self.payload.clone(),
            n_servers: self
                .replica_count
                .map(i64::from)
                .unwrap_or(NO_REPLICA_COUNT),
        };
        serde_json::to_string(&wire).expect("Message serialization should not fail")
    }

    /// Decode one line produced by [`Message::encode`].
    pub fn decode(line: &str) -> Result<Self, CodecError> {
        let line = line.trim_end_matches(&['\r', '\n'][..]);
        if line.is_empty() {
            return Err(CodecError::EmptyLine);
        }
        let wire: WireMessage = serde_json::from_str(line)?;

        let replica_count = match wire.n_servers {
            NO_REPLICA_COUNT => None,
            n => Some(u32::try_from(n).map_err(|_| CodecError::BadReplicaCount(n))?),
        };
        if wire.kind == MessageKind::JoinResponse && replica_count.is_none() {
            return Err(CodecError::MissingReplicaCount);
        }

        Ok(Message {
            kind: wire.kind,
            origin: wire.server_id,
            timestamp: wire.clock,
            payload: wire.data,
            replica_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_each_kind() {
        let messages = [
            Message::request(1, 5),
            Message::ack(2, 9),
            Message::release(0, 12, "[\"alice\",\"\"]".to_string()),
            Message::join_request(3, 0),
            Message::join_response(0, 44, 2, "{\"k\":\"v\\n\"}".to_string()),
        ];

        for msg in messages {
            let line = msg.encode();
            assert!(!line.contains('\n'), "encoded message spans lines: {}", line);
            assert_eq!(Message::decode(&line).unwrap(), msg);
        }
    }

    #[test]
    fn test_wire_field_names() {
        let line = Message::join_response(4, 17, 3, "blob".to_string()).encode();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["type"], "JOIN_RESPONSE");
        assert_eq!(value["serverID"], 4);
        assert_eq!(value["clock"], 17);
        assert_eq!(value["data"], "blob");
        assert_eq!(value["nServers"], 3);

        let line = Message::ack(1, 2).encode();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["nServers"], -1);
    }

    #[test]
    fn test_decode_tolerates_missing_optional_fields() {
        let msg = Message::decode(r#"{"type":"REQUEST","serverID":2,"clock":8}"#).unwrap();
        assert_eq!(msg, Message::request(2, 8));

        // Trailing newline from a line reader.
        let msg = Message::decode("{\"type\":\"ACK\",\"serverID\":0,\"clock\":1}\r\n").unwrap();
        assert_eq!(msg.kind, MessageKind::Ack);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Message::decode(""), Err(CodecError::EmptyLine)));
        assert!(matches!(Message::decode("not json"), Err(CodecError::Json(_))));
        assert!(matches!(
            Message::decode(r#"{"type":"GOSSIP","serverID":0,"clock":1}"#),
            Err(CodecError::Json(_))
        ));
        assert!(matches!(
            Message::decode(r#"{"type":"ACK","serverID":0,"clock":1,"nServers":-7}"#),
            Err(CodecError::BadReplicaCount(-7))
        ));
        assert!(matches!(
            Message::decode(r#"{"type":"JOIN_RESPONSE","serverID":0,"clock":1,"data":""}"#),
            Err(CodecError::MissingReplicaCount)
        ));
    }

    #[test]
    fn test_request_order_breaks_ties_on_id() {
        let a = Message::request(0, 5).key();
        let b = Message::request(1, 5).key();
        let c = Message::request(0, 6).key();

        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
        assert_ne!(a, b);
    }
}
