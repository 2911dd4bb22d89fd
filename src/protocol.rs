use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Protocol version stamped into every message envelope.
pub const VERSION: &str = "1.0.0";

/// Marker naming the threshold scheme used by a sharing session.
pub const TOOL: &str = "sss";

/// A protocol message: common envelope fields plus one typed body.
///
/// Messages are what travels (sealed) through the shared append-only log.
/// The envelope identifies the author, protocol version and creation time;
/// the body carries the per-variant fields.
///
/// # Examples
///
/// Building a message by hand (the codec normally stamps the envelope):
///
/// ```rust
/// use custodia::protocol::{Body, Message, Root, TOOL, VERSION};
///
/// let message = Message {
///     author: "00".repeat(32),
///     version: VERSION.to_string(),
///     timestamp: 1,
///     body: Body::Root(Root {
///         label: "My private key".to_string(),
///         shards: 5,
///         quorum: 3,
///         tool: TOOL.to_string(),
///     }),
/// };
/// assert_eq!(message.body.kind(), custodia::protocol::Kind::Root);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Hex-encoded signing public key of the author.
    pub author: String,
    /// Protocol version, currently [`VERSION`].
    pub version: String,
    /// Creation time in milliseconds since the epoch.
    pub timestamp: u64,
    #[serde(flatten)]
    pub body: Body,
}

/// The five protocol message bodies, tagged on the wire as
/// `"type": "custodia/<kind>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Body {
    #[serde(rename = "custodia/root")]
    Root(Root),
    #[serde(rename = "custodia/shard")]
    Shard(Shard),
    #[serde(rename = "custodia/request")]
    Request(Request),
    #[serde(rename = "custodia/reply")]
    Reply(Reply),
    #[serde(rename = "custodia/forward")]
    Forward(Forward),
}

/// Message kind without its payload, used for log filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Root,
    Shard,
    Request,
    Reply,
    Forward,
}

impl Body {
    /// The kind tag of this body.
    pub fn kind(&self) -> Kind {
        match self {
            Body::Root(_) => Kind::Root,
            Body::Shard(_) => Kind::Shard,
            Body::Request(_) => Kind::Request,
            Body::Reply(_) => Kind::Reply,
            Body::Forward(_) => Kind::Forward,
        }
    }
}

/// Describes one sharing session. Its content hash is the session (root) id
/// referenced by every descendant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    /// Human-readable name for the secret.
    pub label: String,
    /// Total number of shards produced.
    pub shards: u8,
    /// Minimum number of shards needed to reconstruct.
    pub quorum: u8,
    /// Threshold scheme marker, currently [`TOOL`].
    pub tool: String,
}

/// One custodian's encrypted, signed share of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// Id of the session's root message.
    pub root: String,
    /// Optional display name for the custodian.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// One-way-boxed signed share, hex.
    pub shard: String,
    /// Hex public key of the custodian holding this shard.
    pub recipient: String,
}

/// A recovery solicitation sent to one custodian.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Hex public key of the custodian being asked.
    pub recipient: String,
    /// Id of the session being recovered.
    pub root: String,
    /// Ephemeral public key for the reply to layer its share under, hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ephemeral_key: Option<String>,
}

/// A custodian's answer to one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// Hex public key of the requester.
    pub recipient: String,
    /// Id of the request this reply answers; the idempotency key.
    pub branch: String,
    /// Id of the session being recovered.
    pub root: String,
    /// Signed share, possibly ephemeral-layered, hex.
    pub shard: String,
}

/// A proactive hand-off of a held share, bypassing request/reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forward {
    /// Id of the session the share belongs to.
    pub root: String,
    /// Signed share, hex.
    pub shard: String,
    /// Hex public key of the new holder.
    pub recipient: String,
}

fn is_hex_id(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_hex_payload(value: &str) -> bool {
    !value.is_empty() && value.len() % 2 == 0 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Schema-checks a message, the last gate before sealing and publishing.
///
/// The check is exhaustive over the body variants; a failure aborts the
/// surrounding operation with `Error::Validation` and nothing is published.
pub fn validate(message: &Message) -> Result<()> {
    if !is_hex_id(&message.author) {
        return Err(Error::Validation("author is not a hex public key".to_string()));
    }
    if message.version.is_empty() {
        return Err(Error::Validation("missing protocol version".to_string()));
    }
    if message.timestamp == 0 {
        return Err(Error::Validation("missing timestamp".to_string()));
    }

    match &message.body {
        Body::Root(root) => {
            if root.shards < 1 {
                return Err(Error::Validation("root must produce at least one shard".to_string()));
            }
            if root.quorum < 1 || root.quorum > root.shards {
                return Err(Error::Validation(format!(
                    "quorum {} out of range 1..={}",
                    root.quorum, root.shards
                )));
            }
            if root.tool.is_empty() {
                return Err(Error::Validation("missing tool marker".to_string()));
            }
        }
        Body::Shard(shard) => {
            if !is_hex_id(&shard.root) {
                return Err(Error::Validation("shard root is not a message id".to_string()));
            }
            if !is_hex_payload(&shard.shard) {
                return Err(Error::Validation("shard payload is not hex".to_string()));
            }
            if !is_hex_id(&shard.recipient) {
                return Err(Error::Validation("shard recipient is not a public key".to_string()));
            }
        }
        Body::Request(request) => {
            if !is_hex_id(&request.recipient) {
                return Err(Error::Validation("request recipient is not a public key".to_string()));
            }
            if !is_hex_id(&request.root) {
                return Err(Error::Validation("request root is not a message id".to_string()));
            }
            if let Some(key) = &request.ephemeral_key {
                if !is_hex_id(key) {
                    return Err(Error::Validation("ephemeral key is not a public key".to_string()));
                }
            }
        }
        Body::Reply(reply) => {
            if !is_hex_id(&reply.recipient) {
                return Err(Error::Validation("reply recipient is not a public key".to_string()));
            }
            if !is_hex_id(&reply.branch) {
                return Err(Error::Validation("reply branch is not a message id".to_string()));
            }
            if !is_hex_id(&reply.root) {
                return Err(Error::Validation("reply root is not a message id".to_string()));
            }
            if !is_hex_payload(&reply.shard) {
                return Err(Error::Validation("reply shard is not hex".to_string()));
            }
        }
        Body::Forward(forward) => {
            if !is_hex_id(&forward.root) {
                return Err(Error::Validation("forward root is not a message id".to_string()));
            }
            if !is_hex_payload(&forward.shard) {
                return Err(Error::Validation("forward shard is not hex".to_string()));
            }
            if !is_hex_id(&forward.recipient) {
                return Err(Error::Validation("forward recipient is not a public key".to_string()));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(body: Body) -> Message {
        Message {
            author: "ab".repeat(32),
            version: VERSION.to_string(),
            timestamp: 1_700_000_000_000,
            body,
        }
    }

    macro_rules! assert_roundtrip {
        ( $value:expr ) => {{
            let buf = serde_json::to_vec(&$value).unwrap();
            let value: Message = serde_json::from_slice(&buf).unwrap();
            assert_eq!(value, $value);
        }};
    }

    #[test]
    fn test_serialize_deserialize_root() {
        let message = envelope(Body::Root(Root {
            label: "My private key".to_string(),
            shards: 5,
            quorum: 3,
            tool: TOOL.to_string(),
        }));
        assert_roundtrip!(message);

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "custodia/root");
        assert_eq!(json["shards"], 5);
    }

    #[test]
    fn test_serialize_deserialize_shard() {
        let message = envelope(Body::Shard(Shard {
            root: "cd".repeat(32),
            name: None,
            shard: "deadbeef".to_string(),
            recipient: "ef".repeat(32),
        }));
        assert_roundtrip!(message);

        // An absent name stays absent on the wire.
        let json = serde_json::to_value(&message).unwrap();
        assert!(json.get("name").is_none());
    }

    #[test]
    fn test_serialize_deserialize_request_reply_forward() {
        assert_roundtrip!(envelope(Body::Request(Request {
            recipient: "ef".repeat(32),
            root: "cd".repeat(32),
            ephemeral_key: Some("11".repeat(32)),
        })));
        assert_roundtrip!(envelope(Body::Reply(Reply {
            recipient: "ef".repeat(32),
            branch: "22".repeat(32),
            root: "cd".repeat(32),
            shard: "deadbeef".to_string(),
        })));
        assert_roundtrip!(envelope(Body::Forward(Forward {
            root: "cd".repeat(32),
            shard: "deadbeef".to_string(),
            recipient: "ef".repeat(32),
        })));
    }

    #[test]
    fn test_validate_accepts_well_formed_messages() {
        let message = envelope(Body::Root(Root {
            label: "k1".to_string(),
            shards: 5,
            quorum: 3,
            tool: TOOL.to_string(),
        }));
        assert!(validate(&message).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_envelope() {
        let mut message = envelope(Body::Root(Root {
            label: "k1".to_string(),
            shards: 5,
            quorum: 3,
            tool: TOOL.to_string(),
        }));
        message.author = "not hex".to_string();
        assert!(validate(&message).is_err());

        let mut message = envelope(Body::Root(Root {
            label: "k1".to_string(),
            shards: 5,
            quorum: 3,
            tool: TOOL.to_string(),
        }));
        message.timestamp = 0;
        assert!(validate(&message).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_quorum() {
        let message = envelope(Body::Root(Root {
            label: "k1".to_string(),
            shards: 3,
            quorum: 5,
            tool: TOOL.to_string(),
        }));
        assert!(matches!(validate(&message), Err(Error::Validation(_))));

        let message = envelope(Body::Root(Root {
            label: "k1".to_string(),
            shards: 3,
            quorum: 0,
            tool: TOOL.to_string(),
        }));
        assert!(matches!(validate(&message), Err(Error::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_bad_references() {
        let message = envelope(Body::Shard(Shard {
            root: "tooshort".to_string(),
            name: None,
            shard: "deadbeef".to_string(),
            recipient: "ef".repeat(32),
        }));
        assert!(validate(&message).is_err());

        let message = envelope(Body::Reply(Reply {
            recipient: "ef".repeat(32),
            branch: "zz".repeat(32),
            root: "cd".repeat(32),
            shard: "deadbeef".to_string(),
        }));
        assert!(validate(&message).is_err());

        let message = envelope(Body::Request(Request {
            recipient: "ef".repeat(32),
            root: "cd".repeat(32),
            ephemeral_key: Some("short".to_string()),
        }));
        assert!(validate(&message).is_err());
    }

    #[test]
    fn test_kind_mapping_is_exhaustive() {
        let cases = [
            (
                Body::Root(Root {
                    label: String::new(),
                    shards: 1,
                    quorum: 1,
                    tool: TOOL.to_string(),
                }),
                Kind::Root,
            ),
            (
                Body::Shard(Shard {
                    root: String::new(),
                    name: None,
                    shard: String::new(),
                    recipient: String::new(),
                }),
                Kind::Shard,
            ),
            (
                Body::Request(Request {
                    recipient: String::new(),
                    root: String::new(),
                    ephemeral_key: None,
                }),
                Kind::Request,
            ),
            (
                Body::Reply(Reply {
                    recipient: String::new(),
                    branch: String::new(),
                    root: String::new(),
                    shard: String::new(),
                }),
                Kind::Reply,
            ),
            (
                Body::Forward(Forward {
                    root: String::new(),
                    shard: String::new(),
                    recipient: String::new(),
                }),
                Kind::Forward,
            ),
        ];
        for (body, kind) in cases {
            assert_eq!(body.kind(), kind);
        }
    }
}
