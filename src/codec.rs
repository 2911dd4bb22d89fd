use std::time::{SystemTime, UNIX_EPOCH};

use x25519_dalek::PublicKey;

use crate::crypto::{self, Keypair, SealedEnvelope};
use crate::error::Result;
use crate::protocol::{self, Body, Message};

/// Milliseconds since the epoch, for the envelope timestamp.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Builds a message: stamps author, version and creation time around the
/// given body.
pub fn build(keypair: &Keypair, body: Body) -> Message {
    Message {
        author: keypair.id(),
        version: protocol::VERSION.to_string(),
        timestamp: now_millis(),
        body,
    }
}

/// Canonical encoding of a message.
///
/// `serde_json` writes struct fields in declaration order, so the encoding
/// is deterministic and safe to hash.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Content hash of the canonical encoding, hex.
///
/// This id is the session key for a root message and the `branch` value a
/// reply uses to claim its request.
pub fn id(message: &Message) -> Result<String> {
    Ok(crypto::content_hash(&encode(message)?))
}

/// Validates, encodes and seals a message for a recipient set.
///
/// This is the only way a message reaches the log, so the schema check runs
/// here as the final gate: an invalid message aborts with
/// `Error::Validation` and nothing is sealed. The author is always appended
/// to the recipient set so it can re-open its own messages later.
///
/// # Arguments
///
/// * `message` - The message to publish.
/// * `keypair` - The author's identity.
/// * `recipients` - Encryption keys of the intended readers.
pub fn encode_and_seal(
    message: &Message,
    keypair: &Keypair,
    recipients: &[PublicKey],
) -> Result<Vec<u8>> {
    protocol::validate(message)?;

    let mut readers = recipients.to_vec();
    let own = keypair.encryption_public();
    if !readers.contains(&own) {
        readers.push(own);
    }

    let envelope = crypto::seal(&encode(message)?, &keypair.encryption_secret(), &readers)?;
    Ok(serde_json::to_vec(&envelope)?)
}

/// Attempts to open a sealed log entry and decode the message inside.
///
/// # Returns
///
/// `None` when the entry is not addressed to this member, is malformed, or
/// decodes to a message that fails the schema check. All of these are the
/// expected non-fatal outcome of scanning a shared log and are dropped
/// silently; they are distinct from a `Validation` failure on the publish
/// path, which aborts the operation.
pub fn open_and_decode(sealed: &[u8], keypair: &Keypair) -> Option<Message> {
    let envelope: SealedEnvelope = serde_json::from_slice(sealed).ok()?;
    let plaintext = crypto::open(&envelope, &keypair.encryption_secret())?;
    let message: Message = serde_json::from_slice(&plaintext).ok()?;
    protocol::validate(&message).ok()?;
    Some(message)
}
