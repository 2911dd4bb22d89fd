use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

/// Length in bytes of a detached ed25519 signature prefixed to a signed share.
pub const SIGNATURE_LENGTH: usize = 64;

/// Version byte prefixed to a packed (label + secret) blob.
const PACK_VERSION: u8 = 0x01;

/// A member identity: an ed25519 signing keypair and the x25519 encryption
/// keypair derived from it.
///
/// The derived keypair means a member only ever publishes one public key (the
/// signing key); anyone holding it can compute the matching encryption key
/// via the Montgomery form. The member id is the hex-encoded signing public
/// key.
///
/// # Examples
///
/// ```rust
/// use custodia::crypto::Keypair;
///
/// let keypair = Keypair::generate();
/// assert_eq!(keypair.id().len(), 64);
/// ```
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generates a fresh signing keypair from the OS RNG.
    pub fn generate() -> Self {
        Keypair {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restores a keypair from the 32 secret bytes persisted by the config
    /// layer.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Keypair {
            signing: SigningKey::from_bytes(bytes),
        }
    }

    /// The 32 secret bytes of the signing key, for persistence.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// The member id: hex-encoded ed25519 public key.
    pub fn id(&self) -> String {
        hex::encode(self.signing.verifying_key().as_bytes())
    }

    /// The ed25519 public key used to verify shares signed by this member.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// The derived x25519 secret, used to open boxes addressed to this member.
    pub fn encryption_secret(&self) -> StaticSecret {
        StaticSecret::from(self.signing.to_scalar_bytes())
    }

    /// The derived x25519 public key other members seal boxes to.
    pub fn encryption_public(&self) -> PublicKey {
        PublicKey::from(self.signing.verifying_key().to_montgomery().to_bytes())
    }

    /// Signs a message with the signing key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair").field("id", &self.id()).finish()
    }
}

/// Parses a member id (hex ed25519 public key) into a verifying key.
pub fn verifying_key_of(id: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(id).map_err(|e| Error::Crypto(format!("bad member id: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Crypto("member id is not 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| Error::Crypto(format!("bad public key: {e}")))
}

/// Derives the x25519 encryption public key of a member from its id.
pub fn encryption_public_of(id: &str) -> Result<PublicKey> {
    let verifying = verifying_key_of(id)?;
    Ok(PublicKey::from(verifying.to_montgomery().to_bytes()))
}

/// Prepends a detached signature to a raw share.
///
/// The secret owner signs every share before distribution so that custodians
/// returning shares years later can be checked against the owner's key.
pub fn sign_share(share: &[u8], keypair: &Keypair) -> Vec<u8> {
    let signature = keypair.sign(share);
    let mut signed = signature.to_bytes().to_vec();
    signed.extend_from_slice(share);
    signed
}

/// Checks the signature on a signed share against the owner's public key.
///
/// # Returns
///
/// The raw share with the signature removed, or `None` when the signature
/// does not verify or the input is too short to carry one.
pub fn verify_share(signed: &[u8], owner: &VerifyingKey) -> Option<Vec<u8>> {
    if signed.len() < SIGNATURE_LENGTH {
        return None;
    }
    let (sig_bytes, share) = signed.split_at(SIGNATURE_LENGTH);
    let sig_bytes: [u8; SIGNATURE_LENGTH] = sig_bytes.try_into().ok()?;
    let signature = Signature::from_bytes(&sig_bytes);
    match owner.verify(share, &signature) {
        Ok(()) => Some(share.to_vec()),
        Err(_) => None,
    }
}

/// Drops the signature from a signed share without checking it.
///
/// This is the fallback form used when no verifying key is known; the result
/// is an *unverified* share and callers must surface that.
pub fn strip_signature(signed: &[u8]) -> Result<Vec<u8>> {
    if signed.len() < SIGNATURE_LENGTH {
        return Err(Error::Crypto("payload too short to carry a signature".to_string()));
    }
    Ok(signed[SIGNATURE_LENGTH..].to_vec())
}

/// Packs a label and a secret into one length-delimited blob.
///
/// The blob is what actually goes through the threshold scheme, so the label
/// survives reconstruction. Layout: version byte, big-endian u16 label
/// length, label bytes, secret bytes.
///
/// # Examples
///
/// ```rust
/// use custodia::crypto::{pack_label, unpack_label};
///
/// let blob = pack_label("k1", b"super secret").unwrap();
/// let (label, secret) = unpack_label(&blob).unwrap();
/// assert_eq!(label, "k1");
/// assert_eq!(secret, b"super secret");
/// ```
pub fn pack_label(label: &str, secret: &[u8]) -> Result<Vec<u8>> {
    if label.len() > u16::MAX as usize {
        return Err(Error::Validation("label longer than 65535 bytes".to_string()));
    }
    let mut blob = Vec::with_capacity(3 + label.len() + secret.len());
    blob.push(PACK_VERSION);
    blob.extend_from_slice(&(label.len() as u16).to_be_bytes());
    blob.extend_from_slice(label.as_bytes());
    blob.extend_from_slice(secret);
    Ok(blob)
}

/// Reverses [`pack_label`].
///
/// A blob reconstructed from too few shares "combines" numerically but is
/// garbage; the version byte, length field and UTF-8 check are what make
/// that garbage fail here instead of being returned as a secret.
pub fn unpack_label(blob: &[u8]) -> Result<(String, Vec<u8>)> {
    if blob.len() < 3 {
        return Err(Error::Unpack("blob shorter than header".to_string()));
    }
    if blob[0] != PACK_VERSION {
        return Err(Error::Unpack(format!("unknown pack version {:#04x}", blob[0])));
    }
    let label_len = u16::from_be_bytes([blob[1], blob[2]]) as usize;
    if blob.len() < 3 + label_len {
        return Err(Error::Unpack("label length overruns blob".to_string()));
    }
    let label = std::str::from_utf8(&blob[3..3 + label_len])
        .map_err(|_| Error::Unpack("label is not valid UTF-8".to_string()))?
        .to_string();
    Ok((label, blob[3 + label_len..].to_vec()))
}

/// Content hash of a canonically encoded message, hex-encoded.
///
/// This is the root id of a sharing session and the request id referenced by
/// a reply's `branch` field.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn derive_key(shared: &[u8], sender_pub: &PublicKey, recipient_pub: &PublicKey) -> Key {
    let mut hasher = Sha256::new();
    hasher.update(shared);
    hasher.update(sender_pub.as_bytes());
    hasher.update(recipient_pub.as_bytes());
    let digest = hasher.finalize();
    *Key::from_slice(&digest)
}

fn random_nonce() -> [u8; 12] {
    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Seals a payload to a single recipient without identifying the sender.
///
/// A fresh x25519 keypair is generated per box and its secret discarded, so
/// the recipient (or anyone else) cannot tell who produced the ciphertext.
/// Layout: ephemeral public key (32), nonce (12), AEAD ciphertext.
pub fn one_way_seal(plaintext: &[u8], recipient: &PublicKey) -> Result<Vec<u8>> {
    one_way_seal_with(plaintext, recipient, &[])
}

/// [`one_way_seal`] with associated data bound into the AEAD tag.
pub fn one_way_seal_with(plaintext: &[u8], recipient: &PublicKey, aad: &[u8]) -> Result<Vec<u8>> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_pub = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    let key = derive_key(shared.as_bytes(), &ephemeral_pub, recipient);
    let nonce = random_nonce();
    let cipher = ChaCha20Poly1305::new(&key);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|e| Error::Crypto(format!("one-way seal failed: {e}")))?;

    let mut sealed = ephemeral_pub.as_bytes().to_vec();
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Opens a one-way box with the recipient's encryption secret.
pub fn one_way_open(sealed: &[u8], secret: &StaticSecret) -> Result<Vec<u8>> {
    one_way_open_with(sealed, secret, &[])
}

/// [`one_way_open`] with associated data; must match what was sealed.
pub fn one_way_open_with(sealed: &[u8], secret: &StaticSecret, aad: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < 32 + 12 {
        return Err(Error::Crypto("one-way box too short".to_string()));
    }
    let ephemeral_pub = PublicKey::from(<[u8; 32]>::try_from(&sealed[..32]).unwrap());
    let nonce = &sealed[32..44];
    let ciphertext = &sealed[44..];

    let own_pub = PublicKey::from(secret);
    let shared = secret.diffie_hellman(&ephemeral_pub);
    let key = derive_key(shared.as_bytes(), &ephemeral_pub, &own_pub);
    let cipher = ChaCha20Poly1305::new(&key);
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| Error::Crypto("one-way box did not open".to_string()))
}

/// A multi-recipient authenticated box.
///
/// The payload is encrypted once under a random key; that key is then
/// wrapped per recipient against the sender's static encryption key, so any
/// listed recipient can open the envelope and knows which encryption key
/// sealed it. All binary fields are hex strings so the envelope survives a
/// JSON transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    /// Sender's x25519 public key, hex.
    pub sender: String,
    /// Payload nonce, hex.
    pub nonce: String,
    /// AEAD ciphertext of the payload, hex.
    pub ciphertext: String,
    /// One wrapped payload key per recipient.
    pub slots: Vec<KeySlot>,
}

/// One recipient's wrapped copy of the payload key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySlot {
    pub nonce: String,
    pub wrapped: String,
}

/// Seals a payload so that every listed recipient can open it.
///
/// # Arguments
///
/// * `plaintext` - The payload to protect.
/// * `sender` - The sender's static encryption secret.
/// * `recipients` - Encryption public keys allowed to open the envelope.
///   Callers that want to re-open their own envelopes must list themselves.
pub fn seal(
    plaintext: &[u8],
    sender: &StaticSecret,
    recipients: &[PublicKey],
) -> Result<SealedEnvelope> {
    let sender_pub = PublicKey::from(sender);

    let mut payload_key = [0u8; 32];
    OsRng.fill_bytes(&mut payload_key);
    let nonce = random_nonce();
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&payload_key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| Error::Crypto(format!("seal failed: {e}")))?;

    let mut slots = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        let shared = sender.diffie_hellman(recipient);
        let kek = derive_key(shared.as_bytes(), &sender_pub, recipient);
        let slot_nonce = random_nonce();
        let wrapped = ChaCha20Poly1305::new(&kek)
            .encrypt(Nonce::from_slice(&slot_nonce), payload_key.as_slice())
            .map_err(|e| Error::Crypto(format!("key wrap failed: {e}")))?;
        slots.push(KeySlot {
            nonce: hex::encode(slot_nonce),
            wrapped: hex::encode(wrapped),
        });
    }

    Ok(SealedEnvelope {
        sender: hex::encode(sender_pub.as_bytes()),
        nonce: hex::encode(nonce),
        ciphertext: hex::encode(ciphertext),
        slots,
    })
}

/// Attempts to open a multi-recipient envelope with the local secret.
///
/// # Returns
///
/// The plaintext when one of the key slots unwraps for us, `None` when the
/// envelope is not addressed to this key or is malformed. A `None` here is
/// the ordinary "not for me" outcome hit constantly while filtering the
/// shared log; it is deliberately not an error.
pub fn open(envelope: &SealedEnvelope, secret: &StaticSecret) -> Option<Vec<u8>> {
    let sender_bytes: [u8; 32] = hex::decode(&envelope.sender).ok()?.try_into().ok()?;
    let sender_pub = PublicKey::from(sender_bytes);
    let own_pub = PublicKey::from(secret);
    let shared = secret.diffie_hellman(&sender_pub);
    let kek = derive_key(shared.as_bytes(), &sender_pub, &own_pub);
    let cipher = ChaCha20Poly1305::new(&kek);

    let payload_key = envelope.slots.iter().find_map(|slot| {
        let slot_nonce = hex::decode(&slot.nonce).ok()?;
        let wrapped = hex::decode(&slot.wrapped).ok()?;
        if slot_nonce.len() != 12 {
            return None;
        }
        cipher.decrypt(Nonce::from_slice(&slot_nonce), wrapped.as_slice()).ok()
    })?;
    if payload_key.len() != 32 {
        return None;
    }

    let nonce = hex::decode(&envelope.nonce).ok()?;
    let ciphertext = hex::decode(&envelope.ciphertext).ok()?;
    if nonce.len() != 12 {
        return None;
    }
    ChaCha20Poly1305::new(Key::from_slice(&payload_key))
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .ok()
}
