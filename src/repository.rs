use sled::Db;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto;
use crate::error::{Error, Result};

/// Tag prefixed to a payload that carries the removable ephemeral layer.
const LAYER_TAG: &[u8; 4] = b"elay";

/// Identifies one stored ephemeral keypair: the session it belongs to and
/// the custodian the matching request was sent to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Root id of the sharing session being recovered.
    pub root: String,
    /// Member id of the custodian the request went to.
    pub recipient: String,
}

impl SessionKey {
    pub fn new(root: impl Into<String>, recipient: impl Into<String>) -> Self {
        SessionKey {
            root: root.into(),
            recipient: recipient.into(),
        }
    }

    fn storage_key(&self) -> String {
        format!("{}:{}", self.root, self.recipient)
    }
}

/// Defines the Data Access Object (DAO) trait for stored ephemeral secrets.
///
/// This trait specifies the methods for inserting, retrieving, and deleting
/// ephemeral key material in a data store. The secrets are persisted because
/// the reply that consumes them may arrive in a later process lifetime.
pub trait EphemeralKeyDaoTrait: Send + Sync {
    /// Inserts an ephemeral secret under its session key.
    fn insert(&self, key: &SessionKey, secret: &[u8; 32]) -> Result<()>;

    /// Retrieves an ephemeral secret by its session key.
    ///
    /// # Returns
    ///
    /// A `Result` containing an `Option`. `None` if no keypair was ever
    /// generated for this session key.
    fn get(&self, key: &SessionKey) -> Result<Option<[u8; 32]>>;

    /// Deletes an ephemeral secret by its session key.
    fn delete(&self, key: &SessionKey) -> Result<()>;
}

/// An `EphemeralKeyDaoTrait` implementation using Sled, an embedded database.
pub struct SledEphemeralKeyDao {
    db: Db,
}

impl SledEphemeralKeyDao {
    /// Opens (or creates) the sled database at the given path.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// use custodia::repository::SledEphemeralKeyDao;
    ///
    /// let dao = SledEphemeralKeyDao::new("path/to/db").unwrap();
    /// ```
    pub fn new(db_path: &str) -> Result<Self> {
        let db = sled::open(db_path)?;
        Ok(SledEphemeralKeyDao { db })
    }
}

impl EphemeralKeyDaoTrait for SledEphemeralKeyDao {
    fn insert(&self, key: &SessionKey, secret: &[u8; 32]) -> Result<()> {
        self.db.insert(key.storage_key().as_bytes(), &secret[..])?;
        Ok(())
    }

    fn get(&self, key: &SessionKey) -> Result<Option<[u8; 32]>> {
        match self.db.get(key.storage_key().as_bytes())? {
            Some(found) => {
                let secret: [u8; 32] = found
                    .as_ref()
                    .try_into()
                    .map_err(|_| Error::Storage("stored ephemeral secret is not 32 bytes".to_string()))?;
                Ok(Some(secret))
            }
            None => Ok(None),
        }
    }

    fn delete(&self, key: &SessionKey) -> Result<()> {
        self.db.remove(key.storage_key().as_bytes())?;
        Ok(())
    }
}

/// An in-memory `EphemeralKeyDaoTrait` implementation backed by a HashMap.
pub struct HashMapEphemeralKeyDao {
    pub map: Mutex<HashMap<String, [u8; 32]>>,
}

impl Default for HashMapEphemeralKeyDao {
    fn default() -> Self {
        HashMapEphemeralKeyDao {
            map: Mutex::new(HashMap::new()),
        }
    }
}

impl EphemeralKeyDaoTrait for HashMapEphemeralKeyDao {
    fn insert(&self, key: &SessionKey, secret: &[u8; 32]) -> Result<()> {
        let mut map = self.map.lock().unwrap();
        map.insert(key.storage_key(), *secret);
        Ok(())
    }

    fn get(&self, key: &SessionKey) -> Result<Option<[u8; 32]>> {
        let map = self.map.lock().unwrap();
        Ok(map.get(&key.storage_key()).copied())
    }

    fn delete(&self, key: &SessionKey) -> Result<()> {
        let mut map = self.map.lock().unwrap();
        map.remove(&key.storage_key());
        Ok(())
    }
}

/// Creates and returns a DAO instance based on the specified database path.
///
/// If a path is provided, a Sled database DAO is created; otherwise an
/// in-memory HashMap DAO is used.
pub fn dao(db_path: Option<&str>) -> Result<Arc<dyn EphemeralKeyDaoTrait>> {
    let dao: Arc<dyn EphemeralKeyDaoTrait> = if let Some(path) = db_path {
        tracing::debug!("Using Sled ephemeral key store");
        Arc::new(SledEphemeralKeyDao::new(path)?)
    } else {
        tracing::debug!("Using HashMap ephemeral key store");
        Arc::new(HashMapEphemeralKeyDao::default())
    };
    Ok(dao)
}

/// Manages one-time keypairs layered onto request/reply exchanges.
///
/// When a member requests its shares back, it can attach a fresh public key
/// to each request; the custodian wraps its share under that key before
/// embedding it in the reply. The matching secret lives in the DAO, keyed by
/// `(root, recipient)`, until the reply comes home and is unwrapped. Entries
/// are not actively expired.
#[derive(Clone)]
pub struct EphemeralKeyManager {
    dao: Arc<dyn EphemeralKeyDaoTrait>,
}

impl EphemeralKeyManager {
    pub fn new(dao: Arc<dyn EphemeralKeyDaoTrait>) -> Self {
        EphemeralKeyManager { dao }
    }

    /// Generates a keypair, persists its secret under the session key, and
    /// returns the hex public key to embed in the outgoing request.
    pub fn generate_and_store(&self, key: &SessionKey) -> Result<String> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        self.dao.insert(key, &secret.to_bytes())?;
        Ok(hex::encode(public.as_bytes()))
    }

    /// Whether a payload carries the ephemeral layer.
    pub fn is_layered(bytes: &[u8]) -> bool {
        bytes.len() > LAYER_TAG.len() && &bytes[..LAYER_TAG.len()] == LAYER_TAG
    }

    /// Applies the layer: seals a payload under the given ephemeral public
    /// key, binding `context` into the AEAD tag.
    pub fn wrap(plaintext: &[u8], public_key: &str, context: &str) -> Result<Vec<u8>> {
        let bytes = hex::decode(public_key)
            .map_err(|e| Error::Crypto(format!("bad ephemeral public key: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Crypto("ephemeral public key is not 32 bytes".to_string()))?;
        let mut wrapped = LAYER_TAG.to_vec();
        wrapped.extend(crypto::one_way_seal_with(
            plaintext,
            &PublicKey::from(bytes),
            context.as_bytes(),
        )?);
        Ok(wrapped)
    }

    /// Removes the layer using the secret stored under the session key.
    ///
    /// # Errors
    ///
    /// `Error::Crypto` when no stored keypair matches the session key, the
    /// payload carries no layer, or the context does not match.
    pub fn unwrap(&self, key: &SessionKey, bytes: &[u8], context: &str) -> Result<Vec<u8>> {
        if !Self::is_layered(bytes) {
            return Err(Error::Crypto("payload carries no ephemeral layer".to_string()));
        }
        let secret = self
            .dao
            .get(key)?
            .ok_or_else(|| Error::Crypto(format!("no ephemeral key stored for session {}:{}", key.root, key.recipient)))?;
        crypto::one_way_open_with(
            &bytes[LAYER_TAG.len()..],
            &StaticSecret::from(secret),
            context.as_bytes(),
        )
    }
}
