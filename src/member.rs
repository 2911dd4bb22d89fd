use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::codec;
use crate::config::MemberConfig;
use crate::crypto::{self, Keypair};
use crate::error::{Error, Result};
use crate::log::MessageLog;
use crate::protocol::{self, Body, Kind, Message};
use crate::repository::{self, EphemeralKeyDaoTrait, EphemeralKeyManager, SessionKey};
use crate::sss::{self, Share};

/// The outcome of a successful reconstruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered {
    /// The reconstructed secret bytes.
    pub secret: Vec<u8>,
    /// The label packed with the secret at share time.
    pub label: String,
    /// Authors whose shares entered the pool without a verified signature.
    /// Only ever non-empty when the member opted into accepting them.
    pub unverified: Vec<String>,
}

/// One participant in the backup protocol.
///
/// A member is an immutable-after-construction context: its keypair and
/// policy knobs never change, and no operation keeps state between calls —
/// every invocation recomputes its view from a fresh log query. The only
/// externally-owned mutable dependency is the ephemeral key store.
///
/// # Examples
///
/// ```ignore
/// use std::sync::Arc;
/// use custodia::crypto::Keypair;
/// use custodia::log::MemoryMessageLog;
/// use custodia::member::Member;
/// use custodia::repository;
///
/// let log = Arc::new(MemoryMessageLog::new());
/// let owner = Member::new(Keypair::generate(), log, repository::dao(None)?);
/// let root = owner.share(b"secret", "k1", 5, 3, &custodians, None).await?;
/// ```
pub struct Member {
    keypair: Keypair,
    log: Arc<dyn MessageLog>,
    ephemeral_keys: EphemeralKeyManager,
    ephemeral: bool,
    accept_unverified: bool,
}

impl Member {
    /// Constructs a member with default policy: ephemeral request keys on,
    /// unverified shares rejected.
    pub fn new(
        keypair: Keypair,
        log: Arc<dyn MessageLog>,
        key_store: Arc<dyn EphemeralKeyDaoTrait>,
    ) -> Self {
        Member {
            keypair,
            log,
            ephemeral_keys: EphemeralKeyManager::new(key_store),
            ephemeral: true,
            accept_unverified: false,
        }
    }

    /// Constructs a member from an on-disk configuration.
    pub fn from_config(config: &MemberConfig, log: Arc<dyn MessageLog>) -> Result<Self> {
        let keypair = config
            .keypair()
            .map_err(|e| Error::Storage(e.to_string()))?;
        let key_store = repository::dao(config.key_store_path.as_deref())?;
        Ok(Member {
            keypair,
            log,
            ephemeral_keys: EphemeralKeyManager::new(key_store),
            ephemeral: config.ephemeral,
            accept_unverified: config.accept_unverified,
        })
    }

    /// Toggles attaching ephemeral public keys to outgoing requests.
    pub fn with_ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    /// Opts into admitting signature-stripped shares during reconstruction.
    ///
    /// Off by default: an unverifiable share is indistinguishable from a
    /// forged one, so accepting it hands any forwarder a slot in the quorum.
    pub fn with_accept_unverified(mut self, accept: bool) -> Self {
        self.accept_unverified = accept;
        self
    }

    /// This member's id: the hex-encoded signing public key.
    pub fn id(&self) -> String {
        self.keypair.id()
    }

    /// Type-filtered, decrypt-on-read view over the shared log.
    ///
    /// Each call is a fresh pass over a fresh `query()` snapshot — nothing
    /// is memoized between calls. Entries that do not decrypt for this
    /// member or whose kind is not in `kinds` are dropped silently.
    pub async fn messages_by_type(&self, kinds: &[Kind]) -> Result<Vec<Message>> {
        let entries = self.log.query().await?;
        Ok(entries
            .iter()
            .filter_map(|entry| codec::open_and_decode(entry, &self.keypair))
            .filter(|message| kinds.contains(&message.body.kind()))
            .collect())
    }

    /// Whether a message was authored by this member.
    pub fn owned(&self, message: &Message) -> bool {
        message.author == self.id()
    }

    /// Splits a secret and publishes one sharing session: a Root message
    /// sealed to self and one Shard message sealed per custodian.
    ///
    /// Each raw share is signed with this member's signing key and one-way
    /// boxed to its custodian before it is embedded, so a custodian can
    /// open its own share but cannot tell who else holds one.
    ///
    /// The custodian list pairs positionally with the shares: it must have
    /// exactly `shards` entries and no duplicates. Every message is
    /// validated and sealed before the first publish, so a validation
    /// failure publishes nothing; the N+1 publishes themselves carry no
    /// atomicity guarantee, and the returned root id (the content hash of
    /// the Root message) is the caller's idempotency key for retries.
    ///
    /// # Arguments
    ///
    /// * `secret` - The bytes to protect.
    /// * `label` - Human-readable name packed alongside the secret.
    /// * `shards` - Total number of shares to produce.
    /// * `quorum` - Minimum number of shares needed to reconstruct.
    /// * `custodians` - Member ids entrusted with one share each.
    /// * `name` - Optional display name embedded in every Shard message.
    ///
    /// # Returns
    ///
    /// The root id of the new session.
    pub async fn share(
        &self,
        secret: &[u8],
        label: &str,
        shards: usize,
        quorum: usize,
        custodians: &[String],
        name: Option<&str>,
    ) -> Result<String> {
        if custodians.len() != shards {
            return Err(Error::Validation(format!(
                "custodian list has {} entries for {} shards",
                custodians.len(),
                shards
            )));
        }
        let mut distinct = HashSet::new();
        for custodian in custodians {
            if !distinct.insert(custodian.as_str()) {
                return Err(Error::Validation(format!(
                    "custodian {custodian} listed more than once"
                )));
            }
        }

        let blob = crypto::pack_label(label, secret)?;
        let raw_shares = sss::split(&blob, shards, quorum)?;

        // Sign and one-way box share i to custodian i.
        let mut boxed_shares = Vec::with_capacity(shards);
        for (share, custodian) in raw_shares.iter().zip(custodians) {
            let signed = crypto::sign_share(&share.to_bytes(), &self.keypair);
            let recipient = crypto::encryption_public_of(custodian)?;
            boxed_shares.push(hex::encode(crypto::one_way_seal(&signed, &recipient)?));
        }

        let root = codec::build(
            &self.keypair,
            Body::Root(protocol::Root {
                label: label.to_string(),
                shards: shards as u8,
                quorum: quorum as u8,
                tool: protocol::TOOL.to_string(),
            }),
        );
        let root_id = codec::id(&root)?;

        // Seal the whole batch before publishing any of it, so a validation
        // or crypto failure aborts with nothing on the log.
        let mut sealed = Vec::with_capacity(shards + 1);
        sealed.push(codec::encode_and_seal(&root, &self.keypair, &[])?);
        for (boxed, custodian) in boxed_shares.into_iter().zip(custodians) {
            let shard = codec::build(
                &self.keypair,
                Body::Shard(protocol::Shard {
                    root: root_id.clone(),
                    name: name.map(str::to_string),
                    shard: boxed,
                    recipient: custodian.clone(),
                }),
            );
            let recipient = crypto::encryption_public_of(custodian)?;
            sealed.push(codec::encode_and_seal(&shard, &self.keypair, &[recipient])?);
        }

        let mut entries = sealed.into_iter();
        let root_entry = entries.next().expect("batch always holds the root");
        self.log.publish(root_entry).await?;
        let publishes = entries.map(|entry| self.log.publish(entry));
        for result in futures::future::join_all(publishes).await {
            result?;
        }

        info!("🔐 Shared {:?} as {} shards (quorum {})", label, shards, quorum);
        Ok(root_id)
    }

    /// Solicits shares back for a session this member created.
    ///
    /// Enumerates the Shard messages this member authored for `root` — the
    /// distribution list — and publishes one Request per custodian,
    /// optionally restricted to a single recipient. With ephemeral mode on,
    /// each request carries a freshly stored one-time public key for the
    /// custodian to layer its reply under.
    ///
    /// # Returns
    ///
    /// The number of requests published; 0 is a valid result, not an error.
    pub async fn request(&self, root: &str, single_recipient: Option<&str>) -> Result<usize> {
        let shards = self.messages_by_type(&[Kind::Shard]).await?;

        let mut count = 0;
        for message in shards.iter().filter(|m| self.owned(m)) {
            let Body::Shard(shard) = &message.body else {
                continue;
            };
            if shard.root != root {
                continue;
            }
            if let Some(only) = single_recipient {
                if shard.recipient != only {
                    continue;
                }
            }

            let ephemeral_key = if self.ephemeral {
                let session = SessionKey::new(root, &shard.recipient);
                Some(self.ephemeral_keys.generate_and_store(&session)?)
            } else {
                None
            };

            let request = codec::build(
                &self.keypair,
                Body::Request(protocol::Request {
                    recipient: shard.recipient.clone(),
                    root: root.to_string(),
                    ephemeral_key,
                }),
            );
            let recipient = crypto::encryption_public_of(&shard.recipient)?;
            let sealed = codec::encode_and_seal(&request, &self.keypair, &[recipient])?;
            self.log.publish(sealed).await?;
            count += 1;
        }

        debug!("-- published {} requests for root {}", count, root);
        Ok(count)
    }

    /// Answers every pending request addressed to this member.
    ///
    /// A request is pending when it was authored by someone else, names this
    /// member as recipient, and no Reply from this member with
    /// `branch == id(request)` exists yet — re-running `reply()` over the
    /// same log publishes nothing new. When the request carries an ephemeral
    /// public key, the share is wrapped under it before it is embedded.
    ///
    /// Requests for roots this member holds no shard of are skipped, not
    /// errors: the log is shared and not every session involves us.
    ///
    /// # Returns
    ///
    /// The number of replies published.
    pub async fn reply(&self) -> Result<usize> {
        let messages = self.messages_by_type(&[Kind::Request, Kind::Reply]).await?;

        let answered: HashSet<&str> = messages
            .iter()
            .filter(|m| self.owned(m))
            .filter_map(|m| match &m.body {
                Body::Reply(reply) => Some(reply.branch.as_str()),
                _ => None,
            })
            .collect();

        let mut count = 0;
        for message in &messages {
            let Body::Request(request) = &message.body else {
                continue;
            };
            if self.owned(message) || request.recipient != self.id() {
                continue;
            }
            let request_id = codec::id(message)?;
            if answered.contains(request_id.as_str()) {
                debug!("-- request {} already answered", request_id);
                continue;
            }

            let share = match self.get_shard(&request.root).await {
                Ok(share) => share,
                Err(Error::NotFound(_)) => {
                    debug!("-- no shard held for root {}, skipping", request.root);
                    continue;
                }
                Err(err) => return Err(err),
            };

            let payload = match &request.ephemeral_key {
                Some(key) => EphemeralKeyManager::wrap(&share, key, &request.root)?,
                None => share,
            };

            let reply = codec::build(
                &self.keypair,
                Body::Reply(protocol::Reply {
                    recipient: message.author.clone(),
                    branch: request_id,
                    root: request.root.clone(),
                    shard: hex::encode(payload),
                }),
            );
            let recipient = crypto::encryption_public_of(&message.author)?;
            let sealed = codec::encode_and_seal(&reply, &self.keypair, &[recipient])?;
            self.log.publish(sealed).await?;
            count += 1;
        }

        if count > 0 {
            info!("💡 Answered {} share requests", count);
        }
        Ok(count)
    }

    /// Proactively hands this member's share of `root` to another member,
    /// bypassing the request/reply round trip. No ephemeral layer is
    /// applied; the share travels signed, sealed only by the envelope.
    pub async fn forward(&self, root: &str, recipient: &str) -> Result<()> {
        let share = self.get_shard(root).await?;

        let forward = codec::build(
            &self.keypair,
            Body::Forward(protocol::Forward {
                root: root.to_string(),
                shard: hex::encode(share),
                recipient: recipient.to_string(),
            }),
        );
        let recipient_key = crypto::encryption_public_of(recipient)?;
        let sealed = codec::encode_and_seal(&forward, &self.keypair, &[recipient_key])?;
        self.log.publish(sealed).await?;

        info!("🤝 Forwarded shard for root {} to {}", root, recipient);
        Ok(())
    }

    /// Locates and decrypts this member's own share for a session.
    ///
    /// Scans the Shard messages visible to this member and tries the inner
    /// one-way box of each with the local encryption secret; the first one
    /// that opens is ours. The result is the signed share as distributed.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` when no shard for `root` opens with this key.
    pub async fn get_shard(&self, root: &str) -> Result<Vec<u8>> {
        let shards = self.messages_by_type(&[Kind::Shard]).await?;

        for message in &shards {
            let Body::Shard(shard) = &message.body else {
                continue;
            };
            if shard.root != root {
                continue;
            }
            let Ok(boxed) = hex::decode(&shard.shard) else {
                continue;
            };
            if let Ok(share) = crypto::one_way_open(&boxed, &self.keypair.encryption_secret()) {
                return Ok(share);
            }
        }

        Err(Error::NotFound(format!("no shard for root {root} opens with this key")))
    }

    /// Reconstructs a secret from the Reply and Forward messages visible
    /// for `root`.
    ///
    /// Replies are verified against this member's own signing key (the
    /// member that requested is the owner that signed); forwards are
    /// verified against `secret_owner` when given. A share whose signature
    /// cannot be checked is rejected unless the member opted into
    /// `with_accept_unverified`, in which case it is admitted
    /// signature-stripped and its author is reported in
    /// [`Recovered::unverified`].
    ///
    /// # Errors
    ///
    /// * `Error::NotFound` - no candidate resolved to a share at all.
    /// * `Error::InsufficientShares` - fewer usable shares than the quorum.
    /// * `Error::Unpack` - enough shares combined but the blob is garbage
    ///   (e.g. forged shares made it into the pool).
    pub async fn combine(&self, root: &str, secret_owner: Option<&str>) -> Result<Recovered> {
        let owner_key = secret_owner.map(crypto::verifying_key_of).transpose()?;
        let own_key = self.keypair.verifying_key();

        // Collecting: every reply or forward for this root we can open.
        let candidates = self.messages_by_type(&[Kind::Reply, Kind::Forward]).await?;

        // Verifying: unlayer, then accept, fall back, or reject per share.
        let mut shares: Vec<Share> = Vec::new();
        let mut seen_indexes: HashSet<u8> = HashSet::new();
        let mut unverified: Vec<String> = Vec::new();
        for message in &candidates {
            let (shard_hex, verifying_key) = match &message.body {
                Body::Reply(reply) if reply.root == root => (&reply.shard, Some(&own_key)),
                Body::Forward(forward) if forward.root == root => {
                    (&forward.shard, owner_key.as_ref())
                }
                _ => continue,
            };

            let Ok(mut payload) = hex::decode(shard_hex) else {
                continue;
            };
            if EphemeralKeyManager::is_layered(&payload) {
                let session = SessionKey::new(root, &message.author);
                payload = match self.ephemeral_keys.unwrap(&session, &payload, root) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!("⚠️ Cannot unlayer share from {}: {}", message.author, err);
                        continue;
                    }
                };
            }

            let resolved = match verifying_key.and_then(|key| crypto::verify_share(&payload, key)) {
                Some(share) => Some(share),
                None if self.accept_unverified => {
                    let stripped = crypto::strip_signature(&payload).ok();
                    if stripped.is_some() {
                        warn!("⚠️ Accepting unverified share from {}", message.author);
                        unverified.push(message.author.clone());
                    }
                    stripped
                }
                None => {
                    warn!("⚠️ Rejecting unverifiable share from {}", message.author);
                    None
                }
            };

            let Some(bytes) = resolved else { continue };
            let Ok(share) = Share::from_bytes(&bytes) else {
                continue;
            };
            if seen_indexes.insert(share.index) {
                shares.push(share);
            }
        }

        if shares.is_empty() {
            return Err(Error::NotFound(format!(
                "no usable reply or forward shares for root {root}"
            )));
        }

        // Reconstructing: threshold combine, then unpack label and secret.
        let blob = sss::combine(&shares)?;
        let (label, secret) = crypto::unpack_label(&blob)?;

        info!("🔓 Recovered {:?} from {} shares", label, shares.len());
        Ok(Recovered {
            secret,
            label,
            unverified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryMessageLog;
    use crate::repository::HashMapEphemeralKeyDao;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    fn member(log: &MemoryMessageLog) -> Member {
        Member::new(
            Keypair::generate(),
            Arc::new(log.clone()),
            Arc::new(HashMapEphemeralKeyDao::default()),
        )
    }

    /// One owner and `n` custodians over a shared in-memory log.
    fn network(n: usize) -> (MemoryMessageLog, Member, Vec<Member>) {
        let log = MemoryMessageLog::new();
        let owner = member(&log);
        let custodians = (0..n).map(|_| member(&log)).collect();
        (log, owner, custodians)
    }

    fn ids(members: &[Member]) -> Vec<String> {
        members.iter().map(|m| m.id()).collect()
    }

    fn random_secret() -> Vec<u8> {
        use rand::RngCore;
        let mut secret = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        secret
    }

    #[tokio::test]
    async fn test_share_publishes_root_and_shards() {
        let (log, owner, custodians) = network(5);

        let root = owner
            .share(&random_secret(), "k1", 5, 3, &ids(&custodians), None)
            .await
            .unwrap();

        assert_eq!(root.len(), 64);
        assert_eq!(log.len(), 6); // 1 root + 5 shards

        // The owner sees its root and all five shard messages.
        assert_eq!(owner.messages_by_type(&[Kind::Root]).await.unwrap().len(), 1);
        assert_eq!(owner.messages_by_type(&[Kind::Shard]).await.unwrap().len(), 5);
        // Each custodian sees exactly its own shard.
        for custodian in &custodians {
            let shards = custodian.messages_by_type(&[Kind::Shard]).await.unwrap();
            assert_eq!(shards.len(), 1);
            let Body::Shard(shard) = &shards[0].body else {
                panic!("wrong body");
            };
            assert_eq!(shard.recipient, custodian.id());
        }
    }

    #[tokio::test]
    async fn test_share_rejects_malformed_custodian_lists() {
        let (log, owner, custodians) = network(3);

        // Wrong length.
        let result = owner
            .share(b"secret", "k1", 5, 3, &ids(&custodians), None)
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));

        // Duplicate entry.
        let mut dupes = ids(&custodians);
        dupes.push(dupes[0].clone());
        dupes.push(dupes[1].clone());
        let result = owner.share(b"secret", "k1", 5, 3, &dupes, None).await;
        assert!(matches!(result, Err(Error::Validation(_))));

        // Nothing reached the log either way.
        assert_eq!(log.len(), 0);
    }

    #[tokio::test]
    async fn test_full_recovery_roundtrip() {
        init_tracing();
        let (log, owner, custodians) = network(5);
        let secret = random_secret();

        let root = owner
            .share(&secret, "k1", 5, 3, &ids(&custodians), None)
            .await
            .unwrap();
        assert_eq!(log.len(), 6);

        let requested = owner.request(&root, None).await.unwrap();
        assert_eq!(requested, 5);

        for custodian in &custodians {
            assert_eq!(custodian.reply().await.unwrap(), 1);
        }

        let recovered = owner.combine(&root, None).await.unwrap();
        assert_eq!(recovered.secret, secret);
        assert_eq!(recovered.label, "k1");
        assert!(recovered.unverified.is_empty());
    }

    #[tokio::test]
    async fn test_combine_with_exact_quorum_of_replies() {
        let (_log, owner, custodians) = network(5);
        let secret = random_secret();

        let root = owner
            .share(&secret, "k1", 5, 3, &ids(&custodians), None)
            .await
            .unwrap();

        // Only solicit three of the five custodians.
        for custodian in custodians.iter().take(3) {
            let count = owner.request(&root, Some(&custodian.id())).await.unwrap();
            assert_eq!(count, 1);
        }
        for custodian in &custodians {
            custodian.reply().await.unwrap();
        }

        let recovered = owner.combine(&root, None).await.unwrap();
        assert_eq!(recovered.secret, secret);
        assert_eq!(recovered.label, "k1");
    }

    #[tokio::test]
    async fn test_combine_below_quorum_fails() {
        let (_log, owner, custodians) = network(5);

        let root = owner
            .share(&random_secret(), "k1", 5, 3, &ids(&custodians), None)
            .await
            .unwrap();

        for custodian in custodians.iter().take(2) {
            owner.request(&root, Some(&custodian.id())).await.unwrap();
            custodian.reply().await.unwrap();
        }

        let result = owner.combine(&root, None).await;
        assert!(matches!(
            result,
            Err(Error::InsufficientShares { have: 2, need: 3 })
        ));
    }

    #[tokio::test]
    async fn test_reply_is_idempotent() {
        let (_log, owner, custodians) = network(3);

        let root = owner
            .share(&random_secret(), "k1", 3, 2, &ids(&custodians), None)
            .await
            .unwrap();
        owner.request(&root, None).await.unwrap();

        for custodian in &custodians {
            assert_eq!(custodian.reply().await.unwrap(), 1);
            // Second pass over the same pending set publishes nothing.
            assert_eq!(custodian.reply().await.unwrap(), 0);
        }

        let replies = owner.messages_by_type(&[Kind::Reply]).await.unwrap();
        assert_eq!(replies.len(), 3);
    }

    #[tokio::test]
    async fn test_request_returns_zero_for_unknown_root() {
        let (_log, owner, _custodians) = network(3);
        let count = owner.request(&"00".repeat(32), None).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_get_shard_not_found_for_outsider() {
        let (log, owner, custodians) = network(3);
        let stranger = member(&log);

        let root = owner
            .share(&random_secret(), "k1", 3, 2, &ids(&custodians), None)
            .await
            .unwrap();

        // Custodians hold a shard; the stranger and the owner do not.
        assert!(custodians[0].get_shard(&root).await.is_ok());
        assert!(matches!(
            stranger.get_shard(&root).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(owner.get_shard(&root).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_forwards_verify_against_named_owner() {
        let (_log, owner, custodians) = network(5);
        let secret = random_secret();

        let root = owner
            .share(&secret, "backup", 5, 3, &ids(&custodians), None)
            .await
            .unwrap();

        for custodian in custodians.iter().take(3) {
            custodian.forward(&root, &owner.id()).await.unwrap();
        }

        let recovered = owner.combine(&root, Some(&owner.id())).await.unwrap();
        assert_eq!(recovered.secret, secret);
        assert_eq!(recovered.label, "backup");
        assert!(recovered.unverified.is_empty());
    }

    #[tokio::test]
    async fn test_unverified_forwards_rejected_by_default() {
        let (log, owner, custodians) = network(3);

        let root = owner
            .share(&random_secret(), "k1", 3, 2, &ids(&custodians), None)
            .await
            .unwrap();

        for custodian in &custodians {
            custodian.forward(&root, &owner.id()).await.unwrap();
        }

        // Without a named owner no forward can be verified, and the default
        // policy refuses to guess: nothing usable remains.
        let result = owner.combine(&root, None).await;
        assert!(matches!(result, Err(Error::NotFound(_))));

        // An explicit opt-in admits them, stripped and flagged.
        let opted_in = Member {
            keypair: owner.keypair.clone(),
            log: Arc::new(log.clone()),
            ephemeral_keys: owner.ephemeral_keys.clone(),
            ephemeral: true,
            accept_unverified: true,
        };
        let recovered = opted_in.combine(&root, None).await.unwrap();
        assert_eq!(recovered.label, "k1");
        assert_eq!(recovered.unverified.len(), 3);
    }

    #[tokio::test]
    async fn test_garbage_reply_does_not_corrupt_recovery() {
        let (_log, owner, custodians) = network(5);
        let secret = random_secret();

        let root = owner
            .share(&secret, "k1", 5, 3, &ids(&custodians), None)
            .await
            .unwrap();
        owner.request(&root, None).await.unwrap();
        for custodian in custodians.iter().take(3) {
            custodian.reply().await.unwrap();
        }

        // A malicious custodian answers a request with random bytes instead
        // of its share. The signature check excludes it.
        let rogue = &custodians[4];
        let requests = rogue.messages_by_type(&[Kind::Request]).await.unwrap();
        let fake = codec::build(
            &rogue.keypair,
            Body::Reply(protocol::Reply {
                recipient: owner.id(),
                branch: codec::id(&requests[0]).unwrap(),
                root: root.clone(),
                shard: hex::encode(random_secret()),
            }),
        );
        let sealed = codec::encode_and_seal(
            &fake,
            &rogue.keypair,
            &[crypto::encryption_public_of(&owner.id()).unwrap()],
        )
        .unwrap();
        rogue.log.publish(sealed).await.unwrap();

        let recovered = owner.combine(&root, None).await.unwrap();
        assert_eq!(recovered.secret, secret);
        assert!(recovered.unverified.is_empty());
    }

    #[tokio::test]
    async fn test_replies_carry_ephemeral_layer() {
        let (_log, owner, custodians) = network(2);

        let root = owner
            .share(&random_secret(), "k1", 2, 2, &ids(&custodians), None)
            .await
            .unwrap();
        owner.request(&root, None).await.unwrap();
        for custodian in &custodians {
            custodian.reply().await.unwrap();
        }

        for message in owner.messages_by_type(&[Kind::Reply]).await.unwrap() {
            let Body::Reply(reply) = &message.body else {
                panic!("wrong body");
            };
            let payload = hex::decode(&reply.shard).unwrap();
            assert!(EphemeralKeyManager::is_layered(&payload));
        }

        // The layered share still reconstructs for the requester, who holds
        // the stored ephemeral secrets.
        assert!(owner.combine(&root, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_plain_replies_without_ephemeral_mode() {
        let log = MemoryMessageLog::new();
        let owner = member(&log).with_ephemeral(false);
        let custodians: Vec<Member> = (0..2).map(|_| member(&log)).collect();
        let secret = random_secret();

        let root = owner
            .share(&secret, "k1", 2, 2, &ids(&custodians), None)
            .await
            .unwrap();
        owner.request(&root, None).await.unwrap();
        for custodian in &custodians {
            custodian.reply().await.unwrap();
        }

        for message in owner.messages_by_type(&[Kind::Reply]).await.unwrap() {
            let Body::Reply(reply) = &message.body else {
                panic!("wrong body");
            };
            let payload = hex::decode(&reply.shard).unwrap();
            assert!(!EphemeralKeyManager::is_layered(&payload));
        }

        let recovered = owner.combine(&root, None).await.unwrap();
        assert_eq!(recovered.secret, secret);
    }

    #[tokio::test]
    async fn test_type_and_ownership_filtering() {
        let (_log, owner, custodians) = network(3);

        let root = owner
            .share(&random_secret(), "k1", 3, 2, &ids(&custodians), None)
            .await
            .unwrap();
        owner.request(&root, None).await.unwrap();

        // Type filters never surface another kind.
        for message in owner.messages_by_type(&[Kind::Root]).await.unwrap() {
            assert_eq!(message.body.kind(), Kind::Root);
        }

        // Custodians author no shards, so their owned-shard view is empty
        // and a request() from them publishes nothing.
        let custodian = &custodians[0];
        let owned_shards: Vec<Message> = custodian
            .messages_by_type(&[Kind::Shard])
            .await
            .unwrap()
            .into_iter()
            .filter(|m| custodian.owned(m))
            .collect();
        assert!(owned_shards.is_empty());
        assert_eq!(custodian.request(&root, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shares_with_name_annotation() {
        let (_log, owner, custodians) = network(2);

        let root = owner
            .share(&random_secret(), "k1", 2, 2, &ids(&custodians), Some("backup of k1"))
            .await
            .unwrap();

        let shards = custodians[0].messages_by_type(&[Kind::Shard]).await.unwrap();
        let Body::Shard(shard) = &shards[0].body else {
            panic!("wrong body");
        };
        assert_eq!(shard.root, root);
        assert_eq!(shard.name.as_deref(), Some("backup of k1"));
    }
}
