//! # Social threshold secret backup
//!
//! This library implements social backup of secrets among trusted custodians.
//! A secret owner splits a sensitive value into encrypted, signed shares using
//! a threshold scheme, hands one share to each custodian through a shared
//! append-only message log, and later reconstructs the secret once enough
//! custodians return their shares.
//!
//! ## Shamir's Secret Sharing (SSS)
//!
//! Shamir's Secret Sharing is a cryptographic algorithm created by Adi Shamir.
//! It is a form of secret sharing, where a secret is divided into parts,
//! giving each participant its own unique part, with the property that a
//! certain number of these parts are needed to reconstruct the secret.
//!
//! The idea is based on polynomial interpolation in finite fields. Given a
//! secret `S`, the algorithm chooses a random polynomial of degree `q-1`
//! (where `q` is the quorum of shares needed to reconstruct the secret):
//!
//! ```ignore
//! f(x) = a0 + a1*x + a2*x^2 + ... + a(q-1)*x^(q-1)
//! ```
//!
//! where `a0 = S` (the secret), and `a1, ..., a(q-1)` are randomly chosen
//! coefficients. Each share corresponds to a point `(x, f(x))` on this
//! polynomial. With at least `q` points, the polynomial and hence the secret
//! can be reconstructed using Lagrange interpolation. This library applies the
//! scheme byte-wise over GF(2^8), one polynomial per byte of the packed
//! (label + secret) blob.
//!
//! ## The protocol
//!
//! Five typed messages travel sealed through the log:
//!
//! - `Root` describes one sharing session; its content hash is the session id.
//! - `Shard` carries one custodian's encrypted, signed share.
//! - `Request` solicits a share back during recovery, optionally naming a
//!   one-time public key for the answer to be layered under.
//! - `Reply` answers exactly one request, keyed by the request's id.
//! - `Forward` hands a held share to a new party, bypassing request/reply.
//!
//! Every message is sealed to its recipients (and its author) before it is
//! published; nothing travels in the clear. Each participant is a
//! [`member::Member`] that recomputes its view from a fresh log query on
//! every operation.
//!
//! ### Example: sharing and recovering a secret
//!
//! ```ignore
//! use std::sync::Arc;
//! use custodia::crypto::Keypair;
//! use custodia::log::MemoryMessageLog;
//! use custodia::member::Member;
//! use custodia::repository;
//!
//! let log = Arc::new(MemoryMessageLog::new());
//! let owner = Member::new(Keypair::generate(), log.clone(), repository::dao(None)?);
//!
//! let root = owner.share(secret, "my key", 5, 3, &custodians, None).await?;
//! // ... custodians run reply() when requests appear ...
//! owner.request(&root, None).await?;
//! let recovered = owner.combine(&root, None).await?;
//! ```

/// The `codec` module builds, validates, seals and opens protocol messages.
/// It stamps the envelope fields, runs the schema check as the last gate
/// before anything is published, and computes the content hashes used as
/// session and request ids.
pub mod codec;

/// The `config` module loads per-member configuration from disk: the
/// persisted signing key, the ephemeral-key mode, and the policy toggle for
/// unverified shares.
pub mod config;

/// The `crypto` module holds the primitive layer: member identities, the
/// one-way and multi-recipient boxes, share signatures, label packing, and
/// content hashing.
pub mod crypto;

/// The `error` module defines the error taxonomy every public operation
/// resolves to.
pub mod error;

/// The `log` module defines the append-only message log boundary and an
/// in-process implementation of it.
pub mod log;

/// The `member` module implements the protocol engine: sharing, requesting,
/// replying, forwarding and combining.
pub mod member;

/// The `protocol` module defines the five typed protocol messages and their
/// schema validation.
pub mod protocol;

/// The `repository` module manages ephemeral keypair storage and the
/// removable encryption layer on reply traffic.
pub mod repository;

/// The `sss` (Shamir's Secret Sharing) module implements the threshold
/// split and combine over GF(2^8).
pub mod sss;
