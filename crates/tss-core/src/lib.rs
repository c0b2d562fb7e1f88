//! # TSS Core
//!
//! Client-side coordination for threshold ECDSA wallets.
//!
//! Several parties generate one shared secp256k1 key and later sign with any
//! `m` of the `n` shares. A semi-trusted coordinator relays opaque round
//! messages and stores the results; it never sees a share in the clear.
//!
//! This crate provides:
//! - session identity and join codes for onboarding parties
//! - a four-round state machine shared by key generation and signing
//! - a polling subscription loop with fault recovery
//! - session export and restore
//! - the envelope that seals share backups and join codes
//!
//! Threshold arithmetic sits behind the [`Engine`] trait and the coordinator
//! behind the [`Transport`] trait.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tss_core::{KeyGenContext, MemoryCoordinator, PartyKey, SimulatedEngine, SubscribeOptions, TssKeyGen};
//!
//! let mut keygen = TssKeyGen::new(KeyGenContext {
//!     transport: Arc::new(MemoryCoordinator::new()),
//!     engine: Arc::new(SimulatedEngine),
//!     party: PartyKey::from_seed(&seed)?,
//!     chain: Chain::Btc,
//!     network: Network::Livenet,
//! });
//! keygen.new_key(2, 3, Some("password")).await?;
//! let code = keygen.create_join_code(1, &invitee_auth_key, None, &Default::default())?;
//!
//! let mut events = keygen.subscribe(SubscribeOptions::default())?;
//! while let Some(event) = events.next().await {
//!     // RoundEvent::Ready / Processed / Submitted / Artifact / Complete / Error
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod hd;
pub mod identity;
pub mod join_code;
pub mod keygen;
pub mod party;
mod round;
pub mod session;
pub mod sign;
pub mod subscription;
pub mod transport;
pub mod types;

pub use config::ClientConfig;
pub use coordinator::CoordinatorClient;
pub use engine::{Engine, SimulatedEngine};
pub use error::{Error, Result};
pub use join_code::{JoinCodeEncoding, JoinCodeOptions, JoinPayload};
pub use keygen::{open_key_share, KeyGenContext, TssKeyGen};
pub use party::PartyKey;
pub use session::Session;
pub use sign::{verify_signature, SignContext, SignRequest, TssSign};
pub use subscription::{RoundEvent, SubscribeOptions, Subscription, SubscriptionHandle};
pub use transport::{MemoryCoordinator, Response, Transport};
pub use types::{
    Artifact, Chain, KeyChain, KeyMetadata, Network, PartyId, Role, SessionStatus, Signature,
    TssKey, ROUNDS,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
