//! Caller authorization.
//!
//! Two authorities are recognized: a **twin** may submit reservations for
//! its own id and delete its own reservations; an **admin** (tied to the
//! node's operator) may delete any reservation but may not create on behalf
//! of others. Identity resolution is a lookup from twin id to public key;
//! the identity source itself is an external collaborator, backed here by a
//! static TOML registry.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::fs;
use std::path::Path;

use ed25519_dalek::VerifyingKey;
use serde::Deserialize;
use thiserror::Error;

use weft_common::crypto::{self, CryptoError};
use weft_common::{Reservation, TwinId};

/// Authorization failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The twin id resolves to no known public key.
    #[error("unknown twin {0}")]
    Unauthenticated(TwinId),

    /// The signature is invalid or malformed.
    #[error("bad signature for twin {twin}: {source}")]
    BadSignature {
        twin: TwinId,
        #[source]
        source: CryptoError,
    },

    /// Caller identity is known but not permitted for this operation.
    #[error("twin {caller} is not allowed to delete reservation of twin {owner}")]
    Unauthorized { caller: TwinId, owner: TwinId },
}

/// Resolves twin ids to public keys.
pub trait TwinRegistry: Debug + Send + Sync + 'static {
    fn key_of(&self, twin: TwinId) -> Option<VerifyingKey>;
}

/// Resolves which twins hold admin authority on this node.
pub trait AdminRegistry: Debug + Send + Sync + 'static {
    fn is_admin(&self, twin: TwinId) -> bool;
}

#[derive(Debug, Deserialize)]
struct TwinsFile {
    #[serde(default)]
    twins: HashMap<String, String>,
    #[serde(default)]
    admins: Vec<TwinId>,
}

/// Static twin/admin registry loaded from a TOML file:
///
/// ```toml
/// admins = [1]
///
/// [twins]
/// 1 = "95d1ba20e9f5cb6cfc6182fecfa904664fb1953eba520db454d5d5afaa82d791"
/// 7 = "..."
/// ```
#[derive(Debug, Default)]
pub struct StaticTwins {
    keys: HashMap<TwinId, VerifyingKey>,
    admins: HashSet<TwinId>,
}

/// Errors from loading the twins registry file.
#[derive(Debug, Error)]
pub enum TwinsFileError {
    #[error("failed to read twins file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse twins file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("twin id {0} is not a number")]
    BadTwinId(String),
    #[error("bad key for twin {twin}: {source}")]
    BadKey {
        twin: TwinId,
        #[source]
        source: CryptoError,
    },
}

impl StaticTwins {
    /// Load the registry from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TwinsFileError> {
        let raw = fs::read_to_string(path.as_ref())?;
        let file: TwinsFile = toml::from_str(&raw)?;

        let mut keys = HashMap::new();
        for (twin, key_hex) in file.twins {
            let twin: TwinId = twin
                .parse()
                .map_err(|_| TwinsFileError::BadTwinId(twin.clone()))?;
            let key = crypto::verifying_key_from_hex(&key_hex)
                .map_err(|source| TwinsFileError::BadKey { twin, source })?;
            keys.insert(twin, key);
        }
        Ok(StaticTwins {
            keys,
            admins: file.admins.into_iter().collect(),
        })
    }

    /// Registry built from in-memory entries (tests, embedded setups).
    pub fn from_keys(
        keys: impl IntoIterator<Item = (TwinId, VerifyingKey)>,
        admins: impl IntoIterator<Item = TwinId>,
    ) -> Self {
        StaticTwins {
            keys: keys.into_iter().collect(),
            admins: admins.into_iter().collect(),
        }
    }
}

impl TwinRegistry for StaticTwins {
    fn key_of(&self, twin: TwinId) -> Option<VerifyingKey> {
        self.keys.get(&twin).copied()
    }
}

impl AdminRegistry for StaticTwins {
    fn is_admin(&self, twin: TwinId) -> bool {
        self.admins.contains(&twin)
    }
}

/// Verify that a reservation's signature verifies under the key of its twin.
pub fn verify_reservation(
    twins: &dyn TwinRegistry,
    reservation: &Reservation,
) -> Result<(), AuthError> {
    let key = twins
        .key_of(reservation.twin_id)
        .ok_or(AuthError::Unauthenticated(reservation.twin_id))?;
    crypto::verify_challenge(&key, &reservation.challenge(), &reservation.signature).map_err(
        |source| AuthError::BadSignature {
            twin: reservation.twin_id,
            source,
        },
    )
}

/// Verify a delete request: the signature must verify under the caller's
/// key, and the caller must own the reservation or hold admin authority.
pub fn verify_delete(
    twins: &dyn TwinRegistry,
    admins: &dyn AdminRegistry,
    reservation_id: &str,
    owner: TwinId,
    caller: TwinId,
    signature: &str,
) -> Result<(), AuthError> {
    let key = twins
        .key_of(caller)
        .ok_or(AuthError::Unauthenticated(caller))?;
    let challenge = Reservation::delete_challenge(reservation_id, caller);
    crypto::verify_challenge(&key, &challenge, signature).map_err(|source| {
        AuthError::BadSignature { twin: caller, source }
    })?;

    if caller == owner || admins.is_admin(caller) {
        Ok(())
    } else {
        Err(AuthError::Unauthorized { caller, owner })
    }
}
