//! Signed ticket payload codec.
//!
//! A payload is the compact, QR-renderable form of a ticket's claims:
//!
//! ```text
//! base64url(bincode(claims)) "." base64url(HMAC-SHA256(key, claims part))
//! ```
//!
//! The tag covers the exact base64 text of the claims part, so every character
//! except the separator is integrity-protected. Signing keys come from a
//! [`SigningKeyring`]: the newest key signs, retired keys keep verifying until
//! their rotation deadline. No key material is ever embedded in a payload.
//!
//! # Example
//!
//! ```
//! use admission_core::codec::{Claims, SigningKey, SigningKeyring, TokenCodec};
//! use admission_core::types::{EventId, SigningNonce, TicketId, UserId};
//! use chrono::{Duration, SubsecRound, Utc};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let codec = TokenCodec::new(SigningKeyring::new(SigningKey::generate("k1")?));
//! let now = Utc::now().trunc_subsecs(0);
//! let claims = Claims {
//!     ticket_id: TicketId::new(),
//!     event_id: EventId::new(),
//!     user_id: UserId::new(),
//!     valid_from: now,
//!     valid_until: now + Duration::hours(2),
//!     nonce: SigningNonce::random(),
//! };
//!
//! let payload = codec.encode(&claims)?;
//! assert!(payload.as_str().len() < 200);
//! assert_eq!(codec.decode(payload.as_str(), now)?, claims);
//! # Ok(())
//! # }
//! ```

use crate::types::{EventId, SigningNonce, Ticket, TicketId, UserId};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bincode::Options;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const CLAIMS_VERSION: u8 = 1;
const MAX_CLAIMS_BYTES: u64 = 128;
const MIN_SECRET_LEN: usize = 32;
const SEPARATOR: char = '.';

/// Payloads longer than this are rejected before any decoding work.
pub const MAX_PAYLOAD_LEN: usize = 256;

// ============================================================================
// Keys
// ============================================================================

/// Errors building signing keys.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Secret is too short for HMAC-SHA256.
    #[error("signing key {id} is {len} bytes, at least {MIN_SECRET_LEN} required")]
    TooShort {
        /// Key identifier
        id: String,
        /// Provided secret length
        len: usize,
    },

    /// MAC construction refused the secret.
    #[error("signing key {id} rejected: {reason}")]
    Rejected {
        /// Key identifier
        id: String,
        /// MAC error message
        reason: String,
    },

    /// Secret was not valid base64.
    #[error("signing key {id} is not valid base64: {reason}")]
    Encoding {
        /// Key identifier
        id: String,
        /// Decoder message
        reason: String,
    },
}

/// An HMAC signing secret with an identifier.
#[derive(Clone)]
pub struct SigningKey {
    id: String,
    mac: HmacSha256,
    verify_until: Option<DateTime<Utc>>,
}

impl SigningKey {
    /// Wrap a raw secret.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::TooShort`] for secrets under 32 bytes.
    pub fn new(id: impl Into<String>, secret: Vec<u8>) -> Result<Self, KeyError> {
        let id = id.into();
        if secret.len() < MIN_SECRET_LEN {
            return Err(KeyError::TooShort {
                id,
                len: secret.len(),
            });
        }
        let mac = HmacSha256::new_from_slice(&secret).map_err(|e| KeyError::Rejected {
            id: id.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            id,
            mac,
            verify_until: None,
        })
    }

    /// Decode a standard or URL-safe base64 secret.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Encoding`] for invalid base64 and
    /// [`KeyError::TooShort`] for short secrets.
    pub fn from_base64(id: impl Into<String>, encoded: &str) -> Result<Self, KeyError> {
        let id = id.into();
        let trimmed = encoded.trim();
        let secret = base64::engine::general_purpose::STANDARD
            .decode(trimmed)
            .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed.trim_end_matches('=')))
            .map_err(|e| KeyError::Encoding {
                id: id.clone(),
                reason: e.to_string(),
            })?;
        Self::new(id, secret)
    }

    /// Generate a random 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Rejected`] if the MAC refuses the generated secret.
    pub fn generate(id: impl Into<String>) -> Result<Self, KeyError> {
        let secret: [u8; MIN_SECRET_LEN] = rand::random();
        Self::new(id, secret.to_vec())
    }

    /// Key identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Deadline after which a retired key stops verifying; `None` for the signing key
    #[must_use]
    pub const fn verify_until(&self) -> Option<DateTime<Utc>> {
        self.verify_until
    }

    fn verifies_at(&self, now: DateTime<Utc>) -> bool {
        self.verify_until.is_none_or(|deadline| now <= deadline)
    }

    fn tag(&self, body: &str) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(body.as_bytes());
        mac
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .field("verify_until", &self.verify_until)
            .finish()
    }
}

/// Ordered signing keys: the first key signs, the rest only verify.
#[derive(Clone, Debug)]
pub struct SigningKeyring {
    keys: Vec<SigningKey>,
}

impl SigningKeyring {
    /// Keyring with a single signing key
    #[must_use]
    pub fn new(primary: SigningKey) -> Self {
        let mut primary = primary;
        primary.verify_until = None;
        Self {
            keys: vec![primary],
        }
    }

    /// Add a retired key that keeps verifying until `verify_until`
    #[must_use]
    pub fn with_retired(mut self, key: SigningKey, verify_until: DateTime<Utc>) -> Self {
        let mut key = key;
        key.verify_until = Some(verify_until);
        self.keys.push(key);
        self
    }

    /// Make `next` the signing key; the current one verifies for `grace` more.
    ///
    /// Retired keys already past their deadline at `now` are dropped.
    pub fn rotate(&mut self, next: SigningKey, grace: Duration, now: DateTime<Utc>) {
        for key in &mut self.keys {
            if key.verify_until.is_none() {
                key.verify_until = Some(now + grace);
            }
        }
        self.keys.retain(|key| key.verifies_at(now));
        let mut next = next;
        next.verify_until = None;
        self.keys.insert(0, next);
    }

    /// The key used for all new payloads
    #[must_use]
    pub fn primary(&self) -> &SigningKey {
        &self.keys[0]
    }

    /// All key identifiers, signing key first
    #[must_use]
    pub fn key_ids(&self) -> Vec<&str> {
        self.keys.iter().map(SigningKey::id).collect()
    }

    fn verifying_keys(&self, now: DateTime<Utc>) -> impl Iterator<Item = &SigningKey> {
        self.keys.iter().filter(move |key| key.verifies_at(now))
    }
}

// ============================================================================
// Claims
// ============================================================================

/// Claims bound into a payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Ticket identity
    pub ticket_id: TicketId,
    /// Event the ticket admits to
    pub event_id: EventId,
    /// Ticket owner
    pub user_id: UserId,
    /// Start of the admission window (whole seconds)
    pub valid_from: DateTime<Utc>,
    /// End of the admission window (whole seconds)
    pub valid_until: DateTime<Utc>,
    /// Nonce current at signing time
    pub nonce: SigningNonce,
}

impl Claims {
    /// Claims describing the current state of `ticket`
    #[must_use]
    pub fn for_ticket(ticket: &Ticket) -> Self {
        Self {
            ticket_id: ticket.id,
            event_id: ticket.event_id,
            user_id: ticket.user_id,
            valid_from: ticket.window.valid_from(),
            valid_until: ticket.window.valid_until(),
            nonce: ticket.signing_nonce,
        }
    }

    /// Whether these claims describe `ticket` exactly as currently stored.
    ///
    /// A mismatched nonce means the payload predates a regeneration.
    #[must_use]
    pub fn binds(&self, ticket: &Ticket) -> bool {
        *self == Self::for_ticket(ticket)
    }
}

#[derive(Serialize, Deserialize)]
struct WireClaims {
    version: u8,
    ticket_id: Uuid,
    event_id: Uuid,
    user_id: Uuid,
    valid_from: i64,
    valid_until: i64,
    nonce: u64,
}

impl From<&Claims> for WireClaims {
    fn from(claims: &Claims) -> Self {
        Self {
            version: CLAIMS_VERSION,
            ticket_id: *claims.ticket_id.as_uuid(),
            event_id: *claims.event_id.as_uuid(),
            user_id: *claims.user_id.as_uuid(),
            valid_from: claims.valid_from.timestamp(),
            valid_until: claims.valid_until.timestamp(),
            nonce: claims.nonce.raw(),
        }
    }
}

impl TryFrom<WireClaims> for Claims {
    type Error = DecodeError;

    fn try_from(wire: WireClaims) -> Result<Self, Self::Error> {
        if wire.version != CLAIMS_VERSION {
            return Err(DecodeError::Malformed("unsupported claims version"));
        }
        let valid_from = DateTime::from_timestamp(wire.valid_from, 0)
            .ok_or(DecodeError::Malformed("valid_from out of range"))?;
        let valid_until = DateTime::from_timestamp(wire.valid_until, 0)
            .ok_or(DecodeError::Malformed("valid_until out of range"))?;
        Ok(Self {
            ticket_id: TicketId::from_uuid(wire.ticket_id),
            event_id: EventId::from_uuid(wire.event_id),
            user_id: UserId::from_uuid(wire.user_id),
            valid_from,
            valid_until,
            nonce: SigningNonce::from_raw(wire.nonce),
        })
    }
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_CLAIMS_BYTES)
}

// ============================================================================
// Payload
// ============================================================================

/// Opaque, renderable payload handed to the presentation layer for QR rendering.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(String);

impl Payload {
    /// Payload text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the payload text
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors encoding claims.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Claims could not be serialized.
    #[error("failed to serialize claims: {0}")]
    Serialization(String),
}

/// Reasons a payload fails to decode.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not a payload this codec produced.
    #[error("malformed payload: {0}")]
    Malformed(&'static str),

    /// Tag does not match any live key: tampering, forgery or a retired key.
    #[error("payload signature invalid")]
    SignatureInvalid,

    /// Authentic, but the validity window has closed.
    #[error("payload expired at {}", .0.valid_until)]
    Expired(Box<Claims>),
}

// ============================================================================
// Codec
// ============================================================================

/// Encodes and verifies ticket payloads against a rotating keyring.
#[derive(Debug)]
pub struct TokenCodec {
    keyring: RwLock<SigningKeyring>,
}

impl TokenCodec {
    /// Create a codec over `keyring`
    #[must_use]
    pub const fn new(keyring: SigningKeyring) -> Self {
        Self {
            keyring: RwLock::new(keyring),
        }
    }

    /// Sign `claims` with the newest key.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::Serialization`] if the claims cannot be serialized.
    pub fn encode(&self, claims: &Claims) -> Result<Payload, EncodeError> {
        let bytes = wire_options()
            .serialize(&WireClaims::from(claims))
            .map_err(|e| EncodeError::Serialization(e.to_string()))?;
        let body = URL_SAFE_NO_PAD.encode(bytes);

        let keyring = self.keyring.read().unwrap_or_else(PoisonError::into_inner);
        let tag = URL_SAFE_NO_PAD.encode(keyring.primary().tag(&body).finalize().into_bytes());

        Ok(Payload(format!("{body}{SEPARATOR}{tag}")))
    }

    /// Verify and decode a scanned payload.
    ///
    /// # Errors
    ///
    /// - [`DecodeError::Malformed`]: not structurally a payload
    /// - [`DecodeError::SignatureInvalid`]: tag mismatch against every live key
    /// - [`DecodeError::Expired`]: authentic but `valid_until < now`
    pub fn decode(&self, payload: &str, now: DateTime<Utc>) -> Result<Claims, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::Malformed("empty payload"));
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(DecodeError::Malformed("payload too long"));
        }
        let (body, tag_part) = payload
            .rsplit_once(SEPARATOR)
            .ok_or(DecodeError::Malformed("missing signature separator"))?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag_part)
            .map_err(|_| DecodeError::SignatureInvalid)?;

        let verified = {
            let keyring = self.keyring.read().unwrap_or_else(PoisonError::into_inner);
            keyring
                .verifying_keys(now)
                .any(|key| key.tag(body).verify_slice(&tag).is_ok())
        };
        if !verified {
            return Err(DecodeError::SignatureInvalid);
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| DecodeError::Malformed("claims are not base64"))?;
        let wire: WireClaims = wire_options()
            .deserialize(&bytes)
            .map_err(|_| DecodeError::Malformed("claims are not decodable"))?;
        let claims = Claims::try_from(wire)?;

        if claims.valid_until < now {
            return Err(DecodeError::Expired(Box::new(claims)));
        }
        Ok(claims)
    }

    /// Rotate to a new signing key; the previous one verifies for `grace` more.
    pub fn rotate(&self, next: SigningKey, grace: Duration, now: DateTime<Utc>) {
        let mut keyring = self.keyring.write().unwrap_or_else(PoisonError::into_inner);
        tracing::info!(
            previous = keyring.primary().id(),
            next = next.id(),
            grace_secs = grace.num_seconds(),
            "Rotating payload signing key"
        );
        keyring.rotate(next, grace, now);
    }

    /// Identifier of the key signing new payloads
    #[must_use]
    pub fn signing_key_id(&self) -> String {
        self.keyring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .primary()
            .id()
            .to_string()
    }
}
