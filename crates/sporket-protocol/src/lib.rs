// sporket-protocol: signed envelope types for the Sporket message bus.
//
// Every WebSocket frame on the bus is one JSON `Message`. The payload
// travels as base64-encoded JSON text and the envelope carries an
// HMAC-SHA-256 signature over the canonical string `id || now || payload`,
// where `payload` is the base64 wire form, not the decoded object.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Application payload carried inside an envelope: a JSON object with
/// string keys and arbitrary JSON values.
pub type Payload = serde_json::Map<String, Value>;

/// Environment variable holding the shared deployment secret. Read at
/// every challenge computation, so a rotated value applies to the next
/// handshake while existing sessions keep running.
pub const PASSWORD_ENV: &str = "SPORKET_PASSWORD";

/// Canonical reply texts carried in the `message` field of ERROR envelopes.
pub mod reply_text {
    pub const INVALID_SIGNATURE: &str = "Bad Request (invalid signature)";
    pub const RESPOND_TO_CHALLENGE: &str = "Unauthorized (respond to challenge)";
    pub const AUTH_FAILED: &str = "Unauthorized (authentication failed)";
    pub const SHUTTING_DOWN: &str = "Teapot (server shutting down)";
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown status code {0}")]
    UnknownStatus(u16),
}

// ---------------------------------------------------------------------------
// Message kind and status
// ---------------------------------------------------------------------------

/// Envelope kind, serialized as the wire `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Auth,
    Ping,
    Data,
    Error,
}

/// Closed set of envelope status codes, serialized as plain integers.
///
/// | Code | Meaning                                 |
/// |------|-----------------------------------------|
/// | 200  | successful AUTH / DATA                  |
/// | 400  | invalid signature                       |
/// | 401  | auth failure or unauthenticated data    |
/// | 418  | graceful server shutdown                |
/// | 500  | defined but unused                      |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Status {
    Ok,
    BadRequest,
    Unauthorized,
    Teapot,
    ServerError,
}

impl Status {
    pub fn code(self) -> u16 {
        u16::from(self)
    }
}

impl From<Status> for u16 {
    fn from(status: Status) -> u16 {
        match status {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Unauthorized => 401,
            Status::Teapot => 418,
            Status::ServerError => 500,
        }
    }
}

impl TryFrom<u16> for Status {
    type Error = ProtocolError;

    fn try_from(code: u16) -> Result<Self, ProtocolError> {
        match code {
            200 => Ok(Status::Ok),
            400 => Ok(Status::BadRequest),
            401 => Ok(Status::Unauthorized),
            418 => Ok(Status::Teapot),
            500 => Ok(Status::ServerError),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Session key
// ---------------------------------------------------------------------------

/// Per-session HMAC-SHA-256 key.
///
/// The key material is the UTF-8 bytes of the session uuid string; both
/// endpoints derive the same key without it ever crossing the wire. Only
/// the deployment password is private.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey(Vec<u8>);

impl SessionKey {
    pub fn derive(uuid: &str) -> Self {
        Self(uuid.as_bytes().to_vec())
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.0).expect("HMAC accepts any key length")
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The wire envelope. One JSON text frame per message; field names are
/// frozen (`id`, `now`, `type`, `status`, `payload`, `signature`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Fresh random UUID per send. The server's first AUTH reuses the
    /// session uuid here for diagnostics; nothing verifies against it.
    pub id: String,
    /// Milliseconds since Unix epoch at send time.
    pub now: u64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub status: Status,
    /// base64 of the UTF-8 JSON encoding of a [`Payload`].
    pub payload: String,
    /// base64 HMAC-SHA-256 tag; empty only on a pre-sign draft.
    pub signature: String,
}

impl Message {
    /// Build an unsigned envelope with a fresh random id.
    pub fn new(payload: &Payload, kind: MessageKind, status: Status) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), payload, kind, status)
    }

    /// Build an unsigned envelope with a caller-chosen id (used by the
    /// server's session greeting, whose id equals the session uuid).
    pub fn with_id(
        id: impl Into<String>,
        payload: &Payload,
        kind: MessageKind,
        status: Status,
    ) -> Self {
        Self {
            id: id.into(),
            now: epoch_ms(),
            kind,
            status,
            payload: encode_payload(payload),
            signature: String::new(),
        }
    }

    /// Sign the envelope, consuming and returning it with `signature` set.
    #[must_use]
    pub fn sign(mut self, key: &SessionKey) -> Self {
        let mut mac = key.mac();
        mac.update(self.canonical().as_bytes());
        self.signature = BASE64.encode(mac.finalize().into_bytes());
        self
    }

    /// Verify the signature against the canonical string.
    ///
    /// Fails closed: a missing key, an undecodable signature, or a tag
    /// mismatch all return `false`. Never panics, never propagates.
    pub fn verify(&self, key: Option<&SessionKey>) -> bool {
        let Some(key) = key else {
            return false;
        };
        let Ok(tag) = BASE64.decode(&self.signature) else {
            return false;
        };
        let mut mac = key.mac();
        mac.update(self.canonical().as_bytes());
        mac.verify_slice(&tag).is_ok()
    }

    /// Decode the wire payload into application space.
    ///
    /// Any failure (bad base64, invalid UTF-8, malformed JSON, non-object
    /// top level) yields an empty map so callers can inspect absent and
    /// malformed fields uniformly.
    pub fn parse_payload(&self) -> Payload {
        decode_payload(&self.payload).unwrap_or_default()
    }

    /// The HMAC input: `id || decimal(now) || payload_wire`, no delimiters.
    /// The base64 payload string is signed as-is; signing the decoded
    /// object instead breaks interoperability.
    fn canonical(&self) -> String {
        format!("{}{}{}", self.id, self.now, self.payload)
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn encode_payload(payload: &Payload) -> String {
    BASE64.encode(Value::Object(payload.clone()).to_string())
}

fn decode_payload(wire: &str) -> Option<Payload> {
    let bytes = BASE64.decode(wire).ok()?;
    let text = String::from_utf8(bytes).ok()?;
    match serde_json::from_str(&text).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Challenge
// ---------------------------------------------------------------------------

/// The authentication proof: `base64(SHA-256(password || uuid))`.
///
/// The client computes it from the shared secret and the server-assigned
/// session uuid; the server recomputes and compares during the handshake.
pub fn challenge(password: &str, uuid: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(uuid.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Build a [`Payload`] from a `serde_json::json!` object literal.
/// Non-object values yield an empty payload.
pub fn payload_object(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_payload() -> Payload {
        payload_object(json!({"hello": "world", "n": 7}))
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let key = SessionKey::derive("3b241101-e2bb-4255-8caf-4136c566a962");
        let msg = Message::new(&sample_payload(), MessageKind::Data, Status::Ok).sign(&key);
        assert!(!msg.signature.is_empty());
        assert!(msg.verify(Some(&key)));
    }

    #[test]
    fn mutating_any_signed_field_breaks_verification() {
        let key = SessionKey::derive("3b241101-e2bb-4255-8caf-4136c566a962");
        let signed = Message::new(&sample_payload(), MessageKind::Data, Status::Ok).sign(&key);

        let mut tampered_id = signed.clone();
        tampered_id.id = Uuid::new_v4().to_string();
        assert!(!tampered_id.verify(Some(&key)));

        let mut tampered_now = signed.clone();
        tampered_now.now += 1;
        assert!(!tampered_now.verify(Some(&key)));

        let mut tampered_payload = signed.clone();
        tampered_payload.payload = encode_payload(&payload_object(json!({"hello": "mars"})));
        assert!(!tampered_payload.verify(Some(&key)));
    }

    #[test]
    fn verify_fails_closed_without_key_or_with_garbage_signature() {
        let key = SessionKey::derive("session-1");
        let signed = Message::new(&sample_payload(), MessageKind::Data, Status::Ok).sign(&key);
        assert!(!signed.verify(None));

        let mut garbled = signed.clone();
        garbled.signature = "not base64 !!".to_owned();
        assert!(!garbled.verify(Some(&key)));

        let other = SessionKey::derive("session-2");
        assert!(!signed.verify(Some(&other)));
    }

    #[test]
    fn payload_round_trips_through_the_wire_form() {
        let payload = sample_payload();
        let msg = Message::new(&payload, MessageKind::Data, Status::Ok);
        assert_eq!(msg.parse_payload(), payload);
    }

    #[test]
    fn malformed_payloads_parse_to_the_empty_object() {
        let mut msg = Message::new(&Payload::new(), MessageKind::Data, Status::Ok);

        msg.payload = "!!! not base64".to_owned();
        assert!(msg.parse_payload().is_empty());

        msg.payload = BASE64.encode("{truncated");
        assert!(msg.parse_payload().is_empty());

        // A JSON array decodes fine but is not a payload object.
        msg.payload = BASE64.encode("[1,2,3]");
        assert!(msg.parse_payload().is_empty());
    }

    #[test]
    fn canonical_string_concatenates_id_now_and_wire_payload() {
        let key = SessionKey::derive("k");
        let msg = Message::new(&sample_payload(), MessageKind::Data, Status::Ok);
        let expected = format!("{}{}{}", msg.id, msg.now, msg.payload);
        assert_eq!(msg.canonical(), expected);

        // The signature must cover the base64 form, so re-encoding an
        // equivalent payload object with different key order would change
        // nothing here; only the literal wire string matters.
        let signed = msg.clone().sign(&key);
        let mut mac = key.mac();
        mac.update(expected.as_bytes());
        assert_eq!(signed.signature, BASE64.encode(mac.finalize().into_bytes()));
    }

    #[test]
    fn challenge_depends_on_both_password_and_uuid() {
        let uuid = "3b241101-e2bb-4255-8caf-4136c566a962";
        let c = challenge("hunter2", uuid);
        assert_eq!(c, challenge("hunter2", uuid), "challenge is deterministic");
        assert_ne!(c, challenge("wrong", uuid));
        assert_ne!(c, challenge("hunter2", "another-uuid"));
        // base64 of a 32-byte digest
        assert_eq!(c.len(), 44);
    }

    #[test]
    fn status_codes_form_a_closed_set() {
        for (status, code) in [
            (Status::Ok, 200),
            (Status::BadRequest, 400),
            (Status::Unauthorized, 401),
            (Status::Teapot, 418),
            (Status::ServerError, 500),
        ] {
            assert_eq!(status.code(), code);
            assert_eq!(Status::try_from(code).expect("known code"), status);
        }
        assert!(Status::try_from(999).is_err());
    }
}
