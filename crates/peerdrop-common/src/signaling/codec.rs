//! Signal encoding for serverless signaling
//!
//! A descriptor is serialized to JSON, a CRC32 checksum is appended and the
//! result is base64url-encoded without padding. The token only contains
//! `[A-Za-z0-9_-]`, so it can be pasted into a chat, embedded in a URL query
//! parameter or put into a QR code without any further escaping.
//!
//! For copy/paste the token can be *armored* between SSH-key style markers:
//!
//! ```text
//! -----BEGIN PEERDROP OFFER-----
//! eyJ0eXBlIjoib2ZmZXIiLCJzZHAiOiJ2PTBcclxu...
//! -----END PEERDROP OFFER-----
//! ```

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::error::SessionError;

/// Line width for wrapped output (safe for most terminals)
const LINE_WIDTH: usize = 76;

/// Size of the trailing CRC32 checksum
const CHECKSUM_LEN: usize = 4;

/// Smallest JSON document worth parsing (`{}`)
const MIN_JSON_LEN: usize = 2;

const ARMOR_BEGIN_PREFIX: &str = "-----BEGIN PEERDROP ";

/// Every END marker starts with this, whatever the kind.
pub const ARMOR_END_PREFIX: &str = "-----END PEERDROP ";

// ============================================================================
// Descriptor Structures
// ============================================================================

/// Which half of the handshake a descriptor belongs to.
///
/// Offers are produced by the initiator, answers by the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
}

impl SignalKind {
    fn armor_label(self) -> &'static str {
        match self {
            SignalKind::Offer => "OFFER",
            SignalKind::Answer => "ANSWER",
        }
    }

    pub fn begin_marker(self) -> String {
        format!("{}{}-----", ARMOR_BEGIN_PREFIX, self.armor_label())
    }

    pub fn end_marker(self) -> String {
        format!("{}{}-----", ARMOR_END_PREFIX, self.armor_label())
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Offer => write!(f, "offer"),
            SignalKind::Answer => write!(f, "answer"),
        }
    }
}

/// ICE candidate gathered before the descriptor was produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
}

/// One side's connection parameters: session description plus every
/// candidate gathered for it (no trickle, so the list is complete).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingDescriptor {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub sdp: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<IceCandidatePayload>,
}

impl SignalingDescriptor {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SignalKind::Offer,
            sdp: sdp.into(),
            candidates: Vec::new(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SignalKind::Answer,
            sdp: sdp.into(),
            candidates: Vec::new(),
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<IceCandidatePayload>) -> Self {
        self.candidates = candidates;
        self
    }
}

/// Transportable string form of a [`SignalingDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncodedSignal(String);

impl EncodedSignal {
    /// Wrap text received from an out-of-band channel. Nothing is validated
    /// until [`decode`] is called.
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for EncodedSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a descriptor as base64url(JSON || CRC32).
pub fn encode(descriptor: &SignalingDescriptor) -> EncodedSignal {
    // Only strings, integers and a Vec: serialization cannot fail.
    let mut payload = serde_json::to_vec(descriptor).expect("descriptor is always serializable");
    let checksum = crc32fast::hash(&payload);
    payload.extend_from_slice(&checksum.to_be_bytes());
    EncodedSignal(URL_SAFE_NO_PAD.encode(&payload))
}

/// Decode text produced by [`encode`] or [`armor`].
///
/// Whitespace and line breaks are ignored. Fails with
/// [`SessionError::MalformedSignal`] on empty, truncated, corrupted or
/// structurally incomplete input.
pub fn decode(text: &str) -> Result<SignalingDescriptor, SessionError> {
    let token = payload_text(text)?;
    let token = token.trim_end_matches('=');
    if token.is_empty() {
        return Err(SessionError::malformed("signal is empty"));
    }

    let raw = URL_SAFE_NO_PAD
        .decode(token.as_bytes())
        .map_err(|e| SessionError::malformed(format!("invalid base64url: {}", e)))?;

    if raw.len() < CHECKSUM_LEN + MIN_JSON_LEN {
        return Err(SessionError::malformed(format!(
            "signal too short (got {} bytes, need at least {})",
            raw.len(),
            CHECKSUM_LEN + MIN_JSON_LEN
        )));
    }

    let (json, checksum) = raw.split_at(raw.len() - CHECKSUM_LEN);
    let expected = u32::from_be_bytes([checksum[0], checksum[1], checksum[2], checksum[3]]);
    if crc32fast::hash(json) != expected {
        return Err(SessionError::malformed(
            "checksum mismatch - signal may have been corrupted during copy/paste",
        ));
    }

    let descriptor: SignalingDescriptor = serde_json::from_slice(json)
        .map_err(|e| SessionError::malformed(format!("invalid descriptor: {}", e)))?;

    if descriptor.sdp.trim().is_empty() {
        return Err(SessionError::malformed("descriptor has no session description"));
    }
    if descriptor.candidates.iter().any(|c| c.candidate.trim().is_empty()) {
        return Err(SessionError::malformed("descriptor contains an empty ICE candidate"));
    }

    Ok(descriptor)
}

// ============================================================================
// Armor
// ============================================================================

/// Wrap an ASCII token to lines of the given width.
fn wrap_lines(s: &str, width: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    chars
        .chunks(width)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Wrap an encoded signal between BEGIN/END markers for copy/paste.
pub fn armor(kind: SignalKind, signal: &EncodedSignal) -> String {
    format!(
        "{}\n{}\n{}",
        kind.begin_marker(),
        wrap_lines(signal.as_str(), LINE_WIDTH),
        kind.end_marker()
    )
}

/// Extract the token between the markers of the expected kind.
pub fn dearmor(text: &str, kind: SignalKind) -> Result<EncodedSignal, SessionError> {
    extract_marked_payload(text.lines(), &kind.begin_marker(), &kind.end_marker())
        .map(EncodedSignal)
}

/// Reduce armored or bare text to the bare token.
fn payload_text(text: &str) -> Result<String, SessionError> {
    let trimmed = text.trim();
    if !trimmed.starts_with(ARMOR_BEGIN_PREFIX) {
        return Ok(trimmed.split_whitespace().collect());
    }

    let kind = [SignalKind::Offer, SignalKind::Answer]
        .into_iter()
        .find(|kind| trimmed.starts_with(&kind.begin_marker()))
        .ok_or_else(|| SessionError::malformed("unknown BEGIN marker"))?;

    extract_marked_payload(trimmed.lines(), &kind.begin_marker(), &kind.end_marker())
}

/// Extract base64 payload between explicit BEGIN/END markers
fn extract_marked_payload<'a, I>(lines: I, begin: &str, end: &str) -> Result<String, SessionError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut in_payload = false;
    let mut collected: Vec<&str> = Vec::new();

    for line in lines {
        let trimmed = line.trim();

        if trimmed.is_empty() && !in_payload {
            continue;
        }

        if trimmed == begin {
            if in_payload {
                return Err(SessionError::malformed("duplicate BEGIN marker"));
            }
            in_payload = true;
            continue;
        }

        if trimmed == end {
            if !in_payload {
                return Err(SessionError::malformed("END marker found before BEGIN marker"));
            }
            let joined = collected.concat();
            if joined.is_empty() {
                return Err(SessionError::malformed("no payload found between markers"));
            }
            return Ok(joined);
        }

        if !in_payload {
            return Err(SessionError::malformed("unexpected text before BEGIN marker"));
        }

        if !trimmed.is_empty() {
            collected.push(trimmed);
        }
    }

    if !in_payload {
        return Err(SessionError::malformed("missing BEGIN marker"));
    }

    Err(SessionError::malformed("missing END marker"))
}
