//! # Request Fingerprinting
//!
//! Deterministic content hashes used as cache keys. Two requests that differ
//! only in header casing, field order or the `stream` flag produce identical
//! fingerprints; any change to the model, conversation, sampling parameters,
//! tools or response format produces a different one.
//!
//! The hash is SHA-256 truncated to 128 bits and rendered as hex, prefixed
//! with the request kind so that key-prefix invalidation can target one
//! class of entries (`chat:`, `text:`, `summary:`).

use crate::models::{Message, RequestKind, RouteRequest};
use sha2::{Digest, Sha256};

/// Number of hex characters kept from the digest.
const FINGERPRINT_LEN: usize = 32;

/// Compute the cache fingerprint for a normalized request.
///
/// `stream` is pinned to false: streaming requests compute the same
/// fingerprint as their non-streaming twin, the caller just skips the cache
/// lookup for them.
pub fn request_fingerprint(request: &RouteRequest) -> String {
    let mut hasher = Sha256::new();

    feed(&mut hasher, request.kind.as_str().as_bytes());
    feed(&mut hasher, request.body.model.as_bytes());
    feed_messages(&mut hasher, &request.body.messages);

    feed_opt_u32(&mut hasher, request.body.max_tokens);
    feed_opt_f32(&mut hasher, request.body.temperature);
    feed_opt_f32(&mut hasher, request.body.top_p);

    match &request.body.stop {
        Some(stops) => {
            feed(&mut hasher, b"stop");
            for stop in stops {
                feed(&mut hasher, stop.as_bytes());
            }
        }
        None => feed(&mut hasher, b"-"),
    }

    // Tools and response format hash through their canonical JSON encoding;
    // struct field order is fixed by the serde derive, so the bytes are
    // stable for equal values.
    match &request.body.tools {
        Some(tools) => feed(
            &mut hasher,
            &serde_json::to_vec(tools).unwrap_or_default(),
        ),
        None => feed(&mut hasher, b"-"),
    }
    match &request.body.response_format {
        Some(format) => feed(&mut hasher, format.format_type.as_bytes()),
        None => feed(&mut hasher, b"-"),
    }

    let prefix = match request.kind {
        RequestKind::Chat => "chat",
        RequestKind::Completion => "text",
    };
    format!("{prefix}:{}", finish(hasher))
}

/// Fingerprint for a condensed-conversation summary: the original messages
/// plus the summary budget. Requests with the same oversized history share
/// one summary regardless of their sampling parameters.
pub fn summary_fingerprint(messages: &[Message], summary_max_tokens: u32) -> String {
    let mut hasher = Sha256::new();
    feed_messages(&mut hasher, messages);
    feed(&mut hasher, &summary_max_tokens.to_be_bytes());
    format!("summary:{}", finish(hasher))
}

fn feed_messages(hasher: &mut Sha256, messages: &[Message]) {
    // Message order is significant and preserved.
    for message in messages {
        feed(hasher, message.role.as_str().as_bytes());
        feed(hasher, message.content.as_bytes());
        match &message.name {
            Some(name) => feed(hasher, name.as_bytes()),
            None => feed(hasher, b"-"),
        }
    }
}

/// Length-prefixed update, so that adjacent fields cannot collide by
/// shifting bytes between them.
fn feed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn feed_opt_u32(hasher: &mut Sha256, value: Option<u32>) {
    match value {
        Some(v) => feed(hasher, &v.to_be_bytes()),
        None => feed(hasher, b"-"),
    }
}

fn feed_opt_f32(hasher: &mut Sha256, value: Option<f32>) {
    match value {
        Some(v) => feed(hasher, &v.to_bits().to_be_bytes()),
        None => feed(hasher, b"-"),
    }
}

fn finish(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(FINGERPRINT_LEN);
    for byte in digest.iter().take(FINGERPRINT_LEN / 2) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
