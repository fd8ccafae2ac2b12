//! Prefixed, time-ordered resource identifiers.
//!
//! Every identifier is a UUIDv7 rendered as a fixed-width base62 string behind a
//! short resource prefix, e.g. `sb_0Fz3...`. Because the most significant bits
//! of a UUIDv7 are a millisecond timestamp and the encoding is fixed-width,
//! lexicographic order of two ids of the same kind equals creation order.

use uuid::Uuid;

/// Prefix for sandbox ids.
pub const SANDBOX_PREFIX: &str = "sb_";
/// Prefix for exec ids.
pub const EXEC_PREFIX: &str = "ex_";
/// Prefix for session ids.
pub const SESSION_PREFIX: &str = "sess_";
/// Prefix for artifact ids.
pub const ARTIFACT_PREFIX: &str = "art_";
/// Prefix for node ids.
pub const NODE_PREFIX: &str = "node_";
/// Prefix for image ids.
pub const IMAGE_PREFIX: &str = "img_";
/// Prefix for profile ids.
pub const PROFILE_PREFIX: &str = "prof_";

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const ENCODED_LEN: usize = 22;

/// Generate a new id with the given prefix.
pub fn generate(prefix: &str) -> String {
    format!("{prefix}{}", encode(Uuid::now_v7().as_u128()))
}

/// Generate a new sandbox id.
pub fn sandbox_id() -> String {
    generate(SANDBOX_PREFIX)
}

/// Generate a new exec id.
pub fn exec_id() -> String {
    generate(EXEC_PREFIX)
}

/// Generate a new session id.
pub fn session_id() -> String {
    generate(SESSION_PREFIX)
}

/// Generate a new artifact id.
pub fn artifact_id() -> String {
    generate(ARTIFACT_PREFIX)
}

fn encode(mut value: u128) -> String {
    let mut out = [b'0'; ENCODED_LEN];
    for slot in out.iter_mut().rev() {
        *slot = ALPHABET[(value % 62) as usize];
        value /= 62;
    }
    out.iter().map(|&b| b as char).collect()
}

fn decode(encoded: &str) -> Option<u128> {
    if encoded.len() != ENCODED_LEN {
        return None;
    }
    encoded.bytes().try_fold(0u128, |acc, c| {
        let digit = match c {
            b'0'..=b'9' => c - b'0',
            b'A'..=b'Z' => c - b'A' + 10,
            b'a'..=b'z' => c - b'a' + 36,
            _ => return None,
        };
        acc.checked_mul(62)?.checked_add(u128::from(digit))
    })
}

/// Check that `id` is a well-formed id of the given kind.
pub fn is_valid(id: &str, prefix: &str) -> bool {
    id.strip_prefix(prefix)
        .and_then(decode)
        .is_some_and(|raw| Uuid::from_u128(raw).get_version_num() == 7)
}
