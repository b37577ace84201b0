//! Credential records and the binary token encoding used during injection.
//!
//! The encoding is deliberately boxed into this module; the lifecycle
//! service only ever sees opaque bytes and a ready-made shell command.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// Encoding format version byte.
const ENCODING_VERSION: u8 = 1;

/// OAuth-style token pair attached to a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix milliseconds when the access token expires.
    pub expires_at: i64,
}

/// Serialize credentials into the binary blob the IDE's auth store expects.
///
/// Layout: one version byte, then each token as a little-endian u32 byte
/// length followed by the UTF-8 bytes, then the expiry as a little-endian
/// i64.
pub fn encode_credential(credentials: &Credentials) -> Vec<u8> {
    let access = credentials.access_token.as_bytes();
    let refresh = credentials.refresh_token.as_bytes();

    let mut out = Vec::with_capacity(1 + 4 + access.len() + 4 + refresh.len() + 8);
    out.push(ENCODING_VERSION);
    out.extend_from_slice(&(access.len() as u32).to_le_bytes());
    out.extend_from_slice(access);
    out.extend_from_slice(&(refresh.len() as u32).to_le_bytes());
    out.extend_from_slice(refresh);
    out.extend_from_slice(&credentials.expires_at.to_le_bytes());
    out
}

/// Build the shell command that writes the encoded blob into the backend's
/// auth store at `auth_path` (relative to the backend's working directory).
///
/// The blob travels base64-encoded so it survives exec argument handling.
pub fn injection_command(credentials: &Credentials, auth_path: &str) -> Vec<String> {
    let blob = BASE64.encode(encode_credential(credentials));
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!(
            "mkdir -p \"$(dirname '{}')\" && echo '{}' | base64 -d > '{}'",
            auth_path, blob, auth_path
        ),
    ]
}
