//! Signed configuration codes carried by `0xb0`.
//!
//! ```text
//! ___VBAR_CONFIG_V1.1.0___{devnum=12,heart_data="ping"}--<signature>
//! └──────────────── signed head ─────────────────────┘  └ base64 ┘
//! ```
//!
//! The signature is `base64(HMAC-SHA256(head, password))`, where the head
//! is everything before the last `--`. Quoted values are strings, bare
//! values integers.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::app::ports::ConfigValue;

/// Password used when `sysInfo.com_passwd` is unset.
pub const DEFAULT_PASSWORD: &str = "1234567887654321";

const SIGNATURE_SEPARATOR: &str = "--";

pub fn sign(head: &str, password: &str) -> String {
    STANDARD.encode(hmac_sha256::HMAC::mac(head.as_bytes(), password.as_bytes()))
}

/// Split `code` at its last `--` and check the signature. Returns the
/// signed head on success.
pub fn verify<'a>(code: &'a str, password: &str) -> Option<&'a str> {
    let (head, signature) = code.rsplit_once(SIGNATURE_SEPARATOR)?;
    (sign(head, password) == signature.trim()).then_some(head)
}

/// Entries between the first `{` and the next `}`, in order.
///
/// `None` when there is no body, an entry has no `=`, or a bare value is
/// not an integer.
pub fn parse_entries(head: &str) -> Option<Vec<(String, ConfigValue)>> {
    let start = head.find('{')?;
    let len = head[start + 1..].find('}')?;
    let body = &head[start + 1..start + 1 + len];
    if body.trim().is_empty() {
        return None;
    }
    body.split(',')
        .map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let value = value.trim();
            let parsed = match value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
            {
                Some(text) => ConfigValue::Text(text.to_owned()),
                None => ConfigValue::Number(value.parse().ok()?),
            };
            Some((key.trim().to_owned(), parsed))
        })
        .collect()
}

/// Build a signed code. Used by configuration tools and tests.
pub fn build(entries: &[(&str, ConfigValue)], password: &str) -> String {
    let body: Vec<String> = entries
        .iter()
        .map(|(k, v)| match v {
            ConfigValue::Number(n) => format!("{}={}", k, n),
            ConfigValue::Text(s) => format!("{}=\"{}\"", k, s),
        })
        .collect();
    let head = format!("___VBAR_CONFIG_V1.1.0___{{{}}}", body.join(","));
    let signature = sign(&head, password);
    format!("{}{}{}", head, SIGNATURE_SEPARATOR, signature)
}
