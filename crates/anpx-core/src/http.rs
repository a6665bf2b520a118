//! HTTP metadata carried in ANPX JSON TLVs.
//!
//! Both maps use `BTreeMap` so encoding a given logical message is
//! deterministic. Deserialization is strict: duplicate JSON keys are an
//! error rather than last-wins.

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Request metadata: the `http_meta` TLV (`0x02`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpMeta {
    pub method: String,
    pub path: String,
    #[serde(default, deserialize_with = "strict_string_map")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "strict_string_map")]
    pub query: BTreeMap<String, String>,
}

/// Response metadata: the `resp_meta` TLV (`0x04`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RespMeta {
    pub status: u16,
    #[serde(default)]
    pub reason: String,
    #[serde(default, deserialize_with = "strict_string_map")]
    pub headers: BTreeMap<String, String>,
}

impl RespMeta {
    /// Reason phrase, deriving the canonical one when absent.
    pub fn reason_or_default(&self) -> &str {
        if self.reason.is_empty() {
            canonical_reason(self.status)
        } else {
            &self.reason
        }
    }
}

/// Canonical reason phrase for a status code (empty for unknown codes).
pub fn canonical_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// Hop-by-hop headers that must not cross the gateway (RFC 9110 §7.6.1).
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers in place. Keys are matched case-insensitively.
pub fn strip_hop_by_hop(headers: &mut BTreeMap<String, String>) {
    headers.retain(|name, _| !HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()));
}

/// Deserialize a string map, rejecting duplicate keys.
fn strict_string_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct StrictMapVisitor;

    impl<'de> Visitor<'de> for StrictMapVisitor {
        type Value = BTreeMap<String, String>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a string map without duplicate keys")
        }

        fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut map = BTreeMap::new();
            while let Some((key, value)) = access.next_entry::<String, String>()? {
                if map.insert(key.clone(), value).is_some() {
                    return Err(serde::de::Error::custom(format!("duplicate key: {key}")));
                }
            }
            Ok(map)
        }
    }

    deserializer.deserialize_map(StrictMapVisitor)
}
