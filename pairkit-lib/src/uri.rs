//! Connection URI format.
//!
//! A pairing proposal travels out of band (QR code, deep link) as a single
//! string:
//!
//! ```text
//! pair:{topic}@{version}?relay-protocol={proto}&key={hex-public-key}&controller={bool}
//! ```
//!
//! An optional `relay-params` query item carries percent-encoded JSON for
//! relay protocols that need parameters. Format and parse round-trip:
//! `parse(format(x)) == x` for every valid proposal.

use crate::crypto::PublicKey;
use crate::errors::{PairkitError, Result};
use crate::types::{RelayProtocolOptions, Topic};

pub const URI_SCHEME: &str = "pair";
pub const PROTOCOL_VERSION: u32 = 1;

/// The parsed contents of a connection URI: everything a responder needs to
/// answer a pairing proposal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingUri {
    pub topic: Topic,
    pub version: u32,
    pub public_key: PublicKey,
    pub controller: bool,
    pub relay: RelayProtocolOptions,
}

impl PairingUri {
    pub fn new(
        topic: Topic,
        public_key: PublicKey,
        controller: bool,
        relay: RelayProtocolOptions,
    ) -> Self {
        Self {
            topic,
            version: PROTOCOL_VERSION,
            public_key,
            controller,
            relay,
        }
    }

    pub fn format(&self) -> String {
        let mut uri = format!(
            "{URI_SCHEME}:{}@{}?relay-protocol={}&key={}&controller={}",
            self.topic, self.version, self.relay.protocol, self.public_key, self.controller
        );
        if let Some(params) = &self.relay.params {
            uri.push_str("&relay-params=");
            uri.push_str(&percent_encode(&params.to_string()));
        }
        uri
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        let rest = uri
            .strip_prefix(&format!("{URI_SCHEME}:"))
            .ok_or_else(|| PairkitError::MalformedUri(format!("missing {URI_SCHEME}: scheme")))?;

        let (address, query) = rest
            .split_once('?')
            .ok_or_else(|| PairkitError::MalformedUri("missing query".into()))?;
        let (topic, version) = address
            .split_once('@')
            .ok_or_else(|| PairkitError::MalformedUri("missing @version".into()))?;
        if topic.is_empty() {
            return Err(PairkitError::MalformedUri("empty topic".into()));
        }
        let version: u32 = version
            .parse()
            .map_err(|_| PairkitError::MalformedUri(format!("bad version: {version}")))?;

        let mut protocol = None;
        let mut relay_params = None;
        let mut key = None;
        let mut controller = None;
        for item in query.split('&') {
            let Some((name, value)) = item.split_once('=') else {
                return Err(PairkitError::MalformedUri(format!("bad query item: {item}")));
            };
            match name {
                "relay-protocol" => protocol = Some(value.to_string()),
                "relay-params" => {
                    let decoded = percent_decode(value)?;
                    let parsed = serde_json::from_str(&decoded).map_err(|e| {
                        PairkitError::MalformedUri(format!("bad relay-params: {e}"))
                    })?;
                    relay_params = Some(parsed);
                }
                "key" => {
                    key = Some(PublicKey::from_hex(value).map_err(|e| {
                        PairkitError::MalformedUri(format!("bad key: {e}"))
                    })?)
                }
                "controller" => {
                    controller = Some(value.parse::<bool>().map_err(|_| {
                        PairkitError::MalformedUri(format!("bad controller flag: {value}"))
                    })?)
                }
                // forward compatibility: unknown query items are ignored
                _ => {}
            }
        }

        Ok(Self {
            topic: Topic(topic.to_string()),
            version,
            public_key: key
                .ok_or_else(|| PairkitError::MalformedUri("missing key".into()))?,
            controller: controller
                .ok_or_else(|| PairkitError::MalformedUri("missing controller".into()))?,
            relay: RelayProtocolOptions {
                protocol: protocol
                    .ok_or_else(|| PairkitError::MalformedUri("missing relay-protocol".into()))?,
                params: relay_params,
            },
        })
    }
}

impl std::fmt::Display for PairingUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

impl std::str::FromStr for PairingUri {
    type Err = PairkitError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn percent_decode(encoded: &str) -> Result<String> {
    let mut bytes = Vec::with_capacity(encoded.len());
    let mut chars = encoded.bytes();
    while let Some(b) = chars.next() {
        if b == b'%' {
            let hi = chars.next();
            let lo = chars.next();
            let (Some(hi), Some(lo)) = (hi, lo) else {
                return Err(PairkitError::MalformedUri("truncated percent encoding".into()));
            };
            let value = u8::from_str_radix(&format!("{}{}", hi as char, lo as char), 16)
                .map_err(|_| PairkitError::MalformedUri("bad percent encoding".into()))?;
            bytes.push(value);
        } else {
            bytes.push(b);
        }
    }
    String::from_utf8(bytes)
        .map_err(|_| PairkitError::MalformedUri("percent-decoded data is not utf-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_key() -> PublicKey {
        PublicKey::from_bytes([0xab; 32])
    }

    #[test]
    fn format_parse_round_trip() {
        let uri = PairingUri::new(
            Topic::generate(),
            sample_key(),
            false,
            RelayProtocolOptions::new("waku"),
        );
        assert_eq!(PairingUri::parse(&uri.format()).unwrap(), uri);
    }

    #[test]
    fn round_trip_with_relay_params() {
        let uri = PairingUri::new(
            Topic::generate(),
            sample_key(),
            true,
            RelayProtocolOptions {
                protocol: "bridge".into(),
                params: Some(json!({"region": "eu", "ttl": 86400})),
            },
        );
        assert_eq!(PairingUri::parse(&uri.format()).unwrap(), uri);
    }

    #[test]
    fn parse_rejects_malformed() {
        let cases = [
            "",
            "wss://relay.example.org",
            "pair:abc123",
            "pair:@1?relay-protocol=waku&key=00&controller=false",
            "pair:abc@1?relay-protocol=waku&controller=false",
            "pair:abc@1?relay-protocol=waku&key=zz&controller=false",
            "pair:abc@1?relay-protocol=waku&key=00&controller=maybe",
            "pair:abc@one?relay-protocol=waku&key=00&controller=false",
        ];
        for case in cases {
            assert!(
                matches!(PairingUri::parse(case), Err(PairkitError::MalformedUri(_))),
                "expected MalformedUri for {case:?}"
            );
        }
    }

    #[test]
    fn unknown_query_items_are_ignored() {
        let uri = PairingUri::new(
            Topic::generate(),
            sample_key(),
            false,
            RelayProtocolOptions::new("waku"),
        );
        let with_extra = format!("{}&future-field=7", uri.format());
        assert_eq!(PairingUri::parse(&with_extra).unwrap(), uri);
    }

    #[test]
    fn percent_round_trip() {
        let raw = r#"{"a":"b c","n":1}"#;
        assert_eq!(percent_decode(&percent_encode(raw)).unwrap(), raw);
    }
}
