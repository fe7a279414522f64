//! Identity derivation and QR/contact-exchange codecs.
//!
//! The 32-byte static public key IS the identity. Everything here is a pure
//! function of that key — no state, no I/O — so independent implementations
//! derive byte-identical Hash IDs and QR URIs.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Base32-like alphabet, omitting the visually ambiguous `0`, `O`, `1`, `I`, `L`.
const ALPHABET: &[u8; 32] = b"23456789ABCDEFGHJKMNPQRSTUVWXYZ";

fn base32_char(index: u8) -> u8 {
    ALPHABET[index as usize]
}

fn base32_index(c: u8) -> Option<u8> {
    ALPHABET.iter().position(|&a| a == c).map(|i| i as u8)
}

/// Derives the 8-character Hash ID from a public key: the first 40 bits of
/// `SHA-256(pk)`, re-encoded 5 bits per character.
pub fn hash_id(pk: &[u8; 32]) -> String {
    let digest = Sha256::digest(pk);
    encode_base32_40bits(&digest[..5])
}

fn encode_base32_40bits(bytes: &[u8]) -> String {
    debug_assert_eq!(bytes.len(), 5);
    let bits: u64 = bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);
    let mut out = String::with_capacity(8);
    for i in 0..8 {
        let shift = 40 - 5 * (i + 1);
        let idx = ((bits >> shift) & 0x1F) as u8;
        out.push(base32_char(idx) as char);
    }
    out
}

/// Validates that `s` is a well-formed Hash ID: exactly 8 characters, all
/// drawn from the Hash ID alphabet.
pub fn is_valid_hash_id(s: &str) -> bool {
    s.len() == 8 && s.bytes().all(|b| base32_index(b).is_some())
}

fn checksum(hash: &str) -> String {
    let digest = Sha256::digest(hash.as_bytes());
    let bits = u16::from_be_bytes([digest[0], digest[1]]);
    let mut out = String::with_capacity(2);
    for i in 0..2u32 {
        let shift = 16 - 5 * (i + 1);
        let idx = ((bits >> shift) & 0x1F) as u8;
        out.push(base32_char(idx) as char);
    }
    out
}

/// Builds the shareable QR/link form: `bitchat://add/<hash>/<checksum>`.
pub fn qr_uri(pk: &[u8; 32]) -> String {
    let hash = hash_id(pk);
    let chk = checksum(&hash);
    format!("bitchat://add/{hash}/{chk}")
}

/// Parses a `bitchat://add/<hash>/<checksum>` URI, returning the embedded
/// Hash ID once the checksum has been verified.
///
/// Rejects anything that doesn't match the shape exactly, per the external
/// interface contract: no trailing slashes, no query strings, no case
/// folding.
pub fn parse_qr_uri(s: &str) -> Result<String> {
    let rest = s.strip_prefix("bitchat://add/").ok_or(Error::MalformedUri)?;
    let mut parts = rest.split('/');
    let hash = parts.next().ok_or(Error::MalformedUri)?;
    let chk = parts.next().ok_or(Error::MalformedUri)?;
    if parts.next().is_some() {
        return Err(Error::MalformedUri);
    }
    if !is_valid_hash_id(hash) || chk.len() != 2 || !chk.bytes().all(|b| base32_index(b).is_some())
    {
        return Err(Error::MalformedUri);
    }
    if checksum(hash) != chk {
        return Err(Error::ChecksumMismatch);
    }
    Ok(hash.to_string())
}

/// Lowercase-hex `SHA-256(pk)` — the durable identifier used for
/// block/favorite lookups, distinct from the truncated Hash ID.
pub fn fingerprint(pk: &[u8; 32]) -> String {
    hex::encode(Sha256::digest(pk))
}

/// The compact contact-exchange record carried in a QR code or in-band
/// introduction, per the external interface contract: `{v, n, npk, spk?}`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ContactExchangePayload {
    /// Payload version. Currently always `1`.
    pub v: u8,
    /// The sender's self-announced display name. Non-empty.
    pub n: String,
    /// The sender's Noise static public key, 64 lowercase hex characters.
    pub npk: String,
    /// The sender's optional signing public key, 64 lowercase hex characters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spk: Option<String>,
}

fn is_lowercase_hex_64(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl ContactExchangePayload {
    /// Serializes to the compact JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidInput(e.to_string()))
    }

    /// Parses and validates a JSON payload, failing closed on any mismatch
    /// against the external interface contract (non-empty nickname, exact
    /// 64-lowercase-hex keys).
    pub fn from_json(s: &str) -> Result<Self> {
        let payload: ContactExchangePayload =
            serde_json::from_str(s).map_err(|e| Error::InvalidInput(e.to_string()))?;
        if payload.n.is_empty() {
            return Err(Error::InvalidInput("empty display name".into()));
        }
        if !is_lowercase_hex_64(&payload.npk) {
            return Err(Error::InvalidInput("malformed npk".into()));
        }
        if let Some(spk) = &payload.spk {
            if !is_lowercase_hex_64(spk) {
                return Err(Error::InvalidInput("malformed spk".into()));
            }
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Frozen fixture table (§8 scenario 1): recomputed directly from the
    // algorithm above, not copied from the illustrative example in the
    // design doc, which the design doc itself says to recompute and freeze.
    const FIXTURES: &[(&[u8; 32], &str, &str)] = &[
        (&[0u8; 32], "EUP9QDHT", "UQ"),
        (&[0xFFu8; 32], "QZD38YJH", "KH"),
        (
            &[
                0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22,
                23, 24, 25, 26, 27, 28, 29, 30, 31,
            ],
            "EE8XVCD8",
            "UW",
        ),
        (&[0x42u8; 32], "ABHFBU75", "TR"),
        (
            &[
                0x00, 0x07, 0x0e, 0x15, 0x1c, 0x23, 0x2a, 0x31, 0x38, 0x3f, 0x46, 0x4d, 0x54, 0x5b,
                0x62, 0x69, 0x70, 0x77, 0x7e, 0x85, 0x8c, 0x93, 0x9a, 0xa1, 0xa8, 0xaf, 0xb6, 0xbd,
                0xc4, 0xcb, 0xd2, 0xd9,
            ],
            "7SZR2CNV",
            "TW",
        ),
    ];

    #[test]
    fn hash_id_fixtures() {
        for (pk, hash, _chk) in FIXTURES {
            assert_eq!(hash_id(pk), *hash);
        }
    }

    #[test]
    fn qr_uri_round_trips_through_parse() {
        for (pk, hash, _) in FIXTURES {
            let uri = qr_uri(pk);
            assert_eq!(parse_qr_uri(&uri).unwrap(), *hash);
        }
    }

    #[test]
    fn qr_uri_has_expected_shape() {
        let (pk, hash, chk) = FIXTURES[0];
        assert_eq!(qr_uri(pk), format!("bitchat://add/{hash}/{chk}"));
    }

    #[test]
    fn corrupting_any_character_breaks_the_round_trip() {
        let uri = qr_uri(FIXTURES[0].0);
        let bytes = uri.into_bytes();
        for i in 0..bytes.len() {
            let mut corrupted = bytes.clone();
            // Flip within the alphabet's ASCII range so it stays parseable
            // as a different, wrong character rather than accidentally
            // producing invalid UTF-8.
            corrupted[i] = if corrupted[i] == b'Z' { b'2' } else { corrupted[i] + 1 };
            let s = String::from_utf8(corrupted).unwrap();
            if s == uri {
                continue;
            }
            assert!(parse_qr_uri(&s).is_err(), "expected {s} to fail to parse");
        }
    }

    #[test]
    fn rejects_malformed_uris() {
        assert!(matches!(parse_qr_uri("not-a-uri"), Err(Error::MalformedUri)));
        assert!(matches!(
            parse_qr_uri("bitchat://add/TOOLONGHASH/UQ"),
            Err(Error::MalformedUri)
        ));
        assert!(matches!(
            parse_qr_uri("bitchat://add/EUP9QDHT/UQ/extra"),
            Err(Error::MalformedUri)
        ));
    }

    #[test]
    fn is_valid_hash_id_rejects_bad_alphabet_and_length() {
        assert!(is_valid_hash_id("EUP9QDHT"));
        assert!(!is_valid_hash_id("EUP9QDH")); // too short
        assert!(!is_valid_hash_id("EUP9QDH0")); // '0' not in alphabet
        assert!(!is_valid_hash_id("eup9qdht")); // lowercase not in alphabet
    }

    #[test]
    fn fingerprint_is_full_hex_sha256() {
        let fp = fingerprint(&[0u8; 32]);
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, "66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f292");
    }

    #[test]
    fn contact_exchange_payload_round_trips() {
        let payload = ContactExchangePayload {
            v: 1,
            n: "Alice".to_string(),
            npk: "a".repeat(64),
            spk: None,
        };
        let json = payload.to_json().unwrap();
        assert_eq!(ContactExchangePayload::from_json(&json).unwrap(), payload);
    }

    #[test]
    fn contact_exchange_payload_rejects_bad_keys() {
        let bad = format!(r#"{{"v":1,"n":"Alice","npk":"{}"}}"#, "z".repeat(64));
        assert!(ContactExchangePayload::from_json(&bad).is_err());

        let short = r#"{"v":1,"n":"Alice","npk":"abcd"}"#;
        assert!(ContactExchangePayload::from_json(short).is_err());

        let empty_name = format!(r#"{{"v":1,"n":"","npk":"{}"}}"#, "a".repeat(64));
        assert!(ContactExchangePayload::from_json(&empty_name).is_err());
    }
}
