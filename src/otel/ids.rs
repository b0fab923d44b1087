//! Trace and span identifier codec
//!
//! OTLP/JSON carries identifiers as base64 strings. Everything past the
//! ingest boundary (storage, query API, UI) uses fixed-length lowercase hex.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Which identifier is being decoded; fixes the expected byte length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Trace,
    Span,
}

impl IdKind {
    pub fn byte_len(&self) -> usize {
        match self {
            IdKind::Trace => 16,
            IdKind::Span => 8,
        }
    }

    pub fn hex_len(&self) -> usize {
        self.byte_len() * 2
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IdKind::Trace => "trace",
            IdKind::Span => "span",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("Invalid {kind} id '{value}': {reason}")]
    InvalidIdentifier {
        kind: &'static str,
        value: String,
        reason: String,
    },
}

impl IdError {
    fn new(kind: IdKind, value: &str, reason: impl Into<String>) -> Self {
        IdError::InvalidIdentifier {
            kind: kind.as_str(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Decode a base64 OTLP identifier into lowercase hex
pub fn decode_id(b64: &str, kind: IdKind) -> Result<String, IdError> {
    let bytes = STANDARD
        .decode(b64)
        .map_err(|e| IdError::new(kind, b64, e.to_string()))?;

    if bytes.len() != kind.byte_len() {
        return Err(IdError::new(
            kind,
            b64,
            format!("expected {} bytes, got {}", kind.byte_len(), bytes.len()),
        ));
    }

    Ok(hex::encode(bytes))
}

/// Encode a canonical hex identifier back to its OTLP base64 form
pub fn encode_id(hex_id: &str, kind: IdKind) -> Result<String, IdError> {
    validate_hex_id(hex_id, kind)?;
    let bytes = hex::decode(hex_id).map_err(|e| IdError::new(kind, hex_id, e.to_string()))?;
    Ok(STANDARD.encode(bytes))
}

/// Normalize an identifier arriving at the ingest boundary.
///
/// Already-hex identifiers (as sent by some SDKs and by tests) pass through
/// lowercased; anything else must be valid base64 of the right length.
/// A 16 byte value is 24 base64 chars and an 8 byte value is 12, so the two
/// encodings can never be confused.
pub fn normalize_id(raw: &str, kind: IdKind) -> Result<String, IdError> {
    let raw = raw.trim();
    if raw.len() == kind.hex_len() && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Ok(raw.to_ascii_lowercase());
    }
    decode_id(raw, kind)
}

/// Normalize an optional identifier; empty strings mean "absent"
pub fn normalize_optional_id(raw: Option<&str>, kind: IdKind) -> Result<Option<String>, IdError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => normalize_id(value, kind).map(Some),
    }
}

/// Check that an identifier is in canonical storage form.
///
/// Used at the query API boundary, where no base64 or mixed case is accepted.
pub fn validate_hex_id(hex_id: &str, kind: IdKind) -> Result<(), IdError> {
    if hex_id.len() != kind.hex_len() {
        return Err(IdError::new(
            kind,
            hex_id,
            format!("expected {} hex chars, got {}", kind.hex_len(), hex_id.len()),
        ));
    }
    if !hex_id
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(IdError::new(kind, hex_id, "not lowercase hex"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_trace_id() {
        let hex = decode_id("W4qlotLIcugyHPNzCNad8g==", IdKind::Trace).unwrap();
        assert_eq!(hex, "5b8aa5a2d2c872e8321cf37308d69df2");
        assert_eq!(hex.len(), 32);
    }

    #[test]
    fn test_decode_span_id() {
        let hex = decode_id("BRWBvzy1XBM=", IdKind::Span).unwrap();
        assert_eq!(hex, "051581bf3cb55c13");
        assert_eq!(hex.len(), 16);
    }

    #[test]
    fn test_round_trip() {
        for b64 in ["W4qlotLIcugyHPNzCNad8g==", "AAAAAAAAAAAAAAAAAAAAAA==", "/////////////////////w=="] {
            let hex = decode_id(b64, IdKind::Trace).unwrap();
            assert_eq!(encode_id(&hex, IdKind::Trace).unwrap(), b64);
        }
        let hex = decode_id("BRWBvzy1XBM=", IdKind::Span).unwrap();
        assert_eq!(encode_id(&hex, IdKind::Span).unwrap(), "BRWBvzy1XBM=");
    }

    #[test]
    fn test_wrong_length_rejected() {
        // 8 bytes is a span id, not a trace id
        assert!(decode_id("BRWBvzy1XBM=", IdKind::Trace).is_err());
        assert!(decode_id("W4qlotLIcugyHPNzCNad8g==", IdKind::Span).is_err());
    }

    #[test]
    fn test_malformed_base64_rejected() {
        let err = decode_id("not base64!!", IdKind::Span).unwrap_err();
        assert!(err.to_string().contains("span"));
    }

    #[test]
    fn test_hex_passes_through() {
        assert_eq!(
            normalize_id("5B8AA5A2D2C872E8321CF37308D69DF2", IdKind::Trace).unwrap(),
            "5b8aa5a2d2c872e8321cf37308d69df2"
        );
        assert_eq!(
            normalize_id("051581bf3cb55c13", IdKind::Span).unwrap(),
            "051581bf3cb55c13"
        );
        assert_eq!(
            normalize_id("BRWBvzy1XBM=", IdKind::Span).unwrap(),
            "051581bf3cb55c13"
        );
    }

    #[test]
    fn test_optional_ids() {
        assert_eq!(normalize_optional_id(None, IdKind::Span).unwrap(), None);
        assert_eq!(normalize_optional_id(Some(""), IdKind::Span).unwrap(), None);
        assert!(normalize_optional_id(Some("zz"), IdKind::Span).is_err());
    }

    #[test]
    fn test_validate_hex_id() {
        assert!(validate_hex_id("5b8aa5a2d2c872e8321cf37308d69df2", IdKind::Trace).is_ok());
        assert!(validate_hex_id("5B8AA5A2D2C872E8321CF37308D69DF2", IdKind::Trace).is_err());
        assert!(validate_hex_id("5b8aa5a2d2c872e8", IdKind::Trace).is_err());
        assert!(validate_hex_id("5b8aa5a2d2c872e8321cf37308d69df2ff", IdKind::Trace).is_err());
        assert!(validate_hex_id("051581bf3cb55c1g", IdKind::Span).is_err());
    }
}
