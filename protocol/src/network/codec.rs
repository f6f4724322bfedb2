//! Envelope wire format.
//!
//! ```text
//!   ┌──────────┬─────────────┬─────────────────────────┐
//!   │ magic 4B │ version 4B  │ bincode(Envelope)       │
//!   │ "XMRX"   │ big endian  │ length-limited, strict  │
//!   └──────────┴─────────────┴─────────────────────────┘
//! ```
//!
//! The version sits in the header so an envelope from a newer peer is
//! rejected before its body is parsed.

use bincode::Options;
use thiserror::Error;

use super::messages::Envelope;
use crate::config::{
    MAX_ENVELOPE_SIZE, MESSAGE_VERSION, MIN_SUPPORTED_MESSAGE_VERSION, PROTOCOL_MAGIC,
};

const HEADER_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("envelope too short: {0} bytes")]
    Truncated(usize),

    #[error("bad magic {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported message version {0}")]
    UnsupportedVersion(u32),

    #[error("envelope of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("header version {header} does not match body version {body}")]
    VersionMismatch { header: u32, body: u32 },

    #[error("malformed envelope: {0}")]
    Malformed(String),
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_ENVELOPE_SIZE as u64)
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let body = wire_options()
        .serialize(envelope)
        .map_err(|e| CodecError::Malformed(e.to_string()))?;
    let size = HEADER_LEN + body.len();
    if size > MAX_ENVELOPE_SIZE {
        return Err(CodecError::TooLarge {
            size,
            limit: MAX_ENVELOPE_SIZE,
        });
    }
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
    out.extend_from_slice(&envelope.version.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    if bytes.len() > MAX_ENVELOPE_SIZE {
        return Err(CodecError::TooLarge {
            size: bytes.len(),
            limit: MAX_ENVELOPE_SIZE,
        });
    }
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated(bytes.len()));
    }
    let (header, body) = bytes.split_at(HEADER_LEN);
    let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if magic != PROTOCOL_MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if !(MIN_SUPPORTED_MESSAGE_VERSION..=MESSAGE_VERSION).contains(&version) {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let envelope: Envelope = wire_options()
        .deserialize(body)
        .map_err(|e| CodecError::Malformed(e.to_string()))?;
    if envelope.version != version {
        return Err(CodecError::VersionMismatch {
            header: version,
            body: envelope.version,
        });
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeKeypair;
    use crate::network::messages::{PaymentSent, ProtocolMessage};
    use crate::network::NodeAddress;

    fn envelope() -> Envelope {
        let keys = NodeKeypair::from_seed(&[4u8; 32]);
        Envelope::new(
            "trade-9",
            NodeAddress::new("buyer.onion"),
            keys.public_key(),
            3,
            ProtocolMessage::PaymentSent(PaymentSent {
                counter_currency_tx_id: Some("SEPA-77".into()),
                payout_tx_hex: Some("abcd".into()),
                updated_multisig_hex: None,
            }),
        )
    }

    #[test]
    fn test_encode_decode() {
        let env = envelope();
        let bytes = encode(&env).unwrap();
        assert_eq!(&bytes[..4], b"XMRX");
        assert_eq!(decode(&bytes).unwrap(), env);
    }

    #[test]
    fn test_rejects_bad_magic_and_truncation() {
        let mut bytes = encode(&envelope()).unwrap();
        assert_eq!(decode(&bytes[..5]), Err(CodecError::Truncated(5)));
        bytes[0] = b'Y';
        assert!(matches!(decode(&bytes), Err(CodecError::BadMagic(_))));
    }

    #[test]
    fn test_rejects_future_version_before_parsing_body() {
        let mut bytes = encode(&envelope()).unwrap();
        bytes[4..8].copy_from_slice(&(MESSAGE_VERSION + 1).to_be_bytes());
        bytes.truncate(HEADER_LEN + 1);
        assert_eq!(
            decode(&bytes),
            Err(CodecError::UnsupportedVersion(MESSAGE_VERSION + 1))
        );
    }

    #[test]
    fn test_rejects_malformed_body_and_trailing_bytes() {
        let mut bytes = encode(&envelope()).unwrap();
        let mut garbage = bytes.clone();
        garbage.truncate(garbage.len() - 3);
        assert!(matches!(decode(&garbage), Err(CodecError::Malformed(_))));

        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_rejects_oversize_input() {
        let bytes = vec![0u8; MAX_ENVELOPE_SIZE + 1];
        assert!(matches!(decode(&bytes), Err(CodecError::TooLarge { .. })));
    }
}
