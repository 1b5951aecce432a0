//! Framing: 2-byte marker + bincode payload. Anything without the marker is application data.

use crate::protocol::Message;
use crate::radio::MAX_PAYLOAD_LEN;

/// Prefix identifying discovery frames.
pub const FRAME_MARKER: [u8; 2] = [0xE5, 0x70];

/// Encode a discovery message into one radio payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    if FRAME_MARKER.len() + payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(FRAME_MARKER.len() + payload.len());
    out.extend_from_slice(&FRAME_MARKER);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Whether a received payload claims to be a discovery frame.
pub fn is_discovery_frame(bytes: &[u8]) -> bool {
    bytes.starts_with(&FRAME_MARKER)
}

/// Decode a discovery frame. Payloads without the marker yield [`FrameDecodeError::NotDiscovery`].
pub fn decode_frame(bytes: &[u8]) -> Result<Message, FrameDecodeError> {
    if !is_discovery_frame(bytes) {
        return Err(FrameDecodeError::NotDiscovery);
    }
    if bytes.len() > MAX_PAYLOAD_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    bincode::deserialize(&bytes[FRAME_MARKER.len()..]).map_err(FrameDecodeError::Decode)
}

/// Error decoding a frame (no marker, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("not a discovery frame")]
    NotDiscovery,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Channel, HardwareAddress};

    fn server() -> HardwareAddress {
        HardwareAddress::new([0x5C, 0xCF, 0x7F, 0, 0, 1])
    }

    #[test]
    fn advertisement_survives_framing() {
        let msg = Message::advertisement(server(), Channel::new(7).unwrap(), 0xDEAD_BEEF);
        let frame = encode_frame(&msg).unwrap();
        assert!(is_discovery_frame(&frame));
        assert!(frame.len() < 32);
        assert_eq!(decode_frame(&frame).unwrap(), msg);
    }

    #[test]
    fn application_payload_is_not_discovery() {
        assert!(matches!(
            decode_frame(&1234u32.to_le_bytes()),
            Err(FrameDecodeError::NotDiscovery)
        ));
        assert!(matches!(decode_frame(&[]), Err(FrameDecodeError::NotDiscovery)));
    }

    #[test]
    fn truncated_frame_fails_to_decode() {
        let frame = encode_frame(&Message::probe(server(), 7)).unwrap();
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 3]),
            Err(FrameDecodeError::Decode(_))
        ));
    }

    #[test]
    fn zero_channel_is_rejected_on_decode() {
        let msg = Message::advertisement(server(), Channel::new(3).unwrap(), 1);
        let mut frame = encode_frame(&msg).unwrap();
        // Variant tag (4) + version (1) + address (6), then the channel byte.
        let channel_at = FRAME_MARKER.len() + 4 + 1 + 6;
        assert_eq!(frame[channel_at], 3);
        frame[channel_at] = 0;
        assert!(matches!(decode_frame(&frame), Err(FrameDecodeError::Decode(_))));
    }
}
