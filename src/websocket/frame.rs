//! WebSocket frame encoding and decoding
//!
//! Stateless functions over byte buffers. Decoding goes through
//! [`FrameCursor`], which validates every length against the bytes that are
//! actually available before advancing.
//!
//! ```text
//!  0               1               2               3
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |            (16/64)            |
//! |N|V|V|V|       |S|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Masking-key (0 or 4 bytes, present only if MASK is set)   |
//! +---------------------------------------------------------------+
//! |                          Payload Data                         |
//! +---------------------------------------------------------------+
//! ```

use super::error::{ProtocolError, ProtocolResult};

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_BITS: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LENGTH_BITS: u8 = 0x7F;

/// Largest payload length that fits in the 7-bit field
const MAX_SHORT_LENGTH: usize = 125;
/// Marker for a 16-bit extended length
const EXTENDED_16: u8 = 126;
/// Marker for a 64-bit extended length
const EXTENDED_64: u8 = 127;

/// Largest possible frame header: 2 + 8 (length) + 4 (mask)
pub const MAX_HEADER_LEN: usize = 14;

/// Frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    /// Wire value of this opcode
    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    /// Parse a 4-bit opcode; reserved values are rejected
    pub fn from_u8(value: u8) -> ProtocolResult<Self> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(ProtocolError::InvalidOpcode(other)),
        }
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    /// Payload, already unmasked
    pub payload: Vec<u8>,
    /// Whether the sender applied a mask
    pub masked: bool,
}

impl Frame {
    /// True if the peer requested the connection be closed
    pub fn is_close(&self) -> bool {
        self.opcode == Opcode::Close
    }

    /// Payload interpreted as UTF-8, lossy
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Bounds-checked reader over a frame buffer
///
/// Every read checks the remaining length first and reports how many bytes
/// the frame needs in total when the buffer is short.
pub struct FrameCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Take the next `n` bytes
    pub fn take(&mut self, n: usize) -> ProtocolResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(ProtocolError::InvalidLength)?;
        if end > self.buf.len() {
            return Err(ProtocolError::TruncatedFrame {
                needed: end,
                available: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> ProtocolResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> ProtocolResult<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u64(&mut self) -> ProtocolResult<u64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn read_mask(&mut self) -> ProtocolResult<[u8; 4]> {
        let bytes = self.take(4)?;
        Ok([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

/// XOR `payload` in place with the 4-byte mask key
///
/// Applying the same key twice restores the original bytes.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Encode an unmasked server-to-client frame with FIN set
pub fn encode(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MAX_HEADER_LEN + payload.len());
    write_header(&mut frame, opcode, payload.len(), false);
    frame.extend_from_slice(payload);
    frame
}

/// Encode a masked frame, as a client would send it
pub fn encode_masked(opcode: Opcode, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MAX_HEADER_LEN + payload.len());
    write_header(&mut frame, opcode, payload.len(), true);
    frame.extend_from_slice(&key);

    let start = frame.len();
    frame.extend_from_slice(payload);
    apply_mask(&mut frame[start..], key);
    frame
}

/// Minimal close frame with an empty payload
pub fn close_frame() -> Vec<u8> {
    encode(Opcode::Close, &[])
}

fn write_header(frame: &mut Vec<u8>, opcode: Opcode, len: usize, masked: bool) {
    let mask = if masked { MASK_BIT } else { 0 };
    frame.push(FIN_BIT | opcode.as_u8());

    if len <= MAX_SHORT_LENGTH {
        frame.push(mask | len as u8);
    } else if len <= u16::MAX as usize {
        frame.push(mask | EXTENDED_16);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(mask | EXTENDED_64);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

/// Decode one frame from the start of `buf`
///
/// Returns the frame and the number of bytes it occupied, so that several
/// frames received in one read can be decoded back to back.
pub fn decode(buf: &[u8]) -> ProtocolResult<(Frame, usize)> {
    let mut cursor = FrameCursor::new(buf);

    let first = cursor.read_u8()?;
    let second = cursor.read_u8()?;

    if first & RSV_BITS != 0 {
        return Err(ProtocolError::ReservedBits);
    }

    let opcode = Opcode::from_u8(first & OPCODE_BITS)?;
    match opcode {
        Opcode::Continuation => return Err(ProtocolError::FragmentedFrame),
        Opcode::Ping | Opcode::Pong => {
            return Err(ProtocolError::UnsupportedOpcode(opcode.as_u8()))
        }
        _ => {}
    }
    if first & FIN_BIT == 0 {
        return Err(ProtocolError::FragmentedFrame);
    }

    let masked = second & MASK_BIT != 0;
    let payload_len = match second & LENGTH_BITS {
        EXTENDED_16 => cursor.read_u16()? as usize,
        EXTENDED_64 => {
            let len = cursor.read_u64()?;
            if len & (1 << 63) != 0 {
                return Err(ProtocolError::InvalidLength);
            }
            usize::try_from(len).map_err(|_| ProtocolError::InvalidLength)?
        }
        short => short as usize,
    };

    let mask = if masked {
        Some(cursor.read_mask()?)
    } else {
        None
    };

    let mut payload = cursor.take(payload_len)?.to_vec();
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    Ok((
        Frame {
            opcode,
            payload,
            masked,
        },
        cursor.position(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_length_boundaries() {
        for len in [0usize, 125, 126, 65535, 65536] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let encoded = encode(Opcode::Text, &payload);
            let (frame, consumed) = decode(&encoded).unwrap();

            assert_eq!(consumed, encoded.len(), "length {}", len);
            assert_eq!(frame.opcode, Opcode::Text);
            assert_eq!(frame.payload, payload, "length {}", len);
            assert!(!frame.masked);
        }
    }

    #[test]
    fn test_length_encoding_layout() {
        assert_eq!(&encode(Opcode::Text, &[0; 125])[..2], &[0x81, 125]);
        assert_eq!(&encode(Opcode::Text, &[0; 126])[..4], &[0x81, 126, 0x00, 0x7E]);
        assert_eq!(&encode(Opcode::Text, &[0; 65535])[..4], &[0x81, 126, 0xFF, 0xFF]);
        assert_eq!(
            &encode(Opcode::Text, &[0; 65536])[..10],
            &[0x81, 127, 0, 0, 0, 0, 0, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn test_masking_is_an_involution() {
        let original = b"The quick brown fox jumps over the lazy dog".to_vec();
        for key in [[0u8; 4], [0xFF; 4], [0x37, 0xFA, 0x21, 0x3D], [1, 2, 3, 4]] {
            let mut data = original.clone();
            apply_mask(&mut data, key);
            apply_mask(&mut data, key);
            assert_eq!(data, original);
        }
    }

    #[test]
    fn test_decode_masked_client_frame() {
        // Single-frame masked text message "Hello" from RFC 6455 section 5.7
        let bytes = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        let (frame, consumed) = decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert!(frame.masked);
        assert_eq!(frame.text(), "Hello");
    }

    #[test]
    fn test_encode_masked_round_trip() {
        let encoded = encode_masked(Opcode::Text, b"{\"hello\":1}", [9, 8, 7, 6]);
        assert_eq!(encoded[1] & MASK_BIT, MASK_BIT);

        let (frame, _) = decode(&encoded).unwrap();
        assert!(frame.masked);
        assert_eq!(frame.payload, b"{\"hello\":1}");
    }

    #[test]
    fn test_close_frame() {
        assert_eq!(close_frame(), vec![0x88, 0x00]);

        let client_close = encode_masked(Opcode::Close, &[], [1, 2, 3, 4]);
        let (frame, _) = decode(&client_close).unwrap();
        assert!(frame.is_close());
    }

    #[test]
    fn test_truncated_frames() {
        assert_eq!(
            decode(&[0x81]),
            Err(ProtocolError::TruncatedFrame {
                needed: 2,
                available: 1
            })
        );

        // Declares 5 payload bytes but carries 2
        assert_eq!(
            decode(&[0x81, 0x05, b'a', b'b']),
            Err(ProtocolError::TruncatedFrame {
                needed: 7,
                available: 4
            })
        );

        // Mask bit set, key cut short
        assert!(matches!(
            decode(&[0x81, 0x81, 0x01, 0x02]),
            Err(ProtocolError::TruncatedFrame { needed: 6, .. })
        ));

        // 64-bit length missing its tail
        assert!(matches!(
            decode(&[0x81, 127, 0, 0]),
            Err(ProtocolError::TruncatedFrame { needed: 10, .. })
        ));
    }

    #[test]
    fn test_huge_declared_length_is_not_read() {
        let mut bytes = vec![0x82, 127];
        bytes.extend_from_slice(&(u32::MAX as u64).to_be_bytes());
        bytes.extend_from_slice(b"tiny");

        match decode(&bytes) {
            Err(ProtocolError::TruncatedFrame { needed, available }) => {
                assert_eq!(available, bytes.len());
                assert!(needed > available);
            }
            other => panic!("expected truncation, got {:?}", other),
        }

        let mut bytes = vec![0x82, 127];
        bytes.extend_from_slice(&u64::MAX.to_be_bytes());
        assert_eq!(decode(&bytes), Err(ProtocolError::InvalidLength));
    }

    #[test]
    fn test_rejects_fragmentation_and_control_frames() {
        // FIN clear on a text frame
        assert_eq!(decode(&[0x01, 0x00]), Err(ProtocolError::FragmentedFrame));
        // Continuation
        assert_eq!(decode(&[0x80, 0x00]), Err(ProtocolError::FragmentedFrame));
        // Ping and pong
        assert_eq!(decode(&[0x89, 0x00]), Err(ProtocolError::UnsupportedOpcode(0x9)));
        assert_eq!(decode(&[0x8A, 0x00]), Err(ProtocolError::UnsupportedOpcode(0xA)));
        // Reserved opcode
        assert_eq!(decode(&[0x83, 0x00]), Err(ProtocolError::InvalidOpcode(0x3)));
        // RSV1
        assert_eq!(decode(&[0xC1, 0x00]), Err(ProtocolError::ReservedBits));
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut bytes = encode_masked(Opcode::Text, b"one", [1, 1, 1, 1]);
        bytes.extend(encode_masked(Opcode::Text, b"two", [2, 2, 2, 2]));

        let (first, used) = decode(&bytes).unwrap();
        let (second, rest) = decode(&bytes[used..]).unwrap();

        assert_eq!(first.text(), "one");
        assert_eq!(second.text(), "two");
        assert_eq!(used + rest, bytes.len());
    }

    #[test]
    fn test_cursor_bounds() {
        let mut cursor = FrameCursor::new(&[1, 2, 3]);
        assert_eq!(cursor.read_u16().unwrap(), 0x0102);
        assert_eq!(cursor.remaining(), 1);
        assert!(cursor.read_u16().is_err());
        assert_eq!(cursor.position(), 2);
        assert_eq!(cursor.read_u8().unwrap(), 3);
    }
}
