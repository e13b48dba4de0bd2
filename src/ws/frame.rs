//! WebSocket frame codec (RFC 6455 Section 5)
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! ```

use super::{CloseCode, Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest payload a control frame may carry
pub const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    /// Set on the first frame of a compressed message
    pub rsv1: bool,
    pub opcode: OpCode,
    /// Unmasked payload
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>, fin: bool) -> Self {
        Frame {
            fin,
            rsv1: false,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Frame::new(OpCode::Ping, payload, true)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Frame::new(OpCode::Pong, payload, true)
    }

    /// Close frame; the reason is cut to fit the control frame limit
    pub fn close(code: CloseCode, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code.as_u16());
        let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        payload.put_slice(&reason.as_bytes()[..end]);
        Frame::new(OpCode::Close, payload.freeze(), true)
    }

    /// Code and reason of a close frame
    ///
    /// An empty payload reports [`CloseCode::NoStatus`]. A one-byte payload,
    /// an unsendable code or a non-UTF-8 reason is a protocol error.
    pub fn close_reason(&self) -> Result<(CloseCode, String)> {
        match self.payload.len() {
            0 => Ok((CloseCode::NoStatus, String::new())),
            1 => Err(Error::Protocol("close payload of one byte".to_string())),
            _ => {
                let code = CloseCode::from_u16(u16::from_be_bytes([self.payload[0], self.payload[1]]));
                if !code.is_sendable() {
                    return Err(Error::Protocol(format!("invalid close code {}", code)));
                }
                let reason = std::str::from_utf8(&self.payload[2..])
                    .map_err(|_| Error::InvalidUtf8)?;
                Ok((code, reason.to_string()))
            }
        }
    }
}

/// XOR `data` with the masking key, starting at key offset 0
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Stateless frame parser and encoder
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
    /// Client frames must be masked
    require_mask: bool,
    /// RSV1 is allowed when permessage-deflate was negotiated
    allow_rsv1: bool,
}

impl FrameCodec {
    /// Codec for the server side: masked input required
    pub fn server(max_frame_size: usize, deflate: bool) -> Self {
        FrameCodec {
            max_frame_size,
            require_mask: true,
            allow_rsv1: deflate,
        }
    }

    /// Codec for the client side, used by tests and tools
    pub fn client(max_frame_size: usize, deflate: bool) -> Self {
        FrameCodec {
            max_frame_size,
            require_mask: false,
            allow_rsv1: deflate,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Take one frame off the front of `buf`
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched until a whole frame is
    /// buffered.
    pub fn parse(&self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let b0 = buf[0];
        let b1 = buf[1];

        let fin = b0 & 0x80 != 0;
        let rsv1 = b0 & 0x40 != 0;
        if b0 & 0x30 != 0 {
            return Err(Error::Protocol("RSV2/RSV3 set".to_string()));
        }
        if rsv1 && !self.allow_rsv1 {
            return Err(Error::Protocol("RSV1 set without an extension".to_string()));
        }
        let opcode = OpCode::from_u8(b0 & 0x0F)
            .ok_or_else(|| Error::Protocol(format!("unknown opcode {:#x}", b0 & 0x0F)))?;

        let masked = b1 & 0x80 != 0;
        if self.require_mask && !masked {
            return Err(Error::Protocol("unmasked client frame".to_string()));
        }

        let (len, mut offset) = match b1 & 0x7F {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                let len = u64::from_be_bytes(raw);
                if len >> 63 != 0 {
                    return Err(Error::Protocol("64-bit length with high bit set".to_string()));
                }
                (len, 10)
            }
            n => (n as u64, 2),
        };

        if opcode.is_control() {
            if !fin {
                return Err(Error::Protocol("fragmented control frame".to_string()));
            }
            if len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(Error::Protocol(format!("control frame of {} bytes", len)));
            }
            if rsv1 {
                return Err(Error::Protocol("RSV1 on a control frame".to_string()));
            }
        }
        if len > self.max_frame_size as u64 {
            return Err(Error::FrameTooLarge(len));
        }

        let mask = if masked {
            if buf.len() < offset + 4 {
                return Ok(None);
            }
            let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
            offset += 4;
            Some(key)
        } else {
            None
        };

        let len = len as usize;
        if buf.len() < offset + len {
            buf.reserve(offset + len - buf.len());
            return Ok(None);
        }

        buf.advance(offset);
        let mut payload = buf.split_to(len);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin,
            rsv1,
            opcode,
            payload: payload.freeze(),
        }))
    }

    /// Serialize a frame, masking it when `mask` is given
    pub fn encode(frame: &Frame, mask: Option<[u8; 4]>, out: &mut BytesMut) {
        let mut b0 = frame.opcode as u8;
        if frame.fin {
            b0 |= 0x80;
        }
        if frame.rsv1 {
            b0 |= 0x40;
        }
        out.put_u8(b0);

        let mask_bit = if mask.is_some() { 0x80 } else { 0 };
        let len = frame.payload.len();
        if len < 126 {
            out.put_u8(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            out.put_u8(mask_bit | 126);
            out.put_u16(len as u16);
        } else {
            out.put_u8(mask_bit | 127);
            out.put_u64(len as u64);
        }

        match mask {
            Some(key) => {
                out.put_slice(&key);
                let start = out.len();
                out.put_slice(&frame.payload);
                apply_mask(&mut out[start..], key);
            }
            None => out.put_slice(&frame.payload),
        }
    }

    /// Split one message into frames of at most `max_frame_size` bytes
    ///
    /// The first frame carries the opcode and `rsv1`; the rest are
    /// continuations. An empty payload still yields one final frame.
    pub fn fragment(opcode: OpCode, payload: Bytes, max_frame_size: usize, rsv1: bool) -> Vec<Frame> {
        let max = max_frame_size.max(1);
        if payload.len() <= max {
            return vec![Frame {
                fin: true,
                rsv1,
                opcode,
                payload,
            }];
        }

        let count = payload.len().div_ceil(max);
        (0..count)
            .map(|i| {
                let start = i * max;
                let end = (start + max).min(payload.len());
                Frame {
                    fin: i + 1 == count,
                    rsv1: rsv1 && i == 0,
                    opcode: if i == 0 { opcode } else { OpCode::Continuation },
                    payload: payload.slice(start..end),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masked(frame: &Frame) -> BytesMut {
        let mut out = BytesMut::new();
        FrameCodec::encode(frame, Some([0x37, 0xfa, 0x21, 0x3d]), &mut out);
        out
    }

    #[test]
    fn test_rfc_masked_hello() {
        // RFC 6455 Section 5.7
        let mut buf = BytesMut::from(
            &[0x81u8, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58][..],
        );
        let codec = FrameCodec::server(1024, false);
        let frame = codec.parse(&mut buf).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(&frame.payload[..], b"Hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_input() {
        let encoded = masked(&Frame::new(OpCode::Binary, vec![7u8; 300], true));
        let codec = FrameCodec::server(1024, false);
        for cut in [1, 3, 7, 100] {
            let mut buf = BytesMut::from(&encoded[..cut]);
            assert!(codec.parse(&mut buf).unwrap().is_none());
            assert_eq!(buf.len(), cut);
        }
        let mut buf = encoded.clone();
        let frame = codec.parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 300);
    }

    #[test]
    fn test_extended_lengths() {
        let codec = FrameCodec::client(1 << 20, false);
        for len in [125usize, 126, 65535, 65536] {
            let mut out = BytesMut::new();
            FrameCodec::encode(&Frame::new(OpCode::Binary, vec![1u8; len], true), None, &mut out);
            let frame = codec.parse(&mut out).unwrap().unwrap();
            assert_eq!(frame.payload.len(), len);
        }
    }

    #[test]
    fn test_unmasked_client_frame_rejected() {
        let mut out = BytesMut::new();
        FrameCodec::encode(&Frame::new(OpCode::Text, "hi", true), None, &mut out);
        let err = FrameCodec::server(1024, false).parse(&mut out).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_control_frame_rules() {
        let codec = FrameCodec::server(1024, false);

        let mut buf = masked(&Frame::new(OpCode::Ping, "x", false));
        assert!(matches!(codec.parse(&mut buf), Err(Error::Protocol(_))));

        let mut buf = masked(&Frame::new(OpCode::Ping, vec![0u8; 126], true));
        assert!(matches!(codec.parse(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_unknown_opcode_and_rsv() {
        let codec = FrameCodec::server(1024, false);
        let mut buf = BytesMut::from(&[0x83u8, 0x80, 0, 0, 0, 0][..]);
        assert!(matches!(codec.parse(&mut buf), Err(Error::Protocol(_))));

        let mut frame = Frame::new(OpCode::Text, "x", true);
        frame.rsv1 = true;
        let mut buf = masked(&frame);
        assert!(matches!(codec.parse(&mut buf), Err(Error::Protocol(_))));
        let mut buf = masked(&frame);
        assert!(FrameCodec::server(1024, true).parse(&mut buf).unwrap().unwrap().rsv1);
    }

    #[test]
    fn test_frame_size_limit() {
        let mut buf = masked(&Frame::new(OpCode::Binary, vec![0u8; 200], true));
        assert!(matches!(
            FrameCodec::server(100, false).parse(&mut buf),
            Err(Error::FrameTooLarge(200))
        ));
    }

    #[test]
    fn test_fragment() {
        let frames = FrameCodec::fragment(OpCode::Text, Bytes::from_static(b"abcdefg"), 3, true);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].opcode, OpCode::Text);
        assert!(frames[0].rsv1 && !frames[0].fin);
        assert_eq!(frames[1].opcode, OpCode::Continuation);
        assert!(!frames[1].rsv1);
        assert!(frames[2].fin);
        assert_eq!(&frames[2].payload[..], b"g");

        let single = FrameCodec::fragment(OpCode::Binary, Bytes::new(), 3, false);
        assert_eq!(single.len(), 1);
        assert!(single[0].fin);
    }

    #[test]
    fn test_close_payload() {
        let frame = Frame::close(CloseCode::Normal, "bye");
        assert_eq!(frame.close_reason().unwrap(), (CloseCode::Normal, "bye".to_string()));

        let long = "é".repeat(100);
        let frame = Frame::close(CloseCode::GoingAway, &long);
        assert!(frame.payload.len() <= MAX_CONTROL_PAYLOAD);
        assert!(frame.close_reason().is_ok());

        let empty = Frame::new(OpCode::Close, Bytes::new(), true);
        assert_eq!(empty.close_reason().unwrap().0, CloseCode::NoStatus);

        let bad = Frame::new(OpCode::Close, vec![0x03u8, 0xEC], true);
        assert!(bad.close_reason().is_err());
    }
}
