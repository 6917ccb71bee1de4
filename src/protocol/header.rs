use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Protocol revision carried in every frame header.
pub const FRAME_VERSION: u8 = 1;

/// Size of the wire header in bytes.
pub const FRAME_HEADER_LEN: usize = 16;

/// Upper bound on a frame body; chunks are capped well below this.
pub const MAX_FRAME_BODY: usize = 1024 * 1024;

pub const STATUS_OK: u8 = 0;
pub const STATUS_FAIL: u8 = 1;

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("unsupported frame version {0}")]
    VersionMismatch(u8),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("frame body of {0} bytes exceeds limit")]
    Oversized(u32),
    #[error("truncated frame")]
    Truncated,
    #[error("malformed control message: {0}")]
    BadControl(String),
    #[error("control message version mismatch for <{element}>: got {got:?}")]
    ControlVersionMismatch { element: String, got: Option<String> },
    #[error("unrecognized control element <{0}>")]
    UnknownControl(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Binary chunk write (and its empty-bodied reply).
    Data = 1,
    /// Binary chunk read request (reply carries the chunk bytes).
    Read = 2,
    /// XML control message.
    Xml = 3,
    /// XML control reply.
    XmlReply = 4,
}

impl Opcode {
    fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(Opcode::Data),
            2 => Ok(Opcode::Read),
            3 => Ok(Opcode::Xml),
            4 => Ok(Opcode::XmlReply),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

bitflags::bitflags! {
    pub struct HeaderFlags: u8 {
        /// Catalogue (ctfile) traffic as opposed to data-chunk traffic.
        const METADATA  = 0x01;
        const COMP_LZO  = 0x02;
        const COMP_LZMA = 0x04;
        const COMP_LZW  = 0x08;
    }
}

/// Fixed-size frame header. All multi-byte fields are big-endian on the
/// wire; [FrameHeader::wire] and [FrameHeader::unwire] convert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub opcode: Opcode,
    pub flags: HeaderFlags,
    pub status: u8,
    /// Body length in bytes.
    pub size: u32,
    /// Echoed packet id, used to correlate replies with transactions.
    pub tag: u64,
}

impl FrameHeader {
    pub fn new(opcode: Opcode, flags: HeaderFlags, tag: u64) -> Self {
        Self {
            version: FRAME_VERSION,
            opcode,
            flags,
            status: STATUS_OK,
            size: 0,
            tag,
        }
    }

    /// Serialize into wire order.
    pub fn wire(&self, dst: &mut BytesMut) {
        dst.put_u8(self.version);
        dst.put_u8(self.opcode as u8);
        dst.put_u8(self.flags.bits());
        dst.put_u8(self.status);
        dst.put_u32(self.size);
        dst.put_u64(self.tag);
    }

    /// Parse from wire order. Consumes [FRAME_HEADER_LEN] bytes of `src`.
    pub fn unwire(src: &mut BytesMut) -> Result<Self, ProtocolError> {
        if src.len() < FRAME_HEADER_LEN {
            return Err(ProtocolError::Truncated);
        }
        let version = src.get_u8();
        if version != FRAME_VERSION {
            return Err(ProtocolError::VersionMismatch(version));
        }
        let opcode = Opcode::from_u8(src.get_u8())?;
        let flags = HeaderFlags::from_bits_truncate(src.get_u8());
        let status = src.get_u8();
        let size = src.get_u32();
        let tag = src.get_u64();
        Ok(Self {
            version,
            opcode,
            flags,
            status,
            size,
            tag,
        })
    }
}

/// One wire packet.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Bytes,
}

impl Frame {
    pub fn new(header: FrameHeader, body: Bytes) -> Self {
        Self { header, body }
    }
}

/// [Encoder]/[Decoder] implementation for [Frame]s.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if frame.body.len() > MAX_FRAME_BODY {
            return Err(ProtocolError::Oversized(frame.body.len() as u32));
        }
        let mut header = frame.header;
        header.size = frame.body.len() as u32;
        dst.reserve(FRAME_HEADER_LEN + frame.body.len());
        header.wire(dst);
        dst.put_slice(&frame.body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        // peek at the size field without consuming the header
        let size = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if size > MAX_FRAME_BODY {
            return Err(ProtocolError::Oversized(size as u32));
        }
        if src.len() < FRAME_HEADER_LEN + size {
            src.reserve(FRAME_HEADER_LEN + size - src.len());
            return Ok(None);
        }

        let header = FrameHeader::unwire(src)?;
        let body = src.split_to(size).freeze();
        Ok(Some(Frame { header, body }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_wire_unwire_round_trip() {
        let mut header = FrameHeader::new(Opcode::Data, HeaderFlags::METADATA, 0xdead_beef_0042);
        header.size = 1234;
        header.status = STATUS_FAIL;

        let mut buf = BytesMut::new();
        header.wire(&mut buf);
        assert_eq!(buf.len(), FRAME_HEADER_LEN);

        let parsed = FrameHeader::unwire(&mut buf).unwrap();
        assert_eq!(parsed, header);
        assert!(buf.is_empty());
    }

    #[test]
    fn decoder_waits_for_full_frame() {
        let mut codec = FrameCodec::new();
        let mut header = FrameHeader::new(Opcode::Xml, HeaderFlags::METADATA, 7);
        header.size = 5;

        let mut wire = BytesMut::new();
        header.wire(&mut wire);
        wire.put_slice(b"hello");

        let mut partial = BytesMut::from(&wire[..FRAME_HEADER_LEN + 2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let frame = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(frame.header.tag, 7);
        assert_eq!(&frame.body[..], b"hello");
    }

    #[test]
    fn decoder_rejects_version_mismatch() {
        let mut codec = FrameCodec::new();
        let mut wire = BytesMut::new();
        let mut header = FrameHeader::new(Opcode::Xml, HeaderFlags::empty(), 1);
        header.size = 0;
        header.wire(&mut wire);
        wire[0] = 99;

        match codec.decode(&mut wire) {
            Err(ProtocolError::VersionMismatch(99)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn encoder_sets_size_from_body() {
        let mut codec = FrameCodec::new();
        let frame = Frame::new(
            FrameHeader::new(Opcode::Data, HeaderFlags::METADATA, 3),
            Bytes::from_static(b"abcd"),
        );
        let mut wire = BytesMut::new();
        codec.encode(frame, &mut wire).unwrap();

        let decoded = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded.header.size, 4);
        assert_eq!(&decoded.body[..], b"abcd");
    }
}
