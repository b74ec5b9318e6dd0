//! Length-prefixed 9P frame assembly over an arbitrary byte stream.
//!
//! The transport is byte-oriented and need not preserve message boundaries;
//! the codec buffers reads until one complete frame is available and hands it
//! out without copying the body.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{DecodeError, Error};
use crate::fcall::{FRAMEHDRSZ, Msg};
use crate::serialize;
use crate::{io_err, utils::Result};

/// One complete 9P frame: size[4] type[1] tag[2] body[size-7].
///
/// The header fields are parsed eagerly so that the tag stays available even
/// when the body turns out to be garbage.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Total frame length including the size field itself
    pub size: u32,
    /// Message type byte
    pub typ: u8,
    /// Transaction tag
    pub tag: u16,
    /// Message body, a view into the read buffer
    pub body: Bytes,
}

impl Frame {
    /// Parse the body into a typed message.
    pub fn parse(&self) -> ::std::result::Result<Msg, DecodeError> {
        serialize::decode_body(self.typ, self.tag, &self.body)
    }
}

/// Codec producing one [`Frame`] per complete message and emitting framed
/// messages on the write side. Both directions refuse frames longer than the
/// negotiated msize.
#[derive(Debug)]
pub struct FrameCodec {
    msize: u32,
}

impl FrameCodec {
    pub fn new(msize: u32) -> FrameCodec {
        FrameCodec { msize }
    }

    pub fn msize(&self) -> u32 {
        self.msize
    }

    /// Tighten the frame limit once version negotiation settles on a smaller
    /// msize.
    pub fn set_msize(&mut self, msize: u32) {
        self.msize = msize;
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let size = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if size < FRAMEHDRSZ {
            return Err(Error::Decode(DecodeError::Malformed(format!(
                "declared size {} below frame header",
                size
            ))));
        }
        if size > self.msize {
            return Err(Error::FrameTooLarge {
                size,
                msize: self.msize,
            });
        }

        if src.len() < size as usize {
            src.reserve(size as usize - src.len());
            return Ok(None);
        }

        let frame = src.split_to(size as usize).freeze();
        let typ = frame[4];
        let tag = u16::from_le_bytes([frame[5], frame[6]]);

        Ok(Some(Frame {
            size,
            typ,
            tag,
            body: frame.slice(FRAMEHDRSZ as usize..),
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(Error::Io(io_err!(
                UnexpectedEof,
                "connection closed mid-frame"
            ))),
        }
    }
}

impl Encoder<&Msg> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, msg: &Msg, dst: &mut BytesMut) -> Result<()> {
        let frame = serialize::encode_msg(msg)?;
        if frame.len() as u64 > self.msize as u64 {
            return Err(Error::FrameTooLarge {
                size: frame.len() as u32,
                msize: self.msize,
            });
        }

        dst.extend_from_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::*;

    fn rflush_frame() -> Bytes {
        serialize::encode_msg(&Msg {
            tag: 9,
            body: FCall::RFlush,
        })
        .unwrap()
    }

    #[test]
    fn short_reads_produce_no_frame() {
        let mut codec = FrameCodec::new(8192);
        let mut buf = BytesMut::new();

        let frame = rflush_frame();
        for &byte in frame.iter().take(frame.len() - 1) {
            buf.extend_from_slice(&[byte]);
            assert!(codec.decode(&mut buf).unwrap().is_none());
        }

        buf.extend_from_slice(&frame[frame.len() - 1..]);
        let out = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(out.size as usize, frame.len());
        assert_eq!(out.typ, MsgType::RFlush as u8);
        assert_eq!(out.tag, 9);
        assert!(out.body.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn back_to_back_frames_split_cleanly() {
        let mut codec = FrameCodec::new(8192);
        let mut buf = BytesMut::new();

        let a = serialize::encode_msg(&Msg {
            tag: 1,
            body: FCall::TClunk { fid: 7 },
        })
        .unwrap();
        let b = rflush_frame();
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b);

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.tag, 1);
        assert_eq!(first.parse().unwrap().body, FCall::TClunk { fid: 7 });

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.tag, 9);
        assert!(buf.is_empty());
    }

    #[test]
    fn oversize_frame_is_fatal() {
        let mut codec = FrameCodec::new(4096);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&4097u32.to_le_bytes());
        buf.extend_from_slice(&[0u8; 16]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::FrameTooLarge { size: 4097, .. })
        ));
    }

    #[test]
    fn undersized_header_is_fatal() {
        let mut codec = FrameCodec::new(4096);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&3u32.to_le_bytes());

        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Decode(DecodeError::Malformed(_)))
        ));
    }

    #[test]
    fn eof_with_partial_frame_is_unexpected_eof() {
        let mut codec = FrameCodec::new(8192);
        let frame = rflush_frame();
        let mut buf = BytesMut::from(&frame[..frame.len() - 2]);

        match codec.decode_eof(&mut buf) {
            Err(Error::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected UnexpectedEof, got {:?}", other),
        }
    }

    #[test]
    fn encoder_refuses_frames_over_msize() {
        let mut codec = FrameCodec::new(32);
        let mut dst = BytesMut::new();
        let msg = Msg {
            tag: 1,
            body: FCall::RRead {
                data: Data(vec![0u8; 64]),
            },
        };

        assert!(matches!(
            codec.encode(&msg, &mut dst),
            Err(Error::FrameTooLarge { .. })
        ));
        assert!(dst.is_empty());
    }
}
