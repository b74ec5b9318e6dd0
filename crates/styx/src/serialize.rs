//! Serialize/deserialize 9P messages into/from binary.

use crate::error::DecodeError;
use crate::{fcall::*, io_err};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use num_traits::FromPrimitive;
use std::io::{Cursor, Read, Result};
use std::mem;
use std::ops::{Shl, Shr};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_truncate(decode!($buf))
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.take(size as u64).read_to_end(&mut buf)?;
    if buf.len() < size {
        return Err(io_err!(UnexpectedEof, "failed to fill whole buffer"));
    }
    Ok(buf)
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: decoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A wrapper class of ReadBytesExt to provide operator overloads
/// for deserializing
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }
    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let len = u16::try_from(self.len())
            .map_err(|_| io_err!(InvalidInput, "string too long for 9P"))?;
        let mut bytes = len.encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for QId {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &self.size()
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = u32::try_from(self.0.len())
            .map_err(|_| io_err!(InvalidInput, "data too long for 9P"))?;
        let bytes = size.encode(w)? + self.0.len();
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let len = u16::try_from(self.len())
            .map_err(|_| io_err!(InvalidInput, "list too long for 9P"))?;
        match self.iter().fold(Encoder::new(w) << &len, |acc, s| acc << s) {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::FCall::*;

        let typ = MsgType::from(&self.body);
        let buf = Encoder::new(w) << &(typ as u8) << &self.tag;

        let buf = match self.body {
            TVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            RVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            TAuth {
                ref afid,
                ref uname,
                ref aname,
            } => buf << afid << uname << aname,
            RAuth { ref aqid } => buf << aqid,
            TAttach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
            } => buf << fid << afid << uname << aname,
            RAttach { ref qid } => buf << qid,
            RError { ref ename } => buf << ename,
            TFlush { ref oldtag } => buf << oldtag,
            RFlush => buf,
            TWalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => buf << fid << newfid << wnames,
            RWalk { ref wqids } => buf << wqids,
            TOpen { ref fid, ref mode } => buf << fid << mode,
            ROpen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TCreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
            } => buf << fid << name << perm << mode,
            RCreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TRead {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            RRead { ref data } => buf << data,
            TWrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            RWrite { ref count } => buf << count,
            TClunk { ref fid } => buf << fid,
            RClunk => buf,
            TRemove { ref fid } => buf << fid,
            RRemove => buf,
            TStat { ref fid } => buf << fid,
            // Rstat and Twstat wrap the stat in a second size prefix: stat[n]
            RStat { ref stat } => buf << &(stat.size() + 2) << stat,
            TWStat { ref fid, ref stat } => buf << fid << &(stat.size() + 2) << stat,
            RWStat => buf,
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(InvalidData, "invalid UTF-8 sequence"))
    }
}

impl Decodable for QId {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(QId {
            typ: decode!(QIdType, *r),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let size: u16 = Decodable::decode(r)?;
        let body = read_exact(r, size as usize)?;

        let mut buf = Cursor::new(&body[..]);
        let stat = Stat {
            typ: decode!(buf),
            dev: decode!(buf),
            qid: decode!(buf),
            mode: decode!(buf),
            atime: decode!(buf),
            mtime: decode!(buf),
            length: decode!(buf),
            name: decode!(buf),
            uid: decode!(buf),
            gid: decode!(buf),
            muid: decode!(buf),
        };

        // The prefix promises exactly this many bytes of fields.
        if buf.position() as usize != body.len() {
            return Err(io_err!(InvalidData, "stat size prefix does not match fields"));
        }

        Ok(stat)
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

fn decode_fcall<R: ReadBytesExt>(msg_type: MsgType, r: &mut R) -> Result<FCall> {
    use crate::MsgType::*;

    let mut buf = r;

    let body = match msg_type {
        TVersion => FCall::TVersion {
            msize: decode!(buf),
            version: decode!(buf),
        },
        RVersion => FCall::RVersion {
            msize: decode!(buf),
            version: decode!(buf),
        },
        TAuth => FCall::TAuth {
            afid: decode!(buf),
            uname: decode!(buf),
            aname: decode!(buf),
        },
        RAuth => FCall::RAuth { aqid: decode!(buf) },
        TAttach => FCall::TAttach {
            fid: decode!(buf),
            afid: decode!(buf),
            uname: decode!(buf),
            aname: decode!(buf),
        },
        RAttach => FCall::RAttach { qid: decode!(buf) },
        RError => FCall::RError {
            ename: decode!(buf),
        },
        TFlush => FCall::TFlush {
            oldtag: decode!(buf),
        },
        RFlush => FCall::RFlush,
        TWalk => FCall::TWalk {
            fid: decode!(buf),
            newfid: decode!(buf),
            wnames: decode!(buf),
        },
        RWalk => FCall::RWalk {
            wqids: decode!(buf),
        },
        TOpen => FCall::TOpen {
            fid: decode!(buf),
            mode: decode!(buf),
        },
        ROpen => FCall::ROpen {
            qid: decode!(buf),
            iounit: decode!(buf),
        },
        TCreate => FCall::TCreate {
            fid: decode!(buf),
            name: decode!(buf),
            perm: decode!(buf),
            mode: decode!(buf),
        },
        RCreate => FCall::RCreate {
            qid: decode!(buf),
            iounit: decode!(buf),
        },
        TRead => FCall::TRead {
            fid: decode!(buf),
            offset: decode!(buf),
            count: decode!(buf),
        },
        RRead => FCall::RRead { data: decode!(buf) },
        TWrite => FCall::TWrite {
            fid: decode!(buf),
            offset: decode!(buf),
            data: decode!(buf),
        },
        RWrite => FCall::RWrite {
            count: decode!(buf),
        },
        TClunk => FCall::TClunk { fid: decode!(buf) },
        RClunk => FCall::RClunk,
        TRemove => FCall::TRemove { fid: decode!(buf) },
        RRemove => FCall::RRemove,
        TStat => FCall::TStat { fid: decode!(buf) },
        RStat => {
            let n: u16 = decode!(buf);
            let stat: Stat = decode!(buf);
            if n != stat.size() + 2 {
                return Err(io_err!(InvalidData, "stat wrapper size mismatch"));
            }
            FCall::RStat { stat }
        }
        TWStat => {
            let fid: u32 = decode!(buf);
            let n: u16 = decode!(buf);
            let stat: Stat = decode!(buf);
            if n != stat.size() + 2 {
                return Err(io_err!(InvalidData, "stat wrapper size mismatch"));
            }
            FCall::TWStat { fid, stat }
        }
        RWStat => FCall::RWStat,
    };

    Ok(body)
}

/// Decode a message body whose frame header has already been parsed.
pub fn decode_body(typ: u8, tag: u16, body: &[u8]) -> ::std::result::Result<Msg, DecodeError> {
    let msg_type = MsgType::from_u8(typ).ok_or(DecodeError::UnknownType(typ))?;

    let mut r = Cursor::new(body);
    let fcall = decode_fcall(msg_type, &mut r).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            DecodeError::Malformed("truncated message body".to_owned())
        } else {
            DecodeError::Malformed(e.to_string())
        }
    })?;

    let consumed = r.position() as usize;
    if consumed != body.len() {
        return Err(DecodeError::Malformed(format!(
            "{} trailing bytes after message body",
            body.len() - consumed
        )));
    }

    Ok(Msg { tag, body: fcall })
}

/// Decode one complete framed message from `buf`, returning it together with
/// the number of bytes consumed.
pub fn decode_msg(buf: &[u8]) -> ::std::result::Result<(Msg, usize), DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::ShortBuffer);
    }

    let size = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if size < FRAMEHDRSZ as usize {
        return Err(DecodeError::Malformed(format!(
            "declared size {} below frame header",
            size
        )));
    }
    if buf.len() < size {
        return Err(DecodeError::ShortBuffer);
    }

    let typ = buf[4];
    let tag = u16::from_le_bytes([buf[5], buf[6]]);
    let msg = decode_body(typ, tag, &buf[FRAMEHDRSZ as usize..size])?;

    Ok((msg, size))
}

/// Encode `msg` as a complete frame: size[4] type[1] tag[2] body.
pub fn encode_msg(msg: &Msg) -> Result<Bytes> {
    let mut writer = BytesMut::with_capacity(256).writer();
    0u32.encode(&mut writer)?;
    let body = msg.encode(&mut writer)?;

    let size = u32::try_from(body + 4)
        .map_err(|_| io_err!(InvalidInput, "message too large for u32 size field"))?;
    let mut buf = writer.into_inner();
    buf[..4].copy_from_slice(&size.to_le_bytes());

    Ok(buf.freeze())
}
