//! OpenPGP packet header and length framing.
//!
//! Old format: tag in bits 5..2 of the tag byte, length width chosen by the
//! two low bits (1, 2, or 4 bytes, or indeterminate).
//!
//! New format: tag in the low six bits, followed by
//!   - `< 192`: one-octet length
//!   - `192..=223`: two-octet length `((b0 - 192) << 8) + b1 + 192`
//!   - `224..=254`: partial chunk of `1 << (b0 & 0x1f)`, more chunks follow
//!   - `255`: four-octet big-endian length

use std::fmt;
use std::io::{self, Read, Write};

use crate::error::{FramingError, FramingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketTag(pub u8);

impl PacketTag {
    pub const PUBLIC_KEY_ENCRYPTED_SESSION_KEY: PacketTag = PacketTag(1);
    pub const SIGNATURE: PacketTag = PacketTag(2);
    pub const SYMMETRIC_KEY_ENCRYPTED_SESSION_KEY: PacketTag = PacketTag(3);
    pub const PRIVATE_KEY: PacketTag = PacketTag(5);
    pub const PUBLIC_KEY: PacketTag = PacketTag(6);
    pub const PRIVATE_SUBKEY: PacketTag = PacketTag(7);
    pub const MARKER: PacketTag = PacketTag(10);
    pub const LITERAL_DATA: PacketTag = PacketTag(11);
    pub const USER_ID: PacketTag = PacketTag(13);
    pub const PUBLIC_SUBKEY: PacketTag = PacketTag(14);

    /// Private-key and private-subkey packets; the only ones captured.
    pub fn is_private_key(self) -> bool {
        self == PacketTag::PRIVATE_KEY || self == PacketTag::PRIVATE_SUBKEY
    }
}

impl fmt::Display for PacketTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            PacketTag::PUBLIC_KEY_ENCRYPTED_SESSION_KEY => "pkesk",
            PacketTag::SIGNATURE => "signature",
            PacketTag::SYMMETRIC_KEY_ENCRYPTED_SESSION_KEY => "skesk",
            PacketTag::PRIVATE_KEY => "private-key",
            PacketTag::PUBLIC_KEY => "public-key",
            PacketTag::PRIVATE_SUBKEY => "private-subkey",
            PacketTag::MARKER => "marker",
            PacketTag::LITERAL_DATA => "literal-data",
            PacketTag::USER_ID => "user-id",
            PacketTag::PUBLIC_SUBKEY => "public-subkey",
            PacketTag(other) => return write!(f, "tag-{other}"),
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Old,
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthKind {
    Fixed(u64),
    /// First chunk of a partial-length chain.
    Partial(u64),
    /// Old format only: the body runs to the end of the stream.
    Indeterminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub tag: PacketTag,
    pub format: Format,
    pub length: LengthKind,
}

impl PacketHeader {
    /// Reader over this packet's logical body, drawn from `r`.
    pub fn body<R: Read>(&self, r: R) -> BodyReader<R> {
        BodyReader::new(r, self.length)
    }
}

fn read_full<R: Read + ?Sized>(r: &mut R, buf: &mut [u8]) -> FramingResult<()> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FramingError::UnexpectedEnd
        } else {
            FramingError::Io(e)
        }
    })
}

/// Read one packet header. `Ok(None)` means the stream ended cleanly at a
/// packet boundary.
pub fn read_header<R: Read + ?Sized>(r: &mut R) -> FramingResult<Option<PacketHeader>> {
    let mut first = [0u8; 1];
    loop {
        match r.read(&mut first) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FramingError::Io(e)),
        }
    }
    let b0 = first[0];

    if b0 & 0x80 == 0 {
        return Err(FramingError::Structural(
            "tag byte does not have MSB set".into(),
        ));
    }

    if b0 & 0x40 == 0 {
        let tag = PacketTag((b0 & 0x3f) >> 2);
        let length = match b0 & 3 {
            3 => LengthKind::Indeterminate,
            width => {
                let mut buf = [0u8; 4];
                let n = 1usize << width;
                read_full(r, &mut buf[..n])?;
                LengthKind::Fixed(buf[..n].iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
            }
        };
        return Ok(Some(PacketHeader {
            tag,
            format: Format::Old,
            length,
        }));
    }

    let tag = PacketTag(b0 & 0x3f);
    let (len, partial) = read_new_length(r)?;
    Ok(Some(PacketHeader {
        tag,
        format: Format::New,
        length: if partial {
            LengthKind::Partial(len)
        } else {
            LengthKind::Fixed(len)
        },
    }))
}

/// Read a new-format length; the flag is true for a partial chunk.
pub fn read_new_length<R: Read + ?Sized>(r: &mut R) -> FramingResult<(u64, bool)> {
    let mut buf = [0u8; 4];
    read_full(r, &mut buf[..1])?;
    match buf[0] {
        b @ 0..=191 => Ok((u64::from(b), false)),
        b @ 192..=223 => {
            let hi = u64::from(b - 192) << 8;
            read_full(r, &mut buf[..1])?;
            Ok((hi + u64::from(buf[0]) + 192, false))
        }
        b @ 224..=254 => Ok((1u64 << (b & 0x1f), true)),
        255 => {
            read_full(r, &mut buf)?;
            Ok((u64::from(u32::from_be_bytes(buf)), false))
        }
    }
}

/// The logical body of one packet. Partial chunks are joined transparently.
pub struct BodyReader<R> {
    inner: R,
    remaining: u64,
    partial: bool,
    to_end: bool,
}

impl<R: Read> BodyReader<R> {
    pub fn new(inner: R, length: LengthKind) -> Self {
        let (remaining, partial, to_end) = match length {
            LengthKind::Fixed(n) => (n, false, false),
            LengthKind::Partial(n) => (n, true, false),
            LengthKind::Indeterminate => (0, false, true),
        };
        BodyReader {
            inner,
            remaining,
            partial,
            to_end,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for BodyReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.to_end {
            return self.inner.read(buf);
        }
        while self.remaining == 0 {
            if !self.partial {
                return Ok(0);
            }
            let (len, partial) = read_new_length(&mut self.inner)?;
            self.remaining = len;
            self.partial = partial;
        }

        let want = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(FramingError::UnexpectedEnd.into());
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

// ── Writers ──────────────────────────────────────────────────────────────

fn encode_new_length(len: u64, out: &mut Vec<u8>) -> io::Result<()> {
    match len {
        0..=191 => out.push(len as u8),
        192..=8383 => {
            let l = len - 192;
            out.push((l >> 8) as u8 + 192);
            out.push(l as u8);
        }
        _ => {
            let l = u32::try_from(len).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "packet length exceeds 32 bits")
            })?;
            out.push(255);
            out.extend_from_slice(&l.to_be_bytes());
        }
    }
    Ok(())
}

fn new_tag_byte(tag: PacketTag) -> io::Result<u8> {
    if tag.0 > 0x3f {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("packet tag {} out of range", tag.0),
        ));
    }
    Ok(0xc0 | tag.0)
}

/// Write a new-format header with a definite length.
pub fn write_header<W: Write + ?Sized>(w: &mut W, tag: PacketTag, len: u64) -> io::Result<()> {
    let mut out = vec![new_tag_byte(tag)?];
    encode_new_length(len, &mut out)?;
    w.write_all(&out)
}

pub fn write_packet<W: Write + ?Sized>(w: &mut W, tag: PacketTag, body: &[u8]) -> io::Result<()> {
    write_header(w, tag, body.len() as u64)?;
    w.write_all(body)
}

/// Write `body` as a chain of partial chunks of `1 << exp` bytes for each
/// exponent in `chunk_exps`, then a terminal chunk with whatever is left.
/// Exponents beyond what the remaining body can fill are ignored.
pub fn write_partial_packet<W: Write + ?Sized>(
    w: &mut W,
    tag: PacketTag,
    body: &[u8],
    chunk_exps: &[u8],
) -> io::Result<()> {
    w.write_all(&[new_tag_byte(tag)?])?;
    let mut rest = body;
    for &exp in chunk_exps {
        if exp > 30 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("partial chunk exponent {exp} out of range"),
            ));
        }
        let size = 1usize << exp;
        if rest.len() < size {
            break;
        }
        w.write_all(&[0xe0 | exp])?;
        w.write_all(&rest[..size])?;
        rest = &rest[size..];
    }
    let mut out = Vec::with_capacity(5);
    encode_new_length(rest.len() as u64, &mut out)?;
    w.write_all(&out)?;
    w.write_all(rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn header(bytes: &[u8]) -> FramingResult<Option<PacketHeader>> {
        read_header(&mut &bytes[..])
    }

    #[test]
    fn test_old_format_lengths() {
        let h = header(&[0x80 | (6 << 2), 0x05]).unwrap().unwrap();
        assert_eq!(h.tag, PacketTag::PUBLIC_KEY);
        assert_eq!(h.format, Format::Old);
        assert_eq!(h.length, LengthKind::Fixed(5));

        let h = header(&[0x80 | (5 << 2) | 1, 0x01, 0x02]).unwrap().unwrap();
        assert_eq!(h.tag, PacketTag::PRIVATE_KEY);
        assert_eq!(h.length, LengthKind::Fixed(0x0102));

        let h = header(&[0x80 | (2 << 2) | 2, 0, 1, 0, 0]).unwrap().unwrap();
        assert_eq!(h.length, LengthKind::Fixed(0x0001_0000));

        let h = header(&[0x80 | (11 << 2) | 3]).unwrap().unwrap();
        assert_eq!(h.length, LengthKind::Indeterminate);
    }

    #[test]
    fn test_new_format_lengths() {
        assert_eq!(
            header(&[0xc0 | 13, 100]).unwrap().unwrap().length,
            LengthKind::Fixed(100)
        );
        assert_eq!(
            header(&[0xc0 | 13, 192, 0]).unwrap().unwrap().length,
            LengthKind::Fixed(192)
        );
        assert_eq!(
            header(&[0xc0 | 13, 223, 255]).unwrap().unwrap().length,
            LengthKind::Fixed(8383)
        );
        assert_eq!(
            header(&[0xc0 | 13, 255, 0, 0, 0x20, 0]).unwrap().unwrap().length,
            LengthKind::Fixed(8192)
        );
        assert_eq!(
            header(&[0xc0 | 11, 0xe9]).unwrap().unwrap().length,
            LengthKind::Partial(512)
        );
    }

    #[test]
    fn test_clean_eof_is_none() {
        assert!(header(&[]).unwrap().is_none());
    }

    #[test]
    fn test_missing_marker_bit_is_structural() {
        assert!(matches!(header(&[0x3f]), Err(FramingError::Structural(_))));
    }

    #[test]
    fn test_truncated_length_is_unexpected_end() {
        assert!(matches!(header(&[0xc0 | 2, 200]), Err(FramingError::UnexpectedEnd)));
        assert!(matches!(header(&[0x80 | (2 << 2) | 2, 0, 0]), Err(FramingError::UnexpectedEnd)));
    }

    #[test]
    fn test_short_body_is_unexpected_eof() {
        let data = [0xc0 | 11, 10, 1, 2, 3];
        let mut r = &data[..];
        let h = read_header(&mut r).unwrap().unwrap();
        let mut out = Vec::new();
        let err = h.body(r).read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_partial_chain_is_joined() {
        let body: Vec<u8> = (0..700u32).map(|i| i as u8).collect();
        let mut packet = Vec::new();
        write_partial_packet(&mut packet, PacketTag::LITERAL_DATA, &body, &[9, 7]).unwrap();
        assert_eq!(packet[1], 0xe9);

        let mut r = &packet[..];
        let h = read_header(&mut r).unwrap().unwrap();
        assert_eq!(h.length, LengthKind::Partial(512));
        let mut out = Vec::new();
        h.body(&mut r).read_to_end(&mut out).unwrap();
        assert_eq!(out, body);
        assert!(r.is_empty());
    }

    #[test]
    fn test_body_stops_at_packet_boundary() {
        let mut stream = Vec::new();
        write_packet(&mut stream, PacketTag::USER_ID, b"alice").unwrap();
        write_packet(&mut stream, PacketTag::USER_ID, b"bob").unwrap();

        let mut r = &stream[..];
        let h = read_header(&mut r).unwrap().unwrap();
        let mut first = Vec::new();
        h.body(&mut r).read_to_end(&mut first).unwrap();
        assert_eq!(first, b"alice");

        let h = read_header(&mut r).unwrap().unwrap();
        let mut second = Vec::new();
        h.body(&mut r).read_to_end(&mut second).unwrap();
        assert_eq!(second, b"bob");
        assert!(read_header(&mut r).unwrap().is_none());
    }

    #[test]
    fn test_tag_display() {
        assert_eq!(PacketTag::PRIVATE_SUBKEY.to_string(), "private-subkey");
        assert_eq!(PacketTag(60).to_string(), "tag-60");
    }

    proptest! {
        #[test]
        fn prop_new_length_roundtrip(len in 0u64..=u64::from(u32::MAX)) {
            let mut out = Vec::new();
            encode_new_length(len, &mut out).unwrap();
            let (decoded, partial) = read_new_length(&mut &out[..]).unwrap();
            prop_assert_eq!(decoded, len);
            prop_assert!(!partial);
        }

        #[test]
        fn prop_partial_reassembly(
            body in proptest::collection::vec(any::<u8>(), 0..4096),
            exps in proptest::collection::vec(0u8..10, 0..12),
        ) {
            let mut packet = Vec::new();
            write_partial_packet(&mut packet, PacketTag::LITERAL_DATA, &body, &exps).unwrap();
            let mut r = &packet[..];
            let h = read_header(&mut r).unwrap().unwrap();
            let mut out = Vec::new();
            h.body(&mut r).read_to_end(&mut out).unwrap();
            prop_assert_eq!(out, body);
            prop_assert!(r.is_empty());
        }
    }
}
