//! pgpcache-packet: OpenPGP packet framing without cryptography
//!
//! - [`framer`]: header and length decoding (old/new format, partial-length
//!   chains), a de-framing [`BodyReader`], and packet writers
//! - [`capture`]: [`CaptureReader`], which records the exact bytes of every
//!   private-key packet while replaying the stream untouched to a decoder;
//!   armored input is stripped by `pgp::armor::Dearmor` first

pub mod capture;
pub mod error;
pub mod framer;

pub use capture::{CaptureReader, PacketDecoder};
pub use error::{FramingError, FramingResult};
pub use framer::{
    read_header, write_header, write_packet, write_partial_packet, BodyReader, Format,
    LengthKind, PacketHeader, PacketTag,
};
