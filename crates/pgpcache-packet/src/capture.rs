//! Capture/replay reader.
//!
//! [`CaptureReader`] sits between a byte source and a generic OpenPGP
//! decoder. It frames the stream one packet at a time, records every byte it
//! draws from the source, and then serves the decoder those same bytes, so the
//! decoder sees an untouched stream. Private-key packets are additionally kept
//! verbatim, keyed by key id, for later storage.

use pgp::armor::Dearmor;
use std::collections::HashMap;
use std::io::{self, BufRead, Read};
use std::sync::{Mutex, PoisonError};
use zeroize::Zeroizing;

use pgpcache_core::KeyId;

use crate::framer::{read_header, BodyReader, LengthKind, PacketTag};

/// Reports the key id of private-key packets.
pub trait PacketDecoder {
    /// Decode one packet body. Returns the key id for a private-key or
    /// private-subkey packet and `None` for anything else. The body need not
    /// be consumed completely.
    fn private_key_id(&self, tag: PacketTag, body: &mut dyn Read) -> io::Result<Option<KeyId>>;
}

impl<T: PacketDecoder + ?Sized> PacketDecoder for &T {
    fn private_key_id(&self, tag: PacketTag, body: &mut dyn Read) -> io::Result<Option<KeyId>> {
        (**self).private_key_id(tag, body)
    }
}

/// Copies everything read from `inner` into `captured`.
struct Tee<'a, R> {
    inner: &'a mut R,
    captured: &'a mut Vec<u8>,
}

impl<R: Read> Read for Tee<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.captured.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

enum State {
    /// The next read captures a whole packet before serving any of it.
    Capturing,
    /// Serving a captured packet.
    Replaying {
        captured: Zeroizing<Vec<u8>>,
        pos: usize,
        then_pass_through: bool,
    },
    /// Reading the source directly (after an indeterminate-length packet).
    PassThrough,
}

pub struct CaptureReader<R, D> {
    inner: R,
    decoder: D,
    state: State,
    keys: Mutex<HashMap<KeyId, Zeroizing<Vec<u8>>>>,
}

impl<R: Read, D: PacketDecoder> CaptureReader<R, D> {
    pub fn new(inner: R, decoder: D) -> Self {
        CaptureReader {
            inner,
            decoder,
            state: State::Capturing,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Raw bytes (header included) of the private-key packet for `id`, if one
    /// has been read.
    pub fn private_key(&self, id: KeyId) -> Option<Zeroizing<Vec<u8>>> {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Ids of every private-key packet captured so far.
    pub fn captured_ids(&self) -> Vec<KeyId> {
        let mut ids: Vec<KeyId> = self
            .keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    /// Frame and capture one packet. `Ok(None)` at a clean end of stream.
    fn capture_packet(&mut self) -> io::Result<Option<State>> {
        let mut captured = Zeroizing::new(Vec::new());

        let header = {
            let mut tee = Tee {
                inner: &mut self.inner,
                captured: &mut captured,
            };
            match read_header(&mut tee)? {
                Some(h) => h,
                None => return Ok(None),
            }
        };

        if header.length == LengthKind::Indeterminate && !header.tag.is_private_key() {
            tracing::trace!(tag = %header.tag, "indeterminate-length packet, passing through");
            return Ok(Some(State::Replaying {
                captured,
                pos: 0,
                then_pass_through: true,
            }));
        }

        let key_id = {
            let tee = Tee {
                inner: &mut self.inner,
                captured: &mut captured,
            };
            let mut body = BodyReader::new(tee, header.length);
            let key_id = match self.decoder.private_key_id(header.tag, &mut body) {
                Ok(id) => id,
                Err(e) => {
                    tracing::debug!(tag = %header.tag, "packet decoder rejected packet: {e}");
                    None
                }
            };
            io::copy(&mut body, &mut io::sink())?;
            key_id
        };

        if header.tag.is_private_key() {
            if let Some(id) = key_id {
                let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
                keys.entry(id).or_insert_with(|| {
                    tracing::debug!(key_id = %id, len = captured.len(), "captured private key packet");
                    Zeroizing::new(captured.to_vec())
                });
            }
        }

        Ok(Some(State::Replaying {
            captured,
            pos: 0,
            then_pass_through: false,
        }))
    }
}

impl<A: BufRead, D: PacketDecoder> CaptureReader<Dearmor<A>, D> {
    /// Strip ASCII armor from `input` and capture the packets inside it.
    /// Malformed armor surfaces as an `InvalidData` error on read.
    pub fn from_armored(input: A, decoder: D) -> Self {
        CaptureReader::new(Dearmor::new(input), decoder)
    }
}

impl<R: Read, D: PacketDecoder> Read for CaptureReader<R, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match &mut self.state {
                State::PassThrough => return self.inner.read(buf),
                State::Replaying {
                    captured,
                    pos,
                    then_pass_through,
                } => {
                    if *pos < captured.len() {
                        let n = (captured.len() - *pos).min(buf.len());
                        buf[..n].copy_from_slice(&captured[*pos..*pos + n]);
                        *pos += n;
                        return Ok(n);
                    }
                    self.state = if *then_pass_through {
                        State::PassThrough
                    } else {
                        State::Capturing
                    };
                }
                State::Capturing => match self.capture_packet()? {
                    Some(next) => self.state = next,
                    None => return Ok(0),
                },
            }
        }
    }
}
