//! A toy OpenPGP backend with fixed packet layouts, plus helpers to build
//! keyrings and messages for it.
//!
//! Packet bodies:
//!   - public key / subkey: `id(8) usage(1) material..`
//!   - private key / subkey: `id(8) usage(1) passlen(1) pass.. material..`
//!     (a zero-length pass means the key is not protected)
//!   - user id: the name
//!   - signature: one byte (0 = no primary flag, 1 = not primary, 2 = primary);
//!     before any user id it is kept as a revocation
//!   - PKESK: recipient id(8); SKESK: the passphrase; literal data: plaintext

#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use zeroize::Zeroizing;

use pgpcache_core::KeyId;
use pgpcache_packet::{read_header, write_packet, PacketDecoder, PacketTag};
use pgpcache_secrets::{
    CacheError, CacheResult, Description, Found, MemoryCache, ObjectKind, Permission, SecureCache,
    Serial,
};
use pgpcache_store::{
    Entity, Identity, KeyRef, KeySource, KeyUsage, MessageDetails, OpenPgp, PgpError,
    PrivateKey, PromptError, PromptReply, Prompter, PublicKey, SelfSignature, Subkey,
};

const MAX_ROUNDS: usize = 8;

#[derive(Debug, Default)]
pub struct ToyPgp;

fn read_id(body: &[u8]) -> Result<KeyId, PgpError> {
    let bytes: [u8; 8] = body
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| PgpError::Structural("short key id".into()))?;
    Ok(KeyId::from_be_bytes(bytes))
}

fn public_from(body: &[u8]) -> Result<PublicKey, PgpError> {
    let key_id = read_id(body)?;
    let usage = *body
        .get(8)
        .ok_or_else(|| PgpError::Structural("missing usage".into()))?;
    Ok(PublicKey {
        key_id,
        fingerprint: body[..8].to_vec(),
        usage: KeyUsage(usage),
        material: body[9..].to_vec(),
    })
}

fn private_from(body: &[u8]) -> Result<(PublicKey, PrivateKey), PgpError> {
    let key_id = read_id(body)?;
    let usage = *body
        .get(8)
        .ok_or_else(|| PgpError::Structural("missing usage".into()))?;
    let pass_len = *body
        .get(9)
        .ok_or_else(|| PgpError::Structural("missing pass length".into()))? as usize;
    let material = body
        .get(10 + pass_len..)
        .ok_or_else(|| PgpError::Structural("short private key".into()))?;
    let public = PublicKey {
        key_id,
        fingerprint: body[..8].to_vec(),
        usage: KeyUsage(usage),
        material: material.to_vec(),
    };
    let private = PrivateKey {
        key_id,
        encrypted: pass_len > 0,
        material: Zeroizing::new(body.to_vec()),
    };
    Ok((public, private))
}

fn public_body(key: &PublicKey) -> Vec<u8> {
    let mut body = key.key_id.as_u64().to_be_bytes().to_vec();
    body.push(key.usage.0);
    body.extend_from_slice(&key.material);
    body
}

fn read_packets(input: &mut dyn Read) -> Result<Vec<(PacketTag, Vec<u8>)>, PgpError> {
    let mut packets = Vec::new();
    while let Some(header) = read_header(input)? {
        let mut body = Vec::new();
        header.body(&mut *input).read_to_end(&mut body)?;
        packets.push((header.tag, body));
    }
    Ok(packets)
}

impl PacketDecoder for ToyPgp {
    fn private_key_id(&self, tag: PacketTag, body: &mut dyn Read) -> io::Result<Option<KeyId>> {
        if !tag.is_private_key() {
            return Ok(None);
        }
        let mut id = [0u8; 8];
        body.read_exact(&mut id)?;
        Ok(Some(KeyId::from_be_bytes(id)))
    }
}

impl OpenPgp for ToyPgp {
    fn read_keyring(&self, input: &mut dyn Read) -> Result<Vec<Entity>, PgpError> {
        let mut entities: Vec<Entity> = Vec::new();
        for (tag, body) in read_packets(input)? {
            match tag {
                PacketTag::PUBLIC_KEY | PacketTag::PRIVATE_KEY => {
                    let (primary_key, private_key) = if tag == PacketTag::PRIVATE_KEY {
                        let (public, private) = private_from(&body)?;
                        (public, Some(private))
                    } else {
                        (public_from(&body)?, None)
                    };
                    entities.push(Entity {
                        primary_key,
                        private_key,
                        identities: Vec::new(),
                        subkeys: Vec::new(),
                        revocations: Vec::new(),
                    });
                }
                other => {
                    let entity = entities
                        .last_mut()
                        .ok_or_else(|| PgpError::Structural(format!("{other} before key")))?;
                    match other {
                        PacketTag::PUBLIC_SUBKEY => entity.subkeys.push(Subkey {
                            public_key: public_from(&body)?,
                            private_key: None,
                        }),
                        PacketTag::PRIVATE_SUBKEY => {
                            let (public_key, private) = private_from(&body)?;
                            entity.subkeys.push(Subkey {
                                public_key,
                                private_key: Some(private),
                            });
                        }
                        PacketTag::USER_ID => entity.identities.push(Identity {
                            name: String::from_utf8_lossy(&body).into_owned(),
                            self_signature: None,
                        }),
                        PacketTag::SIGNATURE => match entity.identities.last_mut() {
                            Some(ident) if ident.self_signature.is_none() => {
                                ident.self_signature = Some(SelfSignature {
                                    is_primary_id: match body.first() {
                                        Some(1) => Some(false),
                                        Some(2) => Some(true),
                                        _ => None,
                                    },
                                    packet: Vec::new(),
                                });
                            }
                            _ => entity.revocations.push(body),
                        },
                        _ => return Err(PgpError::Unsupported(format!("{other} in keyring"))),
                    }
                }
            }
        }
        Ok(entities)
    }

    fn serialize(&self, entity: &Entity, out: &mut dyn Write) -> Result<(), PgpError> {
        write_packet(out, PacketTag::PUBLIC_KEY, &public_body(&entity.primary_key))?;
        for rev in &entity.revocations {
            write_packet(out, PacketTag::SIGNATURE, rev)?;
        }
        for ident in &entity.identities {
            write_packet(out, PacketTag::USER_ID, ident.name.as_bytes())?;
            if let Some(sig) = &ident.self_signature {
                let flag = match sig.is_primary_id {
                    None => 0,
                    Some(false) => 1,
                    Some(true) => 2,
                };
                write_packet(out, PacketTag::SIGNATURE, &[flag])?;
            }
        }
        for sub in &entity.subkeys {
            write_packet(out, PacketTag::PUBLIC_SUBKEY, &public_body(&sub.public_key))?;
        }
        Ok(())
    }

    fn unlock(&self, key: &mut PrivateKey, passphrase: &[u8]) -> Result<(), PgpError> {
        if !key.encrypted {
            return Ok(());
        }
        let len = key.material.get(9).copied().unwrap_or(0) as usize;
        match key.material.get(10..10 + len) {
            Some(stored) if stored == passphrase => {
                key.encrypted = false;
                Ok(())
            }
            _ => Err(PgpError::WrongPassphrase(key.key_id)),
        }
    }

    fn read_message(
        &self,
        input: &mut dyn Read,
        keys: &dyn KeySource,
        prompt: &mut pgpcache_store::openpgp::PromptFn<'_>,
    ) -> Result<MessageDetails, PgpError> {
        let mut details = MessageDetails::default();
        let mut symmetric: Option<Vec<u8>> = None;
        let mut literal: Option<Vec<u8>> = None;
        for (tag, body) in read_packets(input)? {
            match tag {
                PacketTag::PUBLIC_KEY_ENCRYPTED_SESSION_KEY => {
                    details.encrypted_to.push(read_id(&body)?)
                }
                PacketTag::SYMMETRIC_KEY_ENCRYPTED_SESSION_KEY => symmetric = Some(body),
                PacketTag::LITERAL_DATA => literal = Some(body),
                other => return Err(PgpError::Unsupported(format!("{other} in message"))),
            }
        }
        let literal = literal.ok_or_else(|| PgpError::Structural("no literal data".into()))?;
        details.is_encrypted = !details.encrypted_to.is_empty() || symmetric.is_some();
        if !details.is_encrypted {
            details.body = Zeroizing::new(literal);
            return Ok(details);
        }

        let mut candidates: Vec<KeyRef> = details
            .encrypted_to
            .iter()
            .flat_map(|id| keys.keys_by_id(*id))
            .filter(|k| k.private_key.is_some())
            .collect();
        for _ in 0..MAX_ROUNDS {
            if let Some(k) = candidates
                .iter()
                .find(|k| k.private_key.as_ref().is_some_and(|p| !p.encrypted))
            {
                details.decrypted_with = Some(k.key_id());
                details.body = Zeroizing::new(literal);
                return Ok(details);
            }
            if candidates.is_empty() {
                break;
            }
            match prompt(&mut candidates, false)? {
                PromptReply::Unlocked => {}
                PromptReply::Passphrase(pass) => {
                    for c in candidates.iter_mut() {
                        if let Some(p) = c.private_key.as_mut() {
                            let _ = self.unlock(p, &pass);
                        }
                    }
                }
            }
        }

        if let Some(expected) = symmetric {
            details.is_symmetric = true;
            return match prompt(&mut [], true)? {
                PromptReply::Passphrase(pass) if pass.as_slice() == expected.as_slice() => {
                    details.body = Zeroizing::new(literal);
                    Ok(details)
                }
                _ => Err(PgpError::Structural("symmetric passphrase incorrect".into())),
            };
        }
        Err(PgpError::NoKey)
    }
}

// ── Builders ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub enum Secret<'a> {
    Public,
    Clear,
    Protected(&'a [u8]),
}

fn key_packet(out: &mut Vec<u8>, tag: PacketTag, id: u64, usage: KeyUsage, secret: Secret<'_>) {
    let mut body = id.to_be_bytes().to_vec();
    body.push(usage.0);
    match secret {
        Secret::Public => {}
        Secret::Clear => body.push(0),
        Secret::Protected(pass) => {
            body.push(pass.len() as u8);
            body.extend_from_slice(pass);
        }
    }
    body.extend_from_slice(format!("material-{id:x}").as_bytes());
    write_packet(out, tag, &body).unwrap();
}

/// A transferable key: primary `id` (certify + sign), an encryption subkey
/// `sub`, and the given identities with their primary-id flag.
pub fn keyring(id: u64, sub: u64, secret: Secret<'_>, idents: &[(&str, Option<bool>)]) -> Vec<u8> {
    let private = !matches!(secret, Secret::Public);
    let mut out = Vec::new();
    key_packet(
        &mut out,
        if private { PacketTag::PRIVATE_KEY } else { PacketTag::PUBLIC_KEY },
        id,
        KeyUsage::CERTIFY | KeyUsage::SIGN,
        secret,
    );
    for (name, primary) in idents {
        write_packet(&mut out, PacketTag::USER_ID, name.as_bytes()).unwrap();
        let flag = match primary {
            None => 0,
            Some(false) => 1,
            Some(true) => 2,
        };
        write_packet(&mut out, PacketTag::SIGNATURE, &[flag]).unwrap();
    }
    key_packet(
        &mut out,
        if private { PacketTag::PRIVATE_SUBKEY } else { PacketTag::PUBLIC_SUBKEY },
        sub,
        KeyUsage::ENCRYPT_COMMUNICATIONS | KeyUsage::ENCRYPT_STORAGE,
        secret,
    );
    out
}

pub fn message_to(recipients: &[u64], text: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for id in recipients {
        write_packet(&mut out, PacketTag::PUBLIC_KEY_ENCRYPTED_SESSION_KEY, &id.to_be_bytes())
            .unwrap();
    }
    write_packet(&mut out, PacketTag::LITERAL_DATA, text.as_bytes()).unwrap();
    out
}

pub fn symmetric_message(pass: &[u8], text: &str) -> Vec<u8> {
    let mut out = Vec::new();
    write_packet(&mut out, PacketTag::SYMMETRIC_KEY_ENCRYPTED_SESSION_KEY, pass).unwrap();
    write_packet(&mut out, PacketTag::LITERAL_DATA, text.as_bytes()).unwrap();
    out
}

/// ASCII armor around `raw`, without the optional checksum line.
pub fn armored(kind: &str, raw: &[u8]) -> Vec<u8> {
    let mut text = format!("-----BEGIN PGP {kind}-----\nComment: test\n\n");
    let encoded = STANDARD.encode(raw);
    for line in encoded.as_bytes().chunks(64) {
        text.push_str(&String::from_utf8_lossy(line));
        text.push('\n');
    }
    text.push_str(&format!("-----END PGP {kind}-----\n"));
    text.into_bytes()
}

// ── Prompting ────────────────────────────────────────────────────────────

/// Answers every candidate prompt with a fixed passphrase and records the
/// key ids it was asked about.
pub struct RecordingPrompter {
    answer: Vec<u8>,
    calls: Mutex<Vec<(Vec<KeyId>, bool)>>,
    fail: bool,
}

impl RecordingPrompter {
    pub fn answering(answer: &[u8]) -> Arc<Self> {
        Arc::new(RecordingPrompter {
            answer: answer.to_vec(),
            calls: Mutex::new(Vec::new()),
            fail: false,
        })
    }

    pub fn cancelling() -> Arc<Self> {
        Arc::new(RecordingPrompter {
            answer: Vec::new(),
            calls: Mutex::new(Vec::new()),
            fail: true,
        })
    }

    pub fn calls(&self) -> Vec<(Vec<KeyId>, bool)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Prompts naming at least one key.
    pub fn key_prompts(&self) -> Vec<KeyId> {
        self.calls().into_iter().flat_map(|(ids, _)| ids).collect()
    }
}

impl Prompter for RecordingPrompter {
    fn prompt(&self, keys: &[KeyRef], symmetric: bool) -> Result<Zeroizing<Vec<u8>>, PromptError> {
        let ids = keys
            .iter()
            .filter_map(|k| k.private_key.as_ref().map(|p| p.key_id))
            .collect();
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((ids, symmetric));
        if self.fail {
            return Err(PromptError::Cancelled);
        }
        if keys.is_empty() && !symmetric {
            return Err(PromptError::NoPassphrase);
        }
        Ok(Zeroizing::new(self.answer.clone()))
    }
}

// ── Fault injection ──────────────────────────────────────────────────────

/// Delegates to an in-memory cache, failing the next `n` payload writes.
pub struct FlakyCache {
    inner: MemoryCache,
    failures: AtomicUsize,
}

impl FlakyCache {
    pub fn new() -> Self {
        FlakyCache {
            inner: MemoryCache::in_memory(),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_writes(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn injected(&self) -> CacheResult<()> {
        let tripped = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(CacheError::Keychain("injected write failure".into()))
        } else {
            Ok(())
        }
    }
}

impl SecureCache for FlakyCache {
    fn session_scope(&self) -> CacheResult<Serial> {
        self.inner.session_scope()
    }

    fn create_scope(&self, parent: Serial, name: &str) -> CacheResult<Serial> {
        self.inner.create_scope(parent, name)
    }

    fn add(&self, scope: Serial, name: &str, payload: &[u8]) -> CacheResult<Serial> {
        self.injected()?;
        self.inner.add(scope, name, payload)
    }

    fn search(&self, scope: Serial, kind: ObjectKind, name: &str) -> CacheResult<Found> {
        self.inner.search(scope, kind, name)
    }

    fn read(&self, id: Serial) -> CacheResult<Zeroizing<Vec<u8>>> {
        self.inner.read(id)
    }

    fn update(&self, id: Serial, payload: &[u8]) -> CacheResult<()> {
        self.injected()?;
        self.inner.update(id, payload)
    }

    fn set_timeout(&self, id: Serial, secs: u32) -> CacheResult<()> {
        self.inner.set_timeout(id, secs)
    }

    fn set_permission(&self, id: Serial, perm: Permission) -> CacheResult<()> {
        self.inner.set_permission(id, perm)
    }

    fn link(&self, id: Serial, scope: Serial) -> CacheResult<()> {
        self.inner.link(id, scope)
    }

    fn unlink(&self, id: Serial, scope: Serial) -> CacheResult<()> {
        self.inner.unlink(id, scope)
    }

    fn list(&self, scope: Serial) -> CacheResult<Vec<Serial>> {
        self.inner.list(scope)
    }

    fn describe(&self, id: Serial) -> CacheResult<Description> {
        self.inner.describe(id)
    }
}
