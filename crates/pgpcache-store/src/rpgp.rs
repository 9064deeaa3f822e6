//! [`OpenPgp`] on rPGP.
//!
//! Keyrings are walked packet by packet, so a bare run of private-key packets
//! (what the private scopes hold) decodes as well as a transferable key.
//! Material is kept as serialized packets: a public key carries the binding
//! signatures that followed it, a private key carries every secret packet of
//! its entity.

use std::io::{self, Read, Write};

use pgp::armor::Dearmor;
use pgp::composed::{Message, SignedKeyDetails, SignedSecretKey, SignedSecretSubKey};
use pgp::crypto::public_key::PublicKeyAlgorithm;
use pgp::packet::{Packet, PacketParser, Signature};
use pgp::types::{KeyDetails, Password, SecretParams};
use zeroize::Zeroizing;

use pgpcache_core::KeyId;
use pgpcache_packet::{read_header, write_packet, PacketDecoder, PacketTag};

use crate::openpgp::{
    Entity, Identity, KeyRef, KeySource, KeyUsage, MessageDetails, OpenPgp, PgpError, PromptFn,
    PromptReply, PrivateKey, PublicKey, SelfSignature, Subkey,
};

/// Prompt rounds before giving up on the candidate keys.
const MAX_ROUNDS: usize = 8;

/// The rPGP backend. Stateless; every call decodes from the bytes it is given.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rpgp;

fn backend(e: pgp::errors::Error) -> PgpError {
    PgpError::Structural(e.to_string())
}

fn convert_id(id: &pgp::types::KeyId) -> Result<KeyId, PgpError> {
    let raw: &[u8] = id.as_ref();
    let bytes = <[u8; 8]>::try_from(raw)
        .map_err(|_| PgpError::Unsupported(format!("{}-byte key id", raw.len())))?;
    Ok(KeyId::from_be_bytes(bytes))
}

/// Passphrases are handed to rPGP as text.
fn password(passphrase: &[u8]) -> Password {
    Password::from(String::from_utf8_lossy(passphrase).as_ref())
}

/// Frame `input` into whole packets, each re-encoded with a new-format header.
fn split(input: &mut dyn Read) -> Result<Vec<Zeroizing<Vec<u8>>>, PgpError> {
    let mut packets = Vec::new();
    while let Some(header) = read_header(input)? {
        let mut body = Zeroizing::new(Vec::new());
        header.body(&mut *input).read_to_end(&mut body)?;
        packets.push(wrap(header.tag, &body)?);
    }
    Ok(packets)
}

fn wrap(tag: PacketTag, body: &[u8]) -> Result<Zeroizing<Vec<u8>>, PgpError> {
    let mut raw = Zeroizing::new(Vec::with_capacity(body.len() + 6));
    write_packet(&mut *raw, tag, body)?;
    Ok(raw)
}

/// Tag of a packet produced by [`wrap`].
fn tag_of(raw: &[u8]) -> PacketTag {
    PacketTag(raw.first().map_or(0, |b| b & 0x3f))
}

fn parse_packet(raw: &[u8]) -> Result<Packet, PgpError> {
    PacketParser::new(raw)
        .next()
        .ok_or_else(|| PgpError::Structural("empty packet".into()))?
        .map_err(backend)
}

/// Serialize a parsed packet under `tag`.
fn encode<P: pgp::ser::Serialize>(tag: PacketTag, packet: &P) -> Result<Zeroizing<Vec<u8>>, PgpError> {
    let mut body = Zeroizing::new(Vec::new());
    packet.to_writer(&mut *body).map_err(backend)?;
    wrap(tag, &body)
}

fn secret_id(packet: &Packet) -> Result<Option<KeyId>, PgpError> {
    match packet {
        Packet::SecretKey(k) => convert_id(&k.key_id()).map(Some),
        Packet::SecretSubkey(k) => convert_id(&k.key_id()).map(Some),
        _ => Ok(None),
    }
}

fn is_protected(params: &SecretParams) -> bool {
    matches!(params, SecretParams::Encrypted(_))
}

/// Usage assumed from the algorithm when no self-signature states one.
fn usage_by_algorithm(alg: PublicKeyAlgorithm, primary: bool) -> KeyUsage {
    use PublicKeyAlgorithm::*;
    let mut usage = KeyUsage::default();
    if matches!(alg, RSA | RSASign | DSA | ECDSA | EdDSALegacy | Ed25519) {
        usage = usage | KeyUsage::SIGN;
        if primary {
            usage = usage | KeyUsage::CERTIFY;
        }
    }
    if matches!(alg, RSA | RSAEncrypt | ECDH | X25519) {
        usage = usage | KeyUsage::ENCRYPT_COMMUNICATIONS | KeyUsage::ENCRYPT_STORAGE;
    }
    usage
}

fn usage_from(sig: &Signature) -> KeyUsage {
    let flags = sig.key_flags();
    let mut usage = KeyUsage::default();
    if flags.certify() {
        usage = usage | KeyUsage::CERTIFY;
    }
    if flags.sign() {
        usage = usage | KeyUsage::SIGN;
    }
    if flags.encrypt_comms() {
        usage = usage | KeyUsage::ENCRYPT_COMMUNICATIONS;
    }
    if flags.encrypt_storage() {
        usage = usage | KeyUsage::ENCRYPT_STORAGE;
    }
    usage
}

fn describe<K: KeyDetails>(key: &K, primary: bool, material: Vec<u8>) -> Result<PublicKey, PgpError> {
    Ok(PublicKey {
        key_id: convert_id(&key.key_id())?,
        fingerprint: key.fingerprint().as_bytes().to_vec(),
        usage: usage_by_algorithm(key.algorithm(), primary),
        material,
    })
}

fn private_for(key: &PublicKey, params: &SecretParams) -> PrivateKey {
    PrivateKey {
        key_id: key.key_id,
        encrypted: is_protected(params),
        material: Zeroizing::new(Vec::new()),
    }
}

/// What the last key or user id packet was, for attaching signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Key,
    Identity,
    Subkey,
    Skipped,
}

/// One entity under construction plus the secret packets seen for it.
struct Building {
    entity: Entity,
    secrets: Zeroizing<Vec<u8>>,
}

impl Building {
    fn new(primary_key: PublicKey, private_key: Option<PrivateKey>) -> Self {
        Building {
            entity: Entity {
                primary_key,
                private_key,
                identities: Vec::new(),
                subkeys: Vec::new(),
                revocations: Vec::new(),
            },
            secrets: Zeroizing::new(Vec::new()),
        }
    }

    /// Every private key of the entity shares the entity's secret run.
    fn finish(self) -> Entity {
        let Building { mut entity, secrets } = self;
        let keys = entity
            .private_key
            .iter_mut()
            .chain(entity.subkeys.iter_mut().filter_map(|s| s.private_key.as_mut()));
        for key in keys {
            key.material = secrets.clone();
        }
        entity
    }
}

/// Rebuild a transferable secret key from a run of secret packets.
/// `bindings` holds the serialized public key of `target`, whose trailing
/// signatures are attached to that subkey.
fn assemble(secrets: &[u8], target: KeyId, bindings: &[u8]) -> Result<SignedSecretKey, PgpError> {
    let mut signatures = Vec::new();
    for raw in split(&mut &bindings[..])? {
        if let Packet::Signature(sig) = parse_packet(&raw)? {
            signatures.push(sig);
        }
    }

    let mut primary = None;
    let mut subkeys = Vec::new();
    for raw in split(&mut &secrets[..])? {
        let packet = parse_packet(&raw)?;
        let id = secret_id(&packet)?;
        match packet {
            Packet::SecretKey(k) => primary = Some(k),
            Packet::SecretSubkey(k) => {
                let sigs = if id == Some(target) {
                    std::mem::take(&mut signatures)
                } else {
                    Vec::new()
                };
                subkeys.push(SignedSecretSubKey::new(k, sigs));
            }
            _ => {}
        }
    }
    let primary =
        primary.ok_or_else(|| PgpError::Structural("no primary private key packet".into()))?;
    Ok(SignedSecretKey::new(
        primary,
        SignedKeyDetails::new(Vec::new(), Vec::new(), Vec::new(), Vec::new()),
        Vec::new(),
        subkeys,
    ))
}

fn literal(mut message: Message<'_>) -> Result<Zeroizing<Vec<u8>>, PgpError> {
    if message.is_compressed() {
        message = message.decompress().map_err(backend)?;
    }
    Ok(Zeroizing::new(message.as_data_vec().map_err(|e| PgpError::Structural(e.to_string()))?))
}

/// Session-key packets in front of the encrypted data.
#[derive(Debug, Default)]
struct Envelope {
    recipients: Vec<KeyId>,
    hidden: bool,
    symmetric: bool,
}

fn scan(mut input: &[u8]) -> Result<Envelope, PgpError> {
    let mut envelope = Envelope::default();
    while let Some(header) = read_header(&mut input)? {
        let mut body = Zeroizing::new(Vec::new());
        header.body(&mut input).read_to_end(&mut body)?;
        match header.tag {
            PacketTag::PUBLIC_KEY_ENCRYPTED_SESSION_KEY => {
                // Version 3: one version octet, then the recipient id.
                let id = body
                    .get(1..9)
                    .and_then(|b| <[u8; 8]>::try_from(b).ok())
                    .map(KeyId::from_be_bytes);
                match id {
                    Some(id) if body.first() == Some(&3) && id.0 != 0 => {
                        envelope.recipients.push(id)
                    }
                    _ => envelope.hidden = true,
                }
            }
            PacketTag::SYMMETRIC_KEY_ENCRYPTED_SESSION_KEY => envelope.symmetric = true,
            PacketTag::MARKER => {}
            _ => break,
        }
    }
    Ok(envelope)
}

impl Rpgp {
    fn decrypt_with(&self, bytes: &[u8], key: &KeyRef) -> Result<Zeroizing<Vec<u8>>, PgpError> {
        let private = key.private_key.as_ref().ok_or(PgpError::NoKey)?;
        let secret = assemble(&private.material, key.key_id(), &key.public_key.material)?;
        let message = Message::from_bytes(bytes)
            .map_err(backend)?
            .decrypt(&Password::empty(), &secret)
            .map_err(backend)?;
        literal(message)
    }
}

impl PacketDecoder for Rpgp {
    fn private_key_id(&self, tag: PacketTag, body: &mut dyn Read) -> io::Result<Option<KeyId>> {
        if !tag.is_private_key() {
            return Ok(None);
        }
        let invalid = |e: PgpError| io::Error::new(io::ErrorKind::InvalidData, e.to_string());
        let mut buf = Zeroizing::new(Vec::new());
        body.read_to_end(&mut buf)?;
        let raw = wrap(tag, &buf).map_err(invalid)?;
        secret_id(&parse_packet(&raw).map_err(invalid)?).map_err(invalid)
    }
}

impl OpenPgp for Rpgp {
    fn read_keyring(&self, input: &mut dyn Read) -> Result<Vec<Entity>, PgpError> {
        let mut done = Vec::new();
        let mut current: Option<Building> = None;
        let mut position = Position::Key;

        for raw in split(input)? {
            let packet = parse_packet(&raw)?;
            let started = match &packet {
                Packet::SecretKey(k) => {
                    let public = encode(PacketTag::PUBLIC_KEY, k.public_key())?;
                    let primary_key = describe(k, true, public.to_vec())?;
                    let private = private_for(&primary_key, k.secret_params());
                    let mut building = Building::new(primary_key, Some(private));
                    building.secrets.extend_from_slice(&raw);
                    Some(building)
                }
                Packet::PublicKey(k) => Some(Building::new(describe(k, true, raw.to_vec())?, None)),
                _ => None,
            };
            if let Some(building) = started {
                done.extend(current.replace(building).map(Building::finish));
                position = Position::Key;
                continue;
            }

            let Some(building) = current.as_mut() else {
                return Err(PgpError::Structural(format!("{} before key", tag_of(&raw))));
            };
            let entity = &mut building.entity;
            match packet {
                Packet::SecretSubkey(k) => {
                    let public = encode(PacketTag::PUBLIC_SUBKEY, k.public_key())?;
                    let public_key = describe(&k, false, public.to_vec())?;
                    let private = private_for(&public_key, k.secret_params());
                    building.secrets.extend_from_slice(&raw);
                    entity.subkeys.push(Subkey {
                        public_key,
                        private_key: Some(private),
                    });
                    position = Position::Subkey;
                }
                Packet::PublicSubkey(k) => {
                    entity.subkeys.push(Subkey {
                        public_key: describe(&k, false, raw.to_vec())?,
                        private_key: None,
                    });
                    position = Position::Subkey;
                }
                Packet::UserId(u) => {
                    let name = String::from_utf8_lossy(AsRef::<[u8]>::as_ref(u.id())).into_owned();
                    entity.identities.push(Identity {
                        name,
                        self_signature: None,
                    });
                    position = Position::Identity;
                }
                Packet::Signature(sig) => {
                    let usage = usage_from(&sig);
                    match position {
                        Position::Key => {
                            if usage != KeyUsage::default() {
                                entity.primary_key.usage = usage;
                            }
                            entity.revocations.push(raw.to_vec());
                        }
                        Position::Identity => {
                            let Some(ident) = entity.identities.last_mut() else {
                                continue;
                            };
                            // Later signatures on the same user id are third-party certifications.
                            if ident.self_signature.is_some() {
                                continue;
                            }
                            ident.self_signature = Some(SelfSignature {
                                is_primary_id: sig.is_primary().then_some(true),
                                packet: raw.to_vec(),
                            });
                            if usage != KeyUsage::default() {
                                entity.primary_key.usage = usage;
                            }
                        }
                        Position::Subkey => {
                            if let Some(sub) = entity.subkeys.last_mut() {
                                sub.public_key.material.extend_from_slice(&raw);
                                if usage != KeyUsage::default() {
                                    sub.public_key.usage = usage;
                                }
                            }
                        }
                        Position::Skipped => {}
                    }
                }
                _ => {
                    tracing::trace!(tag = %tag_of(&raw), "skipping keyring packet");
                    position = Position::Skipped;
                }
            }
        }
        done.extend(current.map(Building::finish));
        Ok(done)
    }

    fn serialize(&self, entity: &Entity, out: &mut dyn Write) -> Result<(), PgpError> {
        out.write_all(&entity.primary_key.material)?;
        for rev in &entity.revocations {
            out.write_all(rev)?;
        }
        for ident in &entity.identities {
            write_packet(&mut *out, PacketTag::USER_ID, ident.name.as_bytes())?;
            if let Some(sig) = &ident.self_signature {
                out.write_all(&sig.packet)?;
            }
        }
        for sub in &entity.subkeys {
            out.write_all(&sub.public_key.material)?;
        }
        Ok(())
    }

    fn unlock(&self, key: &mut PrivateKey, passphrase: &[u8]) -> Result<(), PgpError> {
        if !key.encrypted {
            return Ok(());
        }
        let password = password(passphrase);
        let mut material = Zeroizing::new(Vec::with_capacity(key.material.len()));
        let mut found = false;
        for raw in split(&mut &key.material[..])? {
            let packet = parse_packet(&raw)?;
            if secret_id(&packet)? != Some(key.key_id) {
                material.extend_from_slice(&raw);
                continue;
            }
            let unlocked = match packet {
                Packet::SecretKey(mut k) => {
                    k.remove_password(&password)
                        .map_err(|_| PgpError::WrongPassphrase(key.key_id))?;
                    encode(PacketTag::PRIVATE_KEY, &k)?
                }
                Packet::SecretSubkey(mut k) => {
                    k.remove_password(&password)
                        .map_err(|_| PgpError::WrongPassphrase(key.key_id))?;
                    encode(PacketTag::PRIVATE_SUBKEY, &k)?
                }
                _ => raw,
            };
            material.extend_from_slice(&unlocked);
            found = true;
        }
        if !found {
            return Err(PgpError::Structural(format!(
                "no private key packet for {}",
                key.key_id
            )));
        }
        key.material = material;
        key.encrypted = false;
        Ok(())
    }

    fn read_message(
        &self,
        input: &mut dyn Read,
        keys: &dyn KeySource,
        prompt: &mut PromptFn<'_>,
    ) -> Result<MessageDetails, PgpError> {
        let mut raw = Zeroizing::new(Vec::new());
        input.read_to_end(&mut raw)?;
        let bytes = if raw.starts_with(b"-----BEGIN") {
            let mut plain = Zeroizing::new(Vec::new());
            Dearmor::new(&raw[..]).read_to_end(&mut plain)?;
            plain
        } else {
            raw
        };

        let envelope = scan(&bytes)?;
        let mut details = MessageDetails {
            is_encrypted: envelope.hidden || envelope.symmetric || !envelope.recipients.is_empty(),
            encrypted_to: envelope.recipients.clone(),
            ..Default::default()
        };
        if !details.is_encrypted {
            details.body = literal(Message::from_bytes(&bytes[..]).map_err(backend)?)?;
            return Ok(details);
        }

        let mut candidates: Vec<KeyRef> = envelope
            .recipients
            .iter()
            .flat_map(|id| keys.keys_by_id(*id))
            .filter(|k| k.private_key.is_some())
            .collect();
        if envelope.hidden {
            candidates.extend(keys.decryption_keys());
        }

        for _ in 0..MAX_ROUNDS {
            let mut i = 0;
            while i < candidates.len() {
                let attempt = match &candidates[i].private_key {
                    Some(p) if !p.encrypted => Some(self.decrypt_with(&bytes, &candidates[i])),
                    _ => None,
                };
                match attempt {
                    Some(Ok(body)) => {
                        details.decrypted_with = Some(candidates[i].key_id());
                        details.body = body;
                        return Ok(details);
                    }
                    Some(Err(e)) => {
                        tracing::debug!(key_id = %candidates[i].key_id(), "decryption failed: {e}");
                        candidates.remove(i);
                    }
                    None => i += 1,
                }
            }
            if candidates.is_empty() {
                break;
            }
            match prompt(&mut candidates, false)? {
                PromptReply::Unlocked => {}
                PromptReply::Passphrase(pass) => {
                    for c in candidates.iter_mut() {
                        if let Some(p) = c.private_key.as_mut() {
                            if let Err(e) = self.unlock(p, &pass) {
                                tracing::trace!(key_id = %p.key_id, "passphrase rejected: {e}");
                            }
                        }
                    }
                }
            }
        }

        if envelope.symmetric {
            details.is_symmetric = true;
            let PromptReply::Passphrase(pass) = prompt(&mut [], true)? else {
                return Err(PgpError::NoKey);
            };
            let message = Message::from_bytes(&bytes[..])
                .map_err(backend)?
                .decrypt_with_password(&password(&pass))
                .map_err(backend)?;
            details.body = literal(message)?;
            return Ok(details);
        }
        Err(PgpError::NoKey)
    }
}
