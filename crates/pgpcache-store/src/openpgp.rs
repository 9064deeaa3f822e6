//! The OpenPGP collaborator: an entity model plus the trait a cryptographic
//! backend implements. Nothing here performs cryptography.

use std::fmt;
use std::io::{self, Read, Write};
use thiserror::Error;
use zeroize::Zeroizing;

use pgpcache_core::KeyId;
use pgpcache_packet::{FramingError, PacketDecoder};

use crate::prompt::PromptError;

/// Key usage flags as carried by self-signatures (RFC 4880 §5.2.3.21).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeyUsage(pub u8);

impl KeyUsage {
    pub const CERTIFY: KeyUsage = KeyUsage(0x01);
    pub const SIGN: KeyUsage = KeyUsage(0x02);
    pub const ENCRYPT_COMMUNICATIONS: KeyUsage = KeyUsage(0x04);
    pub const ENCRYPT_STORAGE: KeyUsage = KeyUsage(0x08);

    pub fn contains(self, other: KeyUsage) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn can_encrypt(self) -> bool {
        self.0 & (Self::ENCRYPT_COMMUNICATIONS.0 | Self::ENCRYPT_STORAGE.0) != 0
    }
}

impl std::ops::BitOr for KeyUsage {
    type Output = KeyUsage;
    fn bitor(self, rhs: KeyUsage) -> KeyUsage {
        KeyUsage(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    pub key_id: KeyId,
    pub fingerprint: Vec<u8>,
    pub usage: KeyUsage,
    /// Backend encoding of the key, including any binding signatures a
    /// subkey carries.
    pub material: Vec<u8>,
}

impl PublicKey {
    pub fn can_encrypt(&self) -> bool {
        self.usage.can_encrypt()
    }
}

#[derive(Clone)]
pub struct PrivateKey {
    pub key_id: KeyId,
    /// Still protected by a passphrase.
    pub encrypted: bool,
    /// Backend encoding; may cover more keys of the entity than this one.
    pub material: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("key_id", &self.key_id)
            .field("encrypted", &self.encrypted)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SelfSignature {
    pub is_primary_id: Option<bool>,
    /// The serialized signature, when the backend keeps one.
    pub packet: Vec<u8>,
}

impl SelfSignature {
    pub fn is_primary(&self) -> bool {
        self.is_primary_id == Some(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub self_signature: Option<SelfSignature>,
}

#[derive(Debug, Clone)]
pub struct Subkey {
    pub public_key: PublicKey,
    pub private_key: Option<PrivateKey>,
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub primary_key: PublicKey,
    pub private_key: Option<PrivateKey>,
    pub identities: Vec<Identity>,
    pub subkeys: Vec<Subkey>,
    /// Signatures over the primary key itself (revocations and direct-key
    /// signatures), as the backend encodes them.
    pub revocations: Vec<Vec<u8>>,
}

impl Entity {
    pub fn key_id(&self) -> KeyId {
        self.primary_key.key_id
    }

    /// The self-signature of the first identity, unless a later identity is
    /// flagged as the primary one.
    pub fn primary_self_signature(&self) -> Option<&SelfSignature> {
        let mut chosen: Option<&SelfSignature> = None;
        for sig in self.identities.iter().filter_map(|i| i.self_signature.as_ref()) {
            match chosen {
                None => chosen = Some(sig),
                Some(_) if sig.is_primary() => return Some(sig),
                Some(_) => {}
            }
        }
        chosen
    }

    /// The primary key or subkeys matching `id`.
    pub fn keys_by_id(&self, id: KeyId) -> Vec<KeyRef> {
        let mut keys = Vec::new();
        if self.primary_key.key_id == id {
            keys.push(KeyRef {
                primary_id: self.key_id(),
                public_key: self.primary_key.clone(),
                private_key: self.private_key.clone(),
                self_signature: self.primary_self_signature().cloned(),
            });
        }
        for sub in self.subkeys.iter().filter(|s| s.public_key.key_id == id) {
            keys.push(self.subkey_ref(sub));
        }
        keys
    }

    /// Keys that hold private material and may encrypt.
    pub fn decryption_keys(&self) -> Vec<KeyRef> {
        let mut keys = Vec::new();
        for sub in &self.subkeys {
            if sub.private_key.is_some() && sub.public_key.can_encrypt() {
                keys.push(self.subkey_ref(sub));
            }
        }
        if self.private_key.is_some() && self.primary_key.can_encrypt() {
            keys.extend(self.keys_by_id(self.key_id()));
        }
        keys
    }

    fn subkey_ref(&self, sub: &Subkey) -> KeyRef {
        KeyRef {
            primary_id: self.key_id(),
            public_key: sub.public_key.clone(),
            private_key: sub.private_key.clone(),
            self_signature: None,
        }
    }
}

/// One usable key: a primary key or a subkey, with its owning entity's id.
#[derive(Debug, Clone)]
pub struct KeyRef {
    pub primary_id: KeyId,
    pub public_key: PublicKey,
    pub private_key: Option<PrivateKey>,
    pub self_signature: Option<SelfSignature>,
}

impl KeyRef {
    pub fn key_id(&self) -> KeyId {
        self.public_key.key_id
    }
}

pub fn keys_by_id(entities: &[Entity], id: KeyId) -> Vec<KeyRef> {
    entities.iter().flat_map(|e| e.keys_by_id(id)).collect()
}

pub fn keys_by_id_usage(entities: &[Entity], id: KeyId, usage: KeyUsage) -> Vec<KeyRef> {
    keys_by_id(entities, id)
        .into_iter()
        .filter(|k| k.public_key.usage.contains(usage))
        .collect()
}

pub fn decryption_keys(entities: &[Entity]) -> Vec<KeyRef> {
    entities.iter().flat_map(Entity::decryption_keys).collect()
}

/// Where a message decoder looks up candidate keys.
pub trait KeySource {
    fn keys_by_id(&self, id: KeyId) -> Vec<KeyRef>;

    /// Every key usable for decryption, for recipients hidden by id.
    fn decryption_keys(&self) -> Vec<KeyRef>;
}

impl KeySource for Vec<Entity> {
    fn keys_by_id(&self, id: KeyId) -> Vec<KeyRef> {
        keys_by_id(self, id)
    }

    fn decryption_keys(&self) -> Vec<KeyRef> {
        decryption_keys(self)
    }
}

/// What a prompt callback hands back to the message decoder.
pub enum PromptReply {
    /// Try this passphrase (symmetric messages).
    Passphrase(Zeroizing<Vec<u8>>),
    /// One of the candidate keys was unlocked in place.
    Unlocked,
}

impl fmt::Debug for PromptReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptReply::Passphrase(_) => f.write_str("Passphrase(..)"),
            PromptReply::Unlocked => f.write_str("Unlocked"),
        }
    }
}

/// Prompt callback: candidate keys (possibly none) and whether the message is
/// symmetrically encrypted.
pub type PromptFn<'a> = dyn FnMut(&mut [KeyRef], bool) -> Result<PromptReply, PromptError> + 'a;

#[derive(Debug, Clone, Default)]
pub struct MessageDetails {
    pub is_encrypted: bool,
    pub is_symmetric: bool,
    pub encrypted_to: Vec<KeyId>,
    pub decrypted_with: Option<KeyId>,
    pub body: Zeroizing<Vec<u8>>,
}

#[derive(Debug, Error)]
pub enum PgpError {
    #[error("malformed OpenPGP data: {0}")]
    Structural(String),

    #[error("unsupported OpenPGP feature: {0}")]
    Unsupported(String),

    #[error("incorrect passphrase for key {0}")]
    WrongPassphrase(KeyId),

    #[error("no key available to decrypt message")]
    NoKey,

    #[error(transparent)]
    Prompt(#[from] PromptError),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// An OpenPGP implementation. Packet-level decoding (via [`PacketDecoder`])
/// is used by the capture reader during import.
pub trait OpenPgp: PacketDecoder + Send + Sync {
    /// Decode a keyring (sequence of transferable keys).
    fn read_keyring(&self, input: &mut dyn Read) -> Result<Vec<Entity>, PgpError>;

    /// Serialize an entity's public material.
    fn serialize(&self, entity: &Entity, out: &mut dyn Write) -> Result<(), PgpError>;

    /// Remove passphrase protection from `key` in place.
    fn unlock(&self, key: &mut PrivateKey, passphrase: &[u8]) -> Result<(), PgpError>;

    /// Decode (and decrypt) a message. `prompt` is invoked once per round of
    /// candidate keys needing a passphrase, or with no candidates for a
    /// symmetric message.
    fn read_message(
        &self,
        input: &mut dyn Read,
        keys: &dyn KeySource,
        prompt: &mut PromptFn<'_>,
    ) -> Result<MessageDetails, PgpError>;
}
