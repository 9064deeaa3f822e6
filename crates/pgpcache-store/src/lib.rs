//! pgpcache-store: OpenPGP keys and passphrases kept in a secure cache
//!
//! - [`KeyStore`]: three scopes under a root (default: the session scope)
//!     - `pgp-pubkey`: public material, readable by group and other
//!     - `pgp-privkey-live`: decrypted private keys, expiring after a TTL
//!     - `pgp-privkey` (nested in live): passphrase-protected private keys
//! - [`PassphraseKeyring`]: wraps message decryption with a prompt callback
//!   that consults cached passphrases before asking the user
//! - [`OpenPgp`]: the cryptographic backend this crate drives; [`Rpgp`]
//!   implements it on rPGP

pub mod error;
pub mod key;
pub mod openpgp;
pub mod passphrase;
pub mod prompt;
pub mod ring;
pub mod rpgp;

pub use error::{StoreError, StoreResult};
pub use key::{CapturedKeys, Pending, StoredKey};
pub use openpgp::{
    Entity, Identity, KeyRef, KeySource, KeyUsage, MessageDetails, OpenPgp, PgpError,
    PrivateKey, PromptReply, PublicKey, SelfSignature, Subkey,
};
pub use passphrase::PassphraseKeyring;
pub use prompt::{PromptError, Prompter, TerminalPrompter};
pub use ring::{KeyStore, StoreKeys};
pub use rpgp::Rpgp;

use pgpcache_core::KeyId;

pub const PUBLIC_PREFIX: &str = "pgp-pubkey";
pub const PRIVATE_PREFIX: &str = "pgp-privkey";
pub const LIVE_SCOPE: &str = "pgp-privkey-live";
pub const PASSPHRASE_PREFIX: &str = "pgp";

/// `pgp-pubkey:<ID>`
pub fn public_name(id: KeyId) -> String {
    format!("{PUBLIC_PREFIX}:{id}")
}

/// `pgp-privkey:<ID>`, used in both the live and private scopes.
pub fn private_name(id: KeyId) -> String {
    format!("{PRIVATE_PREFIX}:{id}")
}

/// `pgp:<ID>`
pub fn passphrase_name(id: KeyId) -> String {
    format!("{PASSPHRASE_PREFIX}:{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_names() {
        let id = KeyId(0xAB);
        assert_eq!(public_name(id), "pgp-pubkey:00000000000000AB");
        assert_eq!(private_name(id), "pgp-privkey:00000000000000AB");
        assert_eq!(passphrase_name(id), "pgp:00000000000000AB");
    }
}
