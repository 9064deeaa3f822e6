//! Passphrase prompting.

use std::io;
use thiserror::Error;
use zeroize::Zeroizing;

use pgpcache_core::KeyId;
use pgpcache_secrets::CacheError;

use crate::openpgp::KeyRef;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("passphrase entry cancelled")]
    Cancelled,

    /// Asked with no candidate keys for a message that is not symmetric.
    #[error("no passphrase available")]
    NoPassphrase,

    #[error("passphrase prompt failed: {0}")]
    Failed(String),

    #[error("caching passphrase for key {key_id}: {source}")]
    CacheWrite {
        key_id: KeyId,
        #[source]
        source: CacheError,
    },
}

/// Supplies passphrases for candidate keys, or for a symmetric message when
/// `keys` is empty and `symmetric` is set.
pub trait Prompter: Send + Sync {
    fn prompt(&self, keys: &[KeyRef], symmetric: bool) -> Result<Zeroizing<Vec<u8>>, PromptError>;
}

impl<F> Prompter for F
where
    F: Fn(&[KeyRef], bool) -> Result<Zeroizing<Vec<u8>>, PromptError> + Send + Sync,
{
    fn prompt(&self, keys: &[KeyRef], symmetric: bool) -> Result<Zeroizing<Vec<u8>>, PromptError> {
        self(keys, symmetric)
    }
}

/// Prompt on the controlling terminal with echo disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompter;

/// Text shown before reading a passphrase.
pub fn prompt_text(keys: &[KeyRef]) -> String {
    match keys.first() {
        Some(k) => format!(
            "Enter passphrase for key {} : ",
            k.private_key
                .as_ref()
                .map(|p| p.key_id)
                .unwrap_or_else(|| k.key_id())
                .short()
        ),
        None => "Enter passphrase: ".to_string(),
    }
}

impl Prompter for TerminalPrompter {
    fn prompt(&self, keys: &[KeyRef], symmetric: bool) -> Result<Zeroizing<Vec<u8>>, PromptError> {
        if keys.is_empty() && !symmetric {
            return Err(PromptError::NoPassphrase);
        }
        let pass = rpassword::prompt_password(prompt_text(keys)).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::Interrupted => PromptError::Cancelled,
            _ => PromptError::Failed(e.to_string()),
        })?;
        Ok(Zeroizing::new(pass.into_bytes()))
    }
}
