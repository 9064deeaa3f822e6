//! Message decryption through the caching passphrase decryptor.

mod common;

use std::sync::Arc;

use common::{keyring, message_to, symmetric_message, RecordingPrompter, Secret, ToyPgp};
use pgpcache_core::config::{PassphraseConfig, StoreConfig};
use pgpcache_core::KeyId;
use pgpcache_secrets::{ManualClock, MemoryCache, SecureCache};
use pgpcache_store::{Entity, KeyStore, PassphraseKeyring, PgpError, PromptError};

const ALICE: u64 = 0xA11C_E000_0000_0001;
const ALICE_SUB: u64 = 0xA11C_E000_0000_0002;
const BOB: u64 = 0xB0B0_0000_0000_0001;
const BOB_SUB: u64 = 0xB0B0_0000_0000_0002;

struct Fixture {
    store: KeyStore,
    keyring: PassphraseKeyring,
    prompter: Arc<RecordingPrompter>,
}

fn fixture(answer: &[u8]) -> Fixture {
    let cache: Arc<dyn SecureCache> = Arc::new(MemoryCache::in_memory());
    let store = KeyStore::open(cache.clone(), &StoreConfig::default()).unwrap();
    let prompter = RecordingPrompter::answering(answer);
    let keyring =
        PassphraseKeyring::open(cache, &PassphraseConfig::default(), prompter.clone()).unwrap();
    Fixture {
        store,
        keyring,
        prompter,
    }
}

fn import_protected(f: &Fixture, id: u64, sub: u64, pass: &[u8]) {
    f.store
        .import(&ToyPgp, &keyring(id, sub, Secret::Protected(pass), &[("someone", None)])[..])
        .unwrap();
}

#[test]
fn prompted_passphrase_is_cached_and_reused() {
    let f = fixture(b"hunter2");
    import_protected(&f, ALICE, ALICE_SUB, b"hunter2");
    let msg = message_to(&[ALICE_SUB], "hello");
    let keys = f.store.key_source(&ToyPgp);

    let details = f
        .keyring
        .read_message(&ToyPgp, &mut &msg[..], &keys, None)
        .unwrap();
    assert!(details.is_encrypted);
    assert_eq!(details.decrypted_with, Some(KeyId(ALICE_SUB)));
    assert_eq!(details.body.as_slice(), b"hello");
    assert_eq!(f.prompter.key_prompts(), vec![KeyId(ALICE_SUB)]);
    assert_eq!(
        f.keyring.lookup(KeyId(ALICE_SUB)).unwrap().unwrap().as_slice(),
        b"hunter2"
    );
    assert!(f.keyring.scope().find("pgp:A11CE00000000002").unwrap().is_some());

    // A second decrypt is served from the cache; a prompt would cancel.
    let refuse = RecordingPrompter::cancelling();
    let again = f
        .keyring
        .read_message(&ToyPgp, &mut &msg[..], &keys, Some(&*refuse))
        .unwrap();
    assert_eq!(again.body.as_slice(), b"hello");
    assert!(refuse.calls().is_empty());
}

#[test]
fn each_key_is_prompted_at_most_once() {
    let f = fixture(b"wrong");
    import_protected(&f, ALICE, ALICE_SUB, b"alice-pw");
    import_protected(&f, BOB, BOB_SUB, b"bob-pw");
    let msg = message_to(&[ALICE_SUB, BOB_SUB], "hello");

    let err = f
        .keyring
        .read_message(&ToyPgp, &mut &msg[..], &f.store.key_source(&ToyPgp), None)
        .unwrap_err();
    assert!(matches!(err, PgpError::Prompt(PromptError::NoPassphrase)));

    let mut prompted = f.prompter.key_prompts();
    prompted.sort();
    assert_eq!(prompted, vec![KeyId(ALICE_SUB), KeyId(BOB_SUB)]);
    // The last call carries no candidates.
    assert_eq!(f.prompter.calls().last().unwrap(), &(Vec::new(), false));
    assert!(f.keyring.scope().list().unwrap().is_empty());
}

#[test]
fn prompt_error_leaves_cache_unchanged() {
    let f = fixture(b"unused");
    import_protected(&f, ALICE, ALICE_SUB, b"pw");
    let msg = message_to(&[ALICE_SUB], "hello");
    let refuse = RecordingPrompter::cancelling();

    let err = f
        .keyring
        .read_message(
            &ToyPgp,
            &mut &msg[..],
            &f.store.key_source(&ToyPgp),
            Some(&*refuse),
        )
        .unwrap_err();
    assert!(matches!(err, PgpError::Prompt(PromptError::Cancelled)));
    assert_eq!(refuse.calls().len(), 1);
    assert!(f.keyring.lookup(KeyId(ALICE_SUB)).unwrap().is_none());
    assert!(f.prompter.calls().is_empty());
}

#[test]
fn stale_cached_passphrase_falls_back_to_prompt() {
    let f = fixture(b"new-pw");
    import_protected(&f, ALICE, ALICE_SUB, b"new-pw");
    f.keyring.remember(KeyId(ALICE_SUB), b"old-pw").unwrap();

    let msg = message_to(&[ALICE_SUB], "hello");
    f.keyring
        .read_message(&ToyPgp, &mut &msg[..], &f.store.key_source(&ToyPgp), None)
        .unwrap();
    assert_eq!(f.prompter.key_prompts(), vec![KeyId(ALICE_SUB)]);
    assert_eq!(
        f.keyring.lookup(KeyId(ALICE_SUB)).unwrap().unwrap().as_slice(),
        b"new-pw"
    );
    assert_eq!(f.keyring.scope().list().unwrap().len(), 1);
}

#[test]
fn unprotected_key_needs_no_prompt() {
    let f = fixture(b"unused");
    f.store
        .import(&ToyPgp, &keyring(ALICE, ALICE_SUB, Secret::Clear, &[("alice", None)])[..])
        .unwrap();
    let msg = message_to(&[ALICE_SUB], "hello");

    let details = f
        .keyring
        .read_message(&ToyPgp, &mut &msg[..], &f.store.key_source(&ToyPgp), None)
        .unwrap();
    assert_eq!(details.decrypted_with, Some(KeyId(ALICE_SUB)));
    assert!(f.prompter.calls().is_empty());
}

#[test]
fn symmetric_passphrase_is_never_cached() {
    let f = fixture(b"shared");
    let msg = symmetric_message(b"shared", "sym");
    let no_keys: Vec<Entity> = Vec::new();

    let details = f
        .keyring
        .read_message(&ToyPgp, &mut &msg[..], &no_keys, None)
        .unwrap();
    assert!(details.is_symmetric);
    assert_eq!(details.body.as_slice(), b"sym");
    assert_eq!(f.prompter.calls(), vec![(Vec::new(), true)]);
    assert!(f.keyring.scope().list().unwrap().is_empty());
}

#[test]
fn unencrypted_message_skips_prompting() {
    let f = fixture(b"unused");
    let msg = message_to(&[], "plain");
    let details = f
        .keyring
        .read_message(&ToyPgp, &mut &msg[..], &Vec::<Entity>::new(), None)
        .unwrap();
    assert!(!details.is_encrypted);
    assert_eq!(details.body.as_slice(), b"plain");
    assert!(f.prompter.calls().is_empty());
}

#[test]
fn remember_lookup_forget() {
    let f = fixture(b"unused");
    let id = KeyId(0x42);
    assert!(f.keyring.lookup(id).unwrap().is_none());

    f.keyring.remember(id, b"secret").unwrap();
    assert_eq!(f.keyring.lookup(id).unwrap().unwrap().as_slice(), b"secret");

    assert!(f.keyring.forget(id).unwrap());
    assert!(f.keyring.lookup(id).unwrap().is_none());
    assert!(!f.keyring.forget(id).unwrap());
}

#[test]
fn cached_passphrase_expires() {
    let clock = Arc::new(ManualClock::new(0));
    let cache: Arc<dyn SecureCache> =
        Arc::new(MemoryCache::in_memory().with_clock(clock.clone()));
    let config = PassphraseConfig {
        scope: "pgp-passphrase".into(),
        ttl_secs: 30,
    };
    let keyring =
        PassphraseKeyring::open(cache, &config, RecordingPrompter::answering(b"x")).unwrap();
    assert_eq!(keyring.scope().default_ttl(), Some(30));

    keyring.remember(KeyId(7), b"pw").unwrap();
    clock.advance(29);
    assert!(keyring.lookup(KeyId(7)).unwrap().is_some());
    clock.advance(2);
    assert!(keyring.lookup(KeyId(7)).unwrap().is_none());
}

#[test]
fn concurrent_decrypts_keep_separate_prompt_state() {
    let f = fixture(b"unused");
    import_protected(&f, ALICE, ALICE_SUB, b"alice-pw");
    import_protected(&f, BOB, BOB_SUB, b"bob-pw");
    let to_alice = message_to(&[ALICE_SUB], "for alice");
    let to_bob = message_to(&[BOB_SUB], "for bob");
    let alice_prompter = RecordingPrompter::answering(b"alice-pw");
    let bob_prompter = RecordingPrompter::answering(b"bob-pw");

    let decrypt = |msg: &[u8], prompter: &RecordingPrompter| {
        let keys = f.store.key_source(&ToyPgp);
        f.keyring
            .read_message(&ToyPgp, &mut &msg[..], &keys, Some(prompter))
            .unwrap()
    };
    std::thread::scope(|s| {
        let a = s.spawn(|| decrypt(&to_alice, &alice_prompter));
        let b = s.spawn(|| decrypt(&to_bob, &bob_prompter));
        assert_eq!(a.join().unwrap().body.as_slice(), b"for alice");
        assert_eq!(b.join().unwrap().body.as_slice(), b"for bob");
    });

    assert_eq!(alice_prompter.key_prompts(), vec![KeyId(ALICE_SUB)]);
    assert_eq!(bob_prompter.key_prompts(), vec![KeyId(BOB_SUB)]);
    assert!(f.prompter.calls().is_empty());
    assert_eq!(
        f.keyring.lookup(KeyId(ALICE_SUB)).unwrap().unwrap().as_slice(),
        b"alice-pw"
    );
    assert_eq!(
        f.keyring.lookup(KeyId(BOB_SUB)).unwrap().unwrap().as_slice(),
        b"bob-pw"
    );
}
