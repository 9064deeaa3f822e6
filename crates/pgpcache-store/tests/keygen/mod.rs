//! Real OpenPGP keys generated with rPGP: an Ed25519 primary key and a
//! Curve25519 encryption subkey.

#![allow(dead_code)]

use pgp::composed::{KeyType, SecretKeyParamsBuilder, SignedSecretKey, SubkeyParamsBuilder};
use pgp::crypto::ecc_curve::ECCCurve;
use pgp::types::{KeyDetails, Password};
use rand::thread_rng;

use pgpcache_core::KeyId;

pub fn generate(user_id: &str, passphrase: Option<&str>) -> SignedSecretKey {
    let mut encrypt = SubkeyParamsBuilder::default();
    encrypt
        .key_type(KeyType::ECDH(ECCCurve::Curve25519))
        .can_sign(false)
        .can_encrypt(true)
        .can_authenticate(false)
        .passphrase(passphrase.map(str::to_string));

    let mut params = SecretKeyParamsBuilder::default();
    params
        .key_type(KeyType::Ed25519Legacy)
        .can_certify(true)
        .can_sign(true)
        .can_encrypt(false)
        .primary_user_id(user_id.into())
        .passphrase(passphrase.map(str::to_string))
        .subkeys(vec![encrypt.build().unwrap()]);

    let key = params.build().unwrap().generate(thread_rng()).unwrap();
    key.sign(&mut thread_rng(), &Password::from(passphrase.unwrap_or("")))
        .unwrap()
}

fn convert(id: pgp::types::KeyId) -> KeyId {
    let raw: &[u8] = id.as_ref();
    KeyId::from_be_bytes(raw.try_into().unwrap())
}

pub fn primary_id(key: &SignedSecretKey) -> KeyId {
    convert(key.primary_key.key_id())
}

pub fn subkey_id(key: &SignedSecretKey) -> KeyId {
    convert(key.secret_subkeys[0].key.key_id())
}
