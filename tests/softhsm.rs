//! Tests against a real PKCS#11 library, SoftHSMv2 by default.
//!
//! The token must have been initialized beforehand, e.g.:
//!
//! ```text
//! softhsm2-util --init-token --slot 0 --label "My token 1" --pin 1234 --so-pin 1234
//! ```
#![cfg(feature = "hsm-tests-pkcs11")]

use std::{env, io::Read, sync::Arc, thread};

use openssl::{ecdsa::EcdsaSig, hash::MessageDigest, rsa::Padding, sign::Verifier};
use pkcs11_keys::{
    Context, DecryptOptions, Decrypter, EcCurve, Error, HashAlgorithm, Pkcs11Config, SignatureScheme, Signer,
    constants::{PKCS11_ENV_TEST_LABEL, PKCS11_ENV_TEST_LIB, PKCS11_ENV_TEST_PIN},
};

//------------ Helpers -------------------------------------------------------

fn test_config() -> Pkcs11Config {
    let lib_path = env::var(PKCS11_ENV_TEST_LIB).unwrap_or_else(|_| "/usr/lib/softhsm/libsofthsm2.so".to_string());
    let label = env::var(PKCS11_ENV_TEST_LABEL).unwrap_or_else(|_| "My token 1".to_string());
    let pin = env::var(PKCS11_ENV_TEST_PIN).unwrap_or_else(|_| "1234".to_string());

    Pkcs11Config::new(lib_path)
        .with_token_label(label)
        .with_user_pin(pin)
        .with_max_sessions(4)
}

fn init_logging() {
    let _ = stderrlog::new().verbosity(3).init();
}

//------------ Tests ---------------------------------------------------------

// One test, as a PKCS#11 library can only be initialized once per process.
#[test]
fn softhsm() {
    init_logging();
    let context = Context::configure(&test_config()).unwrap();
    eprintln!(">>>> Using token {}", context.token());

    rsa_sign_and_decrypt(&context);
    ec_sign(&context);
    find_generated_key(&context);
    random(&context);
    concurrent_signing(&context);

    context.close().unwrap();
    assert!(matches!(context.generate_random(8), Err(Error::Closed)));
}

fn rsa_sign_and_decrypt(context: &Context) {
    let key = context.generate_rsa_key_pair(2048).unwrap();
    let pkey = key.public_key().to_pkey().unwrap();

    let msg = b"signed by softhsm";
    let digest = openssl::sha::sha256(msg);
    let sig = key
        .sign(&digest, SignatureScheme::Pkcs1v15(Some(HashAlgorithm::Sha256)))
        .unwrap();
    let mut verifier = Verifier::new(MessageDigest::sha256(), &pkey).unwrap();
    verifier.update(msg).unwrap();
    assert!(verifier.verify(&sig).unwrap());

    let rsa = pkey.rsa().unwrap();
    let mut ciphertext = vec![0; rsa.size() as usize];
    let len = rsa.public_encrypt(b"secret", &mut ciphertext, Padding::PKCS1).unwrap();
    ciphertext.truncate(len);
    let plain = key
        .decrypt(&ciphertext, &DecryptOptions::Pkcs1v15 { session_key_len: 0 })
        .unwrap();
    assert_eq!(plain, b"secret");
}

fn ec_sign(context: &Context) {
    let key = context.generate_ec_key_pair(EcCurve::P256).unwrap();
    let digest = openssl::sha::sha256(b"signed by softhsm");
    let sig = key.sign(&digest, SignatureScheme::Ecdsa).unwrap();

    let ec = key.public_key().to_pkey().unwrap().ec_key().unwrap();
    assert!(EcdsaSig::from_der(&sig).unwrap().verify(&digest, &ec).unwrap());
}

fn find_generated_key(context: &Context) {
    let key = context.generate_rsa_key_pair(2048).unwrap();
    let found = context.find_key_pair(key.id(), None).unwrap();
    assert_eq!(found.public_key(), key.public_key());

    let found = context.find_key_pair(None, key.label()).unwrap();
    assert_eq!(found.public_key(), key.public_key());

    assert!(matches!(
        context.find_key_pair(Some(b"no such key"), None),
        Err(Error::KeyNotFound)
    ));
}

fn random(context: &Context) {
    assert_eq!(context.generate_random(64).unwrap().len(), 64);

    let mut buf = [0u8; 32];
    context.random().read_exact(&mut buf).unwrap();
}

fn concurrent_signing(context: &Context) {
    let key = Arc::new(context.generate_ec_key_pair(EcCurve::P384).unwrap());
    let threads: Vec<_> = (0..16)
        .map(|i| {
            let key = key.clone();
            thread::spawn(move || {
                let digest = openssl::sha::sha384(&[i as u8]);
                key.sign(&digest, SignatureScheme::Ecdsa).unwrap()
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let state = context.pool_state();
    assert!(state.sessions <= 4);
    assert_eq!(state.leased, 0);
}
