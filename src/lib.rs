//! Use keys held by a PKCS#11 token from many threads at once.
//!
//! A PKCS#11 session can only be used by one thread at a time. This crate keeps a pool of sessions with the token
//! and leases one out for the duration of each operation, so that keys on the token can be used like any other
//! shared signing or decryption key:
//!
//! ```no_run
//! use pkcs11_keys::{Context, HashAlgorithm, Pkcs11Config, SignatureScheme, Signer};
//!
//! let config = Pkcs11Config::new("/usr/lib/softhsm/libsofthsm2.so")
//!     .with_token_label("My token 1")
//!     .with_user_pin("1234");
//! let context = Context::configure(&config)?;
//!
//! let key = context.find_key_pair(None, Some("my key"))?;
//! let digest = [0u8; 32];
//! let signature = key.sign(&digest, SignatureScheme::Pkcs1v15(Some(HashAlgorithm::Sha256)))?;
//!
//! context.close()?;
//! # Ok::<(), pkcs11_keys::Error>(())
//! ```

#[macro_use]
extern crate log;

pub mod config;
pub mod constants;
pub mod context;
pub mod error;
pub mod ext_serde;
pub mod key;
pub mod mechanism;
pub mod object;
pub mod pkcs11;
pub mod pool;
pub mod random;
pub mod token;


pub use self::{
    config::{ConfigError, Pkcs11Config},
    context::Context,
    error::Error,
    key::{DecryptOptions, Decrypter, PrivateKey, PssSaltLength, PublicKey, SignatureScheme, Signer},
    mechanism::{EcCurve, HashAlgorithm},
    pkcs11::{Cryptoki, KeyType, Provider, TokenSession},
    token::Token,
};
