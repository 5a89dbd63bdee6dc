//! Access to a PKCS#11 token.
//!
//! Everything the rest of the crate needs from a token goes through the [`Provider`] and [`TokenSession`] traits.
//! The [`Cryptoki`] provider implements them on top of a real PKCS#11 library. Keeping the token behind a trait lets
//! the pool, context and key code be exercised against an in-memory token.

use std::fmt;

use secrecy::SecretString;

use crate::{
    error::Error,
    key::PublicKey,
    mechanism::{EcCurve, Mechanism},
    token::Token,
};

pub mod cryptoki;
pub mod session;

pub use self::cryptoki::Cryptoki;

//------------ Provider ------------------------------------------------------

/// A loaded and initialized PKCS#11 library.
pub trait Provider: Send + Sync + 'static {
    /// Identifies a slot.
    type Slot: Copy + fmt::Debug + Send + Sync + 'static;

    /// Identifies an object on the token. Handles are only meaningful to sessions of the same library.
    type Object: Copy + fmt::Debug + Send + Sync + 'static;

    type Session: TokenSession<Object = Self::Object> + Send + 'static;

    /// Lists the slots which currently hold a token, in the order the library reports them.
    fn slots_with_token(&self) -> Result<Vec<Self::Slot>, Error>;

    fn token_info(&self, slot: Self::Slot) -> Result<Token, Error>;

    /// Opens a new read/write session with the token in `slot`.
    fn open_session(&self, slot: Self::Slot) -> Result<Self::Session, Error>;

    /// Tells the library we are done with it. All sessions must have been closed before this is called and the
    /// provider cannot be used afterwards.
    fn finalize(&self) -> Result<(), Error>;
}

//------------ TokenSession --------------------------------------------------

/// An open session with a token.
///
/// A session must only be used by one thread at a time, which is why all operations take `&mut self`.
pub trait TokenSession {
    type Object: Copy + fmt::Debug;

    /// Logs the normal user in. Note that logging in applies to all sessions of the application with the token, so
    /// this can fail with CKR_USER_ALREADY_LOGGED_IN.
    fn login(&mut self, pin: &SecretString) -> Result<(), Error>;

    /// Verifies that the session is still usable.
    fn check(&mut self) -> Result<(), Error>;

    fn find_objects(&mut self, query: &ObjectQuery) -> Result<Vec<Self::Object>, Error>;

    /// Returns the type of a key object, or [`Error::UnsupportedKeyType`] for keys other than RSA and EC keys.
    fn key_type(&mut self, object: Self::Object) -> Result<KeyType, Error>;

    /// Reads the public key material from a public or private key object.
    fn public_key(&mut self, object: Self::Object, key_type: KeyType) -> Result<PublicKey, Error>;

    fn sign(&mut self, key: Self::Object, mechanism: &Mechanism, data: &[u8]) -> Result<Vec<u8>, Error>;

    fn decrypt(&mut self, key: Self::Object, mechanism: &Mechanism, ciphertext: &[u8]) -> Result<Vec<u8>, Error>;

    /// Generates a key pair that is stored on the token, returning the public and private key object.
    fn generate_key_pair(&mut self, template: &KeyPairTemplate) -> Result<(Self::Object, Self::Object), Error>;

    /// Asks the token for `len` random bytes. The token may return fewer.
    fn generate_random(&mut self, len: usize) -> Result<Vec<u8>, Error>;
}

//------------ ObjectClass ---------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObjectClass {
    PublicKey,
    PrivateKey,
}

//------------ KeyType -------------------------------------------------------

/// The types of keys this crate can use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyType {
    Rsa,
    Ec,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyType::Rsa => write!(f, "RSA"),
            KeyType::Ec => write!(f, "EC"),
        }
    }
}

//------------ ObjectQuery ---------------------------------------------------

/// Selects objects of a class by CKA_ID and/or CKA_LABEL.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectQuery {
    pub class: ObjectClass,
    pub id: Option<Vec<u8>>,
    pub label: Option<String>,
}

impl ObjectQuery {
    pub fn new(class: ObjectClass, id: Option<&[u8]>, label: Option<&str>) -> Self {
        ObjectQuery {
            class,
            id: id.map(|id| id.to_vec()),
            label: label.map(|label| label.to_string()),
        }
    }

    /// Does an object with these attributes match?
    pub fn matches(&self, class: ObjectClass, id: &[u8], label: &str) -> bool {
        self.class == class
            && self.id.as_deref().is_none_or(|wanted| wanted == id)
            && self.label.as_deref().is_none_or(|wanted| wanted == label)
    }
}

//------------ KeyPairTemplate -----------------------------------------------

/// What to generate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyPairKind {
    Rsa { bits: u32 },
    Ec(EcCurve),
}

impl KeyPairKind {
    pub fn key_type(self) -> KeyType {
        match self {
            KeyPairKind::Rsa { .. } => KeyType::Rsa,
            KeyPairKind::Ec(_) => KeyType::Ec,
        }
    }
}

impl fmt::Display for KeyPairKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyPairKind::Rsa { bits } => write!(f, "RSA {}", bits),
            KeyPairKind::Ec(curve) => write!(f, "EC {}", curve),
        }
    }
}

/// A persistent key pair to generate. Both halves get the same CKA_ID and CKA_LABEL. The private key is sensitive
/// and can be used to sign and, for RSA, to decrypt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyPairTemplate {
    pub id: Vec<u8>,
    pub label: String,
    pub kind: KeyPairKind,
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_matches_on_given_attributes_only() {
        let by_id = ObjectQuery::new(ObjectClass::PrivateKey, Some(b"id"), None);
        assert!(by_id.matches(ObjectClass::PrivateKey, b"id", "anything"));
        assert!(!by_id.matches(ObjectClass::PublicKey, b"id", "anything"));
        assert!(!by_id.matches(ObjectClass::PrivateKey, b"other", "anything"));

        let both = ObjectQuery::new(ObjectClass::PublicKey, Some(b"id"), Some("label"));
        assert!(both.matches(ObjectClass::PublicKey, b"id", "label"));
        assert!(!both.matches(ObjectClass::PublicKey, b"id", "other"));
    }
}
