//! Private keys held by a token and what can be done with them.

use std::fmt;

use openssl::{
    bn::{BigNum, BigNumContext},
    ec::{EcGroup, EcKey, EcPoint},
    pkey::{PKey, Public},
    rsa::Rsa,
};

use crate::{
    error::Error,
    mechanism::{EcCurve, HashAlgorithm, Mechanism, ecdsa_signature_to_der},
    object::ObjectRef,
    pkcs11::{Cryptoki, KeyType, Provider, TokenSession},
};

//------------ PublicKey -----------------------------------------------------

/// The public half of a key pair as read from the token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PublicKey {
    Rsa {
        /// Big-endian modulus.
        modulus: Vec<u8>,

        /// Big-endian public exponent.
        public_exponent: Vec<u8>,
    },
    Ec {
        curve: EcCurve,

        /// The uncompressed point.
        point: Vec<u8>,
    },
}

impl PublicKey {
    pub fn key_type(&self) -> KeyType {
        match self {
            PublicKey::Rsa { .. } => KeyType::Rsa,
            PublicKey::Ec { .. } => KeyType::Ec,
        }
    }

    pub fn to_pkey(&self) -> Result<PKey<Public>, Error> {
        match self {
            PublicKey::Rsa {
                modulus,
                public_exponent,
            } => {
                let n = BigNum::from_slice(modulus)?;
                let e = BigNum::from_slice(public_exponent)?;
                Ok(PKey::from_rsa(Rsa::from_public_components(n, e)?)?)
            }
            PublicKey::Ec { curve, point } => {
                let group = EcGroup::from_curve_name(curve.nid())?;
                let mut ctx = BigNumContext::new()?;
                let point = EcPoint::from_bytes(&group, point, &mut ctx)?;
                Ok(PKey::from_ec_key(EcKey::from_public_key(&group, &point)?)?)
            }
        }
    }

    /// The DER encoded SubjectPublicKeyInfo.
    pub fn to_der(&self) -> Result<Vec<u8>, Error> {
        Ok(self.to_pkey()?.public_key_to_der()?)
    }
}

/// Strips the DER OCTET STRING that PKCS#11 wraps around CKA_EC_POINT. Some tokens return the bare point instead, so
/// that is accepted too.
pub fn unwrap_ec_point(curve: EcCurve, data: &[u8]) -> Result<Vec<u8>, Error> {
    let point_len = 1 + 2 * curve.field_len();

    if data.len() == point_len && data[0] == 0x04 {
        return Ok(data.to_vec());
    }

    let content = match data {
        [0x04, len, rest @ ..] if *len < 0x80 => Some((*len as usize, rest)),
        [0x04, 0x81, len, rest @ ..] => Some((*len as usize, rest)),
        _ => None,
    };

    match content {
        Some((len, rest)) if len == rest.len() && len == point_len => Ok(rest.to_vec()),
        _ => Err(Error::Library(format!("cannot parse {} EC point of {} bytes", curve, data.len()))),
    }
}

//------------ Signing and decryption options --------------------------------

/// How to sign a digest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignatureScheme {
    /// RSA PKCS#1 v1.5. With a hash algorithm the digest is wrapped in a DigestInfo, without one the input is signed
    /// as is.
    Pkcs1v15(Option<HashAlgorithm>),

    Pss { hash: HashAlgorithm, salt_len: PssSaltLength },

    Ecdsa,
}

impl fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SignatureScheme::Pkcs1v15(Some(hash)) => write!(f, "PKCS#1 v1.5 with {}", hash),
            SignatureScheme::Pkcs1v15(None) => write!(f, "PKCS#1 v1.5"),
            SignatureScheme::Pss { hash, .. } => write!(f, "PSS with {}", hash),
            SignatureScheme::Ecdsa => write!(f, "ECDSA"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PssSaltLength {
    /// Let the signer pick. Tokens need to be told, so this cannot be used.
    Auto,

    EqualsHash,

    Exact(usize),
}

/// How to decrypt a ciphertext.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DecryptOptions {
    /// RSA PKCS#1 v1.5. Only `session_key_len` zero is supported: the token cannot be asked to return random data
    /// in place of a badly padded plaintext.
    Pkcs1v15 { session_key_len: usize },

    Oaep { hash: HashAlgorithm, label: Vec<u8> },
}

//------------ Signer and Decrypter ------------------------------------------

pub trait Signer {
    fn public_key(&self) -> &PublicKey;

    /// Signs an already computed digest, returning the signature in the usual encoding for the scheme: the bare
    /// signature for RSA, a DER `Ecdsa-Sig-Value` for ECDSA.
    fn sign(&self, digest: &[u8], scheme: SignatureScheme) -> Result<Vec<u8>, Error>;
}

pub trait Decrypter {
    fn decrypt(&self, ciphertext: &[u8], options: &DecryptOptions) -> Result<Vec<u8>, Error>;
}

//------------ PrivateKey ----------------------------------------------------

/// A private key on the token together with its public key.
///
/// Every operation leases a token session for just the duration of the operation, so a key can be used from as
/// many threads at once as the session pool allows.
pub struct PrivateKey<P: Provider = Cryptoki> {
    object: ObjectRef<P>,
    public_key: PublicKey,
    key_type: KeyType,
    id: Option<Vec<u8>>,
    label: Option<String>,
}

impl<P: Provider> PrivateKey<P> {
    pub(crate) fn new(
        object: ObjectRef<P>,
        public_key: PublicKey,
        id: Option<Vec<u8>>,
        label: Option<String>,
    ) -> Self {
        PrivateKey {
            object,
            key_type: public_key.key_type(),
            public_key,
            id,
            label,
        }
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// The CKA_ID the key was found by or generated with.
    pub fn id(&self) -> Option<&[u8]> {
        self.id.as_deref()
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn object(&self) -> &ObjectRef<P> {
        &self.object
    }

    fn sign_mechanism(&self, digest: &[u8], scheme: SignatureScheme) -> Result<(Mechanism, Vec<u8>), Error> {
        match (self.key_type, scheme) {
            (KeyType::Rsa, SignatureScheme::Pkcs1v15(Some(hash))) => {
                Ok((Mechanism::RsaPkcs, hash.digest_info(digest)?))
            }
            (KeyType::Rsa, SignatureScheme::Pkcs1v15(None)) => Ok((Mechanism::RsaPkcs, digest.to_vec())),
            (KeyType::Rsa, SignatureScheme::Pss { hash, salt_len }) => {
                hash.check_digest(digest)?;
                let salt_len = match salt_len {
                    PssSaltLength::Auto => {
                        return Err(Error::unsupported_option("PSS salt length must be given explicitly"));
                    }
                    PssSaltLength::EqualsHash => hash.digest_len(),
                    PssSaltLength::Exact(len) => len,
                };
                Ok((Mechanism::RsaPkcsPss { hash, salt_len }, digest.to_vec()))
            }
            (KeyType::Ec, SignatureScheme::Ecdsa) => Ok((Mechanism::Ecdsa, digest.to_vec())),
            (key_type, scheme) => Err(Error::unsupported_option(format!(
                "cannot sign with {} using a {} key",
                scheme, key_type
            ))),
        }
    }
}

impl<P: Provider> Signer for PrivateKey<P> {
    fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    fn sign(&self, digest: &[u8], scheme: SignatureScheme) -> Result<Vec<u8>, Error> {
        let (mechanism, data) = self.sign_mechanism(digest, scheme)?;
        let signature = self
            .object
            .with_session("C_Sign", |session, key| session.sign(key, &mechanism, &data))?;

        match mechanism {
            Mechanism::Ecdsa => ecdsa_signature_to_der(&signature),
            _ => Ok(signature),
        }
    }
}

impl<P: Provider> Decrypter for PrivateKey<P> {
    fn decrypt(&self, ciphertext: &[u8], options: &DecryptOptions) -> Result<Vec<u8>, Error> {
        if self.key_type != KeyType::Rsa {
            return Err(Error::UnsupportedKeyType);
        }

        let mechanism = match options {
            DecryptOptions::Pkcs1v15 { session_key_len: 0 } => Mechanism::RsaPkcs,
            DecryptOptions::Pkcs1v15 { .. } => {
                return Err(Error::unsupported_option("PKCS#1 v1.5 session key decryption"));
            }
            DecryptOptions::Oaep { hash, label } => Mechanism::RsaPkcsOaep {
                hash: *hash,
                label: label.clone(),
            },
        };

        self.object
            .with_session("C_Decrypt", |session, key| session.decrypt(key, &mechanism, ciphertext))
    }
}

impl<P: Provider> fmt::Debug for PrivateKey<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("handle", &self.object.handle())
            .field("key_type", &self.key_type)
            .field("label", &self.label)
            .finish()
    }
}

//------------ Tests ---------------------------------------------------------
