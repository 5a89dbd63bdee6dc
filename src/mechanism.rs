//! The token mechanisms used by this crate and the bits of encoding that the token leaves to us.

use std::fmt;

use openssl::{bn::BigNum, ecdsa::EcdsaSig, nid::Nid};

use crate::error::Error;

//------------ HashAlgorithm -------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HashAlgorithm {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// The length in bytes of a digest made with this algorithm.
    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha224 => 28,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// The DER encoded start of a PKCS#1 v1.5 DigestInfo for this algorithm, up to and including the length of the
    /// digest octet string. CKM_RSA_PKCS signs whatever it is given, so the DigestInfo is ours to add.
    pub fn digest_info_prefix(self) -> &'static [u8] {
        match self {
            HashAlgorithm::Sha1 => &[
                0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
            ],
            HashAlgorithm::Sha224 => &[
                0x30, 0x2d, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x04, 0x05, 0x00,
                0x04, 0x1c,
            ],
            HashAlgorithm::Sha256 => &[
                0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, 0x05, 0x00,
                0x04, 0x20,
            ],
            HashAlgorithm::Sha384 => &[
                0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02, 0x05, 0x00,
                0x04, 0x30,
            ],
            HashAlgorithm::Sha512 => &[
                0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03, 0x05, 0x00,
                0x04, 0x40,
            ],
        }
    }

    /// Verifies that `digest` could have been made with this algorithm.
    pub fn check_digest(self, digest: &[u8]) -> Result<(), Error> {
        if digest.len() == self.digest_len() {
            Ok(())
        } else {
            Err(Error::invalid_input(format!(
                "{} digest must be {} bytes, got {}",
                self,
                self.digest_len(),
                digest.len()
            )))
        }
    }

    /// Prepends the DigestInfo prefix to `digest`.
    pub fn digest_info(self, digest: &[u8]) -> Result<Vec<u8>, Error> {
        self.check_digest(digest)?;
        let prefix = self.digest_info_prefix();
        let mut res = Vec::with_capacity(prefix.len() + digest.len());
        res.extend_from_slice(prefix);
        res.extend_from_slice(digest);
        Ok(res)
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            HashAlgorithm::Sha1 => "SHA-1",
            HashAlgorithm::Sha224 => "SHA-224",
            HashAlgorithm::Sha256 => "SHA-256",
            HashAlgorithm::Sha384 => "SHA-384",
            HashAlgorithm::Sha512 => "SHA-512",
        };
        f.write_str(name)
    }
}

//------------ Mechanism -----------------------------------------------------

/// A signing or decryption mechanism as understood by the token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Mechanism {
    /// CKM_RSA_PKCS: PKCS#1 v1.5 padding of caller supplied data.
    RsaPkcs,

    /// CKM_RSA_PKCS_PSS over an already computed digest.
    RsaPkcsPss { hash: HashAlgorithm, salt_len: usize },

    /// CKM_RSA_PKCS_OAEP with MGF1 using the same hash.
    RsaPkcsOaep { hash: HashAlgorithm, label: Vec<u8> },

    /// CKM_ECDSA over an already computed digest, producing raw `r || s`.
    Ecdsa,
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Mechanism::RsaPkcs => write!(f, "CKM_RSA_PKCS"),
            Mechanism::RsaPkcsPss { hash, salt_len } => write!(f, "CKM_RSA_PKCS_PSS ({}, salt {})", hash, salt_len),
            Mechanism::RsaPkcsOaep { hash, .. } => write!(f, "CKM_RSA_PKCS_OAEP ({})", hash),
            Mechanism::Ecdsa => write!(f, "CKM_ECDSA"),
        }
    }
}

//------------ EcCurve -------------------------------------------------------

/// The named curves supported for EC keys.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EcCurve {
    P256,
    P384,
    P521,
}

const P256_PARAMS: &[u8] = &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];
const P384_PARAMS: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x22];
const P521_PARAMS: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x23];

impl EcCurve {
    /// The DER encoded OID used as CKA_EC_PARAMS.
    pub fn params(self) -> &'static [u8] {
        match self {
            EcCurve::P256 => P256_PARAMS,
            EcCurve::P384 => P384_PARAMS,
            EcCurve::P521 => P521_PARAMS,
        }
    }

    /// Recognises CKA_EC_PARAMS read from the token.
    pub fn from_params(params: &[u8]) -> Option<Self> {
        [EcCurve::P256, EcCurve::P384, EcCurve::P521]
            .into_iter()
            .find(|curve| curve.params() == params)
    }

    pub fn nid(self) -> Nid {
        match self {
            EcCurve::P256 => Nid::X9_62_PRIME256V1,
            EcCurve::P384 => Nid::SECP384R1,
            EcCurve::P521 => Nid::SECP521R1,
        }
    }

    /// The size in bytes of each of `r` and `s` in a raw signature.
    pub fn field_len(self) -> usize {
        match self {
            EcCurve::P256 => 32,
            EcCurve::P384 => 48,
            EcCurve::P521 => 66,
        }
    }
}

impl fmt::Display for EcCurve {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EcCurve::P256 => write!(f, "P-256"),
            EcCurve::P384 => write!(f, "P-384"),
            EcCurve::P521 => write!(f, "P-521"),
        }
    }
}

//------------ ECDSA signatures ----------------------------------------------

/// Converts the raw `r || s` signature returned by CKM_ECDSA into the DER encoded `Ecdsa-Sig-Value` everyone else
/// expects.
pub fn ecdsa_signature_to_der(raw: &[u8]) -> Result<Vec<u8>, Error> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return Err(Error::Library(format!(
            "token returned an ECDSA signature of odd length {}",
            raw.len()
        )));
    }

    let (r, s) = raw.split_at(raw.len() / 2);
    let sig = EcdsaSig::from_private_components(BigNum::from_slice(r)?, BigNum::from_slice(s)?)?;
    Ok(sig.to_der()?)
}

//------------ Tests ---------------------------------------------------------
