//! The [`Provider`] for real PKCS#11 libraries, built on the `cryptoki` crate.

use std::{
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
};

use cryptoki::{
    context::{CInitializeArgs, Pkcs11},
    error::RvError,
    mechanism::{
        Mechanism as CkMechanism, MechanismType,
        rsa::{PkcsMgfType, PkcsOaepParams, PkcsOaepSource, PkcsPssParams},
    },
    object::{Attribute, AttributeType, KeyType as CkKeyType, ObjectClass as CkObjectClass, ObjectHandle},
    session::{Session, UserType},
    slot::{Limit, Slot},
    types::AuthPin,
};
use secrecy::{ExposeSecret, SecretString};

use crate::{
    error::Error,
    key::{PublicKey, unwrap_ec_point},
    mechanism::{EcCurve, HashAlgorithm, Mechanism},
    pkcs11::{KeyPairKind, KeyPairTemplate, KeyType, ObjectClass, ObjectQuery, Provider, TokenSession},
    token::Token,
};

const RSA_PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

//------------ Cryptoki ------------------------------------------------------

/// A PKCS#11 library loaded from disk.
#[derive(Debug)]
pub struct Cryptoki {
    lib_path: PathBuf,

    /// Taken out when the library is finalized.
    pkcs11: RwLock<Option<Pkcs11>>,
}

impl Cryptoki {
    /// Loads and initializes the library at `lib_path`.
    pub fn load(lib_path: &Path) -> Result<Self, Error> {
        let pkcs11 = Pkcs11::new(lib_path).map_err(|err| {
            error!("Failed to load PKCS#11 library '{}': {}", lib_path.display(), err);
            Error::CannotOpenLibrary(format!("{}: {}", lib_path.display(), err))
        })?;

        match pkcs11.initialize(CInitializeArgs::OsThreads) {
            Ok(()) => {}
            Err(cryptoki::error::Error::Pkcs11(RvError::CryptokiAlreadyInitialized, _)) => {
                warn!("PKCS#11 library '{}' was already initialized", lib_path.display());
            }
            Err(err) => {
                error!("Failed to initialize PKCS#11 library '{}': {}", lib_path.display(), err);
                return Err(Error::InitializationFailed(err.to_string()));
            }
        }

        if let Ok(info) = pkcs11.get_library_info() {
            debug!(
                "Loaded PKCS#11 library '{}' by {}",
                lib_path.display(),
                info.manufacturer_id().trim_end()
            );
        }

        Ok(Cryptoki {
            lib_path: lib_path.to_path_buf(),
            pkcs11: RwLock::new(Some(pkcs11)),
        })
    }

    pub fn lib_path(&self) -> &Path {
        &self.lib_path
    }

    fn with_pkcs11<T>(&self, op: impl FnOnce(&Pkcs11) -> Result<T, Error>) -> Result<T, Error> {
        let pkcs11 = self.pkcs11.read().unwrap_or_else(PoisonError::into_inner);
        match pkcs11.as_ref() {
            Some(pkcs11) => op(pkcs11),
            None => Err(Error::Closed),
        }
    }
}

impl Provider for Cryptoki {
    type Slot = Slot;
    type Object = ObjectHandle;
    type Session = CryptokiSession;

    fn slots_with_token(&self) -> Result<Vec<Slot>, Error> {
        self.with_pkcs11(|pkcs11| {
            pkcs11
                .get_slots_with_token()
                .map_err(|err| Error::pkcs11("C_GetSlotList", err))
        })
    }

    fn token_info(&self, slot: Slot) -> Result<Token, Error> {
        self.with_pkcs11(|pkcs11| {
            let info = pkcs11
                .get_token_info(slot)
                .map_err(|err| Error::pkcs11("C_GetTokenInfo", err))?;

            let max_rw_session_count = match info.max_rw_session_count() {
                Limit::Max(max) => Some(max),
                Limit::Unavailable | Limit::Infinite => None,
            };

            Ok(Token {
                serial_number: info.serial_number().trim_end().to_string(),
                label: info.label().trim_end().to_string(),
                model: info.model().trim_end().to_string(),
                manufacturer_id: info.manufacturer_id().trim_end().to_string(),
                max_rw_session_count,
            })
        })
    }

    fn open_session(&self, slot: Slot) -> Result<CryptokiSession, Error> {
        self.with_pkcs11(|pkcs11| {
            let session = pkcs11
                .open_rw_session(slot)
                .map_err(|err| Error::pkcs11("C_OpenSession", err))?;
            trace!("Opened PKCS#11 session with slot {:?}", slot);
            Ok(CryptokiSession { session })
        })
    }

    /// Finalizes the library once every session has been dropped.
    ///
    /// cryptoki calls C_Finalize when the last handle on the library goes away and only logs a failure, so this
    /// always succeeds.
    fn finalize(&self) -> Result<(), Error> {
        let pkcs11 = self.pkcs11.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pkcs11) = pkcs11 {
            pkcs11.finalize();
            debug!("Finalized PKCS#11 library {}", self.lib_path.display());
        }
        Ok(())
    }
}

//------------ CryptokiSession -----------------------------------------------

/// A session with a token. The session is closed when this is dropped.
#[derive(Debug)]
pub struct CryptokiSession {
    session: Session,
}

impl CryptokiSession {
    fn single_attribute(&self, object: ObjectHandle, attr: AttributeType) -> Result<Attribute, Error> {
        self.session
            .get_attributes(object, &[attr])
            .map_err(|err| Error::pkcs11("C_GetAttributeValue", err))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Library(format!("object {:?} has no attribute {:?}", object, attr)))
    }
}

impl TokenSession for CryptokiSession {
    type Object = ObjectHandle;

    fn login(&mut self, pin: &SecretString) -> Result<(), Error> {
        let pin = AuthPin::new(pin.expose_secret().clone().into());
        self.session
            .login(UserType::User, Some(&pin))
            .map_err(|err| Error::pkcs11("C_Login", err))
    }

    fn check(&mut self) -> Result<(), Error> {
        self.session
            .get_session_info()
            .map(|_| ())
            .map_err(|err| Error::pkcs11("C_GetSessionInfo", err))
    }

    fn find_objects(&mut self, query: &ObjectQuery) -> Result<Vec<ObjectHandle>, Error> {
        let class = match query.class {
            ObjectClass::PublicKey => CkObjectClass::PUBLIC_KEY,
            ObjectClass::PrivateKey => CkObjectClass::PRIVATE_KEY,
        };
        let mut template = vec![Attribute::Class(class)];
        if let Some(id) = &query.id {
            template.push(Attribute::Id(id.clone()));
        }
        if let Some(label) = &query.label {
            template.push(Attribute::Label(label.as_bytes().to_vec()));
        }

        self.session
            .find_objects(&template)
            .map_err(|err| Error::pkcs11("C_FindObjects", err))
    }

    fn key_type(&mut self, object: ObjectHandle) -> Result<KeyType, Error> {
        match self.single_attribute(object, AttributeType::KeyType)? {
            Attribute::KeyType(key_type) if key_type == CkKeyType::RSA => Ok(KeyType::Rsa),
            Attribute::KeyType(key_type) if key_type == CkKeyType::EC => Ok(KeyType::Ec),
            _ => Err(Error::UnsupportedKeyType),
        }
    }

    fn public_key(&mut self, object: ObjectHandle, key_type: KeyType) -> Result<PublicKey, Error> {
        match key_type {
            KeyType::Rsa => {
                let attrs = self
                    .session
                    .get_attributes(object, &[AttributeType::Modulus, AttributeType::PublicExponent])
                    .map_err(|err| Error::pkcs11("C_GetAttributeValue", err))?;

                let mut modulus = None;
                let mut public_exponent = None;
                for attr in attrs {
                    match attr {
                        Attribute::Modulus(n) => modulus = Some(n),
                        Attribute::PublicExponent(e) => public_exponent = Some(e),
                        _ => {}
                    }
                }

                match (modulus, public_exponent) {
                    (Some(modulus), Some(public_exponent)) => Ok(PublicKey::Rsa {
                        modulus,
                        public_exponent,
                    }),
                    _ => Err(Error::Library("RSA key lacks modulus or public exponent".to_string())),
                }
            }
            KeyType::Ec => {
                let curve = match self.single_attribute(object, AttributeType::EcParams)? {
                    Attribute::EcParams(params) => EcCurve::from_params(&params).ok_or(Error::UnsupportedKeyType)?,
                    _ => return Err(Error::UnsupportedKeyType),
                };
                match self.single_attribute(object, AttributeType::EcPoint)? {
                    Attribute::EcPoint(point) => Ok(PublicKey::Ec {
                        curve,
                        point: unwrap_ec_point(curve, &point)?,
                    }),
                    _ => Err(Error::Library("EC key lacks a public point".to_string())),
                }
            }
        }
    }

    fn sign(&mut self, key: ObjectHandle, mechanism: &Mechanism, data: &[u8]) -> Result<Vec<u8>, Error> {
        trace!("C_Sign with {}", mechanism);
        let mechanism = ck_mechanism(mechanism, &[]);
        self.session
            .sign(&mechanism, key, data)
            .map_err(|err| Error::pkcs11("C_Sign", err))
    }

    fn decrypt(&mut self, key: ObjectHandle, mechanism: &Mechanism, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        trace!("C_Decrypt with {}", mechanism);
        let label = match mechanism {
            Mechanism::RsaPkcsOaep { label, .. } => label.as_slice(),
            _ => &[],
        };
        let mechanism = ck_mechanism(mechanism, label);
        self.session
            .decrypt(&mechanism, key, ciphertext)
            .map_err(|err| Error::pkcs11("C_Decrypt", err))
    }

    fn generate_key_pair(&mut self, template: &KeyPairTemplate) -> Result<(ObjectHandle, ObjectHandle), Error> {
        let id = Attribute::Id(template.id.clone());
        let label = Attribute::Label(template.label.as_bytes().to_vec());

        let mut pub_template = vec![
            id.clone(),
            label.clone(),
            Attribute::Token(true),
            Attribute::Private(false),
            Attribute::Verify(true),
        ];
        let mut priv_template = vec![
            id,
            label,
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Extractable(false),
            Attribute::Sign(true),
        ];

        let mechanism = match template.kind {
            KeyPairKind::Rsa { bits } => {
                pub_template.push(Attribute::Encrypt(true));
                pub_template.push(Attribute::ModulusBits(u64::from(bits).into()));
                pub_template.push(Attribute::PublicExponent(RSA_PUBLIC_EXPONENT.to_vec()));
                priv_template.push(Attribute::Decrypt(true));
                CkMechanism::RsaPkcsKeyPairGen
            }
            KeyPairKind::Ec(curve) => {
                pub_template.push(Attribute::EcParams(curve.params().to_vec()));
                CkMechanism::EccKeyPairGen
            }
        };

        self.session
            .generate_key_pair(&mechanism, &pub_template, &priv_template)
            .map_err(|err| Error::pkcs11("C_GenerateKeyPair", err))
    }

    fn generate_random(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        let len = u32::try_from(len).map_err(|_| Error::invalid_input(format!("cannot ask for {} random bytes", len)))?;
        self.session
            .generate_random_vec(len)
            .map_err(|err| Error::pkcs11("C_GenerateRandom", err))
    }
}

//------------ Mechanism conversion ------------------------------------------

fn ck_mechanism<'a>(mechanism: &Mechanism, oaep_label: &'a [u8]) -> CkMechanism<'a> {
    match mechanism {
        Mechanism::RsaPkcs => CkMechanism::RsaPkcs,
        Mechanism::RsaPkcsPss { hash, salt_len } => CkMechanism::RsaPkcsPss(PkcsPssParams {
            hash_alg: hash_mechanism(*hash),
            mgf: mgf(*hash),
            s_len: (*salt_len as u64).into(),
        }),
        Mechanism::RsaPkcsOaep { hash, .. } => {
            let source = if oaep_label.is_empty() {
                PkcsOaepSource::empty()
            } else {
                PkcsOaepSource::data_specified(oaep_label)
            };
            CkMechanism::RsaPkcsOaep(PkcsOaepParams::new(hash_mechanism(*hash), mgf(*hash), source))
        }
        Mechanism::Ecdsa => CkMechanism::Ecdsa,
    }
}

fn hash_mechanism(hash: HashAlgorithm) -> MechanismType {
    match hash {
        HashAlgorithm::Sha1 => MechanismType::SHA1,
        HashAlgorithm::Sha224 => MechanismType::SHA224,
        HashAlgorithm::Sha256 => MechanismType::SHA256,
        HashAlgorithm::Sha384 => MechanismType::SHA384,
        HashAlgorithm::Sha512 => MechanismType::SHA512,
    }
}

fn mgf(hash: HashAlgorithm) -> PkcsMgfType {
    match hash {
        HashAlgorithm::Sha1 => PkcsMgfType::MGF1_SHA1,
        HashAlgorithm::Sha224 => PkcsMgfType::MGF1_SHA224,
        HashAlgorithm::Sha256 => PkcsMgfType::MGF1_SHA256,
        HashAlgorithm::Sha384 => PkcsMgfType::MGF1_SHA384,
        HashAlgorithm::Sha512 => PkcsMgfType::MGF1_SHA512,
    }
}
