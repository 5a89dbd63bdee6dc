//! The connection with one token.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{
    config::Pkcs11Config,
    constants::KEY_ID_LEN,
    error::Error,
    key::PrivateKey,
    mechanism::EcCurve,
    object::ObjectRef,
    pkcs11::{
        Cryptoki, KeyPairKind, KeyPairTemplate, ObjectClass, ObjectQuery, Provider, TokenSession,
        session::SessionManager,
    },
    pool::{SessionPool, State},
    random::TokenRandom,
    token::{Token, find_token},
};

//------------ Context -------------------------------------------------------

/// A connection with the token selected by a [`Pkcs11Config`].
///
/// The context owns the loaded PKCS#11 library and a pool of sessions with the token. It is meant to be created once
/// and then shared: cloning gives another handle to the same connection and all operations can be used from any
/// number of threads at once.
///
/// A context must be closed explicitly with [`Context::close`]. After that it, and every key obtained from it, fails
/// all operations with [`Error::Closed`].
pub struct Context<P: Provider = Cryptoki> {
    inner: Arc<ContextInner<P>>,
}

pub(crate) struct ContextInner<P: Provider> {
    provider: Arc<P>,
    slot: P::Slot,
    token: Token,
    pool: SessionPool<SessionManager<P>>,
    closed: AtomicBool,
}

impl Context<Cryptoki> {
    /// Loads the PKCS#11 library and connects to the configured token.
    pub fn configure(config: &Pkcs11Config) -> Result<Self, Error> {
        config.verify().map_err(|err| {
            error!("Invalid PKCS#11 configuration: {}", err);
            Error::invalid_input(err)
        })?;

        let provider = Cryptoki::load(&config.lib_path)?;
        Self::with_provider(provider, config)
    }
}

impl<P: Provider> Context<P> {
    /// Connects to the configured token using an already loaded library.
    pub fn with_provider(provider: P, config: &Pkcs11Config) -> Result<Self, Error> {
        let slots = provider.slots_with_token()?;
        let serial = config.token_serial.as_deref();
        let label = config.token_label.as_deref();

        let (slot, token) = find_token(&slots, serial, label, |slot| provider.token_info(slot)).inspect_err(|err| {
            error!(
                "Could not find PKCS#11 token (serial: {:?}, label: {:?}) in {} slots: {}",
                serial,
                label,
                slots.len(),
                err
            )
        })?;

        let max_sessions = config.effective_max_sessions();
        token
            .check_session_limit(max_sessions)
            .inspect_err(|err| error!("Cannot use PKCS#11 token {}: {}", token, err))?;

        let provider = Arc::new(provider);
        let manager = SessionManager::new(provider.clone(), slot, config.user_pin.clone());
        let pool = SessionPool::builder()
            .max_size(max_sessions)
            .idle_timeout(config.idle_timeout)
            .connection_timeout(config.pool_wait_timeout)
            .test_on_check_out(config.check_sessions_on_lease)
            .build(manager);

        info!(
            "Using PKCS#11 token {} in slot {:?} with at most {} sessions",
            token, slot, max_sessions
        );

        Ok(Context {
            inner: Arc::new(ContextInner {
                provider,
                slot,
                token,
                pool,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn token(&self) -> &Token {
        &self.inner.token
    }

    pub fn slot(&self) -> P::Slot {
        self.inner.slot
    }

    pub fn provider(&self) -> &P {
        &self.inner.provider
    }

    pub fn pool_state(&self) -> State {
        self.inner.pool.state()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Closes the connection.
    ///
    /// New operations fail from the moment this is called. Operations already in progress are waited for, after
    /// which all sessions are closed and the library is finalized. Failure to finalize is returned, but leaves the
    /// context closed all the same. Closing a context that is already closed fails with [`Error::Closed`].
    ///
    /// Must not be called from inside [`Context::with_session`].
    pub fn close(&self) -> Result<(), Error> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        info!("Closing connection with PKCS#11 token {}", self.inner.token);
        self.inner.pool.close();

        self.inner
            .provider
            .finalize()
            .inspect_err(|err| warn!("Could not finalize PKCS#11 library: {}", err))
    }

    /// Runs `op` with a session leased for the duration of the call.
    pub fn with_session<T, F>(&self, operation: &'static str, op: F) -> Result<T, Error>
    where
        F: FnOnce(&mut P::Session) -> Result<T, Error>,
    {
        self.inner.with_session(operation, op)
    }

    /// Finds a key pair by CKA_ID and/or CKA_LABEL.
    ///
    /// Both the private and the public key must be present. If more than one pair matches, the first one the token
    /// reports is used.
    pub fn find_key_pair(&self, id: Option<&[u8]>, label: Option<&str>) -> Result<PrivateKey<P>, Error> {
        if id.is_none() && label.is_none() {
            return Err(Error::invalid_input("a key pair is found by id, label or both"));
        }

        let (handle, public_key) = self.with_session("find key pair", |session| {
            let private = first_object(session, &ObjectQuery::new(ObjectClass::PrivateKey, id, label))?;
            let public = first_object(session, &ObjectQuery::new(ObjectClass::PublicKey, id, label))?;
            let key_type = session.key_type(private)?;
            let public_key = session.public_key(public, key_type)?;
            Ok((private, public_key))
        })?;

        Ok(PrivateKey::new(
            ObjectRef::new(handle, &self.inner),
            public_key,
            id.map(<[u8]>::to_vec),
            label.map(str::to_string),
        ))
    }

    /// Generates an RSA key pair with a modulus of `bits` bits on the token.
    pub fn generate_rsa_key_pair(&self, bits: u32) -> Result<PrivateKey<P>, Error> {
        if bits == 0 {
            return Err(Error::invalid_input("RSA modulus size cannot be zero"));
        }
        self.generate_key_pair(KeyPairKind::Rsa { bits })
    }

    /// Generates an EC key pair on the given curve on the token.
    pub fn generate_ec_key_pair(&self, curve: EcCurve) -> Result<PrivateKey<P>, Error> {
        self.generate_key_pair(KeyPairKind::Ec(curve))
    }

    fn generate_key_pair(&self, kind: KeyPairKind) -> Result<PrivateKey<P>, Error> {
        let id: [u8; KEY_ID_LEN] = rand::random();
        let template = KeyPairTemplate {
            id: id.to_vec(),
            label: hex::encode(id),
            kind,
        };

        let (handle, public_key) = self.with_session("generate key pair", |session| {
            let (public, private) = session.generate_key_pair(&template)?;
            let public_key = session.public_key(public, kind.key_type())?;
            Ok((private, public_key))
        })?;

        debug!("Generated {} key pair with id {}", kind, template.label);

        Ok(PrivateKey::new(
            ObjectRef::new(handle, &self.inner),
            public_key,
            Some(template.id),
            Some(template.label),
        ))
    }

    /// Returns `len` random bytes generated by the token.
    pub fn generate_random(&self, len: usize) -> Result<Vec<u8>, Error> {
        if len == 0 {
            return Ok(Vec::new());
        }

        let random = self.with_session("C_GenerateRandom", |session| session.generate_random(len))?;
        if random.len() < len {
            return Err(Error::InsufficientRandomData {
                wanted: len,
                got: random.len(),
            });
        }
        Ok(random)
    }

    /// A reader for random data from the token.
    pub fn random(&self) -> TokenRandom<P> {
        TokenRandom::new(self.clone())
    }
}

fn first_object<S: TokenSession>(session: &mut S, query: &ObjectQuery) -> Result<S::Object, Error> {
    let objects = session.find_objects(query)?;
    trace!("Found {} objects for {:?}", objects.len(), query);
    objects.into_iter().next().ok_or(Error::KeyNotFound)
}

impl<P: Provider> Clone for Context<P> {
    fn clone(&self) -> Self {
        Context {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Provider> fmt::Debug for Context<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("token", &self.inner.token)
            .field("slot", &self.inner.slot)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<P: Provider> ContextInner<P> {
    pub(crate) fn with_session<T, F>(&self, operation: &'static str, op: F) -> Result<T, Error>
    where
        F: FnOnce(&mut P::Session) -> Result<T, Error>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let mut session = self.pool.get()?;
        trace!("{} on leased session", operation);
        session.call(operation, op)
    }
}

//------------ Tests ---------------------------------------------------------
