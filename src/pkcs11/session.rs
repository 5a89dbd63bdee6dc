//! Opening sessions for the session pool.

use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use cryptoki::error::RvError;
use r2d2::ManageConnection;
use secrecy::SecretString;

use crate::{
    error::Error,
    pkcs11::{Provider, TokenSession},
};

//------------ Pkcs11Session -------------------------------------------------

/// A session held by the pool.
///
/// Remembers whether an operation on the session failed in a way that leaves the session unusable, in which case
/// the pool closes it instead of handing it out again.
#[derive(Debug)]
pub struct Pkcs11Session<S> {
    session: S,
    broken: bool,
}

impl<S: TokenSession> Pkcs11Session<S> {
    fn new(session: S) -> Self {
        Pkcs11Session { session, broken: false }
    }

    /// Runs `op` on the session, marking the session as broken if the token says it is.
    pub fn call<T, F>(&mut self, operation: &str, op: F) -> Result<T, Error>
    where
        F: FnOnce(&mut S) -> Result<T, Error>,
    {
        let res = op(&mut self.session);
        if let Err(err) = &res {
            if err.is_session_fatal() {
                warn!("Discarding PKCS#11 session after failed {}: {}", operation, err);
                self.broken = true;
            }
        }
        res
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl<S> Deref for Pkcs11Session<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

impl<S> DerefMut for Pkcs11Session<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.session
    }
}

//------------ SessionManager ------------------------------------------------

/// Opens logged in sessions with the token in one slot.
pub struct SessionManager<P: Provider> {
    provider: Arc<P>,
    slot: P::Slot,
    user_pin: Option<SecretString>,
}

impl<P: Provider> SessionManager<P> {
    pub fn new(provider: Arc<P>, slot: P::Slot, user_pin: Option<SecretString>) -> Self {
        SessionManager {
            provider,
            slot,
            user_pin,
        }
    }

    pub fn slot(&self) -> P::Slot {
        self.slot
    }
}

impl<P: Provider> ManageConnection for SessionManager<P> {
    type Connection = Pkcs11Session<P::Session>;
    type Error = Error;

    fn connect(&self) -> Result<Self::Connection, Error> {
        let mut session = self.provider.open_session(self.slot)?;

        if let Some(pin) = &self.user_pin {
            // Login state is shared by all sessions of the application, so only the first session really logs in.
            match session.login(pin) {
                Ok(()) => trace!("Logged in to new session in slot {:?}", self.slot),
                Err(Error::Pkcs11 {
                    rv: RvError::UserAlreadyLoggedIn,
                    ..
                }) => {
                    warn!("PKCS#11 user is already logged in, continuing with new session");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(Pkcs11Session::new(session))
    }

    fn is_valid(&self, session: &mut Self::Connection) -> Result<(), Error> {
        session.call("C_GetSessionInfo", |session| session.check())
    }

    fn has_broken(&self, session: &mut Self::Connection) -> bool {
        session.is_broken()
    }
}
