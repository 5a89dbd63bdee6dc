//! References to objects on the token.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use crate::{
    context::ContextInner,
    error::Error,
    pkcs11::{Cryptoki, Provider},
};

//------------ ObjectRef -----------------------------------------------------

/// An object on the token.
///
/// This is just the object handle plus a way back to the context it belongs to. No session is held: one is leased
/// for every operation on the object and returned as soon as the operation is done. The reference does not keep the
/// context alive; once the context is closed or dropped all operations fail with [`Error::Closed`].
pub struct ObjectRef<P: Provider = Cryptoki> {
    handle: P::Object,
    context: Weak<ContextInner<P>>,
}

impl<P: Provider> ObjectRef<P> {
    pub(crate) fn new(handle: P::Object, context: &Arc<ContextInner<P>>) -> Self {
        ObjectRef {
            handle,
            context: Arc::downgrade(context),
        }
    }

    pub fn handle(&self) -> P::Object {
        self.handle
    }

    /// Runs `op` with a leased session and the object handle. The session goes back to the pool when `op` returns,
    /// whatever the outcome.
    pub fn with_session<T, F>(&self, operation: &'static str, op: F) -> Result<T, Error>
    where
        F: FnOnce(&mut P::Session, P::Object) -> Result<T, Error>,
    {
        let context = self.context.upgrade().ok_or(Error::Closed)?;
        let handle = self.handle;
        context.with_session(operation, |session| op(session, handle))
    }
}

impl<P: Provider> Clone for ObjectRef<P> {
    fn clone(&self) -> Self {
        ObjectRef {
            handle: self.handle,
            context: self.context.clone(),
        }
    }
}

impl<P: Provider> fmt::Debug for ObjectRef<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef").field("handle", &self.handle).finish()
    }
}
