//! The error type shared by every part of this crate.

use std::fmt;

use cryptoki::error::RvError;
use openssl::error::ErrorStack;

//------------ Error ---------------------------------------------------------

/// Errors surfaced to callers.
///
/// Callers are expected to branch on the variant, never on the message. The token return value is kept for
/// [`Error::Pkcs11`] so that callers which do care about PKCS#11 details can still inspect it.
#[derive(Debug)]
pub enum Error {
    /// No slot holds a token with the configured serial number or label.
    TokenNotFound,

    /// The PKCS#11 library could not be loaded.
    CannotOpenLibrary(String),

    /// The PKCS#11 library was loaded but `C_Initialize` failed.
    InitializationFailed(String),

    /// More sessions were requested than the token supports.
    SessionLimitExceeded { requested: u32, supported: u64 },

    /// No session became available within the wait budget.
    PoolExhausted,

    /// The session factory could not open (or log in to) a new session.
    SessionCreationFailed(String),

    /// The caller asked for an option that cannot be honoured with a token key.
    UnsupportedOption(String),

    /// The requested key (or one half of the key pair) does not exist on the token.
    KeyNotFound,

    /// The token holds a key of a type this crate does not handle.
    UnsupportedKeyType,

    /// The token returned fewer random bytes than asked for.
    InsufficientRandomData { wanted: usize, got: usize },

    /// The context (or its session pool) has been closed.
    Closed,

    /// The token rejected an operation.
    Pkcs11 { operation: &'static str, rv: RvError },

    /// The PKCS#11 wrapper failed without the token returning a value, e.g. a missing library function.
    Library(String),

    /// Caller supplied input that cannot be valid for the requested operation.
    InvalidInput(String),

    OpenSsl(ErrorStack),
}

impl Error {
    /// Converts an error reported by the `cryptoki` crate while performing `operation`.
    pub fn pkcs11(operation: &'static str, err: cryptoki::error::Error) -> Self {
        match err {
            cryptoki::error::Error::Pkcs11(rv, _) => Error::Pkcs11 { operation, rv },
            other => Error::Library(format!("{} failed: {}", operation, other)),
        }
    }

    pub fn invalid_input(msg: impl fmt::Display) -> Self {
        Error::InvalidInput(msg.to_string())
    }

    pub fn unsupported_option(msg: impl fmt::Display) -> Self {
        Error::UnsupportedOption(msg.to_string())
    }

    /// Does this error leave the session it occurred on in a state where it must not be used again?
    ///
    /// Only token return values are considered. Errors which are about the request rather than the session (bad
    /// mechanism, bad key handle, bad data) leave the session perfectly usable.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            Error::Pkcs11 { rv, .. } => is_session_fatal_rv(*rv),
            _ => false,
        }
    }
}

/// The return values after which a session is discarded instead of being handed to the next caller.
fn is_session_fatal_rv(rv: RvError) -> bool {
    match rv {
        RvError::SessionClosed => true,
        RvError::SessionHandleInvalid => true,
        RvError::DeviceError => true,
        RvError::DeviceMemory => true,
        RvError::DeviceRemoved => true,
        RvError::TokenNotPresent => true,
        RvError::TokenNotRecognized => true,
        RvError::GeneralError => true,
        RvError::CryptokiNotInitialized => true,
        // the login state of the application was lost, e.g. the token was reset
        RvError::UserNotLoggedIn => true,
        // an earlier operation was never finished or cancelled, the next one would fail the same way
        RvError::OperationActive => true,
        _ => false,
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::TokenNotFound => write!(f, "Could not find PKCS#11 token"),
            Error::CannotOpenLibrary(e) => write!(f, "Could not open PKCS#11 library: {}", e),
            Error::InitializationFailed(e) => write!(f, "Could not initialize PKCS#11 library: {}", e),
            Error::SessionLimitExceeded { requested, supported } => write!(
                f,
                "Provided max sessions value ({}) exceeds max value the token supports ({})",
                requested, supported
            ),
            Error::PoolExhausted => write!(f, "No PKCS#11 session became available in time"),
            Error::SessionCreationFailed(e) => write!(f, "Could not open PKCS#11 session: {}", e),
            Error::UnsupportedOption(e) => write!(f, "Unsupported option: {}", e),
            Error::KeyNotFound => write!(f, "Could not find PKCS#11 key"),
            Error::UnsupportedKeyType => write!(f, "Unrecognized key type"),
            Error::InsufficientRandomData { wanted, got } => write!(
                f,
                "Cannot get random data from PKCS#11: wanted {} bytes, got {}",
                wanted, got
            ),
            Error::Closed => write!(f, "PKCS#11 context is closed"),
            Error::Pkcs11 { operation, rv } => write!(f, "{} failed: {}", operation, rv),
            Error::Library(e) => write!(f, "PKCS#11 library error: {}", e),
            Error::InvalidInput(e) => write!(f, "Invalid input: {}", e),
            Error::OpenSsl(e) => write!(f, "OpenSSL error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorStack> for Error {
    fn from(e: ErrorStack) -> Self {
        Error::OpenSsl(e)
    }
}

//------------ Tests ---------------------------------------------------------
