//! Various crate-wide constants.

use std::time::Duration;

//------------ Session Pool -------------------------------------------------

/// The maximum number of concurrent sessions to open, unless otherwise specified in the configuration.
pub const DEFAULT_MAX_SESSIONS: u32 = 1024;

/// The shortest interval at which the pool looks for sessions that have been idle for too long.
pub const MIN_REAPER_INTERVAL: Duration = Duration::from_millis(10);

//------------ Keys ---------------------------------------------------------

/// The number of random bytes used as CKA_ID for newly generated key pairs.
pub const KEY_ID_LEN: usize = 16;

//------------ Environment Variables ----------------------------------------

/// The environment variable pointing the SoftHSM tests at a PKCS#11 library.
pub const PKCS11_ENV_TEST_LIB: &str = "PKCS11_TEST_LIB";

/// The environment variable with the label of the token the SoftHSM tests use.
pub const PKCS11_ENV_TEST_LABEL: &str = "PKCS11_TEST_LABEL";

/// The environment variable with the user PIN of the token the SoftHSM tests use.
pub const PKCS11_ENV_TEST_PIN: &str = "PKCS11_TEST_PIN";
