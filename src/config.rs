//! Configuration of the PKCS#11 library, token and session pool to use.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use secrecy::SecretString;
use serde::Deserialize;

use crate::{constants::DEFAULT_MAX_SESSIONS, ext_serde};

//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn max_sessions() -> u32 {
        DEFAULT_MAX_SESSIONS
    }

    fn check_sessions_on_lease() -> bool {
        false
    }
}

//------------ Pkcs11Config --------------------------------------------------

/// Identifies the PKCS#11 library and token to use, how to log in to it and how to size the session pool.
///
/// A token may be identified either by serial number or label. If both are given then the first slot whose token
/// matches either wins.
///
/// In configuration files the timeouts are given in seconds, e.g.:
///
/// ```json
/// {
///   "lib_path": "/usr/lib/softhsm/libsofthsm2.so",
///   "token_label": "My token 1",
///   "user_pin": "1234",
///   "max_sessions": 16,
///   "idle_timeout": 300,
///   "pool_wait_timeout": 5
/// }
/// ```
#[derive(Debug, Deserialize)]
pub struct Pkcs11Config {
    /// Full path to the PKCS#11 library.
    pub lib_path: PathBuf,

    #[serde(default)]
    pub token_serial: Option<String>,

    #[serde(default)]
    pub token_label: Option<String>,

    /// When no PIN is given sessions are not logged in, which is what tokens with a protected authentication path
    /// (e.g. a PIN pad) expect.
    #[serde(default, deserialize_with = "ext_serde::de_opt_pin")]
    pub user_pin: Option<SecretString>,

    /// Maximum number of concurrent sessions to open. Zero means the default.
    #[serde(default = "ConfigDefaults::max_sessions")]
    pub max_sessions: u32,

    /// How long a session may sit unused in the pool before it is closed. `None` keeps idle sessions forever.
    #[serde(default, deserialize_with = "ext_serde::de_opt_duration_secs")]
    pub idle_timeout: Option<Duration>,

    /// How long to wait for a session when all of them are in use. `None` waits until one is returned.
    #[serde(default, deserialize_with = "ext_serde::de_opt_duration_secs")]
    pub pool_wait_timeout: Option<Duration>,

    /// Check that an idle session is still alive before handing it out.
    #[serde(default = "ConfigDefaults::check_sessions_on_lease")]
    pub check_sessions_on_lease: bool,
}

impl Pkcs11Config {
    pub fn new(lib_path: impl Into<PathBuf>) -> Self {
        Pkcs11Config {
            lib_path: lib_path.into(),
            token_serial: None,
            token_label: None,
            user_pin: None,
            max_sessions: ConfigDefaults::max_sessions(),
            idle_timeout: None,
            pool_wait_timeout: None,
            check_sessions_on_lease: ConfigDefaults::check_sessions_on_lease(),
        }
    }

    pub fn with_token_serial(mut self, serial: impl Into<String>) -> Self {
        self.token_serial = Some(serial.into());
        self
    }

    pub fn with_token_label(mut self, label: impl Into<String>) -> Self {
        self.token_label = Some(label.into());
        self
    }

    pub fn with_user_pin(mut self, pin: impl Into<String>) -> Self {
        self.user_pin = Some(SecretString::new(pin.into()));
        self
    }

    pub fn with_max_sessions(mut self, max_sessions: u32) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout).filter(|timeout| !timeout.is_zero());
        self
    }

    pub fn with_pool_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.pool_wait_timeout = Some(wait_timeout);
        self
    }

    pub fn with_check_sessions_on_lease(mut self, check: bool) -> Self {
        self.check_sessions_on_lease = check;
        self
    }

    /// The number of sessions the pool may hold, with zero meaning the default.
    pub fn effective_max_sessions(&self) -> u32 {
        if self.max_sessions == 0 {
            DEFAULT_MAX_SESSIONS
        } else {
            self.max_sessions
        }
    }

    /// Reads a configuration file. Files ending in `.toml` are read as TOML, anything else as JSON.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;

        let is_toml = path.extension().map(|ext| ext == "toml").unwrap_or(false);
        let config: Pkcs11Config = if is_toml {
            toml::from_str(&contents)?
        } else {
            serde_json::from_str(&contents)?
        };

        config.verify()?;
        Ok(config)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.lib_path.as_os_str().is_empty() {
            return Err(ConfigError::other("lib_path must point to a PKCS#11 library"));
        }

        let serial_missing = self.token_serial.as_deref().map(str::is_empty).unwrap_or(true);
        let label_missing = self.token_label.as_deref().map(str::is_empty).unwrap_or(true);
        if serial_missing && label_missing {
            return Err(ConfigError::other("token_serial or token_label must be set"));
        }

        Ok(())
    }
}

//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    JsonError(serde_json::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::JsonError(e) => write!(f, "Could not decode config file: {}", e),
            ConfigError::TomlError(e) => write!(f, "Could not decode config file: {}", e),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::JsonError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}

//------------ Tests ---------------------------------------------------------
