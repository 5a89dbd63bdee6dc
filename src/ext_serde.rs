//! Defines helper methods for Deserializing external types.

use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

/// Reads an optional number of seconds. Zero is the same as leaving the setting out.
pub fn de_opt_duration_secs<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = Option::<u64>::deserialize(d)?;
    Ok(secs.filter(|secs| *secs > 0).map(Duration::from_secs))
}

/// Reads an optional PIN. An empty string is the same as leaving the setting out.
pub fn de_opt_pin<'de, D>(d: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let pin = Option::<String>::deserialize(d)?;
    Ok(pin.filter(|pin| !pin.is_empty()).map(SecretString::new))
}
