//! Describing tokens and finding the one to use.

use std::fmt;

use crate::error::Error;

//------------ Token ---------------------------------------------------------

/// What we know about the token in a slot. Read once when the context is configured and never updated.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Token {
    pub serial_number: String,

    pub label: String,

    pub model: String,

    pub manufacturer_id: String,

    /// The maximum number of read/write sessions the token supports, `None` if it doesn't say or has no limit.
    pub max_rw_session_count: Option<u64>,
}

impl Token {
    /// Verifies that the token can support a pool of `requested` sessions.
    ///
    /// The token advertised maximum is treated as a hard limit rather than clamping the pool to it, so that a
    /// misconfiguration is noticed at startup instead of showing up as a smaller than expected pool.
    pub fn check_session_limit(&self, requested: u32) -> Result<(), Error> {
        match self.max_rw_session_count {
            Some(supported) if supported > 0 && u64::from(requested) > supported => {
                Err(Error::SessionLimitExceeded { requested, supported })
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} (serial: {}, model: {}, vendor: {})",
            self.label, self.serial_number, self.model, self.manufacturer_id
        )
    }
}

//------------ Token Locator -------------------------------------------------

/// Finds the first slot whose token has the given serial number or label.
///
/// Slots are visited in the given order and for each slot the serial number is compared before the label. Token
/// details are only queried up to and including the matching slot. Failure to query a slot aborts the search.
pub fn find_token<S, F>(
    slots: &[S],
    serial: Option<&str>,
    label: Option<&str>,
    mut token_info: F,
) -> Result<(S, Token), Error>
where
    S: Copy + fmt::Debug,
    F: FnMut(S) -> Result<Token, Error>,
{
    for &slot in slots {
        let token = token_info(slot)?;
        trace!("Slot {:?} holds token {}", slot, token);

        if serial.is_some_and(|serial| serial == token.serial_number) {
            return Ok((slot, token));
        }
        if label.is_some_and(|label| label == token.label) {
            return Ok((slot, token));
        }
    }
    Err(Error::TokenNotFound)
}

//------------ Tests ---------------------------------------------------------
