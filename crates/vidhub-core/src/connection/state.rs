/*!
 * Connection lifecycle state flags.
 *
 * A [`ConnectionState`] always carries exactly one base value
 * (`not_connected`, `connecting`, `disconnecting` or `connected`) and may
 * additionally carry the `failure` modifier.
 */
use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

bitflags! {
    /// Lifecycle phase of a device connection
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConnectionState: u8 {
        /// No transport is open
        const NOT_CONNECTED = 0b0_0001;
        /// A transport is being opened and the prelude parsed
        const CONNECTING = 0b0_0010;
        /// The transport is being torn down
        const DISCONNECTING = 0b0_0100;
        /// The transport is open and the prelude has been parsed
        const CONNECTED = 0b0_1000;
        /// Modifier marking a failed connection
        const FAILURE = 0b1_0000;
    }
}

/// Canonical names in their stable output order
const STATE_NAMES: [(ConnectionState, &str); 5] = [
    (ConnectionState::NOT_CONNECTED, "not_connected"),
    (ConnectionState::CONNECTING, "connecting"),
    (ConnectionState::DISCONNECTING, "disconnecting"),
    (ConnectionState::CONNECTED, "connected"),
    (ConnectionState::FAILURE, "failure"),
];

impl ConnectionState {
    /// Mask matching either transitional state. Used for membership tests only.
    pub const WAITING: Self = Self::CONNECTING.union(Self::DISCONNECTING);

    /// True for exactly `connected`
    pub fn is_connected(&self) -> bool {
        *self == Self::CONNECTED
    }

    /// True when the `failure` modifier is present
    pub fn is_failure(&self) -> bool {
        self.contains(Self::FAILURE)
    }

    /// True when more than one flag is set, i.e. there is no single name for it
    pub fn is_compound(&self) -> bool {
        self.bits().count_ones() > 1
    }

    /// The state with the `failure` modifier removed
    pub fn base(&self) -> Self {
        self.difference(Self::FAILURE)
    }

    /// Parse a `|`-separated list of case-insensitive names
    ///
    /// `"disconnecting|failure"` parses to `DISCONNECTING | FAILURE`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut state = Self::empty();
        for token in s.split('|') {
            let token = token.trim();
            let flag = STATE_NAMES
                .iter()
                .find(|(_, name)| name.eq_ignore_ascii_case(token))
                .map(|(flag, _)| *flag)
                .ok_or_else(|| Error::invalid_state_name(format!("unknown state '{}' in '{}'", token, s)))?;
            state |= flag;
        }
        Ok(state)
    }

    /// The `|`-joined names of the flags in this state
    pub fn to_name(&self) -> String {
        STATE_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join("|")
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::NOT_CONNECTED
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_name())
    }
}

impl FromStr for ConnectionState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ConnectionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_name())
    }
}

impl<'de> Deserialize<'de> for ConnectionState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Self::parse(&name).map_err(serde::de::Error::custom)
    }
}
