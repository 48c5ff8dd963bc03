//! Device identity.
//!
//! A device id is the opaque, non-empty name a simulated printer reports in
//! every payload (e.g. `printer-01`). It is not the MQTT client id; that one
//! is derived per connection by the client crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The identifier a device reports in its telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device id, rejecting blank names.
    pub fn new(name: impl Into<String>) -> Result<Self, DeviceIdError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DeviceIdError::Empty);
        }
        if name.chars().any(char::is_control) {
            return Err(DeviceIdError::ControlCharacter(name));
        }
        Ok(Self(name))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = DeviceIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

/// Error validating a device id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceIdError {
    #[error("device id cannot be empty")]
    Empty,
    #[error("device id contains a control character: {0:?}")]
    ControlCharacter(String),
}
