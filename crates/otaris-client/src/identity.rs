//! Device identity.

use std::collections::BTreeMap;

use reportify::ResultExt;

use crate::ClientResult;

/// The identity attributes of a device.
///
/// The attributes are serialized once to a canonical JSON form whose exact
/// bytes are signed during authentication; the identity is produced once
/// per boot and treated as immutable afterwards.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    data: String,
}

impl DeviceIdentity {
    /// Serialize the given attributes into a device identity.
    pub fn from_attributes(attributes: &BTreeMap<String, String>) -> ClientResult<Self> {
        Ok(Self {
            data: serde_json::to_string(attributes)
                .whatever("unable to serialize identity attributes")?,
        })
    }

    /// The canonical serialized form.
    pub fn as_str(&self) -> &str {
        &self.data
    }

    /// The exact bytes that are signed.
    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }
}
