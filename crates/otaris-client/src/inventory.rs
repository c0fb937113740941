//! Inventory reporting.

use reportify::{Report, ResultExt};
use serde::Serialize;

use crate::api::{api_error, ApiClient, ApiRequest, API_INVENTORY};
use crate::{ClientError, ClientResult};

/// A single inventory attribute of the device.
#[derive(Debug, Clone, Serialize)]
pub struct InventoryItem {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl InventoryItem {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            description: None,
        }
    }
}

impl ApiClient {
    /// Replace the device's inventory attributes on the server.
    pub fn update_inventory(&mut self, items: &[InventoryItem]) -> ClientResult<()> {
        if self.servers()[self.active_server()].api_token().is_none() {
            return Err(Report::new(ClientError::NotAuthorized));
        }
        let body = serde_json::to_value(items).whatever("unable to serialize inventory items")?;
        let response = self.send(&ApiRequest::patch_json(API_INVENTORY, body))?;
        match response.status().as_u16() {
            200 => Ok(()),
            _ => Err(api_error(response)),
        }
    }
}
