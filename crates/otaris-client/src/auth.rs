//! Device authentication.
//!
//! The auth manager builds signed authentication requests from the device
//! identity and keystore and persists the bearer tokens returned by each
//! server. Tokens are keyed by the server's host so multi-server caches
//! survive restarts and configuration changes of URL path suffixes.

use reportify::{bail, ResultExt};
use serde::Serialize;
use tracing::debug;

use otaris_common::store::Store;

use crate::api::ServerDescriptor;
use crate::identity::DeviceIdentity;
use crate::keystore::Keystore;
use crate::ClientResult;

/// A signed authentication request ready to be sent.
pub struct AuthRequest {
    /// Canonical JSON body; the signature covers exactly these bytes.
    pub body: Vec<u8>,
    /// Raw signature over `body`.
    pub signature: Vec<u8>,
    /// Trimmed tenant token.
    pub tenant_token: String,
}

#[derive(Serialize)]
struct AuthRequestBody<'a> {
    id_data: &'a str,
    pubkey: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    tenant_token: &'a str,
}

/// Derive the token store key for a server URL.
///
/// The scheme and any path suffix are stripped so that
/// `https://mender.io/api/` and `https://mender.io` share one cache entry.
pub fn auth_token_store_key(server_url: &str) -> String {
    let host = server_url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split('/').next().unwrap_or(host);
    format!("auth-token-{host}")
}

/// Manages device authentication state across servers.
pub struct AuthManager {
    store: Store,
    keystore: Keystore,
    identity: DeviceIdentity,
}

impl AuthManager {
    pub fn new(store: Store, keystore: Keystore, identity: DeviceIdentity) -> Self {
        Self {
            store,
            keystore,
            identity,
        }
    }

    /// Whether a token for the given server is cached.
    pub fn is_authorized(&self, server: &ServerDescriptor) -> bool {
        matches!(self.auth_token(server), Ok(Some(token)) if !token.is_empty())
    }

    /// The cached bearer token for the given server, if any.
    pub fn auth_token(&self, server: &ServerDescriptor) -> ClientResult<Option<Vec<u8>>> {
        self.store
            .read(&auth_token_store_key(&server.url))
            .whatever("unable to read cached auth token")
    }

    /// Drop the cached token for the given server.
    pub fn remove_auth_token(&self, server: &ServerDescriptor) -> ClientResult<()> {
        self.store
            .remove(&auth_token_store_key(&server.url))
            .whatever("unable to remove cached auth token")
    }

    /// Build the signed authentication request for the given server.
    pub fn make_auth_request(&self, server: &ServerDescriptor) -> ClientResult<AuthRequest> {
        let pubkey = self.keystore.public_pem()?;
        let tenant_token = server.tenant_token.trim().to_owned();
        debug!("authorization data: id_data: {}", self.identity.as_str());
        let body = serde_json::to_vec(&AuthRequestBody {
            id_data: self.identity.as_str(),
            pubkey: &pubkey,
            tenant_token: &tenant_token,
        })
        .whatever("unable to serialize auth request body")?;
        let signature = self.keystore.sign(&body)?;
        Ok(AuthRequest {
            body,
            signature,
            tenant_token,
        })
    }

    /// Persist the bearer token returned by the given server.
    pub fn recv_auth_response(&self, server: &ServerDescriptor, data: &[u8]) -> ClientResult<()> {
        if data.is_empty() {
            bail!("empty auth response data");
        }
        self.store
            .write(&auth_token_store_key(&server.url), data)
            .whatever("unable to persist auth token")
    }

    /// Access to the keystore, e.g. for bootstrapping a missing key.
    pub fn keystore_mut(&mut self) -> &mut Keystore {
        &mut self.keystore
    }
}
