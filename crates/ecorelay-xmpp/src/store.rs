//! Consumed credentials-store interface.
//!
//! The broker does not own identity data; the surrounding product does. This
//! trait is the boundary: lookups, idempotent upserts, and the per-peer
//! "currently online over XMPP" flag. [`MemoryStore`] is an in-process
//! implementation for embedding and tests.

use std::future::Future;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::XmppError;

/// A registered appliance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotRecord {
    /// Serial number (routing identity)
    pub uid: String,
    /// Device id
    pub did: String,
    /// Device class token
    pub devclass: String,
    /// XMPP resource
    pub resource: String,
    /// Vendor/company tag
    pub company: String,
    /// Currently connected over XMPP
    pub xmpp_online: bool,
}

/// A registered controller client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Controller username
    pub userid: String,
    /// Authentication realm
    pub realm: String,
    /// XMPP resource (lookup key)
    pub resource: String,
    /// Currently connected over XMPP
    pub xmpp_online: bool,
}

/// Identity and credential storage consumed by the broker.
pub trait CredStore: Send + Sync + 'static {
    /// Idempotent upsert of an appliance record.
    fn bot_add(
        &self,
        uid: &str,
        did: &str,
        devclass: &str,
        resource: &str,
        company: &str,
    ) -> impl Future<Output = Result<(), XmppError>> + Send;

    /// Look up an appliance by serial number.
    fn bot_get(&self, uid: &str)
        -> impl Future<Output = Result<Option<BotRecord>, XmppError>> + Send;

    /// Set the appliance's XMPP-online flag, keyed by device id.
    fn bot_set_xmpp(
        &self,
        did: &str,
        online: bool,
    ) -> impl Future<Output = Result<(), XmppError>> + Send;

    /// Idempotent upsert of a controller record.
    fn client_add(
        &self,
        userid: &str,
        realm: &str,
        resource: &str,
    ) -> impl Future<Output = Result<(), XmppError>> + Send;

    /// Look up a controller by resource.
    fn client_get(
        &self,
        resource: &str,
    ) -> impl Future<Output = Result<Option<ClientRecord>, XmppError>> + Send;

    /// Set the controller's XMPP-online flag, keyed by resource.
    fn client_set_xmpp(
        &self,
        resource: &str,
        online: bool,
    ) -> impl Future<Output = Result<(), XmppError>> + Send;

    /// Check a controller's authentication code.
    fn check_authcode(
        &self,
        uid: &str,
        code: &str,
    ) -> impl Future<Output = Result<bool, XmppError>> + Send;
}

/// In-memory credentials store.
pub struct MemoryStore {
    bots: DashMap<String, BotRecord>,
    clients: DashMap<String, ClientRecord>,
    authcodes: DashMap<String, String>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            bots: DashMap::new(),
            clients: DashMap::new(),
            authcodes: DashMap::new(),
        }
    }

    /// Register an authcode for a uid (test / provisioning hook).
    pub fn add_authcode(&self, uid: &str, code: &str) {
        self.authcodes.insert(uid.to_string(), code.to_string());
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredStore for MemoryStore {
    fn bot_add(
        &self,
        uid: &str,
        did: &str,
        devclass: &str,
        resource: &str,
        company: &str,
    ) -> impl Future<Output = Result<(), XmppError>> + Send {
        let record = BotRecord {
            uid: uid.to_string(),
            did: did.to_string(),
            devclass: devclass.to_string(),
            resource: resource.to_string(),
            company: company.to_string(),
            xmpp_online: self
                .bots
                .get(uid)
                .map(|r| r.xmpp_online)
                .unwrap_or(false),
        };
        self.bots.insert(uid.to_string(), record);
        async { Ok(()) }
    }

    fn bot_get(
        &self,
        uid: &str,
    ) -> impl Future<Output = Result<Option<BotRecord>, XmppError>> + Send {
        let record = self.bots.get(uid).map(|r| r.clone());
        async move { Ok(record) }
    }

    fn bot_set_xmpp(
        &self,
        did: &str,
        online: bool,
    ) -> impl Future<Output = Result<(), XmppError>> + Send {
        for mut entry in self.bots.iter_mut() {
            if entry.did == did {
                entry.xmpp_online = online;
            }
        }
        async { Ok(()) }
    }

    fn client_add(
        &self,
        userid: &str,
        realm: &str,
        resource: &str,
    ) -> impl Future<Output = Result<(), XmppError>> + Send {
        let record = ClientRecord {
            userid: userid.to_string(),
            realm: realm.to_string(),
            resource: resource.to_string(),
            xmpp_online: self
                .clients
                .get(resource)
                .map(|r| r.xmpp_online)
                .unwrap_or(false),
        };
        self.clients.insert(resource.to_string(), record);
        async { Ok(()) }
    }

    fn client_get(
        &self,
        resource: &str,
    ) -> impl Future<Output = Result<Option<ClientRecord>, XmppError>> + Send {
        let record = self.clients.get(resource).map(|r| r.clone());
        async move { Ok(record) }
    }

    fn client_set_xmpp(
        &self,
        resource: &str,
        online: bool,
    ) -> impl Future<Output = Result<(), XmppError>> + Send {
        if let Some(mut entry) = self.clients.get_mut(resource) {
            entry.xmpp_online = online;
        }
        async { Ok(()) }
    }

    fn check_authcode(
        &self,
        uid: &str,
        code: &str,
    ) -> impl Future<Output = Result<bool, XmppError>> + Send {
        let ok = self
            .authcodes
            .get(uid)
            .map(|stored| stored.value() == code)
            .unwrap_or(false);
        async move { Ok(ok) }
    }
}
