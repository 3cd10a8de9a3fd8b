//! # ecorelay-xmpp
//!
//! Purpose-built XMPP 1.0 broker for appliance control traffic, designed to
//! be embedded in the surrounding Ecorelay server for unified deployment.
//!
//! Two peer populations authenticate against a single TCP endpoint:
//! *appliances* ("bots", identified by a device-class stream opener and a
//! serial number) and *controllers* (mobile/desktop clients). The broker
//! terminates the XML stream, performs an opportunistic STARTTLS upgrade,
//! authenticates via SASL PLAIN, binds a JID per peer, and fans `iq` /
//! `presence` stanzas out across live peers keyed on user identity.
//!
//! ## Architecture
//!
//! - **Server**: TCP listener, one session task per connection
//! - **Session**: per-connection state machine (CONNECT → INIT → BIND →
//!   READY → DISCONNECT) plus a keepalive ping loop
//! - **Router**: process-wide registry; delivery via per-session outbound
//!   channels drained by the owning task
//! - **Tokenizer**: incremental scanner over the not-well-formed XMPP
//!   stream, producing `minidom` elements
//!
//! Deliberately *not* implemented: roster, presence subscriptions, MUC, and
//! service discovery all answer `feature-not-implemented`; there is no
//! offline queueing and no federation.

pub mod parser;
pub mod router;
pub mod sasl;
pub mod server;
pub mod session;
pub mod stanza;
pub mod store;
pub mod stream;

mod error;
mod types;

pub use error::XmppError;
pub use parser::{ns, StreamEvent, StreamHeader, XmlParser};
pub use router::{Router, RouterConfig, SessionHandle, SessionId};
pub use server::{XmppServer, XmppServerConfig};
pub use store::{BotRecord, ClientRecord, CredStore, MemoryStore};
pub use types::{PeerKind, SessionState};

/// Identity the broker speaks as, and the controller JID domain.
pub const SERVER_ID: &str = "ecouser.net";

/// Domain suffix appliances address in their stream opener; the prefix is
/// the device class.
pub const BOT_DOMAIN_SUFFIX: &str = ".ecorobot.net";

/// Destination domain that fans an appliance result out to every live session.
pub const BROADCAST_DOMAIN: &str = "de.ecorobot.net";

/// Admin endpoint the Android client binds against with `com:sf` sets.
pub const BOT_ADMIN_DOMAIN: &str = "rl.ecorobot.net";

/// Realm recorded for controller upserts in the credentials store.
pub const CLIENT_REALM: &str = "ecorelay";
