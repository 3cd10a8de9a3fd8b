//! Process-wide session registry and stanza routing.
//!
//! Every accepted connection registers here for its whole lifetime; routing
//! only ever considers sessions that have reached `Ready`. Delivery is by
//! enqueueing serialized XML onto the destination's outbound channel, which
//! the owning session task drains, so concurrent senders never interleave
//! bytes on one socket.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{PeerKind, SessionState};

/// Size of each session's outbound channel buffer.
const OUTBOUND_CHANNEL_SIZE: usize = 64;

/// Registry key for one session.
pub type SessionId = u64;

/// Routing configuration.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// Match a destination by localpart equality instead of the legacy
    /// case-insensitive substring rule. Off by default; the wire protocol
    /// depends on the loose rule.
    pub strict_match: bool,
}

/// Shared per-session metadata the router reads when matching destinations.
///
/// Written only by the owning session task; read by any task that routes.
pub struct SessionMeta {
    state: AtomicU8,
    kind: AtomicU8,
    uid: RwLock<String>,
    jid: RwLock<String>,
}

impl SessionMeta {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Idle as u8),
            kind: AtomicU8::new(PeerKind::Unknown as u8),
            uid: RwLock::new(String::new()),
            jid: RwLock::new(String::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn kind(&self) -> PeerKind {
        PeerKind::from_u8(self.kind.load(Ordering::Acquire))
    }

    pub fn set_kind(&self, kind: PeerKind) {
        self.kind.store(kind as u8, Ordering::Release);
    }

    pub fn uid(&self) -> String {
        self.uid.read().expect("uid lock poisoned").clone()
    }

    pub fn set_uid(&self, uid: &str) {
        *self.uid.write().expect("uid lock poisoned") = uid.to_string();
    }

    pub fn jid(&self) -> String {
        self.jid.read().expect("jid lock poisoned").clone()
    }

    pub fn set_jid(&self, jid: &str) {
        *self.jid.write().expect("jid lock poisoned") = jid.to_string();
    }
}

/// Result of attempting to enqueue a stanza for a session.
#[derive(Debug)]
pub enum SendResult {
    /// Queued for delivery
    Sent,
    /// The session's channel is full (slow consumer); stanza dropped
    ChannelFull,
    /// The session is going away; stanza dropped
    ChannelClosed,
}

/// Handle to a registered session.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    meta: Arc<SessionMeta>,
    outbound: mpsc::Sender<String>,
}

impl SessionHandle {
    /// Registry key of this session.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Shared metadata.
    pub fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    /// Enqueue serialized XML for this session's writer task.
    pub fn send(&self, xml: String) -> SendResult {
        match self.outbound.try_send(xml) {
            Ok(()) => SendResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session = self.id, "Outbound channel full, stanza dropped");
                SendResult::ChannelFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendResult::ChannelClosed,
        }
    }
}

/// Process-wide registry of live sessions plus the destination-matching rule.
pub struct Router {
    config: RouterConfig,
    sessions: DashMap<SessionId, SessionHandle>,
    next_id: AtomicU64,
}

impl Router {
    /// Create an empty router.
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new session and hand back its handle plus the receiving
    /// end of its outbound channel.
    pub fn register(&self) -> (SessionHandle, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_SIZE);
        let handle = SessionHandle {
            id,
            meta: Arc::new(SessionMeta::new()),
            outbound: tx,
        };
        self.sessions.insert(id, handle.clone());
        debug!(session = id, "Session registered");
        (handle, rx)
    }

    /// Remove a session from the registry.
    pub fn unregister(&self, id: SessionId) {
        if self.sessions.remove(&id).is_some() {
            debug!(session = id, "Session unregistered");
        }
    }

    /// Number of registered sessions (any state).
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether a destination string addresses the given uid.
    pub fn matches(&self, uid: &str, to: &str) -> bool {
        if uid.is_empty() {
            return false;
        }
        let uid = uid.to_lowercase();
        let to = to.to_lowercase();
        if self.config.strict_match {
            let localpart = to.split('@').next().unwrap_or(&to);
            localpart == uid
        } else {
            to.contains(&uid)
        }
    }

    /// Forward serialized XML to every `Ready` peer addressed by `to`.
    ///
    /// `bots_only` restricts delivery to appliance sessions (used for
    /// control commands). Returns the number of sessions reached; zero
    /// matches is a silent drop.
    pub fn forward(
        &self,
        origin: &SessionHandle,
        to: &str,
        xml: &str,
        bots_only: bool,
    ) -> usize {
        let origin_jid = origin.meta().jid();
        let mut delivered = 0;

        for entry in self.sessions.iter() {
            let peer = entry.value();
            if peer.id == origin.id || peer.meta().state() != SessionState::Ready {
                continue;
            }
            if peer.meta().jid() == origin_jid {
                continue;
            }
            if bots_only && peer.meta().kind() != PeerKind::Bot {
                continue;
            }
            if !self.matches(&peer.meta().uid(), to) {
                continue;
            }
            debug!(from = %origin_jid, to = %peer.meta().jid(), "Forwarding stanza");
            if matches!(peer.send(xml.to_string()), SendResult::Sent) {
                delivered += 1;
            }
        }

        if delivered == 0 {
            debug!(to = %to, "No routing match, stanza dropped");
        }
        delivered
    }

    /// Forward a result/event stanza, normalizing the destination first:
    /// whatever precedes any `@` becomes `{localpart}@ecouser.net`, so bare
    /// identities and foreign domains both route by uid.
    pub fn forward_result(
        &self,
        origin: &SessionHandle,
        to: Option<&str>,
        xml: &str,
    ) -> usize {
        let to = match to {
            Some(t) => t,
            None => return 0,
        };
        let localpart = to.split('@').next().unwrap_or(to);
        let normalized = format!("{}@{}", localpart, crate::SERVER_ID);
        self.forward(origin, &normalized, xml, false)
    }

    /// Deliver serialized XML to every registered session, whatever its
    /// state, the originator included. Used for the appliance broadcast
    /// domain only.
    pub fn broadcast(&self, xml: &str) -> usize {
        let mut delivered = 0;
        for entry in self.sessions.iter() {
            if matches!(entry.value().send(xml.to_string()), SendResult::Sent) {
                delivered += 1;
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_session(
        router: &Router,
        uid: &str,
        jid: &str,
        kind: PeerKind,
    ) -> (SessionHandle, mpsc::Receiver<String>) {
        let (handle, rx) = router.register();
        handle.meta().set_uid(uid);
        handle.meta().set_jid(jid);
        handle.meta().set_kind(kind);
        handle.meta().set_state(SessionState::Ready);
        (handle, rx)
    }

    #[test]
    fn substring_match_is_case_insensitive() {
        let router = Router::new(RouterConfig::default());
        assert!(router.matches("sn123", "SN123@xyz.ecorobot.net"));
        assert!(router.matches("SN123", "sn123@xyz.ecorobot.net/atom"));
        assert!(!router.matches("SN999", "SN123@xyz.ecorobot.net"));
        assert!(!router.matches("", "SN123@xyz.ecorobot.net"));
    }

    #[test]
    fn strict_match_requires_localpart_equality() {
        let router = Router::new(RouterConfig { strict_match: true });
        assert!(router.matches("SN123", "sn123@xyz.ecorobot.net"));
        // The loose rule would accept this prefix; strict must not.
        assert!(!router.matches("SN12", "SN123@xyz.ecorobot.net"));
    }

    #[tokio::test]
    async fn forward_reaches_matching_ready_peer() {
        let router = Router::new(RouterConfig::default());
        let (origin, _origin_rx) =
            ready_session(&router, "user42", "user42@ecouser.net/mobile", PeerKind::Controller);
        let (_bot, mut bot_rx) =
            ready_session(&router, "SN123", "SN123@xyz.ecorobot.net/atom", PeerKind::Bot);

        let n = router.forward(&origin, "SN123@xyz.ecorobot.net", "<iq/>", true);
        assert_eq!(n, 1);
        assert_eq!(bot_rx.recv().await.as_deref(), Some("<iq/>"));
    }

    #[tokio::test]
    async fn forward_skips_non_ready_and_originator() {
        let router = Router::new(RouterConfig::default());
        let (origin, mut origin_rx) =
            ready_session(&router, "SN123", "SN123@xyz.ecorobot.net/atom", PeerKind::Bot);

        // A matching peer that never reached Ready.
        let (pending, _pending_rx) = router.register();
        pending.meta().set_uid("SN123");
        pending.meta().set_state(SessionState::Connect);

        let n = router.forward(&origin, "SN123@xyz.ecorobot.net", "<iq/>", false);
        assert_eq!(n, 0);
        assert!(origin_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forward_to_unmatched_destination_drops() {
        let router = Router::new(RouterConfig::default());
        let (origin, _rx1) =
            ready_session(&router, "user42", "user42@ecouser.net", PeerKind::Controller);
        let (_peer, mut rx2) =
            ready_session(&router, "SN123", "SN123@xyz.ecorobot.net/atom", PeerKind::Bot);

        let n = router.forward(&origin, "nobody@ecouser.net", "<iq/>", false);
        assert_eq!(n, 0);
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn bots_only_filter_excludes_controllers() {
        let router = Router::new(RouterConfig::default());
        let (origin, _rx1) =
            ready_session(&router, "user42", "user42@ecouser.net", PeerKind::Controller);
        let (_other, mut other_rx) =
            ready_session(&router, "user4", "user4@ecouser.net", PeerKind::Controller);

        // "user4" is a substring of the destination but it is not a bot.
        let n = router.forward(&origin, "user4@ecouser.net", "<iq/>", true);
        assert_eq!(n, 0);
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forward_result_normalizes_destination_domain() {
        let router = Router::new(RouterConfig::default());
        let (origin, _rx1) =
            ready_session(&router, "SN123", "SN123@xyz.ecorobot.net/atom", PeerKind::Bot);
        let (_ctl, mut ctl_rx) =
            ready_session(&router, "user42", "user42@ecouser.net/mobile", PeerKind::Controller);

        let n = router.forward_result(&origin, Some("user42@other.example"), "<iq/>");
        assert_eq!(n, 1);
        assert_eq!(ctl_rx.recv().await.as_deref(), Some("<iq/>"));
    }

    #[tokio::test]
    async fn forward_result_normalizes_bare_destination() {
        let router = Router::new(RouterConfig::default());
        let (origin, _rx1) =
            ready_session(&router, "SN123", "SN123@xyz.ecorobot.net/atom", PeerKind::Bot);
        let (_ctl, mut ctl_rx) =
            ready_session(&router, "user42", "user42@ecouser.net/mobile", PeerKind::Controller);
        let (_other, mut other_rx) =
            ready_session(&router, "alice", "alice@ecouser.net", PeerKind::Controller);

        let n = router.forward_result(&origin, Some("user42"), "<iq/>");
        assert_eq!(n, 1);
        assert_eq!(ctl_rx.recv().await.as_deref(), Some("<iq/>"));
        assert!(other_rx.try_recv().is_err());

        // A bare destination matching nobody is delivered to zero peers.
        assert_eq!(router.forward_result(&origin, Some("nobody"), "<iq/>"), 0);
    }

    #[tokio::test]
    async fn forward_result_without_destination_drops() {
        let router = Router::new(RouterConfig::default());
        let (origin, _rx1) =
            ready_session(&router, "SN123", "SN123@xyz.ecorobot.net/atom", PeerKind::Bot);
        let (_ctl, mut ctl_rx) =
            ready_session(&router, "user42", "user42@ecouser.net", PeerKind::Controller);

        assert_eq!(router.forward_result(&origin, None, "<iq/>"), 0);
        assert!(ctl_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_session_including_origin() {
        let router = Router::new(RouterConfig::default());
        let (_bot, mut bot_rx) =
            ready_session(&router, "SN123", "SN123@xyz.ecorobot.net/atom", PeerKind::Bot);
        let (_ctl, mut ctl_rx) =
            ready_session(&router, "user42", "user42@ecouser.net", PeerKind::Controller);
        let (pending, mut pending_rx) = router.register();
        pending.meta().set_state(SessionState::Connect);

        let n = router.broadcast("<iq/>");
        assert_eq!(n, 3);
        assert!(bot_rx.try_recv().is_ok());
        assert!(ctl_rx.try_recv().is_ok());
        assert!(pending_rx.try_recv().is_ok());
    }

    #[test]
    fn registry_membership_tracks_lifecycle() {
        let router = Router::new(RouterConfig::default());
        let (handle, _rx) = router.register();
        assert_eq!(router.session_count(), 1);

        router.unregister(handle.id());
        assert_eq!(router.session_count(), 0);
    }
}
