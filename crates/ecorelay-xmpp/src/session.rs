//! Per-connection session actor.
//!
//! One actor per accepted TCP connection. It owns the transport, the
//! tokenizer, and the state machine, drives the STARTTLS and SASL PLAIN
//! handshakes, and dispatches Ready-state stanzas to the router. Stanzas
//! routed *to* this peer arrive over the outbound channel registered with
//! the router and are written by this task only, so writes never interleave.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use minidom::Element;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::parser::{ns, StreamEvent, StreamHeader, XmlParser};
use crate::router::{Router, SessionHandle};
use crate::sasl;
use crate::stanza;
use crate::store::CredStore;
use crate::stream::XmppStream;
use crate::types::{PeerKind, SessionState};
use crate::{
    XmppError, BOT_ADMIN_DOMAIN, BOT_DOMAIN_SUFFIX, BROADCAST_DOMAIN, CLIENT_REALM, SERVER_ID,
};

/// Keepalive probe period while a session is Ready.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Actor managing a single peer connection.
pub struct SessionActor<S: CredStore> {
    _peer_addr: SocketAddr,
    stream: XmppStream,
    parser: XmlParser,
    state: SessionState,
    kind: PeerKind,
    uid: String,
    devclass: String,
    resource: String,
    jid: String,
    tls_upgraded: bool,
    use_auth: bool,
    store: Arc<S>,
    router: Arc<Router>,
    tls_acceptor: TlsAcceptor,
    handle: SessionHandle,
    outbound_rx: Option<mpsc::Receiver<String>>,
}

impl<S: CredStore> SessionActor<S> {
    /// Handle a new incoming connection until it disconnects.
    #[instrument(
        name = "xmpp.session",
        skip(tcp_stream, tls_acceptor, store, router, shutdown),
        fields(peer = %peer_addr)
    )]
    pub async fn handle_connection(
        tcp_stream: TcpStream,
        peer_addr: SocketAddr,
        tls_acceptor: TlsAcceptor,
        store: Arc<S>,
        router: Arc<Router>,
        use_auth: bool,
        shutdown: CancellationToken,
    ) -> Result<(), XmppError> {
        let (handle, outbound_rx) = router.register();
        let session_id = handle.id();

        let mut actor = Self {
            _peer_addr: peer_addr,
            stream: XmppStream::new(tcp_stream),
            parser: XmlParser::new(),
            state: SessionState::Idle,
            kind: PeerKind::Unknown,
            uid: String::new(),
            devclass: String::new(),
            resource: String::new(),
            jid: String::new(),
            tls_upgraded: false,
            use_auth,
            store,
            router: Arc::clone(&router),
            tls_acceptor,
            handle,
            outbound_rx: Some(outbound_rx),
        };

        debug!("New connection");
        actor.set_state(SessionState::Connect)?;

        let result = actor.run(shutdown).await;

        actor.teardown().await;
        router.unregister(session_id);
        debug!(jid = %actor.jid, "Connection ended");

        result
    }

    /// Main connection loop: inbound bytes, routed outbound stanzas, the
    /// keepalive interval, and shutdown.
    async fn run(&mut self, shutdown: CancellationToken) -> Result<(), XmppError> {
        let mut outbound_rx = self.outbound_rx.take();
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = [0u8; 8192];

        'conn: loop {
            tokio::select! {
                read_result = self.stream.read(&mut buf) => {
                    match read_result {
                        Ok(0) => {
                            debug!("Peer closed connection");
                            break 'conn;
                        }
                        Ok(n) => {
                            self.parser.feed(&buf[..n]);
                            while let Some(event) = self.parser.next_event() {
                                if let Err(e) = self.handle_event(event).await {
                                    warn!(error = %e, "Fatal session error");
                                    break 'conn;
                                }
                                if self.state == SessionState::Disconnect {
                                    break 'conn;
                                }
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "Transport error");
                            break 'conn;
                        }
                    }
                }

                outbound = async {
                    match outbound_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match outbound {
                        Some(xml) => {
                            // The peer may still be readable even when a
                            // write fails, so the loop keeps going.
                            if let Err(e) = self.send(&xml).await {
                                warn!(error = %e, "Error writing routed stanza");
                            }
                        }
                        None => break 'conn,
                    }
                }

                _ = ping.tick(), if self.state == SessionState::Ready => {
                    if let Err(e) = self.send(&stanza::ping_probe(&self.jid)).await {
                        debug!(error = %e, "Keepalive probe failed");
                    }
                }

                _ = shutdown.cancelled() => {
                    debug!("Shutdown requested");
                    break 'conn;
                }
            }
        }

        Ok(())
    }

    /// Advance the state machine. The index never decreases; a backwards
    /// transition is a fault that tears the session down.
    fn set_state(&mut self, new: SessionState) -> Result<(), XmppError> {
        if new < self.state {
            return Err(XmppError::state_violation(format!(
                "{} -> {}",
                self.state, new
            )));
        }
        debug!(jid = %self.jid, state = %new, "Session state");
        self.state = new;
        self.handle.meta().set_state(new);
        Ok(())
    }

    /// Write raw XML to this peer.
    async fn send(&mut self, xml: &str) -> Result<(), XmppError> {
        debug!(jid = %self.jid, stanza = %xml, "send");
        self.stream.write_raw(xml).await
    }

    async fn handle_event(&mut self, event: StreamEvent) -> Result<(), XmppError> {
        match event {
            StreamEvent::StreamOpen(header) => self.handle_stream_open(header).await,
            StreamEvent::StartTls => self.handle_starttls().await,
            StreamEvent::SaslAuth { mechanism, data } => {
                self.handle_sasl_auth(&mechanism, &data).await
            }
            StreamEvent::Iq { element, raw } => self.handle_iq(&element, &raw).await,
            StreamEvent::Presence(element) => self.handle_presence(&element).await,
            StreamEvent::StreamClose => {
                let _ = self.send(stanza::stream_close()).await;
                self.set_state(SessionState::Disconnect)
            }
            StreamEvent::Invalid { raw } => {
                warn!(data = %raw, "Unparseable data dropped");
                Ok(())
            }
        }
    }

    /// A `<stream:stream>` opener. In Connect this starts feature
    /// negotiation; in Init it is the post-auth stream restart.
    async fn handle_stream_open(&mut self, header: StreamHeader) -> Result<(), XmppError> {
        match self.state {
            SessionState::Connect => {
                if !header.raw.contains(ns::JABBER_CLIENT) {
                    return self.send(stanza::stream_reject()).await;
                }
                if let Some(devclass) = header.devclass() {
                    debug!(devclass = %devclass, "Appliance stream opener");
                    self.devclass = devclass;
                }
                self.send(&stanza::stream_header()).await?;
                if self.tls_upgraded {
                    self.send(&stanza::features_sasl()).await
                } else {
                    self.send(&stanza::features_starttls()).await
                }
            }
            SessionState::Init => {
                self.send(&stanza::stream_header()).await?;
                self.send(&stanza::features_bind()).await
            }
            _ => {
                warn!(state = %self.state, "Unexpected stream opener ignored");
                Ok(())
            }
        }
    }

    /// STARTTLS: proceed, then upgrade the transport in place. Only once;
    /// a repeat request is a no-op.
    async fn handle_starttls(&mut self) -> Result<(), XmppError> {
        if self.tls_upgraded {
            debug!("Duplicate STARTTLS ignored");
            return Ok(());
        }
        self.tls_upgraded = true;
        self.send(&stanza::tls_proceed()).await?;
        self.stream.upgrade(self.tls_acceptor.clone()).await?;
        self.parser.reset();
        info!("Transport upgraded with STARTTLS");
        Ok(())
    }

    /// SASL PLAIN. A peer that announced a devclass is an appliance and is
    /// accepted unconditionally; controllers are checked against the
    /// credentials store unless authentication is disabled.
    async fn handle_sasl_auth(&mut self, mechanism: &str, data: &str) -> Result<(), XmppError> {
        if self.state != SessionState::Connect {
            warn!(state = %self.state, "SASL auth outside CONNECT ignored");
            return Ok(());
        }
        if !mechanism.eq_ignore_ascii_case("PLAIN") {
            warn!(mechanism = %mechanism, "Unsupported SASL mechanism");
            return self.send(&stanza::sasl_reject()).await;
        }

        let creds = match sasl::parse_plain(data) {
            Ok(creds) => creds,
            Err(e) => {
                warn!(error = %e, "SASL payload rejected");
                return self.send(&stanza::sasl_reject()).await;
            }
        };

        self.uid = creds.uid;
        if !creds.resource.is_empty() {
            self.resource = creds.resource;
        }
        self.handle.meta().set_uid(&self.uid);

        if !self.devclass.is_empty() {
            if let Err(e) = self
                .store
                .bot_add(&self.uid, &self.uid, &self.devclass, "atom", "eco-legacy")
                .await
            {
                warn!(error = %e, "Failed to upsert appliance record");
            }
            self.kind = PeerKind::Bot;
            self.handle.meta().set_kind(PeerKind::Bot);
            info!(uid = %self.uid, "Appliance authenticated");
            self.send(&stanza::sasl_success()).await?;
            return self.set_state(SessionState::Init);
        }

        let code_ok = match self.store.check_authcode(&self.uid, &creds.authcode).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(error = %e, "Authcode lookup failed");
                false
            }
        };
        let authorized = code_ok || !self.use_auth;

        if authorized {
            self.kind = PeerKind::Controller;
            self.handle.meta().set_kind(PeerKind::Controller);
            if let Err(e) = self
                .store
                .client_add(&self.uid, CLIENT_REALM, &self.resource)
                .await
            {
                warn!(error = %e, "Failed to upsert controller record");
            }
            info!(uid = %self.uid, "Controller authenticated");
            self.send(&stanza::sasl_success()).await?;
            self.set_state(SessionState::Init)
        } else {
            info!(uid = %self.uid, "Authentication rejected");
            self.send(&stanza::sasl_reject()).await
        }
    }

    async fn handle_iq(&mut self, element: &Element, raw: &str) -> Result<(), XmppError> {
        debug!(jid = %self.jid, stanza = %raw, "recv iq");
        if raw.contains("td=\"error\"") || raw.contains("errs=") || raw.contains("k=\"DeviceAlert") {
            tracing::error!(target: "bot_error", jid = %self.jid, stanza = %raw, "Appliance reported an error");
        }

        let child = element.children().next().map(|c| c.name().to_string());
        match self.state {
            SessionState::Init if child.as_deref() == Some("bind") => {
                self.handle_bind(element).await
            }
            SessionState::Bind if child.as_deref() == Some("session") => {
                self.handle_session(element).await
            }
            SessionState::Ready => self.dispatch_ready_iq(element, raw, child.as_deref()).await,
            _ => {
                debug!(state = %self.state, "iq ignored in this state");
                Ok(())
            }
        }
    }

    async fn dispatch_ready_iq(
        &mut self,
        element: &Element,
        raw: &str,
        child: Option<&str>,
    ) -> Result<(), XmppError> {
        match child {
            Some("ping") => self.handle_ping(element).await,
            Some("query") => {
                if self.kind == PeerKind::Bot {
                    self.handle_result(element, raw).await
                } else {
                    self.handle_ctl(element, raw).await
                }
            }
            Some(_) => match element.attr("type") {
                Some("result") | Some("set") => self.handle_result(element, raw).await,
                _ => {
                    debug!("Unhandled iq dropped");
                    Ok(())
                }
            },
            None => {
                debug!("iq without child dropped");
                Ok(())
            }
        }
    }

    /// XMPP ping: a `to` without an `@` addresses the server itself;
    /// anything else is forwarded to the matching peers.
    async fn handle_ping(&mut self, element: &Element) -> Result<(), XmppError> {
        let id = element.attr("id").unwrap_or_default().to_string();
        match element.attr("to") {
            Some(to) if !to.contains('@') => {
                let to = to.to_string();
                self.send(&stanza::server_ping_result(&id, &to)).await
            }
            Some(to) => {
                let xml = stanza::prepare_forward(element, &self.jid);
                self.router.forward(&self.handle, to, &xml, false);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Control command from a controller: answer the XMPP features this
    /// broker does not implement, acknowledge the Android `com:sf` bind,
    /// and forward everything else to the matching appliances.
    async fn handle_ctl(&mut self, element: &Element, raw: &str) -> Result<(), XmppError> {
        let id = element.attr("id").unwrap_or_default().to_string();

        if raw.contains("roster") || raw.contains("disco#items") || raw.contains("disco#info") {
            return self.send(&stanza::feature_not_implemented(&id)).await;
        }

        if element.attr("type") == Some("set")
            && raw.contains("com:sf")
            && element.attr("to") == Some(BOT_ADMIN_DOMAIN)
        {
            let (uid, resource) = (self.uid.clone(), self.resource.clone());
            return self.send(&stanza::sf_ack(&id, &uid, &resource)).await;
        }

        if let Some(to) = element.attr("to") {
            let xml = stanza::prepare_forward(element, &self.jid);
            self.router.forward(&self.handle, to, &xml, true);
        }
        Ok(())
    }

    /// Result/event stanza. Bot permission errors trigger enrollment; the
    /// broadcast domain fans out to every live session; everything else is
    /// forwarded by uid match.
    async fn handle_result(&mut self, element: &Element, raw: &str) -> Result<(), XmppError> {
        if raw.contains("errno") {
            tracing::error!(target: "bot_error", jid = %self.jid, stanza = %raw, "Error response from appliance");
        }
        if raw.contains("errno='103'") || raw.contains("errno=\"103\"") {
            if self.kind == PeerKind::Bot {
                self.enroll_owner(element).await?;
            }
            return Ok(());
        }

        let xml = stanza::prepare_forward(element, &self.jid);

        if self.kind == PeerKind::Bot && element.attr("to") == Some(BROADCAST_DOMAIN) {
            let count = self.router.broadcast(&xml);
            debug!(count = count, "Broadcast appliance result");
            return Ok(());
        }

        self.router.forward_result(&self.handle, element.attr("to"), &xml);
        Ok(())
    }

    /// An appliance answered `errno='103'` (permission denied): register
    /// the requesting user on the appliance on its owner's behalf.
    async fn enroll_owner(&mut self, element: &Element) -> Result<(), XmppError> {
        let ctl = element
            .children()
            .find(|c| c.name() == "query")
            .and_then(|q| q.children().next());
        let ctl = match ctl {
            Some(ctl) => ctl,
            None => return Ok(()),
        };

        let admin = if let Some(err) = ctl.attr("error") {
            err.replace("permission denied, please contact ", "")
                .replace(' ', "")
        } else if let Some(admin) = ctl.attr("admin") {
            admin.to_string()
        } else {
            return Ok(());
        };

        let to = match element.attr("to") {
            Some(to) => to.to_string(),
            None => return Ok(()),
        };

        if admin.starts_with("fuid_") || admin.starts_with("fusername_") || self.use_auth {
            debug!(admin = %admin, "Skipping appliance user enrollment");
            return Ok(());
        }

        info!(admin = %admin, jid = %self.jid, "Appliance denied access; enrolling requesting user");

        let newuser = to.split('/').next().unwrap_or(&to).to_string();
        let jid = self.jid.clone();
        self.send(&stanza::enroll_add_user(&admin, &jid, &newuser)).await?;
        self.send(&stanza::enroll_set_acs(&admin, &jid, &newuser)).await?;
        self.send(&stanza::enroll_get_user_info(&admin, &jid)).await
    }

    /// Resource binding: assign the JID and flip the online flag.
    async fn handle_bind(&mut self, element: &Element) -> Result<(), XmppError> {
        if let Ok(Some(bot)) = self.store.bot_get(&self.uid).await {
            let _ = self.store.bot_set_xmpp(&bot.did, true).await;
        }
        if let Ok(Some(client)) = self.store.client_get(&self.resource).await {
            let _ = self.store.client_set_xmpp(&client.resource, true).await;
        }

        let id = element.attr("id").unwrap_or_default().to_string();

        if !self.devclass.is_empty() {
            self.jid = format!("{}@{}{}/atom", self.uid, self.devclass, BOT_DOMAIN_SUFFIX);
        } else {
            // Legacy clients do not always declare the bind namespace, so
            // the child lookup goes by name.
            let bound_resource = element
                .children()
                .find(|c| c.name() == "bind")
                .and_then(|bind| bind.children().find(|c| c.name() == "resource"))
                .map(|r| r.text());
            if let Some(resource) = bound_resource {
                self.resource = resource;
            }
            self.jid = if self.resource.is_empty() {
                format!("{}@{}", self.uid, SERVER_ID)
            } else {
                format!("{}@{}/{}", self.uid, SERVER_ID, self.resource)
            };
        }

        self.jid
            .parse::<jid::Jid>()
            .map_err(|e| XmppError::stream(format!("Invalid JID {}: {}", self.jid, e)))?;
        self.handle.meta().set_jid(&self.jid);
        info!(jid = %self.jid, kind = %self.kind, "Resource bound");

        self.set_state(SessionState::Bind)?;
        let jid = self.jid.clone();
        self.send(&stanza::bind_result(&id, &jid)).await
    }

    /// Session establishment: the session becomes routable and the
    /// keepalive interval starts.
    async fn handle_session(&mut self, element: &Element) -> Result<(), XmppError> {
        let id = element.attr("id").unwrap_or_default().to_string();
        self.set_state(SessionState::Ready)?;
        self.send(&stanza::session_result(&id)).await
    }

    /// Stateless presence handling.
    async fn handle_presence(&mut self, element: &Element) -> Result<(), XmppError> {
        let first_is_status = element
            .children()
            .next()
            .map(|c| c.name() == "status")
            .unwrap_or(false);

        if first_is_status {
            debug!(jid = %self.jid, "Appliance presence");
            let jid = self.jid.clone();
            self.send(&stanza::dummy_presence(&jid)).await?;
            if self.kind == PeerKind::Bot {
                self.send(&stanza::get_device_info(&jid)).await?;
            }
            return Ok(());
        }

        match element.attr("type") {
            Some("unavailable") => {
                debug!(jid = %self.jid, "Peer went unavailable");
                self.set_state(SessionState::Disconnect)
            }
            _ => {
                let jid = self.jid.clone();
                self.send(&stanza::dummy_presence(&jid)).await
            }
        }
    }

    /// Tear the session down: clear the online flags and close the socket.
    async fn teardown(&mut self) {
        self.state = SessionState::Disconnect;
        self.handle.meta().set_state(SessionState::Disconnect);

        if !self.uid.is_empty() {
            match self.store.bot_get(&self.uid).await {
                Ok(Some(bot)) => {
                    let _ = self.store.bot_set_xmpp(&bot.did, false).await;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to clear appliance online flag"),
            }
        }
        if !self.resource.is_empty() {
            match self.store.client_get(&self.resource).await {
                Ok(Some(client)) => {
                    let _ = self.store.client_set_xmpp(&client.resource, false).await;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to clear controller online flag"),
            }
        }

        self.stream.close().await;
    }
}
