//! XMPP broker server: TLS configuration and the TCP accept loop.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, info_span, warn, Instrument};

use crate::router::{Router, RouterConfig};
use crate::session::SessionActor;
use crate::store::CredStore;
use crate::XmppError;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct XmppServerConfig {
    /// Address to bind the XMPP listener (default: 0.0.0.0:5223)
    pub bind_addr: SocketAddr,
    /// TLS certificate path (PEM)
    pub server_cert: PathBuf,
    /// TLS private key path (PEM, PKCS#8)
    pub server_key: PathBuf,
    /// CA bundle appended to the presented chain (PEM), if any
    pub ca_cert: Option<PathBuf>,
    /// Verify controller authcodes against the credentials store.
    /// When off, any controller is accepted (appliances always are).
    pub use_auth: bool,
    /// Routing configuration
    pub router: RouterConfig,
}

impl Default for XmppServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5223".parse().expect("valid default addr"),
            server_cert: PathBuf::from("certs/server.crt"),
            server_key: PathBuf::from("certs/server.key"),
            ca_cert: None,
            use_auth: false,
            router: RouterConfig::default(),
        }
    }
}

/// XMPP broker instance.
pub struct XmppServer<S: CredStore> {
    config: XmppServerConfig,
    store: Arc<S>,
    tls_acceptor: TlsAcceptor,
    router: Arc<Router>,
    /// Listener — passed in by the caller (inherited or freshly bound).
    listener: TcpListener,
    /// Shutdown token — when cancelled, the accept loop and every session stop.
    shutdown_token: tokio_util::sync::CancellationToken,
}

impl<S: CredStore> XmppServer<S> {
    /// Create a new broker instance with a pre-bound listener.
    pub fn new(
        config: XmppServerConfig,
        store: Arc<S>,
        listener: TcpListener,
        shutdown_token: tokio_util::sync::CancellationToken,
    ) -> Result<Self, XmppError> {
        let tls_acceptor = load_tls_config(&config)?;
        let router = Arc::new(Router::new(config.router.clone()));

        Ok(Self {
            config,
            store,
            tls_acceptor,
            router,
            listener,
            shutdown_token,
        })
    }

    /// The shared router, for embedding callers that want visibility into
    /// live sessions.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// The broker configuration.
    pub fn config(&self) -> &XmppServerConfig {
        &self.config
    }

    /// Accept connections until the shutdown token is cancelled.
    pub async fn run(self) -> Result<(), XmppError> {
        let addr = self.listener.local_addr().ok();
        info!(addr = ?addr, use_auth = self.config.use_auth, "XMPP broker listening");

        loop {
            let (stream, peer_addr) = tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Accept loop stopped (shutdown token cancelled)");
                    break;
                }
            };

            let store = Arc::clone(&self.store);
            let router = Arc::clone(&self.router);
            let tls_acceptor = self.tls_acceptor.clone();
            let use_auth = self.config.use_auth;
            let shutdown = self.shutdown_token.clone();

            tokio::spawn(
                async move {
                    if let Err(e) = SessionActor::handle_connection(
                        stream,
                        peer_addr,
                        tls_acceptor,
                        store,
                        router,
                        use_auth,
                        shutdown,
                    )
                    .await
                    {
                        warn!(error = %e, "Session error");
                    }
                }
                .instrument(info_span!(
                    "xmpp.connection.lifecycle",
                    client_ip = %peer_addr,
                )),
            );
        }

        Ok(())
    }
}

/// Load the TLS acceptor from the configured certificate, key, and CA files.
fn load_tls_config(config: &XmppServerConfig) -> Result<TlsAcceptor, XmppError> {
    use rustls_pemfile::{certs, pkcs8_private_keys};
    use std::fs::File;
    use std::io::BufReader;
    use tokio_rustls::rustls::{pki_types::PrivateKeyDer, ServerConfig};

    let cert_file = File::open(&config.server_cert).map_err(|e| {
        XmppError::config(format!(
            "Failed to open cert file {}: {}",
            config.server_cert.display(),
            e
        ))
    })?;
    let key_file = File::open(&config.server_key).map_err(|e| {
        XmppError::config(format!(
            "Failed to open key file {}: {}",
            config.server_key.display(),
            e
        ))
    })?;

    let mut chain: Vec<_> = certs(&mut BufReader::new(cert_file))
        .filter_map(|r| r.ok())
        .collect();

    // Clients are not verified; the CA bundle only completes the chain we present.
    if let Some(ref ca_path) = config.ca_cert {
        let ca_file = File::open(ca_path).map_err(|e| {
            XmppError::config(format!(
                "Failed to open CA file {}: {}",
                ca_path.display(),
                e
            ))
        })?;
        chain.extend(certs(&mut BufReader::new(ca_file)).filter_map(|r| r.ok()));
    }

    let keys: Vec<_> = pkcs8_private_keys(&mut BufReader::new(key_file))
        .filter_map(|r| r.ok())
        .collect();

    let key = keys
        .into_iter()
        .next()
        .ok_or_else(|| XmppError::config("No private key found"))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, PrivateKeyDer::Pkcs8(key))
        .map_err(|e| XmppError::config(format!("TLS config error: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
