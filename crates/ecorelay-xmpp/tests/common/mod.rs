//! Test utilities for broker end-to-end testing.
//!
//! Provides a real broker instance on an ephemeral port, self-signed TLS
//! credentials, and a raw XMPP client that speaks the legacy wire dialect.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use ecorelay_xmpp::{MemoryStore, RouterConfig, XmppServer, XmppServerConfig};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Install the ring crypto provider for rustls.
/// Must be called once before any TLS operations.
pub fn install_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .expect("Failed to install crypto provider");
    });
}

/// Route broker logs through the test writer when RUST_LOG is set.
fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A broker instance running on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub store: Arc<MemoryStore>,
    cert_der: CertificateDer<'static>,
    shutdown: CancellationToken,
    _certs_dir: tempfile::TempDir,
}

impl TestServer {
    /// Start a broker with authentication disabled.
    pub async fn start() -> Self {
        Self::start_configured(false, false).await
    }

    /// Start a broker with explicit auth / strict-routing settings.
    pub async fn start_configured(use_auth: bool, strict_match: bool) -> Self {
        install_crypto_provider();
        init_tracing();

        let subject_alt_names = vec!["ecouser.net".to_string(), "localhost".to_string()];
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(subject_alt_names).expect("generate test certificate");
        let cert_der = CertificateDer::from(cert.der().to_vec());

        let certs_dir = tempfile::tempdir().expect("create temp dir");
        let cert_path = certs_dir.path().join("server.crt");
        let key_path = certs_dir.path().join("server.key");
        std::fs::write(&cert_path, cert.pem()).expect("write cert");
        std::fs::write(&key_path, key_pair.serialize_pem()).expect("write key");

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");

        let store = Arc::new(MemoryStore::new());
        let shutdown = CancellationToken::new();

        let config = XmppServerConfig {
            bind_addr: addr,
            server_cert: cert_path,
            server_key: key_path,
            ca_cert: None,
            use_auth,
            router: RouterConfig { strict_match },
        };

        let server = XmppServer::new(config, Arc::clone(&store), listener, shutdown.clone())
            .expect("create broker");
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        Self {
            addr,
            store,
            cert_der,
            shutdown,
            _certs_dir: certs_dir,
        }
    }

    /// A TLS connector that trusts this broker's certificate.
    pub fn tls_connector(&self) -> TlsConnector {
        let mut root_store = RootCertStore::empty();
        root_store
            .add(self.cert_der.clone())
            .expect("add test cert");

        let client_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        TlsConnector::from(Arc::new(client_config))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Raw wire-level XMPP client speaking the legacy dialect.
pub struct RawXmppClient {
    tcp: Option<TcpStream>,
    tls: Option<tokio_rustls::client::TlsStream<TcpStream>>,
    buffer: String,
}

impl RawXmppClient {
    /// Connect to a broker.
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let tcp = TcpStream::connect(addr).await?;
        Ok(Self {
            tcp: Some(tcp),
            tls: None,
            buffer: String::new(),
        })
    }

    /// Send raw data.
    pub async fn send(&mut self, data: &str) -> std::io::Result<()> {
        if let Some(ref mut tls) = self.tls {
            tls.write_all(data.as_bytes()).await?;
            tls.flush().await?;
        } else if let Some(ref mut tcp) = self.tcp {
            tcp.write_all(data.as_bytes()).await?;
            tcp.flush().await?;
        }
        Ok(())
    }

    /// Read once with a timeout. Returns the bytes read this call.
    pub async fn read(&mut self, timeout_dur: Duration) -> std::io::Result<String> {
        let mut buf = [0u8; 4096];
        let n = timeout(timeout_dur, async {
            if let Some(ref mut tls) = self.tls {
                tls.read(&mut buf).await
            } else if let Some(ref mut tcp) = self.tcp {
                tcp.read(&mut buf).await
            } else {
                Err(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "Not connected",
                ))
            }
        })
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "Timeout"))??;

        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Connection closed",
            ));
        }

        let data = String::from_utf8_lossy(&buf[..n]).to_string();
        self.buffer.push_str(&data);
        Ok(data)
    }

    /// Read until the buffer contains `pattern`, returning the whole buffer.
    pub async fn read_until(
        &mut self,
        pattern: &str,
        timeout_dur: Duration,
    ) -> std::io::Result<String> {
        let start = std::time::Instant::now();
        while !self.buffer.contains(pattern) {
            if start.elapsed() > timeout_dur {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("Timeout waiting for: {}", pattern),
                ));
            }
            let remaining = timeout_dur.saturating_sub(start.elapsed());
            self.read(remaining).await?;
        }
        Ok(self.buffer.clone())
    }

    /// Expect the connection to be closed by the peer, draining any trailing
    /// data (such as keepalive probes) first.
    pub async fn expect_eof(&mut self, timeout_dur: Duration) -> bool {
        let start = std::time::Instant::now();
        loop {
            if start.elapsed() > timeout_dur {
                return false;
            }
            let remaining = timeout_dur.saturating_sub(start.elapsed());
            match self.read(remaining).await {
                Ok(_) => continue,
                Err(e) => {
                    return matches!(
                        e.kind(),
                        std::io::ErrorKind::UnexpectedEof
                            | std::io::ErrorKind::ConnectionReset
                            | std::io::ErrorKind::BrokenPipe
                    );
                }
            }
        }
    }

    /// Clear the accumulated buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Upgrade the connection to TLS.
    pub async fn upgrade_tls(&mut self, connector: TlsConnector) -> std::io::Result<()> {
        let tcp = self.tcp.take().ok_or_else(|| {
            std::io::Error::other("No TCP connection or already TLS")
        })?;

        let server_name: rustls::pki_types::ServerName<'static> = "ecouser.net"
            .to_string()
            .try_into()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "Invalid name"))?;

        let tls = connector.connect(server_name, tcp).await?;
        self.tls = Some(tls);
        self.buffer.clear();
        Ok(())
    }

    /// Whether the transport is TLS.
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Send the legacy stream opener.
    pub async fn open_stream(&mut self, to: &str) -> std::io::Result<()> {
        self.send(&format!(
            "<stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' \
             to='{}' version='1.0'>",
            to
        ))
        .await
    }

    /// Send a SASL PLAIN auth element with a raw (pre-base64) payload.
    pub async fn auth_plain_raw(&mut self, raw_payload: &str) -> std::io::Result<()> {
        let encoded = BASE64_STANDARD.encode(raw_payload.as_bytes());
        self.send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            encoded
        ))
        .await
    }

    /// Drive a full plain-TCP login to READY. Returns the bound JID.
    pub async fn login(
        &mut self,
        stream_to: &str,
        sasl_payload: &str,
    ) -> std::io::Result<String> {
        self.open_stream(stream_to).await?;
        self.read_until("</stream:features>", DEFAULT_TIMEOUT).await?;
        self.clear();

        self.auth_plain_raw(sasl_payload).await?;
        self.read_until("<success", DEFAULT_TIMEOUT).await?;
        self.clear();

        self.open_stream(stream_to).await?;
        self.read_until("</stream:features>", DEFAULT_TIMEOUT).await?;
        self.clear();

        self.send("<iq id='bind_1' type='set'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></iq>")
            .await?;
        let bind_response = self.read_until("</iq>", DEFAULT_TIMEOUT).await?;
        let jid = extract_bound_jid(&bind_response)
            .ok_or_else(|| std::io::Error::other("No JID in bind result"))?;
        self.clear();

        self.send(
            "<iq id='sess_1' type='set'><session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>",
        )
        .await?;
        self.read_until("id=\"sess_1\"", DEFAULT_TIMEOUT).await?;
        self.clear();

        Ok(jid)
    }
}

/// Log a bot in over plain TCP. Returns the client in READY state.
pub async fn login_bot(server: &TestServer, devclass: &str, serial: &str) -> RawXmppClient {
    let mut client = RawXmppClient::connect(server.addr)
        .await
        .expect("connect bot");
    let jid = client
        .login(
            &format!("{}.ecorobot.net", devclass),
            &format!("\0{}\0botpw", serial),
        )
        .await
        .expect("bot login");
    assert_eq!(jid, format!("{}@{}.ecorobot.net/atom", serial, devclass));
    client
}

/// Log a controller in over plain TCP. Returns the client in READY state.
pub async fn login_controller(
    server: &TestServer,
    uid: &str,
    resource: &str,
    authcode: &str,
) -> RawXmppClient {
    let mut client = RawXmppClient::connect(server.addr)
        .await
        .expect("connect controller");
    let jid = client
        .login(
            "ecouser.net",
            &format!("\0{}\0{}\0{}", uid, resource, authcode),
        )
        .await
        .expect("controller login");
    assert_eq!(jid, format!("{}@ecouser.net/{}", uid, resource));
    client
}

/// Extract the JID from a bind result.
pub fn extract_bound_jid(response: &str) -> Option<String> {
    let start = response.find("<jid>")?;
    let end = response.find("</jid>")?;
    Some(response[start + 5..end].to_string())
}
