//! In-process TLS listener for the impersonation proxy.
//!
//! The listener is started once per incarnation and outlives reconciles
//! until the proxy is disabled. The serving certificate is resolved per
//! handshake from a swappable cell, so the reconciler can rotate material
//! without restarting the listener. Running with no certificate installed is
//! a legitimate state: handshakes are refused until a serving name is known.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::Error;
use crate::Result;

/// Produces the HTTP handler served behind TLS.
///
/// The handler is opaque to the control loop; only factory errors are
/// observed (they abort the reconcile pass that tried to start the server).
pub type HandlerFactory = Arc<dyn Fn() -> Result<Router> + Send + Sync>;

/// Swappable serving certificate cell.
///
/// Written by the reconciler, read by the TLS handshake callback. The swap
/// is a single pointer store under the lock, so a handshake sees either the
/// old or the new material, never a mix.
#[derive(Default)]
pub struct ServingCertCell {
    current: RwLock<Option<Arc<CertifiedKey>>>,
}

impl ServingCertCell {
    /// Install new serving material, or clear it with `None`.
    pub fn replace(&self, certified_key: Option<Arc<CertifiedKey>>) {
        if let Ok(mut guard) = self.current.write() {
            *guard = certified_key;
        }
    }

    /// Whether serving material is currently installed.
    pub fn is_installed(&self) -> bool {
        self.current.read().map(|g| g.is_some()).unwrap_or(false)
    }
}

impl fmt::Debug for ServingCertCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServingCertCell")
            .field("installed", &self.is_installed())
            .finish()
    }
}

impl ResolvesServerCert for ServingCertCell {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        self.current.read().ok().and_then(|guard| guard.clone())
    }
}

struct RunningListener {
    local_addr: SocketAddr,
    handle: Handle,
    task: JoinHandle<std::io::Result<()>>,
}

/// Process-local handle over the impersonation proxy listener.
///
/// Owned and driven exclusively by the reconciler; all methods are
/// idempotent so a reconcile pass can call them without tracking state.
pub struct ImpersonatorServer {
    listen_addr: SocketAddr,
    cert_cell: Arc<ServingCertCell>,
    running: Option<RunningListener>,
}

impl ImpersonatorServer {
    /// Create a stopped server that will bind the given address on start.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            cert_cell: Arc::new(ServingCertCell::default()),
            running: None,
        }
    }

    /// Bind the listener and start serving. No-op while already running.
    ///
    /// Fails fast: the handler factory runs and the socket is bound before
    /// this returns, so bind conflicts and factory errors surface to the
    /// caller instead of a background task.
    pub async fn start(&mut self, make_handler: &HandlerFactory) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let app = make_handler()?;

        let listener = std::net::TcpListener::bind(self.listen_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let tls_config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| Error::TlsConfig(e.to_string()))?
        .with_no_client_auth()
        .with_cert_resolver(self.cert_cell.clone());

        let rustls_config = RustlsConfig::from_config(Arc::new(tls_config));
        let handle = Handle::new();
        let server = axum_server::from_tcp_rustls(listener, rustls_config).handle(handle.clone());
        let task = tokio::spawn(server.serve(app.into_make_service()));

        info!(addr = %local_addr, "impersonation proxy listener started");
        self.running = Some(RunningListener {
            local_addr,
            handle,
            task,
        });
        Ok(())
    }

    /// Install new serving material, or clear it with `None`.
    pub fn set_serving_cert(&self, certified_key: Option<Arc<CertifiedKey>>) {
        debug!(
            installed = certified_key.is_some(),
            "swapping impersonation proxy serving certificate"
        );
        self.cert_cell.replace(certified_key);
    }

    /// Whether serving material is currently installed.
    pub fn has_serving_cert(&self) -> bool {
        self.cert_cell.is_installed()
    }

    /// Stop the listener and clear the serving certificate.
    ///
    /// No-op while stopped. A close error from the serve loop is returned
    /// verbatim and is fatal to the calling reconcile pass.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        running.handle.shutdown();
        self.cert_cell.replace(None);

        match running.task.await {
            Ok(serve_result) => serve_result.map_err(Error::from)?,
            Err(join_err) => return Err(Error::Io(std::io::Error::other(join_err))),
        }

        info!("impersonation proxy listener stopped");
        Ok(())
    }

    /// Whether the listener is currently running.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// The bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use axum::routing::get;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use crate::pki::{ServingName, TlsMaterial};

    use super::*;

    fn hello_factory() -> HandlerFactory {
        Arc::new(|| Ok(Router::new().route("/", get(|| async { "hello world" }))))
    }

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn tls_get(
        addr: SocketAddr,
        server_name: rustls::pki_types::ServerName<'static>,
        ca_pem: &[u8],
    ) -> std::io::Result<String> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
            roots.add(cert.unwrap()).unwrap();
        }
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();

        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let tcp = TcpStream::connect(addr).await?;
        let mut tls = connector.connect(server_name, tcp).await?;
        tls.write_all(b"GET / HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
            .await?;
        let mut body = Vec::new();
        match tls.read_to_end(&mut body).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {}
            Err(e) => return Err(e),
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn serves_after_cert_install_and_refuses_before() {
        let mut server = ImpersonatorServer::new(localhost());
        server.start(&hello_factory()).await.unwrap();
        let addr = server.local_addr().unwrap();

        let material = TlsMaterial::mint(&ServingName::classify("127.0.0.1")).unwrap();

        // No cert installed yet: the handshake must be refused.
        let err = tls_get(
            addr,
            rustls::pki_types::ServerName::IpAddress("127.0.0.1".parse::<std::net::IpAddr>().unwrap().into()),
            material.ca_pem.as_bytes(),
        )
        .await;
        assert!(err.is_err());

        // Install the cert; the same listener now serves it.
        server.set_serving_cert(Some(material.certified_key().unwrap()));
        let body = tls_get(
            addr,
            rustls::pki_types::ServerName::IpAddress("127.0.0.1".parse::<std::net::IpAddr>().unwrap().into()),
            material.ca_pem.as_bytes(),
        )
        .await
        .unwrap();
        assert!(body.contains("hello world"));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let mut server = ImpersonatorServer::new(localhost());
        server.start(&hello_factory()).await.unwrap();
        let addr = server.local_addr().unwrap();

        server.start(&hello_factory()).await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_releases_the_port_and_clears_the_cert() {
        let mut server = ImpersonatorServer::new(localhost());
        server.start(&hello_factory()).await.unwrap();
        let addr = server.local_addr().unwrap();

        let material = TlsMaterial::mint(&ServingName::classify("127.0.0.1")).unwrap();
        server.set_serving_cert(Some(material.certified_key().unwrap()));
        assert!(server.has_serving_cert());

        server.stop().await.unwrap();
        assert!(!server.is_running());
        assert!(!server.has_serving_cert());
        assert!(TcpStream::connect(addr).await.is_err());

        // Stopping again is a no-op.
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn factory_errors_fail_the_start() {
        let factory: HandlerFactory = Arc::new(|| {
            Err(Error::api(std::io::Error::other("some factory error")))
        });
        let mut server = ImpersonatorServer::new(localhost());
        let err = server.start(&factory).await.unwrap_err();
        assert_eq!(err.to_string(), "some factory error");
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn bind_conflicts_fail_the_start() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = blocker.local_addr().unwrap();

        let mut server = ImpersonatorServer::new(addr);
        let err = server.start(&hello_factory()).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(!server.is_running());
    }
}
