//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use media_tap::capture::{CaptureOutcome, TrafficObserver};
use media_tap::lifecycle::startup::LogStartup;
use media_tap::net::tls::crypto_provider;
use media_tap::{MediaTap, ProxyConfig, RunningProxy};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, Issuer, KeyPair};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// What a mock origin answers.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Content-Length to announce instead of the body's length.
    pub announced_length: Option<usize>,
}

impl MockResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
            announced_length: None,
        }
    }

    /// Headers only, as an answer to HEAD: announce `length` but send no body.
    pub fn head_only(length: usize) -> Self {
        Self {
            announced_length: Some(length),
            ..Self::ok(Vec::new())
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn encode(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} Mock\r\n", self.status);
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str(&format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n",
            self.announced_length.unwrap_or(self.body.len())
        ));
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

/// Read until the end of an HTTP head. Returns the head as text.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => head.push(byte[0]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

async fn answer<S, F>(mut stream: S, handler: Arc<F>, heads: mpsc::UnboundedSender<String>)
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(&str) -> MockResponse,
{
    let head = read_head(&mut stream).await;
    if head.is_empty() {
        return;
    }
    let response = handler(&head);
    let _ = heads.send(head);
    let _ = stream.write_all(&response.encode()).await;
    let _ = stream.flush().await;
    let _ = stream.shutdown().await;
}

/// Start a plain HTTP origin. Every request head it receives is sent to the returned channel.
pub async fn start_origin<F>(handler: F) -> (SocketAddr, mpsc::UnboundedReceiver<String>)
where
    F: Fn(&str) -> MockResponse + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(answer(socket, handler.clone(), tx.clone()));
        }
    });
    (addr, rx)
}

/// Start an HTTPS origin presenting `pki`'s leaf certificate.
pub async fn start_tls_origin<F>(pki: &TestPki, handler: F) -> (SocketAddr, mpsc::UnboundedReceiver<String>)
where
    F: Fn(&str) -> MockResponse + Send + Sync + 'static,
{
    let acceptor = TlsAcceptor::from(pki.server_config());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let handler = handler.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(socket).await {
                    answer(tls, handler, tx).await;
                }
            });
        }
    });
    (addr, rx)
}

/// A test CA plus one leaf for `localhost`, written to disk.
pub struct TestPki {
    pub dir: tempfile::TempDir,
    pub ca_pem: String,
    pub leaf_cert_pem: String,
    pub leaf_key_pem: String,
}

impl TestPki {
    pub fn generate() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "media-tap test CA");
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();
        let issuer = Issuer::new(ca_params, ca_key);

        let leaf_key = KeyPair::generate().unwrap();
        let leaf_params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
        let leaf = leaf_params.signed_by(&leaf_key, &issuer).unwrap();

        let pki = Self {
            dir: tempfile::tempdir().unwrap(),
            ca_pem: ca_cert.pem(),
            leaf_cert_pem: leaf.pem(),
            leaf_key_pem: leaf_key.serialize_pem(),
        };
        std::fs::write(pki.ca_path(), &pki.ca_pem).unwrap();
        std::fs::write(pki.cert_path(), &pki.leaf_cert_pem).unwrap();
        std::fs::write(pki.key_path(), &pki.leaf_key_pem).unwrap();
        pki
    }

    pub fn ca_path(&self) -> PathBuf {
        self.dir.path().join("ca.crt")
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.path().join("server.crt")
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.path().join("server.key")
    }

    pub fn server_config(&self) -> Arc<rustls::ServerConfig> {
        media_tap::net::tls::load_server_config(&self.cert_path(), &self.key_path()).unwrap()
    }

    /// TLS client that trusts only the test CA.
    pub fn connector(&self) -> TlsConnector {
        let mut roots = rustls::RootCertStore::empty();
        for cert in media_tap::net::tls::load_certs(&self.ca_path()).unwrap() {
            roots.add(cert).unwrap();
        }
        let config = rustls::ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    /// Handshake with the proxy over `stream`, expecting the `localhost` leaf.
    pub async fn handshake<S>(&self, stream: S) -> tokio_rustls::client::TlsStream<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let name = ServerName::try_from("localhost").unwrap();
        self.connector().connect(name, stream).await.unwrap()
    }
}

/// A running proxy on ephemeral ports with its own download directory.
pub struct TestProxy {
    pub proxy: RunningProxy,
    pub pki: TestPki,
    pub downloads: tempfile::TempDir,
}

impl TestProxy {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(configure: impl FnOnce(&mut ProxyConfig)) -> Self {
        let pki = TestPki::generate();
        let downloads = tempfile::tempdir().unwrap();

        let mut config = ProxyConfig::default();
        config.listener.bind_address = "127.0.0.1:0".into();
        config.listener.plain_proxy_address = "127.0.0.1:0".into();
        config.listener.secure_proxy_address = "127.0.0.1:0".into();
        config.tls.cert_path = pki.cert_path().display().to_string();
        config.tls.key_path = pki.key_path().display().to_string();
        config.tls.upstream_ca_path = Some(pki.ca_path().display().to_string());
        config.capture.download_dir = downloads.path().display().to_string();
        config.identity.hostname = "test-proxy".into();
        configure(&mut config);

        let proxy = MediaTap::new(config).start(&LogStartup).await.unwrap();
        Self {
            proxy,
            pki,
            downloads,
        }
    }

    pub fn router(&self) -> SocketAddr {
        self.proxy.router_addr()
    }

    /// reqwest client that sends every http:// request through the router.
    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::http(format!("http://{}", self.router())).unwrap())
            .pool_max_idle_per_host(0)
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap()
    }

    /// Wait until no request is in flight.
    pub async fn wait_idle(&self) -> bool {
        wait_for(|| self.proxy.in_flight() == 0).await
    }
}

/// Poll `condition` for up to five seconds.
pub async fn wait_for(condition: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Parsed response read off a raw stream.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
}

impl RawResponse {
    /// Every value of `name` in the head, in order.
    pub fn header_values(&self, name: &str) -> Vec<String> {
        self.head
            .lines()
            .skip(1)
            .filter_map(|line| line.split_once(':'))
            .filter(|(n, _)| n.trim().eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim().to_string())
            .collect()
    }
}

/// Read one response with a Content-Length body.
pub async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> RawResponse {
    let head = read_head(stream).await;
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let length: usize = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(n, _)| n.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await.unwrap();
    RawResponse { status, head, body }
}

/// Send raw bytes to `addr` and read one response.
pub async fn raw_exchange(addr: SocketAddr, request: &[u8]) -> RawResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    read_response(&mut stream).await
}

/// Collects capture outcomes.
#[derive(Default)]
pub struct OutcomeLog(pub Mutex<Vec<CaptureOutcome>>);

impl TrafficObserver for OutcomeLog {
    fn on_capture(&self, outcome: &CaptureOutcome) {
        self.0.lock().unwrap().push(outcome.clone());
    }
}

impl OutcomeLog {
    pub fn labels(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().iter().map(|o| o.label()).collect()
    }

    /// Wait for an outcome matching `predicate`.
    pub async fn wait_for(&self, predicate: impl Fn(&CaptureOutcome) -> bool) -> Option<CaptureOutcome> {
        for _ in 0..500 {
            if let Some(found) = self.0.lock().unwrap().iter().find(|o| predicate(o)) {
                return Some(found.clone());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }
}
