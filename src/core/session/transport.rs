//! Transport seam between the session client and the network.
//!
//! The session logic is written against [`Transport`] / [`Connector`] so the
//! remote side can be scripted in tests; [`WsConnector`] is the
//! tokio-tungstenite implementation used in production.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{
    connect_async_tls_with_config, Connector as TlsConnector, MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::error::{Error, Result};

/// One received unit from the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Text(String),
    /// Transport-level close with the peer's code and reason, when present.
    Closed { code: Option<u16>, reason: String },
}

/// Everything needed to open one socket.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: String,
    /// Identity and auth headers. The HTTP upgrade mechanics (Host, Upgrade,
    /// Sec-WebSocket-*) are supplied by the WebSocket library.
    pub headers: Vec<(String, String)>,
    pub handshake_timeout: Duration,
    pub allow_self_signed: bool,
}

/// A bidirectional text-frame transport.
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next inbound unit; `None` when the stream has ended.
    async fn next_message(&mut self) -> Option<Result<WireMessage>>;

    /// Close with a normal (1000) close frame.
    async fn close(&mut self) -> Result<()>;
}

/// Opens transports on demand.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Transport>>;
}

// ---------------------------------------------------------------------------
// tokio-tungstenite implementation
// ---------------------------------------------------------------------------

struct WsTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.ws.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Result<WireMessage>> {
        loop {
            let item = self.ws.next().await?;
            match item {
                Ok(Message::Text(text)) => return Some(Ok(WireMessage::Text(text))),
                Ok(Message::Ping(data)) => {
                    // tungstenite queues the pong; a write flushes it
                    if let Err(e) = self.ws.send(Message::Pong(data)).await {
                        return Some(Err(e.into()));
                    }
                }
                Ok(Message::Close(frame)) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                        None => (None, String::new()),
                    };
                    return Some(Ok(WireMessage::Closed { code, reason }));
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let frame = CloseFrame { code: CloseCode::Normal, reason: "".into() };
        match self.ws.close(Some(frame)).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Production connector backed by tokio-tungstenite.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Transport>> {
        let mut req = request.url.as_str().into_client_request()?;
        {
            let headers = req.headers_mut();
            for (name, value) in &request.headers {
                let name: HeaderName = name
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid header name: {name}")))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|_| Error::Config(format!("invalid value for header {name}")))?;
                headers.insert(name, value);
            }
        }

        let secure = url::Url::parse(&request.url)?.scheme() == "wss";
        let tls = if secure && request.allow_self_signed {
            Some(TlsConnector::Rustls(Arc::new(danger::permissive_client_config()?)))
        } else {
            None
        };

        let handshake = connect_async_tls_with_config(req, None, false, tls);
        let (ws, response) = tokio::time::timeout(request.handshake_timeout, handshake)
            .await
            .map_err(|_| Error::Timeout(request.handshake_timeout))??;

        debug!(status = %response.status(), "WebSocket handshake complete");
        Ok(Box::new(WsTransport { ws }))
    }
}

// ---------------------------------------------------------------------------
// Permissive TLS
// ---------------------------------------------------------------------------

mod danger {
    use std::sync::Arc;

    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

    use crate::error::{Error, Result};

    /// Accepts any server certificate while still verifying handshake
    /// signatures. Matches the typical self-signed server deployment.
    #[derive(Debug)]
    struct AcceptAnyCert(Arc<CryptoProvider>);

    impl ServerCertVerifier for AcceptAnyCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    pub(super) fn permissive_client_config() -> Result<ClientConfig> {
        let provider = Arc::new(ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Config(format!("TLS setup failed: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
            .with_no_client_auth();
        Ok(config)
    }
}
