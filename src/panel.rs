//! Client for the game-server control panel.
//!
//! The [`Panel`] trait is the seam the lifecycle code talks to; [`PanelClient`]
//! implements it over the panel's REST API and websocket push channel.

use crate::config::PanelConfig;
use crate::error::PanelError;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use futures::SinkExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::Connector;
use tracing::{debug, info, warn};

/// Event name the panel sends when its server list changed
pub const UPDATE_EVENT: &str = "update";

/// One server record as reported by the panel
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PanelServer {
    #[serde(rename = "server_id")]
    pub id: String,
    #[serde(rename = "server_name")]
    pub name: String,
    #[serde(rename = "server_ip")]
    pub ip: String,
    #[serde(rename = "server_port")]
    pub port: u16,
}

/// Subset of the stats endpoint the gateway cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ServerStats {
    pub running: bool,
}

/// A push notification received over the panel websocket
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PanelEvent {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl PanelEvent {
    /// Synthetic update, emitted after the event channel reconnects
    pub fn update() -> Self {
        Self {
            event: UPDATE_EVENT.to_string(),
            data: serde_json::Value::Null,
        }
    }

    pub fn parse(text: &str) -> Result<Self, PanelError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn is_update(&self) -> bool {
        self.event == UPDATE_EVENT
    }
}

/// Envelope used by every panel response
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

/// Operations the gateway needs from the panel.
///
/// Implementations return raw results; policy lives with the callers.
#[async_trait]
pub trait Panel: Send + Sync {
    /// Host the panel runs on; backends bound to loopback live here too
    fn host(&self) -> &str;

    async fn list_servers(&self) -> Result<Vec<PanelServer>, PanelError>;

    async fn start_server(&self, id: &str) -> Result<(), PanelError>;

    async fn stop_server(&self, id: &str) -> Result<(), PanelError>;

    async fn server_stats(&self, id: &str) -> Result<ServerStats, PanelError>;

    /// Read a text file relative to the server directory.
    ///
    /// If the panel does not have the file it is created and `default` is
    /// returned as its content.
    async fn read_file(&self, id: &str, path: &str, default: &str) -> Result<String, PanelError>;

    async fn write_file(&self, id: &str, path: &str, contents: &str) -> Result<(), PanelError>;
}

/// Shared handle to a panel implementation
pub type SharedPanel = Arc<dyn Panel>;

/// REST + websocket client for the panel
pub struct PanelClient {
    http: reqwest::Client,
    base_url: String,
    events_url: String,
    host: String,
    key: String,
}

impl PanelClient {
    /// Build a client from configuration. Certificate checks are disabled
    /// because panels usually run with self-signed certificates.
    pub fn new(config: &PanelConfig) -> Result<Self, PanelError> {
        Self::with_urls(
            config.base_url(),
            config.events_url(),
            &config.address,
            &config.key,
        )
    }

    pub fn with_urls(
        base_url: String,
        events_url: String,
        host: &str,
        key: &str,
    ) -> Result<Self, PanelError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            events_url,
            host: host.to_string(),
            key: key.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        path: &str,
    ) -> Result<reqwest::Response, PanelError> {
        let response = request.bearer_auth(&self.key).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PanelError::Status {
                status: status.as_u16(),
                path: path.to_string(),
            });
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, PanelError> {
        let body = response.bytes().await?;
        let envelope: Envelope<T> = serde_json::from_slice(&body)?;
        Ok(envelope.data)
    }

    async fn create_file(&self, id: &str, path: &str) -> Result<(), PanelError> {
        let full = server_file_path(id, path);
        let (parent, name) = match full.rsplit_once('/') {
            Some((parent, name)) => (parent.to_string(), name.to_string()),
            None => (format!("servers/{}", id), full.clone()),
        };
        let api_path = format!("/api/v2/servers/{}/files/{}", id, full);
        let body = serde_json::json!({
            "parent": parent,
            "name": name,
            "directory": false,
        });
        self.send(self.http.put(self.url(&api_path)).json(&body), &api_path)
            .await?;
        Ok(())
    }

    /// Subscribe to panel push events.
    ///
    /// The returned stream never ends on its own: when the websocket drops it
    /// reconnects after `reconnect_delay` and yields a synthetic update event
    /// so changes missed while disconnected are picked up.
    pub fn subscribe(&self, reconnect_delay: Duration) -> BoxStream<'static, PanelEvent> {
        let (tx, rx) = mpsc::channel(32);
        let url = self.events_url.clone();
        let key = self.key.clone();

        tokio::spawn(async move {
            let mut connected_before = false;
            while !tx.is_closed() {
                match pump_events(&url, &key, &tx, connected_before).await {
                    Ok(()) => debug!(url = %url, "Panel event stream closed"),
                    Err(e) => warn!(url = %url, error = %e, "Panel event stream failed"),
                }
                connected_before = true;
                if tx.is_closed() {
                    break;
                }
                tokio::time::sleep(reconnect_delay).await;
            }
        });

        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed()
    }
}

async fn pump_events(
    url: &str,
    key: &str,
    tx: &mpsc::Sender<PanelEvent>,
    reconnected: bool,
) -> anyhow::Result<()> {
    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .insert(COOKIE, HeaderValue::from_str(&format!("token={}", key))?);

    let connector = Connector::Rustls(Arc::new(insecure_tls_config()?));
    let (mut ws, _) =
        tokio_tungstenite::connect_async_tls_with_config(request, None, false, Some(connector))
            .await?;
    info!(url = %url, "Connected to panel event stream");

    if reconnected && tx.send(PanelEvent::update()).await.is_err() {
        return Ok(());
    }

    while let Some(message) = ws.next().await {
        match message? {
            Message::Text(text) => match PanelEvent::parse(text.as_str()) {
                Ok(event) => {
                    debug!(event = %event.event, "Panel event");
                    if tx.send(event).await.is_err() {
                        let _ = ws.close(None).await;
                        return Ok(());
                    }
                }
                Err(e) => warn!(error = %e, "Ignoring malformed panel event"),
            },
            Message::Ping(payload) => ws.send(Message::Pong(payload)).await?,
            Message::Close(_) => break,
            _ => {}
        }
    }

    Ok(())
}

/// Path of a file relative to the panel's file root
fn server_file_path(id: &str, path: &str) -> String {
    format!("servers/{}/{}", id, path.trim_start_matches('/'))
}

#[async_trait]
impl Panel for PanelClient {
    fn host(&self) -> &str {
        &self.host
    }

    async fn list_servers(&self) -> Result<Vec<PanelServer>, PanelError> {
        let path = "/api/v2/servers";
        let response = self.send(self.http.get(self.url(path)), path).await?;
        Self::decode(response).await
    }

    async fn start_server(&self, id: &str) -> Result<(), PanelError> {
        let path = format!("/api/v2/servers/{}/action/start_server", id);
        self.send(self.http.post(self.url(&path)), &path).await?;
        Ok(())
    }

    async fn stop_server(&self, id: &str) -> Result<(), PanelError> {
        let path = format!("/api/v2/servers/{}/action/stop_server", id);
        self.send(self.http.post(self.url(&path)), &path).await?;
        Ok(())
    }

    async fn server_stats(&self, id: &str) -> Result<ServerStats, PanelError> {
        let path = format!("/api/v2/servers/{}/stats", id);
        let response = self.send(self.http.get(self.url(&path)), &path).await?;
        Self::decode(response).await
    }

    async fn read_file(&self, id: &str, path: &str, default: &str) -> Result<String, PanelError> {
        let api_path = format!("/api/v2/servers/{}/files", id);
        let body = serde_json::json!({ "filename": server_file_path(id, path) });
        let request = self.http.post(self.url(&api_path)).json(&body);

        match self.send(request, &api_path).await {
            Ok(response) => Self::decode(response).await,
            Err(PanelError::Status { status, .. }) => {
                info!(server_id = %id, file = %path, status, "File missing on panel, creating it");
                self.create_file(id, path).await?;
                Ok(default.to_string())
            }
            Err(e) => Err(e),
        }
    }

    async fn write_file(&self, id: &str, path: &str, contents: &str) -> Result<(), PanelError> {
        let api_path = format!("/api/v2/servers/{}/files", id);
        let body = serde_json::json!({
            "path": server_file_path(id, path),
            "contents": contents,
        });
        self.send(self.http.patch(self.url(&api_path)).json(&body), &api_path)
            .await?;
        Ok(())
    }
}

/// TLS settings for the event websocket: any certificate is accepted
fn insecure_tls_config() -> Result<rustls::ClientConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth();
    Ok(config)
}

#[derive(Debug)]
struct AcceptAnyCertificate(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
