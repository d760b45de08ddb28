//! Cast v2 transport: TLS to port 8009 carrying length-prefixed protobuf
//! `CastMessage` frames.
//!
//! Receivers present self-signed certificates, so the TLS layer accepts any
//! certificate. Message signatures are still checked against the offered
//! certificate.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use prost::Message;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::{DeviceError, DeviceResult};
use crate::protocol_constants::CAST_MAX_FRAME_SIZE;

/// The protobuf envelope of every Cast message.
#[derive(Clone, PartialEq, Message)]
pub(crate) struct CastMessage {
    /// Always 0 (CASTV2_1_0).
    #[prost(int32, required, tag = "1")]
    pub protocol_version: i32,
    #[prost(string, required, tag = "2")]
    pub source_id: String,
    #[prost(string, required, tag = "3")]
    pub destination_id: String,
    #[prost(string, required, tag = "4")]
    pub namespace: String,
    /// 0 = string payload, 1 = binary payload.
    #[prost(int32, required, tag = "5")]
    pub payload_type: i32,
    #[prost(string, optional, tag = "6")]
    pub payload_utf8: Option<String>,
    #[prost(bytes = "vec", optional, tag = "7")]
    pub payload_binary: Option<Vec<u8>>,
}

impl CastMessage {
    pub(crate) fn json(source: &str, destination: &str, namespace: &str, payload: &Value) -> Self {
        Self {
            protocol_version: 0,
            source_id: source.to_string(),
            destination_id: destination.to_string(),
            namespace: namespace.to_string(),
            payload_type: 0,
            payload_utf8: Some(payload.to_string()),
            payload_binary: None,
        }
    }

    /// Parses the JSON payload. Binary payloads are not used by the
    /// namespaces this crate speaks.
    pub(crate) fn payload(&self) -> DeviceResult<Value> {
        let text = self.payload_utf8.as_deref().ok_or_else(|| {
            DeviceError::ProtocolError(format!("binary payload on {}", self.namespace))
        })?;
        serde_json::from_str(text)
            .map_err(|e| DeviceError::ProtocolError(format!("malformed payload: {e}")))
    }
}

pub(crate) async fn write_message<W>(writer: &mut W, message: &CastMessage) -> DeviceResult<()>
where
    W: AsyncWrite + Unpin,
{
    let body = message.encode_to_vec();
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    writer
        .write_all(&frame)
        .await
        .map_err(|e| DeviceError::DeviceUnreachable(format!("write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| DeviceError::DeviceUnreachable(format!("flush failed: {e}")))
}

pub(crate) async fn read_message<R>(reader: &mut R) -> DeviceResult<CastMessage>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 4];
    reader
        .read_exact(&mut len)
        .await
        .map_err(|e| DeviceError::DeviceUnreachable(format!("read failed: {e}")))?;
    let len = u32::from_be_bytes(len) as usize;
    if len > CAST_MAX_FRAME_SIZE {
        return Err(DeviceError::ProtocolError(format!("frame of {len} bytes exceeds limit")));
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| DeviceError::DeviceUnreachable(format!("read failed: {e}")))?;
    CastMessage::decode(body.as_slice())
        .map_err(|e| DeviceError::ProtocolError(format!("undecodable frame: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// TLS
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn tls_config() -> DeviceResult<Arc<ClientConfig>> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    if let Some(config) = CONFIG.get() {
        return Ok(Arc::clone(config));
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| DeviceError::ConnectionError(format!("TLS setup failed: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth();
    Ok(Arc::clone(CONFIG.get_or_init(|| Arc::new(config))))
}

/// Opens the TLS connection to a receiver.
pub(crate) async fn open(addr: SocketAddr, timeout: Duration) -> DeviceResult<TlsStream<TcpStream>> {
    let connector = TlsConnector::from(tls_config()?);
    let connect = async {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| DeviceError::ConnectionError(format!("{addr}: {e}")))?;
        let _ = tcp.set_nodelay(true);
        connector
            .connect(ServerName::from(addr.ip()), tcp)
            .await
            .map_err(|e| DeviceError::ConnectionError(format!("{addr}: TLS handshake failed: {e}")))
    };
    tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| DeviceError::ConnectionError(format!("{addr}: connect timed out")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PING_FRAME: &str = "000000540800120a72656365697665722d301a0873656e6465722d30222775726e3a782d636173743a636f6d2e676f6f676c652e636173742e74702e6865617274626561742800320f7b2274797065223a2250494e47227d";

    fn unhex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn decodes_known_heartbeat_frame() {
        let bytes = unhex(PING_FRAME);
        let message = read_message(&mut bytes.as_slice()).await.unwrap();
        assert_eq!(message.source_id, "receiver-0");
        assert_eq!(message.destination_id, "sender-0");
        assert_eq!(message.namespace, "urn:x-cast:com.google.cast.tp.heartbeat");
        assert_eq!(message.payload().unwrap(), json!({"type": "PING"}));
    }

    #[tokio::test]
    async fn written_frames_read_back() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let sent = CastMessage::json(
            "sender-0",
            "receiver-0",
            "urn:x-cast:com.google.cast.receiver",
            &json!({"type": "GET_STATUS", "requestId": 3}),
        );
        write_message(&mut a, &sent).await.unwrap();
        let received = read_message(&mut b).await.unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let bytes = (u32::MAX).to_be_bytes();
        let err = read_message(&mut bytes.as_slice()).await.unwrap_err();
        assert!(matches!(err, DeviceError::ProtocolError(_)));
    }

    #[test]
    fn tls_config_builds_once() {
        let first = tls_config().unwrap();
        let second = tls_config().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
