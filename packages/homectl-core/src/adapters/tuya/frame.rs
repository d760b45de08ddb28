//! Tuya local protocol 3.3 framing and payload cipher.
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! 000055AA | seq u32 | cmd u32 | len u32 | payload | crc32 u32 | 0000AA55
//! ```
//!
//! `len` counts the payload plus the trailing CRC and suffix. The CRC covers
//! everything from the prefix through the payload. Frames sent by the device
//! start their payload with a 4-byte return code.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyInit};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{DeviceError, DeviceResult};
use crate::protocol_constants::{TUYA_MAX_PAYLOAD, TUYA_PREFIX, TUYA_SUFFIX, TUYA_VERSION};

type Aes128EcbEnc = ecb::Encryptor<aes::Aes128>;
type Aes128EcbDec = ecb::Decryptor<aes::Aes128>;

pub(crate) const CMD_CONTROL: u32 = 7;
pub(crate) const CMD_STATUS: u32 = 8;
pub(crate) const CMD_DP_QUERY: u32 = 10;

const HEADER_LEN: usize = 16;
const TRAILER_LEN: usize = 8;
/// `"3.3"` followed by 12 reserved bytes.
const VERSION_HEADER_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub seq: u32,
    pub cmd: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len() + TRAILER_LEN);
        buf.extend_from_slice(&TUYA_PREFIX.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.cmd.to_be_bytes());
        buf.extend_from_slice(&((self.payload.len() + TRAILER_LEN) as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf.extend_from_slice(&TUYA_SUFFIX.to_be_bytes());
        buf
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Reads and verifies one frame.
pub(crate) async fn read_frame<R>(reader: &mut R) -> DeviceResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| DeviceError::DeviceUnreachable(format!("read failed: {e}")))?;

    if be_u32(&header[0..4]) != TUYA_PREFIX {
        return Err(DeviceError::ProtocolError("frame prefix mismatch".into()));
    }
    let seq = be_u32(&header[4..8]);
    let cmd = be_u32(&header[8..12]);
    let len = be_u32(&header[12..16]) as usize;
    if !(TRAILER_LEN..=TUYA_MAX_PAYLOAD + TRAILER_LEN).contains(&len) {
        return Err(DeviceError::ProtocolError(format!("frame length {len} out of range")));
    }

    let mut rest = vec![0u8; len];
    reader
        .read_exact(&mut rest)
        .await
        .map_err(|e| DeviceError::DeviceUnreachable(format!("read failed: {e}")))?;

    let (payload, trailer) = rest.split_at(len - TRAILER_LEN);
    if be_u32(&trailer[4..8]) != TUYA_SUFFIX {
        return Err(DeviceError::ProtocolError("frame suffix mismatch".into()));
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header);
    hasher.update(payload);
    if hasher.finalize() != be_u32(&trailer[0..4]) {
        return Err(DeviceError::ProtocolError("frame CRC mismatch".into()));
    }

    Ok(Frame {
        seq,
        cmd,
        payload: payload.to_vec(),
    })
}

/// AES-128-ECB with the device's local key.
pub(crate) struct TuyaCipher {
    key: [u8; 16],
}

impl TuyaCipher {
    pub(crate) fn new(local_key: &str) -> DeviceResult<Self> {
        let key: [u8; 16] = local_key.as_bytes().try_into().map_err(|_| {
            DeviceError::ConfigurationError(format!(
                "Tuya local key must be 16 bytes, got {}",
                local_key.len()
            ))
        })?;
        Ok(Self { key })
    }

    pub(crate) fn encrypt(&self, plaintext: &[u8]) -> DeviceResult<Vec<u8>> {
        let cipher = Aes128EcbEnc::new_from_slice(&self.key)
            .map_err(|e| DeviceError::ConfigurationError(e.to_string()))?;
        Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    pub(crate) fn decrypt(&self, ciphertext: &[u8]) -> DeviceResult<Vec<u8>> {
        let cipher = Aes128EcbDec::new_from_slice(&self.key)
            .map_err(|e| DeviceError::ConfigurationError(e.to_string()))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| DeviceError::ProtocolError("payload does not decrypt with local key".into()))
    }

    /// Payload of a CONTROL frame: version header plus ciphertext.
    pub(crate) fn control_payload(&self, body: &Value) -> DeviceResult<Vec<u8>> {
        let mut payload = Vec::with_capacity(VERSION_HEADER_LEN + 64);
        payload.extend_from_slice(TUYA_VERSION.as_bytes());
        payload.extend_from_slice(&[0u8; VERSION_HEADER_LEN - 3]);
        payload.extend_from_slice(&self.encrypt(&to_json(body)?)?);
        Ok(payload)
    }

    /// Payload of a DP_QUERY frame: bare ciphertext.
    pub(crate) fn query_payload(&self, body: &Value) -> DeviceResult<Vec<u8>> {
        self.encrypt(&to_json(body)?)
    }

    /// Decodes the body of a device frame.
    ///
    /// Returns `Ok(None)` for acknowledgements that carry only a return code.
    pub(crate) fn open_reply(&self, payload: &[u8]) -> DeviceResult<Option<Value>> {
        if payload.len() < 4 {
            return Err(DeviceError::ProtocolError("reply shorter than return code".into()));
        }
        let (retcode, mut body) = payload.split_at(4);
        let retcode = be_u32(retcode);
        if body.is_empty() {
            return if retcode == 0 {
                Ok(None)
            } else {
                Err(DeviceError::ProtocolError(format!("device returned code {retcode}")))
            };
        }
        if body.starts_with(TUYA_VERSION.as_bytes()) && body.len() > VERSION_HEADER_LEN {
            body = &body[VERSION_HEADER_LEN..];
        }

        let plaintext = match self.decrypt(body) {
            Ok(plaintext) => plaintext,
            // Some firmwares answer errors in plain text.
            Err(_) if retcode != 0 => body.to_vec(),
            Err(e) => return Err(e),
        };
        if retcode != 0 {
            return Err(DeviceError::ProtocolError(format!(
                "device returned code {}: {}",
                retcode,
                String::from_utf8_lossy(&plaintext)
            )));
        }
        serde_json::from_slice(&plaintext)
            .map(Some)
            .map_err(|_| {
                DeviceError::ProtocolError(format!(
                    "unexpected reply: {}",
                    String::from_utf8_lossy(&plaintext)
                ))
            })
    }
}

fn to_json(body: &Value) -> DeviceResult<Vec<u8>> {
    serde_json::to_vec(body).map_err(|e| DeviceError::InvalidArgument(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KEY: &str = "0123456789abcdef";

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn frame_encoding_matches_known_bytes() {
        let frame = Frame {
            seq: 1,
            cmd: CMD_DP_QUERY,
            payload: b"{}".to_vec(),
        };
        assert_eq!(
            hex(&frame.encode()),
            "000055aa000000010000000a0000000a7b7dfe40c1e80000aa55"
        );
    }

    #[tokio::test]
    async fn encoded_frames_read_back() {
        let frame = Frame {
            seq: 42,
            cmd: CMD_STATUS,
            payload: vec![0, 0, 0, 0, 1, 2, 3],
        };
        let bytes = frame.encode();
        let decoded = read_frame(&mut bytes.as_slice()).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn corrupted_crc_is_rejected() {
        let mut bytes = Frame {
            seq: 1,
            cmd: CMD_CONTROL,
            payload: b"abc".to_vec(),
        }
        .encode();
        bytes[17] ^= 0xff;
        let err = read_frame(&mut bytes.as_slice()).await.unwrap_err();
        assert!(matches!(err, DeviceError::ProtocolError(m) if m.contains("CRC")));
    }

    #[tokio::test]
    async fn truncated_stream_is_unreachable() {
        let bytes = Frame {
            seq: 1,
            cmd: CMD_CONTROL,
            payload: b"abc".to_vec(),
        }
        .encode();
        let err = read_frame(&mut &bytes[..10]).await.unwrap_err();
        assert!(matches!(err, DeviceError::DeviceUnreachable(_)));
    }

    #[test]
    fn ecb_matches_known_ciphertext() {
        let cipher = TuyaCipher::new(KEY).unwrap();
        let ct = cipher.encrypt(br#"{"dps":{"20":true}}"#).unwrap();
        assert_eq!(
            hex(&ct),
            "6c43740537c46421392c83bfa222a5ee31836d84bd28cb4b20619eb84882ca2a"
        );
    }

    #[test]
    fn short_local_key_is_a_configuration_error() {
        assert!(matches!(
            TuyaCipher::new("tooshort"),
            Err(DeviceError::ConfigurationError(_))
        ));
    }

    #[test]
    fn control_payload_carries_version_header() {
        let cipher = TuyaCipher::new(KEY).unwrap();
        let payload = cipher.control_payload(&json!({"dps": {"20": true}})).unwrap();
        assert_eq!(&payload[..3], b"3.3");
        assert!(payload[3..15].iter().all(|b| *b == 0));
        assert_eq!((payload.len() - 15) % 16, 0);
    }

    #[test]
    fn replies_with_and_without_version_header_open() {
        let cipher = TuyaCipher::new(KEY).unwrap();
        let body = json!({"devId": "bf01", "dps": {"20": true, "22": 505}});

        let mut query_reply = vec![0, 0, 0, 0];
        query_reply.extend(cipher.query_payload(&body).unwrap());
        assert_eq!(cipher.open_reply(&query_reply).unwrap(), Some(body.clone()));

        let mut status_reply = vec![0, 0, 0, 0];
        status_reply.extend(cipher.control_payload(&body).unwrap());
        assert_eq!(cipher.open_reply(&status_reply).unwrap(), Some(body));

        assert_eq!(cipher.open_reply(&[0, 0, 0, 0]).unwrap(), None);
    }

    #[test]
    fn plain_text_error_reply_is_a_protocol_error() {
        let cipher = TuyaCipher::new(KEY).unwrap();
        let mut reply = vec![0, 0, 0, 1];
        reply.extend_from_slice(b"json obj data unvalid");
        let err = cipher.open_reply(&reply).unwrap_err();
        assert!(matches!(err, DeviceError::ProtocolError(m) if m.contains("unvalid")));
    }
}
