//! KLAP handshake hashes and session cipher.
//!
//! The client sends a random 16-byte local seed to `/app/handshake1`. The
//! device answers with its own 16-byte remote seed followed by
//! `sha256(local ‖ remote ‖ auth)`, which proves it knows the account
//! credentials. The client then posts `sha256(remote ‖ local ‖ auth)` to
//! `/app/handshake2`. Both seeds and the auth hash feed the key derivation
//! below; every later request is AES-128-CBC encrypted and signed.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{DeviceError, DeviceResult};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Length of the SHA-256 signature that prefixes every encrypted body.
pub(crate) const SIGNATURE_LEN: usize = 32;

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// `sha256(sha1(username) ‖ sha1(password))`.
pub(crate) fn auth_hash(username: &str, password: &str) -> [u8; 32] {
    let user = Sha1::digest(username.as_bytes());
    let pass = Sha1::digest(password.as_bytes());
    sha256(&[user.as_slice(), pass.as_slice()])
}

/// The hash the device returns from handshake1.
pub(crate) fn handshake1_hash(local: &[u8], remote: &[u8], auth: &[u8]) -> [u8; 32] {
    sha256(&[local, remote, auth])
}

/// The hash the client sends in handshake2.
pub(crate) fn handshake2_hash(local: &[u8], remote: &[u8], auth: &[u8]) -> [u8; 32] {
    sha256(&[remote, local, auth])
}

/// Symmetric state of an established KLAP session.
#[derive(Clone)]
pub(crate) struct KlapCipher {
    key: [u8; 16],
    iv: [u8; 12],
    sig: [u8; 28],
    seq: i32,
}

impl KlapCipher {
    pub(crate) fn new(local: &[u8], remote: &[u8], auth: &[u8]) -> Self {
        let key_full = sha256(&[&b"lsk"[..], local, remote, auth]);
        let iv_full = sha256(&[&b"iv"[..], local, remote, auth]);
        let sig_full = sha256(&[&b"ldk"[..], local, remote, auth]);

        let mut key = [0u8; 16];
        key.copy_from_slice(&key_full[..16]);
        let mut iv = [0u8; 12];
        iv.copy_from_slice(&iv_full[..12]);
        let mut sig = [0u8; 28];
        sig.copy_from_slice(&sig_full[..28]);
        let seq = i32::from_be_bytes([iv_full[28], iv_full[29], iv_full[30], iv_full[31]]);

        Self { key, iv, sig, seq }
    }

    /// Advances and returns the request sequence number.
    pub(crate) fn next_seq(&mut self) -> i32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn iv_for(&self, seq: i32) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..12].copy_from_slice(&self.iv);
        iv[12..].copy_from_slice(&seq.to_be_bytes());
        iv
    }

    /// Encrypts `plaintext` for `seq` and prefixes the signature.
    pub(crate) fn encrypt(&self, seq: i32, plaintext: &[u8]) -> DeviceResult<Vec<u8>> {
        let cipher = Aes128CbcEnc::new_from_slices(&self.key, &self.iv_for(seq))
            .map_err(|e| DeviceError::ProtocolError(format!("KLAP key setup: {e}")))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        let signature = sha256(&[&self.sig[..], &seq.to_be_bytes()[..], &ciphertext[..]]);

        let mut body = Vec::with_capacity(SIGNATURE_LEN + ciphertext.len());
        body.extend_from_slice(&signature);
        body.extend_from_slice(&ciphertext);
        Ok(body)
    }

    /// Verifies and decrypts a signed body produced for `seq`.
    pub(crate) fn decrypt(&self, seq: i32, body: &[u8]) -> DeviceResult<Vec<u8>> {
        if body.len() < SIGNATURE_LEN {
            return Err(DeviceError::ProtocolError(format!(
                "KLAP body too short ({} bytes)",
                body.len()
            )));
        }
        let (signature, ciphertext) = body.split_at(SIGNATURE_LEN);
        if signature != sha256(&[&self.sig[..], &seq.to_be_bytes()[..], ciphertext]) {
            return Err(DeviceError::ProtocolError("KLAP signature mismatch".into()));
        }
        let cipher = Aes128CbcDec::new_from_slices(&self.key, &self.iv_for(seq))
            .map_err(|e| DeviceError::ProtocolError(format!("KLAP key setup: {e}")))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| DeviceError::ProtocolError("KLAP payload padding invalid".into()))
    }
}
