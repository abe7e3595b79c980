//! Frame encryption: AES-128-CBC with PKCS#7 padding.
//!
//! The whole frame (header included) is encrypted. With [`IvMode::Static`]
//! every frame uses the configured IV, which is what deployed nodes expect.
//! With [`IvMode::PerPacket`] a random IV is generated per frame and sent in
//! clear in front of the ciphertext.

use aes::Aes128;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use std::sync::Arc;

use crate::config::{EncryptionConfig, IvMode};
use crate::error::{MeshError, MeshResult};
use crate::mesh::packet::MAX_FRAME_LEN;

pub const BLOCK_LEN: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Raw block-cipher collaborator. Inputs must already be block aligned;
/// padding is handled by [`FrameCipher`].
pub trait CryptoProvider: Send + Sync {
    fn encrypt_cbc(&self, plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> MeshResult<Vec<u8>>;
    fn decrypt_cbc(&self, ciphertext: &[u8], key: &[u8; 16], iv: &[u8; 16])
        -> MeshResult<Vec<u8>>;
}

fn check_aligned(len: usize) -> MeshResult<()> {
    if len % BLOCK_LEN != 0 {
        return Err(MeshError::Crypto(format!(
            "{} bytes is not a multiple of the {}-byte block",
            len, BLOCK_LEN
        )));
    }
    Ok(())
}

/// Software AES via the RustCrypto `aes`/`cbc` crates.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareAes;

impl CryptoProvider for SoftwareAes {
    fn encrypt_cbc(&self, plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> MeshResult<Vec<u8>> {
        check_aligned(plaintext.len())?;
        let enc = Aes128CbcEnc::new_from_slices(key, iv)
            .map_err(|e| MeshError::Crypto(format!("cipher init: {e}")))?;
        Ok(enc.encrypt_padded_vec_mut::<NoPadding>(plaintext))
    }

    fn decrypt_cbc(
        &self,
        ciphertext: &[u8],
        key: &[u8; 16],
        iv: &[u8; 16],
    ) -> MeshResult<Vec<u8>> {
        check_aligned(ciphertext.len())?;
        let dec = Aes128CbcDec::new_from_slices(key, iv)
            .map_err(|e| MeshError::Crypto(format!("cipher init: {e}")))?;
        dec.decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|e| MeshError::Crypto(format!("decrypt: {e}")))
    }
}

/// Pad to the next block boundary. Aligned input gains a full block.
pub fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad = BLOCK_LEN - data.len() % BLOCK_LEN;
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.resize(data.len() + pad, pad as u8);
    out
}

/// Strip PKCS#7 padding, checking the pad value is 1..=16 and that every pad
/// byte carries it.
pub fn pkcs7_unpad(data: &[u8]) -> MeshResult<&[u8]> {
    let Some(&last) = data.last() else {
        return Err(MeshError::Crypto("empty plaintext".into()));
    };
    let pad = last as usize;
    if pad == 0 || pad > BLOCK_LEN || pad > data.len() {
        return Err(MeshError::Crypto(format!("invalid padding value {pad}")));
    }
    let (body, tail) = data.split_at(data.len() - pad);
    if let Some(pos) = tail.iter().position(|&b| b != last) {
        return Err(MeshError::Crypto(format!(
            "invalid padding byte at offset {}",
            body.len() + pos
        )));
    }
    Ok(body)
}

/// Encrypts outgoing frames and decrypts incoming ones with a fixed key.
#[derive(Clone)]
pub struct FrameCipher {
    provider: Arc<dyn CryptoProvider>,
    key: [u8; 16],
    iv: [u8; 16],
    mode: IvMode,
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCipher")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl FrameCipher {
    pub fn new(provider: Arc<dyn CryptoProvider>, key: [u8; 16], iv: [u8; 16], mode: IvMode) -> Self {
        Self {
            provider,
            key,
            iv,
            mode,
        }
    }

    /// `None` when encryption is disabled.
    pub fn from_config(cfg: &EncryptionConfig) -> MeshResult<Option<Self>> {
        if !cfg.enabled {
            return Ok(None);
        }
        Ok(Some(Self::new(
            Arc::new(SoftwareAes),
            cfg.key_bytes()?,
            cfg.iv_bytes()?,
            cfg.iv_mode,
        )))
    }

    pub fn seal(&self, frame: &[u8]) -> MeshResult<Vec<u8>> {
        let padded = pkcs7_pad(frame);
        let out = match self.mode {
            IvMode::Static => self.provider.encrypt_cbc(&padded, &self.key, &self.iv)?,
            IvMode::PerPacket => {
                let iv: [u8; 16] = rand::random();
                let ct = self.provider.encrypt_cbc(&padded, &self.key, &iv)?;
                let mut out = Vec::with_capacity(BLOCK_LEN + ct.len());
                out.extend_from_slice(&iv);
                out.extend_from_slice(&ct);
                out
            }
        };
        if out.len() > MAX_FRAME_LEN {
            return Err(MeshError::FrameTooLarge {
                len: out.len(),
                max: MAX_FRAME_LEN,
            });
        }
        Ok(out)
    }

    pub fn open(&self, bytes: &[u8]) -> MeshResult<Vec<u8>> {
        let plain = match self.mode {
            IvMode::Static => self.provider.decrypt_cbc(bytes, &self.key, &self.iv)?,
            IvMode::PerPacket => {
                if bytes.len() < BLOCK_LEN {
                    return Err(MeshError::Crypto(format!(
                        "{} bytes is too short to carry an IV",
                        bytes.len()
                    )));
                }
                let (iv, ct) = bytes.split_at(BLOCK_LEN);
                let mut iv_block = [0u8; BLOCK_LEN];
                iv_block.copy_from_slice(iv);
                self.provider.decrypt_cbc(ct, &self.key, &iv_block)?
            }
        };
        Ok(pkcs7_unpad(&plain)?.to_vec())
    }
}
