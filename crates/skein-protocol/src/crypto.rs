//! AES-256-CBC payload encryption
//!
//! Wire form is `IV (16 bytes) || ciphertext`, PKCS#7 padded. A fresh
//! random IV is drawn per message.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::error::ProtocolError;
use crate::Result;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block and IV size in bytes
pub const IV_LEN: usize = 16;

/// Encrypt `plaintext` under the pre-shared key, prepending the IV.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new_from_slices(key, &iv)
        .map_err(|e| ProtocolError::EncryptFailed(e.to_string()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt `IV || ciphertext` produced by [`seal`].
pub fn open(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < IV_LEN + 16 {
        return Err(ProtocolError::DecryptFailed(
            "ciphertext shorter than IV + one block".to_string(),
        ));
    }
    let (iv, ciphertext) = data.split_at(IV_LEN);
    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| ProtocolError::DecryptFailed(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| ProtocolError::DecryptFailed("bad padding".to_string()))
}
