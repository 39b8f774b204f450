//! Stream adapters: compression and encryption around the payload.
//!
//! The on-paper stream is the file content after optional gzip and
//! optional AES-256-CBC. The key is derived with PBKDF2-HMAC-SHA256 at
//! exactly 524288 iterations; this count is part of the format.

use std::io::{Read, Write};

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use anyhow::{anyhow, Result};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use rand::RngCore;
use tracing::{debug, warn};

use super::{block::superblock::SuperData, crc16, CodecError, ModeFlags};

pub const PBKDF2_ITERATIONS: u32 = 524_288;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// gzip at the given level, or a verbatim copy when `level` is 0 or
/// compression does not actually shrink the payload.
pub fn compress(bytes: &[u8], level: u32) -> Result<(Vec<u8>, bool)> {
    if level == 0 {
        return Ok((bytes.to_vec(), false));
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(bytes)?;
    let compressed = encoder.finish()?;
    if compressed.len() >= bytes.len() && !bytes.is_empty() {
        debug!(
            "gzip grew payload from {} to {} bytes, storing uncompressed",
            bytes.len(),
            compressed.len()
        );
        return Ok((bytes.to_vec(), false));
    }
    Ok((compressed, true))
}

pub fn decompress(data: &[u8], origsize: usize) -> Result<Vec<u8>, CodecError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(origsize);
    decoder
        .read_to_end(&mut out)
        .map_err(|_| CodecError::DecompressFailed)?;
    if out.len() != origsize {
        warn!(
            "decompressed length {} differs from recorded size {}",
            out.len(),
            origsize
        );
        out.truncate(origsize);
    }
    Ok(out)
}

/// The `filecrc` of an encrypted stream covers the decrypted payload
/// including its zero padding up to the 16-byte alignment.
pub fn padded_stream_crc(data: &[u8]) -> u16 {
    let alignedsize = (data.len() + 15) & !15;
    let mut digest = crc16::CRC16.digest();
    digest.update(data);
    digest.update(&vec![0u8; alignedsize - data.len()]);
    digest.finalize()
}

fn derive_key(password: &str, salt: &[u8; 16]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Pads to a 16-byte boundary with zeros and encrypts with a fresh random
/// salt and IV. Returns the ciphertext and both nonces.
pub fn encrypt(data: &[u8], password: &str) -> Result<(Vec<u8>, [u8; 16], [u8; 16])> {
    let mut salt = [0u8; 16];
    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut iv);
    let key = derive_key(password, &salt);

    let alignedsize = (data.len() + 15) & !15;
    let mut buf = vec![0u8; alignedsize];
    buf[..data.len()].copy_from_slice(data);
    let len = buf.len();
    Aes256CbcEnc::new_from_slices(&key, &iv)
        .map_err(|e| anyhow!("cipher init: {e}"))?
        .encrypt_padded_mut::<NoPadding>(&mut buf, len)
        .map_err(|e| anyhow!("encrypt: {e}"))?;
    Ok((buf, salt, iv))
}

fn decrypt(
    data: &[u8],
    password: &str,
    salt: &[u8; 16],
    iv: &[u8; 16],
) -> Result<Vec<u8>, CodecError> {
    if data.len() % 16 != 0 {
        return Err(CodecError::BadPassword);
    }
    let key = derive_key(password, salt);
    let mut buf = data.to_vec();
    Aes256CbcDec::new_from_slices(&key, iv)
        .map_err(|_| CodecError::BadPassword)?
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|_| CodecError::BadPassword)?;
    Ok(buf)
}

/// Reverses the stream preparation for a fully reassembled file. The CRC
/// gate after decryption is what detects a wrong password.
pub fn restore(data: &[u8], sd: &SuperData, password: Option<&str>) -> Result<Vec<u8>, CodecError> {
    let plain;
    let payload: &[u8] = if sd.mode.contains(ModeFlags::ENCRYPTED) {
        let password = password.ok_or(CodecError::BadPassword)?;
        let (salt, iv) = match (&sd.salt, &sd.iv) {
            (Some(salt), Some(iv)) => (salt, iv),
            _ => return Err(CodecError::BadPassword),
        };
        plain = decrypt(data, password, salt, iv)?;
        &plain
    } else {
        data
    };

    if crc16::stream_crc(payload) != sd.filecrc {
        return Err(CodecError::BadPassword);
    }

    if sd.mode.contains(ModeFlags::COMPRESSED) {
        decompress(payload, sd.origsize as usize)
    } else {
        let mut out = payload.to_vec();
        out.truncate(sd.origsize as usize);
        Ok(out)
    }
}
