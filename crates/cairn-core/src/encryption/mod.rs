use std::io::{Read, Write};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{CairnError, Result};

pub const KEY_SIZE: usize = 32;
const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
/// Sealed form of the 32-byte subkey.
const SEALED_SUBKEY_SIZE: usize = KEY_SIZE + TAG_SIZE;
/// Plaintext bytes per independently sealed frame in the streaming variant.
const STREAM_FRAME_SIZE: usize = 1024;

// scrypt cost parameters: N=2^15, r=8, p=1.
const SCRYPT_LOG_N: u8 = 15;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

pub fn default_algorithm() -> &'static str {
    "aes256gcm"
}

fn scrypt_derive(passphrase: &[u8], salt: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_SIZE)
        .map_err(|e| CairnError::Config(format!("scrypt params: {e}")))?;
    let mut output = Zeroizing::new([0u8; KEY_SIZE]);
    scrypt::scrypt(passphrase, salt, &params, output.as_mut())
        .map_err(|e| CairnError::Config(format!("scrypt: {e}")))?;
    Ok(output)
}

/// Build the stored secret from a passphrase: base64(salt || kdf(passphrase, salt)).
/// A zero-byte passphrase is accepted at the KDF level.
pub fn build_secret_from_passphrase(passphrase: &[u8]) -> Result<String> {
    let mut salt = [0u8; SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);

    let derived = scrypt_derive(passphrase, &salt)?;

    let mut blob = Vec::with_capacity(SALT_SIZE + KEY_SIZE);
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(derived.as_slice());
    Ok(BASE64.encode(&blob))
}

/// Re-derive the master key from a passphrase and the stored secret,
/// comparing in constant time. Mismatch is `BadPassphrase`.
pub fn derive_secret(passphrase: &[u8], secret: &str) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let blob = BASE64
        .decode(secret)
        .map_err(|e| CairnError::InvalidFormat(format!("secret is not valid base64: {e}")))?;
    if blob.len() != SALT_SIZE + KEY_SIZE {
        return Err(CairnError::InvalidFormat(format!(
            "secret has wrong length: {}",
            blob.len()
        )));
    }

    let (salt, expected) = blob.split_at(SALT_SIZE);
    let derived = scrypt_derive(passphrase, salt)?;

    if derived.as_slice().ct_eq(expected).into() {
        Ok(derived)
    } else {
        Err(CairnError::BadPassphrase)
    }
}

fn fresh_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

fn cipher_from(key: &[u8; KEY_SIZE]) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key).map_err(|e| CairnError::Config(format!("cipher init: {e}")))
}

/// Generate a fresh subkey, seal it under the master key, and return the
/// envelope header `subkey_nonce || sealed_subkey || data_nonce` plus the
/// subkey cipher and data nonce for sealing the payload.
fn envelope_header(master: &[u8; KEY_SIZE]) -> Result<(Vec<u8>, Aes256Gcm, [u8; NONCE_SIZE])> {
    let mut subkey = Zeroizing::new([0u8; KEY_SIZE]);
    rand::rngs::OsRng.fill_bytes(subkey.as_mut());

    let master_cipher = cipher_from(master)?;
    let subkey_nonce = fresh_nonce();
    let sealed_subkey = master_cipher
        .encrypt(Nonce::from_slice(&subkey_nonce), subkey.as_slice())
        .map_err(|_| CairnError::corruption("envelope", "subkey seal failed"))?;

    let data_cipher = cipher_from(&subkey)?;
    let data_nonce = fresh_nonce();

    let mut header = Vec::with_capacity(NONCE_SIZE + SEALED_SUBKEY_SIZE + NONCE_SIZE);
    header.extend_from_slice(&subkey_nonce);
    header.extend_from_slice(&sealed_subkey);
    header.extend_from_slice(&data_nonce);

    Ok((header, data_cipher, data_nonce))
}

/// Recover the subkey cipher and data nonce from an envelope header.
fn open_header(master: &[u8; KEY_SIZE], buf: &[u8]) -> Result<(Aes256Gcm, [u8; NONCE_SIZE], usize)> {
    let header_size = NONCE_SIZE + SEALED_SUBKEY_SIZE + NONCE_SIZE;
    if buf.len() < header_size {
        return Err(CairnError::corruption("envelope", "truncated header"));
    }

    let subkey_nonce = &buf[..NONCE_SIZE];
    let sealed_subkey = &buf[NONCE_SIZE..NONCE_SIZE + SEALED_SUBKEY_SIZE];
    let mut data_nonce = [0u8; NONCE_SIZE];
    data_nonce.copy_from_slice(&buf[NONCE_SIZE + SEALED_SUBKEY_SIZE..header_size]);

    let master_cipher = cipher_from(master)?;
    let subkey_bytes = Zeroizing::new(
        master_cipher
            .decrypt(Nonce::from_slice(subkey_nonce), sealed_subkey)
            .map_err(|_| CairnError::corruption("envelope", "subkey open failed"))?,
    );
    if subkey_bytes.len() != KEY_SIZE {
        return Err(CairnError::corruption("envelope", "subkey has wrong length"));
    }
    let mut subkey = Zeroizing::new([0u8; KEY_SIZE]);
    subkey.copy_from_slice(&subkey_bytes);

    Ok((cipher_from(&subkey)?, data_nonce, header_size))
}

/// Seal a blob under the master key using envelope AEAD.
///
/// Layout: `subkey_nonce(12) || sealed_subkey(48) || data_nonce(12) || sealed_payload`.
pub fn seal(master: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let (mut out, data_cipher, data_nonce) = envelope_header(master)?;
    let sealed = data_cipher
        .encrypt(Nonce::from_slice(&data_nonce), plaintext)
        .map_err(|_| CairnError::corruption("envelope", "payload seal failed"))?;
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open a blob sealed by [`seal`]. Every failure is a hard error; callers
/// never see partially decrypted output.
pub fn open(master: &[u8; KEY_SIZE], buf: &[u8]) -> Result<Vec<u8>> {
    let (data_cipher, data_nonce, header_size) = open_header(master, buf)?;
    data_cipher
        .decrypt(Nonce::from_slice(&data_nonce), &buf[header_size..])
        .map_err(|_| CairnError::corruption("envelope", "payload open failed"))
}

/// Per-frame nonce for the streaming variant: the base data nonce with a
/// little-endian frame counter folded into the trailing bytes, so every
/// frame is sealed under a distinct nonce.
fn frame_nonce(base: &[u8; NONCE_SIZE], counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = *base;
    for (i, byte) in counter.to_le_bytes().iter().enumerate() {
        nonce[NONCE_SIZE - 8 + i] ^= byte;
    }
    nonce
}

/// Fill `buf` from `r`, stopping early only at EOF. Returns bytes read.
fn read_full(r: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Streaming seal: same envelope header as [`seal`], followed by a sequence
/// of independently sealed fixed-size frames (1 KiB plaintext each, the
/// final frame may be shorter).
pub fn seal_stream(master: &[u8; KEY_SIZE], r: &mut impl Read, w: &mut impl Write) -> Result<u64> {
    let (header, data_cipher, data_nonce) = envelope_header(master)?;
    w.write_all(&header)?;

    let mut plaintext_total = 0u64;
    let mut frame = [0u8; STREAM_FRAME_SIZE];
    let mut counter = 0u64;
    loop {
        let n = read_full(r, &mut frame)?;
        if n == 0 {
            break;
        }
        let nonce = frame_nonce(&data_nonce, counter);
        let sealed = data_cipher
            .encrypt(Nonce::from_slice(&nonce), &frame[..n])
            .map_err(|_| CairnError::corruption("stream", "frame seal failed"))?;
        w.write_all(&sealed)?;
        plaintext_total += n as u64;
        counter += 1;
        if n < STREAM_FRAME_SIZE {
            break;
        }
    }
    Ok(plaintext_total)
}

/// Streaming open, the inverse of [`seal_stream`]. A single bad frame
/// aborts the whole stream.
pub fn open_stream(master: &[u8; KEY_SIZE], r: &mut impl Read, w: &mut impl Write) -> Result<u64> {
    let mut header = [0u8; NONCE_SIZE + SEALED_SUBKEY_SIZE + NONCE_SIZE];
    let n = read_full(r, &mut header)?;
    if n != header.len() {
        return Err(CairnError::corruption("stream", "truncated header"));
    }
    let (data_cipher, data_nonce, _) = open_header(master, &header)?;

    let mut plaintext_total = 0u64;
    let mut frame = [0u8; STREAM_FRAME_SIZE + TAG_SIZE];
    let mut counter = 0u64;
    loop {
        let n = read_full(r, &mut frame)?;
        if n == 0 {
            break;
        }
        if n < TAG_SIZE {
            return Err(CairnError::corruption("stream", "truncated frame"));
        }
        let nonce = frame_nonce(&data_nonce, counter);
        let plaintext = data_cipher
            .decrypt(Nonce::from_slice(&nonce), &frame[..n])
            .map_err(|_| CairnError::corruption("stream", "frame open failed"))?;
        w.write_all(&plaintext)?;
        plaintext_total += plaintext.len() as u64;
        counter += 1;
        if n < frame.len() {
            break;
        }
    }
    Ok(plaintext_total)
}
