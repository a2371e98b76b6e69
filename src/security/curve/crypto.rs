use crate::error::ZmqError;
use dryoc::classic::crypto_box::{
  crypto_box_beforenm, crypto_box_detached_afternm, crypto_box_keypair, crypto_box_open_detached_afternm,
};
use dryoc::classic::crypto_secretbox::{crypto_secretbox_detached, crypto_secretbox_open_detached};
use rand::rngs::OsRng;
use rand::RngCore;

pub(crate) const KEY_SIZE: usize = 32;
pub(crate) const NONCE_SIZE: usize = 24;
pub(crate) const MAC_SIZE: usize = 16;

/// Generates a fresh X25519 key pair: `(public, secret)`.
pub(crate) fn keypair() -> ([u8; KEY_SIZE], [u8; KEY_SIZE]) {
  crypto_box_keypair()
}

/// Precomputes the shared key for `crypto_box` operations between
/// `public_key` and `secret_key`.
pub(crate) fn precompute(public_key: &[u8; KEY_SIZE], secret_key: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
  crypto_box_beforenm(public_key, secret_key)
}

/// Seals `plaintext` under a precomputed key; output is `mac || ciphertext`.
pub(crate) fn seal_afternm(plaintext: &[u8], nonce: &[u8; NONCE_SIZE], key: &[u8; KEY_SIZE]) -> Vec<u8> {
  let mut ciphertext = vec![0u8; plaintext.len()];
  let mut mac = [0u8; MAC_SIZE];
  crypto_box_detached_afternm(&mut ciphertext, &mut mac, plaintext, nonce, key);

  let mut boxed = Vec::with_capacity(MAC_SIZE + ciphertext.len());
  boxed.extend_from_slice(&mac);
  boxed.extend_from_slice(&ciphertext);
  boxed
}

/// Opens a `mac || ciphertext` box sealed under a precomputed key.
pub(crate) fn open_afternm(
  boxed: &[u8],
  nonce: &[u8; NONCE_SIZE],
  key: &[u8; KEY_SIZE],
) -> Result<Vec<u8>, ZmqError> {
  if boxed.len() < MAC_SIZE {
    return Err(ZmqError::EncryptionError("Box shorter than its MAC".into()));
  }
  let mac: [u8; MAC_SIZE] = boxed[..MAC_SIZE].try_into().unwrap();
  let ciphertext = &boxed[MAC_SIZE..];
  let mut plaintext = vec![0u8; ciphertext.len()];
  crypto_box_open_detached_afternm(&mut plaintext, &mac, ciphertext, nonce, key)
    .map_err(|_| ZmqError::EncryptionError("crypto_box open failed".into()))?;
  Ok(plaintext)
}

/// Seals `plaintext` from `secret_key` to `public_key`.
pub(crate) fn seal(
  plaintext: &[u8],
  nonce: &[u8; NONCE_SIZE],
  public_key: &[u8; KEY_SIZE],
  secret_key: &[u8; KEY_SIZE],
) -> Vec<u8> {
  seal_afternm(plaintext, nonce, &precompute(public_key, secret_key))
}

/// Opens a box sealed from `public_key` to `secret_key`.
pub(crate) fn open(
  boxed: &[u8],
  nonce: &[u8; NONCE_SIZE],
  public_key: &[u8; KEY_SIZE],
  secret_key: &[u8; KEY_SIZE],
) -> Result<Vec<u8>, ZmqError> {
  open_afternm(boxed, nonce, &precompute(public_key, secret_key))
}

/// Seals under a symmetric key; output is `mac || ciphertext`.
pub(crate) fn secretbox_seal(plaintext: &[u8], nonce: &[u8; NONCE_SIZE], key: &[u8; KEY_SIZE]) -> Vec<u8> {
  let mut ciphertext = vec![0u8; plaintext.len()];
  let mut mac = [0u8; MAC_SIZE];
  crypto_secretbox_detached(&mut ciphertext, &mut mac, plaintext, nonce, key);

  let mut boxed = Vec::with_capacity(MAC_SIZE + ciphertext.len());
  boxed.extend_from_slice(&mac);
  boxed.extend_from_slice(&ciphertext);
  boxed
}

/// Opens a symmetric `mac || ciphertext` box.
pub(crate) fn secretbox_open(
  boxed: &[u8],
  nonce: &[u8; NONCE_SIZE],
  key: &[u8; KEY_SIZE],
) -> Result<Vec<u8>, ZmqError> {
  if boxed.len() < MAC_SIZE {
    return Err(ZmqError::EncryptionError("Box shorter than its MAC".into()));
  }
  let mac: [u8; MAC_SIZE] = boxed[..MAC_SIZE].try_into().unwrap();
  let ciphertext = &boxed[MAC_SIZE..];
  let mut plaintext = vec![0u8; ciphertext.len()];
  crypto_secretbox_open_detached(&mut plaintext, &mac, ciphertext, nonce, key)
    .map_err(|_| ZmqError::EncryptionError("crypto_secretbox open failed".into()))?;
  Ok(plaintext)
}

/// Fills an array with cryptographically secure random bytes.
pub(crate) fn random<const N: usize>() -> [u8; N] {
  let mut buf = [0u8; N];
  OsRng.fill_bytes(&mut buf);
  buf
}

/// Nonce with a 16-byte ASCII prefix and an 8-byte big-endian counter tail.
pub(crate) fn counter_nonce(prefix: &[u8; 16], tail: &[u8; 8]) -> [u8; NONCE_SIZE] {
  let mut nonce = [0u8; NONCE_SIZE];
  nonce[..16].copy_from_slice(prefix);
  nonce[16..].copy_from_slice(tail);
  nonce
}

/// Nonce with an 8-byte ASCII prefix and a 16-byte random tail.
pub(crate) fn random_nonce(prefix: &[u8; 8], tail: &[u8; 16]) -> [u8; NONCE_SIZE] {
  let mut nonce = [0u8; NONCE_SIZE];
  nonce[..8].copy_from_slice(prefix);
  nonce[8..].copy_from_slice(tail);
  nonce
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn box_round_trip() {
    let (server_pk, server_sk) = keypair();
    let (client_pk, client_sk) = keypair();
    let nonce = counter_nonce(b"CurveZMQHELLO---", &1u64.to_be_bytes());

    let boxed = seal(b"attack at dawn", &nonce, &server_pk, &client_sk);
    assert_eq!(boxed.len(), MAC_SIZE + 14);
    let opened = open(&boxed, &nonce, &client_pk, &server_sk).unwrap();
    assert_eq!(opened, b"attack at dawn");
  }

  #[test]
  fn tampered_box_fails_to_open() {
    let (pk, sk) = keypair();
    let (peer_pk, peer_sk) = keypair();
    let nonce = counter_nonce(b"CurveZMQMESSAGES", &2u64.to_be_bytes());

    let mut boxed = seal(b"payload", &nonce, &peer_pk, &sk);
    boxed[MAC_SIZE] ^= 0x01;
    assert!(open(&boxed, &nonce, &pk, &peer_sk).is_err());
  }

  #[test]
  fn precomputed_matches_direct() {
    let (pk_a, sk_a) = keypair();
    let (pk_b, sk_b) = keypair();
    let nonce = counter_nonce(b"CurveZMQREADY---", &1u64.to_be_bytes());

    let boxed = seal_afternm(b"metadata", &nonce, &precompute(&pk_b, &sk_a));
    let opened = open_afternm(&boxed, &nonce, &precompute(&pk_a, &sk_b)).unwrap();
    assert_eq!(opened, b"metadata");
  }

  #[test]
  fn secretbox_round_trip() {
    let key = random::<KEY_SIZE>();
    let nonce = random_nonce(b"COOKIE--", &random::<16>());

    let boxed = secretbox_seal(&[0x42; 64], &nonce, &key);
    assert_eq!(boxed.len(), MAC_SIZE + 64);
    assert_eq!(secretbox_open(&boxed, &nonce, &key).unwrap(), vec![0x42; 64]);

    let wrong_key = random::<KEY_SIZE>();
    assert!(secretbox_open(&boxed, &nonce, &wrong_key).is_err());
  }

  #[test]
  fn nonce_layout() {
    let nonce = counter_nonce(b"CurveZMQMESSAGEC", &3u64.to_be_bytes());
    assert_eq!(&nonce[..16], b"CurveZMQMESSAGEC");
    assert_eq!(&nonce[16..], &[0, 0, 0, 0, 0, 0, 0, 3]);
  }
}
