//! Password messages and the digests the server asks for.


use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::Sha256;
use sm3::Sm3;

use crate::error::{Error, Result};
use crate::protocol::codec::MessageBuilder;

type HmacSha256 = Hmac<Sha256>;

const DERIVED_KEY_LEN: usize = 32;
const MD5_SHA256_ITERATIONS: u32 = 2048;

// "Sever" is the server's spelling.
const SERVER_KEY_LABEL: &[u8] = b"Sever Key";
const CLIENT_KEY_LABEL: &[u8] = b"Client Key";

/// Hash applied to the client key to get the stored key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredKeyHash {
    Sha256,
    Sm3,
}

/// Write a PasswordMessage (cleartext, md5 or digest response).
pub fn write_password(buf: &mut Vec<u8>, password: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_cstr(password);
    msg.finish();
}

/// Write a PasswordMessage carrying raw bytes (GSS tokens).
pub fn write_gss_response(buf: &mut Vec<u8>, token: &[u8]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_bytes(token);
    msg.finish();
}

/// `"md5" + md5(md5(password + username) + salt)`
pub fn md5_password(username: &str, password: &str, salt: &[u8; 4]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(username.as_bytes());
    let inner = format!("{:x}", hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    format!("md5{:x}", hasher.finalize())
}

/// RFC5802-style proof for the SHA256 and SM3 mechanisms, as 64 lowercase hex digits.
///
/// When `server_signature` is given it must match the signature derived
/// from the password, otherwise the password is rejected locally.
pub fn rfc5802_proof(
    password: &str,
    random64: &str,
    token: &str,
    server_signature: Option<&str>,
    iterations: u32,
    hash: StoredKeyHash,
) -> Result<String> {
    let salt = hex_decode(random64)?;
    let token = hex_decode(token)?;
    let (server_key, client_key) = derive_keys(password, &salt, iterations)?;

    if let Some(expected) = server_signature {
        let signature = hmac_sha256(&server_key, &token)?;
        if !hex::encode(signature).eq_ignore_ascii_case(expected) {
            return Err(Error::Auth("invalid username/password, login denied".into()));
        }
    }

    let stored_key: [u8; 32] = match hash {
        StoredKeyHash::Sha256 => Sha256::digest(client_key).into(),
        StoredKeyHash::Sm3 => Sm3::digest(client_key).into(),
    };
    let mut proof = hmac_sha256(&stored_key, &token)?;
    for (p, k) in proof.iter_mut().zip(client_key.iter()) {
        *p ^= k;
    }
    Ok(hex::encode(proof))
}

/// Digest for the md5(sha256) mechanism, prefixed with `md5`.
pub fn md5_sha256_password(password: &str, random64: &str, salt: &[u8; 4]) -> Result<String> {
    let key_salt = hex_decode(random64)?;
    let (server_key, client_key) = derive_keys(password, &key_salt, MD5_SHA256_ITERATIONS)?;
    let stored_key = Sha256::digest(client_key);

    let mut hasher = Md5::new();
    hasher.update(random64.as_bytes());
    hasher.update(hex::encode(server_key).as_bytes());
    hasher.update(format!("{:x}", stored_key).as_bytes());
    hasher.update(salt);
    Ok(format!("md5{:x}", hasher.finalize()))
}

fn derive_keys(
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> Result<([u8; 32], [u8; 32])> {
    let mut key = [0u8; DERIVED_KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha1>(password.as_bytes(), salt, iterations, &mut key);
    let server_key = hmac_sha256(&key, SERVER_KEY_LABEL)?;
    let client_key = hmac_sha256(&key, CLIENT_KEY_LABEL)?;
    Ok((server_key, client_key))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| Error::Auth(format!("HMAC error: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn hex_decode(s: &str) -> Result<Vec<u8>> {
    hex::decode(s).map_err(|e| Error::Auth(format!("invalid hex in challenge {s:?}: {e}")))
}
