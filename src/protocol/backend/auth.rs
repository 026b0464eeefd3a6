//! Startup-phase backend messages: authentication requests, key data, parameters.

use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{Error, Result};
use crate::protocol::codec::{read_bytes, read_cstr, read_i32, read_u32};
use crate::protocol::types::{TransactionStatus, U32BE};

/// Authentication request codes.
pub mod auth_type {
    pub const OK: i32 = 0;
    pub const CLEARTEXT_PASSWORD: i32 = 3;
    pub const MD5_PASSWORD: i32 = 5;
    pub const GSS: i32 = 7;
    pub const GSS_CONTINUE: i32 = 8;
    /// openGauss: SHA256 family (reuses the code PostgreSQL assigns to SASL)
    pub const SHA256: i32 = 10;
    /// openGauss: md5 over a sha256-derived key
    pub const MD5_SHA256: i32 = 11;
    /// openGauss: SM3 stored key
    pub const SM3: i32 = 13;
}

/// How the server stored the password (first field of SHA256/SM3 requests).
pub mod stored_method {
    pub const PLAIN: i32 = 0;
    pub const MD5: i32 = 1;
    pub const SHA256: i32 = 2;
    pub const SM3: i32 = 3;
}

/// Iteration count used when the server omits it.
pub const DEFAULT_ITERATIONS: u32 = 2048;

/// Authentication request from the server.
#[derive(Debug)]
pub enum AuthenticationMessage<'a> {
    /// Authentication successful
    Ok,
    /// Cleartext password required
    CleartextPassword,
    /// MD5 password required (with 4-byte salt)
    Md5Password { salt: [u8; 4] },
    /// GSS authentication
    Gss,
    /// GSS continue (with server token)
    GssContinue { data: &'a [u8] },
    /// SHA256 family; `body` holds the method-specific challenge
    Sha256 { stored_method: i32, body: &'a [u8] },
    /// md5(sha256) combination
    Md5Sha256 { random64: &'a str, salt: [u8; 4] },
    /// SM3 family; `body` holds the challenge
    Sm3 { stored_method: i32, body: &'a [u8] },
}

impl<'a> AuthenticationMessage<'a> {
    /// Parse an Authentication message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (code, rest) = read_i32(payload)?;

        match code {
            auth_type::OK => Ok(AuthenticationMessage::Ok),
            auth_type::CLEARTEXT_PASSWORD => Ok(AuthenticationMessage::CleartextPassword),
            auth_type::MD5_PASSWORD => Ok(AuthenticationMessage::Md5Password {
                salt: read_salt(rest)?,
            }),
            auth_type::GSS => Ok(AuthenticationMessage::Gss),
            auth_type::GSS_CONTINUE => Ok(AuthenticationMessage::GssContinue { data: rest }),
            auth_type::SHA256 => {
                let (stored_method, body) = read_i32(rest)?;
                Ok(AuthenticationMessage::Sha256 {
                    stored_method,
                    body,
                })
            }
            auth_type::MD5_SHA256 => {
                let (random64, rest) = read_ascii(rest, 64)?;
                Ok(AuthenticationMessage::Md5Sha256 {
                    random64,
                    salt: read_salt(rest)?,
                })
            }
            auth_type::SM3 => {
                let (stored_method, body) = read_i32(rest)?;
                Ok(AuthenticationMessage::Sm3 {
                    stored_method,
                    body,
                })
            }
            _ => Err(Error::Unsupported(format!(
                "unknown authentication response: {}",
                code
            ))),
        }
    }

    /// Short mechanism name for logs.
    pub fn mechanism(&self) -> &'static str {
        match self {
            AuthenticationMessage::Ok => "ok",
            AuthenticationMessage::CleartextPassword => "cleartext",
            AuthenticationMessage::Md5Password { .. } => "md5",
            AuthenticationMessage::Gss | AuthenticationMessage::GssContinue { .. } => "gss",
            AuthenticationMessage::Sha256 { .. } => "sha256",
            AuthenticationMessage::Md5Sha256 { .. } => "md5_sha256",
            AuthenticationMessage::Sm3 { .. } => "sm3",
        }
    }
}

/// Challenge of the RFC5802-style digest: server random, token and iteration count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rfc5802Challenge<'a> {
    /// 32 random bytes, hex encoded
    pub random64: &'a str,
    /// 4 token bytes, hex encoded
    pub token: &'a str,
    /// PBKDF2 iterations
    pub iterations: u32,
}

impl<'a> Rfc5802Challenge<'a> {
    /// Parse the body that follows the stored-method field.
    pub fn parse(body: &'a [u8]) -> Result<Self> {
        let (random64, rest) = read_ascii(body, 64)?;
        let (token, rest) = read_ascii(rest, 8)?;
        // Servers speaking protocol 3.50 stop before the iteration count.
        let iterations = match read_i32(rest) {
            Ok((n, _)) if n > 0 => n as u32,
            Ok((n, _)) => {
                return Err(Error::Protocol(format!("invalid iteration count: {n}")));
            }
            Err(_) => DEFAULT_ITERATIONS,
        };
        Ok(Self {
            random64,
            token,
            iterations,
        })
    }
}

/// Read the 4-byte salt of an md5 challenge.
pub fn read_salt(data: &[u8]) -> Result<[u8; 4]> {
    let (salt, _) = read_bytes(data, 4)?;
    let mut out = [0u8; 4];
    out.copy_from_slice(salt);
    Ok(out)
}

fn read_ascii(data: &[u8], len: usize) -> Result<(&str, &[u8])> {
    let (bytes, rest) = read_bytes(data, len)?;
    let s = simdutf8::compat::from_utf8(bytes)
        .map_err(|e| Error::Protocol(format!("invalid authentication challenge: {e}")))?;
    Ok((s, rest))
}

/// BackendKeyData message: process ID and secret key for cancellation.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct BackendKeyData {
    /// Process ID of the backend
    pub pid: U32BE,
    /// Secret key for cancellation
    pub secret_key: U32BE,
}

impl BackendKeyData {
    /// Parse a BackendKeyData message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<&Self> {
        Self::ref_from_bytes(payload).map_err(|e| Error::Protocol(format!("BackendKeyData: {e:?}")))
    }

    /// Get the process ID.
    pub fn process_id(&self) -> u32 {
        self.pid.get()
    }

    /// Get the secret key.
    pub fn secret(&self) -> u32 {
        self.secret_key.get()
    }
}

/// ParameterStatus message: server parameter name and value.
#[derive(Debug, Clone)]
pub struct ParameterStatus<'a> {
    pub name: &'a str,
    pub value: &'a str,
}

impl<'a> ParameterStatus<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (name, rest) = read_cstr(payload)?;
        let (value, _) = read_cstr(rest)?;
        Ok(Self { name, value })
    }
}

/// ReadyForQuery message.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct ReadyForQuery {
    /// Transaction status byte
    pub status: u8,
}

impl ReadyForQuery {
    pub fn parse(payload: &[u8]) -> Result<&Self> {
        Self::ref_from_bytes(payload).map_err(|e| Error::Protocol(format!("ReadyForQuery: {e:?}")))
    }

    /// Get the transaction status; an unknown byte is a protocol error.
    pub fn transaction_status(&self) -> Result<TransactionStatus> {
        TransactionStatus::from_byte(self.status).ok_or_else(|| {
            Error::Protocol(format!("unknown transaction status {:?}", self.status as char))
        })
    }
}

/// NotificationResponse message from LISTEN/NOTIFY.
#[derive(Debug, Clone)]
pub struct NotificationResponse<'a> {
    /// PID of the notifying backend
    pub pid: u32,
    pub channel: &'a str,
    pub payload: &'a str,
}

impl<'a> NotificationResponse<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (pid, rest) = read_u32(payload)?;
        let (channel, rest) = read_cstr(rest)?;
        let (payload_str, _) = read_cstr(rest)?;
        Ok(Self {
            pid,
            channel,
            payload: payload_str,
        })
    }
}

/// NegotiateProtocolVersion: the server speaks an older minor version.
#[derive(Debug, Clone)]
pub struct NegotiateProtocolVersion {
    /// Newest minor protocol version supported
    pub newest_minor_version: u32,
    /// Number of unrecognized `_pq_` options
    pub unrecognized_options: u32,
}

impl NegotiateProtocolVersion {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (newest_minor_version, rest) = read_u32(payload)?;
        let (unrecognized_options, _) = read_u32(rest)?;
        Ok(Self {
            newest_minor_version,
            unrecognized_options,
        })
    }
}
