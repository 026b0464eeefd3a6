//! Connection startup and authentication state machine.

use tracing::{debug, trace, warn};

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::gss::{self, GssClient, GssTarget};
use crate::opts::Opts;
use crate::protocol::backend::auth::{Rfc5802Challenge, read_salt, stored_method};
use crate::protocol::backend::{
    AuthenticationMessage, BackendKeyData, ErrorResponse, NegotiateProtocolVersion,
    NoticeResponse, ParameterStatus, ReadyForQuery, msg_type, tag,
};
use crate::protocol::frontend::auth::{
    StoredKeyHash, md5_password, md5_sha256_password, rfc5802_proof,
};
use crate::protocol::frontend::{write_gss_response, write_password, write_ssl_request, write_startup};
use crate::protocol::types::TransactionStatus;

use super::action::Action;

const DEFAULT_KRBSRVNAME: &str = "postgres";

/// Connection state during startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initial,
    WaitingSslResponse,
    TlsHandshake,
    WaitingAuth,
    WaitingAuthResult,
    WaitingReady,
    Finished,
}

/// Connection startup state machine.
///
/// Negotiates TLS when asked to, sends the startup packet, answers the
/// authentication request and collects BackendKeyData and ParameterStatus
/// until the first ReadyForQuery. An ErrorResponse at any point is
/// returned as [`Error::Server`].
pub struct ConnectionStateMachine {
    state: ConnectionState,
    opts: Opts,
    host: String,
    use_tls: bool,
    gss: Option<Box<dyn GssClient>>,
    backend_key: Option<BackendKeyData>,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
}

impl ConnectionStateMachine {
    /// `host` names the candidate being connected to; it is the GSSAPI target.
    pub fn new(opts: &Opts, host: &str, use_tls: bool) -> Self {
        Self {
            state: ConnectionState::Initial,
            opts: opts.clone(),
            host: host.to_string(),
            use_tls,
            gss: None,
            backend_key: None,
            server_params: Vec::new(),
            transaction_status: TransactionStatus::Idle,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Backend key data (for cancellation).
    pub fn backend_key(&self) -> Option<&BackendKeyData> {
        self.backend_key.as_ref()
    }

    pub fn take_server_params(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.server_params)
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Advance the handshake.
    ///
    /// After [`Action::WriteAndReadByte`] the byte is expected in
    /// `buffer_set.type_byte`; after [`Action::TlsHandshake`] the caller
    /// upgrades the transport and calls `step()` again.
    pub fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        match self.state {
            ConnectionState::Initial => {
                buffer_set.write_buffer.clear();
                if self.use_tls {
                    write_ssl_request(&mut buffer_set.write_buffer);
                    self.state = ConnectionState::WaitingSslResponse;
                    Ok(Action::WriteAndReadByte)
                } else {
                    self.write_startup_message(&mut buffer_set.write_buffer);
                    self.state = ConnectionState::WaitingAuth;
                    Ok(Action::WriteAndReadMessage)
                }
            }
            ConnectionState::WaitingSslResponse => match buffer_set.type_byte {
                b'S' => {
                    self.state = ConnectionState::TlsHandshake;
                    Ok(Action::TlsHandshake)
                }
                b'N' => Err(Error::TlsRefused),
                other => Err(Error::Protocol(format!(
                    "unexpected SSL response {:?}",
                    other as char
                ))),
            },
            ConnectionState::TlsHandshake => {
                buffer_set.write_buffer.clear();
                self.write_startup_message(&mut buffer_set.write_buffer);
                self.state = ConnectionState::WaitingAuth;
                Ok(Action::WriteAndReadMessage)
            }
            ConnectionState::Finished => {
                Err(Error::Protocol("startup already reached ReadyForQuery".into()))
            }
            _ => self.handle_message(buffer_set),
        }
    }

    fn write_startup_message(&self, buf: &mut Vec<u8>) {
        let opts = &self.opts;
        let mut params: Vec<(&str, &str)> = vec![("user", opts.user.as_str())];
        if let Some(db) = &opts.database {
            params.push(("database", db));
        }
        if let Some(app) = &opts.application_name {
            params.push(("application_name", app));
        }
        if !opts.runtime_params.contains_key("client_encoding") {
            params.push(("client_encoding", "UTF8"));
        }
        params.extend(
            opts.runtime_params
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        write_startup(buf, opts.protocol_version, params);
    }

    fn handle_message(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let type_byte = buffer_set.type_byte;
        let payload = &buffer_set.read_buffer;

        match type_byte {
            msg_type::ERROR_RESPONSE => return Err(ErrorResponse::parse(payload)?.into_error()),
            msg_type::NOTICE_RESPONSE => {
                let notice = NoticeResponse::parse(payload)?;
                debug!("notice during startup: {}", notice.0);
                return Ok(Action::ReadMessage);
            }
            msg_type::NEGOTIATE_PROTOCOL_VERSION => {
                let negotiate = NegotiateProtocolVersion::parse(payload)?;
                warn!(
                    "server supports protocol minor version up to {} ({} options unrecognized)",
                    negotiate.newest_minor_version, negotiate.unrecognized_options
                );
                return Ok(Action::ReadMessage);
            }
            _ => {}
        }

        match (self.state, type_byte) {
            (ConnectionState::WaitingAuth, msg_type::AUTHENTICATION) => self.handle_auth(buffer_set),
            (ConnectionState::WaitingAuthResult, msg_type::AUTHENTICATION) => {
                match AuthenticationMessage::parse(payload)? {
                    AuthenticationMessage::Ok => {
                        self.state = ConnectionState::WaitingReady;
                        Ok(Action::ReadMessage)
                    }
                    _ => Err(Error::Auth("unexpected authentication response".into())),
                }
            }
            (ConnectionState::WaitingReady, msg_type::BACKEND_KEY_DATA) => {
                self.backend_key = Some(*BackendKeyData::parse(payload)?);
                Ok(Action::ReadMessage)
            }
            (ConnectionState::WaitingReady, msg_type::PARAMETER_STATUS) => {
                let param = ParameterStatus::parse(payload)?;
                match self.server_params.iter_mut().find(|(n, _)| n == param.name) {
                    Some(entry) => entry.1 = param.value.to_string(),
                    None => self
                        .server_params
                        .push((param.name.to_string(), param.value.to_string())),
                }
                Ok(Action::ReadMessage)
            }
            (ConnectionState::WaitingReady, msg_type::READY_FOR_QUERY) => {
                self.transaction_status = ReadyForQuery::parse(payload)?.transaction_status()?;
                self.state = ConnectionState::Finished;
                Ok(Action::Finished)
            }
            (state, other) => Err(Error::Protocol(format!(
                "unexpected message '{}' during startup ({:?})",
                tag(other),
                state
            ))),
        }
    }

    fn password(&self) -> Result<&str> {
        self.opts
            .password
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                Error::Auth(
                    "server requested password-based authentication, but no password was provided"
                        .into(),
                )
            })
    }

    fn handle_auth(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let auth = AuthenticationMessage::parse(&buffer_set.read_buffer)?;
        trace!(mechanism = auth.mechanism(), "authentication requested");
        let out = &mut buffer_set.write_buffer;
        out.clear();

        let response = match auth {
            AuthenticationMessage::Ok => {
                self.state = ConnectionState::WaitingReady;
                return Ok(Action::ReadMessage);
            }
            AuthenticationMessage::CleartextPassword => self.password()?.to_string(),
            AuthenticationMessage::Md5Password { salt } => {
                md5_password(&self.opts.user, self.password()?, &salt)
            }
            AuthenticationMessage::Gss => {
                let mut client = gss::new_client()?;
                let target = match &self.opts.krbspn {
                    Some(spn) => GssTarget::Spn(spn),
                    None => GssTarget::Service {
                        host: &self.host,
                        service: self.opts.krbsrvname.as_deref().unwrap_or(DEFAULT_KRBSRVNAME),
                    },
                };
                let token = client.init_token(target)?;
                self.gss = Some(client);
                write_gss_response(out, &token);
                return Ok(Action::WriteAndReadMessage);
            }
            AuthenticationMessage::GssContinue { data } => {
                let client = self
                    .gss
                    .as_mut()
                    .ok_or_else(|| Error::Protocol("GSS continue without GSS start".into()))?;
                let (done, token) = client.continue_token(data)?;
                if done {
                    return Ok(Action::ReadMessage);
                }
                write_gss_response(out, &token);
                return Ok(Action::WriteAndReadMessage);
            }
            AuthenticationMessage::Sha256 { stored_method, body } => match stored_method {
                stored_method::PLAIN | stored_method::SHA256 => {
                    let challenge = Rfc5802Challenge::parse(body)?;
                    rfc5802_proof(
                        self.password()?,
                        challenge.random64,
                        challenge.token,
                        None,
                        challenge.iterations,
                        StoredKeyHash::Sha256,
                    )?
                }
                stored_method::MD5 => {
                    let salt = read_salt(body)?;
                    md5_password(&self.opts.user, self.password()?, &salt)
                }
                _ => {
                    return Err(Error::Auth(
                        "password-stored method not supported, must be plain, md5 or sha256".into(),
                    ));
                }
            },
            AuthenticationMessage::Md5Sha256 { random64, salt } => {
                md5_sha256_password(self.password()?, random64, &salt)?
            }
            AuthenticationMessage::Sm3 { stored_method, body } => {
                if stored_method != stored_method::SM3 {
                    return Err(Error::Auth(
                        "password-stored method not supported, must be sm3".into(),
                    ));
                }
                let challenge = Rfc5802Challenge::parse(body)?;
                rfc5802_proof(
                    self.password()?,
                    challenge.random64,
                    challenge.token,
                    None,
                    challenge.iterations,
                    StoredKeyHash::Sm3,
                )?
            }
        };

        write_password(out, &response);
        self.state = ConnectionState::WaitingAuthResult;
        Ok(Action::WriteAndReadMessage)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::gss::tests::{EchoProvider, PROVIDER_LOCK};
    use crate::protocol::backend::auth::auth_type;

    const RANDOM64: &str = "a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c6d7e8f90";

    fn opts(password: Option<&str>) -> Opts {
        Opts {
            user: "gauss".into(),
            password: password.map(str::to_string),
            database: Some("app".into()),
            ..Opts::default()
        }
    }

    fn auth(code: i32, rest: &[u8]) -> Vec<u8> {
        let mut payload = code.to_be_bytes().to_vec();
        payload.extend_from_slice(rest);
        payload
    }

    fn challenge(method: i32) -> Vec<u8> {
        let mut rest = method.to_be_bytes().to_vec();
        rest.extend_from_slice(RANDOM64.as_bytes());
        rest.extend_from_slice(b"0badcafe");
        rest.extend_from_slice(&2048_i32.to_be_bytes());
        rest
    }

    fn started(opts: &Opts) -> (ConnectionStateMachine, BufferSet) {
        let mut bs = BufferSet::new();
        let mut sm = ConnectionStateMachine::new(opts, "localhost", false);
        assert!(matches!(sm.step(&mut bs).unwrap(), Action::WriteAndReadMessage));
        (sm, bs)
    }

    fn step_with(sm: &mut ConnectionStateMachine, bs: &mut BufferSet, type_byte: u8, payload: &[u8]) -> Result<Action> {
        bs.load(type_byte, payload);
        sm.step(bs)
    }

    /// Password message body without the trailing NUL.
    fn sent_password(bs: &BufferSet) -> &str {
        assert_eq!(bs.write_buffer[0], b'p');
        std::str::from_utf8(&bs.write_buffer[5..bs.write_buffer.len() - 1]).unwrap()
    }

    fn finish(sm: &mut ConnectionStateMachine, bs: &mut BufferSet) {
        assert!(matches!(step_with(sm, bs, b'R', &auth(auth_type::OK, b"")).unwrap(), Action::ReadMessage));
        let mut key = 42_u32.to_be_bytes().to_vec();
        key.extend_from_slice(&7_u32.to_be_bytes());
        step_with(sm, bs, b'K', &key).unwrap();
        step_with(sm, bs, b'S', b"server_version\x009.2.4\0").unwrap();
        assert!(matches!(step_with(sm, bs, b'Z', b"I").unwrap(), Action::Finished));
    }

    #[test]
    fn test_startup_packet() {
        let mut o = opts(None);
        o.runtime_params.insert("search_path".into(), "s1".into());
        let (_, bs) = started(&o);
        let packet = &bs.write_buffer;
        assert_eq!(&packet[4..8], &196659_i32.to_be_bytes());
        let body = String::from_utf8_lossy(&packet[8..]).to_string();
        assert!(body.starts_with("user\0gauss\0database\0app\0"));
        assert!(body.contains("client_encoding\0UTF8\0"));
        assert!(body.contains("search_path\0s1\0"));
    }

    #[test]
    fn test_client_encoding_override() {
        let mut o = opts(None);
        o.runtime_params.insert("client_encoding".into(), "GBK".into());
        let (_, bs) = started(&o);
        let body = String::from_utf8_lossy(&bs.write_buffer[8..]).to_string();
        assert!(!body.contains("UTF8"));
        assert!(body.contains("client_encoding\0GBK\0"));
    }

    #[test]
    fn test_trust_auth() {
        let (mut sm, mut bs) = started(&opts(None));
        finish(&mut sm, &mut bs);
        assert_eq!(sm.backend_key().unwrap().process_id(), 42);
        assert_eq!(sm.backend_key().unwrap().secret(), 7);
        assert_eq!(
            sm.take_server_params(),
            vec![("server_version".to_string(), "9.2.4".to_string())]
        );
        assert_eq!(sm.state(), ConnectionState::Finished);
    }

    #[test]
    fn test_md5() {
        let (mut sm, mut bs) = started(&opts(Some("secret")));
        let action = step_with(&mut sm, &mut bs, b'R', &auth(auth_type::MD5_PASSWORD, &[1, 2, 3, 4])).unwrap();
        assert!(matches!(action, Action::WriteAndReadMessage));
        assert_eq!(sent_password(&bs), md5_password("gauss", "secret", &[1, 2, 3, 4]));
        finish(&mut sm, &mut bs);
    }

    #[test]
    fn test_sha256() {
        let (mut sm, mut bs) = started(&opts(Some("secret")));
        step_with(&mut sm, &mut bs, b'R', &auth(auth_type::SHA256, &challenge(stored_method::SHA256))).unwrap();
        let expected = rfc5802_proof("secret", RANDOM64, "0badcafe", None, 2048, StoredKeyHash::Sha256).unwrap();
        assert_eq!(sent_password(&bs), expected);
        assert_eq!(expected.len(), 64);
        finish(&mut sm, &mut bs);
    }

    #[test]
    fn test_sha256_with_md5_stored_method() {
        let (mut sm, mut bs) = started(&opts(Some("secret")));
        let mut rest = stored_method::MD5.to_be_bytes().to_vec();
        rest.extend_from_slice(&[9, 9, 9, 9]);
        step_with(&mut sm, &mut bs, b'R', &auth(auth_type::SHA256, &rest)).unwrap();
        assert_eq!(sent_password(&bs), md5_password("gauss", "secret", &[9, 9, 9, 9]));
    }

    #[test]
    fn test_sm3() {
        let (mut sm, mut bs) = started(&opts(Some("secret")));
        step_with(&mut sm, &mut bs, b'R', &auth(auth_type::SM3, &challenge(stored_method::SM3))).unwrap();
        let expected = rfc5802_proof("secret", RANDOM64, "0badcafe", None, 2048, StoredKeyHash::Sm3).unwrap();
        assert_eq!(sent_password(&bs), expected);

        let (mut sm, mut bs) = started(&opts(Some("secret")));
        let err = step_with(&mut sm, &mut bs, b'R', &auth(auth_type::SM3, &challenge(stored_method::SHA256))).unwrap_err();
        assert!(err.to_string().contains("must be sm3"));
    }

    #[test]
    fn test_unsupported_stored_method() {
        let (mut sm, mut bs) = started(&opts(Some("secret")));
        let err = step_with(&mut sm, &mut bs, b'R', &auth(auth_type::SHA256, &challenge(stored_method::SM3))).unwrap_err();
        assert!(err.to_string().contains("must be plain, md5 or sha256"));
    }

    #[test]
    fn test_md5_sha256() {
        let (mut sm, mut bs) = started(&opts(Some("secret")));
        let mut rest = RANDOM64.as_bytes().to_vec();
        rest.extend_from_slice(&[5, 6, 7, 8]);
        step_with(&mut sm, &mut bs, b'R', &auth(auth_type::MD5_SHA256, &rest)).unwrap();
        let expected = md5_sha256_password("secret", RANDOM64, &[5, 6, 7, 8]).unwrap();
        assert_eq!(sent_password(&bs), expected);
    }

    #[test]
    fn test_missing_password() {
        for o in [opts(None), opts(Some(""))] {
            let (mut sm, mut bs) = started(&o);
            let err = step_with(&mut sm, &mut bs, b'R', &auth(auth_type::CLEARTEXT_PASSWORD, b"")).unwrap_err();
            assert!(matches!(err, Error::Auth(_)));
        }
    }

    #[test]
    fn test_unexpected_auth_result() {
        let (mut sm, mut bs) = started(&opts(Some("secret")));
        step_with(&mut sm, &mut bs, b'R', &auth(auth_type::CLEARTEXT_PASSWORD, b"")).unwrap();
        assert_eq!(sent_password(&bs), "secret");
        let err = step_with(&mut sm, &mut bs, b'R', &auth(auth_type::CLEARTEXT_PASSWORD, b"")).unwrap_err();
        assert_eq!(err.to_string(), "authentication failed: unexpected authentication response");
    }

    #[test]
    fn test_server_error() {
        let (mut sm, mut bs) = started(&opts(Some("secret")));
        let err = step_with(&mut sm, &mut bs, b'E', b"SFATAL\0C28P01\0Minvalid password\0\0").unwrap_err();
        assert!(err.aborts_fallback());
    }

    #[test]
    fn test_notice_and_negotiate_are_skipped() {
        let (mut sm, mut bs) = started(&opts(None));
        let action = step_with(&mut sm, &mut bs, b'N', b"SNOTICE\0Mhi\0\0").unwrap();
        assert!(matches!(action, Action::ReadMessage));
        let mut negotiate = 0_u32.to_be_bytes().to_vec();
        negotiate.extend_from_slice(&0_u32.to_be_bytes());
        let action = step_with(&mut sm, &mut bs, b'v', &negotiate).unwrap();
        assert!(matches!(action, Action::ReadMessage));
        finish(&mut sm, &mut bs);
    }

    #[test]
    fn test_tls_negotiation() {
        let o = opts(None);
        let mut bs = BufferSet::new();
        let mut sm = ConnectionStateMachine::new(&o, "db", true);
        assert!(matches!(sm.step(&mut bs).unwrap(), Action::WriteAndReadByte));
        assert_eq!(bs.write_buffer.len(), 8);

        bs.type_byte = b'S';
        assert!(matches!(sm.step(&mut bs).unwrap(), Action::TlsHandshake));
        assert!(matches!(sm.step(&mut bs).unwrap(), Action::WriteAndReadMessage));
        assert_eq!(sm.state(), ConnectionState::WaitingAuth);

        let mut sm = ConnectionStateMachine::new(&o, "db", true);
        sm.step(&mut bs).unwrap();
        bs.type_byte = b'N';
        assert!(matches!(sm.step(&mut bs), Err(Error::TlsRefused)));

        let mut sm = ConnectionStateMachine::new(&o, "db", true);
        sm.step(&mut bs).unwrap();
        bs.type_byte = b'E';
        assert!(matches!(sm.step(&mut bs), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_gss() {
        let _guard = PROVIDER_LOCK.lock().unwrap();
        gss::register_gss_provider(Arc::new(EchoProvider { rounds: 2 }));

        let (mut sm, mut bs) = started(&opts(None));
        let action = step_with(&mut sm, &mut bs, b'R', &auth(auth_type::GSS, b"")).unwrap();
        assert!(matches!(action, Action::WriteAndReadMessage));
        assert_eq!(&bs.write_buffer[5..], b"postgres@localhost");

        let action = step_with(&mut sm, &mut bs, b'R', &auth(auth_type::GSS_CONTINUE, b"round2")).unwrap();
        assert!(matches!(action, Action::WriteAndReadMessage));
        assert_eq!(&bs.write_buffer[5..], b"round2");

        let action = step_with(&mut sm, &mut bs, b'R', &auth(auth_type::GSS_CONTINUE, b"last")).unwrap();
        assert!(matches!(action, Action::ReadMessage));
        finish(&mut sm, &mut bs);

        gss::deregister_gss_provider();
        let (mut sm, mut bs) = started(&opts(None));
        let err = step_with(&mut sm, &mut bs, b'R', &auth(auth_type::GSS, b"")).unwrap_err();
        assert!(err.to_string().contains("no GSSAPI provider registered"));
    }
}
