//! Pluggable GSSAPI (Kerberos) authentication.
//!
//! The crate does not link a GSSAPI library. Applications that need
//! Kerberos register a [`GssProvider`] once at startup; connections that
//! receive an AuthenticationGSS request ask it for a fresh [`GssClient`].

use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Service principal to request a ticket for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GssTarget<'a> {
    /// Full SPN from `krbspn`.
    Spn(&'a str),
    /// Host-based service: `<service>@<host>` (`krbsrvname`, default `postgres`).
    Service { host: &'a str, service: &'a str },
}

/// One GSSAPI security context.
pub trait GssClient: Send {
    /// First token sent to the server.
    fn init_token(&mut self, target: GssTarget<'_>) -> Result<Vec<u8>>;

    /// Consume a server token. Returns whether the context is complete and
    /// the token to send back, which is sent only while not complete.
    fn continue_token(&mut self, server_token: &[u8]) -> Result<(bool, Vec<u8>)>;
}

/// Creates [`GssClient`]s.
pub trait GssProvider: Send + Sync {
    fn new_client(&self) -> Result<Box<dyn GssClient>>;
}

static PROVIDER: RwLock<Option<Arc<dyn GssProvider>>> = RwLock::new(None);

/// Install the process-wide provider, replacing any previous one.
pub fn register_gss_provider(provider: Arc<dyn GssProvider>) {
    *PROVIDER.write().unwrap_or_else(|e| e.into_inner()) = Some(provider);
}

pub fn deregister_gss_provider() {
    *PROVIDER.write().unwrap_or_else(|e| e.into_inner()) = None;
}

pub(crate) fn new_client() -> Result<Box<dyn GssClient>> {
    let provider = PROVIDER
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .ok_or_else(|| Error::Auth("no GSSAPI provider registered".into()))?;
    provider.new_client()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Tests touching the global provider hold this lock.
    pub(crate) static PROVIDER_LOCK: Mutex<()> = Mutex::new(());

    /// Sends the target as the first token, then `rounds - 1` echo tokens.
    pub(crate) struct EchoProvider {
        pub(crate) rounds: usize,
    }

    struct EchoClient {
        remaining: usize,
    }

    impl GssClient for EchoClient {
        fn init_token(&mut self, target: GssTarget<'_>) -> Result<Vec<u8>> {
            self.remaining = self.remaining.saturating_sub(1);
            Ok(match target {
                GssTarget::Spn(spn) => spn.as_bytes().to_vec(),
                GssTarget::Service { host, service } => format!("{service}@{host}").into_bytes(),
            })
        }

        fn continue_token(&mut self, server_token: &[u8]) -> Result<(bool, Vec<u8>)> {
            if self.remaining == 0 {
                return Ok((true, Vec::new()));
            }
            self.remaining -= 1;
            Ok((false, server_token.to_vec()))
        }
    }

    impl GssProvider for EchoProvider {
        fn new_client(&self) -> Result<Box<dyn GssClient>> {
            Ok(Box::new(EchoClient {
                remaining: self.rounds,
            }))
        }
    }

    #[test]
    fn test_provider_registration() {
        let _guard = PROVIDER_LOCK.lock().unwrap();
        deregister_gss_provider();
        assert!(matches!(new_client(), Err(Error::Auth(_))));

        register_gss_provider(Arc::new(EchoProvider { rounds: 1 }));
        let mut client = new_client().unwrap();
        let token = client
            .init_token(GssTarget::Service {
                host: "db",
                service: "postgres",
            })
            .unwrap();
        assert_eq!(token, b"postgres@db");
        assert!(client.continue_token(b"x").unwrap().0);
        deregister_gss_provider();
    }
}
