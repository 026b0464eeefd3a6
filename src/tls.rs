//! TLS settings for one connection candidate, and the named connector registry.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// TLS settings of a single candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    /// Host name presented for SNI and hostname verification.
    pub server_name: String,

    /// Verify the certificate chain.
    pub verify_ca: bool,

    /// Verify that the certificate matches `server_name`.
    pub verify_hostname: bool,

    /// Send the server name in the ClientHello (`sslsni`).
    pub sni: bool,

    /// PEM root certificate (`sslrootcert`).
    pub root_cert: Option<PathBuf>,

    /// PEM client certificate (`sslcert`).
    pub client_cert: Option<PathBuf>,

    /// PKCS#8 PEM client key (`sslkey`).
    pub client_key: Option<PathBuf>,

    /// Name of a connector from [`register_tls_connector`]; overrides every
    /// other field except `server_name`.
    pub registered: Option<String>,
}

impl TlsConfig {
    /// Encrypt without checking the certificate (`require`, `prefer`, `allow`).
    pub fn no_verify(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            verify_ca: false,
            verify_hostname: false,
            sni: true,
            root_cert: None,
            client_cert: None,
            client_key: None,
            registered: None,
        }
    }
}

#[cfg(feature = "tls")]
mod registry {
    use std::collections::BTreeMap;
    use std::sync::RwLock;

    use native_tls::{Certificate, Identity, TlsConnector};

    use super::TlsConfig;
    use crate::error::{Error, Result};

    static REGISTRY: RwLock<BTreeMap<String, TlsConnector>> = RwLock::new(BTreeMap::new());

    /// Register a connector under `name` for use with `tlsconfig=<name>`.
    ///
    /// Registering an existing name replaces it.
    pub fn register_tls_connector(name: &str, connector: TlsConnector) {
        let mut map = REGISTRY.write().unwrap_or_else(|e| e.into_inner());
        map.insert(name.to_string(), connector);
    }

    /// Remove a registered connector. Unknown names are ignored.
    pub fn deregister_tls_connector(name: &str) {
        let mut map = REGISTRY.write().unwrap_or_else(|e| e.into_inner());
        map.remove(name);
    }

    pub fn registered_tls_connector(name: &str) -> Option<TlsConnector> {
        let map = REGISTRY.read().unwrap_or_else(|e| e.into_inner());
        map.get(name).cloned()
    }

    pub(crate) fn is_registered(name: &str) -> bool {
        let map = REGISTRY.read().unwrap_or_else(|e| e.into_inner());
        map.contains_key(name)
    }

    impl TlsConfig {
        /// Build the connector for this candidate.
        pub fn connector(&self) -> Result<TlsConnector> {
            if let Some(name) = &self.registered {
                return registered_tls_connector(name)
                    .ok_or_else(|| Error::config(name, "no TLS connector registered under this name"));
            }

            let mut builder = TlsConnector::builder();
            builder.danger_accept_invalid_certs(!self.verify_ca);
            builder.danger_accept_invalid_hostnames(!self.verify_hostname);
            builder.use_sni(self.sni);

            if let Some(path) = &self.root_cert {
                let pem = std::fs::read(path)?;
                builder.add_root_certificate(Certificate::from_pem(&pem)?);
            }
            match (&self.client_cert, &self.client_key) {
                (Some(cert), Some(key)) => {
                    let cert = std::fs::read(cert)?;
                    let key = std::fs::read(key)?;
                    builder.identity(Identity::from_pkcs8(&cert, &key)?);
                }
                (None, None) => {}
                _ => {
                    return Err(Error::InvalidUsage(
                        "sslcert and sslkey must be given together".into(),
                    ));
                }
            }
            Ok(builder.build()?)
        }
    }
}

#[cfg(feature = "tls")]
pub use registry::{deregister_tls_connector, register_tls_connector, registered_tls_connector};

#[cfg(feature = "tls")]
pub(crate) use registry::is_registered;

#[cfg(not(feature = "tls"))]
pub(crate) fn is_registered(_name: &str) -> bool {
    false
}

/// Fail a TLS candidate when TLS support is compiled out.
#[cfg(not(feature = "tls"))]
pub(crate) fn unsupported() -> Error {
    Error::Unsupported("TLS support is disabled (enable the `tls` feature)".into())
}

/// Validate a TLS config that names a registered connector.
pub(crate) fn check_registered(name: &str) -> Result<()> {
    if is_registered(name) {
        Ok(())
    } else {
        Err(Error::config(
            &format!("tlsconfig={name}"),
            "no TLS connector registered under this name",
        ))
    }
}
