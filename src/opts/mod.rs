//! Connection options.
//!
//! Options are assembled in layers, each overriding the previous one:
//! defaults, `PG*` environment variables, the service file section, and
//! finally the settings of the connection string itself.

mod dsn;
mod env;
mod passfile;
mod service;
mod uri;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use no_panic::no_panic;
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::frontend::startup::{PROTOCOL_VERSION_3_0, PROTOCOL_VERSION_3_51};
use crate::tls::{self, TlsConfig};

pub use passfile::passfile_password;
pub use uri::SCHEMES;

/// Raw `key -> value` settings before interpretation.
pub type Settings = BTreeMap<String, String>;

/// Default server port.
pub const DEFAULT_PORT: u16 = 5432;

/// Default host when none is given.
pub const DEFAULT_HOST: &str = "localhost";

/// How TLS is negotiated with each host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Never use TLS
    Disable,
    /// Plain first, then TLS
    Allow,
    /// TLS first, then plain
    #[default]
    Prefer,
    /// TLS without verification (verify-ca when a root certificate is set)
    Require,
    /// TLS, verifying the certificate chain
    VerifyCa,
    /// TLS, verifying the chain and the host name
    VerifyFull,
}

impl SslMode {
    /// Look up a `sslmode` value.
    #[no_panic]
    pub fn from_name(value: &str) -> Option<Self> {
        Some(match value {
            "disable" => SslMode::Disable,
            "allow" => SslMode::Allow,
            "prefer" => SslMode::Prefer,
            "require" => SslMode::Require,
            "verify-ca" => SslMode::VerifyCa,
            "verify-full" => SslMode::VerifyFull,
            _ => return None,
        })
    }

    fn parse(value: &str) -> Result<Self> {
        Self::from_name(value).ok_or_else(|| {
            Error::config(
                &format!("sslmode={value}"),
                "expected disable, allow, prefer, require, verify-ca or verify-full",
            )
        })
    }
}

/// Which servers are acceptable after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetSessionAttrs {
    #[default]
    Any,
    /// `transaction_read_only` is off
    ReadWrite,
    /// `transaction_read_only` is on
    ReadOnly,
    /// Not in recovery
    Primary,
    /// In recovery
    Standby,
    /// A standby if one is reachable, otherwise any server
    PreferStandby,
}

impl TargetSessionAttrs {
    /// Look up a `target_session_attrs` value.
    #[no_panic]
    pub fn from_name(value: &str) -> Option<Self> {
        Some(match value {
            "any" => TargetSessionAttrs::Any,
            "read-write" => TargetSessionAttrs::ReadWrite,
            "read-only" => TargetSessionAttrs::ReadOnly,
            "primary" => TargetSessionAttrs::Primary,
            "standby" => TargetSessionAttrs::Standby,
            "prefer-standby" => TargetSessionAttrs::PreferStandby,
            _ => return None,
        })
    }

    fn parse(value: &str) -> Result<Self> {
        Self::from_name(value).ok_or_else(|| {
            Error::config(
                &format!("target_session_attrs={value}"),
                "expected any, read-write, read-only, primary, standby or prefer-standby",
            )
        })
    }
}

/// A host tried after the primary one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackConfig {
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsConfig>,
}

/// Connection options.
#[derive(Debug, Clone)]
pub struct Opts {
    /// Host name, IP address, or an absolute unix socket directory.
    ///
    /// Default: `"localhost"`
    pub host: String,

    /// Port of the first candidate.
    ///
    /// Default: `5432`
    pub port: u16,

    /// TLS settings of the first candidate; `None` connects in plain text.
    ///
    /// Default: `None`
    pub tls: Option<TlsConfig>,

    /// Further candidates, tried in order when the previous one fails.
    ///
    /// Default: `[]`
    pub fallbacks: Vec<FallbackConfig>,

    /// Username for authentication.
    ///
    /// Default: `""`
    pub user: String,

    /// Password for authentication.
    ///
    /// Default: `None`
    pub password: Option<String>,

    /// Password file consulted per host when no password is set.
    ///
    /// Default: `None`
    pub passfile: Option<PathBuf>,

    /// Database name; the server defaults it to the user name.
    ///
    /// Default: `None`
    pub database: Option<String>,

    /// Application name to report to the server.
    ///
    /// Default: `None`
    pub application_name: Option<String>,

    /// Bound on the whole connection attempt, over all candidates.
    ///
    /// Default: `None`
    pub connect_timeout: Option<Duration>,

    /// Extra startup parameters (`search_path`, `options`, `DateStyle`, ...).
    ///
    /// Default: `{}`
    pub runtime_params: BTreeMap<String, String>,

    /// Default: `TargetSessionAttrs::Any`
    pub target_session_attrs: TargetSessionAttrs,

    /// Initial capacity of the read buffer.
    ///
    /// Default: `8192`
    pub min_read_buffer_size: usize,

    /// COPY data is flushed once this many bytes are buffered (`cp_buffer_size`).
    ///
    /// Default: `65536`
    pub copy_buffer_size: usize,

    /// Send bytea parameters in binary and run unnamed queries in one round trip.
    ///
    /// Default: `false`
    pub binary_parameters: bool,

    /// Request every prepared-statement result column as text.
    ///
    /// Default: `false`
    pub disable_prepared_binary_result: bool,

    /// Kerberos service name.
    ///
    /// Default: `None` (`"postgres"`)
    pub krbsrvname: Option<String>,

    /// Kerberos service principal; overrides `krbsrvname`.
    ///
    /// Default: `None`
    pub krbspn: Option<String>,

    /// Protocol version sent in the startup packet.
    ///
    /// Default: `196659` (openGauss 3.51)
    pub protocol_version: i32,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            host: String::from(DEFAULT_HOST),
            port: DEFAULT_PORT,
            tls: None,
            fallbacks: Vec::new(),
            user: String::new(),
            password: None,
            passfile: None,
            database: None,
            application_name: None,
            connect_timeout: None,
            runtime_params: BTreeMap::new(),
            target_session_attrs: TargetSessionAttrs::Any,
            min_read_buffer_size: 8192,
            copy_buffer_size: 65536,
            binary_parameters: false,
            disable_prepared_binary_result: false,
            krbsrvname: None,
            krbspn: None,
            protocol_version: PROTOCOL_VERSION_3_51,
        }
    }
}

/// Keys interpreted by [`Opts`]; every other key becomes a runtime parameter.
const RECOGNIZED: &[&str] = &[
    "host",
    "port",
    "user",
    "password",
    "dbname",
    "passfile",
    "application_name",
    "connect_timeout",
    "sslmode",
    "sslkey",
    "sslcert",
    "sslrootcert",
    "sslsni",
    "tlsconfig",
    "target_session_attrs",
    "service",
    "servicefile",
    "min_read_buffer_size",
    "cp_buffer_size",
    "binary_parameters",
    "disable_prepared_binary_result",
    "krbsrvname",
    "krbspn",
    "protocol_version",
];

impl Opts {
    /// Parse a URL or DSN, reading `PG*` variables from the process environment.
    pub fn parse(input: &str) -> Result<Self> {
        Self::parse_with_env(input, |var| std::env::var(var).ok())
    }

    /// Parse a URL or DSN with an explicit environment lookup.
    pub fn parse_with_env(input: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let explicit = if uri::is_url(input) {
            uri::parse(input)?
        } else {
            dsn::parse(input)?
        };
        Self::from_layers(env::settings(&lookup), explicit, &lookup)
    }

    fn from_layers(
        mut settings: Settings,
        explicit: Settings,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let service = explicit.get("service").or(settings.get("service")).cloned();
        let service_file = explicit
            .get("servicefile")
            .or(settings.get("servicefile"))
            .cloned();
        if let (Some(service), Some(path)) = (service, service_file) {
            settings.extend(service::lookup(Path::new(&path), &service)?);
        }
        settings.extend(explicit);

        if !settings.contains_key("user")
            && let Some(user) = lookup("USER").filter(|u| !u.is_empty())
        {
            settings.insert("user".into(), user);
        }

        Self::from_settings(&settings)
    }

    /// Options for connecting to one candidate host.
    ///
    /// Without a (non-empty) password, the password file is searched for
    /// `host` and `port`; unix socket directories match as `localhost`.
    pub fn for_host(&self, host: &str, port: u16) -> Opts {
        let mut opts = self.clone();
        if opts.password.as_deref().is_none_or(str::is_empty)
            && let Some(path) = &self.passfile
        {
            let host = if host.starts_with('/') { DEFAULT_HOST } else { host };
            let db = opts.database.as_deref().unwrap_or(&opts.user);
            if let Some(password) = passfile_password(path, host, port, db, &opts.user) {
                opts.password = Some(password);
            }
        }
        opts
    }

    /// Interpret merged settings.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut opts = Opts::default();
        let get = |key: &str| settings.get(key).map(String::as_str);

        if let Some(user) = get("user") {
            opts.user = user.to_string();
        }
        opts.password = get("password").map(str::to_string);
        opts.passfile = get("passfile").filter(|p| !p.is_empty()).map(PathBuf::from);
        opts.database = get("dbname").filter(|d| !d.is_empty()).map(str::to_string);
        opts.application_name = get("application_name").map(str::to_string);

        if let Some(value) = get("connect_timeout") {
            let secs = value.trim().parse::<i64>().map_err(|_| {
                Error::config(&format!("connect_timeout={value}"), "expected an integer")
            })?;
            opts.connect_timeout = (secs > 0).then(|| Duration::from_secs(secs.unsigned_abs()));
        }
        if let Some(value) = get("min_read_buffer_size") {
            opts.min_read_buffer_size = positive("min_read_buffer_size", value)?;
        }
        if let Some(value) = get("cp_buffer_size") {
            opts.copy_buffer_size = positive("cp_buffer_size", value)?;
        }
        if let Some(value) = get("binary_parameters") {
            opts.binary_parameters = boolean("binary_parameters", value)?;
        }
        if let Some(value) = get("disable_prepared_binary_result") {
            opts.disable_prepared_binary_result = boolean("disable_prepared_binary_result", value)?;
        }
        if let Some(value) = get("target_session_attrs") {
            opts.target_session_attrs = TargetSessionAttrs::parse(value)?;
        }
        opts.krbsrvname = get("krbsrvname").map(str::to_string);
        opts.krbspn = get("krbspn").map(str::to_string);
        if let Some(value) = get("protocol_version") {
            opts.protocol_version = match value {
                "3.0" => PROTOCOL_VERSION_3_0,
                "3.51" => PROTOCOL_VERSION_3_51,
                _ => {
                    return Err(Error::config(
                        &format!("protocol_version={value}"),
                        "expected 3.0 or 3.51",
                    ));
                }
            };
        }

        opts.runtime_params = settings
            .iter()
            .filter(|(key, _)| !RECOGNIZED.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let mut candidates = expand_candidates(settings)?.into_iter();
        if let Some(first) = candidates.next() {
            opts.host = first.host;
            opts.port = first.port;
            opts.tls = first.tls;
        }
        opts.fallbacks = candidates.collect();
        Ok(opts)
    }

    /// The first candidate followed by the fallbacks.
    pub fn candidates(&self) -> Vec<FallbackConfig> {
        std::iter::once(FallbackConfig {
            host: self.host.clone(),
            port: self.port,
            tls: self.tls.clone(),
        })
        .chain(self.fallbacks.iter().cloned())
        .collect()
    }
}

fn positive(key: &str, value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::config(
            &format!("{key}={value}"),
            "expected a positive integer",
        )),
    }
}

fn boolean(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "True" | "1" | "yes" | "on" => Ok(true),
        "false" | "False" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::config(&format!("{key}={value}"), "expected a boolean")),
    }
}

fn parse_port(value: &str) -> Result<u16> {
    if value.is_empty() {
        return Ok(DEFAULT_PORT);
    }
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(Error::config(
            &format!("port={value}"),
            "expected a positive integer",
        )),
    }
}

/// One entry per (host, TLS attempt), in connection order.
fn expand_candidates(settings: &Settings) -> Result<Vec<FallbackConfig>> {
    let get = |key: &str| settings.get(key).map(String::as_str);

    let hosts: Vec<&str> = get("host")
        .unwrap_or(DEFAULT_HOST)
        .split(',')
        .map(|h| if h.is_empty() { DEFAULT_HOST } else { h })
        .collect();
    let ports = get("port")
        .unwrap_or("")
        .split(',')
        .map(parse_port)
        .collect::<Result<Vec<u16>>>()?;
    let ports = match ports.len() {
        1 => vec![ports[0]; hosts.len()],
        n if n == hosts.len() => ports,
        _ => {
            return Err(Error::config(
                &format!("host={} port={}", get("host").unwrap_or(""), get("port").unwrap_or("")),
                "host/port count mismatch",
            ));
        }
    };

    let mode = get("sslmode").map(SslMode::parse).transpose()?.unwrap_or_default();
    let registered = get("tlsconfig").map(str::to_string);
    if let Some(name) = &registered {
        tls::check_registered(name)?;
    }
    let root_cert = get("sslrootcert").map(PathBuf::from);
    let mode = match mode {
        SslMode::Require if root_cert.is_some() => SslMode::VerifyCa,
        other => other,
    };

    let mut candidates = Vec::new();
    for (host, port) in hosts.into_iter().zip(ports) {
        let template = TlsConfig {
            root_cert: root_cert.clone(),
            client_cert: get("sslcert").map(PathBuf::from),
            client_key: get("sslkey").map(PathBuf::from),
            sni: get("sslsni") != Some("0"),
            registered: registered.clone(),
            ..TlsConfig::no_verify(host)
        };
        let attempts: Vec<Option<TlsConfig>> = if host.starts_with('/') {
            // unix sockets never negotiate TLS
            vec![None]
        } else {
            match mode {
                SslMode::Disable => vec![None],
                SslMode::Allow => vec![None, Some(template)],
                SslMode::Prefer => vec![Some(template), None],
                SslMode::Require => vec![Some(template)],
                SslMode::VerifyCa => vec![Some(TlsConfig {
                    verify_ca: true,
                    ..template
                })],
                SslMode::VerifyFull => vec![Some(TlsConfig {
                    verify_ca: true,
                    verify_hostname: true,
                    ..template
                })],
            }
        };
        candidates.extend(attempts.into_iter().map(|tls| FallbackConfig {
            host: host.to_string(),
            port,
            tls,
        }));
    }
    Ok(candidates)
}

impl TryFrom<&Url> for Opts {
    type Error = Error;

    /// Build options from a parsed single-host URL. Environment variables are not consulted.
    fn try_from(url: &Url) -> Result<Self> {
        if !SCHEMES.contains(&url.scheme()) {
            return Err(Error::config(
                url.scheme(),
                "expected postgres://, postgresql://, opengauss:// or pg://",
            ));
        }
        let mut settings = uri::url_settings(url)?;
        if let Some(host) = url.host_str().filter(|h| !h.is_empty()) {
            settings
                .entry("host".into())
                .or_insert_with(|| host.trim_start_matches('[').trim_end_matches(']').to_string());
        }
        if let Some(port) = url.port() {
            settings.insert("port".into(), port.to_string());
        }
        Self::from_settings(&settings)
    }
}

impl TryFrom<&str> for Opts {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&String> for Opts {
    type Error = Error;

    fn try_from(s: &String) -> Result<Self> {
        Self::parse(s)
    }
}
