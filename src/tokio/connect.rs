//! Candidate resolution and the multi-host fallback loop.

use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::net::{TcpStream, UnixStream, lookup_host};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::opts::{Opts, TargetSessionAttrs};
use crate::tls::TlsConfig;

use super::conn::Conn;
use super::stream::Stream;

/// Where a candidate lives on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

/// One resolved address to try, with the TLS settings of its host entry.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    pub host: String,
    pub port: u16,
    pub target: Target,
    pub tls: Option<TlsConfig>,
}

impl Endpoint {
    /// Open the transport; TCP sockets get `TCP_NODELAY`.
    pub(crate) async fn open(&self) -> Result<Stream> {
        match &self.target {
            Target::Tcp(addr) => {
                let tcp = TcpStream::connect(addr).await?;
                tcp.set_nodelay(true)?;
                Ok(Stream::tcp(tcp))
            }
            Target::Unix(path) => Ok(Stream::unix(UnixStream::connect(path).await?)),
        }
    }
}

/// Socket path of a server listening in directory `dir`.
pub(crate) fn unix_socket_path(dir: &str, port: u16) -> PathBuf {
    PathBuf::from(format!("{}/.s.PGSQL.{}", dir.trim_end_matches('/'), port))
}

/// Resolve every host entry, keeping the order of the connection string.
///
/// A host that fails to resolve is skipped; if none resolves the whole
/// attempt fails.
pub(crate) async fn resolve_candidates(opts: &Opts) -> Result<Vec<Endpoint>> {
    let mut endpoints = Vec::new();
    let mut failures = Vec::new();

    for candidate in opts.candidates() {
        if candidate.host.starts_with('/') {
            endpoints.push(Endpoint {
                target: Target::Unix(unix_socket_path(&candidate.host, candidate.port)),
                host: candidate.host,
                port: candidate.port,
                tls: None,
            });
            continue;
        }
        match lookup_host((candidate.host.as_str(), candidate.port)).await {
            Ok(addrs) => {
                for addr in addrs {
                    endpoints.push(Endpoint {
                        host: candidate.host.clone(),
                        port: candidate.port,
                        target: Target::Tcp(addr),
                        tls: candidate.tls.clone(),
                    });
                }
            }
            Err(e) => {
                debug!("cannot resolve {}:{}: {}", candidate.host, candidate.port, e);
                failures.push(format!("{}: {}", candidate.host, e));
            }
        }
    }

    if endpoints.is_empty() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("hostname resolving error ({})", failures.join("; ")),
        )));
    }
    Ok(endpoints)
}

/// Outcome of checking `target_session_attrs` on a fresh connection.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Accept,
    /// Usable, but only if nothing better turns up.
    NotPreferred,
    Reject(&'static str),
}

async fn validate(conn: &mut Conn, attrs: TargetSessionAttrs) -> Result<Verdict> {
    let verdict = match attrs {
        TargetSessionAttrs::Any => Verdict::Accept,
        TargetSessionAttrs::ReadWrite => {
            if read_only(conn).await? {
                Verdict::Reject("session is read-only")
            } else {
                Verdict::Accept
            }
        }
        TargetSessionAttrs::ReadOnly => {
            if read_only(conn).await? {
                Verdict::Accept
            } else {
                Verdict::Reject("session is not read-only")
            }
        }
        TargetSessionAttrs::Primary => {
            if in_recovery(conn).await? {
                Verdict::Reject("server is in hot standby mode")
            } else {
                Verdict::Accept
            }
        }
        TargetSessionAttrs::Standby => {
            if in_recovery(conn).await? {
                Verdict::Accept
            } else {
                Verdict::Reject("server is not in hot standby mode")
            }
        }
        TargetSessionAttrs::PreferStandby => {
            if in_recovery(conn).await? {
                Verdict::Accept
            } else {
                Verdict::NotPreferred
            }
        }
    };
    Ok(verdict)
}

async fn read_only(conn: &mut Conn) -> Result<bool> {
    let value: Option<(String,)> = conn.query_first("show transaction_read_only", ()).await?;
    Ok(value.is_some_and(|(v,)| v == "on"))
}

async fn in_recovery(conn: &mut Conn) -> Result<bool> {
    let value: Option<(bool,)> = conn.query_first("select pg_is_in_recovery()", ()).await?;
    Ok(value.is_some_and(|(v,)| v))
}

/// Try each endpoint in order until one connects and passes validation.
pub(crate) async fn connect_candidates(opts: &Opts, endpoints: Vec<Endpoint>) -> Result<Conn> {
    let mut last: Option<(String, u16, Error)> = None;
    let mut not_preferred: Option<Endpoint> = None;

    for endpoint in &endpoints {
        debug!(
            "trying {}:{} ({:?}, tls={})",
            endpoint.host,
            endpoint.port,
            endpoint.target,
            endpoint.tls.is_some()
        );
        let attempt = async {
            let stream = endpoint.open().await?;
            let host_opts = opts.for_host(&endpoint.host, endpoint.port);
            let mut conn = Conn::handshake(stream, host_opts, endpoint.clone()).await?;
            let verdict = validate(&mut conn, opts.target_session_attrs).await?;
            Ok::<_, Error>((conn, verdict))
        };
        let error = match attempt.await {
            Ok((conn, Verdict::Accept)) => return Ok(conn),
            Ok((conn, Verdict::NotPreferred)) => {
                if not_preferred.is_none() {
                    not_preferred = Some(endpoint.clone());
                }
                let _ = conn.close().await;
                continue;
            }
            Ok((conn, Verdict::Reject(reason))) => {
                let _ = conn.close().await;
                Error::InvalidUsage(format!(
                    "{} (target_session_attrs={:?})",
                    reason, opts.target_session_attrs
                ))
            }
            Err(e) => e,
        };

        if error.aborts_fallback() {
            return Err(Error::Connect {
                host: endpoint.host.clone(),
                port: endpoint.port,
                source: Box::new(error),
            });
        }
        warn!(
            "connection to {}:{} failed: {}",
            endpoint.host, endpoint.port, error
        );
        last = Some((endpoint.host.clone(), endpoint.port, error));
    }

    if let Some(endpoint) = not_preferred {
        debug!(
            "no standby found, reconnecting to {}:{}",
            endpoint.host, endpoint.port
        );
        let stream = endpoint.open().await?;
        let host_opts = opts.for_host(&endpoint.host, endpoint.port);
        return Conn::handshake(stream, host_opts, endpoint).await;
    }

    let (host, port, source) = last.unwrap_or_else(|| {
        (
            opts.host.clone(),
            opts.port,
            Error::InvalidUsage("no connection candidates".into()),
        )
    });
    Err(Error::Connect {
        host,
        port,
        source: Box::new(source),
    })
}

/// Resolve and connect under `connect_timeout`, which bounds the whole attempt.
pub(crate) async fn connect(opts: Opts) -> Result<Conn> {
    let attempt = async {
        let endpoints = resolve_candidates(&opts).await?;
        connect_candidates(&opts, endpoints).await
    };
    match opts.connect_timeout {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .map_err(|_| Error::Timeout)?,
        None => attempt.await,
    }
}
