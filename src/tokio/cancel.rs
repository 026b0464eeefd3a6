//! Out-of-band query cancellation.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::frontend::{write_cancel_request, write_ssl_request};

use super::conn::Conn;
use super::connect::Endpoint;

/// Handle for cancelling whatever the originating connection is running.
///
/// Owned and `Send`, so it can be moved to another task while the
/// connection is busy.
#[derive(Debug, Clone)]
pub struct CancelToken {
    endpoint: Endpoint,
    /// Process ID and secret key; `None` if the server sent no BackendKeyData.
    key: Option<(u32, u32)>,
}

impl CancelToken {
    /// Host the token connects to.
    pub fn host(&self) -> &str {
        &self.endpoint.host
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    /// Ask the server to cancel the running statement.
    ///
    /// Opens a separate connection (with TLS first if the original one used
    /// it), sends CancelRequest and waits for the server to hang up. Success
    /// only means the request was delivered.
    pub async fn cancel(&self) -> Result<()> {
        let (pid, secret_key) = self.key.ok_or_else(|| {
            Error::InvalidUsage("server did not send a cancellation key".into())
        })?;

        let mut stream = self.endpoint.open().await?;
        let mut buf = Vec::new();
        if let Some(tls) = &self.endpoint.tls {
            write_ssl_request(&mut buf);
            stream.write_all(&buf).await?;
            stream.flush().await?;
            match stream.read_u8().await? {
                b'S' => stream = stream.upgrade_to_tls(tls).await?,
                b'N' => return Err(Error::TlsRefused),
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected SSL response '{}'",
                        char::from(other)
                    )));
                }
            }
            buf.clear();
        }

        write_cancel_request(&mut buf, pid, secret_key);
        stream.write_all(&buf).await?;
        stream.flush().await?;
        stream.read_to_eof().await?;
        debug!("cancel request for backend {} delivered", pid);
        Ok(())
    }
}

impl Conn {
    /// Token that cancels statements running on this connection.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            endpoint: self.endpoint.clone(),
            key: self
                .backend_key()
                .map(|key| (key.process_id(), key.secret())),
        }
    }

    /// Run `f`, sending a cancel request if `token` fires first.
    ///
    /// The operation is always awaited to the end so the connection stays
    /// in sync; its own result is returned. A statement the server
    /// interrupted fails with SQLSTATE 57014.
    ///
    /// ```no_run
    /// # async fn demo(conn: &mut zero_gauss::tokio::Conn) -> zero_gauss::Result<()> {
    /// use tokio_util::sync::CancellationToken;
    ///
    /// let token = CancellationToken::new();
    /// let timer = token.clone();
    /// tokio::spawn(async move {
    ///     tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    ///     timer.cancel();
    /// });
    /// let result = conn
    ///     .with_cancellation(token, async |conn| conn.query_drop("select pg_sleep(10)", ()).await)
    ///     .await;
    /// # let _ = result;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_cancellation<R>(
        &mut self,
        token: CancellationToken,
        f: impl AsyncFnOnce(&mut Conn) -> Result<R>,
    ) -> Result<R> {
        let cancel = self.cancel_token();
        let operation = f(self);
        tokio::pin!(operation);

        tokio::select! {
            biased;
            result = &mut operation => result,
            () = token.cancelled() => {
                tokio::spawn(async move {
                    if let Err(e) = cancel.cancel().await {
                        warn!("cancel request failed: {}", e);
                    }
                });
                operation.await
            }
        }
    }
}
