//! Async transport: TCP, TLS over TCP, or a unix socket.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

#[cfg(feature = "tls")]
use tokio_native_tls::TlsStream;

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::tls::TlsConfig;

/// Largest message length accepted from the server.
const MAX_MESSAGE_LEN: usize = 1 << 30;

pub enum Stream {
    Tcp(BufReader<TcpStream>),
    #[cfg(feature = "tls")]
    Tls(BufReader<TlsStream<TcpStream>>),
    Unix(BufReader<UnixStream>),
    #[cfg(test)]
    Mock(BufReader<tokio::io::DuplexStream>),
}

macro_rules! each {
    ($self:expr, $s:ident => $body:expr) => {
        match $self {
            Stream::Tcp($s) => $body,
            #[cfg(feature = "tls")]
            Stream::Tls($s) => $body,
            Stream::Unix($s) => $body,
            #[cfg(test)]
            Stream::Mock($s) => $body,
        }
    };
}

impl Stream {
    pub fn tcp(stream: TcpStream) -> Self {
        Self::Tcp(BufReader::new(stream))
    }

    pub fn unix(stream: UnixStream) -> Self {
        Self::Unix(BufReader::new(stream))
    }

    #[cfg(test)]
    pub(crate) fn mock(stream: tokio::io::DuplexStream) -> Self {
        Self::Mock(BufReader::new(stream))
    }

    pub async fn read_u8(&mut self) -> io::Result<u8> {
        each!(self, s => s.read_u8().await)
    }

    /// Read one message into `buffer_set.type_byte` and `buffer_set.read_buffer`.
    pub async fn read_message(&mut self, buffer_set: &mut BufferSet) -> Result<()> {
        read_message(self, buffer_set).await
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        each!(self, s => s.get_mut().write_all(buf).await)
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        each!(self, s => s.get_mut().flush().await)
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        each!(self, s => s.get_mut().shutdown().await)
    }

    /// Wait until the peer closes, discarding anything it sends.
    pub async fn read_to_eof(&mut self) -> io::Result<()> {
        let mut sink = Vec::new();
        let read = each!(self, s => s.read_to_end(&mut sink).await);
        read.map(|_| ())
    }

    /// Run the TLS handshake over a TCP stream.
    ///
    /// The server must not have sent anything past its one-byte answer to
    /// SSLRequest; buffered bytes would otherwise be read as if they had
    /// been encrypted.
    #[cfg(feature = "tls")]
    pub async fn upgrade_to_tls(self, config: &TlsConfig) -> Result<Self> {
        let reader = match self {
            Stream::Tcp(reader) => reader,
            _ => return Err(Error::Protocol("TLS upgrade requires a TCP stream".into())),
        };
        if !reader.buffer().is_empty() {
            return Err(Error::Protocol(
                "server sent unencrypted data after SSL response".into(),
            ));
        }
        let connector = tokio_native_tls::TlsConnector::from(config.connector()?);
        let tls = connector
            .connect(&config.server_name, reader.into_inner())
            .await?;
        Ok(Stream::Tls(BufReader::new(tls)))
    }

    #[cfg(not(feature = "tls"))]
    pub async fn upgrade_to_tls(self, _config: &TlsConfig) -> Result<Self> {
        Err(crate::tls::unsupported())
    }
}

/// Read one message from any buffered reader.
///
/// Used by [`Stream::read_message`] and by the COPY reader on the read half.
pub(crate) async fn read_message<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    buffer_set: &mut BufferSet,
) -> Result<()> {
    let mut header = [0_u8; 5];
    reader.read_exact(&mut header).await?;
    let type_byte = header[0];
    let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    let len = usize::try_from(len)
        .ok()
        .filter(|len| (4..=MAX_MESSAGE_LEN).contains(len))
        .ok_or_else(|| {
            Error::Protocol(format!(
                "invalid length {} for message '{}'",
                len,
                char::from(type_byte)
            ))
        })?;

    buffer_set.type_byte = type_byte;
    buffer_set.read_buffer.clear();
    buffer_set.read_buffer.resize(len - 4, 0);
    reader.read_exact(&mut buffer_set.read_buffer).await?;
    Ok(())
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        each!(self.get_mut(), s => Pin::new(s).poll_read(cx, buf))
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        each!(self.get_mut(), s => Pin::new(s).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        each!(self.get_mut(), s => Pin::new(s).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        each!(self.get_mut(), s => Pin::new(s).poll_shutdown(cx))
    }
}
