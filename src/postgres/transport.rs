//! Transport abstraction (TCP vs Unix socket)

use crate::driver::ConnectArgs;
use crate::Result;
use bytes::BytesMut;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

/// Byte stream to the server
#[derive(Debug)]
pub enum Transport {
    /// TCP socket
    Tcp(TcpStream),
    /// Unix domain socket
    Unix(UnixStream),
}

impl Transport {
    /// Connect to the address described by `args`
    ///
    /// A host starting with `/` names the socket directory, as libpq does.
    pub async fn connect(args: &ConnectArgs) -> Result<Self> {
        if args.host.starts_with('/') {
            Self::connect_unix(&socket_path(&args.host, args.port)).await
        } else {
            Self::connect_tcp(&args.host, args.port).await
        }
    }

    /// Connect via TCP
    pub async fn connect_tcp(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Transport::Tcp(stream))
    }

    /// Connect via Unix socket
    pub async fn connect_unix(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Transport::Unix(stream))
    }

    /// Write bytes to the transport
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            Transport::Tcp(stream) => stream.write_all(buf).await?,
            Transport::Unix(stream) => stream.write_all(buf).await?,
        }
        Ok(())
    }

    /// Flush the transport
    pub async fn flush(&mut self) -> Result<()> {
        match self {
            Transport::Tcp(stream) => stream.flush().await?,
            Transport::Unix(stream) => stream.flush().await?,
        }
        Ok(())
    }

    /// Read bytes into buffer; `Ok(0)` means end of stream
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize> {
        let n = match self {
            Transport::Tcp(stream) => stream.read_buf(buf).await?,
            Transport::Unix(stream) => stream.read_buf(buf).await?,
        };
        Ok(n)
    }

    /// Shutdown the transport
    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            Transport::Tcp(stream) => stream.shutdown().await?,
            Transport::Unix(stream) => stream.shutdown().await?,
        }
        Ok(())
    }
}

/// `<dir>/.s.PGSQL.<port>`
pub fn socket_path(dir: &str, port: u16) -> PathBuf {
    Path::new(dir).join(format!(".s.PGSQL.{}", port))
}
