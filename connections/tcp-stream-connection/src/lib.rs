// Copyright 2020 Joyent, Inc.

use std::io::{Error as IOError, ErrorKind};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use async_trait::async_trait;

use resilient_pool::connection::{AsyncConnection, Connection};

// Connect timeout in milliseconds
const DEFAULT_CONNECT_TIMEOUT: u64 = 2000;
// Read and write timeout in milliseconds
const DEFAULT_COMMAND_TIMEOUT: u64 = 2000;

/// Socket level settings for a `TcpStreamWrapper`.
#[derive(Clone, Copy, Debug)]
pub struct TcpStreamConfig {
    pub addr: SocketAddr,
    /// An optional limit in milliseconds on establishing the TCP connection.
    /// If not specified the default is 2 seconds.
    pub connect_timeout: Option<u64>,
    /// An optional limit in milliseconds on any single read or write. If not
    /// specified the default is 2 seconds.
    pub command_timeout: Option<u64>,
}

impl From<SocketAddr> for TcpStreamConfig {
    fn from(addr: SocketAddr) -> Self {
        TcpStreamConfig {
            addr,
            connect_timeout: None,
            command_timeout: None,
        }
    }
}

#[derive(Debug)]
pub struct TcpStreamWrapper {
    pub stream: Option<TcpStream>,
    addr: SocketAddr,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl TcpStreamWrapper {
    pub fn new(config: TcpStreamConfig) -> Self {
        TcpStreamWrapper {
            stream: None,
            addr: config.addr,
            connect_timeout: Duration::from_millis(
                config.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            ),
            command_timeout: Duration::from_millis(
                config.command_timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT),
            ),
        }
    }

    /// Return a function that creates unconnected wrappers for `config`,
    /// suitable for handing to a pool.
    pub fn connection_creator(
        config: TcpStreamConfig,
    ) -> impl Fn() -> TcpStreamWrapper + Send + Sync + 'static {
        move || TcpStreamWrapper::new(config)
    }

    fn configure(&mut self, stream: TcpStream) -> Result<(), IOError> {
        stream.set_read_timeout(Some(self.command_timeout))?;
        stream.set_write_timeout(Some(self.command_timeout))?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }
}

impl Connection for TcpStreamWrapper {
    type Error = IOError;

    fn connect(&mut self) -> Result<(), Self::Error> {
        let stream = TcpStream::connect_timeout(&self.addr, self.connect_timeout)?;
        self.configure(stream)
    }

    // A readable socket with nothing to read means the peer hung up. Data
    // waiting to be read is left in place.
    fn ping(&mut self) -> Result<(), Self::Error> {
        let stream = match &self.stream {
            Some(stream) => stream,
            None => {
                return Err(IOError::new(ErrorKind::NotConnected, "not connected"))
            }
        };

        stream.set_nonblocking(true)?;
        let mut buf = [0u8; 1];
        let result = match stream.peek(&mut buf) {
            Ok(0) => Err(IOError::new(
                ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )),
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        };
        stream.set_nonblocking(false)?;
        result
    }

    fn has_broken(&self) -> bool {
        match &self.stream {
            Some(stream) => stream.take_error().map(|e| e.is_some()).unwrap_or(true),
            None => false,
        }
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        self.stream = None;
        Ok(())
    }
}

#[async_trait]
impl AsyncConnection for TcpStreamWrapper {
    async fn connect_async(&mut self) -> Result<(), Self::Error> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            tokio::net::TcpStream::connect(self.addr),
        )
        .await
        .map_err(|_| IOError::new(ErrorKind::TimedOut, "connect timed out"))??;

        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;
        self.configure(stream)
    }
}
