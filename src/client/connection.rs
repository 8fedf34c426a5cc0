//! Broker connections and pooling
//!
//! `LineConnection` is one line-oriented conversation with the broker and
//! `ConnectionPool` hands them out. Producers and consumers only see these
//! traits, so tests can swap in scripted transports.
//!
//! `TcpConnectionPool` is the real implementation. At most `max_total`
//! connections are checked out at once; callers beyond that wait up to
//! `max_wait` and then get `ClientError::PoolTimeout`. Returned connections
//! are kept for reuse, up to `max_idle`, and validated again on borrow.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;

use crate::config::ClientSettings;
use crate::transport::message::DEFAULT_MAX_LINE_LENGTH;
use crate::utils::error::ClientError;

#[async_trait]
pub trait LineConnection: Send {
    async fn write_line(&mut self, line: &str) -> Result<(), ClientError>;

    async fn read_line(&mut self) -> Result<String, ClientError>;

    /// Cheap health check run before an idle connection is reused.
    fn is_reusable(&mut self) -> bool {
        true
    }
}

#[async_trait]
pub trait ConnectionPool: Send + Sync + 'static {
    type Connection: LineConnection + 'static;

    async fn acquire(&self) -> Result<Self::Connection, ClientError>;

    /// Hand back a healthy connection for reuse.
    async fn release(&self, conn: Self::Connection);

    /// Destroy a connection that hit an error. It is never reused.
    async fn invalidate(&self, conn: Self::Connection);

    /// Most connections that can be checked out at once, if the pool is
    /// bounded.
    fn max_connections(&self) -> Option<usize> {
        None
    }
}

/// Send one request line and wait for its reply line.
pub async fn exchange<C>(conn: &mut C, line: &str, timeout: Duration) -> Result<String, ClientError>
where
    C: LineConnection + ?Sized,
{
    let round_trip = async {
        conn.write_line(line).await?;
        conn.read_line().await
    };
    tokio::time::timeout(timeout, round_trip)
        .await
        .map_err(|_| ClientError::RequestTimeout {
            timeout_ms: timeout.as_millis() as u64,
        })?
}

/// Send a line that has no reply.
pub async fn send_line<C>(conn: &mut C, line: &str, timeout: Duration) -> Result<(), ClientError>
where
    C: LineConnection + ?Sized,
{
    tokio::time::timeout(timeout, conn.write_line(line))
        .await
        .map_err(|_| ClientError::RequestTimeout {
            timeout_ms: timeout.as_millis() as u64,
        })?
}

#[derive(Debug)]
pub struct TcpConnection {
    framed: Framed<TcpStream, LinesCodec>,
    permit: Option<OwnedSemaphorePermit>,
}

#[async_trait]
impl LineConnection for TcpConnection {
    async fn write_line(&mut self, line: &str) -> Result<(), ClientError> {
        self.framed.send(line).await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, ClientError> {
        match self.framed.next().await {
            Some(line) => Ok(line?),
            None => Err(ClientError::ConnectionClosed),
        }
    }

    fn is_reusable(&mut self) -> bool {
        if !self.framed.read_buffer().is_empty() {
            return false;
        }
        // An idle socket has nothing to read; EOF or stray bytes mean it is stale
        let mut probe = [0u8; 1];
        match self.framed.get_ref().try_read(&mut probe) {
            Err(e) => e.kind() == io::ErrorKind::WouldBlock,
            Ok(_) => false,
        }
    }
}

#[derive(Debug)]
pub struct TcpConnectionPool {
    addr: String,
    connection_timeout: Duration,
    max_wait: Duration,
    max_total: usize,
    max_idle: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<TcpConnection>>,
}

impl TcpConnectionPool {
    pub fn new(settings: &ClientSettings) -> Self {
        Self {
            addr: settings.broker_addr(),
            connection_timeout: settings.connection_timeout(),
            max_wait: settings.pool.max_wait(),
            max_total: settings.pool.max_total.max(1),
            max_idle: settings.pool.max_idle,
            permits: Arc::new(Semaphore::new(settings.pool.max_total.max(1))),
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn idle_count(&self) -> usize {
        self.idle_conns().len()
    }

    /// Close every idle connection.
    pub fn close(&self) {
        let drained = std::mem::take(&mut *self.idle_conns());
        debug!("Closed {} idle connection(s) to {}", drained.len(), self.addr);
    }

    fn idle_conns(&self) -> std::sync::MutexGuard<'_, Vec<TcpConnection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_idle(&self) -> Option<TcpConnection> {
        let mut idle = self.idle_conns();
        while let Some(mut conn) = idle.pop() {
            if conn.is_reusable() {
                return Some(conn);
            }
            debug!("Discarding stale pooled connection to {}", self.addr);
        }
        None
    }

    async fn connect(&self) -> Result<TcpConnection, ClientError> {
        let stream = tokio::time::timeout(self.connection_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                ClientError::Connection(format!(
                    "connecting to {} timed out after {}ms",
                    self.addr,
                    self.connection_timeout.as_millis()
                ))
            })??;
        stream.set_nodelay(true)?;
        debug!("Opened connection to {}", self.addr);
        Ok(TcpConnection {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(DEFAULT_MAX_LINE_LENGTH)),
            permit: None,
        })
    }
}

#[async_trait]
impl ConnectionPool for TcpConnectionPool {
    type Connection = TcpConnection;

    async fn acquire(&self) -> Result<TcpConnection, ClientError> {
        let permit = tokio::time::timeout(self.max_wait, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| ClientError::PoolTimeout {
                waited_ms: self.max_wait.as_millis() as u64,
            })?
            .map_err(|_| ClientError::Connection("connection pool is closed".to_string()))?;

        let mut conn = match self.take_idle() {
            Some(conn) => conn,
            None => self.connect().await?,
        };
        conn.permit = Some(permit);
        Ok(conn)
    }

    async fn release(&self, mut conn: TcpConnection) {
        conn.permit = None;
        let mut idle = self.idle_conns();
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }

    async fn invalidate(&self, conn: TcpConnection) {
        debug!("Invalidated connection to {}", self.addr);
        drop(conn);
    }

    fn max_connections(&self) -> Option<usize> {
        Some(self.max_total)
    }
}
