//! The byte-stream contract (§4.1) and the plaintext TCP stream that implements it (§4.2).
//!
//! Grounded in the teacher's `runtime::stream::AsyncTcpStream`, simplified to a single
//! (tokio-only) runtime and extended with the address-list fallback the design calls for.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::address::{AddressList, Destination};
use crate::error::{Error, Result};
use crate::resolver::Resolver;

const KEEPALIVE_TIME: Duration = Duration::from_secs(120);

/// A boxed future, used so [`ByteStream`] can be made into a trait object (`Box<dyn
/// ByteStream>`) shared by the plaintext stream and the TLS stream (SPEC_FULL.md §9, Open
/// Question on trait object safety).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Every stream the pool hands out — plaintext TCP or TLS — implements this, distinguished only
/// by the behavior behind each method (§4.1).
pub trait ByteStream: Send {
    /// Establishes or re-establishes the connection. Valid to call again after `disconnect`,
    /// restarting address-list traversal from the head; valid to call on an already-connected
    /// stream (a no-op success).
    fn connect(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Reads into `buf`. `Ok(0)` means clean end-of-stream. Only one read may be in flight at a
    /// time (enforced by `&mut self`, not by the implementation).
    fn read(&mut self, buf: &mut [u8]) -> BoxFuture<'_, Result<usize>>;

    /// Writes from `buf`, permitting partial writes. Only one write may be in flight at a time.
    fn write(&mut self, buf: &[u8]) -> BoxFuture<'_, Result<usize>>;

    /// Idempotent. Drops the underlying socket; a subsequent `connect` restarts from the first
    /// address.
    fn disconnect(&mut self);

    /// May return a false positive if the peer has closed without our having noticed yet.
    fn is_connected(&self) -> bool;

    /// Must not return a false positive: false if any unexpected bytes have arrived since the
    /// last read, or if not connected.
    fn is_connected_and_idle(&self) -> BoxFuture<'_, bool>;

    /// The destination this stream connects (or will connect) to.
    fn peer_name(&self) -> &Destination;
}

/// Drives a plain TCP socket, with address-list fallback on connect (§4.2, §3 "Endpoint address
/// list").
pub struct PlaintextStream {
    destination: Destination,
    resolver: std::sync::Arc<dyn Resolver>,
    socket: Option<TcpStream>,
    connect_timeout: Duration,
}

impl PlaintextStream {
    pub fn new(destination: Destination, resolver: std::sync::Arc<dyn Resolver>) -> Self {
        Self {
            destination,
            resolver,
            socket: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn try_connect_one(addr: std::net::SocketAddr, timeout: Duration) -> Result<TcpStream> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::network(crate::error::NetworkErrorKind::TimedOut))??;

        stream.set_nodelay(true)?;

        let socket = socket2::Socket::from(stream.into_std()?);
        let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
        socket.set_tcp_keepalive(&keepalive)?;
        let std_stream = std::net::TcpStream::from(socket);
        std_stream.set_nonblocking(true)?;
        Ok(TcpStream::from_std(std_stream)?)
    }

    async fn connect_via_address_list(list: &AddressList, timeout: Duration) -> Result<TcpStream> {
        if list.is_empty() {
            return Err(Error::no_dns_results("<empty address list>"));
        }

        let mut last_err = None;
        for addr in list.iter() {
            match Self::try_connect_one(addr, timeout).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    let should_continue = err.is_try_next();
                    last_err = Some(err);
                    if !should_continue {
                        break;
                    }
                }
            }
        }
        Err(last_err.expect("address list was non-empty"))
    }
}

impl ByteStream for PlaintextStream {
    fn connect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.socket.is_some() {
                return Ok(());
            }
            let list = self.resolver.resolve(&self.destination).await?;
            let stream = Self::connect_via_address_list(&list, self.connect_timeout).await?;
            self.socket = Some(stream);
            Ok(())
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            use tokio::io::AsyncReadExt;
            let socket = self
                .socket
                .as_mut()
                .ok_or_else(|| Error::internal("read before connect"))?;
            Ok(socket.read(buf).await?)
        })
    }

    fn write(&mut self, buf: &[u8]) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let socket = self
                .socket
                .as_mut()
                .ok_or_else(|| Error::internal("write before connect"))?;
            Ok(socket.write(buf).await?)
        })
    }

    fn disconnect(&mut self) {
        // Dropping the socket closes both halves. A graceful half-close (shutdown of the send
        // side only) needs an async call on `tokio::net::TcpStream`; since `disconnect` is
        // specified as synchronous (§4.1), a full close on drop is the closest synchronous
        // equivalent and is idempotent, matching the contract.
        self.socket = None;
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    fn is_connected_and_idle(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let Some(socket) = &self.socket else {
                return false;
            };
            // A zero-length peek distinguishes "idle and healthy" from "peer sent bytes we
            // haven't read yet" or "peer closed" without consuming anything (§4.1,
            // `IsConnectedAndIdle` must not false-positive).
            let mut probe = [0u8; 1];
            match socket.try_read(&mut probe) {
                Ok(0) => false,   // peer closed
                Ok(_) => false,   // unexpected bytes arrived
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
                Err(_) => false,
            }
        })
    }

    fn peer_name(&self) -> &Destination {
        &self.destination
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resolver::TokioResolver;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_falls_back_across_address_list() {
        // addr1 is a listener we immediately drop (so connects to it are refused), addr2 is a
        // live listener. Scenario 6 of §8.
        let refused_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr1 = refused_listener.local_addr().unwrap();
        drop(refused_listener);

        let live_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr2 = live_listener.local_addr().unwrap();

        let accept_task = tokio::spawn(async move {
            let (_socket, _) = live_listener.accept().await.unwrap();
        });

        let list = AddressList::from_resolved(vec![addr1, addr2]);
        let stream = PlaintextStream::connect_via_address_list(&list, Duration::from_secs(2))
            .await
            .expect("should fall back to addr2");
        assert_eq!(stream.peer_addr().unwrap(), addr2);

        accept_task.await.unwrap();
    }

    #[tokio::test]
    async fn is_connected_and_idle_false_before_connect() {
        let stream = PlaintextStream::new(
            Destination::new("example.invalid", 443),
            Arc::new(TokioResolver),
        );
        assert!(!stream.is_connected());
        assert!(!stream.is_connected_and_idle().await);
    }
}
