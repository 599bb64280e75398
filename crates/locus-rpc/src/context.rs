//! Connection management.
//!
//! An [`RpcContext`] owns the listening socket and every live peer
//! connection. Each connection gets a reader task (frame parsing,
//! reply correlation, request dispatch) and a writer task draining the
//! peer's outbox.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use locus_common::constants::MASTER_OBJECT_ID;
use locus_common::{Address, ErrorCode, LocusError, LocusResult};

use crate::frame::{self, Frame};
use crate::message::Request;
use crate::opcode::Opcode;
use crate::peer::Peer;

/// Handles requests arriving on any connection of a context.
pub trait Dispatcher: Send + Sync + 'static {
    /// Handles one decoded request. The implementation must reply on
    /// `peer` with the given correlation id, whatever the outcome.
    fn dispatch(
        &self,
        peer: Arc<Peer>,
        request_id: u64,
        request: Request,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Called after a peer's connection has dropped and its outstanding
    /// requests have been failed.
    fn peer_disconnected(&self, peer: Arc<Peer>) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let _ = peer;
        Box::pin(async {})
    }
}

struct Inner {
    dispatcher: Arc<dyn Dispatcher>,
    peers: DashMap<u64, Arc<Peer>>,
    by_address: DashMap<Address, u64>,
    listen_addr: RwLock<Option<Address>>,
    next_peer_id: AtomicU64,
}

/// The connection manager: listener, dialer, and peer registry.
#[derive(Clone)]
pub struct RpcContext {
    inner: Arc<Inner>,
}

impl RpcContext {
    /// Creates a context that hands inbound requests to `dispatcher`.
    #[must_use]
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher,
                peers: DashMap::new(),
                by_address: DashMap::new(),
                listen_addr: RwLock::new(None),
                next_peer_id: AtomicU64::new(1),
            }),
        }
    }

    /// Binds the listening socket and starts accepting connections.
    /// Returns the actually bound address (relevant with port 0).
    pub async fn listen(&self, address: Address) -> LocusResult<Address> {
        let listener = TcpListener::bind(address.socket_addr()).await?;
        let local = Address::new(listener.local_addr()?);
        *self.inner.listen_addr.write() = Some(local);
        info!("listening on {local}");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!("accepted connection from {remote}");
                        adopt_connection(&inner, stream);
                    }
                    Err(e) => {
                        warn!("accept error: {e}");
                    }
                }
            }
        });
        Ok(local)
    }

    /// The address this context listens on, once [`Self::listen`] ran.
    #[must_use]
    pub fn listening_address(&self) -> Option<Address> {
        *self.inner.listen_addr.read()
    }

    /// Returns true if a live peer announced or was dialed at `address`.
    #[must_use]
    pub fn has_peer(&self, address: &Address) -> bool {
        self.lookup_peer(address).is_some()
    }

    fn lookup_peer(&self, address: &Address) -> Option<Arc<Peer>> {
        let id = *self.inner.by_address.get(address)?;
        let peer = self.inner.peers.get(&id)?.clone();
        (!peer.is_closed()).then_some(peer)
    }

    /// Returns the peer listening at `address`, dialing it if no live
    /// connection exists yet.
    pub async fn get_peer(&self, address: Address) -> LocusResult<Arc<Peer>> {
        if let Some(peer) = self.lookup_peer(&address) {
            return Ok(peer);
        }

        debug!("connecting to {address}");
        let stream = TcpStream::connect(address.socket_addr()).await?;
        let peer = adopt_connection(&self.inner, stream);
        peer.set_listening_address(address);
        self.inner.by_address.insert(address, peer.id());
        Ok(peer)
    }

    /// Records the listening address a peer announced, so later
    /// [`Self::get_peer`] calls reuse this connection.
    pub fn register_listening_address(&self, peer: &Arc<Peer>, address: Address) {
        peer.set_listening_address(address);
        self.inner.by_address.insert(address, peer.id());
    }

    /// Number of live peer connections.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }
}

/// Wires up reader and writer tasks for a fresh connection.
fn adopt_connection(inner: &Arc<Inner>, stream: TcpStream) -> Arc<Peer> {
    let remote = stream
        .peer_addr()
        .unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();

    let (outbox_tx, mut outbox_rx) = mpsc::channel::<bytes::Bytes>(256);
    let peer_id = inner.next_peer_id.fetch_add(1, Ordering::Relaxed);
    let peer = Arc::new(Peer::new(peer_id, remote, outbox_tx));
    inner.peers.insert(peer_id, Arc::clone(&peer));

    // writer task
    tokio::spawn(async move {
        while let Some(data) = outbox_rx.recv().await {
            if let Err(e) = write_half.write_all(&data).await {
                debug!(peer = peer_id, "write error: {e}");
                break;
            }
        }
    });

    // reader task
    let inner = Arc::clone(inner);
    let reader_peer = Arc::clone(&peer);
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            match read_half.read_buf(&mut buf).await {
                Ok(0) => {
                    debug!(peer = peer_id, "connection closed");
                    break;
                }
                Ok(_) => {
                    let mut fatal = false;
                    while let Some(size) = frame::frame_size(&buf) {
                        let data = buf.split_to(size).freeze();
                        if !handle_frame(&inner, &reader_peer, data).await {
                            fatal = true;
                            break;
                        }
                    }
                    if fatal {
                        break;
                    }
                }
                Err(e) => {
                    debug!(peer = peer_id, "read error: {e}");
                    break;
                }
            }
        }

        // connection gone: fail outstanding calls and drop the peer
        reader_peer.fail_all();
        inner.peers.remove(&peer_id);
        if let Some(address) = reader_peer.listening_address() {
            inner
                .by_address
                .remove_if(&address, |_, &id| id == peer_id);
        }
        inner
            .dispatcher
            .peer_disconnected(Arc::clone(&reader_peer))
            .await;
    });

    peer
}

/// Processes one frame. Returns false when the violation is fatal and
/// the connection must close.
async fn handle_frame(inner: &Arc<Inner>, peer: &Arc<Peer>, data: bytes::Bytes) -> bool {
    let frame = match frame::decode(data) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(peer = peer.id(), "unparseable frame: {e}");
            return false;
        }
    };

    match frame {
        Frame::Reply {
            request_id,
            error,
            payload,
            ..
        } => {
            peer.complete_reply(request_id, error, payload);
            true
        }
        Frame::Request {
            opcode,
            request_id,
            object_id,
            payload,
        } => {
            let Some(known) = Opcode::from_u16(opcode) else {
                warn!(peer = peer.id(), opcode, "unknown opcode");
                peer.send_error(request_id, opcode, ErrorCode::NotImplemented)
                    .await;
                return false;
            };
            if object_id != MASTER_OBJECT_ID {
                debug!(peer = peer.id(), object_id, "request for unknown object");
                peer.send_error(request_id, opcode, ErrorCode::NotFound).await;
                return true;
            }
            let request = match Request::decode(known, payload) {
                Ok(request) => request,
                Err(e) => {
                    warn!(peer = peer.id(), %known, "malformed request: {e}");
                    peer.send_error(request_id, opcode, LocusError::code(&e))
                        .await;
                    return false;
                }
            };

            let dispatcher = Arc::clone(&inner.dispatcher);
            let peer = Arc::clone(peer);
            tokio::spawn(async move {
                dispatcher.dispatch(peer, request_id, request).await;
            });
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Reply;
    use locus_common::GeoPoint;
    use std::time::Duration;

    /// Echoes metadata requests back; used to exercise the plumbing.
    struct EchoDispatcher;

    impl Dispatcher for EchoDispatcher {
        fn dispatch(
            &self,
            peer: Arc<Peer>,
            request_id: u64,
            request: Request,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async move {
                match request {
                    Request::GetMetadata { key, .. } => {
                        peer.send_reply(
                            request_id,
                            Opcode::GetMetadata,
                            &Reply::Metadata { value: key },
                        )
                        .await;
                    }
                    Request::SetMetadata { .. } => {
                        peer.send_error(
                            request_id,
                            Opcode::SetMetadata.as_u16(),
                            ErrorCode::PermissionDenied,
                        )
                        .await;
                    }
                    other => {
                        peer.send_reply(request_id, other.opcode(), &Reply::Empty)
                            .await;
                    }
                }
            })
        }
    }

    fn loopback() -> Address {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let server = RpcContext::new(Arc::new(EchoDispatcher));
        let addr = server.listen(loopback()).await.unwrap();

        let client = RpcContext::new(Arc::new(EchoDispatcher));
        let peer = client.get_peer(addr).await.unwrap();

        let reply = peer
            .call(&Request::GetMetadata {
                id: locus_common::NodeId::ZERO,
                key: "color".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            reply,
            Reply::Metadata {
                value: "color".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_error_reply_surfaces_as_remote_error() {
        let server = RpcContext::new(Arc::new(EchoDispatcher));
        let addr = server.listen(loopback()).await.unwrap();

        let client = RpcContext::new(Arc::new(EchoDispatcher));
        let peer = client.get_peer(addr).await.unwrap();

        let err = peer
            .call(&Request::SetMetadata {
                key: "k".to_string(),
                value: "v".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn test_concurrent_calls_interleave() {
        let server = RpcContext::new(Arc::new(EchoDispatcher));
        let addr = server.listen(loopback()).await.unwrap();

        let client = RpcContext::new(Arc::new(EchoDispatcher));
        let peer = client.get_peer(addr).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let peer = Arc::clone(&peer);
            handles.push(tokio::spawn(async move {
                let reply = peer
                    .call(&Request::GetMetadata {
                        id: locus_common::NodeId::ZERO,
                        key: format!("key-{i}"),
                    })
                    .await
                    .unwrap();
                assert_eq!(
                    reply,
                    Reply::Metadata {
                        value: format!("key-{i}")
                    }
                );
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_disconnect_fails_outstanding_requests() {
        // a listener that accepts and immediately drops connections
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = Address::new(listener.local_addr().unwrap());
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                // give the client a moment to send its request
                tokio::time::sleep(Duration::from_millis(20)).await;
                drop(stream);
            }
        });

        let client = RpcContext::new(Arc::new(EchoDispatcher));
        let peer = client.get_peer(addr).await.unwrap();
        let err = peer
            .call(&Request::FindServerForPoint {
                point: GeoPoint::new(0.0, 0.0),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unreachable);
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_peer_reuse_by_listening_address() {
        let server = RpcContext::new(Arc::new(EchoDispatcher));
        let addr = server.listen(loopback()).await.unwrap();

        let client = RpcContext::new(Arc::new(EchoDispatcher));
        let a = client.get_peer(addr).await.unwrap();
        let b = client.get_peer(addr).await.unwrap();
        assert_eq!(a.id(), b.id(), "same address must reuse the connection");
        assert!(client.has_peer(&addr));
    }
}
