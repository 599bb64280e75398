//! A connected peer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::net::SocketAddr;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use locus_common::constants::{MASTER_OBJECT_ID, MAX_PAYLOAD_SIZE};
use locus_common::{Address, ErrorCode, LocusError, LocusResult};

use crate::frame;
use crate::message::{Reply, Request};
use crate::opcode::Opcode;

/// One peer on the other end of a connection.
///
/// Peers are reference counted: the RPC context, the per-connection
/// tasks, and any client or range records referencing the peer all hold
/// the same `Arc`. When the connection drops, every outstanding request
/// completes with `Unreachable` and later calls fail immediately.
pub struct Peer {
    id: u64,
    remote: SocketAddr,
    listening: RwLock<Option<Address>>,
    outbox: mpsc::Sender<Bytes>,
    pending: DashMap<u64, oneshot::Sender<LocusResult<Bytes>>>,
    next_request_id: AtomicU64,
    closed: AtomicBool,
}

impl Peer {
    pub(crate) fn new(id: u64, remote: SocketAddr, outbox: mpsc::Sender<Bytes>) -> Self {
        Self {
            id,
            remote,
            listening: RwLock::new(None),
            outbox,
            pending: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Context-unique id of this peer.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The address of the connected socket (not the peer's listener).
    #[inline]
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// The listening address the peer announced, if any.
    #[must_use]
    pub fn listening_address(&self) -> Option<Address> {
        *self.listening.read()
    }

    pub(crate) fn set_listening_address(&self, address: Address) {
        *self.listening.write() = Some(address);
    }

    /// Returns true once the connection has dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sends a request and awaits the matching reply.
    pub async fn call(&self, request: &Request) -> LocusResult<Reply> {
        let opcode = request.opcode();
        let payload = request.encode_payload();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(LocusError::invalid_argument("request payload too large"));
        }
        if self.is_closed() {
            return Err(LocusError::unreachable("connection closed"));
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        trace!(peer = self.id, %opcode, request_id, "sending request");
        let data = frame::encode_request(opcode.as_u16(), request_id, MASTER_OBJECT_ID, &payload);
        if self.outbox.send(data).await.is_err() {
            self.pending.remove(&request_id);
            return Err(LocusError::unreachable("connection closed"));
        }

        let payload = match rx.await {
            Ok(result) => result?,
            Err(_) => return Err(LocusError::unreachable("connection dropped")),
        };
        Reply::decode(opcode, payload)
    }

    /// Sends a successful reply. Best effort: a closed connection just
    /// drops it.
    pub async fn send_reply(&self, request_id: u64, opcode: Opcode, reply: &Reply) {
        let payload = reply.encode_payload();
        if payload.len() > MAX_PAYLOAD_SIZE {
            // a result too large to frame; the caller gets an error
            // rather than a truncated payload
            self.send_error(request_id, opcode.as_u16(), ErrorCode::Io)
                .await;
            return;
        }
        let data = frame::encode_reply(opcode.as_u16(), request_id, 0, &payload);
        let _ = self.outbox.send(data).await;
    }

    /// Sends an error reply. Best effort.
    pub async fn send_error(&self, request_id: u64, opcode: u16, code: ErrorCode) {
        debug!(peer = self.id, opcode, request_id, %code, "replying with error");
        let data = frame::encode_reply(opcode, request_id, code.as_u32(), &[]);
        let _ = self.outbox.send(data).await;
    }

    /// Routes a received reply to the request awaiting it.
    pub(crate) fn complete_reply(&self, request_id: u64, error: u32, payload: Bytes) {
        let Some((_, tx)) = self.pending.remove(&request_id) else {
            debug!(peer = self.id, request_id, "reply for unknown request");
            return;
        };
        let result = if error == 0 {
            Ok(payload)
        } else {
            match ErrorCode::from_u32(error) {
                Some(code) => Err(LocusError::from_code(code)),
                None => Err(LocusError::peer_misbehavior(format!(
                    "unknown error code {error}"
                ))),
            }
        };
        let _ = tx.send(result);
    }

    /// Marks the peer closed and fails every outstanding request.
    pub(crate) fn fail_all(&self) {
        self.closed.store(true, Ordering::Release);
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for request_id in ids {
            if let Some((_, tx)) = self.pending.remove(&request_id) {
                let _ = tx.send(Err(LocusError::unreachable("connection dropped")));
            }
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("listening", &self.listening_address())
            .field("closed", &self.is_closed())
            .finish()
    }
}
