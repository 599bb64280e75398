//! The client state machine.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use locus_common::constants::MAX_REGISTRATION_RETRIES;
use locus_common::{Address, ErrorCode, GeoPoint, LocusError, LocusResult, NodeId};
use locus_rpc::{
    Dispatcher, LocationResult, Peer, RegistrationResult, Reply, Request, RpcContext,
};

/// Where the session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Never registered (or reset after exhausted retries).
    Unregistered,
    /// A first registration is in flight.
    Registering,
    /// Registered with the current server.
    Registered,
    /// Was registered before; chasing the record to a new server.
    Reregistering,
}

#[derive(Debug)]
struct State {
    phase: Phase,
    current_server: Address,
    node_id: NodeId,
    coordinates: Option<GeoPoint>,
    must_set_location: bool,
    metadata: BTreeMap<String, String>,
    pending_metadata: BTreeMap<String, String>,
    was_registered: bool,
}

/// Clients export no callable objects; anything a peer asks for is
/// unimplemented.
struct ClientDispatcher;

impl Dispatcher for ClientDispatcher {
    fn dispatch(
        &self,
        peer: Arc<Peer>,
        request_id: u64,
        request: Request,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            peer.send_error(
                request_id,
                request.opcode().as_u16(),
                ErrorCode::NotImplemented,
            )
            .await;
        })
    }
}

/// A registered (or registering) mobile client of the directory.
pub struct Client {
    ctx: RpcContext,
    own_address: Address,
    state: Mutex<State>,
    /// Which server holds which foreign node id, learned from
    /// `find_controlling_server` and invalidated on `NotFound`.
    server_cache: Mutex<HashMap<NodeId, Address>>,
}

impl Client {
    /// Binds the client's listening socket and remembers the initial
    /// server. No registration happens until the first
    /// [`Client::set_location`].
    pub async fn new(listen: Address, server: Address) -> LocusResult<Client> {
        let ctx = RpcContext::new(Arc::new(ClientDispatcher));
        let own_address = ctx.listen(listen).await?;
        Ok(Client {
            ctx,
            own_address,
            state: Mutex::new(State {
                phase: Phase::Unregistered,
                current_server: server,
                node_id: NodeId::ZERO,
                coordinates: None,
                must_set_location: false,
                metadata: BTreeMap::new(),
                pending_metadata: BTreeMap::new(),
                was_registered: false,
            }),
            server_cache: Mutex::new(HashMap::new()),
        })
    }

    /// The address this client listens on.
    #[must_use]
    pub fn own_address(&self) -> Address {
        self.own_address
    }

    /// The server currently believed to be our authority.
    #[must_use]
    pub fn current_server(&self) -> Address {
        self.state.lock().current_server
    }

    /// The session phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Our node id, once one was assigned.
    #[must_use]
    pub fn node_id(&self) -> Option<NodeId> {
        let state = self.state.lock();
        state.node_id.is_set().then_some(state.node_id)
    }

    /// The last location handed to [`Client::set_location`].
    #[must_use]
    pub fn location(&self) -> Option<GeoPoint> {
        self.state.lock().coordinates
    }

    /// A locally stored metadata value.
    #[must_use]
    pub fn local_metadata(&self, key: &str) -> Option<String> {
        self.state.lock().metadata.get(key).cloned()
    }

    /// Reports a new physical location, registering with the cluster
    /// on first use and following any migration the move causes.
    pub async fn set_location(&self, point: GeoPoint) -> LocusResult<()> {
        let point = GeoPoint::new(point.latitude, point.longitude);
        let registered = {
            let mut state = self.state.lock();
            state.coordinates = Some(point);
            state.must_set_location = true;
            state.phase == Phase::Registered
        };

        if registered {
            self.push_location().await
        } else {
            self.register().await
        }
    }

    /// Stores a metadata key locally and pushes it to the server when
    /// registered.
    pub async fn set_metadata(&self, key: &str, value: &str) -> LocusResult<()> {
        let registered = {
            let mut state = self.state.lock();
            state.metadata.insert(key.to_string(), value.to_string());
            if state.was_registered {
                state
                    .pending_metadata
                    .insert(key.to_string(), value.to_string());
            }
            state.phase == Phase::Registered
        };

        if registered {
            self.flush_pending().await
        } else {
            Ok(())
        }
    }

    /// Finds every client inside a geographic rectangle. The current
    /// server fans the query out across the cluster.
    pub async fn search(&self, lower: GeoPoint, upper: GeoPoint) -> LocusResult<Vec<NodeId>> {
        let server = self.state.lock().current_server;
        let peer = self.client_peer(server).await?;
        let reply = peer
            .call(&Request::SearchClients { lower, upper })
            .await?;
        let Reply::NodeIds { ids } = reply else {
            return Err(LocusError::peer_misbehavior("unexpected search reply"));
        };
        Ok(ids)
    }

    /// Reads a metadata key of any client in the cluster, locating its
    /// authority first and retrying once on a stale cache entry.
    pub async fn get_remote_metadata(&self, id: NodeId, key: &str) -> LocusResult<String> {
        if !id.is_set() {
            return Err(LocusError::invalid_argument("unset node id"));
        }

        let cached = self.server_cache.lock().get(&id).copied();
        if let Some(server) = cached {
            match self.query_metadata(server, id, key).await {
                Err(e) if e.code() == ErrorCode::NotFound => {
                    // cache was stale; fall through to a fresh lookup
                    debug!("server cache for {id} is stale");
                    self.server_cache.lock().remove(&id);
                }
                other => return other,
            }
        }

        let owner = self.locate(id).await?;
        self.server_cache.lock().insert(id, owner);
        self.query_metadata(owner, id, key).await
    }

    // ------------------------------------------------------------------
    // registration
    // ------------------------------------------------------------------

    /// Runs the registration loop: hello, chase redirects, flush
    /// state. Caps at [`MAX_REGISTRATION_RETRIES`] attempts, then
    /// resets to unregistered.
    async fn register(&self) -> LocusResult<()> {
        {
            let mut state = self.state.lock();
            state.phase = if state.was_registered {
                Phase::Reregistering
            } else {
                Phase::Registering
            };
        }

        let mut last_error = LocusError::unreachable("registration never attempted");
        for attempt in 0..=MAX_REGISTRATION_RETRIES {
            if attempt > 0 {
                debug!("registration attempt {attempt}");
            }
            match self.try_register().await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    // bounced to another server; stay in the
                    // registering phase and try there
                    last_error = LocusError::NoSuchDevice;
                }
                Err(e) => {
                    warn!("registration attempt failed: {e}");
                    let mut state = self.state.lock();
                    state.phase = Phase::Unregistered;
                    state.was_registered = false;
                    last_error = e;
                }
            }
        }

        warn!("too many registration failures, giving up");
        Err(last_error)
    }

    /// One registration attempt: a hello, at most one redirect chase,
    /// then location/metadata flush. `Ok(false)` means the attempt was
    /// redirected and should be repeated against the new server.
    async fn try_register(&self) -> LocusResult<bool> {
        let (server, prior_id, point) = {
            let state = self.state.lock();
            let point = state
                .coordinates
                .ok_or_else(|| LocusError::invalid_argument("no location known yet"))?;
            (state.current_server, state.node_id, point)
        };

        let peer = self.ctx.get_peer(server).await?;
        let reply = peer
            .call(&Request::ClientHello {
                address: self.own_address,
                prior_id,
                point,
            })
            .await?;
        let Reply::ClientHello { result, id } = reply else {
            return Err(LocusError::peer_misbehavior("unexpected hello reply"));
        };

        match result {
            RegistrationResult::WrongServer => {
                // ask this server who is responsible and move there
                let reply = peer.call(&Request::FindServerForPoint { point }).await?;
                let Reply::AddressAndRange { address, .. } = reply else {
                    return Err(LocusError::peer_misbehavior("unexpected lookup reply"));
                };
                info!("redirected to {address}");
                self.state.lock().current_server = address;
                Ok(false)
            }
            RegistrationResult::Created => {
                info!("registered as {id}");
                {
                    let mut state = self.state.lock();
                    state.node_id = id;
                    state.phase = Phase::Registered;
                    state.was_registered = true;
                    // the hello carried our current location
                    state.must_set_location = false;
                }
                self.flush_all().await?;
                Ok(true)
            }
            RegistrationResult::AlreadyExists => {
                info!("session resumed as {id}");
                let must_push = {
                    let mut state = self.state.lock();
                    state.node_id = id;
                    state.phase = Phase::Registered;
                    state.was_registered = true;
                    state.must_set_location
                };
                if must_push {
                    self.push_location().await?;
                }
                self.flush_pending().await?;
                Ok(true)
            }
        }
    }

    /// Re-resolves our own authority through the current server.
    async fn refresh_server(&self) -> LocusResult<()> {
        let (server, id) = {
            let state = self.state.lock();
            (state.current_server, state.node_id)
        };
        let peer = self.client_peer(server).await?;
        let reply = peer.call(&Request::FindControllingServer { id }).await?;
        let Reply::AddressAndRange { address, .. } = reply else {
            return Err(LocusError::peer_misbehavior("unexpected lookup reply"));
        };
        self.state.lock().current_server = address;
        Ok(())
    }

    // ------------------------------------------------------------------
    // pushes
    // ------------------------------------------------------------------

    /// Sends the stored location to the current server, following a
    /// migration if the server hands us off.
    async fn push_location(&self) -> LocusResult<()> {
        let (server, point) = {
            let state = self.state.lock();
            let point = state
                .coordinates
                .ok_or_else(|| LocusError::invalid_argument("no location known yet"))?;
            (state.current_server, point)
        };

        let peer = self.ctx.get_peer(server).await?;
        match peer.call(&Request::SetLocation { point }).await {
            Ok(Reply::SetLocation {
                result,
                id,
                address,
            }) => {
                {
                    let mut state = self.state.lock();
                    state.node_id = id;
                    state.must_set_location = false;
                }
                if result == LocationResult::DifferentServer {
                    // the old server handed our record over; greet the
                    // new one, which will answer "already exists"
                    info!("migrated to {address}");
                    {
                        let mut state = self.state.lock();
                        state.current_server = address;
                        state.phase = Phase::Reregistering;
                    }
                    // boxed: the registration loop may push the
                    // location again
                    Box::pin(self.register()).await?;
                }
                Ok(())
            }
            Ok(_) => Err(LocusError::peer_misbehavior("unexpected location reply")),
            Err(e) if e.code() == ErrorCode::NoSuchDevice => {
                // our authority assumption is stale
                debug!("server no longer knows us, relocating");
                self.state.lock().phase = Phase::Reregistering;
                self.refresh_server().await?;
                Box::pin(self.register()).await
            }
            Err(e) => {
                warn!("failed to set location: {e}");
                {
                    let mut state = self.state.lock();
                    state.phase = Phase::Unregistered;
                    state.was_registered = false;
                }
                Box::pin(self.register()).await
            }
        }
    }

    /// Uploads every metadata entry (after a fresh registration).
    async fn flush_all(&self) -> LocusResult<()> {
        let entries: Vec<(String, String)> = {
            let mut state = self.state.lock();
            state.pending_metadata.clear();
            state
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        self.push_entries(entries).await
    }

    /// Uploads only the entries changed since the last flush.
    async fn flush_pending(&self) -> LocusResult<()> {
        let entries: Vec<(String, String)> = {
            let state = self.state.lock();
            state
                .pending_metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        self.push_entries(entries).await
    }

    async fn push_entries(&self, entries: Vec<(String, String)>) -> LocusResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let server = self.state.lock().current_server;
        let peer = self.ctx.get_peer(server).await?;
        for (key, value) in entries {
            peer.call(&Request::SetMetadata {
                key: key.clone(),
                value,
            })
            .await?;
            self.state.lock().pending_metadata.remove(&key);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // remote reads
    // ------------------------------------------------------------------

    /// Finds the authority for a foreign node id via the current
    /// server.
    async fn locate(&self, id: NodeId) -> LocusResult<Address> {
        let server = self.state.lock().current_server;
        let peer = self.client_peer(server).await?;
        let reply = peer.call(&Request::FindControllingServer { id }).await?;
        let Reply::AddressAndRange { address, .. } = reply else {
            return Err(LocusError::peer_misbehavior("unexpected lookup reply"));
        };
        Ok(address)
    }

    async fn query_metadata(&self, server: Address, id: NodeId, key: &str) -> LocusResult<String> {
        let peer = self.client_peer(server).await?;
        let reply = peer
            .call(&Request::GetMetadata {
                id,
                key: key.to_string(),
            })
            .await?;
        let Reply::Metadata { value } = reply else {
            return Err(LocusError::peer_misbehavior("unexpected metadata reply"));
        };
        Ok(value)
    }

    /// Returns a connection to `server` on which we already identified
    /// as a client. A fresh connection is greeted first, so that the
    /// server learns our role; the greeting's outcome is irrelevant
    /// (a foreign server answers `WrongServer`).
    async fn client_peer(&self, server: Address) -> LocusResult<Arc<Peer>> {
        if self.ctx.has_peer(&server) {
            return self.ctx.get_peer(server).await;
        }

        let peer = self.ctx.get_peer(server).await?;
        let (prior_id, point) = {
            let state = self.state.lock();
            (
                state.node_id,
                state.coordinates.unwrap_or(GeoPoint {
                    latitude: 0.0,
                    longitude: 0.0,
                }),
            )
        };
        peer.call(&Request::ClientHello {
            address: self.own_address,
            prior_id,
            point,
        })
        .await?;
        Ok(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A scripted server: owns everything, assigns a fixed id, records
    /// metadata, and can be told to bounce clients elsewhere.
    struct FakeServer {
        assigned: NodeId,
        already_exists: bool,
        redirect_to: Mutex<Option<Address>>,
        metadata: DashMap<String, String>,
        hellos: AtomicU32,
    }

    impl FakeServer {
        fn new(assigned: NodeId) -> Self {
            Self {
                assigned,
                already_exists: false,
                redirect_to: Mutex::new(None),
                metadata: DashMap::new(),
                hellos: AtomicU32::new(0),
            }
        }
    }

    impl Dispatcher for FakeServer {
        fn dispatch(
            &self,
            peer: Arc<Peer>,
            request_id: u64,
            request: Request,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async move {
                let opcode = request.opcode();
                let reply = match request {
                    Request::ClientHello { .. } => {
                        self.hellos.fetch_add(1, Ordering::Relaxed);
                        if self.redirect_to.lock().is_some() {
                            Reply::ClientHello {
                                result: RegistrationResult::WrongServer,
                                id: NodeId::ZERO,
                            }
                        } else if self.already_exists {
                            Reply::ClientHello {
                                result: RegistrationResult::AlreadyExists,
                                id: self.assigned,
                            }
                        } else {
                            Reply::ClientHello {
                                result: RegistrationResult::Created,
                                id: self.assigned,
                            }
                        }
                    }
                    Request::FindServerForPoint { .. } | Request::FindControllingServer { .. } => {
                        let target = self.redirect_to.lock().expect("no redirect configured");
                        Reply::AddressAndRange {
                            address: target,
                            range: locus_common::NodeIdRange::UNIVERSAL,
                        }
                    }
                    Request::SetMetadata { key, value } => {
                        self.metadata.insert(key, value);
                        Reply::Empty
                    }
                    Request::GetMetadata { key, .. } => match self.metadata.get(&key) {
                        Some(value) => Reply::Metadata {
                            value: value.clone(),
                        },
                        None => {
                            peer.send_error(
                                request_id,
                                opcode.as_u16(),
                                ErrorCode::NotFound,
                            )
                            .await;
                            return;
                        }
                    },
                    Request::SetLocation { .. } => Reply::SetLocation {
                        result: LocationResult::SameServer,
                        id: self.assigned,
                        address: peer.listening_address().unwrap_or(
                            "127.0.0.1:1".parse().unwrap(),
                        ),
                    },
                    _ => Reply::Empty,
                };
                peer.send_reply(request_id, opcode, &reply).await;
            })
        }
    }

    fn test_id(tag: u8) -> NodeId {
        let mut bytes = [0u8; NodeId::LEN];
        bytes[0] = tag;
        let mut id = NodeId::from_bytes(bytes);
        id.mark_set();
        id
    }

    fn loopback() -> Address {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn spawn_server(server: Arc<FakeServer>) -> Address {
        let ctx = RpcContext::new(server);
        ctx.listen(loopback()).await.unwrap()
    }

    #[tokio::test]
    async fn test_first_location_registers() {
        let fake = Arc::new(FakeServer::new(test_id(7)));
        let addr = spawn_server(Arc::clone(&fake)).await;

        let client = Client::new(loopback(), addr).await.unwrap();
        assert_eq!(client.phase(), Phase::Unregistered);
        assert!(client.node_id().is_none());

        client
            .set_location(GeoPoint::new(37.4, -122.1))
            .await
            .unwrap();
        assert_eq!(client.phase(), Phase::Registered);
        assert_eq!(client.node_id(), Some(test_id(7)));
        assert_eq!(fake.hellos.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_metadata_set_before_registration_is_flushed() {
        let fake = Arc::new(FakeServer::new(test_id(7)));
        let addr = spawn_server(Arc::clone(&fake)).await;

        let client = Client::new(loopback(), addr).await.unwrap();
        client.set_metadata("color", "teal").await.unwrap();
        assert!(fake.metadata.is_empty(), "nothing flushed before register");

        client.set_location(GeoPoint::new(1.0, 2.0)).await.unwrap();
        assert_eq!(
            fake.metadata.get("color").map(|v| v.clone()),
            Some("teal".to_string())
        );
        assert_eq!(client.local_metadata("color"), Some("teal".to_string()));
    }

    #[tokio::test]
    async fn test_wrong_server_redirect_is_followed() {
        let right = Arc::new(FakeServer::new(test_id(9)));
        let right_addr = spawn_server(Arc::clone(&right)).await;

        let wrong = Arc::new(FakeServer::new(test_id(1)));
        *wrong.redirect_to.lock() = Some(right_addr);
        let wrong_addr = spawn_server(Arc::clone(&wrong)).await;

        let client = Client::new(loopback(), wrong_addr).await.unwrap();
        client.set_location(GeoPoint::new(5.0, 5.0)).await.unwrap();

        assert_eq!(client.current_server(), right_addr);
        assert_eq!(client.node_id(), Some(test_id(9)));
        assert_eq!(client.phase(), Phase::Registered);
    }

    #[tokio::test]
    async fn test_unreachable_server_exhausts_retries() {
        // a dead address: bind a listener and drop it immediately
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = Address::new(listener.local_addr().unwrap());
        drop(listener);

        let client = Client::new(loopback(), dead).await.unwrap();
        let err = client.set_location(GeoPoint::new(0.0, 0.0)).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(client.phase(), Phase::Unregistered);
    }

    #[tokio::test]
    async fn test_remote_metadata_uses_and_heals_cache() {
        let owner = Arc::new(FakeServer::new(test_id(2)));
        owner.metadata.insert("k".to_string(), "v".to_string());
        let owner_addr = spawn_server(Arc::clone(&owner)).await;

        let home = Arc::new(FakeServer::new(test_id(1)));
        *home.redirect_to.lock() = Some(owner_addr);
        let home_addr = spawn_server(Arc::clone(&home)).await;

        let client = Client::new(loopback(), home_addr).await.unwrap();
        let value = client
            .get_remote_metadata(test_id(2), "k")
            .await
            .unwrap();
        assert_eq!(value, "v");

        // second read hits the cache (home server not consulted again
        // for the lookup); still works
        let value = client.get_remote_metadata(test_id(2), "k").await.unwrap();
        assert_eq!(value, "v");

        // a genuinely missing key is NotFound even after the retry
        let err = client
            .get_remote_metadata(test_id(2), "missing")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }
}
