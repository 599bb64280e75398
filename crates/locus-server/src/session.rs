//! Per-connection sessions and request dispatch.
//!
//! Every connection gets a session holding its role and, for clients,
//! the node id bound to the connection. The first role-carrying request
//! fixes the role; requests of the opposite role are rejected with
//! `PermissionDenied`. All handlers run against the shared state and
//! reply with the original correlation id, success or failure.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use locus_common::{Address, GeoPoint, LocusError, LocusResult, NodeId, NodeIdRange};
use locus_rpc::{
    Dispatcher, LocationResult, Peer, RegistrationResult, Reply, Request, RpcContext,
};

use crate::search;
use crate::table::{Authority, BalanceAction, ClientLookup, MoveOutcome, Table};

/// How long a disconnected client's record lingers before it is
/// forgotten. Re-registration within the grace keeps the metadata.
const DISCONNECT_GRACE: Duration = Duration::from_secs(30);

/// What a connection has identified itself as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Unknown,
    Server,
    Client,
}

/// Per-connection state.
#[derive(Debug)]
struct Session {
    role: Mutex<Role>,
    /// The client record bound to this connection, once registered.
    client: Mutex<Option<NodeId>>,
}

impl Session {
    fn new() -> Self {
        Self {
            role: Mutex::new(Role::Unknown),
            client: Mutex::new(None),
        }
    }

    fn register_server(&self) -> LocusResult<()> {
        let mut role = self.role.lock();
        match *role {
            Role::Client => Err(LocusError::PermissionDenied),
            _ => {
                *role = Role::Server;
                Ok(())
            }
        }
    }

    fn register_client(&self) -> LocusResult<()> {
        let mut role = self.role.lock();
        match *role {
            Role::Server => Err(LocusError::PermissionDenied),
            _ => {
                *role = Role::Client;
                Ok(())
            }
        }
    }

    fn check_server(&self) -> LocusResult<()> {
        (*self.role.lock() == Role::Server)
            .then_some(())
            .ok_or(LocusError::PermissionDenied)
    }

    fn check_client(&self) -> LocusResult<()> {
        (*self.role.lock() == Role::Client)
            .then_some(())
            .ok_or(LocusError::PermissionDenied)
    }

    fn check_known(&self) -> LocusResult<Role> {
        let role = *self.role.lock();
        (role != Role::Unknown)
            .then_some(role)
            .ok_or(LocusError::PermissionDenied)
    }

    fn bound_client(&self) -> Option<NodeId> {
        *self.client.lock()
    }

    fn bind_client(&self, id: Option<NodeId>) {
        *self.client.lock() = id;
    }
}

struct StateInner {
    table: Mutex<Table>,
    sessions: DashMap<u64, Arc<Session>>,
    ctx: OnceLock<RpcContext>,
}

/// The shared state of one server process: the partition table, the
/// client registry inside it, and the per-connection sessions.
#[derive(Clone)]
pub struct ServerState {
    inner: Arc<StateInner>,
}

impl ServerState {
    /// Creates the state for a server at the given resolution.
    pub fn new(resolution: u8) -> LocusResult<Self> {
        Ok(Self {
            inner: Arc::new(StateInner {
                table: Mutex::new(Table::new(resolution)?),
                sessions: DashMap::new(),
                ctx: OnceLock::new(),
            }),
        })
    }

    /// Installs the RPC context once it exists (the context needs the
    /// dispatcher first, so construction is two-phase).
    pub fn install_ctx(&self, ctx: RpcContext) {
        if self.inner.ctx.set(ctx).is_err() {
            panic!("rpc context installed twice");
        }
    }

    pub(crate) fn ctx(&self) -> &RpcContext {
        self.inner.ctx.get().expect("rpc context not installed")
    }

    /// The partition table, for startup and introspection.
    pub fn table(&self) -> &Mutex<Table> {
        &self.inner.table
    }

    fn own_address(&self) -> Address {
        self.ctx()
            .listening_address()
            .expect("server is not listening")
    }

    fn session(&self, peer_id: u64) -> Arc<Session> {
        self.inner
            .sessions
            .entry(peer_id)
            .or_insert_with(|| Arc::new(Session::new()))
            .clone()
    }

    /// Returns a peer known to be a server at `address`, performing the
    /// `server_hello` handshake when dialing it for the first time.
    pub(crate) async fn server_peer(&self, address: Address) -> LocusResult<Arc<Peer>> {
        if address == self.own_address() {
            return Err(LocusError::LoopDetected);
        }
        if self.ctx().has_peer(&address) {
            return self.ctx().get_peer(address).await;
        }

        let peer = self.ctx().get_peer(address).await?;
        // our requests on this connection are server requests; mark the
        // session before anything can arrive on it
        self.session(peer.id()).register_server()?;
        peer.call(&Request::ServerHello {
            address: self.own_address(),
        })
        .await?;
        info!("registered with {address}");
        Ok(peer)
    }

    // ------------------------------------------------------------------
    // load balancing driver
    // ------------------------------------------------------------------

    /// Runs one load-balancing round against a freshly connected peer:
    /// announces every range, and hands over the offered ones.
    pub(crate) async fn load_balance_with(self, peer: Arc<Peer>) {
        let actions = self.inner.table.lock().load_balance();
        let own = self.own_address();
        let peer_name = peer
            .listening_address()
            .map_or_else(|| peer.remote_addr().to_string(), |a| a.to_string());

        for action in actions {
            match action {
                BalanceAction::InformOwn { range } => {
                    debug!("informing {peer_name} that {range} is ours");
                    if let Err(e) = peer
                        .call(&Request::AddRemoteRange {
                            range,
                            address: own,
                        })
                        .await
                    {
                        warn!("failed to inform peer of range {range}: {e}");
                    }
                }
                BalanceAction::InformOther { range, address } => {
                    debug!("informing {peer_name} that {range} belongs to {address}");
                    if let Err(e) = peer
                        .call(&Request::AddRemoteRange { range, address })
                        .await
                    {
                        warn!("failed to inform peer of range {range}: {e}");
                    }
                }
                BalanceAction::Relinquish { range } => {
                    debug!("relinquishing {range} to {peer_name}");
                    self.relinquish(&peer, range).await;
                }
            }
        }
    }

    /// Hands one locally owned range to `peer`: the peer takes control
    /// first, then the clients follow, then the table flips the entry.
    async fn relinquish(&self, peer: &Arc<Peer>, range: NodeIdRange) {
        if let Err(e) = peer.call(&Request::ControlRange { range }).await {
            // the range simply stays ours
            warn!("failed to relinquish range {range}: {e}");
            return;
        }

        let clients = self.inner.table.lock().clients_in_range(&range);
        for client in clients {
            let Some(address) = client.address else {
                warn!("client {} has no address, dropping", client.id);
                self.inner.table.lock().forget_client(&client.id);
                continue;
            };
            let result = peer
                .call(&Request::AdoptClient {
                    id: client.id,
                    point: client.point,
                    address,
                    metadata: client.metadata.clone(),
                })
                .await;
            if let Err(e) = result {
                // nothing to be done: the range is already promised
                // away, and the client will eventually re-register
                warn!("failed to transfer client {}: {e}", client.id);
            }
        }

        self.inner
            .table
            .lock()
            .release_range(&range, Some(Arc::clone(peer)), peer.listening_address());
    }

    // ------------------------------------------------------------------
    // handlers
    // ------------------------------------------------------------------

    async fn handle(&self, peer: &Arc<Peer>, request: Request) -> LocusResult<Reply> {
        let session = self.session(peer.id());
        match request {
            Request::ServerHello { address } => {
                self.handle_server_hello(peer, &session, address).await
            }
            Request::ClientHello {
                address,
                prior_id,
                point,
            } => {
                self.handle_client_hello(peer, &session, address, prior_id, point)
                    .await
            }
            Request::AddRemoteRange { range, address } => {
                self.handle_add_remote_range(&session, range, address).await
            }
            Request::ControlRange { range } => self.handle_control_range(&session, range),
            Request::AdoptClient {
                id,
                point,
                address,
                metadata,
            } => self.handle_adopt_client(&session, id, point, address, metadata),
            Request::FindControllingServer { id } => {
                session.check_known()?;
                self.find_controlling_server(id).await
            }
            Request::FindServerForPoint { point } => {
                session.check_known()?;
                let mut point = point;
                point.canonicalize();
                let id = self.inner.table.lock().node_id_for_point(&point)?;
                self.find_controlling_server(id).await
            }
            Request::SetLocation { point } => {
                self.handle_set_location(&session, point).await
            }
            Request::SetMetadata { key, value } => {
                self.handle_set_metadata(&session, key, value)
            }
            Request::GetMetadata { id, key } => self.handle_get_metadata(&session, id, key),
            Request::FindClientAddress { id } => self.handle_find_client_address(&session, id),
            Request::SearchClients { lower, upper } => {
                self.handle_search_clients(&session, lower, upper).await
            }
        }
    }

    async fn handle_server_hello(
        &self,
        peer: &Arc<Peer>,
        session: &Session,
        address: Address,
    ) -> LocusResult<Reply> {
        info!("received server hello from {address}");
        if address == self.own_address() {
            return Err(LocusError::LoopDetected);
        }
        session.register_server()?;
        self.ctx().register_listening_address(peer, address);

        // balance in the background; the hello reply does not wait for
        // the handoffs
        let state = self.clone();
        let peer = Arc::clone(peer);
        tokio::spawn(async move {
            state.load_balance_with(peer).await;
        });
        Ok(Reply::Empty)
    }

    async fn handle_client_hello(
        &self,
        peer: &Arc<Peer>,
        session: &Session,
        address: Address,
        prior_id: NodeId,
        mut point: GeoPoint,
    ) -> LocusResult<Reply> {
        info!("received client hello from {address}");
        session.register_client()?;
        point.canonicalize();
        self.ctx().register_listening_address(peer, address);

        let mut table = self.inner.table.lock();
        let lookup = match session.bound_client() {
            Some(id) if table.client(&id).is_some() => ClientLookup::Existing(id),
            _ => table.get_or_create_client(prior_id, point)?,
        };

        let (result, id) = match lookup {
            ClientLookup::NotOurs => {
                info!("rejecting registration, not our responsibility");
                (RegistrationResult::WrongServer, NodeId::ZERO)
            }
            ClientLookup::Created(id) => {
                info!("assuming control of new client {id}");
                let entry = table.client_mut(&id).expect("just created");
                entry.peer = Some(Arc::clone(peer));
                entry.address = Some(address);
                entry.registered = true;
                session.bind_client(Some(id));
                (RegistrationResult::Created, id)
            }
            ClientLookup::Existing(id) => {
                let registered = {
                    let entry = table.client_mut(&id).expect("looked up");
                    entry.peer = Some(Arc::clone(peer));
                    entry.address = Some(address);
                    entry.registered
                };
                if registered {
                    // an already registered record: move it to where
                    // the client now claims to be
                    match table.move_client(&id, point)? {
                        MoveOutcome::Local { new_id } => {
                            session.bind_client(Some(new_id));
                            (RegistrationResult::AlreadyExists, new_id)
                        }
                        MoveOutcome::Moved { new_id, .. } => {
                            // the client moved out from under us; it
                            // must register with the right server and
                            // upload its metadata from scratch
                            table.forget_client(&new_id);
                            session.bind_client(None);
                            (RegistrationResult::WrongServer, NodeId::ZERO)
                        }
                    }
                } else {
                    table.client_mut(&id).expect("looked up").registered = true;
                    session.bind_client(Some(id));
                    (RegistrationResult::Created, id)
                }
            }
        };
        Ok(Reply::ClientHello { result, id })
    }

    async fn handle_add_remote_range(
        &self,
        session: &Session,
        range: NodeIdRange,
        address: Address,
    ) -> LocusResult<Reply> {
        session.check_server()?;
        info!("found new owner for range {range}: {address}");
        if !self.inner.table.lock().is_valid_range(&range) {
            return Err(LocusError::invalid_argument("range finer than resolution"));
        }
        if address == self.own_address() {
            // an announcement about ourselves carries no news
            debug!("ignoring remote announcement of our own address");
            return Ok(Reply::Empty);
        }

        let peer = self.server_peer(address).await?;
        self.inner
            .table
            .lock()
            .add_remote(range, Some(peer), Some(address))?;
        Ok(Reply::Empty)
    }

    fn handle_control_range(&self, session: &Session, range: NodeIdRange) -> LocusResult<Reply> {
        session.check_server()?;
        info!("taking control of range {range}");
        let mut table = self.inner.table.lock();
        if !table.is_valid_range(&range) {
            return Err(LocusError::invalid_argument("range finer than resolution"));
        }
        table.add_local(range, None);
        Ok(Reply::Empty)
    }

    fn handle_adopt_client(
        &self,
        session: &Session,
        id: NodeId,
        mut point: GeoPoint,
        address: Address,
        metadata: std::collections::BTreeMap<String, String>,
    ) -> LocusResult<Reply> {
        session.check_server()?;
        if !id.is_set() {
            return Err(LocusError::invalid_argument("unset node id"));
        }
        point.canonicalize();

        let mut table = self.inner.table.lock();
        let lookup = table.get_or_create_client(id, point)?;
        let id = match lookup {
            ClientLookup::NotOurs => {
                // the handing server's view is stale; it must look up
                // the authority again
                return Err(LocusError::AccessDenied);
            }
            ClientLookup::Created(id) | ClientLookup::Existing(id) => id,
        };
        let entry = table.client_mut(&id).expect("just created");
        entry.address = Some(address);
        entry.metadata = metadata;
        entry.registered = true;
        info!("adopted client {id} at {address}");
        Ok(Reply::Empty)
    }

    /// Locates the authority for `id`, forwarding through the remote
    /// owner when the range is not ours and narrowing our own table
    /// with the answer.
    async fn find_controlling_server(&self, id: NodeId) -> LocusResult<Reply> {
        debug!("looking up controlling server for {id}");
        let (peer, address) = {
            let table = self.inner.table.lock();
            let entry = table.find_authority(&id);
            match &entry.authority {
                Authority::Local(_) => {
                    return Ok(Reply::AddressAndRange {
                        address: self.own_address(),
                        range: entry.range,
                    });
                }
                Authority::Remote(remote) => (remote.peer.clone(), remote.address),
            }
        };

        // resolve a connection to whoever we believe knows better
        let peer = match peer.filter(|p| !p.is_closed()) {
            Some(peer) => peer,
            None => match address {
                Some(address) => self.server_peer(address).await?,
                None => return Err(LocusError::Unavailable),
            },
        };

        let reply = peer.call(&Request::FindControllingServer { id }).await?;
        let Reply::AddressAndRange { address, range } = reply else {
            return Err(LocusError::peer_misbehavior("unexpected lookup reply"));
        };

        {
            let table = self.inner.table.lock();
            let entry = table.find_authority(&id);
            if entry.authority.is_local() {
                // we became the owner while asking around
                return Ok(Reply::AddressAndRange {
                    address: self.own_address(),
                    range: entry.range,
                });
            }
            if !entry.range.contains_range(&range) && !range.contains_range(&entry.range) {
                return Err(LocusError::peer_misbehavior(
                    "returned range does not fit the table",
                ));
            }
        }
        if address == self.own_address() {
            return Err(LocusError::LoopDetected);
        }

        let owner = self.server_peer(address).await?;
        if let Err(e) = self
            .inner
            .table
            .lock()
            .add_remote(range, Some(owner), Some(address))
        {
            debug!("could not narrow table with {range}: {e}");
        }
        Ok(Reply::AddressAndRange { address, range })
    }

    async fn handle_set_location(
        &self,
        session: &Session,
        mut point: GeoPoint,
    ) -> LocusResult<Reply> {
        session.check_client()?;
        let Some(id) = session.bound_client() else {
            return Err(LocusError::NoSuchDevice);
        };
        point.canonicalize();
        info!("moving client {id} to {point}");

        let (outcome, snapshot) = {
            let mut table = self.inner.table.lock();
            let outcome = table.move_client(&id, point)?;
            let snapshot = match &outcome {
                MoveOutcome::Moved { new_id, .. } => table.client(new_id).cloned(),
                MoveOutcome::Local { .. } => None,
            };
            (outcome, snapshot)
        };

        match outcome {
            MoveOutcome::Local { new_id } => {
                session.bind_client(Some(new_id));
                Ok(Reply::SetLocation {
                    result: LocationResult::SameServer,
                    id: new_id,
                    address: self.own_address(),
                })
            }
            MoveOutcome::Moved { new_id, target } => {
                let entry = snapshot.ok_or(LocusError::NoSuchDevice)?;
                let client_address = entry.address.ok_or(LocusError::NoSuchDevice)?;

                let peer = match target.peer.filter(|p| !p.is_closed()) {
                    Some(peer) => peer,
                    None => match target.address {
                        Some(address) => self.server_peer(address).await?,
                        None => {
                            // unknown owner: drop the record, the
                            // client restarts registration
                            self.inner.table.lock().forget_client(&new_id);
                            session.bind_client(None);
                            return Err(LocusError::NoSuchDevice);
                        }
                    },
                };
                let new_server = peer
                    .listening_address()
                    .or(target.address)
                    .ok_or(LocusError::Unavailable)?;
                info!("transferring client {new_id} to {new_server}");

                let result = peer
                    .call(&Request::AdoptClient {
                        id: new_id,
                        point,
                        address: client_address,
                        metadata: entry.metadata.clone(),
                    })
                    .await;

                // the record leaves this server either way; on failure
                // the client will re-register from scratch
                self.inner.table.lock().forget_client(&new_id);
                session.bind_client(None);
                result?;

                Ok(Reply::SetLocation {
                    result: LocationResult::DifferentServer,
                    id: new_id,
                    address: new_server,
                })
            }
        }
    }

    fn handle_set_metadata(
        &self,
        session: &Session,
        key: String,
        value: String,
    ) -> LocusResult<Reply> {
        session.check_client()?;
        let Some(id) = session.bound_client() else {
            return Err(LocusError::NoSuchDevice);
        };
        debug!("setting metadata {key}={value} for client {id}");

        let mut table = self.inner.table.lock();
        let entry = table.client_mut(&id).ok_or(LocusError::NoSuchDevice)?;
        entry.metadata.insert(key, value);
        Ok(Reply::Empty)
    }

    fn handle_get_metadata(
        &self,
        session: &Session,
        id: NodeId,
        key: String,
    ) -> LocusResult<Reply> {
        session.check_client()?;
        if !id.is_set() {
            return Err(LocusError::invalid_argument("unset node id"));
        }

        let table = self.inner.table.lock();
        let entry = table.client(&id).ok_or(LocusError::NotFound)?;
        let value = entry.metadata.get(&key).ok_or(LocusError::NotFound)?;
        Ok(Reply::Metadata {
            value: value.clone(),
        })
    }

    fn handle_find_client_address(&self, session: &Session, id: NodeId) -> LocusResult<Reply> {
        session.check_client()?;
        if !id.is_set() {
            return Err(LocusError::invalid_argument("unset node id"));
        }

        let table = self.inner.table.lock();
        let entry = table.client(&id).ok_or(LocusError::NotFound)?;
        let address = entry.address.ok_or(LocusError::NotFound)?;
        Ok(Reply::ClientAddress { address })
    }

    async fn handle_search_clients(
        &self,
        session: &Session,
        mut lower: GeoPoint,
        mut upper: GeoPoint,
    ) -> LocusResult<Reply> {
        let role = session.check_known()?;
        lower.canonicalize();
        upper.canonicalize();

        let ids = if role == Role::Server {
            // the asking server is already fanning out; answer from
            // our own intervals only
            self.inner.table.lock().search_local(&lower, &upper)
        } else {
            search::fan_out(self, lower, upper).await?
        };
        Ok(Reply::NodeIds { ids })
    }

    /// A connection died: drop its session, and forget its client
    /// record unless the client comes back within the grace period.
    fn connection_lost(&self, peer: &Arc<Peer>) {
        self.inner.sessions.remove(&peer.id());

        let ids = self.inner.table.lock().clients_bound_to(peer.id());
        for id in ids {
            let state = self.clone();
            let peer_id = peer.id();
            tokio::spawn(async move {
                sleep(DISCONNECT_GRACE).await;
                let mut table = state.inner.table.lock();
                let still_gone = table
                    .client(&id)
                    .and_then(|entry| entry.peer.as_ref())
                    .is_some_and(|p| p.id() == peer_id && p.is_closed());
                if still_gone {
                    info!("forgetting disconnected client {id}");
                    table.forget_client(&id);
                }
            });
        }
    }
}

impl Dispatcher for ServerState {
    fn dispatch(
        &self,
        peer: Arc<Peer>,
        request_id: u64,
        request: Request,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let opcode = request.opcode();
            match self.handle(&peer, request).await {
                Ok(reply) => peer.send_reply(request_id, opcode, &reply).await,
                Err(e) => {
                    debug!("request {opcode} failed: {e}");
                    peer.send_error(request_id, opcode.as_u16(), e.code()).await;
                }
            }
        })
    }

    fn peer_disconnected(&self, peer: Arc<Peer>) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.connection_lost(&peer);
        })
    }
}
