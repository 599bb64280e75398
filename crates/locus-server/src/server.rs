//! Server bootstrap.

use std::sync::Arc;

use tokio::net::lookup_host;
use tracing::{info, warn};

use locus_common::constants::DEFAULT_PORT;
use locus_common::{Address, LocusError, LocusResult, NodeIdRange};
use locus_rpc::RpcContext;

use crate::config::ServerConfig;
use crate::session::ServerState;

/// A running Locus server.
///
/// Listens for peers and clients in background tasks; dropping the
/// handle does not stop them, the process lifetime does.
pub struct Server {
    state: ServerState,
    address: Address,
}

impl Server {
    /// Starts a server: binds the listener, then either assumes control
    /// of the whole curve (no peers configured) or registers with the
    /// configured peers and waits to be assigned ranges.
    pub async fn start(config: &ServerConfig) -> LocusResult<Server> {
        let listen: Address = config.listen.parse()?;
        let state = ServerState::new(config.resolution)?;
        let ctx = RpcContext::new(Arc::new(state.clone()));
        // install the context before the listener starts accepting, so
        // the first inbound request finds it
        state.install_ctx(ctx.clone());
        let address = ctx.listen(listen).await?;

        let mut peers = Vec::new();
        for name in &config.peers {
            match resolve_peer(name).await {
                Ok(addr) => peers.push(addr),
                Err(e) => warn!("cannot resolve peer {name}: {e}"),
            }
        }

        if peers.is_empty() {
            info!("no peers configured, assuming control of the whole curve");
            state.table().lock().add_local(NodeIdRange::UNIVERSAL, None);
        } else {
            for peer in peers {
                if let Err(e) = state.server_peer(peer).await {
                    warn!("failed to register with {peer}: {e}");
                }
            }
        }

        info!("server ready at {address} (resolution {})", config.resolution);
        Ok(Server { state, address })
    }

    /// The address the server is listening on.
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// The server's shared state, for inspection and tests.
    #[must_use]
    pub fn state(&self) -> &ServerState {
        &self.state
    }
}

/// Resolves a peer given as an address or a hostname with optional
/// port.
async fn resolve_peer(name: &str) -> LocusResult<Address> {
    if let Ok(addr) = name.parse::<Address>() {
        return Ok(addr);
    }

    // hostname form, with or without a port
    let query = if name.contains(':') {
        name.to_string()
    } else {
        format!("{name}:{DEFAULT_PORT}")
    };
    let mut addrs = lookup_host(query.as_str()).await?;
    addrs
        .next()
        .map(Address::new)
        .ok_or_else(|| LocusError::invalid_argument(format!("no address for {name:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_literal_address() {
        let addr = resolve_peer("127.0.0.1:9000").await.unwrap();
        assert_eq!(addr.port(), 9000);
        let addr = resolve_peer("127.0.0.1").await.unwrap();
        assert_eq!(addr.port(), DEFAULT_PORT);
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addr = resolve_peer("localhost:9000").await.unwrap();
        assert_eq!(addr.port(), 9000);
        let addr = resolve_peer("localhost").await.unwrap();
        assert_eq!(addr.port(), DEFAULT_PORT);
    }

    #[tokio::test]
    async fn test_lone_server_owns_everything() {
        let config = ServerConfig {
            listen: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        };
        let server = Server::start(&config).await.unwrap();
        let ranges = server.state().table().lock().ranges();
        assert_eq!(ranges, vec![(NodeIdRange::UNIVERSAL, true)]);
    }
}
