//! Multi-authority spatial search.
//!
//! The coordinator gathers local matches synchronously from the
//! partition table, then queries every remote authority intersecting
//! the rectangle concurrently. The whole query fails with the first
//! error; otherwise the result sets are concatenated.

use futures::future::try_join_all;
use tracing::debug;

use locus_common::{GeoPoint, LocusError, LocusResult, NodeId};
use locus_rpc::{Reply, Request};

use crate::session::ServerState;

/// Runs a full fan-out search across every authority intersecting the
/// rectangle.
pub(crate) async fn fan_out(
    state: &ServerState,
    lower: GeoPoint,
    upper: GeoPoint,
) -> LocusResult<Vec<NodeId>> {
    let (mut ids, targets) = state.table().lock().plan_search(&lower, &upper)?;
    if targets.is_empty() {
        return Ok(ids);
    }
    debug!("search fans out to {} remote authorities", targets.len());

    let calls = targets.into_iter().map(|target| async move {
        let peer = match target.peer.filter(|p| !p.is_closed()) {
            Some(peer) => peer,
            None => match target.address {
                Some(address) => state.server_peer(address).await?,
                None => return Err(LocusError::Unavailable),
            },
        };
        match peer.call(&Request::SearchClients { lower, upper }).await? {
            Reply::NodeIds { ids } => Ok(ids),
            _ => Err(LocusError::peer_misbehavior("unexpected search reply")),
        }
    });

    for batch in try_join_all(calls).await? {
        ids.extend(batch);
    }
    Ok(ids)
}
