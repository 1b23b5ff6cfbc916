//! Client id derivation.

use std::net::SocketAddr;

use sha2::{Digest, Sha256};
use troupe_protocol::ClientId;

/// Derives the id of a freshly accepted socket.
///
/// Hashes the socket identity (`peer -> local`) with SHA-256 and renders it
/// as 64 lowercase hex characters. Two live TCP connections never share a
/// four-tuple, so ids are unique among connected clients.
pub fn derive_client_id(peer_addr: SocketAddr, local_addr: SocketAddr) -> ClientId {
    let mut hasher = Sha256::new();
    hasher.update(format!("{peer_addr}->{local_addr}").as_bytes());
    let digest = hasher.finalize();
    ClientId::new(digest.iter().map(|b| format!("{b:02x}")).collect::<String>())
}
