//! Remote Node Communication
//!
//! Shared abstractions between the redistribution logic and the cluster
//! transport: the [`RemotePeer`] trait, its error type, and the peer set.

mod peer;

pub use peer::{
    Advertisement, PeerDirectory, RemoteError, RemotePeer, RemotePeerStatus, RemotePeers,
};
