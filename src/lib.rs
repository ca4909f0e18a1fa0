//! MeshKV - a peer-to-peer in-memory key-value store
//!
//! Every process is both a storage node and a router:
//! - Consistent-hash ring over a static node set decides key ownership
//! - Owned keys live in memory next to a sorted range/prefix index
//! - Requests for keys owned elsewhere are forwarded to the owner
//! - RANGE and PREFIX scans gather results from every node
//!
//! Nothing is persisted; a restarted node starts empty.

pub mod error;
pub mod hash;
pub mod index;
pub mod peer;
pub mod protocol;
pub mod queue;
pub mod ring;
pub mod server;
pub mod store;

pub use error::{MeshKvError, Result};
pub use index::{RangeIndex, Run};
pub use peer::{PeerClient, PeerClientConfig, RetryPolicy, PEER_ERROR};
pub use protocol::{Command, ReadMode, Request, Response, Scope};
pub use queue::PendingWriteQueue;
pub use ring::{HashRing, Node, NodeAddr, RoutingStrategy};
pub use server::{MeshKvServer, ServerConfig};
pub use store::{IndexedStore, LocalStore};
