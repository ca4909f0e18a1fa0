//! MeshKV TCP server
//!
//! Every node accepts clients and peers on one listener. Each connection
//! carries exactly one request: it is read, dispatched against the hash ring,
//! answered with one line, and closed. Connections are handled on their own
//! tasks, so a slow peer only holds up the request waiting on it.

use crate::{
    error::{MeshKvError, Result},
    peer::{PeerClient, PeerClientConfig, PEER_ERROR},
    protocol::{
        parse_key_list, parse_request, read_request, strip_line_ending, Command, ReadMode,
        Request, Response, Scope,
    },
    queue::{spawn_write_applier, PendingWriteQueue, Producer, WriteEntry},
    ring::{HashRing, NodeAddr, RoutingStrategy},
    store::IndexedStore,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::{broadcast, RwLock},
    task::JoinSet,
    time::timeout,
};
use tracing::{debug, info, warn};

/// MeshKV node configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Identity this node hashes to on the ring. Port 0 means the bound port.
    pub node: NodeAddr,
    pub peers: Vec<NodeAddr>,
    pub routing: RoutingStrategy,
    pub read_mode: ReadMode,
    /// Upper bound on a request's size in bytes
    pub read_buffer: usize,
    pub client_read_timeout: Duration,
    pub peer: PeerClientConfig,
    pub write_queue_capacity: usize,
    pub applier_poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8081)),
            node: NodeAddr::new("0.0.0.0", 0),
            peers: Vec::new(),
            routing: RoutingStrategy::default(),
            read_mode: ReadMode::default(),
            read_buffer: 1024,
            client_read_timeout: Duration::from_secs(10),
            peer: PeerClientConfig::default(),
            write_queue_capacity: 1000,
            applier_poll_interval: Duration::from_millis(10),
        }
    }
}

/// State shared by every connection handler
pub(crate) struct NodeContext {
    ring: RwLock<HashRing>,
    store: IndexedStore,
    peer_client: PeerClient,
    read_mode: ReadMode,
    read_buffer: usize,
    client_read_timeout: Duration,
}

impl NodeContext {
    fn new(ring: HashRing, store: IndexedStore, config: &ServerConfig) -> Self {
        Self {
            ring: RwLock::new(ring),
            store,
            peer_client: PeerClient::new(config.peer.clone()),
            read_mode: config.read_mode,
            read_buffer: config.read_buffer,
            client_read_timeout: config.client_read_timeout,
        }
    }

    /// Serve one connection: one request, one response, then close
    async fn handle_connection(self: &Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let read = read_request(&mut stream, self.read_mode, self.read_buffer);
        let request = match timeout(self.client_read_timeout, read).await {
            Ok(Ok(Some(request))) => request,
            Ok(Ok(None)) => {
                debug!("client disconnected before sending a request");
                return Ok(());
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(MeshKvError::Timeout(self.client_read_timeout)),
        };
        debug!(%request, "received request");

        let response = self.process_request(&request).await;
        debug!(response = %response.to_line(), "sending response");

        stream.write_all(&response.to_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Parse and execute a request line
    async fn process_request(self: &Arc<Self>, line: &str) -> Response {
        let request = match parse_request(line) {
            Ok(request) => request,
            Err(MeshKvError::Protocol(reason)) => {
                warn!(%reason, "malformed request");
                return Response::Error(reason);
            }
            Err(MeshKvError::InvalidCommand(command)) => {
                warn!(%command, "invalid command");
                return Response::InvalidCommand;
            }
            Err(e) => {
                warn!(error = %e, "failed to parse request");
                return server_exception();
            }
        };

        // a panic while executing must not take the connection down with it
        let ctx = Arc::clone(self);
        match tokio::spawn(async move { ctx.execute(request).await }).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "command execution failed");
                server_exception()
            }
        }
    }

    async fn execute(&self, request: Request) -> Response {
        let scope = request.scope;
        match request.command {
            Command::Put { key, value } => self.put(key, value, scope).await,
            Command::Get { key } => self.get(key, scope).await,
            Command::Remove { key } => self.remove(key, scope).await,
            Command::Range { start, end } => {
                let local = self.store.range_query(&start, &end).await;
                self.gather(local, Command::Range { start, end }, scope).await
            }
            Command::Prefix { prefix } => {
                let local = self.store.prefix_scan(&prefix).await;
                self.gather(local, Command::Prefix { prefix }, scope).await
            }
        }
    }

    /// Owner of `key` when it is another node; `None` when served here
    async fn remote_owner(&self, key: &str, scope: Scope) -> Option<NodeAddr> {
        if scope == Scope::Local {
            return None;
        }
        let ring = self.ring.read().await;
        let owner = ring.resolve(key);
        if ring.is_local(owner) {
            None
        } else {
            Some(owner.addr().clone())
        }
    }

    async fn forward(&self, owner: &NodeAddr, command: Command) -> String {
        let line = Request::forwarded(command).to_line();
        let reply = self.peer_client.send(owner, &line).await;
        strip_line_ending(&reply).to_string()
    }

    async fn put(&self, key: String, value: String, scope: Scope) -> Response {
        match self.remote_owner(&key, scope).await {
            None => {
                self.store.put(key, value).await;
                Response::Ok
            }
            Some(owner) => match self.forward(&owner, Command::Put { key, value }).await.as_str() {
                "OK" => Response::Ok,
                _ => Response::Failed,
            },
        }
    }

    async fn get(&self, key: String, scope: Scope) -> Response {
        match self.remote_owner(&key, scope).await {
            None => match self.store.get(&key).await {
                Some(value) => Response::Value(value),
                None => Response::NotFound,
            },
            Some(owner) => {
                let reply = self.forward(&owner, Command::Get { key }).await;
                match reply.as_str() {
                    "" | "NOT_FOUND" => Response::NotFound,
                    PEER_ERROR => Response::Failed,
                    _ => Response::Value(reply),
                }
            }
        }
    }

    async fn remove(&self, key: String, scope: Scope) -> Response {
        match self.remote_owner(&key, scope).await {
            None => {
                if self.store.remove(&key).await {
                    Response::Ok
                } else {
                    Response::NotFound
                }
            }
            Some(owner) => match self.forward(&owner, Command::Remove { key }).await.as_str() {
                "OK" => Response::Ok,
                PEER_ERROR => Response::Failed,
                _ => Response::NotFound,
            },
        }
    }

    /// Merge `local` with the same scan run on every other node.
    ///
    /// Peers that fail or answer `NONE` contribute no keys. A key reported
    /// by more than one node (e.g. a peer entry aliasing this node) is listed
    /// once.
    async fn gather(&self, local: Vec<String>, command: Command, scope: Scope) -> Response {
        let mut keys = local;
        if scope == Scope::Cluster {
            let peers = self.ring.read().await.peers();
            let line = Request::forwarded(command).to_line();

            let mut requests = JoinSet::new();
            for peer in peers {
                let client = self.peer_client.clone();
                let line = line.clone();
                requests.spawn(async move { client.send(&peer, &line).await });
            }
            while let Some(joined) = requests.join_next().await {
                match joined {
                    Ok(reply) => keys.extend(parse_key_list(&reply)),
                    Err(e) => warn!(error = %e, "peer scan task failed"),
                }
            }
        }
        keys.sort();
        keys.dedup();
        Response::Keys(keys)
    }
}

fn server_exception() -> Response {
    Response::Error("Server exception".to_string())
}

/// MeshKV TCP server
pub struct MeshKvServer {
    listener: TcpListener,
    node: NodeAddr,
    ctx: Arc<NodeContext>,
    write_queue: Mutex<Producer<WriteEntry>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl MeshKvServer {
    /// Bind the listener and start the buffered-write applier.
    ///
    /// Failing to bind is the only fatal startup error.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        let bound = listener.local_addr()?;

        let mut node = config.node.clone();
        if node.port == 0 {
            node.port = bound.port();
        }
        let ring = HashRing::with_peers(node.clone(), config.peers.iter().cloned(), config.routing);
        info!(
            node = %node,
            members = ring.len(),
            routing = ?ring.strategy(),
            "initialized hash ring"
        );

        let store = IndexedStore::new();
        let (producer, consumer) = PendingWriteQueue::with_capacity(config.write_queue_capacity);
        let (shutdown_tx, _) = broadcast::channel(1);
        spawn_write_applier(
            consumer,
            store.clone(),
            config.applier_poll_interval,
            shutdown_tx.subscribe(),
        );

        Ok(Self {
            listener,
            node,
            ctx: Arc::new(NodeContext::new(ring, store, &config)),
            write_queue: Mutex::new(producer),
            shutdown_tx,
        })
    }

    /// Accept connections until [`shutdown`](Self::shutdown) is called
    pub async fn run(&self) -> Result<()> {
        info!(listen = %self.local_addr()?, node = %self.node, "MeshKV node listening");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!(client = %addr, "accepted connection");
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                if let Err(e) = ctx.handle_connection(stream).await {
                                    warn!(client = %addr, error = %e, "error handling connection");
                                }
                                debug!(client = %addr, "closed connection");
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, stopping server");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Add a node to the ring at runtime. Returns false if already a member.
    pub async fn add_node(&self, addr: NodeAddr) -> bool {
        let added = self.ctx.ring.write().await.add_node(addr.clone());
        if added {
            info!(node = %addr, "added node to ring");
        }
        added
    }

    /// Buffer a local write for the background applier.
    ///
    /// Returns false without blocking when the buffer is full.
    pub fn enqueue_write(&self, key: String, value: String) -> bool {
        let mut producer = self.write_queue.lock().unwrap_or_else(PoisonError::into_inner);
        producer.enqueue((key, value)).is_ok()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Ring identity of this node
    pub fn node(&self) -> &NodeAddr {
        &self.node
    }

    pub async fn ring(&self) -> HashRing {
        self.ctx.ring.read().await.clone()
    }

    /// Store holding the keys this node owns
    pub fn store(&self) -> &IndexedStore {
        &self.ctx.store
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .map_err(|_| MeshKvError::Server("Failed to send shutdown signal".to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_with(local: NodeAddr, peers: Vec<NodeAddr>, routing: RoutingStrategy) -> Arc<NodeContext> {
        let config = ServerConfig {
            peer: PeerClientConfig {
                io_timeout: Duration::from_millis(500),
                retry: crate::peer::RetryPolicy {
                    attempts: 3,
                    base_delay: Duration::from_millis(5),
                },
                read_buffer: 1024,
            },
            ..ServerConfig::default()
        };
        let ring = HashRing::with_peers(local, peers, routing);
        Arc::new(NodeContext::new(ring, IndexedStore::new(), &config))
    }

    fn single_node() -> Arc<NodeContext> {
        context_with(NodeAddr::new("127.0.0.1", 8081), vec![], RoutingStrategy::default())
    }

    async fn send(ctx: &Arc<NodeContext>, line: &str) -> String {
        ctx.process_request(line).await.to_line()
    }

    #[tokio::test]
    async fn test_single_node_put_get() {
        let ctx = single_node();
        assert_eq!(send(&ctx, "PUT a 1").await, "OK");
        assert_eq!(send(&ctx, "PUT b 2").await, "OK");
        assert_eq!(send(&ctx, "GET a").await, "1");
        assert_eq!(send(&ctx, "GET c").await, "NOT_FOUND");
        assert_eq!(send(&ctx, "RANGE a b").await, "a b ");
        assert_eq!(send(&ctx, "RANGE x z").await, "NONE");
    }

    #[tokio::test]
    async fn test_remove() {
        let ctx = single_node();
        assert_eq!(send(&ctx, "REMOVE k").await, "NOT_FOUND");
        assert_eq!(send(&ctx, "PUT k v").await, "OK");
        assert_eq!(send(&ctx, "REMOVE k").await, "OK");
        assert_eq!(send(&ctx, "GET k").await, "NOT_FOUND");
        assert_eq!(send(&ctx, "PREFIX k").await, "NONE");
    }

    #[tokio::test]
    async fn test_prefix_run_semantics() {
        let ctx = single_node();
        for key in ["apple", "apricot", "banana"] {
            assert_eq!(send(&ctx, &format!("PUT {} x", key)).await, "OK");
        }
        assert_eq!(send(&ctx, "PREFIX ap").await, "apple apricot ");
        assert_eq!(send(&ctx, "PREFIX apr").await, "apricot ");
        assert_eq!(send(&ctx, "PREFIX c").await, "NONE");
    }

    #[tokio::test]
    async fn test_error_responses() {
        let ctx = single_node();
        assert_eq!(send(&ctx, "PUT a").await, "ERROR: PUT requires key and value");
        assert_eq!(send(&ctx, "GET").await, "ERROR: GET requires key");
        assert_eq!(send(&ctx, "REMOVE").await, "ERROR: REMOVE requires key");
        assert_eq!(send(&ctx, "RANGE a").await, "ERROR: RANGE requires start and end keys");
        assert_eq!(send(&ctx, "PREFIX").await, "ERROR: PREFIX requires prefix");
        assert_eq!(send(&ctx, "INVALID").await, "INVALID_COMMAND");
        assert_eq!(send(&ctx, "").await, "INVALID_COMMAND");
    }

    #[tokio::test]
    async fn test_unreachable_owner_reports_failure() {
        let dead = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            NodeAddr::new("127.0.0.1", listener.local_addr().unwrap().port())
        };
        let ctx = context_with(
            NodeAddr::new("127.0.0.1", 1),
            vec![dead],
            RoutingStrategy::Successor,
        );

        let key = {
            let ring = ctx.ring.read().await;
            (0..1000)
                .map(|i| format!("key{}", i))
                .find(|k| !ring.is_local(ring.resolve(k)))
                .expect("some key routes to the peer")
        };

        assert_eq!(send(&ctx, &format!("PUT {} v", key)).await, "ERROR");
        assert_eq!(send(&ctx, &format!("GET {}", key)).await, "ERROR");
        assert_eq!(send(&ctx, &format!("REMOVE {}", key)).await, "ERROR");
        assert!(ctx.store.is_empty().await);

        // the dead peer adds nothing to scans, local keys still come back
        assert_eq!(send(&ctx, "PUT zz 1 LOCAL").await, "OK");
        assert_eq!(send(&ctx, "RANGE a zzz").await, "zz ");
    }

    #[tokio::test]
    async fn test_local_scope_skips_routing() {
        let peer = NodeAddr::new("127.0.0.1", 9);
        let ctx = context_with(NodeAddr::new("127.0.0.1", 1), vec![peer], RoutingStrategy::Successor);
        for i in 0..20 {
            assert_eq!(send(&ctx, &format!("PUT key{} v LOCAL", i)).await, "OK");
        }
        assert_eq!(ctx.store.len().await, 20);
        assert_eq!(send(&ctx, "GET key3 LOCAL").await, "v");
        assert_eq!(send(&ctx, "PREFIX key1 LOCAL").await, "key1 key10 key11 key12 key13 key14 key15 key16 key17 key18 key19 ");
    }

    #[tokio::test]
    async fn test_server_bind_uses_bound_port() {
        let config = ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            node: NodeAddr::new("127.0.0.1", 0),
            ..ServerConfig::default()
        };
        let server = MeshKvServer::bind(config).await.unwrap();
        let port = server.local_addr().unwrap().port();
        assert_eq!(server.node(), &NodeAddr::new("127.0.0.1", port));
        assert_eq!(server.ring().await.len(), 1);

        assert!(server.add_node(NodeAddr::new("127.0.0.1", 1)).await);
        assert!(!server.add_node(NodeAddr::new("127.0.0.1", 1)).await);
        assert_eq!(server.ring().await.len(), 2);
        server.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_write_is_applied() {
        let config = ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            write_queue_capacity: 4,
            applier_poll_interval: Duration::from_millis(1),
            ..ServerConfig::default()
        };
        let server = MeshKvServer::bind(config).await.unwrap();
        assert!(server.enqueue_write("buffered".to_string(), "1".to_string()));

        for _ in 0..100 {
            if server.store().get("buffered").await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.store().get("buffered").await, Some("1".to_string()));
        assert_eq!(server.store().prefix_scan("buf").await, vec!["buffered"]);
        server.shutdown().unwrap();
    }
}
