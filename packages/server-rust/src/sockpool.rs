//! Long-lived per-peer connection cache.
//!
//! Data-plane requests reuse an open socket to each peer instead of a
//! connect/close round trip per RPC. The cache keeps a fixed-width slot
//! array per node; every slot holds an optional connected stream and an
//! atomic in-use flag. When a grabbed slot index crosses the ¾ watermark
//! one background task doubles every entry's width. A slot miss falls
//! back to a one-shot connection (`idx = -1`) that is closed on release.
//! An RPC failure on a cached socket deletes it; the next `get`
//! revalidates the node by reconnecting.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use herd_core::proto::{ResultCode, SdReq, SdRsp};
use herd_core::{Node, NodeId};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::net::wire;

/// Initial slot count per node.
pub const DEFAULT_FDS_COUNT: usize = 8;

const fn watermark(count: usize) -> usize {
    count * 3 / 4
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Slot {
    in_use: AtomicBool,
    stream: Mutex<Option<TcpStream>>,
}

#[derive(Debug, Default)]
struct Entry {
    slots: RwLock<Vec<Slot>>,
}

impl Entry {
    fn with_width(width: usize) -> Self {
        let mut slots = Vec::with_capacity(width);
        slots.resize_with(width, Slot::default);
        Self {
            slots: RwLock::new(slots),
        }
    }

    /// Reserve any free slot; the reservation is exclusive until `put`
    /// or `del` clears the flag.
    fn acquire(&self) -> Option<usize> {
        let slots = self.slots.read();
        for (i, slot) in slots.iter().enumerate() {
            if slot
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(i);
            }
        }
        None
    }

    fn all_free(&self) -> bool {
        self.slots
            .read()
            .iter()
            .all(|s| !s.in_use.load(Ordering::Acquire))
    }

    fn grow_to(&self, width: usize) {
        let mut slots = self.slots.write();
        if slots.len() < width {
            slots.resize_with(width, Slot::default);
        }
    }
}

/// A socket checked out of the pool.
///
/// `idx >= 0` names a cached slot that must be returned with
/// [`SockPool::put`] or invalidated with [`SockPool::del`]; `idx == -1`
/// is a one-shot connection closed on release.
#[derive(Debug)]
pub struct PooledSock {
    pub stream: TcpStream,
    idx: isize,
}

// ---------------------------------------------------------------------------
// SockPool
// ---------------------------------------------------------------------------

/// The connection cache. Insert/erase/grow take the map writer lock;
/// slot acquire/release take the reader lock.
#[derive(Debug)]
pub struct SockPool {
    entries: RwLock<HashMap<NodeId, Arc<Entry>>>,
    fds_count: AtomicUsize,
    high_watermark: AtomicUsize,
    in_grow: AtomicBool,
    count: AtomicUsize,
    /// Back-reference for the background grow task.
    me: Weak<SockPool>,
}

impl SockPool {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            entries: RwLock::new(HashMap::new()),
            fds_count: AtomicUsize::new(DEFAULT_FDS_COUNT),
            high_watermark: AtomicUsize::new(watermark(DEFAULT_FDS_COUNT)),
            in_grow: AtomicBool::new(false),
            count: AtomicUsize::new(0),
            me: me.clone(),
        })
    }

    /// Current slot width (grows, never shrinks).
    #[must_use]
    pub fn slot_width(&self) -> usize {
        self.fds_count.load(Ordering::Acquire)
    }

    /// Number of cached nodes.
    #[must_use]
    pub fn cached_nodes(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Add a node to the cache so its connections can be pooled.
    pub fn add(&self, nid: NodeId) {
        let width = self.slot_width();
        let mut entries = self.entries.write();
        if entries.contains_key(&nid) {
            return;
        }
        entries.insert(nid, Arc::new(Entry::with_width(width)));
        let n = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(node = %nid, count = n, "sockpool add");
    }

    /// Add a whole membership view at once.
    pub fn add_group(&self, nodes: &[Node]) {
        for node in nodes {
            self.add(node.nid);
        }
    }

    /// Destroy a node's cached connections, unless some session still
    /// holds one of its slots; the holder will notice the dead peer and
    /// call [`SockPool::del`] itself.
    pub fn del_node(&self, nid: NodeId) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get(&nid) else {
            debug!(node = %nid, "sockpool del: already destroyed");
            return false;
        };
        if !entry.all_free() {
            debug!(node = %nid, "sockpool del: slot still held");
            return false;
        }
        entries.remove(&nid);
        let n = self.count.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!(node = %nid, count = n, "sockpool del");
        true
    }

    async fn connect(addr: SocketAddr) -> std::io::Result<TcpStream> {
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(r) => r,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            )),
        }
    }

    /// Connect to the node (io listener preferred, primary as fallback).
    async fn connect_node(nid: NodeId) -> std::io::Result<TcpStream> {
        match Self::connect(nid.io_target()).await {
            Ok(s) => Ok(s),
            Err(e) if nid.io_addr.is_some() => {
                warn!(node = %nid, %e, "io listener unreachable, trying primary");
                Self::connect(nid.primary()).await
            }
            Err(e) => Err(e),
        }
    }

    /// The node vanished from the cache but a caller still wants it; add
    /// it back iff it answers a probe connection.
    async fn revalidate(&self, nid: NodeId) -> bool {
        match Self::connect_node(nid).await {
            Ok(_probe) => {
                self.add(nid);
                true
            }
            Err(e) => {
                debug!(node = %nid, %e, "revalidate failed");
                false
            }
        }
    }

    fn check_watermark(&self, idx: usize) {
        if idx <= self.high_watermark.load(Ordering::Acquire) {
            return;
        }
        if self
            .in_grow
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let Some(pool) = self.me.upgrade() else {
            self.in_grow.store(false, Ordering::Release);
            return;
        };
        tokio::spawn(async move {
            tokio::task::spawn_blocking(move || pool.grow())
                .await
                .ok();
        });
    }

    fn grow(&self) {
        let entries = self.entries.write();
        let new_width = self.fds_count.load(Ordering::Acquire) * 2;
        for entry in entries.values() {
            entry.grow_to(new_width);
        }
        self.fds_count.store(new_width, Ordering::Release);
        self.high_watermark.store(watermark(new_width), Ordering::Release);
        self.in_grow.store(false, Ordering::Release);
        debug!(new_width, "sockpool slots grown");
    }

    fn grab(&self, nid: NodeId) -> Option<(Arc<Entry>, usize)> {
        let entries = self.entries.read();
        let entry = entries.get(&nid)?;
        let idx = entry.acquire()?;
        Some((Arc::clone(entry), idx))
    }

    /// Check a connection out of the pool.
    ///
    /// Prefers a cached slot (connecting it on first use), falls back to
    /// a one-shot connection when every slot is busy, and revalidates
    /// nodes that were dropped from the cache.
    pub async fn get(&self, nid: NodeId) -> Option<PooledSock> {
        loop {
            let Some((entry, idx)) = self.grab(nid) else {
                // Not cached (deleted after a crash, or never added).
                // Revalidate and retry; unreachable nodes get nothing.
                if self.revalidate(nid).await {
                    continue;
                }
                return self.get_oneshot(nid).await;
            };

            self.check_watermark(idx);

            let cached = entry.slots.read()[idx].stream.lock().take();
            let stream = match cached {
                Some(s) => s,
                None => match Self::connect_node(nid).await {
                    Ok(s) => {
                        debug!(node = %nid, idx, "new cached connection");
                        s
                    }
                    Err(e) => {
                        warn!(node = %nid, idx, %e, "connect failed");
                        entry.slots.read()[idx].in_use.store(false, Ordering::Release);
                        return None;
                    }
                },
            };
            return Some(PooledSock {
                stream,
                idx: idx as isize,
            });
        }
    }

    async fn get_oneshot(&self, nid: NodeId) -> Option<PooledSock> {
        match Self::connect(nid.primary()).await {
            Ok(stream) => Some(PooledSock { stream, idx: -1 }),
            Err(e) => {
                warn!(node = %nid, %e, "one-shot connect failed");
                None
            }
        }
    }

    /// Return a healthy socket. Cached slots become reusable; one-shot
    /// connections are closed.
    pub fn put(&self, nid: NodeId, sock: PooledSock) {
        if sock.idx < 0 {
            return; // dropped, closing the one-shot stream
        }
        let idx = sock.idx as usize;
        let entries = self.entries.read();
        if let Some(entry) = entries.get(&nid) {
            let slots = entry.slots.read();
            if let Some(slot) = slots.get(idx) {
                *slot.stream.lock() = Some(sock.stream);
                slot.in_use.store(false, Ordering::Release);
            }
        }
        // Entry gone: the node was deleted while we held the socket;
        // dropping the stream closes it.
    }

    /// Discard a broken socket and try to drop the whole node entry, so
    /// the next `get` revalidates the peer.
    pub fn del(&self, nid: NodeId, sock: PooledSock) {
        if sock.idx >= 0 {
            let idx = sock.idx as usize;
            let entries = self.entries.read();
            if let Some(entry) = entries.get(&nid) {
                let slots = entry.slots.read();
                if let Some(slot) = slots.get(idx) {
                    *slot.stream.lock() = None;
                    slot.in_use.store(false, Ordering::Release);
                }
            }
            drop(entries);
            self.del_node(nid);
        }
        drop(sock);
    }

    /// Execute one RPC against `nid` over a pooled socket.
    ///
    /// Transport failures invalidate the socket and report
    /// `NetworkError`; protocol-level results ride in the response.
    pub async fn exec_req(
        &self,
        nid: NodeId,
        req: &SdReq,
        body: &[u8],
    ) -> Result<(SdRsp, Vec<u8>), ResultCode> {
        let Some(mut sock) = self.get(nid).await else {
            return Err(ResultCode::NetworkError);
        };
        match wire::exec_req(&mut sock.stream, req, body).await {
            Ok((rsp, data)) => {
                if !rsp.result.is_success() {
                    debug!(node = %nid, opcode = ?req.opcode, result = %rsp.result, "peer error");
                }
                self.put(nid, sock);
                Ok((rsp, data))
            }
            Err(e) => {
                warn!(node = %nid, %e, "remote node might have gone away");
                self.del(nid, sock);
                Err(ResultCode::NetworkError)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tokio::io::AsyncReadExt;

    use super::*;

    async fn echo_listener() -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 256];
                    while stream.read(&mut buf).await.is_ok_and(|n| n > 0) {}
                });
            }
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn get_put_reuses_cached_slot() {
        let (addr, _srv) = echo_listener().await;
        let nid = NodeId::new(addr.ip(), addr.port());
        let pool = SockPool::new();
        pool.add(nid);

        let sock = pool.get(nid).await.unwrap();
        assert!(sock.idx >= 0);
        let idx = sock.idx;
        pool.put(nid, sock);

        // Same slot (and same connection) comes back.
        let sock = pool.get(nid).await.unwrap();
        assert_eq!(sock.idx, idx);
        pool.put(nid, sock);
    }

    #[tokio::test]
    async fn concurrent_gets_never_share_a_slot() {
        let (addr, _srv) = echo_listener().await;
        let nid = NodeId::new(addr.ip(), addr.port());
        let pool = SockPool::new();
        pool.add(nid);

        let mut socks = Vec::new();
        for _ in 0..DEFAULT_FDS_COUNT {
            socks.push(pool.get(nid).await.unwrap());
        }
        let indexes: HashSet<isize> = socks.iter().map(|s| s.idx).collect();
        assert_eq!(indexes.len(), DEFAULT_FDS_COUNT);
        assert!(indexes.iter().all(|&i| i >= 0));

        // Every original slot is busy: the next get either falls back to
        // a one-shot connection or lands on a slot the concurrent
        // watermark grow just added; it never reuses a taken slot.
        let extra = pool.get(nid).await.unwrap();
        assert!(
            extra.idx == -1 || extra.idx >= DEFAULT_FDS_COUNT as isize,
            "slot {} handed out twice",
            extra.idx
        );

        for s in socks {
            pool.put(nid, s);
        }
    }

    #[tokio::test]
    async fn unknown_node_is_revalidated_on_demand() {
        let (addr, _srv) = echo_listener().await;
        let nid = NodeId::new(addr.ip(), addr.port());
        let pool = SockPool::new();

        // Never added: get revalidates and inserts the entry.
        let sock = pool.get(nid).await.unwrap();
        assert!(sock.idx >= 0);
        assert_eq!(pool.cached_nodes(), 1);
        pool.put(nid, sock);
    }

    #[tokio::test]
    async fn dead_node_yields_nothing() {
        let pool = SockPool::new();
        let nid = NodeId::new([127, 0, 0, 1].into(), 1); // nothing listens here
        assert!(pool.get(nid).await.is_none());
        assert_eq!(pool.cached_nodes(), 0);
    }

    #[tokio::test]
    async fn del_invalidates_and_destroys_entry() {
        let (addr, _srv) = echo_listener().await;
        let nid = NodeId::new(addr.ip(), addr.port());
        let pool = SockPool::new();
        pool.add(nid);

        let sock = pool.get(nid).await.unwrap();
        pool.del(nid, sock);
        assert_eq!(pool.cached_nodes(), 0);

        // The next get revalidates (the listener is still up).
        let sock = pool.get(nid).await.unwrap();
        assert_eq!(pool.cached_nodes(), 1);
        pool.put(nid, sock);
    }

    #[tokio::test]
    async fn del_node_refuses_while_slot_held() {
        let (addr, _srv) = echo_listener().await;
        let nid = NodeId::new(addr.ip(), addr.port());
        let pool = SockPool::new();
        pool.add(nid);

        let sock = pool.get(nid).await.unwrap();
        assert!(!pool.del_node(nid), "entry destroyed under a live holder");
        pool.put(nid, sock);
        assert!(pool.del_node(nid));
    }

    #[tokio::test]
    async fn watermark_grows_slot_width() {
        let (addr, _srv) = echo_listener().await;
        let nid = NodeId::new(addr.ip(), addr.port());
        let pool = SockPool::new();
        pool.add(nid);

        let before = pool.slot_width();
        let mut socks = Vec::new();
        for _ in 0..DEFAULT_FDS_COUNT {
            socks.push(pool.get(nid).await.unwrap());
        }
        // Wait for the background grow to land.
        for _ in 0..100 {
            if pool.slot_width() > before {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.slot_width(), before * 2);

        for s in socks {
            pool.put(nid, s);
        }
    }
}
