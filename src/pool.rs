//! Per-target connection cache for one invocation
//!
//! At most one live connection exists per (target, transport). Each key has
//! its own async mutex, so two units addressing the same target queue on it
//! instead of racing to open duplicate sessions, while different targets
//! never contend.
//!
//! The number of open connections is capped by the caller's limit (the
//! dispatch concurrency). Opening past the cap first closes the least
//! recently used idle connection.

use crate::error::TransportError;
use crate::models::Action;
use crate::result::Payload;
use crate::target::{Target, TransportKind};
use crate::transports::{Connection, RunOptions, Transport, TransportRegistry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

type PoolKey = (String, TransportKind);
type Slot = Arc<AsyncMutex<Option<Box<dyn Connection>>>>;

/// How long `close_all` waits for sessions to shut down
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

struct Entry {
    slot: Slot,
    last_used: u64,
}

pub struct ConnectionPool {
    slots: Mutex<HashMap<PoolKey, Entry>>,
    open: Arc<AtomicUsize>,
    peak: AtomicUsize,
    clock: AtomicU64,
    close_timeout: Duration,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            open: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

/// Exclusive use of one pooled connection
///
/// Dropping it returns the connection to the pool.
pub struct PooledConnection {
    target: String,
    guard: OwnedMutexGuard<Option<Box<dyn Connection>>>,
    open: Arc<AtomicUsize>,
}

impl PooledConnection {
    pub async fn run(
        &mut self,
        transport: &dyn Transport,
        action: &Action,
        options: &RunOptions,
    ) -> Result<Payload, TransportError> {
        match self.guard.as_deref_mut() {
            Some(connection) => transport.run(connection, action, options).await,
            None => Err(TransportError::ConnectionLost {
                target: self.target.clone(),
                message: "connection was evicted".to_string(),
            }),
        }
    }

    /// Close the connection and leave the slot empty for the next user
    pub async fn evict(mut self, transport: &dyn Transport) {
        if let Some(connection) = self.guard.take() {
            self.open.fetch_sub(1, Ordering::SeqCst);
            debug!("Evicting connection to {}", self.target);
            transport.disconnect(connection).await;
        }
    }
}

/// Close without making the caller wait on it
fn close_detached(connection: Box<dyn Connection>) {
    tokio::spawn(async move { connection.close().await });
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound on how long `close_all` waits before abandoning sessions
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    fn slot(&self, key: PoolKey) -> Slot {
        let used = self.clock.fetch_add(1, Ordering::SeqCst);
        // Poisoning only means another unit panicked mid-insert; the map is still valid
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let entry = slots.entry(key).or_insert_with(|| Entry {
            slot: Slot::default(),
            last_used: used,
        });
        entry.last_used = used;
        entry.slot.clone()
    }

    /// Look up or open the connection for `target`
    ///
    /// A reused connection that reports itself dead or fails its ping is
    /// closed and replaced before the caller sees it. Errors from `connect`
    /// (including authentication failures) are returned as-is and leave the
    /// slot empty. At most `limit` connections are open once this returns.
    pub async fn acquire(
        &self,
        target: &Target,
        transport: &dyn Transport,
        limit: usize,
    ) -> Result<PooledConnection, TransportError> {
        let key = (target.name.clone(), transport.kind());
        let slot = self.slot(key.clone());
        let mut guard = slot.lock_owned().await;

        if let Some(existing) = guard.as_mut() {
            let healthy = existing.is_alive() && existing.ping().await.is_ok();
            if !healthy {
                if let Some(dead) = guard.take() {
                    self.open.fetch_sub(1, Ordering::SeqCst);
                    debug!("Reopening dead connection to {}", target);
                    close_detached(dead);
                }
            }
        }
        if guard.is_none() {
            self.reserve(&key, limit).await;
            match transport.connect(target).await {
                Ok(connection) => *guard = Some(connection),
                Err(e) => {
                    self.open.fetch_sub(1, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        Ok(PooledConnection {
            target: target.name.clone(),
            guard,
            open: self.open.clone(),
        })
    }

    /// Claim room for one more connection, closing idle ones to make it
    async fn reserve(&self, keep: &PoolKey, limit: usize) {
        let limit = limit.max(1);
        loop {
            let open = self.open.load(Ordering::SeqCst);
            if open < limit {
                if self
                    .open
                    .compare_exchange(open, open + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.peak.fetch_max(open + 1, Ordering::SeqCst);
                    return;
                }
                continue;
            }
            if !self.evict_idle(keep) {
                // Every open connection is in use; one frees up when its unit finishes
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    /// Close the least recently used connection nobody is holding
    fn evict_idle(&self, keep: &PoolKey) -> bool {
        let mut candidates: Vec<(u64, PoolKey, Slot)> = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots
                .iter()
                .filter(|(key, _)| *key != keep)
                .map(|(key, entry)| (entry.last_used, key.clone(), entry.slot.clone()))
                .collect()
        };
        candidates.sort_by_key(|(used, ..)| *used);

        for (_, (name, _), slot) in candidates {
            let Ok(mut guard) = slot.try_lock() else {
                continue;
            };
            if let Some(connection) = guard.take() {
                self.open.fetch_sub(1, Ordering::SeqCst);
                debug!("Closing idle connection to {} to stay within the limit", name);
                close_detached(connection);
                return true;
            }
        }
        false
    }

    /// Drop whatever connection `target` holds, e.g. after a timed-out run
    ///
    /// The close runs in the background so a session stuck in an abandoned
    /// call cannot hold up the caller.
    pub fn discard(&self, target: &Target, kind: TransportKind) {
        let slot = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots
                .get(&(target.name.clone(), kind))
                .map(|entry| entry.slot.clone())
        };
        let Some(slot) = slot else {
            return;
        };
        match slot.try_lock() {
            Ok(mut guard) => {
                if let Some(connection) = guard.take() {
                    self.open.fetch_sub(1, Ordering::SeqCst);
                    debug!("Discarding connection to {}", target);
                    close_detached(connection);
                }
            }
            Err(_) => warn!("Connection to {} is still in use; not discarded", target),
        };
    }

    /// Number of connections currently open
    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Most connections that were ever open at the same time
    pub fn peak_open(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Close every pooled connection at the end of an invocation
    ///
    /// Sessions close concurrently. Any still closing after the close timeout
    /// are abandoned with a warning.
    pub async fn close_all(&self, registry: &TransportRegistry) {
        let drained: Vec<(PoolKey, Slot)> = {
            let mut map = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            map.drain().map(|(key, entry)| (key, entry.slot)).collect()
        };
        let count = drained.len();
        let closing = drained.into_iter().map(|((name, kind), slot)| {
            let transport = registry.get(kind);
            let open = self.open.clone();
            async move {
                let Some(connection) = slot.lock().await.take() else {
                    return;
                };
                open.fetch_sub(1, Ordering::SeqCst);
                match transport {
                    Ok(transport) => transport.disconnect(connection).await,
                    Err(e) => {
                        warn!("No transport to close connection to {}: {}", name, e);
                        connection.close().await;
                    }
                }
            }
        });

        if tokio::time::timeout(self.close_timeout, futures::future::join_all(closing))
            .await
            .is_err()
        {
            warn!(
                "Gave up waiting for connections to close after {:?} ({} were pooled)",
                self.close_timeout, count
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActionKind;
    use crate::result::Payload;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingTransport {
        connects: AtomicUsize,
        closes: Arc<AtomicUsize>,
        fail_auth: bool,
        ping_fails: bool,
    }

    struct CountingConnection {
        target: Target,
        alive: Arc<AtomicBool>,
        closes: Arc<AtomicUsize>,
        ping_fails: bool,
    }

    #[async_trait]
    impl Connection for CountingConnection {
        fn target(&self) -> &Target {
            &self.target
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn run(
            &mut self,
            _action: &Action,
            _options: &RunOptions,
        ) -> Result<Payload, TransportError> {
            Ok(Payload::Noop {
                description: "ran".to_string(),
            })
        }

        async fn ping(&mut self) -> Result<(), TransportError> {
            if self.ping_fails {
                return Err(TransportError::ConnectionLost {
                    target: self.target.name.clone(),
                    message: "broken pipe".to_string(),
                });
            }
            Ok(())
        }

        async fn close(self: Box<Self>) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Transport for CountingTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Ssh
        }

        fn supports(&self, _action: ActionKind) -> bool {
            true
        }

        async fn connect(&self, target: &Target) -> Result<Box<dyn Connection>, TransportError> {
            if self.fail_auth {
                return Err(TransportError::Authentication {
                    target: target.name.clone(),
                    message: "denied".to_string(),
                });
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingConnection {
                target: target.clone(),
                alive: Arc::new(AtomicBool::new(true)),
                closes: self.closes.clone(),
                ping_fails: self.ping_fails,
            }))
        }
    }

    fn transport() -> CountingTransport {
        CountingTransport {
            connects: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            fail_auth: false,
            ping_fails: false,
        }
    }

    /// Connection whose close never finishes
    struct StuckConnection {
        target: Target,
    }

    #[async_trait]
    impl Connection for StuckConnection {
        fn target(&self) -> &Target {
            &self.target
        }

        async fn run(
            &mut self,
            _action: &Action,
            _options: &RunOptions,
        ) -> Result<Payload, TransportError> {
            Ok(Payload::Noop {
                description: "ran".to_string(),
            })
        }

        async fn close(self: Box<Self>) {
            std::future::pending::<()>().await;
        }
    }

    struct StuckTransport;

    #[async_trait]
    impl Transport for StuckTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Ssh
        }

        fn supports(&self, _action: ActionKind) -> bool {
            true
        }

        async fn connect(&self, target: &Target) -> Result<Box<dyn Connection>, TransportError> {
            Ok(Box::new(StuckConnection {
                target: target.clone(),
            }))
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn target(name: &str) -> Target {
        Target::parse(name, TransportKind::Ssh).unwrap()
    }

    #[tokio::test]
    async fn test_reuses_connection_per_target() {
        let pool = ConnectionPool::new();
        let transport = transport();
        for _ in 0..3 {
            let mut conn = pool.acquire(&target("web1"), &transport, 8).await.unwrap();
            conn.run(&transport, &Action::command("true"), &RunOptions::default())
                .await
                .unwrap();
        }
        pool.acquire(&target("web2"), &transport, 8).await.unwrap();
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.open_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_opens_once() {
        let pool = Arc::new(ConnectionPool::new());
        let transport = Arc::new(transport());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let transport = transport.clone();
            handles.push(tokio::spawn(async move {
                pool.acquire(&target("web1"), transport.as_ref(), 8)
                    .await
                    .map(|_| ())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_evict_forces_reconnect() {
        let pool = ConnectionPool::new();
        let transport = transport();
        let conn = pool.acquire(&target("web1"), &transport, 8).await.unwrap();
        conn.evict(&transport).await;
        pool.acquire(&target("web1"), &transport, 8).await.unwrap();
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_surfaces() {
        let pool = ConnectionPool::new();
        let transport = CountingTransport {
            fail_auth: true,
            ..transport()
        };
        let result = pool.acquire(&target("web1"), &transport, 8).await;
        assert!(matches!(result, Err(TransportError::Authentication { .. })));
        assert_eq!(pool.open_count(), 0);
    }

    #[tokio::test]
    async fn test_close_all_disconnects_everything() {
        let pool = ConnectionPool::new();
        let transport = Arc::new(transport());
        pool.acquire(&target("a"), transport.as_ref(), 8).await.unwrap();
        pool.acquire(&target("b"), transport.as_ref(), 8).await.unwrap();

        let mut registry = TransportRegistry::empty();
        registry.register(transport.clone());
        pool.close_all(&registry).await;
        assert_eq!(transport.closes.load(Ordering::SeqCst), 2);
        assert_eq!(pool.open_count(), 0);
    }

    #[tokio::test]
    async fn test_limit_evicts_least_recently_used() {
        let pool = ConnectionPool::new();
        let transport = transport();
        for name in ["a", "b", "c"] {
            pool.acquire(&target(name), &transport, 2).await.unwrap();
        }
        assert_eq!(pool.open_count(), 2);

        // "a" was evicted for "c"; "b" is still pooled
        pool.acquire(&target("b"), &transport, 2).await.unwrap();
        assert_eq!(transport.connects.load(Ordering::SeqCst), 3);
        pool.acquire(&target("a"), &transport, 2).await.unwrap();
        assert_eq!(transport.connects.load(Ordering::SeqCst), 4);

        settle().await;
        assert_eq!(transport.closes.load(Ordering::SeqCst), 2);
        assert_eq!(pool.open_count(), 2);
        assert_eq!(pool.peak_open(), 2);
    }

    #[tokio::test]
    async fn test_failed_ping_reopens_before_use() {
        let pool = ConnectionPool::new();
        let transport = CountingTransport {
            ping_fails: true,
            ..transport()
        };
        pool.acquire(&target("web1"), &transport, 8).await.unwrap();
        let mut conn = pool.acquire(&target("web1"), &transport, 8).await.unwrap();
        conn.run(&transport, &Action::command("true"), &RunOptions::default())
            .await
            .unwrap();

        settle().await;
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.open_count(), 1);
    }

    #[tokio::test]
    async fn test_discard_does_not_wait_for_close() {
        let pool = ConnectionPool::new();
        let web1 = target("web1");
        pool.acquire(&web1, &StuckTransport, 8).await.unwrap();

        pool.discard(&web1, TransportKind::Ssh);
        assert_eq!(pool.open_count(), 0);
    }

    #[tokio::test]
    async fn test_close_all_gives_up_after_timeout() {
        let pool = ConnectionPool::new().with_close_timeout(Duration::from_millis(50));
        let transport = Arc::new(StuckTransport);
        pool.acquire(&target("a"), transport.as_ref(), 8).await.unwrap();
        pool.acquire(&target("b"), transport.as_ref(), 8).await.unwrap();

        let mut registry = TransportRegistry::empty();
        registry.register(transport);
        let started = std::time::Instant::now();
        pool.close_all(&registry).await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
