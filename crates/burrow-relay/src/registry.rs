//! Live tunnel registry
//!
//! Three indexes back request routing: alias → tunnel id, tunnel id → tunnel,
//! and user → alias set. They live under a single lock so a reader resolving
//! a public request never observes a partial update. The registry holds no
//! persistent state; persisted alias rows are the allocator's job.

use crate::pending::PendingRequests;
use burrow_proto::RelayFrame;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Alias already registered: {0}")]
    AliasInUse(String),
}

/// The tunnel's outbound channel is gone (writer task ended)
#[derive(Debug, Error)]
#[error("Tunnel channel closed")]
pub struct ChannelClosed;

/// One live agent connection with its attached state
pub struct Tunnel {
    /// Fresh per connection
    pub id: Uuid,
    /// Public label this tunnel serves
    pub alias: String,
    /// Owning user token, or the anonymous sentinel
    pub user: String,
    /// Local port the agent reported
    pub port: u16,
    /// In-flight public requests awaiting responses
    pub pending: PendingRequests,
    /// Outbound frames; a single writer task drains this so messages never
    /// interleave on the wire
    outbound: mpsc::Sender<RelayFrame>,
    open: AtomicBool,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl Tunnel {
    pub fn new(id: Uuid, alias: String, user: String, port: u16, outbound: mpsc::Sender<RelayFrame>) -> Self {
        Self {
            id,
            alias,
            user,
            port,
            pending: PendingRequests::new(),
            outbound,
            open: AtomicBool::new(true),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    /// Queue a frame for the writer task
    pub async fn send(&self, frame: RelayFrame) -> Result<(), ChannelClosed> {
        self.outbound.send(frame).await.map_err(|_| ChannelClosed)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct Inner {
    by_alias: HashMap<String, Uuid>,
    tunnels: HashMap<Uuid, Arc<Tunnel>>,
    by_user: HashMap<String, HashSet<String>>,
}

/// Registry of currently-registered tunnels
pub struct TunnelRegistry {
    base_domain: String,
    inner: RwLock<Inner>,
}

impl TunnelRegistry {
    pub fn new(base_domain: impl Into<String>) -> Self {
        Self {
            base_domain: base_domain.into(),
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn base_domain(&self) -> &str {
        &self.base_domain
    }

    /// Register a tunnel under its alias. Fails if the alias is taken.
    pub fn insert(&self, tunnel: Arc<Tunnel>) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().unwrap();

        if inner.by_alias.contains_key(&tunnel.alias) {
            warn!(alias = %tunnel.alias, "Alias collision on insert");
            return Err(RegistryError::AliasInUse(tunnel.alias.clone()));
        }

        inner.by_alias.insert(tunnel.alias.clone(), tunnel.id);
        inner
            .by_user
            .entry(tunnel.user.clone())
            .or_default()
            .insert(tunnel.alias.clone());
        info!(
            tunnel_id = %tunnel.id,
            alias = %tunnel.alias,
            user = %tunnel.user,
            port = tunnel.port,
            "Registered tunnel"
        );
        inner.tunnels.insert(tunnel.id, tunnel);

        Ok(())
    }

    /// Resolve an alias to its tunnel
    pub fn lookup_by_alias(&self, alias: &str) -> Option<Arc<Tunnel>> {
        let inner = self.inner.read().unwrap();
        let id = inner.by_alias.get(alias)?;
        inner.tunnels.get(id).cloned()
    }

    /// Remove a tunnel from all three indexes, pruning the user entry when
    /// its alias set becomes empty. Returns the removed tunnel.
    pub fn remove(&self, id: &Uuid) -> Option<Arc<Tunnel>> {
        let mut inner = self.inner.write().unwrap();

        let tunnel = inner.tunnels.remove(id)?;
        inner.by_alias.remove(&tunnel.alias);

        if let Some(aliases) = inner.by_user.get_mut(&tunnel.user) {
            aliases.remove(&tunnel.alias);
            if aliases.is_empty() {
                inner.by_user.remove(&tunnel.user);
            }
        }

        info!(tunnel_id = %id, alias = %tunnel.alias, "Unregistered tunnel");
        Some(tunnel)
    }

    /// Whether an alias is currently registered
    pub fn alias_in_use(&self, alias: &str) -> bool {
        self.inner.read().unwrap().by_alias.contains_key(alias)
    }

    /// The set of live public URLs, grouped by user. Only tunnels whose
    /// channel is still open are included.
    pub fn snapshot_live_urls(&self) -> BTreeMap<String, Vec<String>> {
        let inner = self.inner.read().unwrap();

        let mut snapshot: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (user, aliases) in &inner.by_user {
            let mut urls: Vec<String> = aliases
                .iter()
                .filter(|alias| {
                    inner
                        .by_alias
                        .get(*alias)
                        .and_then(|id| inner.tunnels.get(id))
                        .map(|t| t.is_open())
                        .unwrap_or(false)
                })
                .map(|alias| format!("https://{}.{}/", alias, self.base_domain))
                .collect();
            urls.sort();
            if !urls.is_empty() {
                snapshot.insert(user.clone(), urls);
            }
        }

        snapshot
    }

    /// Number of registered tunnels
    pub fn count(&self) -> usize {
        self.inner.read().unwrap().tunnels.len()
    }

    /// Remove and return every tunnel (shutdown path)
    pub fn drain(&self) -> Vec<Arc<Tunnel>> {
        let mut inner = self.inner.write().unwrap();
        inner.by_alias.clear();
        inner.by_user.clear();
        inner.tunnels.drain().map(|(_, t)| t).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tunnel(alias: &str, user: &str, port: u16) -> Arc<Tunnel> {
        let (tx, _rx) = mpsc::channel(8);
        Arc::new(Tunnel::new(
            Uuid::new_v4(),
            alias.to_string(),
            user.to_string(),
            port,
            tx,
        ))
    }

    #[test]
    fn test_insert_and_lookup() {
        let registry = TunnelRegistry::new("example.com");
        let tunnel = test_tunnel("web-0123456789ab", "tok_a", 3000);

        registry.insert(tunnel.clone()).unwrap();

        let found = registry.lookup_by_alias("web-0123456789ab").unwrap();
        assert_eq!(found.id, tunnel.id);
        assert_eq!(found.alias, "web-0123456789ab");
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_alias_collision() {
        let registry = TunnelRegistry::new("example.com");

        registry
            .insert(test_tunnel("app-aaaaaaaaaaaa", "tok_a", 3000))
            .unwrap();
        let result = registry.insert(test_tunnel("app-aaaaaaaaaaaa", "tok_b", 4000));

        assert!(matches!(result, Err(RegistryError::AliasInUse(_))));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_remove_clears_all_indexes() {
        let registry = TunnelRegistry::new("example.com");
        let tunnel = test_tunnel("site-bbbbbbbbbbbb", "tok_a", 3000);
        let id = tunnel.id;

        registry.insert(tunnel).unwrap();
        let removed = registry.remove(&id).unwrap();
        assert_eq!(removed.alias, "site-bbbbbbbbbbbb");

        assert!(registry.lookup_by_alias("site-bbbbbbbbbbbb").is_none());
        assert!(!registry.alias_in_use("site-bbbbbbbbbbbb"));
        assert_eq!(registry.count(), 0);

        // Alias is free for re-registration
        registry
            .insert(test_tunnel("site-bbbbbbbbbbbb", "tok_a", 3000))
            .unwrap();
    }

    #[test]
    fn test_remove_unknown_tunnel() {
        let registry = TunnelRegistry::new("example.com");
        assert!(registry.remove(&Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_alias_bijection() {
        let registry = TunnelRegistry::new("example.com");

        let tunnels: Vec<_> = (0..5)
            .map(|i| test_tunnel(&format!("client-{:012x}", i), "tok_a", 3000 + i as u16))
            .collect();
        for tunnel in &tunnels {
            registry.insert(tunnel.clone()).unwrap();
        }

        // Every alias resolves to exactly the tunnel carrying it
        for tunnel in &tunnels {
            let found = registry.lookup_by_alias(&tunnel.alias).unwrap();
            assert_eq!(found.id, tunnel.id);
            assert_eq!(found.alias, tunnel.alias);
        }
    }

    #[test]
    fn test_user_set_pruned_when_empty() {
        let registry = TunnelRegistry::new("example.com");
        let t1 = test_tunnel("web-111111111111", "tok_a", 3000);
        let t2 = test_tunnel("web-222222222222", "tok_a", 3001);
        let (id1, id2) = (t1.id, t2.id);

        registry.insert(t1).unwrap();
        registry.insert(t2).unwrap();
        assert_eq!(registry.snapshot_live_urls().get("tok_a").unwrap().len(), 2);

        registry.remove(&id1);
        assert_eq!(registry.snapshot_live_urls().get("tok_a").unwrap().len(), 1);

        registry.remove(&id2);
        assert!(registry.snapshot_live_urls().get("tok_a").is_none());
    }

    #[test]
    fn test_snapshot_formats_urls() {
        let registry = TunnelRegistry::new("tunnel.example.com");
        registry
            .insert(test_tunnel("people-cccccccccccc", "tok_a", 8080))
            .unwrap();

        let snapshot = registry.snapshot_live_urls();
        assert_eq!(
            snapshot.get("tok_a").unwrap(),
            &vec!["https://people-cccccccccccc.tunnel.example.com/".to_string()]
        );
    }

    #[test]
    fn test_snapshot_skips_closed_tunnels() {
        let registry = TunnelRegistry::new("example.com");
        let tunnel = test_tunnel("user-dddddddddddd", "tok_a", 3000);

        registry.insert(tunnel.clone()).unwrap();
        assert_eq!(registry.snapshot_live_urls().len(), 1);

        tunnel.mark_closed();
        assert!(registry.snapshot_live_urls().is_empty());
    }

    #[test]
    fn test_drain() {
        let registry = TunnelRegistry::new("example.com");
        registry
            .insert(test_tunnel("web-eeeeeeeeeeee", "tok_a", 3000))
            .unwrap();
        registry
            .insert(test_tunnel("app-ffffffffffff", "tok_b", 3001))
            .unwrap();

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.count(), 0);
        assert!(registry.snapshot_live_urls().is_empty());
    }

    #[tokio::test]
    async fn test_send_after_writer_gone() {
        let (tx, rx) = mpsc::channel(1);
        let tunnel = Tunnel::new(
            Uuid::new_v4(),
            "web-000000000000".to_string(),
            "tok_a".to_string(),
            3000,
            tx,
        );

        drop(rx);
        let result = tunnel
            .send(RelayFrame::Control(burrow_proto::RelayControl::Error {
                message: "closing".to_string(),
            }))
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_byte_counters() {
        let (tx, _rx) = mpsc::channel(1);
        let tunnel = Tunnel::new(
            Uuid::new_v4(),
            "web-000000000000".to_string(),
            "tok_a".to_string(),
            3000,
            tx,
        );

        tunnel.add_bytes_in(128);
        tunnel.add_bytes_in(64);
        tunnel.add_bytes_out(512);

        assert_eq!(tunnel.bytes_in(), 192);
        assert_eq!(tunnel.bytes_out(), 512);
    }
}
