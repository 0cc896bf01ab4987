use crate::error::WarrenError;
use crate::worker::{Health, WorkerKey, WorkerProcess};
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Per-member counters. Shared by every snapshot that contains the member,
/// so they survive copy-on-write updates of the membership set.
#[derive(Debug, Default)]
pub struct MemberStats {
    in_flight: AtomicUsize,
    dispatched: AtomicU64,
}

impl MemberStats {
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }
}

/// A pool entry: the worker description plus its live counters.
#[derive(Debug, Clone)]
pub struct Member {
    pub process: WorkerProcess,
    stats: Arc<MemberStats>,
}

impl Member {
    fn new(process: WorkerProcess) -> Self {
        Self {
            process,
            stats: Arc::new(MemberStats::default()),
        }
    }

    pub fn stats(&self) -> &MemberStats {
        &self.stats
    }
}

/// Immutable view of the pool. Readers hold an `Arc` to one of these and
/// never observe a half-applied update.
#[derive(Debug, Default)]
pub struct PoolSnapshot {
    members: Vec<Member>,
    version: u64,
}

impl PoolSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn get(&self, addr: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.process.addr == addr)
    }

    pub fn healthy(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.process.is_selectable())
    }

    pub fn healthy_count(&self) -> usize {
        self.healthy().count()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// The live set of workers behind one logical service.
///
/// Membership lives in a single `PoolSnapshot` behind an `ArcSwap`.
/// Mutations are serialized by `writer`, copy the member list, and publish
/// the result with one atomic store.
pub struct WorkerPool {
    snapshot: ArcSwap<PoolSnapshot>,
    writer: Mutex<()>,
    cursor: AtomicUsize,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(PoolSnapshot::default()),
            writer: Mutex::new(()),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Current consistent view.
    pub fn snapshot(&self) -> Arc<PoolSnapshot> {
        self.snapshot.load_full()
    }

    fn update<R>(&self, f: impl FnOnce(&mut Vec<Member>) -> R) -> R {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.snapshot.load();
        let mut members = current.members.clone();
        let out = f(&mut members);
        self.snapshot.store(Arc::new(PoolSnapshot {
            members,
            version: current.version + 1,
        }));
        out
    }

    /// Register a newly launched worker. It is not selectable until a
    /// health probe marks it `Healthy`.
    pub fn insert(&self, process: WorkerProcess) -> Result<(), WarrenError> {
        let addr = process.addr.clone();
        let key = process.key();
        self.update(|members| {
            if members.iter().any(|m| m.process.addr == process.addr) {
                return Err(WarrenError::DuplicateWorker(process.addr.clone()));
            }
            members.push(Member::new(process));
            Ok(())
        })?;
        info!(worker = %key, addr = %addr, "Worker joined pool");
        Ok(())
    }

    /// Apply a health transition. Draining members are never revived.
    /// Returns the previous state when it changed.
    pub fn set_health(&self, addr: &str, health: Health) -> Option<Health> {
        let current = self.snapshot.load().get(addr).map(|m| m.process.health);
        if current.is_none() || current == Some(health) {
            return None;
        }
        self.update(|members| {
            let m = members.iter_mut().find(|m| m.process.addr == addr)?;
            let prev = m.process.health;
            if prev == health || prev == Health::Draining {
                return None;
            }
            m.process.health = health;
            Some(prev)
        })
    }

    /// Stop routing new requests to `addr`. In-flight requests continue.
    pub fn begin_drain(&self, addr: &str) -> bool {
        let drained = self.set_health(addr, Health::Draining).is_some();
        if drained {
            info!(addr = %addr, "Worker draining");
        }
        drained
    }

    /// Drop `addr` from the pool immediately.
    pub fn remove(&self, addr: &str) -> Option<WorkerProcess> {
        let removed = self.update(|members| {
            let idx = members.iter().position(|m| m.process.addr == addr)?;
            Some(members.remove(idx).process)
        });
        if let Some(ref p) = removed {
            info!(worker = %p.key(), addr = %addr, "Worker left pool");
        }
        removed
    }

    /// Remove every draining member whose in-flight count reached zero.
    pub fn reap_drained(&self) -> Vec<WorkerProcess> {
        let pending = self.snapshot.load().members.iter().any(|m| {
            m.process.health == Health::Draining && m.stats.in_flight() == 0
        });
        if !pending {
            return Vec::new();
        }
        self.update(|members| {
            let mut reaped = Vec::new();
            members.retain(|m| {
                let done = m.process.health == Health::Draining && m.stats.in_flight() == 0;
                if done {
                    reaped.push(m.process.clone());
                }
                !done
            });
            reaped
        })
    }

    /// Weighted round-robin over healthy members, skipping `exclude`.
    ///
    /// The returned lease counts as in-flight until dropped.
    pub fn select(&self, exclude: &[WorkerKey]) -> Result<Lease, WarrenError> {
        let snapshot = self.snapshot.load();
        let candidates: Vec<&Member> = snapshot
            .healthy()
            .filter(|m| !exclude.contains(&m.process.key()))
            .collect();
        if candidates.is_empty() {
            return Err(WarrenError::PoolExhausted);
        }

        let total: u64 = candidates
            .iter()
            .map(|m| m.process.effective_weight() as u64)
            .sum();
        let idx = (self.cursor.fetch_add(1, Ordering::Relaxed) as u64) % total;

        let mut cumulative = 0u64;
        let mut chosen = candidates[0];
        for m in candidates.iter().copied() {
            cumulative += m.process.effective_weight() as u64;
            if idx < cumulative {
                chosen = m;
                break;
            }
        }

        debug!(worker = %chosen.process.key(), addr = %chosen.process.addr, "Worker selected");
        Ok(Lease::new(chosen.clone()))
    }

    pub fn healthy_count(&self) -> usize {
        self.snapshot.load().healthy_count()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A selected worker. Holds the member's in-flight slot until dropped.
pub struct Lease {
    member: Member,
}

impl Lease {
    fn new(member: Member) -> Self {
        member.stats.in_flight.fetch_add(1, Ordering::AcqRel);
        member.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        Self { member }
    }

    pub fn process(&self) -> &WorkerProcess {
        &self.member.process
    }

    pub fn addr(&self) -> &str {
        &self.member.process.addr
    }

    pub fn key(&self) -> WorkerKey {
        self.member.process.key()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.member.stats.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_pool(addrs: &[&str]) -> WorkerPool {
        let pool = WorkerPool::new();
        for (i, addr) in addrs.iter().enumerate() {
            pool.insert(WorkerProcess::new(100 + i as u32, *addr)).unwrap();
            pool.set_health(addr, Health::Healthy);
        }
        pool
    }

    #[test]
    fn update_bumps_version() {
        let pool = WorkerPool::new();
        assert_eq!(pool.snapshot().version(), 0);
        pool.insert(WorkerProcess::new(1, "a:1")).unwrap();
        assert_eq!(pool.snapshot().version(), 1);
    }

    #[test]
    fn old_snapshot_is_unchanged_by_later_writes() {
        let pool = healthy_pool(&["a:1", "b:1"]);
        let before = pool.snapshot();
        pool.set_health("a:1", Health::Unhealthy);
        assert_eq!(before.healthy_count(), 2);
        assert_eq!(pool.snapshot().healthy_count(), 1);
    }

    #[test]
    fn lease_tracks_in_flight() {
        let pool = healthy_pool(&["a:1"]);
        let lease = pool.select(&[]).unwrap();
        let snap = pool.snapshot();
        assert_eq!(snap.get("a:1").unwrap().stats().in_flight(), 1);
        drop(lease);
        assert_eq!(snap.get("a:1").unwrap().stats().in_flight(), 0);
        assert_eq!(snap.get("a:1").unwrap().stats().dispatched(), 1);
    }

    #[test]
    fn draining_is_terminal() {
        let pool = healthy_pool(&["a:1"]);
        assert!(pool.begin_drain("a:1"));
        assert_eq!(pool.set_health("a:1", Health::Healthy), None);
        assert_eq!(pool.snapshot().get("a:1").unwrap().process.health, Health::Draining);
    }

    #[test]
    fn reap_waits_for_in_flight() {
        let pool = healthy_pool(&["a:1", "b:1"]);
        let lease = pool.select(&[]).unwrap();
        let addr = lease.addr().to_string();
        pool.begin_drain(&addr);

        assert!(pool.reap_drained().is_empty());
        assert_eq!(pool.len(), 2);

        drop(lease);
        let reaped = pool.reap_drained();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].addr, addr);
        assert_eq!(pool.len(), 1);
    }
}
