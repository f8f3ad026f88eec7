//! named cluster-wide locks
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use log::{debug, info};
use serde::Serialize;

use crate::{
    error::{FsError, FsResult},
    utils::time_util::{Clock, TimeDurationStruct},
};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    Read,
    Write,
    Exclusive,
    Shared,
}

impl LockType {
    /// write and exclusive holders admit nobody else
    pub fn is_solitary(self) -> bool {
        matches!(self, LockType::Write | LockType::Exclusive)
    }
}

/// what an acquire does when the lock is held in a conflicting way
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// fail at once with `LockConflict`
    Immediate,
    /// wait, for at most the given timeout when there is one
    Blocking,
    /// wait for the given timeout or the default one
    Timeout,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub node: u64,
    pub lock_type: LockType,
    pub acquired_at: TimeDurationStruct,
    /// the holding lapses at this time unless released earlier
    pub expires_at: TimeDurationStruct,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub name: String,
    pub holders: Vec<LockHolder>,
    /// nodes waiting, oldest first
    pub waiters: Vec<(u64, LockType)>,
}

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    node: u64,
    lock_type: LockType,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct LockState {
    holders: Vec<LockHolder>,
    waiters: Vec<Waiter>,
}

impl LockState {
    /// a node's own holding never conflicts, it is replaced on grant
    fn admits(&self, node: u64, lock_type: LockType) -> bool {
        self.holders
            .iter()
            .filter(|holder| holder.node != node)
            .all(|holder| !lock_type.is_solitary() && !holder.lock_type.is_solitary())
    }

    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.waiters.is_empty()
    }

    fn remove_waiter(&mut self, ticket: u64) -> Option<Waiter> {
        let index = self.waiters.iter().position(|w| w.ticket == ticket)?;
        Some(self.waiters.remove(index))
    }
}

/// Holders and waiters of every named lock.
///
/// Waiters sleep on one condition variable and re-check their lock whenever
/// anything is released or cancelled.
#[derive(Debug)]
pub struct LockTable {
    locks: Mutex<HashMap<String, LockState>>,
    changed: Condvar,
    next_ticket: AtomicU64,
    clock: Arc<dyn Clock>,
    lease: Duration,
    default_timeout: Duration,
}

impl LockTable {
    pub fn new(clock: Arc<dyn Clock>, lease: Duration, default_timeout: Duration) -> Self {
        LockTable {
            locks: Mutex::new(HashMap::new()),
            changed: Condvar::new(),
            next_ticket: AtomicU64::new(1),
            clock,
            lease,
            default_timeout,
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, LockState>> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait_limit(&self, mode: LockMode, timeout: Option<Duration>) -> Option<Instant> {
        let limit = match mode {
            LockMode::Immediate => Some(Duration::ZERO),
            LockMode::Blocking => timeout,
            LockMode::Timeout => Some(timeout.unwrap_or(self.default_timeout)),
        };
        limit.map(|limit| Instant::now() + limit)
    }

    /// Take `name` for `node`, waiting as `mode` allows.
    pub fn acquire(
        &self,
        node: u64,
        name: &str,
        lock_type: LockType,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> FsResult<()> {
        debug!("node {node}: acquire {lock_type:?} {name} ({mode:?})");
        let deadline = self.wait_limit(mode, timeout);
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut locks = self.table();
        let mut waiting = false;
        loop {
            let state = locks.entry(name.to_string()).or_default();
            if waiting {
                let cancelled = state
                    .waiters
                    .iter()
                    .find(|w| w.ticket == ticket)
                    .map_or(true, |w| w.cancelled);
                if cancelled {
                    state.remove_waiter(ticket);
                    Self::forget_if_idle(&mut locks, name);
                    return Err(FsError::Cancelled(format!("node {node} waiting for {name}")));
                }
            }
            if state.admits(node, lock_type) {
                state.remove_waiter(ticket);
                state.holders.retain(|holder| holder.node != node);
                let now = self.clock.now();
                state.holders.push(LockHolder {
                    node,
                    lock_type,
                    acquired_at: now,
                    expires_at: TimeDurationStruct::from_nanos(
                        now.as_nanos().saturating_add(self.lease.as_nanos() as u64),
                    ),
                });
                return Ok(());
            }
            if mode == LockMode::Immediate {
                Self::forget_if_idle(&mut locks, name);
                return Err(FsError::LockConflict(name.to_string()));
            }
            if !waiting {
                state.waiters.push(Waiter {
                    ticket,
                    node,
                    lock_type,
                    cancelled: false,
                });
                waiting = true;
            }
            locks = match deadline {
                None => self.changed.wait(locks).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        if let Some(state) = locks.get_mut(name) {
                            state.remove_waiter(ticket);
                        }
                        Self::forget_if_idle(&mut locks, name);
                        return Err(FsError::Timeout(format!("lock {name}")));
                    }
                    self.changed
                        .wait_timeout(locks, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    /// Drop `node`'s holding. Releasing a lock nobody holds does nothing.
    pub fn release(&self, node: u64, name: &str) -> FsResult<()> {
        let mut locks = self.table();
        let Some(state) = locks.get_mut(name) else {
            return Ok(());
        };
        if state.holders.is_empty() {
            return Ok(());
        }
        let before = state.holders.len();
        state.holders.retain(|holder| holder.node != node);
        if state.holders.len() == before {
            return Err(FsError::NotOwner {
                node,
                lock: name.to_string(),
            });
        }
        Self::forget_if_idle(&mut locks, name);
        drop(locks);
        self.changed.notify_all();
        Ok(())
    }

    /// wake `node`'s pending acquires of `name` with `Cancelled`
    pub fn cancel(&self, node: u64, name: &str) -> usize {
        let mut locks = self.table();
        let mut cancelled = 0;
        if let Some(state) = locks.get_mut(name) {
            for waiter in state.waiters.iter_mut().filter(|w| w.node == node && !w.cancelled) {
                waiter.cancelled = true;
                cancelled += 1;
            }
        }
        drop(locks);
        if cancelled > 0 {
            info!("node {node}: cancelled {cancelled} waits for {name}");
            self.changed.notify_all();
        }
        cancelled
    }

    /// everything a departed node held or waited for, returning the affected names
    pub fn release_node(&self, node: u64) -> Vec<String> {
        let mut locks = self.table();
        let mut affected = Vec::new();
        for (name, state) in locks.iter_mut() {
            let before = state.holders.len();
            state.holders.retain(|holder| holder.node != node);
            let mut touched = state.holders.len() != before;
            for waiter in state.waiters.iter_mut().filter(|w| w.node == node) {
                waiter.cancelled = true;
                touched = true;
            }
            if touched {
                affected.push(name.clone());
            }
        }
        locks.retain(|_, state| !state.is_idle());
        drop(locks);
        if !affected.is_empty() {
            info!("node {node}: released locks {affected:?}");
            self.changed.notify_all();
        }
        affected
    }

    /// extend every lease `node` holds by a full term from now
    pub fn renew(&self, node: u64) -> usize {
        let now = self.clock.now();
        let expires_at =
            TimeDurationStruct::from_nanos(now.as_nanos().saturating_add(self.lease.as_nanos() as u64));
        let mut renewed = 0;
        for state in self.table().values_mut() {
            for holder in state.holders.iter_mut().filter(|holder| holder.node == node) {
                holder.expires_at = expires_at;
                renewed += 1;
            }
        }
        renewed
    }

    /// drop holdings whose lease ran out by `now`
    pub fn expire(&self, now: TimeDurationStruct) -> Vec<(u64, String)> {
        let mut locks = self.table();
        let mut expired = Vec::new();
        for (name, state) in locks.iter_mut() {
            state.holders.retain(|holder| {
                let live = holder.expires_at > now;
                if !live {
                    expired.push((holder.node, name.clone()));
                }
                live
            });
        }
        locks.retain(|_, state| !state.is_idle());
        drop(locks);
        if !expired.is_empty() {
            info!("lock leases expired: {expired:?}");
            self.changed.notify_all();
        }
        expired
    }

    pub fn info(&self, name: &str) -> Option<LockInfo> {
        self.table().get(name).map(|state| LockInfo {
            name: name.to_string(),
            holders: state.holders.clone(),
            waiters: state
                .waiters
                .iter()
                .filter(|w| !w.cancelled)
                .map(|w| (w.node, w.lock_type))
                .collect(),
        })
    }

    pub fn held(&self) -> usize {
        self.table().values().map(|state| state.holders.len()).sum()
    }

    fn forget_if_idle(locks: &mut HashMap<String, LockState>, name: &str) {
        if locks.get(name).is_some_and(LockState::is_idle) {
            locks.remove(name);
        }
    }
}
