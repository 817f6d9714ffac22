//! Record-granularity lock manager.
//!
//! Read locks are shared, write locks exclusive, both reentrant within the
//! owning transaction. A transaction that must wait first has the wait-for
//! graph searched for a cycle through it; when one exists the youngest
//! transaction in the cycle (highest serial number) is aborted with
//! `Deadlock`. Everything else blocks until the holder releases.
//!
//! Lock owners are transaction serial numbers, not thread ids: on a
//! primary, locks taken on behalf of a follower live exactly as long as
//! the forwarded transaction.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use trellis_core::{Result, TrellisError};

/// Which id space a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockSpace {
    /// Node records.
    Node,
    /// Relationship records.
    Relationship,
}

/// A lockable record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    /// Id space.
    pub space: LockSpace,
    /// Record id.
    pub id: u64,
}

impl ResourceKey {
    /// Lock key for a node record.
    pub fn node(id: u64) -> ResourceKey {
        ResourceKey {
            space: LockSpace::Node,
            id,
        }
    }

    /// Lock key for a relationship record.
    pub fn relationship(id: u64) -> ResourceKey {
        ResourceKey {
            space: LockSpace::Relationship,
            id,
        }
    }
}

/// Lock strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared.
    Read,
    /// Exclusive.
    Write,
}

#[derive(Default)]
struct LockEntry {
    /// serial → reentrancy count
    readers: HashMap<u64, usize>,
    writer: Option<(u64, usize)>,
}

impl LockEntry {
    fn is_free(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none()
    }

    /// Can `serial` take the lock in `mode` right now?
    fn grantable(&self, serial: u64, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => match self.writer {
                Some((holder, _)) => holder == serial,
                None => true,
            },
            LockMode::Write => {
                let writer_ok = match self.writer {
                    Some((holder, _)) => holder == serial,
                    None => true,
                };
                let readers_ok = self
                    .readers
                    .keys()
                    .all(|&holder| holder == serial);
                writer_ok && readers_ok
            }
        }
    }

    fn grant(&mut self, serial: u64, mode: LockMode) {
        match mode {
            LockMode::Read => {
                *self.readers.entry(serial).or_insert(0) += 1;
            }
            LockMode::Write => match &mut self.writer {
                Some((holder, count)) => {
                    debug_assert_eq!(*holder, serial);
                    *count += 1;
                }
                None => self.writer = Some((serial, 1)),
            },
        }
    }

    /// Serials currently blocking `serial` from taking `mode`.
    fn blockers(&self, serial: u64, mode: LockMode) -> Vec<u64> {
        let mut blockers = Vec::new();
        if let Some((holder, _)) = self.writer {
            if holder != serial {
                blockers.push(holder);
            }
        }
        if mode == LockMode::Write {
            blockers.extend(self.readers.keys().copied().filter(|&h| h != serial));
        }
        blockers
    }
}

struct LockTable {
    locks: HashMap<ResourceKey, LockEntry>,
    /// waiter serial → the key it is blocked on
    waiting: HashMap<u64, (ResourceKey, LockMode)>,
    /// transactions chosen as deadlock victims, pending wake-up
    victims: HashSet<u64>,
}

/// The lock manager.
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
}

impl Default for LockManager {
    fn default() -> Self {
        LockManager::new()
    }
}

impl LockManager {
    /// Create an empty lock manager.
    pub fn new() -> LockManager {
        LockManager {
            table: Mutex::new(LockTable {
                locks: HashMap::new(),
                waiting: HashMap::new(),
                victims: HashSet::new(),
            }),
            released: Condvar::new(),
        }
    }

    /// Acquire a lock, blocking until granted.
    ///
    /// Returns `Deadlock` when granting would close a cycle in the
    /// wait-for graph and this transaction is the youngest in it, or when
    /// another blocked transaction's detection chose this one as victim.
    pub fn acquire(&self, serial: u64, key: ResourceKey, mode: LockMode) -> Result<()> {
        let mut table = self.table.lock();
        loop {
            if table.victims.remove(&serial) {
                table.waiting.remove(&serial);
                self.released.notify_all();
                return Err(TrellisError::Deadlock { victim: serial });
            }

            let entry = table.locks.entry(key).or_default();
            if entry.grantable(serial, mode) {
                entry.grant(serial, mode);
                table.waiting.remove(&serial);
                return Ok(());
            }

            table.waiting.insert(serial, (key, mode));

            if let Some(victim) = find_deadlock_victim(&table, serial) {
                if victim == serial {
                    table.waiting.remove(&serial);
                    debug!(serial, "deadlock: aborting requesting transaction");
                    return Err(TrellisError::Deadlock { victim });
                }
                // Abort the younger waiter and let it unwind its locks.
                debug!(serial, victim, "deadlock: aborting younger waiter");
                table.victims.insert(victim);
                self.released.notify_all();
            }

            self.released.wait(&mut table);
        }
    }

    /// Release one previously acquired lock level.
    pub fn release(&self, serial: u64, key: ResourceKey, mode: LockMode) {
        let mut table = self.table.lock();
        if let Some(entry) = table.locks.get_mut(&key) {
            match mode {
                LockMode::Read => {
                    if let Some(count) = entry.readers.get_mut(&serial) {
                        *count -= 1;
                        if *count == 0 {
                            entry.readers.remove(&serial);
                        }
                    }
                }
                LockMode::Write => {
                    if let Some((holder, count)) = &mut entry.writer {
                        if *holder == serial {
                            *count -= 1;
                            if *count == 0 {
                                entry.writer = None;
                            }
                        }
                    }
                }
            }
            if entry.is_free() {
                table.locks.remove(&key);
            }
        }
        self.released.notify_all();
    }

    /// Release everything held by a transaction (commit/rollback path).
    pub fn release_all(&self, serial: u64) {
        let mut table = self.table.lock();
        table.locks.retain(|_, entry| {
            entry.readers.remove(&serial);
            if matches!(entry.writer, Some((holder, _)) if holder == serial) {
                entry.writer = None;
            }
            !entry.is_free()
        });
        table.waiting.remove(&serial);
        table.victims.remove(&serial);
        self.released.notify_all();
    }

    /// Number of records currently locked (for tests and introspection).
    pub fn locked_count(&self) -> usize {
        self.table.lock().locks.len()
    }
}

/// Search the wait-for graph for a cycle through `from`.
///
/// Edges run from a waiting transaction to every holder of the lock it
/// wants. Returns the youngest (highest-serial) member of the first cycle
/// found.
fn find_deadlock_victim(table: &LockTable, from: u64) -> Option<u64> {
    let mut path = vec![from];
    let mut visited = HashSet::new();
    dfs(table, from, from, &mut path, &mut visited)
}

fn dfs(
    table: &LockTable,
    origin: u64,
    current: u64,
    path: &mut Vec<u64>,
    visited: &mut HashSet<u64>,
) -> Option<u64> {
    let (key, mode) = match table.waiting.get(&current) {
        Some(wait) => *wait,
        None => return None, // not blocked → no outgoing edges
    };
    let entry = table.locks.get(&key)?;

    for holder in entry.blockers(current, mode) {
        if holder == origin {
            // Cycle closed: path holds every member.
            return path.iter().copied().max();
        }
        if visited.insert(holder) {
            path.push(holder);
            if let Some(victim) = dfs(table, origin, holder, path, visited) {
                return Some(victim);
            }
            path.pop();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn read_locks_are_shared() {
        let locks = LockManager::new();
        locks.acquire(1, ResourceKey::node(5), LockMode::Read).unwrap();
        locks.acquire(2, ResourceKey::node(5), LockMode::Read).unwrap();
        locks.release_all(1);
        locks.release_all(2);
        assert_eq!(locks.locked_count(), 0);
    }

    #[test]
    fn write_lock_is_reentrant() {
        let locks = LockManager::new();
        let key = ResourceKey::node(1);
        locks.acquire(1, key, LockMode::Write).unwrap();
        locks.acquire(1, key, LockMode::Write).unwrap();
        locks.acquire(1, key, LockMode::Read).unwrap();
        locks.release_all(1);
        assert_eq!(locks.locked_count(), 0);
    }

    #[test]
    fn writer_blocks_reader_until_release() {
        let locks = Arc::new(LockManager::new());
        let key = ResourceKey::relationship(7);
        locks.acquire(1, key, LockMode::Write).unwrap();

        let locks2 = Arc::clone(&locks);
        let waiter = thread::spawn(move || {
            locks2.acquire(2, key, LockMode::Read).unwrap();
            locks2.release_all(2);
        });

        thread::sleep(Duration::from_millis(50));
        locks.release_all(1);
        waiter.join().unwrap();
    }

    #[test]
    fn upgrade_with_sole_reader_succeeds() {
        let locks = LockManager::new();
        let key = ResourceKey::node(3);
        locks.acquire(1, key, LockMode::Read).unwrap();
        locks.acquire(1, key, LockMode::Write).unwrap();
        locks.release_all(1);
    }

    #[test]
    fn deadlock_aborts_youngest() {
        // Serial 1 (older) and 2 (younger) take {a, b} in opposing order.
        let locks = Arc::new(LockManager::new());
        let a = ResourceKey::node(1);
        let b = ResourceKey::node(2);

        locks.acquire(1, a, LockMode::Write).unwrap();
        locks.acquire(2, b, LockMode::Write).unwrap();

        let locks_old = Arc::clone(&locks);
        let older = thread::spawn(move || {
            // Blocks until 2 is aborted
            let result = locks_old.acquire(1, b, LockMode::Write);
            result
        });

        thread::sleep(Duration::from_millis(50));

        // Closing the cycle: either this call errors (2 is youngest), or
        // it was already chosen as victim by 1's detection.
        let result = locks.acquire(2, a, LockMode::Write);
        assert!(matches!(result, Err(TrellisError::Deadlock { victim: 2 })));
        locks.release_all(2);

        // The older transaction proceeds
        older.join().unwrap().unwrap();
        locks.release_all(1);
        assert_eq!(locks.locked_count(), 0);
    }

    #[test]
    fn victim_flag_aborts_waiting_transaction() {
        // The cycle is closed by the OLDER transaction: the younger one is
        // already waiting and must be woken with a deadlock error.
        let locks = Arc::new(LockManager::new());
        let a = ResourceKey::node(1);
        let b = ResourceKey::node(2);

        locks.acquire(1, a, LockMode::Write).unwrap();
        locks.acquire(2, b, LockMode::Write).unwrap();

        let locks_young = Arc::clone(&locks);
        let younger = thread::spawn(move || {
            let result = locks_young.acquire(2, a, LockMode::Write);
            // A real transaction unwinds its locks when aborted
            locks_young.release_all(2);
            result
        });

        thread::sleep(Duration::from_millis(50));

        // Older closes the cycle; detection picks 2 (youngest) as victim,
        // and proceeds once the victim has unwound.
        locks.acquire(1, b, LockMode::Write).unwrap();

        let result = younger.join().unwrap();
        assert!(matches!(result, Err(TrellisError::Deadlock { victim: 2 })));
        locks.release_all(1);
    }

    #[test]
    fn release_single_level() {
        let locks = LockManager::new();
        let key = ResourceKey::node(4);
        locks.acquire(1, key, LockMode::Read).unwrap();
        locks.acquire(1, key, LockMode::Read).unwrap();
        locks.release(1, key, LockMode::Read);
        assert_eq!(locks.locked_count(), 1);
        locks.release(1, key, LockMode::Read);
        assert_eq!(locks.locked_count(), 0);
    }
}
