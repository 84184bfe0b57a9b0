//! In-memory per-user quota accounting.
//!
//! `limit == 0` means unlimited. Admission control is a reservation: a
//! transfer reserves its worst-case growth under the table lock before any
//! file is opened, then commits the real signed delta (or releases) exactly
//! once when it finishes. Two concurrent uploads by one owner therefore
//! cannot both pass the check and overshoot the limit.

use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default, Clone, Copy)]
struct Quota {
    limit: u64,
    used: u64,
    reserved: u64,
}

#[derive(Default)]
pub struct QuotaManager {
    table: Mutex<HashMap<String, Quota>>,
}

impl QuotaManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_limit(&self, user: &str, limit: u64) {
        let mut table = self.table.lock();
        table.entry(user.to_string()).or_default().limit = limit;
    }

    /// Install the persisted usage for a user at login. Usage is recomputed
    /// from the stored value, not accumulated, so a re-login cannot
    /// double-count.
    pub fn load(&self, user: &str, limit: u64, used: u64) {
        let mut table = self.table.lock();
        let q = table.entry(user.to_string()).or_default();
        q.limit = limit;
        q.used = used;
    }

    /// Reserve `additional` bytes against the limit. Returns false (and
    /// reserves nothing) when the limit would be exceeded.
    pub fn try_reserve(&self, user: &str, additional: u64) -> bool {
        let mut table = self.table.lock();
        let q = table.entry(user.to_string()).or_default();
        let projected = q
            .used
            .saturating_add(q.reserved)
            .saturating_add(additional);
        if q.limit != 0 && projected > q.limit {
            return false;
        }
        q.reserved = q.reserved.saturating_add(additional);
        true
    }

    /// Release a reservation and apply the actual signed delta, clamping used
    /// at zero. Returns the new usage.
    pub fn commit_reservation(&self, user: &str, reservation: u64, delta: i64) -> u64 {
        let mut table = self.table.lock();
        let q = table.entry(user.to_string()).or_default();
        q.reserved = q.reserved.saturating_sub(reservation);
        q.used = apply_delta(q.used, delta);
        q.used
    }

    /// Drop a reservation without touching usage (failed transfer).
    pub fn release_reservation(&self, user: &str, reservation: u64) {
        let mut table = self.table.lock();
        let q = table.entry(user.to_string()).or_default();
        q.reserved = q.reserved.saturating_sub(reservation);
    }

    /// Unreserved admission check, for callers that only want the answer.
    pub fn can_allocate(&self, user: &str, additional: u64) -> bool {
        let table = self.table.lock();
        match table.get(user) {
            Some(q) => {
                q.limit == 0
                    || q.used.saturating_add(q.reserved).saturating_add(additional) <= q.limit
            }
            None => true,
        }
    }

    pub fn add_usage(&self, user: &str, delta: u64) {
        let mut table = self.table.lock();
        let q = table.entry(user.to_string()).or_default();
        q.used = q.used.saturating_add(delta);
    }

    /// Signed adjustment clamped at zero; returns the new usage.
    pub fn adjust_usage(&self, user: &str, delta: i64) -> u64 {
        let mut table = self.table.lock();
        let q = table.entry(user.to_string()).or_default();
        q.used = apply_delta(q.used, delta);
        q.used
    }

    pub fn used(&self, user: &str) -> u64 {
        let table = self.table.lock();
        table.get(user).map(|q| q.used).unwrap_or(0)
    }
}

fn apply_delta(used: u64, delta: i64) -> u64 {
    if delta >= 0 {
        used.saturating_add(delta as u64)
    } else {
        used.saturating_sub(delta.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn zero_limit_is_unlimited() {
        let q = QuotaManager::new();
        q.load("alice", 0, 0);
        assert!(q.try_reserve("alice", u64::MAX / 2));
    }

    #[test]
    fn reserve_commit_release_cycle() {
        let q = QuotaManager::new();
        q.load("alice", 100, 0);
        assert!(q.try_reserve("alice", 60));
        // The reservation counts against further admission.
        assert!(!q.try_reserve("alice", 50));
        assert!(!q.can_allocate("alice", 50));
        assert_eq!(q.commit_reservation("alice", 60, 60), 60);
        assert_eq!(q.used("alice"), 60);
        // Released reservations free headroom without changing usage.
        assert!(q.try_reserve("alice", 40));
        q.release_reservation("alice", 40);
        assert_eq!(q.used("alice"), 60);
        assert!(q.can_allocate("alice", 40));
    }

    #[test]
    fn adjust_clamps_at_zero() {
        let q = QuotaManager::new();
        q.load("alice", 0, 10);
        assert_eq!(q.adjust_usage("alice", -25), 0);
        assert_eq!(q.adjust_usage("alice", 7), 7);
        assert_eq!(q.used("alice"), 7);
    }

    #[test]
    fn load_is_absolute_not_additive() {
        let q = QuotaManager::new();
        q.load("alice", 100, 40);
        q.load("alice", 100, 40);
        assert_eq!(q.used("alice"), 40);
    }

    #[test]
    fn concurrent_reserves_never_overshoot() {
        let q = Arc::new(QuotaManager::new());
        q.load("alice", 1000, 0);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || {
                let mut admitted = 0u64;
                for _ in 0..100 {
                    if q.try_reserve("alice", 10) {
                        q.commit_reservation("alice", 10, 10);
                        admitted += 10;
                    }
                }
                admitted
            }));
        }
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, q.used("alice"));
        assert!(total <= 1000);
    }
}
