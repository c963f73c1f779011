//! Per-user serialization of mutating operations

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;

/// Registry of user ids currently held by a mutating operation.
///
/// Only ids with an operation in flight occupy an entry, so the registry does
/// not grow with the number of enrolled users.
#[derive(Default)]
pub struct UserLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Exclusive hold on one user id, released on drop
pub struct UserGuard<'a> {
    locks: &'a UserLocks,
    user_id: String,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until no other operation holds `user_id`, then take it
    pub fn acquire(&self, user_id: &str) -> UserGuard<'_> {
        let mut held = self.held.lock();
        while held.contains(user_id) {
            self.released.wait(&mut held);
        }
        held.insert(user_id.to_string());

        UserGuard {
            locks: self,
            user_id: user_id.to_string(),
        }
    }

    pub fn is_held(&self, user_id: &str) -> bool {
        self.held.lock().contains(user_id)
    }
}

impl Drop for UserGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.user_id);
        self.locks.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_guard_releases_on_drop() {
        let locks = UserLocks::new();
        {
            let _guard = locks.acquire("alice");
            assert!(locks.is_held("alice"));
            assert!(!locks.is_held("bob"));
        }
        assert!(!locks.is_held("alice"));
    }

    #[test]
    fn test_same_user_is_serialized() {
        let locks = Arc::new(UserLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    let _guard = locks.acquire("alice");
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(!locks.is_held("alice"));
    }

    #[test]
    fn test_different_users_do_not_block() {
        let locks = UserLocks::new();
        let _alice = locks.acquire("alice");
        let _bob = locks.acquire("bob");
        assert!(locks.is_held("alice"));
        assert!(locks.is_held("bob"));
    }
}
