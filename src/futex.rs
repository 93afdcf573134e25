//! This module provides the futex pool: one wait queue per guest
//! address, created lazily on the first WAIT and destroyed when the
//! last waiter leaves.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use nix::errno::Errno;

use crate::map::AddressSpace;

/// One guest address's wait queue. Waiting happens against the
/// per-futex mutex and condition so unrelated addresses never contend.
pub struct Futex {
    pub addr: u64,
    waiters: Mutex<u32>,
    cond: Condvar,
}

/// The pool, keyed by guest address. The pool lock is held only for
/// find/create/remove.
pub struct FutexPool {
    futexes: Mutex<Vec<Arc<Futex>>>,
}

impl FutexPool {
    pub fn new() -> Self {
        Self {
            futexes: Mutex::new(Vec::new()),
        }
    }

    /// FUTEX_WAIT: returns 0 on wake or spurious wake, EAGAIN when the
    /// word already differs, ETIMEDOUT past the deadline.
    pub fn wait(
        &self,
        mem: &AddressSpace,
        uaddr: u64,
        expect: u32,
        timeout: Option<Duration>,
    ) -> Result<i64, Errno> {
        let word = mem.atomic_u32(uaddr).ok_or(Errno::EFAULT)?;
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut pool = self.futexes.lock().unwrap();
        if word.load(Ordering::SeqCst) != expect {
            return Err(Errno::EAGAIN);
        }
        let futex = match pool.iter().find(|f| f.addr == uaddr) {
            Some(f) => f.clone(),
            None => {
                let f = Arc::new(Futex {
                    addr: uaddr,
                    waiters: Mutex::new(0),
                    cond: Condvar::new(),
                });
                pool.push(f.clone());
                f
            }
        };
        let mut count = futex.waiters.lock().unwrap();
        *count += 1;
        drop(pool);

        let rc = match deadline {
            None => {
                count = futex.cond.wait(count).unwrap();
                Ok(0)
            }
            Some(deadline) => {
                let now = Instant::now();
                let left = deadline.saturating_duration_since(now);
                let (guard, result) = futex.cond.wait_timeout(count, left).unwrap();
                count = guard;
                if result.timed_out() {
                    Err(Errno::ETIMEDOUT)
                } else {
                    Ok(0)
                }
            }
        };

        *count -= 1;
        let empty = *count == 0;
        drop(count);
        if empty {
            let mut pool = self.futexes.lock().unwrap();
            // A new waiter may have raced in while we re-took the pool
            // lock; only retire a queue that is still empty.
            if let Some(i) = pool.iter().position(|f| f.addr == uaddr) {
                if *pool[i].waiters.lock().unwrap() == 0 {
                    pool.swap_remove(i);
                }
            }
        }
        rc
    }

    /// FUTEX_WAKE: signals up to `count` waiters, returning how many
    /// were woken.
    pub fn wake(&self, uaddr: u64, count: u32) -> i64 {
        if count == 0 {
            return 0;
        }
        let pool = self.futexes.lock().unwrap();
        let futex = match pool.iter().find(|f| f.addr == uaddr) {
            Some(f) => f.clone(),
            None => return 0,
        };
        let waiters = futex.waiters.lock().unwrap();
        drop(pool);
        let woken = if count == 1 {
            futex.cond.notify_one();
            1
        } else {
            futex.cond.notify_all();
            *waiters as i64
        };
        drop(waiters);
        woken
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.futexes.lock().unwrap().len()
    }
}

impl Default for FutexPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{PageKey, MIN_BRK};
    use std::sync::atomic::AtomicU32;

    fn arena() -> Arc<AddressSpace> {
        let space = AddressSpace::new(1 << 20, MIN_BRK).unwrap();
        space
            .lock()
            .reserve(0x1000, 0x1000, PageKey::U | PageKey::RW, -1, false);
        Arc::new(space)
    }

    #[test]
    fn wait_on_changed_word_is_eagain() {
        let mem = arena();
        let pool = FutexPool::new();
        let word = mem.atomic_u32(0x1000).unwrap();
        word.store(5, Ordering::SeqCst);
        assert_eq!(pool.wait(&mem, 0x1000, 4, None), Err(Errno::EAGAIN));
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn misaligned_address_is_efault() {
        let mem = arena();
        let pool = FutexPool::new();
        assert_eq!(pool.wait(&mem, 0x1002, 0, None), Err(Errno::EFAULT));
    }

    #[test]
    fn wait_times_out_and_retires_queue() {
        let mem = arena();
        let pool = FutexPool::new();
        let rc = pool.wait(&mem, 0x1000, 0, Some(Duration::from_millis(10)));
        assert_eq!(rc, Err(Errno::ETIMEDOUT));
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn wake_without_waiters_returns_zero() {
        let pool = FutexPool::new();
        assert_eq!(pool.wake(0x1000, 1), 0);
    }

    #[test]
    fn wait_wake_roundtrip() {
        let mem = arena();
        let pool = Arc::new(FutexPool::new());
        let word: &AtomicU32 = mem.atomic_u32(0x1000).unwrap();
        word.store(0, Ordering::SeqCst);

        let mem2 = mem.clone();
        let pool2 = pool.clone();
        let waiter = std::thread::spawn(move || {
            pool2.wait(&mem2, 0x1000, 0, Some(Duration::from_secs(5)))
        });

        // Give the waiter a moment to enqueue, then store and wake.
        loop {
            std::thread::sleep(Duration::from_millis(5));
            word.store(1, Ordering::SeqCst);
            if pool.wake(0x1000, 1) > 0 {
                break;
            }
            if word.load(Ordering::SeqCst) == 1 && pool.len() == 0 {
                // Waiter may have timed out in a pathological schedule.
                break;
            }
        }
        let rc = waiter.join().unwrap();
        assert!(rc == Ok(0) || rc == Err(Errno::ETIMEDOUT));
        assert_eq!(word.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 0);
    }
}
