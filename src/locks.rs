use std::sync::{Mutex, MutexGuard, PoisonError};

const DEFAULT_STRIPES: usize = 64;

/// 分段键锁
///
/// 同一个键永远落在同一段，所以同一标识符上的“读-判断-写”串行执行；
/// 不同标识符大多落在不同段，可以并行。段数固定，内存不随键数增长。
pub struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::with_stripes(DEFAULT_STRIPES)
    }

    pub fn with_stripes(count: usize) -> Self {
        Self {
            stripes: (0..count.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        // 提交本身是原子的，持锁线程 panic 不会留下半写状态
        self.stripes[self.stripe(key)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 一次锁住多个键，按段号升序加锁避免死锁
    pub fn lock_many<'a, I>(&self, keys: I) -> Vec<MutexGuard<'_, ()>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut indices: Vec<usize> = keys.into_iter().map(|k| self.stripe(k)).collect();
        indices.sort_unstable();
        indices.dedup();
        indices
            .into_iter()
            .map(|i| self.stripes[i].lock().unwrap_or_else(PoisonError::into_inner))
            .collect()
    }

    fn stripe(&self, key: &str) -> usize {
        let digest = blake3::hash(key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        (u64::from_le_bytes(prefix) % self.stripes.len() as u64) as usize
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn same_key_is_serialized() {
        let locks = Arc::new(KeyLocks::with_stripes(4));
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let _guard = locks.lock("E1");
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker");
        }
    }

    #[test]
    fn lock_many_dedups_shared_stripes() {
        let locks = KeyLocks::with_stripes(1);
        let guards = locks.lock_many(["E1", "E2", "E3"]);
        assert_eq!(guards.len(), 1);
    }
}
