use parking_lot::{Condvar, Mutex};

/// Counting semaphore used for the two-tier search bound: readers take one
/// permit, writers take every permit, so a writer never observes an
/// in-flight read.
pub(crate) struct Semaphore {
    capacity: usize,
    available: Mutex<usize>,
    cond: Condvar,
}

pub(crate) struct SemaphoreGuard<'a> {
    sem: &'a Semaphore,
    n: usize,
}

impl Semaphore {
    pub fn new(capacity: usize) -> Semaphore {
        let capacity = capacity.max(1);
        Semaphore {
            capacity,
            available: Mutex::new(capacity),
            cond: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn acquire(&self, n: usize) -> SemaphoreGuard<'_> {
        let n = n.min(self.capacity);
        let mut avail = self.available.lock();
        while *avail < n {
            self.cond.wait(&mut avail);
        }
        *avail -= n;
        SemaphoreGuard { sem: self, n }
    }
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        let mut avail = self.sem.available.lock();
        *avail += self.n;
        self.sem.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn writers_exclude_readers() {
        let sem = Arc::new(Semaphore::new(4));
        let running = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sem = sem.clone();
            let running = running.clone();
            handles.push(std::thread::spawn(move || {
                let _g = sem.acquire(1);
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                assert!(now <= 4);
                std::thread::sleep(std::time::Duration::from_millis(5));
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        {
            let _all = sem.acquire(4);
            assert_eq!(running.load(Ordering::SeqCst), 0);
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
