//! Background periodic jobs for the cleanup and rate-sampling passes.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Runs a closure on its own thread every `period` until dropped.
///
/// The drop handshake signals the condvar and joins, so a task never
/// outlives its owner and a pending sleep is cut short rather than waited
/// out.
pub(crate) struct PeriodicTask {
    shared: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<F>(name: &str, period: Duration, mut job: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                {
                    let (lock, cv) = &*thread_shared;
                    let mut stop = lock.lock();
                    if *stop {
                        return;
                    }
                    let _ = cv.wait_for(&mut stop, period);
                    if *stop {
                        return;
                    }
                }
                job();
            })
            .expect("failed to spawn periodic task thread");
        PeriodicTask {
            shared,
            handle: Some(handle),
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        {
            let (lock, cv) = &*self.shared;
            *lock.lock() = true;
            cv.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn fires_repeatedly() {
        let count = Arc::new(AtomicUsize::new(0));
        let job_count = Arc::clone(&count);
        let task = PeriodicTask::spawn("test-tick", Duration::from_millis(5), move || {
            job_count.fetch_add(1, Ordering::Relaxed);
        });
        let deadline = Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::Relaxed) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(count.load(Ordering::Relaxed) >= 3);
        drop(task);
    }

    #[test]
    fn drop_interrupts_a_long_sleep() {
        let count = Arc::new(AtomicUsize::new(0));
        let job_count = Arc::clone(&count);
        let task = PeriodicTask::spawn("test-sleepy", Duration::from_secs(3600), move || {
            job_count.fetch_add(1, Ordering::Relaxed);
        });
        let started = Instant::now();
        drop(task);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }
}
