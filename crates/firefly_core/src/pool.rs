//! A pool of worker threads with a double-ended task queue.
//!
//! Tasks are enqueued either at the back (normal priority) or at the front
//! (feed and interpolate jobs, which unblock further probe generation).
//! `wait` lets the scheduler block until some worker finishes its current
//! task; `kill_all` drains the queue and waits for running tasks, which is
//! how the new-prime barrier empties the pipeline.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce(usize) + Send + 'static>;

struct PoolInner {
    tasks: VecDeque<Task>,
    stop: bool,
    idle: Vec<bool>,
}

impl PoolInner {
    fn all_threads_idle(&self) -> bool {
        self.tasks.is_empty() && self.idle.iter().all(|&i| i)
    }
}

struct PoolShared {
    inner: Mutex<PoolInner>,
    /// Signals workers that a task arrived or the pool shuts down.
    condition: Condvar,
    /// Signals waiters that a worker went idle.
    condition_wait: Condvar,
}

/// A fixed-size pool of worker threads.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawn a pool with `pool_size` workers. Each task receives the index
    /// of the worker running it.
    pub fn new(pool_size: usize) -> Self {
        let shared = Arc::new(PoolShared {
            inner: Mutex::new(PoolInner {
                tasks: VecDeque::new(),
                stop: false,
                idle: vec![true; pool_size],
            }),
            condition: Condvar::new(),
            condition_wait: Condvar::new(),
        });

        let threads = (0..pool_size)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || worker_loop(shared, i))
            })
            .collect();

        Self { shared, threads }
    }

    pub fn size(&self) -> usize {
        self.threads.len()
    }

    pub fn queue_size(&self) -> usize {
        self.shared.inner.lock().unwrap().tasks.len()
    }

    /// Enqueue a task at the back of the queue.
    pub fn run_task<F>(&self, task: F)
    where
        F: FnOnce(usize) + Send + 'static,
    {
        if self.threads.is_empty() {
            task(0);
            return;
        }

        self.shared
            .inner
            .lock()
            .unwrap()
            .tasks
            .push_back(Box::new(task));
        self.shared.condition.notify_one();
    }

    /// Enqueue a task at the front of the queue.
    pub fn run_priority_task<F>(&self, task: F)
    where
        F: FnOnce(usize) + Send + 'static,
    {
        if self.threads.is_empty() {
            task(0);
            return;
        }

        self.shared
            .inner
            .lock()
            .unwrap()
            .tasks
            .push_front(Box::new(task));
        self.shared.condition.notify_one();
    }

    /// If some worker is busy, block until one finishes and return true.
    /// Returns false immediately when all workers are idle and no task is
    /// queued.
    pub fn wait(&self) -> bool {
        let inner = self.shared.inner.lock().unwrap();

        if !inner.all_threads_idle() {
            let _unused = self.shared.condition_wait.wait(inner).unwrap();
            true
        } else {
            false
        }
    }

    /// Drop all queued tasks and wait until every running task finished.
    pub fn kill_all(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.tasks.clear();

        while !inner.all_threads_idle() {
            inner.tasks.clear();
            inner = self.shared.condition_wait.wait(inner).unwrap();
        }

        inner.tasks.clear();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.stop = true;
        }
        self.shared.condition.notify_all();

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>, index: usize) {
    loop {
        let task = {
            let mut inner = shared.inner.lock().unwrap();
            inner.idle[index] = true;
            shared.condition_wait.notify_all();

            loop {
                if inner.stop && inner.tasks.is_empty() {
                    return;
                }
                if let Some(task) = inner.tasks.pop_front() {
                    inner.idle[index] = false;
                    break task;
                }
                inner = shared.condition.wait(inner).unwrap();
            }
        };

        task(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_tasks_run() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.run_task(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        while pool.wait() {}
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_priority_task_runs_first() {
        let pool = ThreadPool::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        // Block the single worker so the queue can be arranged.
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        {
            let gate = Arc::clone(&gate);
            pool.run_task(move |_| {
                let (lock, cvar) = &*gate;
                let mut open = lock.lock().unwrap();
                while !*open {
                    open = cvar.wait(open).unwrap();
                }
            });
        }

        std::thread::sleep(Duration::from_millis(20));

        for label in ["back1", "back2"] {
            let order = Arc::clone(&order);
            pool.run_task(move |_| order.lock().unwrap().push(label));
        }
        {
            let order = Arc::clone(&order);
            pool.run_priority_task(move |_| order.lock().unwrap().push("front"));
        }

        {
            let (lock, cvar) = &*gate;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }

        while pool.wait() {}
        assert_eq!(*order.lock().unwrap(), vec!["front", "back1", "back2"]);
    }

    #[test]
    fn test_kill_all_drains_queue() {
        let pool = ThreadPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..1000 {
            let counter = Arc::clone(&counter);
            pool.run_task(move |_| {
                std::thread::sleep(Duration::from_micros(100));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.kill_all();
        let after_kill = counter.load(Ordering::SeqCst);
        assert!(after_kill < 1000);

        // The pool remains usable.
        let counter2 = Arc::clone(&counter);
        counter.store(0, Ordering::SeqCst);
        pool.run_task(move |_| {
            counter2.fetch_add(1, Ordering::SeqCst);
        });
        while pool.wait() {}
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
