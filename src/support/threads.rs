//! A fixed-size fan-out helper for the phases that opt in to threads.
//!
//! Work items are split into contiguous chunks, one worker per chunk;
//! results come back in item order, and returning from
//! [`ThreadPool::parallel_map`] is the phase barrier. Workers share only
//! `Sync` state; all mutation happens in the owned per-item results.

/// A bounded worker count for parallel phases
#[derive(Debug, Clone, Copy)]
pub struct ThreadPool {
    threads: usize,
}

impl ThreadPool {
    /// A pool of `threads` workers; zero means hardware concurrency
    pub fn new(threads: usize) -> Self {
        let threads = if threads == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            threads
        };
        ThreadPool { threads }
    }

    /// The worker count
    pub fn thread_count(&self) -> usize {
        self.threads
    }

    /// Map `f` over `items` on the pool; blocks until every worker
    /// finishes and returns results in item order
    pub fn parallel_map<T, R, F>(&self, items: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync,
    {
        if self.threads <= 1 || items.len() <= 1 {
            return items.iter().map(&f).collect();
        }
        let chunk_size = items.len().div_ceil(self.threads);
        let f = &f;
        std::thread::scope(|scope| {
            let handles: Vec<_> = items
                .chunks(chunk_size)
                .map(|chunk| scope.spawn(move || chunk.iter().map(f).collect::<Vec<R>>()))
                .collect();
            let mut results = Vec::with_capacity(items.len());
            for handle in handles {
                if let Ok(part) = handle.join() {
                    results.extend(part);
                }
            }
            results
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_preserve_item_order() {
        let pool = ThreadPool::new(4);
        let items: Vec<u64> = (0..100).collect();
        let doubled = pool.parallel_map(&items, |&v| v * 2);
        assert_eq!(doubled.len(), 100);
        assert!(doubled.iter().enumerate().all(|(i, &v)| v == i as u64 * 2));
    }

    #[test]
    fn single_thread_pool_runs_inline() {
        let pool = ThreadPool::new(1);
        assert_eq!(pool.parallel_map(&[1, 2, 3], |&v| v + 1), vec![2, 3, 4]);
    }
}
