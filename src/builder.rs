use crate::scheduler::pool::{self, PoolConfig};
use anyhow::Result;

/// Configures the process-wide thread pool.
///
/// ```no_run
/// rayweft::Builder::new()
///     .num_threads(8)
///     .set_affinity(true)
///     .install()
///     .unwrap();
/// ```
pub struct Builder {
    cfg: PoolConfig,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            cfg: PoolConfig::default(),
        }
    }

    /// Number of worker threads; 0 selects the logical CPU count.
    /// Index 0 is reserved for the user thread, so `n` threads means
    /// `n - 1` OS workers plus the caller.
    pub fn num_threads(mut self, val: usize) -> Self {
        self.cfg.num_threads = val;
        self
    }

    /// Pin worker N to CPU N.
    pub fn set_affinity(mut self, val: bool) -> Self {
        self.cfg.set_affinity = val;
        self
    }

    /// Stack size in bytes for pool threads. Defaults to 4 MiB to match
    /// the recursion depth of divide-and-conquer kernels.
    pub fn thread_stack_size(mut self, bytes: usize) -> Self {
        self.cfg.stack_size = bytes;
        self
    }

    /// Creates the pool, or adjusts the thread count when it already
    /// exists. Threads are started lazily on first use.
    pub fn install(self) -> Result<()> {
        pool::create(self.cfg)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
