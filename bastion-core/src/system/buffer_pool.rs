//! Size-classed buffer pool for the copy path.
//!
//! Buffers are grouped into 4 KiB, 16 KiB and 64 KiB classes. `get` rounds
//! the requested size up to the owning class; buffers above the largest
//! class are allocated fresh and never retained on `put`. The copy loop
//! upgrades to the next class when a read fills the current buffer.

use std::sync::Mutex;

pub const CLASS_SMALL: usize = 4 * 1024;
pub const CLASS_MEDIUM: usize = 16 * 1024;
pub const CLASS_LARGE: usize = 64 * 1024;

/// Largest capacity ever retained by the pool.
pub const MAX_POOLED: usize = CLASS_LARGE;

pub struct BufferPool {
    small: Mutex<Vec<Vec<u8>>>,
    medium: Mutex<Vec<Vec<u8>>>,
    large: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        BufferPool {
            small: Mutex::new(Vec::new()),
            medium: Mutex::new(Vec::new()),
            large: Mutex::new(Vec::new()),
        }
    }

    /// Round `size` up to a 4 KiB boundary, floor 4 KiB.
    pub fn normalize(size: usize) -> usize {
        let size = size.max(CLASS_SMALL);
        size.div_ceil(CLASS_SMALL) * CLASS_SMALL
    }

    fn class_of(size: usize) -> Option<usize> {
        if size <= CLASS_SMALL {
            Some(CLASS_SMALL)
        } else if size <= CLASS_MEDIUM {
            Some(CLASS_MEDIUM)
        } else if size <= CLASS_LARGE {
            Some(CLASS_LARGE)
        } else {
            None
        }
    }

    fn shelf(&self, class: usize) -> &Mutex<Vec<Vec<u8>>> {
        match class {
            CLASS_SMALL => &self.small,
            CLASS_MEDIUM => &self.medium,
            _ => &self.large,
        }
    }

    /// Fetch a zeroed buffer whose length covers `size`. Requests above the
    /// largest class are honored with a plain allocation.
    pub fn get(&self, size: usize) -> Vec<u8> {
        let want = Self::normalize(size);
        match Self::class_of(want) {
            Some(class) => {
                let reused = self.shelf(class).lock().expect("pool lock poisoned").pop();
                match reused {
                    Some(buf) => buf,
                    None => vec![0u8; class],
                }
            }
            None => vec![0u8; want],
        }
    }

    /// Return a buffer to its class shelf. Contents are kept as-is;
    /// oversize buffers are dropped.
    pub fn put(&self, buf: Vec<u8>) {
        let cap = buf.len();
        if cap > MAX_POOLED {
            return;
        }
        if let Some(class) = Self::class_of(cap) {
            if cap == class {
                self.shelf(class)
                    .lock()
                    .expect("pool lock poisoned")
                    .push(buf);
            }
        }
    }

    /// Next class up for adaptive growth; saturates at the largest class.
    pub fn next_size(cur: usize) -> usize {
        if cur < CLASS_SMALL {
            CLASS_SMALL
        } else if cur < CLASS_MEDIUM {
            CLASS_MEDIUM
        } else {
            CLASS_LARGE
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static::lazy_static! {
    pub static ref COPY_BUFFERS: BufferPool = BufferPool::new();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rounds_to_4k() {
        assert_eq!(BufferPool::normalize(1), CLASS_SMALL);
        assert_eq!(BufferPool::normalize(4096), 4096);
        assert_eq!(BufferPool::normalize(4097), 8192);
        assert_eq!(BufferPool::normalize(70_000), 73_728);
    }

    #[test]
    fn get_put_reuses_buffer() {
        let pool = BufferPool::new();
        let buf = pool.get(10_000);
        assert_eq!(buf.len(), CLASS_MEDIUM);
        pool.put(buf);
        let again = pool.get(10_000);
        assert_eq!(again.len(), CLASS_MEDIUM);
        assert_eq!(pool.medium.lock().unwrap().len(), 0);
    }

    #[test]
    fn oversize_is_allocated_but_never_retained() {
        let pool = BufferPool::new();
        let big = pool.get(128 * 1024);
        assert!(big.len() >= 128 * 1024);
        pool.put(big);
        assert!(pool.large.lock().unwrap().is_empty());
    }

    #[test]
    fn next_size_walks_classes() {
        assert_eq!(BufferPool::next_size(CLASS_SMALL), CLASS_MEDIUM);
        assert_eq!(BufferPool::next_size(CLASS_MEDIUM), CLASS_LARGE);
        assert_eq!(BufferPool::next_size(CLASS_LARGE), CLASS_LARGE);
    }
}
