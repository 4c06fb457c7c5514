// Pooled request tasks and items, with scoped acquisition that always returns them.

use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::options::{RequestOptions, RequestType};

/// Something a [`Pool`] can hand out again after clearing it.
pub trait Recycle: Default {
    fn reset(&mut self);
}

/// Free list of reusable values.
pub struct Pool<T: Recycle> {
    free: Mutex<Vec<T>>,
    max_idle: usize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl<T: Recycle> Pool<T> {
    pub fn new(max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_idle,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    pub fn acquire(&self) -> T {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        self.free.lock().pop().unwrap_or_default()
    }

    /// Reset `value` and keep it for reuse (dropped once `max_idle` are kept).
    pub fn release(&self, mut value: T) {
        value.reset();
        self.released.fetch_add(1, Ordering::Relaxed);
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(value);
        }
    }

    /// Acquire a value that goes back to the pool when the guard drops.
    pub fn scoped(&self) -> Pooled<'_, T> {
        Pooled {
            pool: self,
            value: self.acquire(),
        }
    }

    pub fn acquired_count(&self) -> usize {
        self.acquired.load(Ordering::Relaxed)
    }

    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }

    /// Values handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.acquired_count().saturating_sub(self.released_count())
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

impl<T: Recycle> Default for Pool<T> {
    fn default() -> Self {
        Self::new(64)
    }
}

pub struct Pooled<'a, T: Recycle> {
    pool: &'a Pool<T>,
    value: T,
}

impl<T: Recycle> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Recycle> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Recycle> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        self.pool.release(mem::take(&mut self.value));
    }
}

/// One entry of a load request as the caller named it.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestInput {
    pub kind: RequestType,
    pub target: String,
    pub options: RequestOptions,
}

impl RequestInput {
    pub fn new(kind: RequestType, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            options: RequestOptions::new(),
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self::new(RequestType::Url, url)
    }
}

/// A resolved load target, produced by URL resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestItem {
    pub id: String,
    pub url: String,
    pub ext: String,
    pub is_native: bool,
    /// Name of the bundle whose config resolved this item, if any.
    pub config: Option<String>,
    pub options: RequestOptions,
}

impl Recycle for RequestItem {
    fn reset(&mut self) {
        self.id.clear();
        self.url.clear();
        self.ext.clear();
        self.is_native = false;
        self.config = None;
        self.options.clear();
    }
}

#[derive(Debug, Default)]
pub struct RequestTask {
    pub input: Vec<RequestInput>,
    pub options: RequestOptions,
    pub output: Vec<RequestItem>,
}

impl Recycle for RequestTask {
    fn reset(&mut self) {
        self.input.clear();
        self.options.clear();
        self.output.clear();
    }
}

pub type TaskPool = Pool<RequestTask>;
pub type ItemPool = Pool<RequestItem>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_guard_returns_value_reset() {
        let pool: TaskPool = Pool::new(4);
        {
            let mut task = pool.scoped();
            task.input.push(RequestInput::url("http://cdn/a.png"));
            task.options.insert("reload", true);
        }
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 1);

        let reused = pool.acquire();
        assert!(reused.input.is_empty() && reused.options.is_empty());
        pool.release(reused);
    }

    #[test]
    fn test_guard_released_on_early_return() {
        fn fails(pool: &ItemPool) -> Result<(), &'static str> {
            let mut item = pool.scoped();
            item.url.push_str("http://cdn/a");
            Err("boom")
        }

        let pool = ItemPool::new(1);
        assert!(fails(&pool).is_err());
        assert_eq!(pool.released_count(), 1);

        // Over `max_idle` values are dropped instead of kept.
        pool.release(RequestItem::default());
        assert_eq!(pool.idle(), 1);
    }
}
