// Live statistics aggregation — cache hit rates, download throughput, worker counts.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

struct StatsSample {
    at: Instant,
    download_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub download_bps: u64,
    pub downloaded_bytes: u64,
    pub active_workers: u32,
    pub cache_hits: u64,
    pub local_loads: u64,
    pub completed_downloads: u64,
    pub failed_downloads: u64,
    /// Share of cacheable requests served from the cache.
    pub cache_hit_rate: f64,
}

pub struct StatsCollector {
    download_bytes_total: AtomicU64,
    active_workers: AtomicU32,
    cache_hits: AtomicU64,
    local_loads: AtomicU64,
    completed_downloads: AtomicU64,
    failed_downloads: AtomicU64,
    last_sample: Mutex<StatsSample>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            download_bytes_total: AtomicU64::new(0),
            active_workers: AtomicU32::new(0),
            cache_hits: AtomicU64::new(0),
            local_loads: AtomicU64::new(0),
            completed_downloads: AtomicU64::new(0),
            failed_downloads: AtomicU64::new(0),
            last_sample: Mutex::new(StatsSample {
                at: Instant::now(),
                download_bytes: 0,
            }),
        }
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.download_bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_local(&self) {
        self.local_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download_result(&self, success: bool) {
        let counter = if success {
            &self.completed_downloads
        } else {
            &self.failed_downloads
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_workers(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_workers(&self) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let now = Instant::now();
        let current_download = self.download_bytes_total.load(Ordering::Relaxed);

        let download_bps = {
            let mut sample = self.last_sample.lock();
            let elapsed = now.duration_since(sample.at).as_secs_f64();
            let bps = if elapsed > 0.1 {
                ((current_download - sample.download_bytes) as f64 / elapsed) as u64
            } else {
                0
            };
            sample.at = now;
            sample.download_bytes = current_download;
            bps
        };

        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let completed = self.completed_downloads.load(Ordering::Relaxed);
        let failed = self.failed_downloads.load(Ordering::Relaxed);
        let cacheable = cache_hits + completed + failed;
        let cache_hit_rate = if cacheable > 0 {
            cache_hits as f64 / cacheable as f64
        } else {
            0.0
        };

        StatsSnapshot {
            download_bps,
            downloaded_bytes: current_download,
            active_workers: self.active_workers.load(Ordering::Relaxed),
            cache_hits,
            local_loads: self.local_loads.load(Ordering::Relaxed),
            completed_downloads: completed,
            failed_downloads: failed,
            cache_hit_rate,
        }
    }

    pub fn total_downloaded(&self) -> u64 {
        self.download_bytes_total.load(Ordering::Relaxed)
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
