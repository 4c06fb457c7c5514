// Download throttling — per-context caps on outstanding downloads and on starts per tick.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ThrottleConfig, ThrottlePreset};
use crate::error::AssetError;

/// Which caller a download is made for. Each context has its own caps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadContext {
    #[default]
    Default,
    Preload,
    Scene,
    Bundle,
}

impl LoadContext {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "default" => Some(LoadContext::Default),
            "preload" => Some(LoadContext::Preload),
            "scene" => Some(LoadContext::Scene),
            "bundle" => Some(LoadContext::Bundle),
            _ => None,
        }
    }

    fn lane(self) -> usize {
        match self {
            LoadContext::Default => 0,
            LoadContext::Preload => 1,
            LoadContext::Scene => 2,
            LoadContext::Bundle => 3,
        }
    }
}

struct TickWindow {
    started: Instant,
    admitted: u32,
}

struct Lane {
    semaphore: Arc<Semaphore>,
    max_per_tick: u32,
    window: Mutex<TickWindow>,
}

impl Lane {
    fn new(preset: ThrottlePreset) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(preset.max_concurrency.max(1))),
            max_per_tick: preset.max_requests_per_frame.max(1),
            window: Mutex::new(TickWindow {
                started: Instant::now(),
                admitted: 0,
            }),
        }
    }

    /// How long to wait before another start fits into a tick; `None` admits now.
    fn try_admit(&self, tick: Duration) -> Option<Duration> {
        let mut window = self.window.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(window.started);
        if elapsed >= tick {
            window.started = now;
            window.admitted = 0;
        }
        if window.admitted < self.max_per_tick {
            window.admitted += 1;
            None
        } else {
            Some(tick.saturating_sub(now.duration_since(window.started)))
        }
    }
}

/// Held for the duration of one download.
pub struct ThrottlePermit {
    _permit: OwnedSemaphorePermit,
}

pub struct Throttle {
    lanes: [Lane; 4],
    tick: Duration,
}

impl Throttle {
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            lanes: [
                Lane::new(config.default),
                Lane::new(config.preload),
                Lane::new(config.scene),
                Lane::new(config.bundle),
            ],
            tick: Duration::from_millis(config.tick_interval_ms.max(1)),
        }
    }

    /// Wait for a start slot in the current tick, then for a concurrency permit.
    pub async fn acquire(
        &self,
        context: LoadContext,
        shutdown: &CancellationToken,
    ) -> Result<ThrottlePermit, AssetError> {
        let lane = &self.lanes[context.lane()];
        if shutdown.is_cancelled() {
            return Err(AssetError::Shutdown);
        }

        while let Some(wait) = lane.try_admit(self.tick) {
            debug!("{:?} start cap reached, waiting {:?}", context, wait);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(AssetError::Shutdown),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(AssetError::Shutdown),
            permit = Arc::clone(&lane.semaphore).acquire_owned() => {
                permit.map_err(|_| AssetError::Shutdown)?
            }
        };

        Ok(ThrottlePermit { _permit: permit })
    }

    /// Concurrency permits currently free for `context`.
    pub fn available(&self, context: LoadContext) -> usize {
        self.lanes[context.lane()].semaphore.available_permits()
    }
}
