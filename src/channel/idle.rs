//! Software idle timeout driven by read/write timestamps.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::pipeline::{ChannelEvent, ConnectionInfo, Pipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    Uninitialized,
    Active,
    /// Terminal, the monitor never schedules again.
    Destroyed,
}

/// Fires [ChannelEvent::AllIdle] when neither a read nor a completed write
/// happened for a whole window.
///
/// One monitor watches one channel. Use [IdleMonitor::new_instance] to get a
/// fresh monitor with the same window for another channel.
#[derive(Debug)]
pub struct IdleMonitor {
    all_idle_time: Duration,
    inner: Arc<Mutex<Inner>>,
    /// Held while an idle event is delivered, so [IdleMonitor::destroy]
    /// waits for it. Reentrant, listeners may destroy from the callback.
    firing: Arc<ReentrantMutex<()>>,
}

#[derive(Debug)]
struct Inner {
    state: IdleState,
    last_read: Instant,
    last_write: Instant,
    timer: Option<CancellationToken>,
}

impl IdleMonitor {
    /// A zero `all_idle_time` disables the timer.
    pub fn new(all_idle_time: Duration) -> Self {
        let now = Instant::now();

        Self {
            all_idle_time,
            inner: Arc::new(Mutex::new(Inner {
                state: IdleState::Uninitialized,
                last_read: now,
                last_write: now,
                timer: None,
            })),
            firing: Arc::new(ReentrantMutex::new(())),
        }
    }

    /// A new, uninitialized monitor with the same window.
    pub fn new_instance(&self) -> Self {
        Self::new(self.all_idle_time)
    }

    // === Getters ===

    pub fn all_idle_time(&self) -> Duration {
        self.all_idle_time
    }

    pub fn state(&self) -> IdleState {
        self.inner.lock().state
    }

    /// Time of the most recent read or completed write.
    pub fn last_io(&self) -> Instant {
        let inner = self.inner.lock();
        inner.last_read.max(inner.last_write)
    }

    // === Public Methods ===

    /// Starts watching. Ignored unless the monitor is uninitialized.
    ///
    /// Must be called within a tokio runtime.
    pub fn activate(&self, pipeline: Pipeline, info: ConnectionInfo) {
        let mut inner = self.inner.lock();
        if inner.state != IdleState::Uninitialized {
            return;
        }
        inner.state = IdleState::Active;

        let now = Instant::now();
        inner.last_read = now;
        inner.last_write = now;

        if self.all_idle_time.is_zero() {
            return;
        }

        let cancel = CancellationToken::new();
        inner.timer = Some(cancel.clone());

        tokio::spawn(all_idle_timeout_task(
            self.inner.clone(),
            self.firing.clone(),
            self.all_idle_time,
            pipeline,
            info,
            cancel,
        ));
    }

    pub fn on_read(&self) {
        self.inner.lock().last_read = Instant::now();
    }

    /// Called once a write reached the socket, not when it is initiated.
    pub fn on_write_complete(&self) {
        self.inner.lock().last_write = Instant::now();
    }

    /// Cancels the pending timer. Terminal, no idle event is delivered once
    /// this returns.
    pub fn destroy(&self) {
        let _firing = self.firing.lock();
        let mut inner = self.inner.lock();
        inner.state = IdleState::Destroyed;
        if let Some(timer) = inner.timer.take() {
            timer.cancel();
        }
    }
}

async fn all_idle_timeout_task(
    inner: Arc<Mutex<Inner>>,
    firing: Arc<ReentrantMutex<()>>,
    all_idle_time: Duration,
    pipeline: Pipeline,
    info: ConnectionInfo,
    cancel: CancellationToken,
) {
    let mut delay = all_idle_time;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        delay = {
            // Re-checked under the lock, destroy() may have run meanwhile.
            let _firing = firing.lock();
            let idle_for = {
                let inner = inner.lock();
                if inner.state != IdleState::Active {
                    return;
                }
                Instant::now().saturating_duration_since(inner.last_read.max(inner.last_write))
            };

            if idle_for >= all_idle_time {
                // Idle for the whole window, notify and start a full new one.
                debug!(context = "idle_monitor", remote = ?info.remote, ?idle_for, "Channel is idle");
                pipeline.fire_event(&info, ChannelEvent::AllIdle);
                all_idle_time
            } else {
                // Traffic happened, wake up exactly on the real deadline.
                all_idle_time - idle_for
            }
        };
    }
}
