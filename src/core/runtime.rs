use crate::core::scheduler::Scheduler;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Background scheduling loop driving a shared [`Scheduler`].
///
/// Stopped until [`start`](Self::start) is called from inside a tokio runtime. The loop
/// runs a pass on every interval tick and whenever the scheduler signals new work.
pub struct SchedulerRuntime {
    scheduler: Arc<Scheduler>,
    running: Mutex<Option<Running>>,
}

impl SchedulerRuntime {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Spawn the loop. Returns false if it is already running or no tokio runtime is
    /// available.
    pub fn start(&self) -> bool {
        let mut running = self.running();
        if running.is_some() {
            tracing::warn!("Scheduler loop is already running");
            return false;
        }

        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            tracing::error!("Scheduler loop needs a tokio runtime to start");
            return false;
        };

        let (shutdown, rx) = watch::channel(false);
        let handle = rt.spawn(run(Arc::clone(&self.scheduler), rx));
        *running = Some(Running { shutdown, handle });
        tracing::info!(
            "Scheduler loop started (interval {:?}, batch size {})",
            self.scheduler.interval(),
            self.scheduler.batch_size()
        );
        true
    }

    /// Signal the loop to exit and wait until it has. No-op when stopped.
    pub async fn stop(&self) {
        let Some(Running { shutdown, handle }) = self.running().take() else {
            return;
        };

        // The receiver is gone only if the task already ended.
        let _ = shutdown.send(true);
        if let Err(e) = handle.await {
            tracing::error!("Scheduler loop ended abnormally: {}", e);
        }
        tracing::info!("Scheduler loop stopped");
    }
}

async fn run(scheduler: Arc<Scheduler>, mut shutdown: watch::Receiver<bool>) {
    let wake = scheduler.wake_handle();
    let period = scheduler.interval().max(Duration::from_millis(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
            _ = wake.notified() => {
                tracing::debug!("Scheduler woken up for new work");
            }
        }

        let report = scheduler.schedule_once();
        if report.is_idle() {
            tracing::trace!("Scheduling pass found nothing to do");
        } else {
            tracing::info!(
                "Scheduling pass: promoted={} attempted={} placed={} requeued={} failed={}",
                report.promoted,
                report.attempted,
                report.placed,
                report.requeued,
                report.failed
            );
        }
    }
}
