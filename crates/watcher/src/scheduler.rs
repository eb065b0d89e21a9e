use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A periodic job: the scheduler only sends ticks, the receiver does the work.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: &'static str,
    pub interval: Duration,
    pub tick: mpsc::Sender<()>,
}

/// Spawn one ticker per job. A ticker stops when `cancel` fires or its
/// receiver is dropped. Ticks missed while the receiver is busy are skipped.
pub fn start(jobs: Vec<JobSpec>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
    jobs.into_iter()
        .map(|job| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let start_at = Instant::now() + job.interval;
                let mut interval = tokio::time::interval_at(start_at, job.interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = interval.tick() => {}
                    }
                    tracing::debug!(job = job.name, "scheduler tick");
                    if job.tick.try_send(()).is_err() && job.tick.is_closed() {
                        break;
                    }
                }
            })
        })
        .collect()
}
