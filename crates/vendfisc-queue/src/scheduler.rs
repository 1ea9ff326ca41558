//! # Shift Scheduler
//!
//! Periodic housekeeping for the queue.
//!
//! ```text
//! every scheduler_interval:
//!   for each operational device
//!     no OPEN shift, auto-open due    → enqueue shift_open  (Scheduled)
//!     OPEN shift past close time      → enqueue shift_close (Scheduled)
//!     OPEN shift older than max hours → enqueue shift_close (MaxDuration)
//!   PROCESSING claims older than stale_after → RETRY / FAILED
//! ```
//!
//! The scheduler never flips a shift itself; it only enqueues. Repeated
//! ticks collapse onto the same live item through the idempotency key.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use vendfisc_core::operation::ShiftTrigger;
use vendfisc_core::shift::{auto_close_due, auto_open_due, AutoCloseReason};
use vendfisc_core::{CoreError, FiscalDevice};

use crate::error::{QueueError, QueueResult};
use crate::fiscal_queue::FiscalQueue;
use crate::shift_manager::ShiftManager;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    pub opens_requested: usize,
    pub closes_requested: usize,
    pub stale_recovered: usize,
}

/// Auto-shift and stale-claim scheduler.
#[derive(Debug, Clone)]
pub struct ShiftScheduler {
    queue: FiscalQueue,
    shifts: ShiftManager,
    interval: Duration,
    stale_after: chrono::Duration,
}

impl ShiftScheduler {
    pub fn new(
        queue: FiscalQueue,
        shifts: ShiftManager,
        interval: Duration,
        stale_after: chrono::Duration,
    ) -> Self {
        ShiftScheduler {
            queue,
            shifts,
            interval,
            stale_after,
        }
    }

    /// Runs one scheduling pass.
    ///
    /// A failure on one device is logged and does not stop the others.
    pub async fn tick(&self, now: DateTime<Utc>) -> QueueResult<SchedulerReport> {
        let mut report = SchedulerReport::default();

        for device in self.queue.db().devices().list_operational().await? {
            if let Err(e) = self.schedule_device(&device, now, &mut report).await {
                warn!(device_id = %device.id, error = %e, "Shift scheduling failed");
            }
        }

        report.stale_recovered = self.queue.recover_stale(self.stale_after, now).await?.len();

        if report != SchedulerReport::default() {
            info!(
                opens = report.opens_requested,
                closes = report.closes_requested,
                stale = report.stale_recovered,
                "Scheduler tick"
            );
        }
        Ok(report)
    }

    async fn schedule_device(
        &self,
        device: &FiscalDevice,
        now: DateTime<Utc>,
        report: &mut SchedulerReport,
    ) -> QueueResult<()> {
        match self.shifts.current_shift(&device.id).await? {
            Some(shift) => {
                let Some(reason) =
                    auto_close_due(device, &shift, now, self.shifts.max_shift_duration())
                else {
                    return Ok(());
                };
                let trigger = match reason {
                    AutoCloseReason::Scheduled => ShiftTrigger::Scheduled,
                    AutoCloseReason::MaxDuration => ShiftTrigger::MaxDuration,
                };
                let (_, created) = self.shifts.request_close(&shift.id, None, trigger, now).await?;
                if created {
                    report.closes_requested += 1;
                }
            }
            None => {
                let last = self.queue.db().shifts().latest(&device.id).await?;
                if !auto_open_due(device, last.as_ref(), now) {
                    return Ok(());
                }
                match self
                    .shifts
                    .request_open(&device.id, None, ShiftTrigger::Scheduled, now)
                    .await
                {
                    Ok((_, true)) => report.opens_requested += 1,
                    Ok((_, false)) => {}
                    // Opened between our read and the request
                    Err(QueueError::Domain(CoreError::ShiftAlreadyOpen { .. })) => {
                        debug!(device_id = %device.id, "Shift already open");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Starts the scheduler loop. It stops when `true` is sent on the
    /// shutdown channel.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "Shift scheduler starting");

            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.tick(Utc::now()).await {
                            error!(?e, "Scheduler tick failed");
                        }
                    }

                    _ = shutdown.changed() => {
                        info!("Shift scheduler shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{device, setup, t0};
    use chrono::{Duration as ChronoDuration, NaiveTime};
    use vendfisc_core::{OperationKind, QueueStatus};
    use vendfisc_db::NewDevice;

    fn scheduler(queue: &FiscalQueue) -> ShiftScheduler {
        let shifts = ShiftManager::new(queue.clone(), ChronoDuration::hours(24));
        ShiftScheduler::new(
            queue.clone(),
            shifts,
            Duration::from_secs(60),
            ChronoDuration::minutes(5),
        )
    }

    fn at(h: u32, m: u32) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(h, m, 0)
    }

    #[tokio::test]
    async fn test_auto_open_is_enqueued_once() {
        let (db, queue) = setup().await;
        let d = db
            .devices()
            .register(
                NewDevice::sandbox("org-1", "D1").with_auto_shifts(at(8, 0), at(22, 0)),
                t0(),
            )
            .await
            .unwrap();
        let manual = device(&db, "D2").await;
        let sched = scheduler(&queue);

        let report = sched.tick(t0()).await.unwrap();
        assert_eq!(report.opens_requested, 1);
        assert_eq!(sched.tick(t0()).await.unwrap().opens_requested, 0);

        let stats = queue.stats(&d.id).await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(queue.stats(&manual.id).await.unwrap().pending, 0);

        let item = queue.dequeue_next(Some(&d.id), t0()).await.unwrap().unwrap();
        assert_eq!(item.operation, OperationKind::ShiftOpen);
    }

    #[tokio::test]
    async fn test_scheduled_and_max_duration_close() {
        let (db, queue) = setup().await;
        let scheduled = db
            .devices()
            .register(
                NewDevice::sandbox("org-1", "D1").with_auto_shifts(None, at(22, 0)),
                t0(),
            )
            .await
            .unwrap();
        let capped = db
            .devices()
            .register(NewDevice::sandbox("org-1", "D2").with_auto_shifts(None, None), t0())
            .await
            .unwrap();
        let s1 = db.shifts().open(&scheduled.id, "Anna", None, t0()).await.unwrap();
        let s2 = db.shifts().open(&capped.id, "Anna", None, t0()).await.unwrap();
        let sched = scheduler(&queue);

        assert_eq!(sched.tick(t0() + ChronoDuration::hours(1)).await.unwrap().closes_requested, 0);

        // 22:00 passed for D1; D2 has no close time
        let evening = t0() + ChronoDuration::hours(13);
        assert_eq!(sched.tick(evening).await.unwrap().closes_requested, 1);
        let pending = queue.pending_for_shift(&s1.id, None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, OperationKind::ShiftClose);

        let next_day = t0() + ChronoDuration::hours(24);
        assert_eq!(sched.tick(next_day).await.unwrap().closes_requested, 1);
        let pending = queue.pending_for_shift(&s2.id, None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn test_tick_recovers_stale_claims() {
        let (db, queue) = setup().await;
        let d = device(&db, "D1").await;
        queue
            .enqueue(crate::testing::x_report_payload(&d.id, "r1"), None, None, t0())
            .await
            .unwrap();
        queue.dequeue_next(None, t0()).await.unwrap().unwrap();
        let sched = scheduler(&queue);

        assert_eq!(sched.tick(t0() + ChronoDuration::minutes(1)).await.unwrap().stale_recovered, 0);
        let report = sched.tick(t0() + ChronoDuration::minutes(10)).await.unwrap();
        assert_eq!(report.stale_recovered, 1);
        assert_eq!(queue.stats(&d.id).await.unwrap().retry, 1);
    }
}
