//! Cadence scheduler: one recurring trigger per group.
//!
//! Every scheduled group gets its own tokio task ticking at the group's
//! interval. A tick never runs the poll inline: it spawns it, so dropping
//! a cadence stops future fires without touching a poll already running.
//! Overlap is handled by the poller's in-flight registry, which turns a
//! fire for a still-running group into a skip.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::poller::{dispatch_groups, DispatchReport, GroupPoller, PollError, PollRun, SkipReason};
use crate::store::{Group, GroupChange, Store, MAX_QUERY_INTERVAL_SECS};

pub const DEFAULT_GROUP_NAME: &str = "Default Group";

struct ScheduleEntry {
    interval_secs: u64,
    next_run: Arc<Mutex<Option<DateTime<Utc>>>>,
    // Dropping the sender ends the cadence loop.
    _stop: oneshot::Sender<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledGroup {
    pub group_id: i64,
    pub group_name: String,
    pub interval_secs: u64,
    pub is_active: bool,
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub scheduled_groups: usize,
    pub groups: Vec<ScheduledGroup>,
}

pub struct CadenceScheduler {
    store: Arc<Store>,
    poller: Arc<GroupPoller>,
    max_workers: usize,
    entries: Mutex<HashMap<i64, ScheduleEntry>>,
}

impl CadenceScheduler {
    pub fn new(store: Arc<Store>, poller: Arc<GroupPoller>, max_workers: usize) -> Self {
        Self { store, poller, max_workers, entries: Mutex::new(HashMap::new()) }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<i64, ScheduleEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create the default group on an empty database, then register every
    /// active group. Returns how many cadences were started.
    pub fn seed(&self, default_interval_secs: i64) -> Result<usize> {
        if let Some(group) = self.store.ensure_default_group(DEFAULT_GROUP_NAME, default_interval_secs)? {
            info!(group_id = group.id, "Created default group");
        }

        let mut scheduled = 0;
        for group in self.store.list_active_groups()? {
            if self.schedule(&group) {
                scheduled += 1;
            }
        }
        info!(scheduled = scheduled, "Scheduler seeded");
        Ok(scheduled)
    }

    /// Register (or replace) the cadence for `group`. A group that is
    /// inactive, has a non-positive interval or one longer than
    /// [`MAX_QUERY_INTERVAL_SECS`] ends up unscheduled.
    pub fn schedule(&self, group: &Group) -> bool {
        if !group.is_schedulable() {
            self.remove(group.id);
            debug!(
                group_id = group.id,
                interval_secs = group.query_interval,
                active = group.is_active,
                "Group not schedulable, skipped"
            );
            return false;
        }

        let interval_secs = group.query_interval as u64;
        let period = Duration::from_secs(interval_secs);
        let start = Instant::now()
            .checked_add(period)
            .filter(|_| group.query_interval <= MAX_QUERY_INTERVAL_SECS && next_fire(period).is_some());
        let Some(start) = start else {
            self.remove(group.id);
            warn!(group_id = group.id, interval_secs = interval_secs, "Interval out of range, group not scheduled");
            return false;
        };
        let next_run = Arc::new(Mutex::new(None));
        let (stop_tx, stop_rx) = oneshot::channel();

        tokio::spawn(run_cadence(
            group.id,
            start,
            period,
            Arc::clone(&self.poller),
            Arc::clone(&next_run),
            stop_rx,
        ));

        let replaced = self
            .entries()
            .insert(group.id, ScheduleEntry { interval_secs, next_run, _stop: stop_tx })
            .is_some();
        info!(
            group_id = group.id,
            group = %group.name,
            interval_secs = interval_secs,
            replaced = replaced,
            "Group scheduled"
        );
        true
    }

    /// Stop the group's cadence. Unknown ids are ignored. A poll already
    /// running for the group is left to finish.
    pub fn remove(&self, group_id: i64) -> bool {
        let removed = self.entries().remove(&group_id).is_some();
        if removed {
            info!(group_id = group_id, "Group schedule removed");
        }
        removed
    }

    pub fn reschedule(&self, group: &Group) -> bool {
        self.remove(group.id);
        self.schedule(group)
    }

    #[cfg(test)]
    pub fn is_scheduled(&self, group_id: i64) -> bool {
        self.entries().contains_key(&group_id)
    }

    // ── Lifecycle hooks ─────────────────────────────────────────

    pub fn on_group_created(&self, group: &Group) {
        self.schedule(group);
    }

    pub fn on_group_changed(&self, change: &GroupChange) {
        if change.cadence_changed() {
            self.reschedule(&change.after);
        }
    }

    pub fn on_group_deleted(&self, group_id: i64) {
        self.remove(group_id);
    }

    // ── On-demand checks ────────────────────────────────────────

    pub async fn check_group_now(&self, group_id: i64) -> Result<PollRun, PollError> {
        self.poller.run_exclusive(group_id).await
    }

    pub async fn check_all_now(&self) -> Result<DispatchReport> {
        let groups = self.store.list_active_groups()?;
        Ok(dispatch_groups(&self.poller, groups, self.max_workers).await)
    }

    // ── Status ──────────────────────────────────────────────────

    pub fn status(&self) -> Result<SchedulerStatus> {
        let mut snapshot: Vec<(i64, u64, Option<DateTime<Utc>>)> = self
            .entries()
            .iter()
            .map(|(id, e)| (*id, e.interval_secs, *lock_next(&e.next_run)))
            .collect();
        snapshot.sort_by_key(|(id, _, _)| *id);

        let mut groups = Vec::with_capacity(snapshot.len());
        for (group_id, interval_secs, next_run) in snapshot {
            // Deleted behind our back; not worth reporting.
            let Some(group) = self.store.get_group(group_id)? else { continue };
            groups.push(ScheduledGroup {
                group_id,
                group_name: group.name,
                interval_secs,
                is_active: group.is_active,
                next_run,
            });
        }
        Ok(SchedulerStatus { scheduled_groups: groups.len(), groups })
    }

    // ── Shutdown ────────────────────────────────────────────────

    /// Stop every cadence. No further fires are issued afterwards.
    pub fn shutdown(&self) {
        let mut entries = self.entries();
        let count = entries.len();
        entries.clear();
        info!(stopped = count, "Scheduler stopped");
    }

    /// Wait until no poll is in flight, up to `timeout`. Returns false on
    /// timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.poller.in_flight().is_empty() {
            if Instant::now() >= deadline {
                warn!(running = self.poller.in_flight().len(), "Polls still running at shutdown deadline");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}

fn lock_next(m: &Mutex<Option<DateTime<Utc>>>) -> MutexGuard<'_, Option<DateTime<Utc>>> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn next_fire(period: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(period).ok().and_then(|d| Utc::now().checked_add_signed(d))
}

async fn run_cadence(
    group_id: i64,
    start: Instant,
    period: Duration,
    poller: Arc<GroupPoller>,
    next_run: Arc<Mutex<Option<DateTime<Utc>>>>,
    mut stop: oneshot::Receiver<()>,
) {
    // `start` is one full period after scheduling, never immediate.
    let mut ticker = interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        *lock_next(&next_run) = next_fire(period);
        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = ticker.tick() => {}
        }
        tokio::spawn(fire(Arc::clone(&poller), group_id));
    }

    *lock_next(&next_run) = None;
    debug!(group_id = group_id, "Cadence loop exited");
}

async fn fire(poller: Arc<GroupPoller>, group_id: i64) {
    match poller.run_exclusive(group_id).await {
        Ok(PollRun::Completed(summary)) => {
            debug!(group_id = group_id, succeeded = summary.succeeded, total = summary.total, "Scheduled poll done");
        }
        Ok(PollRun::Skipped { reason: SkipReason::AlreadyRunning }) => {
            info!(group_id = group_id, "Previous poll still running, fire dropped");
        }
        Ok(PollRun::Skipped { reason: SkipReason::GroupUnavailable }) => {}
        Err(e) => {
            // The group stays scheduled; the next fire tries again.
            error!(group_id = group_id, "Scheduled poll failed: {}", e);
        }
    }
}
