//! "Check everything now": one poll per group, several groups at a time.
//!
//! Each group runs in its own task behind a semaphore sized
//! `min(groups, max_workers)`. Every task is joined and reported, so a
//! failing or panicking group never hides the others' results.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use super::executor::{GroupPoller, PollRun, SkipReason};
use crate::store::Group;

pub const DEFAULT_MAX_WORKERS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GroupOutcome {
    Completed { total: usize, succeeded: usize, failed: usize },
    Skipped { reason: SkipReason },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupReport {
    pub group_id: i64,
    pub group_name: String,
    #[serde(flatten)]
    pub outcome: GroupOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub total_groups: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub groups: Vec<GroupReport>,
}

impl DispatchReport {
    fn push(&mut self, report: GroupReport) {
        match report.outcome {
            GroupOutcome::Completed { .. } => self.completed += 1,
            GroupOutcome::Skipped { .. } => self.skipped += 1,
            GroupOutcome::Failed { .. } => self.failed += 1,
        }
        self.groups.push(report);
    }
}

/// Poll every group in `groups` and wait for all of them. Reports come
/// back in the order the groups were given.
pub async fn dispatch_groups(poller: &Arc<GroupPoller>, groups: Vec<Group>, max_workers: usize) -> DispatchReport {
    let mut report = DispatchReport { total_groups: groups.len(), ..Default::default() };
    if groups.is_empty() {
        info!("No active groups to check");
        return report;
    }

    let workers = groups.len().min(max_workers.max(1));
    let permits = Arc::new(Semaphore::new(workers));
    info!(groups = groups.len(), workers = workers, "Checking all groups");

    let mut handles = Vec::with_capacity(groups.len());
    for group in groups {
        let poller = Arc::clone(poller);
        let permits = Arc::clone(&permits);
        let group_id = group.id;
        let handle = tokio::spawn(async move {
            // The semaphore is never closed, so acquire only fails if it were.
            let _permit = permits.acquire_owned().await.ok();
            poller.run_exclusive(group_id).await
        });
        handles.push((group, handle));
    }

    for (group, handle) in handles {
        let outcome = match handle.await {
            Ok(Ok(PollRun::Completed(summary))) => GroupOutcome::Completed {
                total: summary.total,
                succeeded: summary.succeeded,
                failed: summary.failed,
            },
            Ok(Ok(PollRun::Skipped { reason })) => GroupOutcome::Skipped { reason },
            Ok(Err(e)) => {
                warn!(group_id = group.id, "Group check failed: {}", e);
                GroupOutcome::Failed { error: e.to_string() }
            }
            Err(e) => {
                error!(group_id = group.id, "Group check task panicked: {}", e);
                GroupOutcome::Failed { error: format!("task panicked: {}", e) }
            }
        };
        report.push(GroupReport { group_id: group.id, group_name: group.name, outcome });
    }

    info!(
        completed = report.completed,
        skipped = report.skipped,
        failed = report.failed,
        "Check all finished"
    );
    report
}
