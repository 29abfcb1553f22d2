//! Group poll executor: probes every active credential of one group,
//! one at a time, and commits the results as a single unit.
//!
//! A failing or panicking probe only costs that credential a failure
//! record; the rest of the group is still polled. The only error that
//! leaves this module after probing started is a failed commit.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::adapters::{mask_secret, ProbeOutcome, UsageProbe};
use crate::store::{Credential, CredentialCheck, NewUsageRecord, PollBatch, Store};
use super::in_flight::InFlight;

/// Pause between two probes of the same group.
pub const DEFAULT_PROBE_PAUSE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum PollError {
    #[error("failed to load group {group_id}: {message}")]
    Load { group_id: i64, message: String },
    #[error("failed to commit poll for group {group_id}: {message}")]
    Commit { group_id: i64, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another poll of the same group is in flight.
    AlreadyRunning,
    /// The group was deleted or deactivated before the poll started.
    GroupUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub group_id: i64,
    pub group_name: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PollRun {
    Completed(PollSummary),
    Skipped { reason: SkipReason },
}

pub struct GroupPoller {
    store: Arc<Store>,
    probe: Arc<dyn UsageProbe>,
    pause: Duration,
    in_flight: InFlight,
}

impl GroupPoller {
    pub fn new(store: Arc<Store>, probe: Arc<dyn UsageProbe>, pause: Duration) -> Self {
        Self { store, probe, pause, in_flight: InFlight::new() }
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Poll `group_id` unless a poll for it is already running, in which
    /// case this call is dropped.
    pub async fn run_exclusive(&self, group_id: i64) -> Result<PollRun, PollError> {
        let Some(_guard) = self.in_flight.try_acquire(group_id) else {
            warn!(group_id = group_id, "Poll already in flight, skipping");
            return Ok(PollRun::Skipped { reason: SkipReason::AlreadyRunning });
        };
        self.poll_group(group_id).await
    }

    /// Poll one group. Callers should go through [`run_exclusive`](Self::run_exclusive).
    async fn poll_group(&self, group_id: i64) -> Result<PollRun, PollError> {
        let load_err = |e: anyhow::Error| PollError::Load { group_id, message: format!("{:#}", e) };

        // Reload fresh: the group may have been deleted or deactivated since the fire.
        let group = match self.store.get_group(group_id).map_err(load_err)? {
            Some(g) if g.is_active => g,
            _ => {
                warn!(group_id = group_id, "Group missing or inactive, nothing to poll");
                return Ok(PollRun::Skipped { reason: SkipReason::GroupUnavailable });
            }
        };

        let credentials = self.store.list_active_credentials(group_id).map_err(load_err)?;
        let mut summary = PollSummary {
            group_id,
            group_name: group.name.clone(),
            total: credentials.len(),
            succeeded: 0,
            failed: 0,
        };

        if credentials.is_empty() {
            info!(group_id = group_id, group = %group.name, "Group has no active API keys");
            return Ok(PollRun::Completed(summary));
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        info!(run_id = %run_id, group_id = group_id, group = %group.name, keys = credentials.len(), "Polling group");

        let mut batch = PollBatch::default();
        for (i, credential) in credentials.iter().enumerate() {
            if i > 0 && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }

            let (record, check) = self.check_credential(credential).await;
            if record.is_success {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            batch.records.push(record);
            batch.checks.push(check);
        }

        if let Err(e) = self.store.commit_poll(&batch) {
            error!(run_id = %run_id, group_id = group_id, "Commit failed, poll rolled back: {:#}", e);
            return Err(PollError::Commit { group_id, message: format!("{:#}", e) });
        }

        info!(
            run_id = %run_id,
            group_id = group_id,
            group = %group.name,
            succeeded = summary.succeeded,
            total = summary.total,
            "Group poll complete"
        );
        Ok(PollRun::Completed(summary))
    }

    /// Probe one credential. Never fails: a panicking probe is turned
    /// into a failure record.
    async fn check_credential(&self, credential: &Credential) -> (NewUsageRecord, CredentialCheck) {
        let probe = Arc::clone(&self.probe);
        let secret = credential.secret.clone();
        let joined = tokio::spawn(async move { probe.probe(&secret).await }).await;

        match joined {
            Ok(result) => {
                match &result.outcome {
                    ProbeOutcome::Success(report) => debug!(
                        credential_id = credential.id,
                        key = %mask_secret(&credential.secret),
                        count = report.character_count,
                        limit = report.character_limit,
                        "Usage recorded"
                    ),
                    ProbeOutcome::Failure(failure) => warn!(
                        credential_id = credential.id,
                        key = %mask_secret(&credential.secret),
                        "Usage check failed: {}",
                        failure
                    ),
                }
                (
                    NewUsageRecord::from_probe(credential.id, &result),
                    CredentialCheck::from_probe(credential, &result),
                )
            }
            Err(e) => {
                error!(credential_id = credential.id, "Error while checking API key: {}", e);
                let checked_at = Utc::now();
                (
                    NewUsageRecord::failed(credential.id, checked_at, format!("error during check: {}", e)),
                    CredentialCheck { credential_id: credential.id, checked_at, billing_window: None },
                )
            }
        }
    }
}
