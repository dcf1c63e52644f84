//! The scheduler loop: claim due schedule tokens, apply the overrun policy,
//! bootstrap instances.
//!
//! Schedule tokens are ordinary claimable tokens under `/schedule/`. The
//! scheduler keeps each one it handles *owned*, with the lease ending at the
//! schedule's next due time — the lease itself is the wakeup timer, and a
//! crashed scheduler's schedules fall back into the claimable pool on their
//! own.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pinball_core::name::{self, SCHEDULE_PREFIX};
use pinball_core::{
    Clock, MasterError, OverrunDecision, ScheduleData, SignalData, SignalKind, SystemClock, Token,
    TokenMaster, TokenQuery,
};

use crate::parser::{ParseError, WorkflowParser};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Identity used as the schedule tokens' owner.
    pub identity: String,

    /// Schedule tokens claimed per poll.
    pub claim_batch: usize,

    /// Lease taken while a schedule is being handled.
    pub claim_lease: Duration,

    /// How long a held occurrence waits before being re-evaluated.
    pub hold_retry: Duration,

    /// Idle time between polls.
    pub poll_interval: Duration,
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self {
            identity: format!("scheduler.{}", Uuid::now_v7()),
            claim_batch: 16,
            claim_lease: Duration::from_secs(60),
            hold_retry: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Master error
    #[error("master error: {0}")]
    Master(#[from] MasterError),

    /// Schedule payload could not be decoded or encoded
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// Parser error
    #[error("parser error: {0}")]
    Parse(#[from] ParseError),
}

/// A schedule token ready for insertion, claimable at its due time.
pub fn schedule_token(data: &ScheduleData) -> Result<Token, serde_json::Error> {
    Ok(Token::new(
        name::schedule_token_name(&data.workflow),
        data.encode()?,
    ))
}

/// Time-driven workflow starts over a token master.
pub struct Scheduler {
    master: Arc<dyn TokenMaster>,
    parser: Arc<dyn WorkflowParser>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        master: Arc<dyn TokenMaster>,
        parser: Arc<dyn WorkflowParser>,
        config: SchedulerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            master,
            parser,
            clock: Arc::new(SystemClock),
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Replace the clock (tests drive due times by hand).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Request a graceful stop; the loop exits at the next iteration.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Insert schedule tokens that are not present yet; an existing token
    /// wins, so redeploys never clobber live schedules.
    pub async fn install_schedules(
        &self,
        schedules: &[ScheduleData],
    ) -> Result<(), SchedulerError> {
        for data in schedules {
            let token = schedule_token(data)?;
            match self.master.modify(vec![token], vec![]).await {
                Ok(_) => info!(workflow = %data.workflow, "schedule installed"),
                Err(MasterError::VersionConflict(_)) => {
                    debug!(workflow = %data.workflow, "schedule already present")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Run the scheduler loop until shutdown.
    pub async fn run(&mut self) -> Result<(), SchedulerError> {
        info!(identity = %self.config.identity, "scheduler starting");
        loop {
            if *self.shutdown_rx.borrow() {
                info!("shutdown requested, stopping scheduler");
                return Ok(());
            }
            match self.poll_once().await {
                Ok(started) if started > 0 => {
                    info!(started, "instances started");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "scheduler iteration failed"),
            }
            let jitter = rand::thread_rng().gen_range(0.5..1.0);
            let interval = self.config.poll_interval.mul_f64(jitter);
            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    /// Claim claimable schedules and handle each; returns instances started.
    pub async fn poll_once(&self) -> Result<usize, SchedulerError> {
        let now = self.clock.now();
        let claimed = self
            .master
            .query_and_own(
                &self.config.identity,
                now + self.config.claim_lease.as_secs() as i64,
                TokenQuery::new(SCHEDULE_PREFIX, self.config.claim_batch),
            )
            .await?;

        let mut started = 0;
        for token in claimed {
            match self.handle_schedule(token).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                // Another scheduler (or an operator) acted; that is the
                // expected resolution, not a failure.
                Err(SchedulerError::Master(MasterError::VersionConflict(_))) => {
                    debug!("schedule changed underneath, skipping")
                }
                Err(e) => warn!(error = %e, "failed to handle schedule"),
            }
        }
        Ok(started)
    }

    async fn handle_schedule(&self, token: Token) -> Result<bool, SchedulerError> {
        let mut schedule = ScheduleData::decode(&token.data)?;
        let now = self.clock.now();

        if !schedule.is_due(now) {
            // Claimed early (a lapsed lease after restart); go back to sleep
            // until the due time.
            return self
                .write_back(token, &schedule, schedule.next_run_time, false)
                .await;
        }

        let prefix = name::workflow_prefix(&schedule.workflow);
        let instances = self.master.group(&prefix, "/").await?;
        let running = instances.len();
        let decision = if schedule.at_capacity(running) {
            OverrunDecision::Hold
        } else {
            schedule.overrun_policy.decide(running, None)
        };
        debug!(
            workflow = %schedule.workflow,
            running,
            ?decision,
            "schedule due"
        );

        let started = match decision {
            OverrunDecision::Start => {
                self.start_instance(&schedule).await?;
                schedule.advance(now);
                true
            }
            OverrunDecision::AbortThenStart => {
                self.abort_instances(&schedule.workflow, instances.keys())
                    .await?;
                self.start_instance(&schedule).await?;
                schedule.advance(now);
                true
            }
            OverrunDecision::SkipOccurrence => {
                info!(workflow = %schedule.workflow, running, "occurrence skipped");
                schedule.advance(now);
                false
            }
            OverrunDecision::Hold => {
                debug!(workflow = %schedule.workflow, running, "occurrence held");
                false
            }
        };

        let wake_at = if schedule.is_due(now) {
            // Still due (held): re-check after the hold interval.
            now + self.config.hold_retry.as_secs() as i64
        } else {
            schedule.next_run_time
        };
        self.write_back(token, &schedule, wake_at, started).await
    }

    /// Update the schedule token, still owned, with the lease ending at the
    /// next wakeup.
    async fn write_back(
        &self,
        token: Token,
        schedule: &ScheduleData,
        wake_at: i64,
        started: bool,
    ) -> Result<bool, SchedulerError> {
        let mut update = token;
        update.data = schedule.encode()?;
        update.own(&self.config.identity, wake_at.max(self.clock.now() + 1));
        self.master.modify(vec![update], vec![]).await?;
        Ok(started)
    }

    async fn start_instance(&self, schedule: &ScheduleData) -> Result<(), SchedulerError> {
        let instance = Uuid::now_v7().to_string();
        let tokens = self.parser.initial_tokens(&schedule.workflow, &instance)?;
        self.master.modify(tokens, vec![]).await?;
        info!(workflow = %schedule.workflow, %instance, "instance started");
        Ok(())
    }

    async fn abort_instances(
        &self,
        workflow: &str,
        instance_groups: impl Iterator<Item = &String>,
    ) -> Result<(), SchedulerError> {
        for group in instance_groups {
            let instance = group.trim_end_matches('/');
            let signal = Token::parked(
                name::instance_signal(workflow, instance, SignalKind::Abort),
                SignalData::new().encode()?,
            );
            match self.master.modify(vec![signal], vec![]).await {
                Ok(_) => info!(workflow, instance, "abort signaled"),
                Err(MasterError::VersionConflict(_)) => {
                    debug!(workflow, instance, "abort already signaled")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
