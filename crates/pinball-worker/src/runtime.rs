//! The worker loop: claim, run, post events, advance.
//!
//! Workers are stateless; every step is an atomic master operation guarded
//! by optimistic version checks. A `VERSION_CONFLICT` anywhere means another
//! actor moved first — the worker re-reads and rebuilds, or discards its
//! result when the conflict is on its own lease.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use pinball_core::name::{self, EXIT_SIGNAL, SIGNAL_DIR, WORKFLOW_PREFIX};
use pinball_core::{
    Clock, EventData, EventName, ExecutionOutcome, ExecutionRecord, JobData, JobName, JobState,
    MasterError, SignalData, SystemClock, Token, TokenMaster, TokenQuery,
};

use crate::executor::{ExecutionStatus, JobContext, JobExecutor};

/// Cap on tokens archived per batch; an instance that outgrows one page is
/// drained in successive atomic batches.
const ARCHIVE_PAGE: usize = 100_000;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stable identity used as the token owner: host, nonce, generation.
    pub identity: String,

    /// Worker-cohort tag compared against the exit signal's cutoff.
    pub generation: u64,

    /// Lease duration L; renewed at L/3 while a job runs.
    pub lease: Duration,

    /// Poll interval when work was just found.
    pub min_poll_interval: Duration,

    /// Poll interval ceiling when idle.
    pub max_poll_interval: Duration,

    /// Backoff multiplier applied per idle poll.
    pub backoff_multiplier: f64,

    /// Rebuild attempts when a completion batch keeps conflicting.
    pub conflict_retries: u32,

    /// How long a drained instance is ignored locally before re-checking.
    pub drain_cooldown: Duration,
}

impl WorkerConfig {
    /// Create a configuration with a fresh identity for `generation`.
    pub fn new(generation: u64) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
        Self {
            identity: format!("{host}.{}.{generation}", Uuid::now_v7()),
            generation,
            lease: Duration::from_secs(300),
            min_poll_interval: Duration::from_millis(500),
            max_poll_interval: Duration::from_secs(10),
            backoff_multiplier: 1.5,
            conflict_retries: 5,
            drain_cooldown: Duration::from_secs(30),
        }
    }

    /// Configuration from the environment: `WORKER_GENERATION`,
    /// `LEASE_SECONDS`.
    pub fn from_env() -> Self {
        let generation = std::env::var("WORKER_GENERATION")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let mut config = Self::new(generation);
        if let Some(secs) = std::env::var("LEASE_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            config.lease = Duration::from_secs(secs);
        }
        config
    }

    /// Set the worker identity
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Set the lease duration
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Set the idle poll interval bounds
    pub fn with_poll_intervals(mut self, min: Duration, max: Duration) -> Self {
        self.min_poll_interval = min;
        self.max_poll_interval = max.max(min);
        self
    }
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Master error
    #[error("master error: {0}")]
    Master(#[from] MasterError),

    /// Token payload could not be decoded or encoded
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Outcome of one loop iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStep {
    /// Nothing claimable under `/workflow/`.
    Idle,
    /// A job ran (or was skipped/aborted) and the move was recorded.
    Ran {
        job: String,
        outcome: ExecutionOutcome,
    },
    /// A claimed token was put back without running.
    Released,
    /// The lease was lost mid-run; the result was discarded.
    LeaseLost,
    /// The exit signal told this generation to stop.
    Exit,
}

#[derive(Debug, Clone, Copy, Default)]
struct InstanceSignals {
    drain: bool,
    abort: bool,
}

enum RunEnd {
    Finished(crate::executor::ExecutionReport),
    Aborted,
    LeaseLost,
}

/// The workflow runtime protocol over a token master.
pub struct Worker {
    master: Arc<dyn TokenMaster>,
    executor: Arc<dyn JobExecutor>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    current_interval: Duration,
    drained: HashMap<String, Instant>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        master: Arc<dyn TokenMaster>,
        executor: Arc<dyn JobExecutor>,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            master,
            executor,
            clock: Arc::new(SystemClock),
            current_interval: config.min_poll_interval,
            config,
            drained: HashMap::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Replace the clock (tests drive lease expiry by hand).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Request a graceful stop; the loop exits at the next iteration.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the claim loop until shutdown or an exit signal.
    pub async fn run(&mut self) -> Result<(), WorkerError> {
        info!(
            identity = %self.config.identity,
            generation = self.config.generation,
            lease_secs = self.config.lease.as_secs(),
            "worker starting"
        );
        loop {
            if *self.shutdown_rx.borrow() {
                info!("shutdown requested, stopping worker");
                break;
            }
            match self.run_once().await {
                Ok(WorkerStep::Exit) => {
                    info!("exit signal observed, stopping worker");
                    break;
                }
                Ok(WorkerStep::Idle) => {
                    self.increase_backoff();
                    if self.sleep_jittered().await {
                        break;
                    }
                }
                Ok(step) => {
                    self.reset_backoff();
                    debug!(?step, "step complete");
                }
                Err(e) => {
                    // Never panic on an RPC error: log, back off, re-enter.
                    warn!(error = %e, "worker iteration failed");
                    self.increase_backoff();
                    if self.sleep_jittered().await {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// One iteration of the claim loop.
    pub async fn run_once(&mut self) -> Result<WorkerStep, WorkerError> {
        if self.observe_exit_signal().await? {
            return Ok(WorkerStep::Exit);
        }

        let expiration = self.clock.now() + self.config.lease.as_secs() as i64;
        let claimed = self
            .master
            .query_and_own(
                &self.config.identity,
                expiration,
                TokenQuery::new(WORKFLOW_PREFIX, 1),
            )
            .await?;
        match claimed.into_iter().next() {
            None => Ok(WorkerStep::Idle),
            Some(token) => self.handle_claimed(token).await,
        }
    }

    async fn handle_claimed(&mut self, token: Token) -> Result<WorkerStep, WorkerError> {
        let job_name = match JobName::parse(&token.name) {
            Some(parsed) if parsed.state == JobState::Runnable => parsed,
            _ => {
                // Only unowned runnable job tokens should ever be claimable
                // under /workflow/; put anything else back.
                warn!(name = %token.name, "claimed token is not a runnable job, releasing");
                self.release(token).await?;
                return Ok(WorkerStep::Released);
            }
        };

        let instance = job_name.instance_prefix();
        let cooldown = self.config.drain_cooldown;
        self.drained.retain(|_, since| since.elapsed() < cooldown);
        if self.drained.contains_key(&instance) {
            self.release(token).await?;
            return Ok(WorkerStep::Released);
        }

        let mut data = match JobData::decode(&token.data) {
            Ok(data) => data,
            Err(e) => {
                // A job token the fleet cannot read would be re-claimed
                // forever; freeze it for the operator instead.
                error!(name = %token.name, error = %e, "unreadable job payload, parking token");
                self.park(token).await?;
                return Ok(WorkerStep::Released);
            }
        };

        // Everything event-shaped under the runnable job token. The earliest
        // event per input is this execution's consumed set; the rest travel
        // with the job whenever it leaves the runnable directory.
        let pending = self
            .master
            .query(vec![TokenQuery::new(format!("{}/", token.name), 1_000)])
            .await?
            .remove(0);

        let signals = self.instance_signals(&job_name).await?;
        if signals.abort {
            let record = self.record(ExecutionOutcome::Aborted, self.clock.now(), vec![], "aborted");
            data.history.push(record);
            return self
                .retire_job(token, &job_name, &data, pending, ExecutionOutcome::Aborted)
                .await;
        }
        if signals.drain {
            debug!(%instance, "instance draining, releasing claim");
            self.drained.insert(instance, Instant::now());
            self.release(token).await?;
            return Ok(WorkerStep::Released);
        }

        if data.disabled {
            let record = self.record(ExecutionOutcome::Skipped, self.clock.now(), vec![], "disabled");
            data.history.push(record);
            return self
                .complete_job(token, &job_name, data, vec![], pending, ExecutionOutcome::Skipped)
                .await;
        }

        let consumed = select_consumed(&pending, &data.inputs);
        if consumed.len() < data.inputs.len() {
            warn!(
                job = %token.name,
                missing = data.inputs.len() - consumed.len(),
                "runnable job is short of input events"
            );
        }

        let context = JobContext {
            name: job_name.clone(),
            command: data.command.clone(),
            attempt: data.attempts() + 1,
            events: consumed.iter().map(|t| t.name.clone()).collect(),
        };

        let started = self.clock.now();
        let mut token = token;
        let end = self.execute_with_lease(&mut token, &context).await?;

        match end {
            RunEnd::LeaseLost => {
                warn!(job = %token.name, "lease lost mid-run, discarding result");
                Ok(WorkerStep::LeaseLost)
            }
            RunEnd::Aborted => {
                let record = self.record(ExecutionOutcome::Aborted, started, vec![], "aborted");
                data.history.push(record);
                self.retire_job(token, &job_name, &data, pending, ExecutionOutcome::Aborted)
                    .await
            }
            RunEnd::Finished(report) => {
                let outcome = match report.status {
                    ExecutionStatus::Success => ExecutionOutcome::Success,
                    ExecutionStatus::Failure => ExecutionOutcome::Failure,
                };
                let record = self.record(outcome, started, context.events.clone(), &report.info);
                data.history.push(record);

                match outcome {
                    ExecutionOutcome::Success => {
                        self.complete_job(token, &job_name, data, consumed, pending, outcome)
                            .await
                    }
                    _ if data.retries_left() => self.rearm_job(token, &job_name, &data).await,
                    _ => {
                        self.retire_job(token, &job_name, &data, pending, ExecutionOutcome::Failure)
                            .await
                    }
                }
            }
        }
    }

    // ========================================================================
    // Execution with lease renewal
    // ========================================================================

    async fn execute_with_lease(
        &self,
        token: &mut Token,
        context: &JobContext,
    ) -> Result<RunEnd, WorkerError> {
        let cancel = CancellationToken::new();
        let mut execution = Box::pin(self.executor.execute(context, cancel.clone()));
        let renew_every = (self.config.lease / 3).max(Duration::from_millis(100));
        let mut aborting = false;

        loop {
            tokio::select! {
                report = &mut execution => {
                    return Ok(if aborting {
                        RunEnd::Aborted
                    } else {
                        RunEnd::Finished(report)
                    });
                }
                _ = tokio::time::sleep(renew_every) => {
                    if !aborting {
                        let signals = self
                            .instance_signals(&context.name)
                            .await
                            .unwrap_or_default();
                        if signals.abort {
                            info!(job = %context.name.job, "abort signaled, cancelling execution");
                            aborting = true;
                            cancel.cancel();
                            continue;
                        }
                    }
                    match self.extend_lease(token).await {
                        Ok(()) => {}
                        Err(WorkerError::Master(
                            MasterError::VersionConflict(_) | MasterError::NotFound(_),
                        )) => {
                            cancel.cancel();
                            let _ = execution.as_mut().await;
                            return Ok(RunEnd::LeaseLost);
                        }
                        Err(e) => {
                            warn!(error = %e, "lease renewal failed, retrying next tick");
                        }
                    }
                }
            }
        }
    }

    async fn extend_lease(&self, token: &mut Token) -> Result<(), WorkerError> {
        let mut update = token.clone();
        update.expiration_time = Some(self.clock.now() + self.config.lease.as_secs() as i64);
        let written = self.master.modify(vec![update], vec![]).await?;
        if let Some(renewed) = written.into_iter().next() {
            debug!(job = %renewed.name, expires = ?renewed.expiration_time, "lease extended");
            *token = renewed;
        }
        Ok(())
    }

    // ========================================================================
    // Job advancement batches
    // ========================================================================

    /// Successful (or skipped) completion: consume events, park the job back
    /// under waiting with its history, post one event per output edge and
    /// arm any successor whose input set is now full — one atomic modify.
    async fn complete_job(
        &self,
        token: Token,
        job_name: &JobName,
        data: JobData,
        consumed: Vec<Token>,
        pending: Vec<Token>,
        outcome: ExecutionOutcome,
    ) -> Result<WorkerStep, WorkerError> {
        let consumed_names: HashSet<&str> = consumed.iter().map(|t| t.name.as_str()).collect();
        let retained: Vec<Token> = pending
            .iter()
            .filter(|t| !consumed_names.contains(t.name.as_str()))
            .cloned()
            .collect();

        for attempt in 0..=self.config.conflict_retries {
            let mut updates = Vec::new();
            let mut deletes = Vec::new();

            deletes.push(token.clone());
            deletes.extend(consumed.iter().cloned());
            self.move_job_to_waiting(
                job_name,
                &data,
                token.priority,
                &retained,
                &mut updates,
                &mut deletes,
            )?;

            for output in &data.outputs {
                self.arm_or_post(job_name, output, &mut updates, &mut deletes)
                    .await?;
            }

            match self.master.modify(updates, deletes).await {
                Ok(_) => {
                    debug!(job = %token.name, ?outcome, "job completed");
                    self.maybe_archive(job_name).await?;
                    return Ok(WorkerStep::Ran {
                        job: token.name.clone(),
                        outcome,
                    });
                }
                Err(MasterError::VersionConflict(_) | MasterError::NotFound(_)) => {
                    if !self.still_owned(&token).await? {
                        warn!(job = %token.name, "lease lost at completion, discarding result");
                        return Ok(WorkerStep::LeaseLost);
                    }
                    debug!(attempt, job = %token.name, "completion conflicted, rebuilding");
                }
                Err(e) => return Err(e.into()),
            }
        }

        error!(job = %token.name, "completion kept conflicting; abandoning, lease will lapse");
        Ok(WorkerStep::LeaseLost)
    }

    /// Terminal move without posting events: abort and exhausted-failure
    /// both park the job waiting-side, events travelling with it.
    async fn retire_job(
        &self,
        token: Token,
        job_name: &JobName,
        data: &JobData,
        pending: Vec<Token>,
        outcome: ExecutionOutcome,
    ) -> Result<WorkerStep, WorkerError> {
        let mut updates = Vec::new();
        let mut deletes = vec![token.clone()];
        self.move_job_to_waiting(
            job_name,
            data,
            token.priority,
            &pending,
            &mut updates,
            &mut deletes,
        )?;

        match self.master.modify(updates, deletes).await {
            Ok(_) => {
                debug!(job = %token.name, ?outcome, "job retired");
                self.maybe_archive(job_name).await?;
                Ok(WorkerStep::Ran {
                    job: token.name,
                    outcome,
                })
            }
            Err(MasterError::VersionConflict(_) | MasterError::NotFound(_)) => {
                warn!(job = %token.name, "lost the job while retiring it, discarding");
                Ok(WorkerStep::LeaseLost)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Failure with retry budget left: record the failure and release the
    /// token in place, still runnable, events untouched.
    async fn rearm_job(
        &self,
        token: Token,
        _job_name: &JobName,
        data: &JobData,
    ) -> Result<WorkerStep, WorkerError> {
        let mut update = token.clone();
        update.data = data.encode()?;
        update.release();

        match self.master.modify(vec![update], vec![]).await {
            Ok(_) => {
                debug!(job = %token.name, attempts = data.attempts(), "job re-armed for retry");
                Ok(WorkerStep::Ran {
                    job: token.name,
                    outcome: ExecutionOutcome::Failure,
                })
            }
            Err(MasterError::VersionConflict(_) | MasterError::NotFound(_)) => {
                warn!(job = %token.name, "lost the job while re-arming it, discarding");
                Ok(WorkerStep::LeaseLost)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Shared tail of every terminal move: the job parked waiting-side with
    /// its history and its claim priority kept, unconsumed events re-homed
    /// next to it.
    fn move_job_to_waiting(
        &self,
        job_name: &JobName,
        data: &JobData,
        priority: f64,
        retained: &[Token],
        updates: &mut Vec<Token>,
        deletes: &mut Vec<Token>,
    ) -> Result<(), WorkerError> {
        let waiting = job_name.with_state(JobState::Waiting);
        updates.push(Token::parked(waiting.token_name(), data.encode()?).with_priority(priority));
        for event in retained {
            deletes.push(event.clone());
            if let Some(parsed) = EventName::parse(&event.name) {
                updates.push(
                    Token::parked(
                        parsed.with_state(JobState::Waiting).token_name(),
                        event.data.clone(),
                    )
                    .with_priority(event.priority),
                );
            }
        }
        Ok(())
    }

    /// Post one event on `output`'s input named after the producer; if that
    /// fills the successor's input set, move the successor (and its pending
    /// events) to the runnable directory in the same batch.
    async fn arm_or_post(
        &self,
        producer: &JobName,
        output: &str,
        updates: &mut Vec<Token>,
        deletes: &mut Vec<Token>,
    ) -> Result<(), WorkerError> {
        let waiting_succ = JobName::new(
            &producer.workflow,
            &producer.instance,
            JobState::Waiting,
            output,
        );
        let runnable_succ = waiting_succ.with_state(JobState::Runnable);
        let event_id = format!("ev-{}", Uuid::now_v7());
        let event_data = EventData::new(producer.job.clone()).encode()?;

        // The event scan ends at an explicit `/` boundary: a sibling job
        // whose name merely extends this one (`load` vs `loader`) must not
        // leak its gating events into the successor's set.
        let mut results = self
            .master
            .query(vec![
                TokenQuery::new(waiting_succ.token_name(), 1),
                TokenQuery::new(format!("{}/", waiting_succ.token_name()), 1_000),
                TokenQuery::new(runnable_succ.token_name(), 1),
            ])
            .await?;
        let runnable_side = results.pop().unwrap_or_default();
        let waiting_events = results.pop().unwrap_or_default();
        let waiting_side = results.pop().unwrap_or_default();

        let succ_token = waiting_side
            .into_iter()
            .find(|t| t.name == waiting_succ.token_name());

        let Some(succ_token) = succ_token else {
            // Not waiting: post runnable-side if the successor is live there
            // (running or queued), otherwise the edge leads nowhere.
            if runnable_side
                .first()
                .is_some_and(|t| t.name == runnable_succ.token_name())
            {
                let event = EventName::new(runnable_succ, &producer.job, event_id);
                updates.push(Token::parked(event.token_name(), event_data));
            } else {
                warn!(successor = %output, "successor job token missing, dropping event");
            }
            return Ok(());
        };

        let succ_data = JobData::decode(&succ_token.data)?;
        let events: Vec<(EventName, Token)> = waiting_events
            .into_iter()
            .filter_map(|t| EventName::parse(&t.name).map(|parsed| (parsed, t)))
            .collect();

        let mut satisfied: HashSet<String> =
            events.iter().map(|(parsed, _)| parsed.input.clone()).collect();
        satisfied.insert(producer.job.clone());
        let armed = succ_data.inputs.iter().all(|input| satisfied.contains(input));

        if armed {
            // Successor becomes runnable and claimable; its events move with
            // it so a run finds them under one prefix.
            deletes.push(succ_token.clone());
            updates.push(
                Token::new(runnable_succ.token_name(), succ_token.data)
                    .with_priority(succ_token.priority),
            );
            for (parsed, event) in events {
                deletes.push(event.clone());
                updates.push(
                    Token::parked(parsed.with_state(JobState::Runnable).token_name(), event.data)
                        .with_priority(event.priority),
                );
            }
            let event = EventName::new(runnable_succ, &producer.job, event_id);
            updates.push(Token::parked(event.token_name(), event_data));
        } else {
            let event = EventName::new(waiting_succ, &producer.job, event_id);
            updates.push(Token::parked(event.token_name(), event_data));
        }
        Ok(())
    }

    // ========================================================================
    // Archival
    // ========================================================================

    /// Once an instance has no job token under its runnable directory,
    /// nothing can post events again; move the whole instance into the
    /// archive in one batch.
    async fn maybe_archive(&self, job_name: &JobName) -> Result<(), WorkerError> {
        let runnable_prefix =
            name::job_state_prefix(&job_name.workflow, &job_name.instance, JobState::Runnable);
        let results = self
            .master
            .query(vec![TokenQuery::new(runnable_prefix, 1_000)])
            .await?;
        if results[0].iter().any(|t| JobName::parse(&t.name).is_some()) {
            return Ok(());
        }

        // One batch in the normal case; an instance that outgrows a page
        // would otherwise never be reclaimed, so it is drained in
        // successive atomic batches instead.
        let instance = job_name.instance_prefix();
        loop {
            let tokens = self
                .master
                .query(vec![TokenQuery::new(instance.clone(), ARCHIVE_PAGE)])
                .await?
                .remove(0);
            if tokens.is_empty() {
                return Ok(());
            }
            let partial = tokens.len() >= ARCHIVE_PAGE;
            if partial {
                warn!(%instance, "instance exceeds one archive batch, draining in pages");
            }
            match self.master.archive(tokens).await {
                Ok(()) if partial => continue,
                Ok(()) => {
                    info!(%instance, "instance archived");
                    return Ok(());
                }
                Err(MasterError::VersionConflict(_) | MasterError::NotFound(_)) => {
                    debug!(%instance, "instance changed under archival, leaving it");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // ========================================================================
    // Signals
    // ========================================================================

    async fn observe_exit_signal(&self) -> Result<bool, WorkerError> {
        let results = self
            .master
            .query(vec![TokenQuery::new(EXIT_SIGNAL, 1)])
            .await?;
        let Some(signal) = results[0].first().filter(|t| t.name == EXIT_SIGNAL) else {
            return Ok(false);
        };
        let cutoff = SignalData::decode(&signal.data)
            .ok()
            .and_then(|s| s.generation());
        match cutoff {
            Some(cutoff) if self.config.generation < cutoff => {
                info!(
                    generation = self.config.generation,
                    cutoff, "below exit signal cutoff"
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn instance_signals(&self, job_name: &JobName) -> Result<InstanceSignals, WorkerError> {
        let prefix = format!("{}{}/", job_name.instance_prefix(), SIGNAL_DIR);
        let results = self
            .master
            .query(vec![TokenQuery::new(prefix, 10)])
            .await?;
        let mut signals = InstanceSignals::default();
        for token in &results[0] {
            if token.name.ends_with("/drain") {
                signals.drain = true;
            } else if token.name.ends_with("/abort") {
                signals.abort = true;
            }
        }
        Ok(signals)
    }

    // ========================================================================
    // Token housekeeping
    // ========================================================================

    async fn release(&self, token: Token) -> Result<(), WorkerError> {
        let mut update = token;
        update.release();
        match self.master.modify(vec![update], vec![]).await {
            Ok(_) => Ok(()),
            Err(MasterError::VersionConflict(_) | MasterError::NotFound(_)) => {
                debug!("token changed before release, leaving it");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn park(&self, token: Token) -> Result<(), WorkerError> {
        let mut update = token;
        update.park();
        match self.master.modify(vec![update], vec![]).await {
            Ok(_) => Ok(()),
            Err(MasterError::VersionConflict(_) | MasterError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn still_owned(&self, token: &Token) -> Result<bool, WorkerError> {
        let results = self
            .master
            .query(vec![TokenQuery::new(token.name.clone(), 1)])
            .await?;
        Ok(results[0]
            .first()
            .is_some_and(|live| live.name == token.name && live.version == token.version))
    }

    fn record(
        &self,
        outcome: ExecutionOutcome,
        start_time: i64,
        events: Vec<String>,
        info: &str,
    ) -> ExecutionRecord {
        ExecutionRecord {
            worker: self.config.identity.clone(),
            start_time,
            end_time: self.clock.now(),
            outcome,
            events,
            info: info.to_string(),
        }
    }

    // ========================================================================
    // Backoff
    // ========================================================================

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_poll_interval;
    }

    fn increase_backoff(&mut self) {
        let next = self.current_interval.as_secs_f64() * self.config.backoff_multiplier;
        self.current_interval = Duration::from_secs_f64(next).min(self.config.max_poll_interval);
    }

    /// Sleep the current interval with jitter to break up worker herds.
    /// Returns true if shutdown was requested while sleeping.
    async fn sleep_jittered(&mut self) -> bool {
        let jitter = rand::thread_rng().gen_range(0.5..1.0);
        let interval = self.current_interval.mul_f64(jitter);
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(interval) => false,
            _ = shutdown_rx.changed() => true,
        }
    }
}

/// The earliest event per input, in input order.
fn select_consumed(pending: &[Token], inputs: &[String]) -> Vec<Token> {
    inputs
        .iter()
        .filter_map(|input| {
            pending
                .iter()
                .find(|t| {
                    EventName::parse(&t.name).is_some_and(|parsed| &parsed.input == input)
                })
                .cloned()
        })
        .collect()
}
