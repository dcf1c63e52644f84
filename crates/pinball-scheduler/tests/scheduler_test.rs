//! Scheduler tests: due-time claiming via leases, overrun policies, and
//! instance bootstrap against an in-process master.

use std::collections::BTreeMap;
use std::sync::Arc;

use pinball_core::name::WORKFLOW_PREFIX;
use pinball_core::{
    JobSpec, ManualClock, OverrunPolicy, ScheduleData, Token, TokenMaster, TokenQuery,
    WorkflowGraph,
};
use pinball_master::{InMemoryTokenStore, Master, MasterConfig, MasterHandle};
use pinball_scheduler::{schedule_token, GraphParser, Scheduler, SchedulerConfig};

const SCHEDULE_NAME: &str = "/schedule/workflow/etl";

struct Harness {
    master: MasterHandle,
    clock: Arc<ManualClock>,
    scheduler: Scheduler,
}

async fn harness() -> Harness {
    let store = Arc::new(InMemoryTokenStore::new());
    let clock = ManualClock::new(1_000);
    let master = Master::recover(store, clock.clone())
        .await
        .expect("recovery failed");
    let (master, _actor) = master.spawn(MasterConfig::default());

    let mut jobs = BTreeMap::new();
    jobs.insert(
        "extract".to_string(),
        JobSpec {
            outputs: vec!["load".to_string()],
            ..JobSpec::new("extract.sh")
        },
    );
    jobs.insert(
        "load".to_string(),
        JobSpec {
            inputs: vec!["extract".to_string()],
            ..JobSpec::new("load.sh")
        },
    );
    let parser = GraphParser::new(BTreeMap::from([(
        "etl".to_string(),
        WorkflowGraph::new(jobs).unwrap(),
    )]))
    .unwrap();

    let scheduler = Scheduler::new(
        Arc::new(master.clone()),
        Arc::new(parser),
        SchedulerConfig::new().with_identity("scheduler.test"),
    )
    .with_clock(clock.clone());

    Harness {
        master,
        clock,
        scheduler,
    }
}

impl Harness {
    async fn install(&self, next_run_time: i64, overrun_policy: OverrunPolicy) {
        let data = ScheduleData {
            workflow: "etl".to_string(),
            next_run_time,
            recurrence_seconds: 60,
            overrun_policy,
            max_running_instances: None,
        };
        self.master
            .modify(vec![schedule_token(&data).unwrap()], vec![])
            .await
            .unwrap();
    }

    async fn schedule(&self) -> (Token, ScheduleData) {
        let token = self
            .master
            .query(vec![TokenQuery::new(SCHEDULE_NAME, 1)])
            .await
            .unwrap()
            .remove(0)
            .remove(0);
        let data = ScheduleData::decode(&token.data).unwrap();
        (token, data)
    }

    async fn instance_count(&self) -> usize {
        self.master
            .group("/workflow/etl/", "/")
            .await
            .unwrap()
            .len()
    }

    /// Simulate an instance finishing: delete every one of its live tokens.
    async fn clear_instances(&self) {
        let tokens = self
            .master
            .query(vec![TokenQuery::new(WORKFLOW_PREFIX, 10_000)])
            .await
            .unwrap()
            .remove(0);
        self.master.modify(vec![], tokens).await.unwrap();
    }
}

#[tokio::test]
async fn test_due_schedule_starts_an_instance() {
    let h = harness().await;
    h.install(900, OverrunPolicy::StartNew).await;

    let started = h.scheduler.poll_once().await.unwrap();
    assert_eq!(started, 1);
    assert_eq!(h.instance_count().await, 1);

    // The instance bootstrapped with the source job runnable.
    let counts = h.master.group("/workflow/etl/", "/").await.unwrap();
    let instance = counts.keys().next().unwrap().trim_end_matches('/');
    let runnable = h
        .master
        .query(vec![TokenQuery::new(
            format!("/workflow/etl/{instance}/job/runnable/"),
            10,
        )])
        .await
        .unwrap()
        .remove(0);
    assert_eq!(runnable.len(), 1);
    assert!(runnable[0].name.ends_with("/extract"));

    // The schedule advanced past now and sleeps on its lease until then.
    let (token, data) = h.schedule().await;
    assert_eq!(data.next_run_time, 1_020);
    assert_eq!(token.owner.as_deref(), Some("scheduler.test"));
    assert_eq!(token.expiration_time, Some(1_020));

    // Nothing claimable until the due time.
    assert_eq!(h.scheduler.poll_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_recurrence_fires_again_at_lease_end() {
    let h = harness().await;
    h.install(900, OverrunPolicy::StartNew).await;

    assert_eq!(h.scheduler.poll_once().await.unwrap(), 1);
    h.clock.set(1_021);
    assert_eq!(h.scheduler.poll_once().await.unwrap(), 1);
    // StartNew stacks instances.
    assert_eq!(h.instance_count().await, 2);
}

#[tokio::test]
async fn test_skip_advances_without_starting() {
    let h = harness().await;
    h.install(900, OverrunPolicy::Skip).await;

    assert_eq!(h.scheduler.poll_once().await.unwrap(), 1);
    h.clock.set(1_021);
    assert_eq!(h.scheduler.poll_once().await.unwrap(), 0);

    assert_eq!(h.instance_count().await, 1);
    let (_, data) = h.schedule().await;
    assert_eq!(data.next_run_time, 1_080);
}

#[tokio::test]
async fn test_delay_holds_until_idle() {
    let h = harness().await;
    h.install(900, OverrunPolicy::Delay).await;

    assert_eq!(h.scheduler.poll_once().await.unwrap(), 1);

    // Still running at the next due time: held, due time unchanged, lease
    // set to the hold-retry interval.
    h.clock.set(1_021);
    assert_eq!(h.scheduler.poll_once().await.unwrap(), 0);
    let (token, data) = h.schedule().await;
    assert_eq!(data.next_run_time, 1_020);
    assert_eq!(token.expiration_time, Some(1_021 + 30));

    // Once the instance is gone the held occurrence fires.
    h.clear_instances().await;
    h.clock.set(1_060);
    assert_eq!(h.scheduler.poll_once().await.unwrap(), 1);
    assert_eq!(h.instance_count().await, 1);
}

#[tokio::test]
async fn test_abort_running_signals_then_starts() {
    let h = harness().await;
    h.install(900, OverrunPolicy::AbortRunning).await;

    assert_eq!(h.scheduler.poll_once().await.unwrap(), 1);
    let counts = h.master.group("/workflow/etl/", "/").await.unwrap();
    let first_instance = counts.keys().next().unwrap().trim_end_matches('/').to_string();

    h.clock.set(1_021);
    assert_eq!(h.scheduler.poll_once().await.unwrap(), 1);
    assert_eq!(h.instance_count().await, 2);

    // The first instance carries the abort signal for workers to observe.
    let signal = h
        .master
        .query(vec![TokenQuery::new(
            format!("/workflow/etl/{first_instance}/__SIGNAL__/abort"),
            1,
        )])
        .await
        .unwrap()
        .remove(0);
    assert_eq!(signal.len(), 1);
}

#[tokio::test]
async fn test_early_claim_goes_back_to_sleep() {
    let h = harness().await;
    h.install(2_000, OverrunPolicy::StartNew).await;

    assert_eq!(h.scheduler.poll_once().await.unwrap(), 0);
    assert_eq!(h.instance_count().await, 0);

    let (token, data) = h.schedule().await;
    assert_eq!(data.next_run_time, 2_000);
    assert_eq!(token.expiration_time, Some(2_000));
}

#[tokio::test]
async fn test_instance_cap_overrides_start_new() {
    let h = harness().await;
    let data = ScheduleData {
        workflow: "etl".to_string(),
        next_run_time: 900,
        recurrence_seconds: 60,
        overrun_policy: OverrunPolicy::StartNew,
        max_running_instances: Some(1),
    };
    h.master
        .modify(vec![schedule_token(&data).unwrap()], vec![])
        .await
        .unwrap();

    assert_eq!(h.scheduler.poll_once().await.unwrap(), 1);

    // At the cap the occurrence is held even though the policy stacks.
    h.clock.set(1_021);
    assert_eq!(h.scheduler.poll_once().await.unwrap(), 0);
    assert_eq!(h.instance_count().await, 1);
    let (_, data) = h.schedule().await;
    assert_eq!(data.next_run_time, 1_020);
}

#[tokio::test]
async fn test_install_schedules_is_idempotent() {
    let h = harness().await;
    let data = ScheduleData {
        workflow: "etl".to_string(),
        next_run_time: 2_000,
        recurrence_seconds: 60,
        overrun_policy: OverrunPolicy::StartNew,
        max_running_instances: None,
    };

    h.scheduler
        .install_schedules(std::slice::from_ref(&data))
        .await
        .unwrap();
    h.scheduler
        .install_schedules(std::slice::from_ref(&data))
        .await
        .unwrap();

    let results = h
        .master
        .query(vec![TokenQuery::new("/schedule/", 10)])
        .await
        .unwrap();
    assert_eq!(results[0].len(), 1);
}
