//! End-to-end tests for job registration, cluster locking and task runs.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{push_spec, push_task, seed_users, CountingBody, TestEnv, ADMIN, DOMAIN, RESOURCE};
use syncope_scheduler::job::{ExecutionOutcome, JobError, JobExecutionContext};
use syncope_scheduler::job::delegates::TASK_EXEC_SUMMARY_REPORTLET;
use syncope_scheduler::store::{ExecKind, ExecStatus, Report};
use syncope_scheduler::sync::{TraceLevel, UnmatchingRule};

#[tokio::test(flavor = "multi_thread")]
async fn test_overlapping_fires_run_body_once() {
    let env = TestEnv::new();
    let body = Arc::new(CountingBody::new(Duration::from_millis(300)));
    let key = env.job_key("slow");

    let registered = env
        .manager
        .register_job(JobExecutionContext::new(key.clone(), ADMIN), body.clone(), None, None)
        .unwrap();
    assert!(registered);

    env.scheduler.start(&key).unwrap();
    env.wait_until(|| body.runs() == 1).await;
    env.scheduler.start(&key).unwrap();
    env.wait_until(|| !env.manager.is_running(&key)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(body.runs(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_nodes_share_the_lock() {
    let env = TestEnv::new();
    let other = env.second_node();
    let body = Arc::new(CountingBody::new(Duration::from_millis(300)));
    let execution = JobExecutionContext::new(env.job_key("shared"), ADMIN);

    let here = env.scheduler.envelope(body.clone(), execution.clone());
    let there = other.envelope(body.clone(), execution);
    let first = tokio::task::spawn_blocking(move || here.execute());
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = tokio::task::spawn_blocking(move || there.execute());

    let mut outcomes = vec![first.await.unwrap(), second.await.unwrap()];
    outcomes.sort_by_key(|o| matches!(o, ExecutionOutcome::Skipped));
    assert_eq!(outcomes, vec![ExecutionOutcome::Completed, ExecutionOutcome::Skipped]);
    assert_eq!(body.runs(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lock_released_after_failure() {
    let env = TestEnv::new();
    let body = Arc::new(CountingBody::failing());
    let key = env.job_key("failing");
    env.manager
        .register_job(JobExecutionContext::new(key.clone(), ADMIN), body.clone(), None, None)
        .unwrap();

    env.scheduler.start(&key).unwrap();
    env.wait_until(|| body.runs() == 1).await;
    env.wait_until(|| !env.scheduler.lock().is_locked(&key)).await;

    env.scheduler.start(&key).unwrap();
    env.wait_until(|| body.runs() == 2).await;
    env.wait_until(|| !env.scheduler.lock().is_locked(&key)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_registration_is_idempotent() {
    let env = TestEnv::new();
    let key = env.job_key("twice");
    for _ in 0..2 {
        let body = Arc::new(CountingBody::new(Duration::ZERO));
        assert!(env
            .manager
            .register_job(JobExecutionContext::new(key.clone(), ADMIN), body, Some("0 0 3 * * ?"), None)
            .unwrap());
    }

    assert_eq!(env.scheduler.job_names(DOMAIN), vec!["twice".to_string()]);
    assert!(env.scheduler.next_trigger(&key).is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_running_job_is_not_registered_again() {
    let env = TestEnv::new();
    let body = Arc::new(CountingBody::new(Duration::from_millis(300)));
    let key = env.job_key("busy");
    env.manager
        .register_job(JobExecutionContext::new(key.clone(), ADMIN), body.clone(), None, None)
        .unwrap();
    env.scheduler.start(&key).unwrap();
    env.wait_until(|| body.runs() == 1).await;

    let again = env
        .manager
        .register_job(JobExecutionContext::new(key.clone(), ADMIN), body.clone(), None, None)
        .unwrap();

    assert!(!again);
    env.wait_until(|| !env.manager.is_running(&key)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_execute_task_records_execution() {
    let env = TestEnv::new();
    seed_users(&env, 2);
    env.register_connector(RESOURCE);
    env.save_task(&push_task("push1", push_spec(UnmatchingRule::Assign, TraceLevel::All)));

    env.run_task("push1", false).await;

    let execs = env.execs("push1");
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].status, ExecStatus::Success);
    assert_eq!(execs[0].executor, ADMIN);
    let message = execs[0].message.as_deref().unwrap();
    assert!(message.starts_with("Users [created/failures]: 2/0"));
    assert!(env.task("push1").last_exec.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_execute_unknown_task_is_not_found() {
    let env = TestEnv::new();
    let err = env
        .manager
        .execute_task(DOMAIN, "missing", None, ADMIN, false, Default::default())
        .unwrap_err();
    assert!(matches!(err, JobError::NotFound(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_execute_report_records_execution() {
    let env = TestEnv::new();
    env.store
        .save_report(
            DOMAIN,
            &Report {
                key: "r1".to_string(),
                name: "task summary".to_string(),
                active: true,
                cron_expression: None,
                delegate: TASK_EXEC_SUMMARY_REPORTLET.to_string(),
                last_exec: None,
            },
        )
        .unwrap();

    env.manager
        .execute_report(DOMAIN, "r1", None, ADMIN)
        .unwrap();
    env.wait_until(|| {
        env.store
            .find_report(DOMAIN, "r1")
            .unwrap()
            .is_some_and(|r| r.last_exec.is_some())
    })
    .await;

    let execs = env.execs("r1");
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].kind, ExecKind::Report);
    assert_eq!(execs[0].status, ExecStatus::Success);
}
