
use std::sync::atomic::Ordering;
use std::time::Duration;

use marionette::agent::AgentStatus;
use marionette::scheduler::job::{JobPriority, JobStatus};
use test_harness::{test_config, TestEnv};

#[tokio::test]
async fn stale_unreachable_agent_goes_offline() {
    let env = TestEnv::new();
    let agent = env.register_agent("a1", "alice", &[]).await;
    let monitor = env.health_monitor();

    env.transport.status_reachable.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;
    monitor.sweep_agents().await;

    let agent = env.agent(agent.id).await;
    assert_eq!(agent.status, AgentStatus::Offline);
    assert!(agent.last_error.is_some());
}

#[tokio::test]
async fn stale_agent_goes_offline_even_when_reachable() {
    let env = TestEnv::new();
    let agent = env.register_agent("a1", "alice", &[]).await;
    let monitor = env.health_monitor();

    // The status endpoint still answers, but staleness alone decides.
    tokio::time::sleep(Duration::from_millis(150)).await;
    monitor.sweep_agents().await;

    assert_eq!(env.agent(agent.id).await.status, AgentStatus::Offline);
}

#[tokio::test]
async fn offline_agents_job_is_failed_and_requeued() {
    let env = TestEnv::new();
    let agent = env.register_agent("a1", "alice", &[]).await;
    let job_id = env.submit_simple("doomed", "calc").await;
    env.scheduler.dispatch_tick().await;
    assert_eq!(env.job(job_id).await.status, JobStatus::Running);

    tokio::time::sleep(Duration::from_millis(150)).await;
    env.health_monitor().sweep_agents().await;

    assert_eq!(env.agent(agent.id).await.status, AgentStatus::Offline);
    let job = env.job(job_id).await;
    // Failed once, immediately requeued at a decayed priority.
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.priority, JobPriority::Low);
    assert!(job.assigned_agent_id.is_none());
}

#[tokio::test]
async fn running_job_times_out_and_releases_agent() {
    let env = TestEnv::new();
    let agent = env.register_agent("a1", "alice", &[]).await;
    let job_id = env.submit_simple("slow", "calc").await;
    env.scheduler.dispatch_tick().await;

    // Past the 200ms job timeout of the test config.
    tokio::time::sleep(Duration::from_millis(250)).await;
    env.health_monitor().sweep_jobs().await;

    let job = env.job(job_id).await;
    assert_eq!(job.status, JobStatus::Timeout);
    assert!(job.completed_at.is_some());
    assert!(job.error_message.is_some());

    let agent = env.agent(agent.id).await;
    assert_eq!(agent.status, AgentStatus::Idle);
    assert!(agent.current_job_id.is_none());

    // The remote was told to stop, best-effort.
    let cancelled = env.transport.cancelled.lock().unwrap().clone();
    assert_eq!(cancelled, vec![(agent.id, job_id)]);
}

#[tokio::test]
async fn fresh_running_job_is_left_alone() {
    let env = TestEnv::new();
    env.register_agent("a1", "alice", &[]).await;
    let job_id = env.submit_simple("quick", "calc").await;
    env.scheduler.dispatch_tick().await;

    env.health_monitor().sweep_jobs().await;
    assert_eq!(env.job(job_id).await.status, JobStatus::Running);
}

#[tokio::test]
async fn cleanup_prunes_terminal_history() {
    let mut config = test_config();
    config.max_completed_history = 2;
    let env = TestEnv::with_config(config);

    let mut ids = Vec::new();
    for i in 0..4 {
        let id = env.submit_simple(&format!("job-{i}"), "calc").await;
        env.scheduler.cancel(id).await.unwrap();
        ids.push(id);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    env.health_monitor().sweep_cleanup().await;

    let jobs = env.jobs.read().await;
    assert!(jobs.get(&ids[0]).is_none());
    assert!(jobs.get(&ids[1]).is_none());
    assert!(jobs.get(&ids[2]).is_some());
    assert!(jobs.get(&ids[3]).is_some());
}

#[tokio::test]
async fn orphan_sessions_are_terminated() {
    let env = TestEnv::new();
    env.register_agent("a1", "alice", &[]).await;
    let orphan = env.sessions.create("nobody").await.unwrap();

    env.health_monitor().sweep_cleanup().await;

    assert!(env.sessions.get(&orphan.id).await.is_none());
    // The bound session survives.
    assert_eq!(env.sessions.live_count().await, 1);
}

#[tokio::test]
async fn session_job_budget_triggers_recycle_through_the_agent() {
    let mut config = test_config();
    config.session_max_jobs = 1;
    let env = TestEnv::with_config(config);
    let agent = env.register_agent("a1", "alice", &[]).await;

    let job_id = env.submit_simple("one", "calc").await;
    env.scheduler.dispatch_tick().await;
    env.callback(job_id, JobStatus::Success, Some("ok"), None)
        .await
        .unwrap();

    env.health_monitor().sweep_sessions().await;

    let session = env.sessions.get(&agent.session_id).await.unwrap();
    assert_eq!(session.generation, 1);
    assert_eq!(session.jobs_processed, 0);
    let agent = env.agent(agent.id).await;
    assert_eq!(agent.status, AgentStatus::Idle);
    assert_eq!(agent.jobs_executed, 0);
}

#[tokio::test]
async fn unhealthy_session_is_recycled() {
    let env = TestEnv::new();
    let agent = env.register_agent("a1", "alice", &[]).await;

    env.provisioner.healthy.store(false, Ordering::SeqCst);
    env.health_monitor().sweep_sessions().await;

    // The probe flagged the session and the same sweep rebuilt it.
    let session = env.sessions.get(&agent.session_id).await.unwrap();
    assert_eq!(session.generation, 1);
}

#[tokio::test]
async fn busy_agent_defers_session_recycle() {
    let mut config = test_config();
    config.session_max_jobs = 1;
    let env = TestEnv::with_config(config);
    let agent = env.register_agent("a1", "alice", &[]).await;

    // One finished job crosses the budget, a second is in flight.
    let first = env.submit_simple("one", "calc").await;
    env.scheduler.dispatch_tick().await;
    env.callback(first, JobStatus::Success, Some("ok"), None)
        .await
        .unwrap();
    let _second = env.submit_simple("two", "calc").await;
    env.scheduler.dispatch_tick().await;

    env.health_monitor().sweep_sessions().await;

    // Recycle waits for the job to finish.
    let session = env.sessions.get(&agent.session_id).await.unwrap();
    assert_eq!(session.generation, 0);
    assert_eq!(env.agent(agent.id).await.status, AgentStatus::Busy);
}
