use std::time::Duration;

use uuid::Uuid;

use marionette::agent::{Agent, AgentCapabilities, AgentPool, AgentStatus};
use marionette::scheduler::job::{Job, JobPriority, JobSpec, Step, StepType};

fn job_for(application: &str) -> Job {
    Job::new(JobSpec {
        name: "test".to_string(),
        application_path: application.to_string(),
        arguments: None,
        steps: vec![Step::new(0, StepType::Click, "ok")],
        priority: Some(JobPriority::Normal),
        max_retries: None,
        webhook_url: None,
        metadata: None,
    })
}

fn idle_agent(name: &str, apps: &[&str]) -> Agent {
    let mut agent = Agent::new(
        name,
        Uuid::new_v4(),
        "user",
        AgentCapabilities {
            supported_applications: apps.iter().map(|s| s.to_string()).collect(),
            max_concurrent_jobs: 1,
        },
        "http://127.0.0.1:9000",
    );
    agent.status = AgentStatus::Idle;
    agent.last_heartbeat = Some(chrono::Utc::now());
    agent
}

#[test]
fn pick_claims_the_agent_busy() {
    let mut pool = AgentPool::new(50);
    let agent = idle_agent("a1", &[]);
    let agent_id = agent.id;
    pool.register(agent);

    let job = job_for("calc");
    let claimed = pool.pick_and_claim(&job).unwrap();
    assert_eq!(claimed.id, agent_id);

    let agent = pool.get(&agent_id).unwrap();
    assert_eq!(agent.status, AgentStatus::Busy);
    assert_eq!(agent.current_job_id, Some(job.id));

    // Single-tenant: a second pick finds nobody.
    assert!(pool.pick_and_claim(&job_for("calc")).is_none());
}

#[test]
fn pick_filters_by_capability() {
    let mut pool = AgentPool::new(50);
    let notepad = idle_agent("notepad-agent", &["notepad"]);
    let calc = idle_agent("calc-agent", &["calc"]);
    let calc_id = calc.id;
    pool.register(notepad);
    pool.register(calc);

    // Case-insensitive substring match against the application target.
    let claimed = pool.pick_and_claim(&job_for("C:\\Windows\\Calc.exe")).unwrap();
    assert_eq!(claimed.id, calc_id);
}

#[test]
fn empty_capability_list_accepts_everything() {
    let mut pool = AgentPool::new(50);
    let agent = idle_agent("any", &[]);
    pool.register(agent);
    assert!(pool.pick_and_claim(&job_for("whatever.exe")).is_some());
}

#[test]
fn no_capability_fit_means_no_pick() {
    let mut pool = AgentPool::new(50);
    pool.register(idle_agent("notepad-agent", &["notepad"]));
    assert!(pool.pick_and_claim(&job_for("calc")).is_none());
}

#[test]
fn ranking_prefers_higher_success_rate() {
    let mut pool = AgentPool::new(50);
    let mut weak = idle_agent("weak", &[]);
    weak.metrics.record(true, 100.0);
    weak.metrics.record(false, 100.0);
    let mut strong = idle_agent("strong", &[]);
    strong.metrics.record(true, 100.0);
    strong.metrics.record(true, 100.0);
    let strong_id = strong.id;
    pool.register(weak);
    pool.register(strong);

    assert_eq!(pool.pick_and_claim(&job_for("calc")).unwrap().id, strong_id);
}

#[test]
fn ranking_breaks_ties_by_least_loaded() {
    let mut pool = AgentPool::new(50);
    let mut seasoned = idle_agent("seasoned", &[]);
    seasoned.jobs_executed = 10;
    let cold = idle_agent("cold", &[]);
    let cold_id = cold.id;
    pool.register(seasoned);
    pool.register(cold);

    // Both rate 1.0; the cold agent wins on jobs_executed.
    assert_eq!(pool.pick_and_claim(&job_for("calc")).unwrap().id, cold_id);
}

#[test]
fn ranking_is_deterministic_on_full_ties() {
    let mut pool = AgentPool::new(50);
    let a = idle_agent("a", &[]);
    let b = idle_agent("b", &[]);
    let smaller = a.id.min(b.id);
    pool.register(a);
    pool.register(b);

    assert_eq!(pool.pick_and_claim(&job_for("calc")).unwrap().id, smaller);
}

#[test]
fn release_updates_counters_and_metrics() {
    let mut pool = AgentPool::new(50);
    let agent = idle_agent("a1", &[]);
    let agent_id = agent.id;
    pool.register(agent);
    let job = job_for("calc");
    pool.pick_and_claim(&job).unwrap();

    let outcome = pool
        .release(&agent_id, Some(true), Some(Duration::from_millis(500)))
        .unwrap();
    assert!(!outcome.recycle_due);

    let agent = pool.get(&agent_id).unwrap();
    assert_eq!(agent.status, AgentStatus::Idle);
    assert_eq!(agent.jobs_executed, 1);
    assert!(agent.current_job_id.is_none());
    assert_eq!(agent.metrics.total_completed, 1);
    assert!((agent.metrics.success_rate() - 1.0).abs() < f64::EPSILON);
    assert!((agent.metrics.average_duration_ms - 500.0).abs() < 1.0);
}

#[test]
fn release_flags_recycle_at_threshold() {
    let mut pool = AgentPool::new(2);
    let agent = idle_agent("a1", &[]);
    let agent_id = agent.id;
    pool.register(agent);

    pool.pick_and_claim(&job_for("calc")).unwrap();
    let first = pool.release(&agent_id, Some(true), None).unwrap();
    assert!(!first.recycle_due);

    pool.pick_and_claim(&job_for("calc")).unwrap();
    let second = pool.release(&agent_id, Some(true), None).unwrap();
    assert!(second.recycle_due);
}

#[test]
fn cancelled_release_counts_execution_but_not_rate() {
    let mut pool = AgentPool::new(50);
    let agent = idle_agent("a1", &[]);
    let agent_id = agent.id;
    pool.register(agent);
    pool.pick_and_claim(&job_for("calc")).unwrap();

    pool.release(&agent_id, None, None).unwrap();
    let agent = pool.get(&agent_id).unwrap();
    assert_eq!(agent.jobs_executed, 1);
    assert_eq!(agent.metrics.total_completed, 0);
    assert_eq!(agent.metrics.total_failed, 0);
}

#[test]
fn heartbeat_recovers_offline_agent() {
    let mut pool = AgentPool::new(50);
    let agent = idle_agent("a1", &[]);
    let agent_id = agent.id;
    pool.register(agent);

    pool.mark_offline(&agent_id, "heartbeat timeout").unwrap();
    assert_eq!(pool.get(&agent_id).unwrap().status, AgentStatus::Offline);

    pool.heartbeat(&agent_id).unwrap();
    assert_eq!(pool.get(&agent_id).unwrap().status, AgentStatus::Idle);
}

#[test]
fn heartbeat_is_idempotent() {
    let mut pool = AgentPool::new(50);
    let agent = idle_agent("a1", &[]);
    let agent_id = agent.id;
    pool.register(agent);

    for _ in 0..5 {
        pool.heartbeat(&agent_id).unwrap();
    }
    let after_many = pool.get(&agent_id).unwrap().clone();
    pool.heartbeat(&agent_id).unwrap();
    let after_one_more = pool.get(&agent_id).unwrap();

    assert_eq!(after_many.status, after_one_more.status);
    assert_eq!(after_many.jobs_executed, after_one_more.jobs_executed);
    assert_eq!(after_many.current_job_id, after_one_more.current_job_id);
}

#[test]
fn stale_detection_skips_already_offline() {
    let mut pool = AgentPool::new(50);
    let mut agent = idle_agent("a1", &[]);
    agent.last_heartbeat = Some(chrono::Utc::now() - chrono::Duration::seconds(60));
    let agent_id = agent.id;
    pool.register(agent);

    let stale = pool.stale_agents(Duration::from_millis(100));
    assert_eq!(stale, vec![agent_id]);

    pool.mark_offline(&agent_id, "heartbeat timeout").unwrap();
    assert!(pool.stale_agents(Duration::from_millis(100)).is_empty());
}

#[test]
fn mark_offline_surfaces_the_lost_job() {
    let mut pool = AgentPool::new(50);
    let agent = idle_agent("a1", &[]);
    let agent_id = agent.id;
    pool.register(agent);
    let job = job_for("calc");
    pool.pick_and_claim(&job).unwrap();

    let lost = pool.mark_offline(&agent_id, "heartbeat timeout").unwrap();
    assert_eq!(lost, Some(job.id));
    assert!(pool.get(&agent_id).unwrap().current_job_id.is_none());
}

#[test]
fn recycle_resets_counters_on_success() {
    let mut pool = AgentPool::new(2);
    let mut agent = idle_agent("a1", &[]);
    agent.jobs_executed = 2;
    agent.metrics.record(true, 100.0);
    agent.last_error = Some("old".to_string());
    let agent_id = agent.id;
    pool.register(agent);

    pool.begin_recycle(&agent_id).unwrap();
    assert_eq!(pool.get(&agent_id).unwrap().status, AgentStatus::Recycling);

    pool.finish_recycle(&agent_id, Ok(())).unwrap();
    let agent = pool.get(&agent_id).unwrap();
    assert_eq!(agent.status, AgentStatus::Idle);
    assert_eq!(agent.jobs_executed, 0);
    assert!(agent.last_error.is_none());
    assert_eq!(agent.metrics.total_completed, 0);
}

#[test]
fn recycle_failure_parks_agent_in_error() {
    let mut pool = AgentPool::new(2);
    let agent = idle_agent("a1", &[]);
    let agent_id = agent.id;
    pool.register(agent);

    pool.begin_recycle(&agent_id).unwrap();
    pool.finish_recycle(
        &agent_id,
        Err(marionette::error::DispatchError::Provisioning(
            "no host capacity".to_string(),
        )),
    )
    .unwrap();

    let agent = pool.get(&agent_id).unwrap();
    assert_eq!(agent.status, AgentStatus::Error);
    assert!(agent.last_error.as_deref().unwrap().contains("no host capacity"));
}

#[test]
fn busy_agent_refuses_recycle() {
    let mut pool = AgentPool::new(2);
    let agent = idle_agent("a1", &[]);
    let agent_id = agent.id;
    pool.register(agent);
    pool.pick_and_claim(&job_for("calc")).unwrap();

    assert!(pool.begin_recycle(&agent_id).is_err());
}
