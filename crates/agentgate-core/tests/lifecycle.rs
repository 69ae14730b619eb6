//! Lazy start, start coalescing and idle sweep against the fake runtime.

use std::sync::Arc;
use std::time::Duration;

use agentgate_core::{
    AgentState, DiscoveryHealth, ErrorKind, FakeRuntime, GatewayError, IdlePolicy,
    LifecycleConfig, LifecycleManager, Registry,
};
use tokio::time::Instant;

const DEFAULT_IDLE: Duration = Duration::from_secs(15 * 60);

fn config() -> LifecycleConfig {
    LifecycleConfig {
        default_idle_timeout: DEFAULT_IDLE,
        start_timeout: Duration::from_millis(300),
        start_poll_interval: Duration::from_millis(10),
        adapter_timeout: Duration::from_secs(1),
        ..LifecycleConfig::default()
    }
}

async fn setup(
    agents: &[(&str, bool)],
    idle: IdlePolicy,
) -> (Arc<FakeRuntime>, LifecycleManager) {
    let rt = Arc::new(FakeRuntime::new());
    for (name, running) in agents {
        rt.add_agent(name, *running);
    }
    let registry =
        Arc::new(Registry::new(rt.clone()).with_adapter_timeout(config().adapter_timeout));
    registry.refresh().await.unwrap();
    (rt, LifecycleManager::new(registry, config(), idle))
}

fn state(lm: &LifecycleManager, name: &str) -> AgentState {
    lm.registry().descriptor(name).unwrap().state
}

fn later(by: Duration) -> Instant {
    Instant::now() + by
}

#[tokio::test]
async fn stopped_agent_is_started_on_demand() {
    let (rt, lm) = setup(&[("hello", false)], IdlePolicy::new(DEFAULT_IDLE)).await;
    assert_eq!(state(&lm, "hello"), AgentState::Stopped);

    let guard = lm.ensure_running("hello").await.unwrap();
    assert_eq!(guard.agent(), "hello");
    assert_eq!(state(&lm, "hello"), AgentState::Running);
    assert_eq!(rt.start_calls(), 1);

    let desc = lm.registry().descriptor("hello").unwrap();
    assert_eq!(desc.in_flight, 1);
    assert!(desc.last_activity.is_some());

    drop(guard);
    assert_eq!(lm.registry().descriptor("hello").unwrap().in_flight, 0);
}

#[tokio::test]
async fn running_agent_is_not_restarted() {
    let (rt, lm) = setup(&[("hello", true)], IdlePolicy::new(DEFAULT_IDLE)).await;
    let _guard = lm.ensure_running("hello").await.unwrap();
    assert_eq!(rt.start_calls(), 0);
}

#[tokio::test]
async fn concurrent_callers_share_one_start() {
    let (rt, lm) = setup(&[("hello", false)], IdlePolicy::new(DEFAULT_IDLE)).await;
    rt.set_start_delay(Duration::from_millis(50));

    let callers: Vec<_> = (0..16)
        .map(|_| {
            let lm = lm.clone();
            tokio::spawn(async move { lm.ensure_running("hello").await })
        })
        .collect();
    let guards: Vec<_> = futures::future::join_all(callers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(rt.start_calls(), 1);
    assert_eq!(lm.registry().descriptor("hello").unwrap().in_flight, 16);
    drop(guards);
    assert_eq!(lm.registry().descriptor("hello").unwrap().in_flight, 0);
}

#[tokio::test]
async fn start_failure_reaches_every_waiter_then_retries() {
    let (rt, lm) = setup(&[("hello", false)], IdlePolicy::new(DEFAULT_IDLE)).await;
    rt.set_start_fails(true);
    rt.set_start_delay(Duration::from_millis(20));

    let outcomes = futures::future::join_all((0..4).map(|_| lm.ensure_running("hello"))).await;
    for outcome in outcomes {
        let err = outcome.unwrap_err();
        assert!(matches!(err, GatewayError::AgentUnavailable { .. }), "{err}");
    }
    assert_eq!(rt.start_calls(), 1);
    assert_eq!(state(&lm, "hello"), AgentState::Stopped);

    rt.set_start_fails(false);
    lm.ensure_running("hello").await.unwrap();
    assert_eq!(rt.start_calls(), 2);
}

#[tokio::test]
async fn unreachable_agent_times_out() {
    let (rt, lm) = setup(&[("hello", false)], IdlePolicy::new(DEFAULT_IDLE)).await;
    rt.set_never_healthy(true);

    let err = lm.ensure_running("hello").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(state(&lm, "hello"), AgentState::Stopped);
}

#[tokio::test]
async fn unknown_agent_is_not_found() {
    let (_rt, lm) = setup(&[], IdlePolicy::new(DEFAULT_IDLE)).await;
    let err = lm.ensure_running("ghost").await.unwrap_err();
    assert!(matches!(err, GatewayError::AgentNotFound { .. }));
}

#[tokio::test]
async fn sweep_stops_idle_agents() {
    let (rt, lm) = setup(&[("hello", false)], IdlePolicy::new(DEFAULT_IDLE)).await;
    let mut guard = lm.ensure_running("hello").await.unwrap();
    guard.mark_success();
    drop(guard);

    assert!(lm.sweep_at(later(Duration::from_secs(60))).await.is_empty());

    let stopped = lm.sweep_at(later(DEFAULT_IDLE + Duration::from_secs(60))).await;
    assert_eq!(stopped, vec!["hello".to_string()]);
    assert_eq!(state(&lm, "hello"), AgentState::Stopped);
    assert_eq!(rt.stop_calls(), 1);
    assert!(!rt.is_running("ctr-hello"));
}

#[tokio::test]
async fn sweep_never_stops_agent_with_request_in_flight() {
    let (rt, lm) = setup(&[("hello", true)], IdlePolicy::new(DEFAULT_IDLE)).await;
    lm.record_activity("hello");
    let guard = lm.ensure_running("hello").await.unwrap();

    assert!(lm.sweep_at(later(Duration::from_secs(3600))).await.is_empty());
    assert_eq!(rt.stop_calls(), 0);
    assert_eq!(state(&lm, "hello"), AgentState::Running);

    drop(guard);
    assert_eq!(lm.sweep_at(later(Duration::from_secs(3600))).await.len(), 1);
}

#[tokio::test]
async fn agents_never_used_are_left_running() {
    let (rt, lm) = setup(&[("hello", true)], IdlePolicy::new(DEFAULT_IDLE)).await;
    assert!(lm.sweep_at(later(Duration::from_secs(3600))).await.is_empty());
    assert_eq!(rt.stop_calls(), 0);
}

#[tokio::test]
async fn per_agent_idle_override() {
    let idle = IdlePolicy::new(DEFAULT_IDLE).with_override("fast", Duration::from_secs(60));
    let (_rt, lm) = setup(&[("fast", true), ("slow", true)], idle).await;
    lm.record_activity("fast");
    lm.record_activity("slow");

    let stopped = lm.sweep_at(later(Duration::from_secs(120))).await;
    assert_eq!(stopped, vec!["fast".to_string()]);
    assert_eq!(state(&lm, "slow"), AgentState::Running);
}

#[tokio::test]
async fn reloaded_idle_policy_applies_to_next_sweep() {
    let (_rt, lm) = setup(&[("hello", true)], IdlePolicy::new(DEFAULT_IDLE)).await;
    lm.record_activity("hello");
    assert!(lm.sweep_at(later(Duration::from_secs(120))).await.is_empty());

    lm.set_idle_policy(IdlePolicy::new(Duration::from_secs(60)));
    assert_eq!(lm.sweep_at(later(Duration::from_secs(120))).await.len(), 1);
}

#[tokio::test]
async fn failed_stop_reverts_to_running_and_retries() {
    let (rt, lm) = setup(&[("hello", true)], IdlePolicy::new(DEFAULT_IDLE)).await;
    lm.record_activity("hello");
    rt.set_stop_fails(true);

    let far = DEFAULT_IDLE * 2;
    assert!(lm.sweep_at(later(far)).await.is_empty());
    assert_eq!(state(&lm, "hello"), AgentState::Running);

    rt.set_stop_fails(false);
    assert_eq!(lm.sweep_at(later(far)).await.len(), 1);
    assert_eq!(rt.stop_calls(), 2);
}

#[tokio::test]
async fn stalled_listing_does_not_wedge_starts_or_lookups() {
    let (rt, lm) = setup(&[("hello", false)], IdlePolicy::new(DEFAULT_IDLE)).await;
    rt.set_list_stalled(true);

    // A discovery poll is stuck inside the runtime while callers arrive.
    let registry = lm.registry().clone();
    let poll = tokio::spawn(async move { registry.refresh().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = tokio::time::timeout(Duration::from_secs(3), lm.ensure_running("hello"))
        .await
        .expect("ensure_running hung behind a stalled listing");
    let guard = started.unwrap();
    assert_eq!(state(&lm, "hello"), AgentState::Running);
    drop(guard);

    let missing = tokio::time::timeout(Duration::from_secs(4), lm.registry().resolve("ghost"))
        .await
        .expect("resolve hung behind a stalled listing");
    assert_eq!(missing.unwrap_err().kind(), ErrorKind::NotFound);

    let polled = tokio::time::timeout(Duration::from_secs(3), poll).await.unwrap().unwrap();
    assert_eq!(polled.unwrap_err().kind(), ErrorKind::Unavailable);
    assert_eq!(lm.registry().health(), DiscoveryHealth::AdapterUnavailable);
    // The last good snapshot is still served.
    assert!(lm.registry().lookup("hello").is_some());
}
