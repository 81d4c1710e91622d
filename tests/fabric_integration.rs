//! Cross-component behaviors of the fabric surface: composition order,
//! recording, idempotence, subscriptions, export formats.

use seawall::prelude::*;
use seawall::SelfHealing;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn fabric() -> ReliabilityFabric {
    ReliabilityFabric::builder().manual_collection().build()
}

/// A call that dies at its timeout: one error-budget failure, one latency
/// sample at least the timeout, one recorded failure, a released bulkhead
/// slot, and exactly one retry with max_attempts = 2.
#[tokio::test(flavor = "multi_thread")]
async fn timeout_failure_is_recorded_exactly_once_everywhere() {
    let fabric = fabric();
    fabric
        .register_service(
            ServiceConfig::new("svc")
                .bulkhead(BulkheadConfig {
                    max_concurrent: 4,
                    max_wait: Duration::from_millis(50),
                    degradation_threshold: 0.8,
                })
                .policy(PolicyConfig {
                    retry: Some(RetryConfig {
                        max_attempts: 2,
                        initial_delay: Duration::from_millis(1),
                        jitter: false,
                        ..Default::default()
                    }),
                    timeout: Some(Duration::from_millis(50)),
                    ..Default::default()
                }),
            None,
        )
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    let result = fabric
        .execute("svc", move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, std::io::Error>(())
            }
        })
        .await;

    assert!(result.unwrap_err().is_retry_exhausted());
    assert_eq!(calls.load(Ordering::SeqCst), 2, "exactly one retry");

    let status = fabric.get_service_status("svc").unwrap();
    let budget = status.error_budget.unwrap();
    assert_eq!(budget.observed, 1, "one error-budget sample");
    assert_eq!(budget.failed, 1);

    let latency = status.latency.unwrap();
    assert_eq!(latency.count, 1, "one latency sample");
    assert!(latency.max_ms >= 50.0, "sample covers at least the timeout");

    assert_eq!(fabric.failure_history("svc").len(), 1, "one recorded failure");
    assert_eq!(status.bulkhead.unwrap().active, 0, "slot released");
    fabric.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn admission_errors_never_reach_the_budgets() {
    let fabric = fabric();
    fabric
        .register_service(
            ServiceConfig::new("svc").rate_limiter(RateLimiterConfig {
                tokens_per_second: 1.0,
                max_tokens: 1.0,
                queue_enabled: false,
                ..Default::default()
            }),
            None,
        )
        .unwrap();

    fabric.execute("svc", || async { Ok::<_, std::io::Error>(()) }).await.unwrap();
    // Bucket drained: shed, not failed.
    let err = fabric
        .execute("svc", || async { Ok::<_, std::io::Error>(()) })
        .await
        .unwrap_err();
    assert!(err.is_rate_limited());

    let status = fabric.get_service_status("svc").unwrap();
    let budget = status.error_budget.unwrap();
    assert_eq!(budget.observed, 1, "only the successful call was sampled");
    assert_eq!(budget.failed, 0);
    assert!(fabric.failure_history("svc").is_empty());
    fabric.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn register_twice_is_idempotent_and_unregister_unknown_is_a_noop() {
    let fabric = fabric();
    let config = ServiceConfig::new("db").depends_on("disk");
    fabric.register_service(config.clone(), None).unwrap();
    fabric.register_service(config, None).unwrap();

    let summary = fabric.get_system_summary();
    assert_eq!(summary.total_services, 1);

    fabric.unregister_service("db");
    fabric.unregister_service("db");
    fabric.unregister_service("never-existed");
    assert_eq!(fabric.get_system_summary().total_services, 0);
    fabric.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_service_execution_fails_fast() {
    let fabric = fabric();
    let err = fabric
        .execute("ghost", || async { Ok::<_, std::io::Error>(()) })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownService);
    fabric.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn fallback_rescues_and_failures_trigger_healing() {
    struct RecordingHealer {
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait::async_trait]
    impl SelfHealing for RecordingHealer {
        async fn trigger_healing(&self, service: &str, reason: &str) {
            self.calls.lock().unwrap().push((service.to_string(), reason.to_string()));
        }
    }

    let healer = Arc::new(RecordingHealer { calls: Mutex::new(Vec::new()) });
    let fabric = ReliabilityFabric::builder()
        .self_healing(healer.clone())
        .manual_collection()
        .build();
    fabric.register_service(ServiceConfig::new("svc"), None).unwrap();

    // Terminal failure triggers the healing sink.
    let _ = fabric
        .execute("svc", || async {
            Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        })
        .await;
    assert_eq!(healer.calls.lock().unwrap().as_slice(), &[("svc".into(), "INNER".into())]);

    // skip_healing suppresses it.
    let _ = fabric
        .execute_with_options(
            "svc",
            || async { Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "boom")) },
            ExecuteOptions { skip_healing: true, ..Default::default() },
        )
        .await;
    assert_eq!(healer.calls.lock().unwrap().len(), 1);

    // Fallback rescues the caller: the call counts as a success, so no
    // further healing fires.
    let value = fabric
        .execute_with_fallback(
            "svc",
            || async { Err::<u32, _>(std::io::Error::new(std::io::ErrorKind::Other, "boom")) },
            |_err| async { Ok(7) },
            ExecuteOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(value, 7);
    assert_eq!(healer.calls.lock().unwrap().len(), 1);
    fabric.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn degraded_execution_walks_the_chain_and_projects_health() {
    let fabric = fabric();
    fabric.register_service(ServiceConfig::new("search"), None).unwrap();

    // Fail the primary three times; the default thresholds sink one level.
    for _ in 0..3 {
        let served = fabric
            .execute_degraded(
                "search",
                FallbackChain::new(|| async {
                    Err::<&str, seawall::BoxError>("primary down".into())
                })
                .partial(|| async { Ok("cached page") }),
            )
            .await
            .unwrap();
        assert_eq!(served.value, "cached page");
    }

    let status = fabric.get_service_status("search").unwrap();
    assert_eq!(status.degradation.level, seawall::DegradationLevel::Partial);
    assert_eq!(status.registry.health, HealthState::Degraded);
    fabric.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn subscriptions_deliver_in_order_and_unsubscribe() {
    let fabric = fabric();
    fabric.register_service(ServiceConfig::new("db"), None).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let order_a = order.clone();
    let sub_a = fabric.subscribe(EventKind::All, move |event| {
        order_a.lock().unwrap().push(format!("a:{}", event.kind() == EventKind::ServiceUnhealthy));
        Ok(())
    });
    let order_b = order.clone();
    let _sub_b = fabric.subscribe(EventKind::ServiceUnhealthy, move |_| {
        order_b.lock().unwrap().push("b".to_string());
        Ok(())
    });

    for _ in 0..3 {
        fabric.record_probe_result("db", false, None);
    }
    fabric.flush_events().await;
    {
        let seen = order.lock().unwrap();
        let a_pos = seen.iter().position(|s| s == "a:true").unwrap();
        let b_pos = seen.iter().position(|s| s == "b").unwrap();
        assert!(a_pos < b_pos, "subscription order preserved: {:?}", *seen);
    }

    sub_a.unsubscribe();
    order.lock().unwrap().clear();
    for _ in 0..2 {
        fabric.record_probe_result("db", true, None);
    }
    fabric.flush_events().await;
    let seen = order.lock().unwrap().clone();
    assert!(seen.iter().all(|s| !s.starts_with("a:")), "unsubscribed listener stayed quiet");
    fabric.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn export_formats_cover_the_reliability_families() {
    let fabric = fabric();
    fabric
        .register_service(
            ServiceConfig::new("db")
                .rate_limiter(RateLimiterConfig::default())
                .bulkhead(BulkheadConfig::default()),
            None,
        )
        .unwrap();
    fabric.execute("db", || async { Ok::<_, std::io::Error>(()) }).await.unwrap();

    let prometheus = fabric.export_metrics(ExportFormat::Prometheus);
    for family in [
        "reliability_health_score",
        "reliability_services_total",
        "reliability_services_healthy",
        "reliability_services_degraded",
        "reliability_services_unhealthy",
        "reliability_rate_limiters_throttled",
        "reliability_rate_limiters_total_requests",
        "reliability_rate_limiters_rejected_requests",
        "reliability_error_budgets_exhausted",
        "reliability_latency_budgets_breached",
        "reliability_cascade_risk_level",
    ] {
        assert!(prometheus.contains(family), "missing family {}", family);
    }
    // Every sample line ends with a millisecond timestamp.
    for line in prometheus.lines().filter(|l| !l.starts_with('#') && !l.is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(fields.len(), 3, "name value timestamp: {}", line);
        assert!(fields[2].parse::<u128>().is_ok(), "timestamp parses: {}", line);
    }

    let json = fabric.export_metrics(ExportFormat::Json);
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert!(parsed["health_score"].as_f64().unwrap() > 0.0);
    assert_eq!(parsed["services"].as_array().unwrap().len(), 1);

    let summary = fabric.export_metrics(ExportFormat::Summary);
    assert!(summary.contains("health score"));
    assert!(summary.contains("services: 1 total"));
    fabric.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn dependent_health_follows_its_dependency() {
    let fabric = fabric();
    fabric
        .register_service(ServiceConfig::new("db").criticality(Criticality::Critical), None)
        .unwrap();
    fabric.register_service(ServiceConfig::new("api").depends_on("db"), None).unwrap();
    fabric
        .register_service(ServiceConfig::new("web").depends_on("api"), None)
        .unwrap();

    fabric.set_service_health("db", HealthState::Unhealthy, "manual");
    assert_eq!(
        fabric.get_service_status("web").unwrap().registry.health,
        HealthState::Unhealthy,
        "propagation is transitive and synchronous"
    );

    let impact = fabric.analyze_impact("db");
    assert_eq!(impact.affected, vec!["api".to_string(), "web".to_string()]);
    assert_eq!(impact.severity, seawall::ImpactSeverity::Critical);

    fabric.set_service_health("db", HealthState::Healthy, "manual");
    assert_eq!(
        fabric.get_service_status("web").unwrap().registry.health,
        HealthState::Healthy
    );

    let summary = fabric.get_system_summary();
    assert_eq!(summary.total_services, 3);
    assert_eq!(summary.healthy, 3);
    fabric.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_is_idempotent_and_rejects_queued_waiters() {
    let fabric = fabric();
    fabric
        .register_service(
            ServiceConfig::new("db").rate_limiter(RateLimiterConfig {
                tokens_per_second: 0.001,
                max_tokens: 1.0,
                queue_enabled: true,
                ..Default::default()
            }),
            None,
        )
        .unwrap();
    fabric.execute("db", || async { Ok::<_, std::io::Error>(()) }).await.unwrap();

    let status = fabric.get_service_status("db").unwrap();
    assert!(status.rate_limiter.unwrap().tokens < 1.0);

    fabric.shutdown();
    fabric.shutdown(); // second call is a no-op

    let err = fabric
        .execute("db", || async { Ok::<_, std::io::Error>(()) })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownService);
}
