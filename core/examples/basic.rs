//! Basic breaker registry usage example

use breaker_registry::{BreakerConfigPatch, BreakerRegistry, CallOptions};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    println!("=== Breaker Registry Basic Example ===\n");

    let registry = BreakerRegistry::builder()
        .failure_threshold(3)
        .reset_timeout_ms(2_000)
        .success_threshold(2)
        .timeout_ms(200)
        .on_open(|key| println!("🔴 Circuit '{}' opened!", key))
        .on_close(|key| println!("🟢 Circuit '{}' closed!", key))
        .on_half_open(|key| println!("🟡 Circuit '{}' half-open, testing...", key))
        .build()
        .expect("valid defaults");

    // Warm the sibling so global protection leaves it alone later
    registry
        .execute("inventory", |_| async { Ok::<_, String>(0) })
        .await;

    println!("--- Successful calls ---");
    for i in 1..=2 {
        let result = registry
            .execute("payment_api", move |_| async move {
                Ok::<_, String>(format!("Payment {}", i))
            })
            .await;
        println!("✓ {:?}", result.data);
    }

    println!("\n--- Triggering failures ---");
    for i in 1..=3 {
        let result = registry
            .execute("payment_api", move |_| async move {
                Err::<String, _>(format!("Payment failed {}", i))
            })
            .await;
        println!("✗ {:?}: {:?}", result.fallback_reason, result.error);
    }

    println!("\n--- Attempting call while open ---");
    let result = registry
        .execute_with(
            "payment_api",
            |_| async { Ok::<_, String>("Should be rejected".to_string()) },
            CallOptions::new().with_fallback(|ctx| format!("cached response ({:?})", ctx.reason)),
        )
        .await;
    println!("↩ {:?}", result.data);

    println!("\n--- Slow call hits its deadline ---");
    let result = registry
        .execute_with(
            "inventory",
            |cancel| async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => Ok::<_, String>(1),
                    _ = cancel.cancelled() => Err("cancelled".to_string()),
                }
            },
            CallOptions::new().with_config(BreakerConfigPatch::new().timeout(50)),
        )
        .await;
    println!("⏱ {:?}: {:?}", result.fallback_reason, result.error);

    println!("\n--- Waiting for reset timeout ---");
    tokio::time::sleep(Duration::from_millis(2_100)).await;
    for _ in 0..2 {
        registry
            .execute("payment_api", |_| async { Ok::<_, String>("probe ok") })
            .await;
    }

    for (key, stats) in registry.all_breaker_statuses() {
        println!(
            "{}: {} (window requests: {}, failure rate: {:.1}%)",
            key, stats.state, stats.metrics.window_requests, stats.metrics.window_failure_rate
        );
    }

    println!("\n--- Event trail ---");
    for event in registry.events(Some(10), Some("payment_api")) {
        println!("{:?} {:?}", event.event_type(), event.details);
    }
}
