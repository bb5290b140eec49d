//! Auto-scaler scenarios: growth under load, cooldown gating,
//! scale-down ordering.

use std::sync::Arc;
use std::time::Duration;

use quiver_autoscale::{
    AutoScaleConfig, AutoScaler, InstanceStatus, NullProvisioner, ScaleDecision,
};
use quiver_core::EventBus;

fn config() -> AutoScaleConfig {
    AutoScaleConfig {
        min_instances: 2,
        max_instances: 8,
        cooldown: Duration::ZERO,
        startup_delay: Duration::from_millis(5),
        drain_delay: Duration::from_millis(5),
        ..AutoScaleConfig::default()
    }
}

async fn scaler_with(config: AutoScaleConfig) -> Arc<AutoScaler> {
    let scaler = AutoScaler::new(
        config,
        Arc::new(NullProvisioner),
        Arc::new(EventBus::default()),
    )
    .unwrap();
    // Seed to min without the background loop.
    let (_tx, rx) = tokio::sync::watch::channel(false);
    let handle = scaler.start(rx).await;
    handle.abort();
    scaler
}

#[tokio::test]
async fn high_cpu_scales_stepwise_toward_max() {
    let scaler = scaler_with(config()).await;
    assert_eq!(scaler.pool_size(), 2);

    // Constant 90% CPU: 2 -> ceil(2 * 90/70) = 3, then 3 -> 4.
    scaler.record_metrics(90.0, 50.0, 1000.0, 12.0);
    assert_eq!(
        scaler.evaluate().await.unwrap(),
        ScaleDecision::ScaledUp { from: 2, to: 3 }
    );
    scaler.record_metrics(90.0, 50.0, 1000.0, 12.0);
    assert_eq!(
        scaler.evaluate().await.unwrap(),
        ScaleDecision::ScaledUp { from: 3, to: 4 }
    );
}

#[tokio::test]
async fn growth_is_monotone_and_capped_at_max() {
    let scaler = scaler_with(config()).await;
    let mut last = scaler.pool_size();
    for _ in 0..12 {
        scaler.record_metrics(90.0, 60.0, 1000.0, 15.0);
        let _ = scaler.evaluate().await.unwrap();
        let size = scaler.pool_size();
        assert!(size >= last, "pool shrank under constant load");
        assert!(size <= 8, "pool exceeded max");
        last = size;
    }
    assert_eq!(last, 8);

    // At max, further pressure holds.
    scaler.record_metrics(95.0, 60.0, 1000.0, 15.0);
    assert_eq!(scaler.evaluate().await.unwrap(), ScaleDecision::Hold);
}

#[tokio::test]
async fn cooldown_blocks_consecutive_actions() {
    let mut cfg = config();
    cfg.cooldown = Duration::from_secs(600);
    let scaler = scaler_with(cfg).await;

    scaler.record_metrics(90.0, 50.0, 1000.0, 12.0);
    assert!(matches!(
        scaler.evaluate().await.unwrap(),
        ScaleDecision::ScaledUp { .. }
    ));

    // Second evaluation lands inside the cooldown.
    scaler.record_metrics(95.0, 50.0, 1000.0, 12.0);
    assert_eq!(scaler.evaluate().await.unwrap(), ScaleDecision::Cooldown);
    assert!(scaler.status().in_cooldown);
}

#[tokio::test]
async fn low_utilization_scales_down_newest_first() {
    let scaler = scaler_with(config()).await;

    // Grow to 4 first.
    scaler.record_metrics(90.0, 50.0, 1000.0, 12.0);
    let _ = scaler.evaluate().await.unwrap();
    scaler.record_metrics(90.0, 50.0, 1000.0, 12.0);
    let _ = scaler.evaluate().await.unwrap();
    assert_eq!(scaler.pool_size(), 4);
    let before: Vec<String> = scaler.instances().iter().map(|i| i.id.clone()).collect();

    // Enough idle samples to drag the windowed means below the
    // scale-down threshold despite the earlier load spike.
    for _ in 0..30 {
        scaler.record_metrics(20.0, 10.0, 100.0, 5.0);
    }
    // Mean CPU ~24%: floor(4 * 24/70) = 1, clamped to min = 2.
    assert_eq!(
        scaler.evaluate().await.unwrap(),
        ScaleDecision::ScaledDown { from: 4, to: 2 }
    );

    // The two newest instances are the ones terminating.
    let terminating: Vec<String> = scaler
        .instances()
        .iter()
        .filter(|i| i.status == InstanceStatus::Terminating)
        .map(|i| i.id.clone())
        .collect();
    assert_eq!(terminating.len(), 2);
    assert!(terminating.contains(&before[before.len() - 1]));
    assert!(terminating.contains(&before[before.len() - 2]));

    // Records disappear after the drain delay.
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(scaler.instances().len(), 2);
}

#[tokio::test]
async fn no_data_and_hold_paths() {
    let scaler = scaler_with(config()).await;
    assert_eq!(scaler.evaluate().await.unwrap(), ScaleDecision::NoData);

    // Mid-band utilization: neither threshold crossed.
    scaler.record_metrics(55.0, 50.0, 500.0, 10.0);
    assert_eq!(scaler.evaluate().await.unwrap(), ScaleDecision::Hold);
}

#[tokio::test]
async fn invalid_bounds_are_rejected() {
    let cfg = AutoScaleConfig {
        min_instances: 5,
        max_instances: 2,
        ..AutoScaleConfig::default()
    };
    assert!(AutoScaler::new(
        cfg,
        Arc::new(NullProvisioner),
        Arc::new(EventBus::default())
    )
    .is_err());
}
