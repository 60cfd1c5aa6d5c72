use chrono::{Duration, Utc};
use lethe::{EngineConfig, Fact, InvalidationService, TemporalType};
use serde_json::Value;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

async fn seed(db_path: &Path) {
    let service = InvalidationService::open(EngineConfig {
        db_path: db_path.to_path_buf(),
        ..EngineConfig::default()
    })
    .unwrap();
    for i in 0..3 {
        let fact = Fact::new(
            format!("job-{i}"),
            "state",
            "running",
            Utc::now() - Duration::days(40),
        )
        .with_temporal_type(TemporalType::Dynamic)
        .with_source("scheduler");
        service.store_fact(fact, false).await.unwrap();
    }
    service
        .store_fact(Fact::new("pi", "equals", "3.14159", Utc::now()), false)
        .await
        .unwrap();
}

fn sweep_once(db_path: &Path, dry_run: bool) -> Value {
    let bin = env!("CARGO_BIN_EXE_lethe-daemon");
    let output = Command::new(bin)
        .env("LETHE_DB_PATH", db_path)
        .env("LETHE_SWEEP_ONCE", "1")
        .env("LETHE_DRY_RUN", if dry_run { "1" } else { "0" })
        .env("RUST_LOG", "warn")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "daemon failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

#[tokio::test]
async fn sweep_once_prints_result_and_exits() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("lethe.redb");
    seed(&db_path).await;

    let preview = sweep_once(&db_path, true);
    assert_eq!(preview["status"], "dry_run");
    assert_eq!(preview["facts_processed"], 4);
    assert_eq!(preview["facts_identified"], 3);
    assert_eq!(preview["facts_invalidated"], 0);
    assert_eq!(preview["sample"].as_array().unwrap().len(), 3);

    let live = sweep_once(&db_path, false);
    assert_eq!(live["status"], "completed");
    assert_eq!(live["facts_invalidated"], 3);
    assert_eq!(live["rule_statistics"]["dynamic_30d"], 3);
    assert!(live.get("sample").is_none());

    let after = sweep_once(&db_path, false);
    assert_eq!(after["facts_processed"], 1);
    assert_eq!(after["facts_identified"], 0);
}

#[test]
fn invalid_configuration_is_rejected() {
    let dir = tempdir().unwrap();
    let bin = env!("CARGO_BIN_EXE_lethe-daemon");
    let output = Command::new(bin)
        .env("LETHE_DB_PATH", dir.path().join("lethe.redb"))
        .env("LETHE_SWEEP_ONCE", "1")
        .env("LETHE_BATCH_SIZE", "zero")
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("LETHE_BATCH_SIZE"), "stderr: {stderr}");
}
