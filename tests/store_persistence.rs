//! Durable-store behavior against a real database file.

use std::time::Duration;

use ipintel::{Address, Database, IntelConfig, spawn_expiry_sweep};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_records_survive_reopen() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("intel.db").to_string_lossy().into_owned();
    let addr = Address::parse("203.0.113.5").unwrap();

    {
        let db = Database::new(&path).await.unwrap();
        db.intel()
            .add_ban(Some(addr), None, None, 0b01, Some("bot"), None)
            .await
            .unwrap();
        db.intel().add_whitelist(addr).await.unwrap();
    }

    // A fresh handle on the same file sees everything; migrations are
    // idempotent on reopen.
    let db = Database::new(&path).await.unwrap();
    let bans = db.intel().get_ban_infos_for(addr, None, None).await.unwrap();
    assert_eq!(bans.len(), 1);
    assert!(bans[0].bans_placement());
    assert_eq!(bans[0].reason.as_deref(), Some("bot"));
    assert!(db.intel().is_whitelisted(addr).await.unwrap());
}

#[tokio::test]
async fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ipintel.toml");
    std::fs::write(
        &path,
        r#"
        [whois]
        default_host = "whois.arin.net"

        [cache]
        whois_ttl_days = 7
        "#,
    )
    .unwrap();

    let config = IntelConfig::load(&path).unwrap();
    assert_eq!(config.whois.default_host, "whois.arin.net");
    assert_eq!(config.cache.whois_ttl_days, 7);
    // Untouched sections keep defaults.
    assert!(!config.proxycheck.enabled);

    assert!(IntelConfig::load(dir.path().join("missing.toml")).is_err());
}

#[tokio::test]
async fn test_expiry_sweep_task_runs() {
    init_logging();
    let db = Database::new(":memory:").await.unwrap();
    let addr = Address::parse("203.0.113.5").unwrap();
    db.intel()
        .add_ban(Some(addr), None, None, 0b01, None, Some(-10))
        .await
        .unwrap();

    let sweeper = spawn_expiry_sweep(db.clone(), Duration::from_millis(50));
    tokio::time::sleep(Duration::from_millis(200)).await;
    sweeper.abort();

    // The expired ban was physically deleted, not just filtered.
    let remaining = db.intel().cleanup_expired().await.unwrap();
    assert_eq!(remaining, 0);
}
