use std::time::Duration;

use anyhow::Result;

use crate::config::Config;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("HTTP_PORT".into(), "7002".into()),
        ("NAMESPACE".into(), "databases".into()),
        ("POD_NAME".into(), "arango-operator-0".into()),
        ("SCALING_INTEGRATION_ENABLED".into(), "false".into()),
        ("DATABASE_TIMEOUT_SECONDS".into(), "30".into()),
    ])?;
    config.validate()?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(config.http_port == 7002, "unexpected value parsed for HTTP_PORT, got {}, expected {}", config.http_port, 7002);
    assert!(config.namespace == "databases", "unexpected value parsed for NAMESPACE, got {}, expected {}", config.namespace, "databases");
    assert!(
        config.pod_name == "arango-operator-0",
        "unexpected value parsed for POD_NAME, got {}, expected {}",
        config.pod_name,
        "arango-operator-0"
    );
    assert!(
        !config.scaling_integration_enabled,
        "unexpected value parsed for SCALING_INTEGRATION_ENABLED, got {}, expected {}",
        config.scaling_integration_enabled,
        false
    );
    assert!(
        config.database_timeout() == Duration::from_secs(30),
        "unexpected value parsed for DATABASE_TIMEOUT_SECONDS, got {:?}, expected {:?}",
        config.database_timeout(),
        Duration::from_secs(30)
    );

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("NAMESPACE".into(), "default".into()),
        ("POD_NAME".into(), "arango-operator-0".into()),
    ])?;
    config.validate()?;

    assert!(config.http_port == 8080, "unexpected default for HTTP_PORT, got {}, expected {}", config.http_port, 8080);
    assert!(
        config.scaling_integration_enabled,
        "unexpected default for SCALING_INTEGRATION_ENABLED, got {}, expected {}",
        config.scaling_integration_enabled,
        true
    );
    assert!(
        config.database_timeout_seconds == 10,
        "unexpected default for DATABASE_TIMEOUT_SECONDS, got {}, expected {}",
        config.database_timeout_seconds,
        10
    );

    Ok(())
}

#[test]
fn config_rejects_zero_database_timeout() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("NAMESPACE".into(), "default".into()),
        ("POD_NAME".into(), "arango-operator-0".into()),
        ("DATABASE_TIMEOUT_SECONDS".into(), "0".into()),
    ])?;

    assert!(config.validate().is_err(), "expected validation to reject a zero timeout");

    Ok(())
}
