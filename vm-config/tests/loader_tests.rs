use anyhow::Result;
use serial_test::serial;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;
use vm_config::loader::{ENV_DATACENTER, ENV_HOST, ENV_INSECURE, ENV_PASSWORD, ENV_USERNAME};
use vm_config::{ConfigLoader, ConnectionOverrides, Source};

const ALL_ENV: [&str; 5] = [ENV_HOST, ENV_USERNAME, ENV_PASSWORD, ENV_INSECURE, ENV_DATACENTER];

/// Test fixture holding a YAML config file and restoring the environment on drop
struct LoaderFixture {
    _temp_dir: TempDir,
    config_path: PathBuf,
}

impl LoaderFixture {
    fn new(yaml: &str) -> Result<Self> {
        clear_env();
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("vcli.yaml");
        fs::write(&config_path, yaml)?;
        Ok(Self {
            _temp_dir: temp_dir,
            config_path,
        })
    }
}

impl Drop for LoaderFixture {
    fn drop(&mut self) {
        clear_env();
    }
}

fn clear_env() {
    for key in ALL_ENV {
        std::env::remove_var(key);
    }
}

#[test]
#[serial]
fn test_env_wins_over_file() -> Result<()> {
    let fixture = LoaderFixture::new(
        r#"
connection:
  host: from-file.lab
  username: file-user
  password: file-password
"#,
    )?;
    std::env::set_var(ENV_HOST, "from-env.lab");

    let config = ConfigLoader::new().load(Some(&fixture.config_path))?;

    assert_eq!(config.connection.host, "from-env.lab");
    assert_eq!(config.connection.sources.host, Source::Env);
    assert_eq!(config.connection.username, "file-user");
    assert_eq!(config.connection.sources.username, Source::File);
    Ok(())
}

#[test]
#[serial]
fn test_flags_win_over_env() -> Result<()> {
    let fixture = LoaderFixture::new("connection:\n  password: pw-from-file\n")?;
    std::env::set_var(ENV_HOST, "from-env.lab");
    std::env::set_var(ENV_USERNAME, "env-user");

    let loader = ConfigLoader::new().with_overrides(ConnectionOverrides {
        username: Some("flag-user".to_string()),
        ..Default::default()
    });
    let config = loader.load(Some(&fixture.config_path))?;

    assert_eq!(config.connection.username, "flag-user");
    assert_eq!(config.connection.sources.username, Source::Flag);
    assert_eq!(config.connection.sources.password, Source::File);
    Ok(())
}

#[test]
#[serial]
fn test_missing_credentials_fail_validation() -> Result<()> {
    let fixture = LoaderFixture::new("defaults:\n  datacenter: dc-1\n")?;

    let err = ConfigLoader::new()
        .load(Some(&fixture.config_path))
        .unwrap_err();
    assert!(err.to_string().contains("VCLI_HOST is required"));

    // Inspection commands can still see the partial configuration
    let config = ConfigLoader::new().load_unvalidated(Some(&fixture.config_path))?;
    assert_eq!(config.defaults.datacenter, "dc-1");
    Ok(())
}

#[test]
#[serial]
fn test_describe_masks_password() -> Result<()> {
    let _fixture = LoaderFixture::new("")?;
    std::env::set_var(ENV_HOST, "vcenter.lab");
    std::env::set_var(ENV_USERNAME, "administrator@vsphere.local");
    std::env::set_var(ENV_PASSWORD, "Sup3rSecret!");

    let config = ConfigLoader::new().load(None)?;
    let rows = config.connection.describe();
    let password = rows
        .iter()
        .find(|(key, _, _)| *key == "password")
        .map(|(_, value, _)| value.clone())
        .unwrap();

    assert_eq!(password, "Su••••••t!");
    Ok(())
}
