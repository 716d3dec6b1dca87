//! Integration tests for credsync

mod scheduler;
mod watcher;

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn credsync(config: &Path) -> Command {
        let mut cmd = cargo_bin_cmd!("credsync");
        cmd.env_remove("RUST_LOG").arg("--config").arg(config);
        cmd
    }

    fn config_in(dir: &TempDir) -> std::path::PathBuf {
        dir.path().join("config.toml")
    }

    #[test]
    fn help_displays() {
        cargo_bin_cmd!("credsync")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::is_match("(?i)credential lifecycle").unwrap());
    }

    #[test]
    fn version_displays() {
        cargo_bin_cmd!("credsync")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("credsync"));
    }

    #[test]
    fn config_path() {
        let dir = TempDir::new().unwrap();
        credsync(&config_in(&dir))
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show_defaults() {
        let dir = TempDir::new().unwrap();
        credsync(&config_in(&dir))
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[scheduler]"))
            .stdout(predicate::str::contains("error_horizon = \"5s\""));
    }

    #[test]
    fn config_init_then_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = config_in(&dir);

        credsync(&path)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration initialized"));
        assert!(path.exists());

        credsync(&path)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--force"));
    }

    #[test]
    fn invalid_config_reports_hint() {
        let dir = TempDir::new().unwrap();
        let path = config_in(&dir);
        std::fs::write(&path, "[scheduler]\nerror_horizon = 5\n").unwrap();

        credsync(&path)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"))
            .stderr(predicate::str::contains("config init --force"));

        // Init still works on a broken file
        credsync(&path)
            .args(["config", "init", "--force"])
            .assert()
            .success();
    }

    #[test]
    fn horizon_lease_renewal() {
        let dir = TempDir::new().unwrap();
        credsync(&config_in(&dir))
            .args(["horizon", "--duration", "100s", "--renewal-percent", "60"])
            .args(["--seed", "1", "-n", "3"])
            .assert()
            .success()
            .stdout(predicate::str::contains("renewal percent: 60"))
            .stdout(predicate::str::contains("window opens: 1m"))
            .stdout(predicate::str::contains("horizon:").count(3));
    }

    #[test]
    fn horizon_clamps_percent() {
        let dir = TempDir::new().unwrap();
        credsync(&config_in(&dir))
            .args(["horizon", "--duration", "1h", "-r", "95"])
            .assert()
            .success()
            .stdout(predicate::str::contains("90 (clamped from 95)"));
    }

    #[test]
    fn horizon_static_rotation() {
        let dir = TempDir::new().unwrap();
        credsync(&config_in(&dir))
            .args(["horizon", "--duration", "20m", "--static"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Static credential rotation"))
            .stdout(predicate::str::contains("ttl: 20m"));
    }

    #[test]
    fn horizon_rejects_zero_samples() {
        let dir = TempDir::new().unwrap();
        credsync(&config_in(&dir))
            .args(["horizon", "--duration", "1h", "-n", "0"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("samples"));
    }

    #[test]
    fn cache_key_shows_parent() {
        let dir = TempDir::new().unwrap();
        credsync(&config_in(&dir))
            .args(["cache-key", "--method", "Kubernetes"])
            .args(["--auth-config", r#"{"role":"app"}"#, "-n", "team-a"])
            .assert()
            .success()
            .stdout(predicate::str::is_match(r"key: kubernetes-[0-9a-f]+/team-a").unwrap())
            .stdout(predicate::str::contains("namespace: team-a"));
    }

    #[test]
    fn cache_key_rejects_bad_json() {
        let dir = TempDir::new().unwrap();
        credsync(&config_in(&dir))
            .args(["cache-key", "--method", "approle", "--auth-config", "{role"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"))
            .stderr(predicate::str::contains("auth-config"));
    }
}
