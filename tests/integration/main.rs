//! Integration tests for attach-cache

use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Isolated config, cache database and remote root for one test
struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        Self::with_cache_settings(&[])
    }

    /// Extra `[cache]` keys, e.g. `("enabled", false.into())`
    fn with_cache_settings(extra: &[(&str, toml::Value)]) -> Self {
        let dir = TempDir::new().unwrap();

        let mut cache = toml::map::Map::new();
        cache.insert(
            "path".into(),
            dir.path().join("cache").join("cache.db").display().to_string().into(),
        );
        for (key, value) in extra {
            cache.insert((*key).to_string(), value.clone());
        }
        let mut general = toml::map::Map::new();
        general.insert("activity_log".into(), false.into());
        let mut remote = toml::map::Map::new();
        remote.insert("root".into(), dir.path().join("remote").display().to_string().into());

        let mut root = toml::map::Map::new();
        root.insert("general".into(), toml::Value::Table(general));
        root.insert("cache".into(), toml::Value::Table(cache));
        root.insert("remote".into(), toml::Value::Table(remote));
        std::fs::write(
            dir.path().join("config.toml"),
            toml::to_string(&toml::Value::Table(root)).unwrap(),
        )
        .unwrap();

        Self { dir }
    }

    fn config_path(&self) -> PathBuf {
        self.dir.path().join("config.toml")
    }

    fn database_path(&self) -> PathBuf {
        self.dir.path().join("cache").join("cache.db")
    }

    fn file(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Files stored by the filesystem remote for a destination
    fn remote_files(&self, destination: &str) -> Vec<PathBuf> {
        let dir = self.dir.path().join("remote").join(destination);
        match std::fs::read_dir(dir) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

fn remote_ids(
    json: &serde_json::Value,
    index: usize,
) -> serde_json::Map<String, serde_json::Value> {
    json[index]["remote_ids"].as_object().unwrap().clone()
}

fn id_path(sandbox: &Sandbox, destination: &str, id: &str) -> PathBuf {
    sandbox.dir.path().join("remote").join(destination).join(id)
}

mod cli_tests {
    use super::*;
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use serial_test::serial;

    fn attach_cache(sandbox: &Sandbox) -> Command {
        let mut cmd = cargo_bin_cmd!("attach-cache");
        cmd.env("ATTACH_CACHE_CONFIG", sandbox.config_path())
            .env_remove("RUST_LOG");
        cmd
    }

    fn resolve_json(sandbox: &Sandbox, args: &[&str]) -> serde_json::Value {
        let output = attach_cache(sandbox)
            .arg("resolve")
            .args(args)
            .args(["--format", "json"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        serde_json::from_slice(&output).unwrap()
    }

    fn arg(path: &Path) -> &str {
        path.to_str().unwrap()
    }

    #[test]
    fn help_displays() {
        cargo_bin_cmd!("attach-cache")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Content-addressed upload cache"))
            .stdout(predicate::str::contains("resolve"));
    }

    #[test]
    fn version_displays() {
        cargo_bin_cmd!("attach-cache")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("attach-cache"));
    }

    #[test]
    fn config_path_follows_env() {
        let sandbox = Sandbox::new();
        attach_cache(&sandbox)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains(
                sandbox.config_path().display().to_string(),
            ));
    }

    #[test]
    fn config_show() {
        let sandbox = Sandbox::new();
        attach_cache(&sandbox)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[cache]"))
            .stdout(predicate::str::contains("ttl_days = 14"));
    }

    #[test]
    fn config_set_persists() {
        let sandbox = Sandbox::new();
        attach_cache(&sandbox)
            .args(["config", "set", "cache.ttl_days", "3"])
            .assert()
            .success();
        attach_cache(&sandbox)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("ttl_days = 3"));
    }

    #[test]
    fn config_set_unknown_key_fails() {
        let sandbox = Sandbox::new();
        attach_cache(&sandbox)
            .args(["config", "set", "cache.colour", "blue"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown config key"));
    }

    #[test]
    fn cache_path_prints_database() {
        let sandbox = Sandbox::new();
        attach_cache(&sandbox)
            .args(["cache", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("cache.db"));
    }

    #[test]
    fn resolve_twice_reuses_identifier() {
        let sandbox = Sandbox::new();
        let file = sandbox.file("report.csv", b"a,b\n1,2\n");

        let first = resolve_json(&sandbox, &[arg(&file)]);
        let second = resolve_json(&sandbox, &[arg(&file)]);

        assert_eq!(remote_ids(&first, 0), remote_ids(&second, 0));
        assert_eq!(first[0]["uploaded"], serde_json::json!(["user-data"]));
        assert_eq!(second[0]["uploaded"], serde_json::json!([]));
        assert_eq!(sandbox.remote_files("user-data").len(), 1);
    }

    #[test]
    fn resolve_routes_to_each_destination() {
        let sandbox = Sandbox::new();
        let file = sandbox.file("notes.md", b"# notes");

        let json = resolve_json(&sandbox, &[arg(&file), "--dest", "exec,search"]);
        let ids = remote_ids(&json, 0);

        assert_eq!(ids.len(), 2);
        assert!(ids.contains_key("execution-sandbox"));
        assert!(ids.contains_key("search-index"));
        assert_eq!(sandbox.remote_files("execution-sandbox").len(), 1);
        assert_eq!(sandbox.remote_files("search-index").len(), 1);
        assert!(sandbox.remote_files("user-data").is_empty());
    }

    #[test]
    fn identical_content_uploads_once() {
        let sandbox = Sandbox::new();
        let one = sandbox.file("one.txt", b"same bytes");
        let two = sandbox.file("two.txt", b"same bytes");

        let json = resolve_json(&sandbox, &[arg(&one), arg(&two)]);

        assert_eq!(json[0]["digest"], json[1]["digest"]);
        assert_eq!(remote_ids(&json, 0), remote_ids(&json, 1));
        assert_eq!(sandbox.remote_files("user-data").len(), 1);
    }

    #[test]
    fn changed_content_uploads_again() {
        let sandbox = Sandbox::new();
        let file = sandbox.file("data.json", b"{\"v\":1}");

        let before = resolve_json(&sandbox, &[arg(&file)]);
        std::fs::write(&file, b"{\"v\":2, \"extra\":true}").unwrap();
        let after = resolve_json(&sandbox, &[arg(&file)]);

        assert_ne!(before[0]["digest"], after[0]["digest"]);
        assert_ne!(remote_ids(&before, 0), remote_ids(&after, 0));
        assert_eq!(sandbox.remote_files("user-data").len(), 2);
    }

    #[test]
    fn resolve_missing_file_fails() {
        let sandbox = Sandbox::new();
        attach_cache(&sandbox)
            .args(["resolve", "/definitely/not/here.txt"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("could not be resolved"));
    }

    #[test]
    fn verify_reuploads_after_remote_delete() {
        let sandbox = Sandbox::new();
        let file = sandbox.file("slides.pdf", b"%PDF-1.4 fake");

        let json = resolve_json(&sandbox, &[arg(&file), "--dest", "search"]);
        let stale = remote_ids(&json, 0)["search-index"].as_str().unwrap().to_string();
        std::fs::remove_file(id_path(&sandbox, "search-index", &stale)).unwrap();

        attach_cache(&sandbox)
            .args(["verify", arg(&file), "--dest", "search"])
            .assert()
            .success()
            .stdout(predicate::str::contains("is present"));

        let again = resolve_json(&sandbox, &[arg(&file), "--dest", "search"]);
        let fresh = remote_ids(&again, 0)["search-index"].as_str().unwrap().to_string();
        assert_ne!(fresh, stale);
        assert!(id_path(&sandbox, "search-index", &fresh).exists());
    }

    #[test]
    fn cache_stats_and_clear() {
        let sandbox = Sandbox::new();
        let file = sandbox.file("a.txt", b"alpha");
        resolve_json(&sandbox, &[arg(&file), "--dest", "exec,user"]);

        let output = attach_cache(&sandbox)
            .args(["cache", "stats", "--format", "json"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let stats: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(stats["entries"], 1);
        assert_eq!(stats["destinations"], 2);
        assert_eq!(stats["total_bytes"], 5);

        attach_cache(&sandbox)
            .args(["cache", "clear", "--yes"])
            .assert()
            .success();

        attach_cache(&sandbox)
            .args(["cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cache entries"));
    }

    #[test]
    fn cache_gc_dry_run_keeps_entries() {
        let sandbox = Sandbox::new();
        let file = sandbox.file("a.txt", b"alpha");
        resolve_json(&sandbox, &[arg(&file)]);

        attach_cache(&sandbox)
            .args(["cache", "gc", "--days", "1", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cache entries older than 1 days"));

        attach_cache(&sandbox)
            .args(["cache", "list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::starts_with("sha256:"));
    }

    #[test]
    fn cache_gc_applies_size_bound_without_age_limit() {
        let sandbox = Sandbox::with_cache_settings(&[
            ("ttl_days", 0i64.into()),
            ("max_total_mb", 1i64.into()),
        ]);
        let older = sandbox.file("older.bin", &vec![b'o'; 700 * 1024]);
        let newer = sandbox.file("newer.bin", &vec![b'n'; 700 * 1024]);
        resolve_json(&sandbox, &[arg(&older)]);
        resolve_json(&sandbox, &[arg(&newer)]);

        attach_cache(&sandbox)
            .args(["cache", "gc"])
            .assert()
            .success()
            .stdout(predicate::str::contains("GC is disabled").not());

        let listed = attach_cache(&sandbox)
            .args(["cache", "list", "--format", "plain"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        assert_eq!(String::from_utf8(listed).unwrap().lines().count(), 1);
    }

    #[test]
    fn corrupt_database_fails_with_hint() {
        let sandbox = Sandbox::new();
        let file = sandbox.file("a.txt", b"alpha");
        std::fs::create_dir_all(sandbox.database_path().parent().unwrap()).unwrap();
        std::fs::write(sandbox.database_path(), vec![0x5a; 8192]).unwrap();

        attach_cache(&sandbox)
            .args(["resolve", arg(&file)])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unreadable"))
            .stderr(predicate::str::contains("Hint:"));

        attach_cache(&sandbox)
            .args(["cache", "clear", "--yes"])
            .assert()
            .success();
        assert!(!sandbox.database_path().exists());

        attach_cache(&sandbox)
            .args(["resolve", arg(&file)])
            .assert()
            .success();
    }

    #[test]
    fn corrupt_database_bypassed_when_configured() {
        let sandbox = Sandbox::with_cache_settings(&[("on_corruption", "bypass".into())]);
        let file = sandbox.file("a.txt", b"alpha");
        std::fs::create_dir_all(sandbox.database_path().parent().unwrap()).unwrap();
        std::fs::write(sandbox.database_path(), vec![0x5a; 8192]).unwrap();

        resolve_json(&sandbox, &[arg(&file)]);
        resolve_json(&sandbox, &[arg(&file)]);
        assert_eq!(sandbox.remote_files("user-data").len(), 2);

        attach_cache(&sandbox)
            .args(["cache", "stats"])
            .assert()
            .success()
            .stderr(predicate::str::contains("unreadable"))
            .stderr(predicate::str::contains("cache.enabled").not());
    }

    #[test]
    fn disabled_cache_uploads_every_time() {
        let sandbox = Sandbox::with_cache_settings(&[("enabled", false.into())]);
        let file = sandbox.file("a.txt", b"alpha");

        resolve_json(&sandbox, &[arg(&file)]);
        resolve_json(&sandbox, &[arg(&file)]);

        assert_eq!(sandbox.remote_files("user-data").len(), 2);
        assert!(!sandbox.database_path().exists());
    }

    #[test]
    fn preserve_disabled_forgets_on_exit() {
        let sandbox = Sandbox::with_cache_settings(&[("preserve_on_exit", false.into())]);
        let file = sandbox.file("a.txt", b"alpha");

        resolve_json(&sandbox, &[arg(&file)]);
        resolve_json(&sandbox, &[arg(&file)]);

        assert_eq!(sandbox.remote_files("user-data").len(), 2);
    }

    #[test]
    #[serial]
    fn concurrent_processes_upload_once() {
        let sandbox = Sandbox::new();
        let file = sandbox.file("shared.bin", &vec![7u8; 256 * 1024]);

        let children: Vec<_> = (0..6)
            .map(|_| {
                std::process::Command::new(env!("CARGO_BIN_EXE_attach-cache"))
                    .env("ATTACH_CACHE_CONFIG", sandbox.config_path())
                    .args(["resolve", arg(&file), "--format", "plain"])
                    .stdout(std::process::Stdio::piped())
                    .stderr(std::process::Stdio::null())
                    .spawn()
                    .unwrap()
            })
            .collect();

        let mut ids = Vec::new();
        for child in children {
            let output = child.wait_with_output().unwrap();
            assert!(output.status.success());
            ids.push(String::from_utf8(output.stdout).unwrap());
        }

        assert_eq!(sandbox.remote_files("user-data").len(), 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }
}
