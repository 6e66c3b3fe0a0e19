use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use obs_watcher::watcher::UserIdentity;

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}

/// Name of the user running the tests
#[allow(dead_code)]
pub fn current_user() -> String {
    UserIdentity::current().name
}

/// Write an executable shell script `name` into `dir`
#[allow(dead_code)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("failed to write script");
    let mut perms = fs::metadata(&path).expect("script metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("failed to chmod script");
    path
}

/// Config with one watched package and tools pointing at `tools`
#[allow(dead_code)]
pub fn config_yaml(root: &Path, download: &Path, install: &Path, trigger: &str) -> String {
    format!(
        r#"
server: obs
download_dir: {root}/run
log_dir: {root}/log
tools:
  download: {download}
  install: {install}
  timeout_secs: 10
packages:
  - name: cobbler
    project: home:trenn:cobbler_test_build
    package: cobbler
    repo: SLE_15_SP1
    buildarch: x86_64
    pkg_arch: noarch
    user: {user}
    trigger_cmd: {trigger}
"#,
        root = root.display(),
        download = download.display(),
        install = install.display(),
        user = current_user(),
        trigger = trigger,
    )
}

/// Poll `path` until it contains `needle` or a few seconds have passed
#[allow(dead_code)]
pub async fn wait_for_contents(path: &Path, needle: &str) -> String {
    let mut contents = String::new();
    for _ in 0..100 {
        contents = fs::read_to_string(path).unwrap_or_default();
        if contents.contains(needle) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    contents
}
