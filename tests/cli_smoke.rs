//! Behavioural smoke tests for the CLI entrypoint.

use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use bladelink::test_support::sample_provider_json;
use predicates::str::contains;
use tempfile::TempDir;

#[test]
fn cli_help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("bladelink");
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(contains("list"))
        .stdout(contains("run"))
        .stdout(contains("copy-to"))
        .stdout(contains("copy-from"));
}

#[test]
fn cli_list_prints_every_blade_instance() {
    let temp = TempDir::new().expect("temp dir should be created");
    let provider = temp.path().join("provider.json");
    fs::write(&provider, sample_provider_json()).expect("provider config should be written");

    let mut cmd = cargo_bin_cmd!("bladelink");
    cmd.current_dir(temp.path());
    cmd.env("BLADELINK_PROVIDER_CONFIG", &provider);
    cmd.env("BLADELINK_BUILD_DIR", temp.path().join("build"));
    cmd.arg("list");

    cmd.assert().success().stdout(
        "compute\t0\tcompute-001\n\
         compute\t1\tcompute-002\n\
         compute\t2\tcompute-003\n\
         host-blade\t0\thost-blade-001\n\
         host-blade\t1\thost-blade-002\n",
    );
}

#[test]
fn cli_reports_missing_provider_config() {
    let temp = TempDir::new().expect("temp dir should be created");

    let mut cmd = cargo_bin_cmd!("bladelink");
    cmd.current_dir(temp.path());
    cmd.env_remove("BLADELINK_PROVIDER_CONFIG");
    cmd.arg("list");

    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("BLADELINK_PROVIDER_CONFIG"));
}

#[test]
fn cli_reports_unreadable_provider_config() {
    let temp = TempDir::new().expect("temp dir should be created");

    let mut cmd = cargo_bin_cmd!("bladelink");
    cmd.current_dir(temp.path());
    cmd.env("BLADELINK_PROVIDER_CONFIG", temp.path().join("absent.json"));
    cmd.arg("list");

    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("provider config error"));
}
