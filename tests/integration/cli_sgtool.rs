#![allow(missing_docs)]

use std::fs;
use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn sgtool(home: &Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("sgtool");
    cmd.env_remove("SGTOOL_CONFIG")
        .env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"))
        .env("RUST_LOG", "off");
    cmd
}

fn json_stdout(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("valid json")
}

#[test]
fn translate_single_node_emits_one_segment() {
    let home = TempDir::new().expect("tempdir");
    let output = sgtool(home.path())
        .args(["--format", "json", "translate", "--lens", "100", "--max-segs", "4"])
        .assert()
        .success()
        .get_output()
        .clone();
    let json = json_stdout(&output);
    assert_eq!(json["segment_count"], 1);
    assert_eq!(json["segments"][0]["length"], 100);
    assert_eq!(json["coalesced"], false);
}

#[test]
fn translate_coalesces_long_chains() {
    let home = TempDir::new().expect("tempdir");
    let output = sgtool(home.path())
        .args([
            "--format",
            "json",
            "translate",
            "--lens",
            "100,100,100,100,100,100,100,100,100,100",
            "--max-segs",
            "4",
        ])
        .assert()
        .success()
        .get_output()
        .clone();
    let json = json_stdout(&output);
    assert_eq!(json["coalesced"], true);
    assert_eq!(json["packet_len"], 1000);
    let segments = json["segments"].as_array().expect("segments");
    assert!(segments.len() <= 4);
    let total: u64 = segments
        .iter()
        .map(|s| s["length"].as_u64().expect("length"))
        .sum();
    assert_eq!(total, 1000);
}

#[test]
fn translate_without_coalescing_reports_the_error() {
    let home = TempDir::new().expect("tempdir");
    let output = sgtool(home.path())
        .args([
            "translate",
            "--lens",
            "10,10,10,10,10",
            "--max-segs",
            "2",
            "--no-coalesce",
        ])
        .assert()
        .failure()
        .get_output()
        .clone();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("error: packet needs 5 segments but the budget is 2"),
        "{stderr}"
    );
}

#[test]
fn config_file_sets_segment_ceiling() {
    let home = TempDir::new().expect("tempdir");
    let config = home.path().join("sgtool.toml");
    fs::write(&config, "[cursor]\nmax_segment_size = 1024\nmax_num_segments = 4\n")
        .expect("write config");
    let output = sgtool(home.path())
        .args(["--format", "json", "--config"])
        .arg(&config)
        .args(["translate", "--lens", "3000", "--page-offset", "0"])
        .assert()
        .success()
        .get_output()
        .clone();
    let json = json_stdout(&output);
    assert_eq!(json["budget"], 4);
    let lens: Vec<u64> = json["segments"]
        .as_array()
        .expect("segments")
        .iter()
        .map(|s| s["length"].as_u64().expect("length"))
        .collect();
    assert_eq!(lens, vec![1024, 1024, 952]);
}

#[test]
fn flags_override_config_file() {
    let home = TempDir::new().expect("tempdir");
    let config = home.path().join("sgtool.toml");
    fs::write(&config, "[cursor]\nmax_segment_size = 1024\n").expect("write config");
    let output = sgtool(home.path())
        .args(["--format", "json", "--max-segment-size", "2048", "--config"])
        .arg(&config)
        .args(["translate", "--lens", "3000", "--page-offset", "0", "--max-segs", "4"])
        .assert()
        .success()
        .get_output()
        .clone();
    let json = json_stdout(&output);
    assert_eq!(json["segment_count"], 2);
}

#[test]
fn malformed_config_fails() {
    let home = TempDir::new().expect("tempdir");
    let config = home.path().join("broken.toml");
    fs::write(&config, "[cursor\n").expect("write config");
    let output = sgtool(home.path())
        .arg("--config")
        .arg(&config)
        .args(["translate", "--lens", "10", "--max-segs", "1"])
        .assert()
        .failure()
        .get_output()
        .clone();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to parse config"), "{stderr}");
}

#[test]
fn simulate_reports_clean_invariants() {
    let home = TempDir::new().expect("tempdir");
    let output = sgtool(home.path())
        .args([
            "--format",
            "json",
            "simulate",
            "--packets",
            "300",
            "--seed",
            "11",
            "--unmapped-rate",
            "0.1",
        ])
        .assert()
        .success()
        .get_output()
        .clone();
    let json = json_stdout(&output);
    assert_eq!(json["packets"], 300);
    assert_eq!(json["violations"].as_array().expect("violations").len(), 0);
    assert_eq!(json["leaked_nodes"], 0);
    assert!(json["succeeded"].as_u64().expect("succeeded") > 0);
    assert!(json["metrics"]["fast_paths"].is_number());
    assert!(json["arena"]["allocs"].as_u64().expect("allocs") > 0);
}

#[test]
fn simulate_is_deterministic_per_seed() {
    let home = TempDir::new().expect("tempdir");
    let run = || {
        let output = sgtool(home.path())
            .args(["--format", "json", "simulate", "--packets", "100", "--seed", "5"])
            .assert()
            .success()
            .get_output()
            .clone();
        json_stdout(&output)
    };
    assert_eq!(run(), run());
}

#[test]
fn config_path_prints_explicit_path() {
    let home = TempDir::new().expect("tempdir");
    let config = home.path().join("custom.toml");
    let output = sgtool(home.path())
        .args(["--format", "json", "--config"])
        .arg(&config)
        .arg("config-path")
        .assert()
        .success()
        .get_output()
        .clone();
    let json = json_stdout(&output);
    assert_eq!(json["path"], config.display().to_string());
    assert_eq!(json["exists"], false);
}
