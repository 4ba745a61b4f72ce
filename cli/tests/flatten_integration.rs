//! Integration test: flatten image exports with the `monolayer` binary.
//!
//! Each test fabricates a `docker save`-style export (outer tar holding
//! `manifest.json`, a config JSON and one tar per layer), runs the binary
//! against it and inspects the two artifacts.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p monolayer-cli --test flatten_integration
//! ```

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::process::Command;

use chrono::NaiveDateTime;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

type Layer<'a> = (&'a str, &'a [(&'a str, &'a [u8])]);

/// Run the monolayer binary and return (stdout, stderr, exit code).
fn run(args: &[&str]) -> (String, String, i32) {
    let output = Command::new(env!("CARGO_BIN_EXE_monolayer"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to execute monolayer");

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.code().unwrap_or(-1),
    )
}

fn tar_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *content).unwrap();
    }
    builder.into_inner().unwrap()
}

fn create_export(path: &Path, manifest: &Value, config: &Value, layers: &[Layer]) {
    let manifest_bytes = serde_json::to_vec(manifest).unwrap();
    let config_bytes = serde_json::to_vec(config).unwrap();
    let layer_bytes: Vec<(String, Vec<u8>)> = layers
        .iter()
        .map(|(name, files)| (name.to_string(), tar_bytes(files)))
        .collect();

    let mut entries: Vec<(&str, &[u8])> = vec![
        ("manifest.json", manifest_bytes.as_slice()),
        ("abc123.json", config_bytes.as_slice()),
    ];
    for (name, bytes) in &layer_bytes {
        entries.push((name.as_str(), bytes.as_slice()));
    }

    fs::write(path, tar_bytes(&entries)).unwrap();
}

fn read_layer(path: &Path) -> Vec<(String, Vec<u8>)> {
    let mut archive = tar::Archive::new(File::open(path).unwrap());
    let mut files = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.header().entry_type().is_file() {
            let name = entry.path().unwrap().to_string_lossy().to_string();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            files.push((name, data));
        }
    }
    files
}

fn read_config(path: &Path) -> Value {
    serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
}

fn standard_export(dir: &Path, manifest: Value) -> String {
    let input = dir.join("image.tar");
    create_export(
        &input,
        &manifest,
        &json!({
            "parent": "abc",
            "history": [{"created_by": "ADD a"}, {"created_by": "ADD b"}],
            "rootfs": {"type": "layers", "diff_ids": ["sha256:1", "sha256:2"]},
            "other": 1
        }),
        &[
            ("l1/layer.tar", &[("etc/x", b"v1")]),
            ("l2/layer.tar", &[("etc/x", b"v2"), ("etc/y", b"new")]),
        ],
    );
    input.to_string_lossy().to_string()
}

#[test]
fn test_end_to_end_flatten() {
    let work = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let input = standard_export(
        work.path(),
        json!([{"config": "abc123.json", "layers": ["l1/layer.tar", "l2/layer.tar"]}]),
    );

    let (stdout, stderr, code) = run(&["-i", &input, "-o", out.path().to_str().unwrap()]);
    assert_eq!(code, 0, "stderr: {stderr}");
    assert!(stdout.contains("Found config: abc123.json"));

    let files = read_layer(&out.path().join("layer.tar"));
    assert!(files.contains(&("etc/x".to_string(), b"v2".to_vec())));
    assert!(files.contains(&("etc/y".to_string(), b"new".to_vec())));
    assert!(!files.iter().any(|(name, _)| name.starts_with("./") || name.starts_with('/')));

    let config = read_config(&out.path().join("config.json"));
    assert_eq!(config["other"], 1);
    assert!(config.get("parent").is_none());
    assert_eq!(config["rootfs"]["type"], "layers");
    assert_eq!(config["rootfs"]["diff_ids"].as_array().unwrap().len(), 1);
    let history = config["history"].as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(
        history[0]["comment"],
        "image layers flattened and history removed"
    );
    let created = history[0]["created"].as_str().unwrap();
    assert!(
        NaiveDateTime::parse_from_str(created, "%Y-%m-%dT%H:%M:%SZ").is_ok(),
        "unexpected timestamp {created}"
    );

    let out_entries: Vec<_> = fs::read_dir(out.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(out_entries.len(), 2);
}

#[test]
fn test_diff_id_matches_output_layer() {
    let work = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let input = standard_export(
        work.path(),
        json!([{"config": "abc123.json", "layers": ["l1/layer.tar", "l2/layer.tar"]}]),
    );

    let (_, stderr, code) = run(&["-i", &input, "-o", out.path().to_str().unwrap()]);
    assert_eq!(code, 0, "stderr: {stderr}");

    let bytes = fs::read(out.path().join("layer.tar")).unwrap();
    let expected = format!("sha256:{}", hex::encode(Sha256::digest(&bytes)));
    let config = read_config(&out.path().join("config.json"));
    assert_eq!(config["rootfs"]["diff_ids"][0], expected.as_str());
}

#[test]
fn test_capitalized_keys_are_equivalent() {
    let work = TempDir::new().unwrap();
    let lower_out = TempDir::new().unwrap();
    let upper_out = TempDir::new().unwrap();

    let lower_dir = work.path().join("lower");
    let upper_dir = work.path().join("upper");
    fs::create_dir_all(&lower_dir).unwrap();
    fs::create_dir_all(&upper_dir).unwrap();

    let lower = standard_export(
        &lower_dir,
        json!([{"config": "abc123.json", "layers": ["l1/layer.tar", "l2/layer.tar"]}]),
    );
    let upper = standard_export(
        &upper_dir,
        json!([{
            "Config": "abc123.json",
            "RepoTags": ["app:latest"],
            "Layers": ["l1/layer.tar", "l2/layer.tar"]
        }]),
    );

    assert_eq!(run(&["-i", &lower, "-o", lower_out.path().to_str().unwrap()]).2, 0);
    assert_eq!(run(&["-i", &upper, "-o", upper_out.path().to_str().unwrap()]).2, 0);

    assert_eq!(
        read_layer(&lower_out.path().join("layer.tar")),
        read_layer(&upper_out.path().join("layer.tar"))
    );

    let mut lower_config = read_config(&lower_out.path().join("config.json"));
    let mut upper_config = read_config(&upper_out.path().join("config.json"));
    lower_config.as_object_mut().unwrap().remove("history");
    upper_config.as_object_mut().unwrap().remove("history");
    lower_config.as_object_mut().unwrap().remove("rootfs");
    upper_config.as_object_mut().unwrap().remove("rootfs");
    assert_eq!(lower_config, upper_config);
}

#[test]
fn test_prefix_and_trailing_slash() {
    let work = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let input = standard_export(
        work.path(),
        json!([{"config": "abc123.json", "layers": ["l1/layer.tar"]}]),
    );
    let output = format!("{}/", out.path().display());

    let (stdout, stderr, code) = run(&[
        "--input", &input, "--output", &output, "--prefix", "base-",
    ]);
    assert_eq!(code, 0, "stderr: {stderr}");
    assert!(out.path().join("base-layer.tar").is_file());
    assert!(out.path().join("base-config.json").is_file());
    assert!(!stdout.contains("//"));
}

#[test]
fn test_multi_image_manifest_fails_without_output() {
    let work = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let entry = json!({"config": "abc123.json", "layers": ["l1/layer.tar"]});
    let input = standard_export(work.path(), json!([entry.clone(), entry]));

    let (_, stderr, code) = run(&["-i", &input, "-o", out.path().to_str().unwrap()]);
    assert_eq!(code, 1);
    assert!(stderr.contains("Format error"), "stderr: {stderr}");
    assert_eq!(fs::read_dir(out.path()).unwrap().count(), 0);
}

#[test]
fn test_missing_layers_key_fails() {
    let work = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let input = standard_export(work.path(), json!([{"config": "abc123.json"}]));

    let (_, stderr, code) = run(&["-i", &input, "-o", out.path().to_str().unwrap()]);
    assert_eq!(code, 1);
    assert!(stderr.contains("Unable to find layers"), "stderr: {stderr}");
}

#[test]
fn test_missing_arguments_is_usage_error() {
    let (_, stderr, code) = run(&["-i", "image.tar"]);
    assert_eq!(code, 2);
    assert!(stderr.contains("Usage error"), "stderr: {stderr}");
}

#[test]
fn test_input_must_be_a_file() {
    let work = TempDir::new().unwrap();
    let dir = work.path().to_str().unwrap();

    let (_, stderr, code) = run(&["-i", dir, "-o", dir]);
    assert_eq!(code, 1);
    assert!(stderr.contains("Input must be a tar file"), "stderr: {stderr}");
}

#[test]
fn test_output_must_be_a_directory() {
    let work = TempDir::new().unwrap();
    let input = standard_export(
        work.path(),
        json!([{"config": "abc123.json", "layers": []}]),
    );

    let (_, stderr, code) = run(&["-i", &input, "-o", &input]);
    assert_eq!(code, 1);
    assert!(stderr.contains("Output must be a directory"), "stderr: {stderr}");
}

#[test]
fn test_whiteouts_are_kept() {
    let work = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let input = work.path().join("image.tar");
    create_export(
        &input,
        &json!([{"config": "abc123.json", "layers": ["a.tar", "b.tar"]}]),
        &json!({}),
        &[
            ("a.tar", &[("etc/gone", b"still here")]),
            ("b.tar", &[("etc/.wh.gone", b"")]),
        ],
    );

    let (_, stderr, code) = run(&[
        "-i",
        input.to_str().unwrap(),
        "-o",
        out.path().to_str().unwrap(),
    ]);
    assert_eq!(code, 0, "stderr: {stderr}");
    assert!(stderr.contains("Whiteout"), "stderr: {stderr}");

    let names: Vec<String> = read_layer(&out.path().join("layer.tar"))
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert!(names.contains(&"etc/gone".to_string()));
    assert!(names.contains(&"etc/.wh.gone".to_string()));
}
