#![allow(clippy::single_match_else)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

fn binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_campus-covid"))
}

fn temp_path(prefix: &str, extension: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}-{}.{extension}", Ulid::new()))
}

fn cli_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(binary_path());
    command.arg("--db").arg(db_path);
    command.env_remove("CAMPUS_COVID_ATTEMPTS");
    command.env_remove("CAMPUS_COVID_RETRY_DELAY_MS");
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run campus-covid {args:?}: {err}"),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "command failed\nstdout={}\nstderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn write_feed(contents: &str) -> PathBuf {
    let path = temp_path("campus-covid-feed", "json");
    if let Err(err) = std::fs::write(&path, contents) {
        panic!("failed to write feed fixture: {err}");
    }
    path
}

#[test]
fn help_lists_expected_subcommands() {
    let output = match Command::new(binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["catalog", "record", "scrape", "export"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn scrape_run_help_lists_builtin_sources() {
    let output = match Command::new(binary_path())
        .args(["scrape", "run", "--help"])
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run scrape help: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for source in ["babson", "bc", "tufts", "wellesley"] {
        assert!(
            stdout.contains(source),
            "expected scrape help to list source {source}; output={stdout}"
        );
    }
}

#[test]
fn catalog_list_json_covers_all_collections() {
    let db_path = temp_path("campus-covid-catalog", "sqlite3");
    let output = cli_output(&db_path, &["catalog", "list", "--json"]);
    assert_success(&output);

    let entries = stdout_json(&output);
    let entries = match entries.as_array() {
        Some(value) => value.clone(),
        None => panic!("expected array output, got {entries}"),
    };
    assert_eq!(entries.len(), 17);
    assert!(entries.iter().any(|entry| {
        entry["id"] == "boston-college" && entry["children"].as_array().map(Vec::len) == Some(2)
    }));
    assert!(entries.iter().all(|entry| entry["records"] == 0));
}

#[test]
fn record_add_inserts_then_skips_then_replaces() {
    let db_path = temp_path("campus-covid-record-add", "sqlite3");
    let add = |tested: &str| {
        cli_output(
            &db_path,
            &[
                "record",
                "add",
                "--collection",
                "boston-university",
                "--date",
                "2021-01-05",
                "--tested",
                tested,
                "--positive",
                "10",
            ],
        )
    };

    let first = add("100");
    assert_success(&first);
    assert_eq!(stdout_json(&first)["action"], "insert");

    let second = add("100");
    assert_success(&second);
    assert_eq!(stdout_json(&second)["action"], "unchanged");

    let third = add("120");
    assert_success(&third);
    let replaced = stdout_json(&third);
    assert_eq!(replaced["action"], "replace");
    assert_eq!(replaced["previous"]["tested"], 100);
    assert_eq!(replaced["record"]["tested"], 120);

    let conn = match Connection::open(&db_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to open db: {err}"),
    };
    let rows: Vec<(String, i64)> = {
        let mut stmt = match conn.prepare(
            "SELECT date, tested FROM covid_records WHERE collection_id = 'boston-university'",
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to prepare query: {err}"),
        };
        let mapped = match stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?))) {
            Ok(value) => value,
            Err(err) => panic!("failed to query rows: {err}"),
        };
        mapped
            .map(|row| match row {
                Ok(value) => value,
                Err(err) => panic!("failed to read row: {err}"),
            })
            .collect()
    };
    assert_eq!(rows, vec![("2021-01-05".to_string(), 120)]);
}

#[test]
fn unknown_collection_exits_non_zero() {
    let db_path = temp_path("campus-covid-unknown", "sqlite3");
    let output = cli_output(
        &db_path,
        &[
            "record",
            "add",
            "--collection",
            "hogwarts",
            "--date",
            "2021-01-05",
            "--tested",
            "1",
            "--positive",
            "0",
        ],
    );

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("unknown collection: hogwarts"),
        "stderr={stderr}"
    );
}

#[test]
fn weekly_dry_run_previews_without_writing() {
    let db_path = temp_path("campus-covid-weekly", "sqlite3");
    let weekly = |extra: &[&str]| {
        let mut args = vec![
            "record",
            "weekly",
            "--collection",
            "wellesley-college",
            "--date",
            "2021-01-08",
            "--tested",
            "35",
            "--positive",
            "7",
        ];
        args.extend_from_slice(extra);
        cli_output(&db_path, &args)
    };

    let preview = weekly(&["--dry-run"]);
    assert_success(&preview);
    let preview_json = stdout_json(&preview);
    assert_eq!(preview_json["dry_run"], true);
    assert_eq!(preview_json["outcomes"].as_array().map(Vec::len), Some(8));
    assert_eq!(preview_json["outcomes"][0]["kind"], "interpolated");
    assert_eq!(preview_json["outcomes"][7]["kind"], "observed");
    assert_eq!(preview_json["outcomes"][7]["action"], "insert");

    let listed = cli_output(
        &db_path,
        &["record", "list", "--collection", "wellesley-college"],
    );
    assert_success(&listed);
    assert_eq!(stdout_json(&listed).as_array().map(Vec::len), Some(0));

    let applied = weekly(&[]);
    assert_success(&applied);
    let applied_json = stdout_json(&applied);
    assert_eq!(applied_json["dry_run"], false);
    assert_eq!(applied_json["outcomes"][3]["record"]["tested"], 15);
    assert_eq!(applied_json["outcomes"][3]["record"]["positive"], 3);

    let listed = cli_output(
        &db_path,
        &["record", "list", "--collection", "wellesley-college"],
    );
    assert_success(&listed);
    let records = stdout_json(&listed);
    assert_eq!(records.as_array().map(Vec::len), Some(8));
    assert_eq!(records[7]["date"], "2021-01-08");
    assert_eq!(records[7]["tested"], 35);
}

#[test]
fn scrape_run_ingests_feeds_and_reports_json() {
    let db_path = temp_path("campus-covid-scrape", "sqlite3");
    let feed = write_feed(
        r#"[
            {"kind": "cumulative", "collection_id": "tufts-university", "date": "2020-09-14", "tested": 900, "positive": 2},
            {"kind": "cumulative", "collection_id": "tufts-university", "date": "2020-09-15", "tested": 1000, "positive": 2},
            {"kind": "weekly", "collection_id": "wellesley-college", "observed_date": "2020-09-14", "week_tested": 70, "week_positive": 0}
        ]"#,
    );
    let feed_arg = feed.to_string_lossy().to_string();

    let output = cli_output(
        &db_path,
        &[
            "scrape",
            "run",
            "--feed",
            &feed_arg,
            "--retry-delay-ms",
            "0",
            "--json",
        ],
    );
    assert_success(&output);

    let report = stdout_json(&output);
    assert_eq!(report["contract_version"], "run_report.v1");
    assert_eq!(report["all_succeeded"], true);
    assert_eq!(report["sources"].as_array().map(Vec::len), Some(1));
    assert_eq!(report["sources"][0]["status"], "succeeded");
    assert_eq!(report["sources"][0]["observations"], 3);
    assert_eq!(report["sources"][0]["inserted"], 10);

    let again = cli_output(
        &db_path,
        &[
            "scrape",
            "run",
            "--feed",
            &feed_arg,
            "--retry-delay-ms",
            "0",
            "--json",
        ],
    );
    assert_success(&again);
    let report = stdout_json(&again);
    assert_eq!(report["sources"][0]["inserted"], 0);
    assert_eq!(report["sources"][0]["unchanged"], 3);

    let _ = std::fs::remove_file(feed);
}

#[test]
fn scrape_run_failure_exits_non_zero_with_report() {
    let db_path = temp_path("campus-covid-scrape-fail", "sqlite3");
    let missing = temp_path("campus-covid-missing-feed", "json");
    let missing_arg = missing.to_string_lossy().to_string();

    let output = cli_output(
        &db_path,
        &[
            "scrape",
            "run",
            "--feed",
            &missing_arg,
            "--attempts",
            "2",
            "--retry-delay-ms",
            "0",
            "--json",
        ],
    );

    assert!(!output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["all_succeeded"], false);
    assert_eq!(report["sources"][0]["status"], "failed");
    assert_eq!(report["sources"][0]["attempts"], 2);
}
