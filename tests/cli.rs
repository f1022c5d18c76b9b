//! Command-line behaviour.

mod common;

use assert_cmd::Command;
use predicates::prelude::*;

fn parenum() -> Command {
    let mut cmd = Command::cargo_bin("parenum").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

const TRIANGLE_NDE: &str = "3\n0 2\n1 2\n2 2\n0 1\n1 2\n0 2\n";

fn graph_file(contents: &str) -> tempfile::NamedTempFile {
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn prints_stats_block() {
    let file = graph_file(TRIANGLE_NDE);
    parenum()
        .arg(file.path())
        .args(["--system", "clique"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Reading time: "))
        .stdout(predicate::str::contains("Solutions found: 1\n"))
        .stdout(predicate::str::contains("Computational tree size: "))
        .stdout(predicate::str::contains("Solutions per ms: "));
}

#[test]
fn prints_items_one_per_line() {
    let file = common::oly_file(4, &[(0, 1), (0, 2), (1, 2), (1, 3), (2, 3)]);
    let output = parenum()
        .arg(file.path())
        .args(["--graph-format", "oly", "--system", "clique", "--print-items", "--quiet"])
        .args(["--enumerator", "parallel", "-n", "3", "--validate"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let mut lines: Vec<&str> = stdout.lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, ["0 1 2", "1 2 3"]);
}

#[test]
fn one_based_oly_input() {
    let file = graph_file("3 2\n1 2\n2 3\n");
    parenum()
        .arg(file.path())
        .args(["--graph-format", "oly", "--one-based", "--k", "2", "--print-items", "--quiet"])
        .assert()
        .success()
        .stdout("0 1 2\n");
}

#[test]
fn settings_from_the_environment() {
    let file = graph_file(TRIANGLE_NDE);
    parenum()
        .arg(file.path())
        .env("PARENUM_SYSTEM", "clique")
        .env("PARENUM_ENUMERATOR", "parallel")
        .env("PARENUM_THREADS", "2")
        .args(["--print-items", "--quiet"])
        .assert()
        .success()
        .stdout("0 1 2\n");
}

#[cfg(feature = "distributed")]
#[test]
fn distributed_in_process_ranks() {
    let file = common::oly_file(4, &[(0, 1), (0, 2), (1, 2), (1, 3), (2, 3)]);
    parenum()
        .arg(file.path())
        .args(["--graph-format", "oly", "--system", "clique"])
        .args(["--enumerator", "distributed", "--ranks", "3", "--chunk-size", "1", "-n", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Solutions found: 2\n"));
}

#[test]
fn missing_file_exits_with_one() {
    parenum()
        .arg("/no/such/graph.nde")
        .assert()
        .code(1)
        .stderr(predicate::str::starts_with("Error: "))
        .stderr(predicate::str::contains("/no/such/graph.nde"));
}

#[test]
fn invalid_value_exits_with_one() {
    let file = graph_file(TRIANGLE_NDE);
    parenum()
        .arg(file.path())
        .args(["--q", "0"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--q"));
}

#[test]
fn usage_error_exits_with_two() {
    parenum().args(["--system", "nonsense", "x"]).assert().code(2);
}

#[test]
fn malformed_graph_reports_the_line() {
    let file = graph_file("2\n0 1\n1 1\n0 x\n");
    parenum()
        .arg(file.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("line 4"));
}
