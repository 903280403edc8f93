// tests/cli_run.rs

mod common;
use crate::common::init_tracing;

use std::error::Error;
use std::io::Write;

use clap::Parser;
use tempfile::NamedTempFile;

use stagehand::cli::CliArgs;

type TestResult = Result<(), Box<dyn Error>>;

const POD_CONFIG: &str = r#"
[driver]
latency = "1ms"

[pod]
name = "shop"

[container.db]
image = "postgres:16"

[container.api]
image = "shop:api"
depends_on = ["db"]
"#;

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

fn args(file: &NamedTempFile, extra: &[&str]) -> CliArgs {
    let path = file.path().display().to_string();
    let mut argv = vec!["stagehand", "--config", path.as_str(), "--wait", "5s"];
    argv.extend_from_slice(extra);
    CliArgs::try_parse_from(argv).unwrap()
}

#[test]
fn purge_requires_delete() {
    let result = CliArgs::try_parse_from(["stagehand", "--purge"]);
    assert!(result.is_err());

    let parsed = CliArgs::try_parse_from(["stagehand", "--delete", "--purge"]).unwrap();
    assert!(parsed.delete && parsed.purge);
    assert_eq!(parsed.config, "Stagehand.toml");
    assert_eq!(parsed.wait, "5m");
}

#[tokio::test]
async fn dry_run_starts_nothing() -> TestResult {
    init_tracing();
    let file = config_file(POD_CONFIG);

    stagehand::run(args(&file, &["--dry-run"])).await?;
    Ok(())
}

#[tokio::test]
async fn pod_starts_and_is_deleted() -> TestResult {
    init_tracing();
    let file = config_file(POD_CONFIG);

    stagehand::run(args(&file, &["--delete", "--purge"])).await?;
    Ok(())
}

#[tokio::test]
async fn failing_container_makes_the_run_fail() {
    init_tracing();
    let failing = POD_CONFIG.replace("latency = \"1ms\"", "latency = \"1ms\"\nfail = [\"api\"]");
    let file = config_file(&failing);
    let err = stagehand::run(args(&file, &[])).await.unwrap_err();
    assert!(format!("{err:#}").contains("failed to start"), "{err:#}");
}
