//! Job registry access
//!
//! The gateway exposes its scheduler only through its CLI, which prints free
//! text. `CliJobRegistry` adapts that to the [`JobRegistry`] trait; tests use
//! structured fakes instead.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tether_host_interface::SandboxHost;
use tracing::{debug, warn};

use super::CronSpec;
use crate::config::CronConfig;
use crate::error::{Result, TetherError};
use crate::shell;

/// Scheduled jobs as the gateway knows them
#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Names of every registered job
    async fn list(&self) -> Result<Vec<String>>;

    async fn add(&self, spec: &CronSpec) -> Result<()>;

    /// Register several jobs; one failure does not stop the rest
    async fn add_batch(&self, specs: &[CronSpec]) -> Result<()> {
        let mut last_err = None;
        for spec in specs {
            if let Err(e) = self.add(spec).await {
                warn!(job = %spec.name, error = %e, "Job registration failed");
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Bulk-restore from a last-known-good snapshot. `Ok(false)` if none exists.
    async fn restore_snapshot(&self) -> Result<bool> {
        Ok(false)
    }
}

/// Registry driven through `<binary> cron ...` on the sandbox host
pub struct CliJobRegistry {
    host: Arc<dyn SandboxHost>,
    binary: String,
    snapshot_path: PathBuf,
    store_path: PathBuf,
    timeout: Duration,
}

impl CliJobRegistry {
    pub fn new(host: Arc<dyn SandboxHost>, binary: impl Into<String>, config: &CronConfig) -> Self {
        Self {
            host,
            binary: binary.into(),
            snapshot_path: config.snapshot_path.clone(),
            store_path: config.store_path.clone(),
            timeout: config.exec_timeout(),
        }
    }

    fn add_command(&self, spec: &CronSpec) -> String {
        let mut command = format!(
            "{} cron add --name {} --every {} --message {}",
            shell::quote(&self.binary),
            shell::quote(&spec.name),
            shell::quote(&spec.interval),
            shell::quote(&spec.message),
        );
        if let Some(ref model) = spec.model {
            command.push_str(" --model ");
            command.push_str(&shell::quote(model));
        }
        command
    }

    async fn run(&self, command: &str) -> Result<String> {
        let output = self.host.exec(command, self.timeout).await?;
        if let Some(code) = output.exit_code.filter(|c| *c != 0) {
            return Err(TetherError::Registry(format!(
                "`{}` exited with {}: {}",
                command,
                code,
                output.combined()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl JobRegistry for CliJobRegistry {
    async fn list(&self) -> Result<Vec<String>> {
        let command = format!("{} cron list", shell::quote(&self.binary));
        let stdout = self.run(&command).await?;
        let names = parse_job_names(&stdout);
        debug!(count = names.len(), "Listed scheduled jobs");
        Ok(names)
    }

    async fn add(&self, spec: &CronSpec) -> Result<()> {
        self.run(&self.add_command(spec)).await.map(|_| ())
    }

    async fn add_batch(&self, specs: &[CronSpec]) -> Result<()> {
        if specs.is_empty() {
            return Ok(());
        }
        let command = shell::chain_best_effort(specs.iter().map(|s| self.add_command(s)));
        self.run(&command).await.map(|_| ())
    }

    async fn restore_snapshot(&self) -> Result<bool> {
        if !self.host.exists(&self.snapshot_path).await {
            debug!(snapshot = %self.snapshot_path.display(), "No job snapshot to restore");
            return Ok(false);
        }

        let mut steps = Vec::new();
        if let Some(parent) = self.store_path.parent() {
            steps.push(format!("mkdir -p {}", shell::quote_path(parent, false)));
        }
        steps.push(format!(
            "cp {} {}",
            shell::quote_path(&self.snapshot_path, false),
            shell::quote_path(&self.store_path, false)
        ));
        self.run(&shell::chain_strict(steps)).await?;
        Ok(true)
    }
}

#[derive(Deserialize)]
struct JsonJob {
    name: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonListing {
    Bare(Vec<JsonJob>),
    Wrapped { jobs: Vec<JsonJob> },
}

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*•|]\s*)?([A-Za-z0-9][A-Za-z0-9_.:-]*)").unwrap());

static EMPTY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(no\s+(cron\s+|scheduled\s+)?jobs|0\s+jobs|none\b)").unwrap()
});

/// Column headers and captions that are never job names
const HEADER_WORDS: &[&str] = &["name", "id", "jobs", "job", "cron", "schedule", "total"];

/// Pull job names out of `cron list` output
///
/// Accepts a JSON listing (`[{"name":..}]` or `{"jobs":[..]}`) or one job per
/// line with the name as the first token.
pub fn parse_job_names(output: &str) -> Vec<String> {
    if let Ok(listing) = serde_json::from_str::<JsonListing>(output.trim()) {
        let jobs = match listing {
            JsonListing::Bare(jobs) | JsonListing::Wrapped { jobs } => jobs,
        };
        return dedup(jobs.into_iter().map(|j| j.name));
    }

    let names = output.lines().filter_map(|line| {
        if line.trim().is_empty() || EMPTY_PATTERN.is_match(line) {
            return None;
        }
        let token = NAME_PATTERN.captures(line)?.get(1)?.as_str();
        let bare = token.trim_end_matches(':');
        if bare.is_empty() || HEADER_WORDS.contains(&bare.to_ascii_lowercase().as_str()) {
            return None;
        }
        Some(bare.to_string())
    });
    dedup(names)
}

fn dedup(names: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = Vec::new();
    for name in names {
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::MockHost;
    use tether_host_interface::ExecOutput;

    #[test]
    fn test_parse_plain_lines() {
        let out = "other-job every 6h\nauto-study every 12h model=small\n";
        assert_eq!(parse_job_names(out), vec!["other-job", "auto-study"]);
    }

    #[test]
    fn test_parse_table_with_header_and_bullets() {
        let out = "NAME        EVERY   MODEL\n----------------------\n- daily-digest  24h  small\n• inbox.sweep   1h\n";
        assert_eq!(parse_job_names(out), vec!["daily-digest", "inbox.sweep"]);
    }

    #[test]
    fn test_parse_empty_listings() {
        assert!(parse_job_names("").is_empty());
        assert!(parse_job_names("No jobs scheduled.\n").is_empty());
        assert!(parse_job_names("no cron jobs\n").is_empty());
        assert!(parse_job_names("Jobs:\n").is_empty());
    }

    #[test]
    fn test_parse_json() {
        assert_eq!(
            parse_job_names(r#"[{"name":"a","every":"1h"},{"name":"b"}]"#),
            vec!["a", "b"]
        );
        assert_eq!(parse_job_names(r#"{"jobs":[{"name":"c"}]}"#), vec!["c"]);
    }

    #[test]
    fn test_parse_dedups() {
        assert_eq!(parse_job_names("a 1h\na 2h\n"), vec!["a"]);
    }

    fn registry(host: &Arc<MockHost>) -> CliJobRegistry {
        CliJobRegistry::new(host.clone(), "agentd", &CronConfig::default())
    }

    fn spec(name: &str, message: &str) -> CronSpec {
        CronSpec {
            name: name.to_string(),
            interval: "6h".to_string(),
            message: message.to_string(),
            model: Some("small".to_string()),
        }
    }

    #[tokio::test]
    async fn test_cli_add_batch_is_one_exec() {
        let host = Arc::new(MockHost::new());
        let reg = registry(&host);

        reg.add_batch(&[spec("a", "do it's thing"), spec("b", "$(whoami)")])
            .await
            .unwrap();

        let executed = host.executed();
        assert_eq!(executed.len(), 1);
        assert!(executed[0].contains("agentd cron add --name a --every 6h"));
        assert!(executed[0].contains("; agentd cron add --name b"));
        assert!(executed[0].contains("'$(whoami)'"));
        assert!(executed[0].contains("--model small"));
    }

    #[tokio::test]
    async fn test_cli_list_failure_is_registry_error() {
        let host = Arc::new(MockHost::new());
        host.on_exec(|_| ExecOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "gateway not reachable".to_string(),
        });

        let err = registry(&host).list().await.unwrap_err();
        assert!(matches!(err, TetherError::Registry(_)));
    }

    #[tokio::test]
    async fn test_cli_restore_snapshot() {
        let host = Arc::new(MockHost::new());
        let reg = registry(&host);
        assert!(!reg.restore_snapshot().await.unwrap());
        assert!(host.executed().is_empty());

        host.add_file("/data/backup/agentd/cron/jobs.json", "[]");
        assert!(reg.restore_snapshot().await.unwrap());
        assert_eq!(
            host.executed(),
            vec![
                "mkdir -p /root/.agentd/cron && cp /data/backup/agentd/cron/jobs.json /root/.agentd/cron/jobs.json"
                    .to_string()
            ]
        );
    }
}
