//! Gateway vs. auxiliary process classification
//!
//! The gateway server and short-lived admin commands share the same binary, so
//! classification works on the shape of the command line rather than the
//! executable alone.

use std::path::Path;

/// Role of a process in the sandbox's process table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessClass {
    /// The long-running gateway server (or its launcher script)
    Gateway,
    /// Anything else: one-shot CLI calls, mirror jobs, shells
    Auxiliary,
}

/// Decides whether a command line is the gateway
pub trait ProcessClassifier: Send + Sync {
    fn classify(&self, command: &str) -> ProcessClass;
}

impl<F> ProcessClassifier for F
where
    F: Fn(&str) -> ProcessClass + Send + Sync,
{
    fn classify(&self, command: &str) -> ProcessClass {
        self(command)
    }
}

/// Flags that always mean a one-shot invocation
const ONE_SHOT_FLAGS: &[&str] = &["--version", "-v", "-V", "--help", "-h"];

/// Gateway sub-actions that talk to a running gateway and exit
const GATEWAY_CLIENT_ACTIONS: &[&str] = &["call", "status", "stop", "health", "probe", "restart"];

/// Default classifier keyed on the launcher script and `<binary> gateway`
#[derive(Debug, Clone)]
pub struct CommandClassifier {
    binary: String,
    start_script: Option<String>,
    gateway_subcommand: String,
}

impl CommandClassifier {
    /// `binary` is the CLI name (e.g. `agentd`), `start_command` the launcher
    pub fn new(binary: impl Into<String>, start_command: &str) -> Self {
        let start_script = start_command
            .split_whitespace()
            .next()
            .and_then(|first| Path::new(first).file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.is_empty());

        Self {
            binary: binary.into(),
            start_script,
            gateway_subcommand: "gateway".to_string(),
        }
    }

    pub fn from_config(config: &crate::config::GatewayConfig) -> Self {
        Self::new(config.binary.clone(), &config.start_command)
    }

    fn is_binary_token(&self, token: &str) -> bool {
        Path::new(token)
            .file_name()
            .map(|name| name.to_string_lossy() == self.binary.as_str())
            .unwrap_or(false)
    }

    fn is_launcher_token(&self, token: &str) -> bool {
        match self.start_script {
            Some(ref script) => Path::new(token)
                .file_name()
                .map(|name| name.to_string_lossy() == script.as_str())
                .unwrap_or(false),
            None => false,
        }
    }
}

impl ProcessClassifier for CommandClassifier {
    fn classify(&self, command: &str) -> ProcessClass {
        let tokens: Vec<&str> = command.split_whitespace().collect();

        if tokens.iter().any(|t| ONE_SHOT_FLAGS.contains(t)) {
            return ProcessClass::Auxiliary;
        }

        // The launcher script only ever starts the server
        if tokens.iter().any(|t| self.is_launcher_token(t)) {
            return ProcessClass::Gateway;
        }

        let Some(bin_pos) = tokens.iter().position(|t| self.is_binary_token(t)) else {
            return ProcessClass::Auxiliary;
        };

        let mut positional = tokens[bin_pos + 1..]
            .iter()
            .filter(|t| !t.starts_with('-'));

        match positional.next() {
            Some(sub) if *sub == self.gateway_subcommand => match positional.next() {
                Some(action) if GATEWAY_CLIENT_ACTIONS.contains(action) => ProcessClass::Auxiliary,
                _ => ProcessClass::Gateway,
            },
            _ => ProcessClass::Auxiliary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> CommandClassifier {
        CommandClassifier::new("agentd", "/usr/local/bin/start-agentd.sh --foreground")
    }

    #[test]
    fn test_classification_table() {
        let table: &[(&str, ProcessClass)] = &[
            // Launchers and servers
            ("/usr/local/bin/start-agentd.sh", ProcessClass::Gateway),
            ("bash /usr/local/bin/start-agentd.sh", ProcessClass::Gateway),
            ("agentd gateway", ProcessClass::Gateway),
            ("agentd gateway --port 18789 --bind lan", ProcessClass::Gateway),
            ("/usr/bin/agentd gateway --allow-unconfigured", ProcessClass::Gateway),
            // One-shot admin commands sharing the binary
            ("agentd --version", ProcessClass::Auxiliary),
            ("agentd gateway --help", ProcessClass::Auxiliary),
            ("agentd gateway call health", ProcessClass::Auxiliary),
            ("agentd gateway status", ProcessClass::Auxiliary),
            ("agentd gateway stop", ProcessClass::Auxiliary),
            ("agentd cron list", ProcessClass::Auxiliary),
            ("agentd cron add --name auto-study --every 6h", ProcessClass::Auxiliary),
            ("agentd devices list --json", ProcessClass::Auxiliary),
            ("agentd config get gateway.port", ProcessClass::Auxiliary),
            ("agentd", ProcessClass::Auxiliary),
            // Unrelated processes
            ("rsync -r --delete /root/.agentd/ /data/backup/agentd/", ProcessClass::Auxiliary),
            ("sh -c cat /root/.agentd/agentd.json", ProcessClass::Auxiliary),
            ("agentd-helper gateway", ProcessClass::Auxiliary),
            ("/usr/bin/other gateway", ProcessClass::Auxiliary),
            ("", ProcessClass::Auxiliary),
        ];

        let classifier = classifier();
        for (command, expected) in table {
            assert_eq!(
                classifier.classify(command),
                *expected,
                "misclassified command: {:?}",
                command
            );
        }
    }

    #[test]
    fn test_launcher_with_version_flag_is_one_shot() {
        assert_eq!(
            classifier().classify("/usr/local/bin/start-agentd.sh --version"),
            ProcessClass::Auxiliary
        );
    }

    #[test]
    fn test_closure_classifier() {
        let only_foo = |cmd: &str| {
            if cmd.contains("foo") {
                ProcessClass::Gateway
            } else {
                ProcessClass::Auxiliary
            }
        };
        assert_eq!(only_foo.classify("run foo"), ProcessClass::Gateway);
        assert_eq!(only_foo.classify("run bar"), ProcessClass::Auxiliary);
    }

    #[test]
    fn test_empty_start_command() {
        let classifier = CommandClassifier::new("agentd", "");
        assert_eq!(classifier.classify("agentd gateway"), ProcessClass::Gateway);
        assert_eq!(classifier.classify("start.sh"), ProcessClass::Auxiliary);
    }
}
