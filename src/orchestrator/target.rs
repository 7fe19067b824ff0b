//! Target port: the thing that actually installs instructions on a firewall
//!
//! Implementations must be idempotent. The orchestrator may send the same
//! instruction set more than once (retries, recovery, rollback).

use crate::config::TargetConfig;
use crate::core::compile::Instruction;
use crate::core::error::{ApplyError, TargetErrorPattern};
use crate::core::model::Firewall;
use crate::core::render::instructions_to_json;
use std::future::Future;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub trait ApplyTarget: Send + Sync + 'static {
    /// Installs `instructions` on `firewall`, replacing whatever was there.
    ///
    /// Instructions arrive in delivery order; each carries its final position.
    fn apply_instructions(
        &self,
        firewall: &Firewall,
        instructions: &[Instruction],
    ) -> impl Future<Output = Result<(), ApplyError>> + Send;
}

impl<T: ApplyTarget> ApplyTarget for Arc<T> {
    fn apply_instructions(
        &self,
        firewall: &Firewall,
        instructions: &[Instruction],
    ) -> impl Future<Output = Result<(), ApplyError>> + Send {
        (**self).apply_instructions(firewall, instructions)
    }
}

/// Pipes the rendered nftables JSON into an external program.
///
/// The firewall name and id are exported as `FIREFLOW_FIREWALL` and
/// `FIREFLOW_FIREWALL_ID` so one program can drive several hosts.
#[derive(Debug, Clone)]
pub struct CommandTarget {
    program: String,
    args: Vec<String>,
}

impl CommandTarget {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &TargetConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }
}

impl ApplyTarget for CommandTarget {
    async fn apply_instructions(
        &self,
        firewall: &Firewall,
        instructions: &[Instruction],
    ) -> Result<(), ApplyError> {
        let payload = serde_json::to_string(&instructions_to_json(instructions))
            .map_err(|e| ApplyError::Fatal(format!("Failed to render instructions: {e}")))?;

        info!(
            firewall = %firewall.name,
            instructions = instructions.len(),
            "Applying via {}",
            self.program
        );

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env("FIREFLOW_FIREWALL", &firewall.name)
            .env("FIREFLOW_FIREWALL_ID", firewall.id.to_string())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                // A missing program will not appear by retrying
                if e.kind() == std::io::ErrorKind::NotFound {
                    ApplyError::Fatal(format!("Failed to spawn {}: {e}", self.program))
                } else {
                    ApplyError::Transient(format!("Failed to spawn {}: {e}", self.program))
                }
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.as_bytes())
                .await
                .map_err(|e| ApplyError::Transient(format!("Failed to write to target stdin: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ApplyError::Transient(format!("Failed to wait for target: {e}")))?;

        if output.status.success() {
            debug!(firewall = %firewall.name, "Target accepted instructions");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let errors = parse_target_errors(&stderr);
        let message = if errors.is_empty() {
            format!("target exited with {}", output.status)
        } else {
            errors.join("; ")
        };
        warn!(firewall = %firewall.name, "Target rejected apply: {message}");
        Err(TargetErrorPattern::classify(&message))
    }
}

/// Extracts messages from target stderr, accepting nft's JSON error format.
fn parse_target_errors(stderr: &str) -> Vec<String> {
    if let Ok(json_err) = serde_json::from_str::<serde_json::Value>(stderr)
        && let Some(errors) = json_err.get("errors").and_then(|e| e.as_array())
    {
        return errors
            .iter()
            .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
            .map(String::from)
            .collect();
    }

    stderr
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.trim()
                .trim_start_matches("Error: ")
                .trim_start_matches("nft: ")
                .to_string()
        })
        .collect()
}

/// Logs what would be applied and succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunTarget;

impl ApplyTarget for DryRunTarget {
    async fn apply_instructions(
        &self,
        firewall: &Firewall,
        instructions: &[Instruction],
    ) -> Result<(), ApplyError> {
        info!(
            firewall = %firewall.name,
            instructions = instructions.len(),
            "Dry run: not touching the target"
        );
        for instruction in instructions {
            debug!(
                position = instruction.position,
                action = %instruction.action,
                protocol = %instruction.protocol,
                "Would apply"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compile::compile;
    use crate::core::model::{DefaultAction, Environment, FilteringPolicy};

    fn sample() -> (Firewall, Vec<Instruction>) {
        let fw = Firewall::new("edge", Environment::Development, "");
        let policy = FilteringPolicy::new(fw.id, "p", DefaultAction::Deny);
        let compiled = compile(&policy, 1).unwrap();
        (fw, compiled.instructions)
    }

    #[test]
    fn test_parse_target_errors_plain_text() {
        let errors = parse_target_errors("Error: syntax error, unexpected $end\n\nnft: bad\n");
        assert_eq!(errors, vec!["syntax error, unexpected $end", "bad"]);
    }

    #[test]
    fn test_parse_target_errors_json() {
        let stderr = r#"{"errors":[{"message":"Could not process rule: No such file"}]}"#;
        assert_eq!(
            parse_target_errors(stderr),
            vec!["Could not process rule: No such file"]
        );
    }

    #[tokio::test]
    async fn test_dry_run_succeeds() {
        let (fw, instructions) = sample();
        assert!(DryRunTarget.apply_instructions(&fw, &instructions).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_target_success_and_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("payload.json");
        let target = CommandTarget::new(
            "sh",
            vec!["-c".to_string(), format!("cat > {}", out.display())],
        );
        let (fw, instructions) = sample();
        target.apply_instructions(&fw, &instructions).await.unwrap();

        let payload: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert!(payload["nftables"].is_array());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_target_classifies_stderr() {
        let (fw, instructions) = sample();
        let fatal = CommandTarget::new(
            "sh",
            vec![
                "-c".to_string(),
                "cat >/dev/null; echo 'Error: syntax error' >&2; exit 1".to_string(),
            ],
        );
        assert!(matches!(
            fatal.apply_instructions(&fw, &instructions).await,
            Err(ApplyError::Fatal(_))
        ));

        let transient = CommandTarget::new(
            "sh",
            vec![
                "-c".to_string(),
                "cat >/dev/null; echo 'Device or resource busy' >&2; exit 1".to_string(),
            ],
        );
        assert!(matches!(
            transient.apply_instructions(&fw, &instructions).await,
            Err(ApplyError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_fatal() {
        let (fw, instructions) = sample();
        let target = CommandTarget::new("/nonexistent/fireflow-target", Vec::new());
        assert!(matches!(
            target.apply_instructions(&fw, &instructions).await,
            Err(ApplyError::Fatal(_))
        ));
    }
}
