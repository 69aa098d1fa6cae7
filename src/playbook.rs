//! Invocation of the external configuration-management process.

use std::ffi::OsString;

use camino::Utf8Path;
use thiserror::Error;

use crate::exec::{CommandRunner, ExecError};
use crate::suite::Params;

/// Default configuration-management binary.
pub const DEFAULT_PLAYBOOK_BIN: &str = "ansible-playbook";

/// Errors raised while running a playbook.
#[derive(Debug, Error)]
pub enum PlaybookError {
    /// Raised when the process cannot be started.
    #[error(transparent)]
    Exec(#[from] ExecError),
    /// Raised when the process exits non-zero.
    #[error("playbook {playbook} failed (exit code: {})", .status.map_or_else(|| String::from("killed"), |code| code.to_string()))]
    ExitStatus {
        /// Playbook that failed.
        playbook: String,
        /// Exit status reported by the OS, when there is one.
        status: Option<i32>,
    },
}

/// Runs playbooks against generated inventories.
#[derive(Clone, Debug)]
pub struct Playbooks<R: CommandRunner> {
    bin: String,
    runner: R,
}

impl<R: CommandRunner> Playbooks<R> {
    /// Creates a playbook runner using the default binary.
    #[must_use]
    pub fn new(runner: R) -> Self {
        Self {
            bin: String::from(DEFAULT_PLAYBOOK_BIN),
            runner,
        }
    }

    /// Overrides the configuration-management binary.
    #[must_use]
    pub fn with_bin(mut self, bin: impl Into<String>) -> Self {
        self.bin = bin.into();
        self
    }

    /// Runs `<playbook>.yml` against `inventory`, attaching `extra_vars` as
    /// a JSON document when present. The child's exit status is the sole
    /// pass/fail signal.
    ///
    /// # Errors
    ///
    /// Returns [`PlaybookError::Exec`] when the process cannot be spawned
    /// and [`PlaybookError::ExitStatus`] when it exits non-zero.
    pub fn run(
        &self,
        playbook: &Utf8Path,
        inventory: &Utf8Path,
        extra_vars: Option<&Params>,
    ) -> Result<(), PlaybookError> {
        let args = build_args(playbook, inventory, extra_vars);
        tracing::info!(playbook = %playbook, inventory = %inventory, "running playbook");

        let output = self.runner.run(&self.bin, &args)?;
        if output.is_success() {
            return Ok(());
        }
        Err(PlaybookError::ExitStatus {
            playbook: playbook.to_string(),
            status: output.code,
        })
    }
}

fn build_args(
    playbook: &Utf8Path,
    inventory: &Utf8Path,
    extra_vars: Option<&Params>,
) -> Vec<OsString> {
    let mut args = vec![
        OsString::from("-v"),
        OsString::from("-i"),
        OsString::from(inventory.as_str()),
        OsString::from(format!("{playbook}.yml")),
    ];
    if let Some(vars) = extra_vars {
        args.push(OsString::from("--extra-vars"));
        args.push(OsString::from(
            serde_json::Value::Object(vars.clone()).to_string(),
        ));
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn args_name_the_inventory_and_append_the_extension() {
        let args = build_args(
            &Utf8PathBuf::from("/ansible/setup"),
            &Utf8PathBuf::from("/ansible/write.hosts"),
            None,
        );
        let rendered: Vec<String> = args
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();

        assert_eq!(rendered, vec!["-v", "-i", "/ansible/write.hosts", "/ansible/setup.yml"]);
    }

    #[test]
    fn extra_vars_are_encoded_as_one_json_argument() {
        let mut vars = Params::new();
        vars.insert(String::from("test_name"), serde_json::json!("write"));

        let args = build_args(
            &Utf8PathBuf::from("setup"),
            &Utf8PathBuf::from("write.hosts"),
            Some(&vars),
        );

        let rendered: Vec<String> = args
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(rendered[4], "--extra-vars");
        assert_eq!(rendered[5], r#"{"test_name":"write"}"#);
    }
}
