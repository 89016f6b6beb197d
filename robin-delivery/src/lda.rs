//! Dovecot LDA subprocess invocation.
//!
//! Spawns `lda_binary -d <recipient> -p <file> [-m <mailbox>]` with stdin
//! detached, a wall-clock timeout that kills on overrun, and an inline retry
//! loop independent of the queue. A non-zero exit records stderr, trimmed to
//! 500 characters, against the recipient.

use std::{path::{Path, PathBuf}, process::Stdio, time::Duration};

use thiserror::Error;
use tokio::process::Command;

use robin_common::config::DovecotConfig;

/// Stderr is abbreviated to this many characters in transaction records.
const STDERR_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum LdaError {
    #[error("unable to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },

    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),

    /// Non-zero exit; the message is the abbreviated stderr.
    #[error("exit code {code}: {stderr}")]
    Failed { code: i32, stderr: String },
}

#[derive(Debug)]
pub struct LdaRunner {
    binary: PathBuf,
    timeout: Duration,
    max_attempts: u32,
    retry_delay: Duration,
}

impl LdaRunner {
    #[must_use]
    pub fn new(config: &DovecotConfig) -> Self {
        Self {
            binary: config.lda_binary.clone(),
            timeout: Duration::from_secs(config.lda_timeout_seconds.max(1)),
            max_attempts: config.inline_save_max_attempts.max(1),
            retry_delay: Duration::from_secs(config.inline_save_retry_delay),
        }
    }

    /// Delivers one file to one recipient, retrying inline up to the
    /// configured attempt count.
    pub async fn deliver(
        &self,
        recipient: &str,
        file: &Path,
        mailbox: Option<&str>,
    ) -> Result<(), LdaError> {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            match self.deliver_once(recipient, file, mailbox).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    tracing::warn!(
                        recipient,
                        attempt,
                        max = self.max_attempts,
                        %error,
                        "LDA delivery attempt failed"
                    );
                    last_error = Some(error);
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(last_error.unwrap_or(LdaError::Timeout(self.timeout)))
    }

    async fn deliver_once(
        &self,
        recipient: &str,
        file: &Path,
        mailbox: Option<&str>,
    ) -> Result<(), LdaError> {
        let mut command = Command::new(&self.binary);
        command
            .arg("-d")
            .arg(recipient)
            .arg("-p")
            .arg(file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(mailbox) = mailbox {
            command.arg("-m").arg(mailbox);
        }

        let child = command.spawn().map_err(|source| LdaError::Spawn {
            binary: self.binary.display().to_string(),
            source,
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| LdaError::Timeout(self.timeout))?
            .map_err(|source| LdaError::Spawn {
                binary: self.binary.display().to_string(),
                source,
            })?;

        if output.status.success() {
            return Ok(());
        }

        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        stderr.truncate(STDERR_LIMIT);

        Err(LdaError::Failed {
            code: output.status.code().unwrap_or(-1),
            stderr,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod test {
    use std::time::Duration;

    use super::{LdaError, LdaRunner};
    use robin_common::config::DovecotConfig;

    fn runner(binary: &str, attempts: u32) -> LdaRunner {
        LdaRunner::new(&DovecotConfig {
            lda_binary: binary.into(),
            inline_save_max_attempts: attempts,
            inline_save_retry_delay: 0,
            ..DovecotConfig::default()
        })
    }

    #[tokio::test]
    async fn zero_exit_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("mail.eml");
        std::fs::write(&file, b"mail").unwrap();

        let runner = runner("/bin/true", 1);
        assert!(runner.deliver("user@ex.com", &file, None).await.is_ok());
    }

    #[tokio::test]
    async fn non_zero_exit_reports_failure_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("mail.eml");
        std::fs::write(&file, b"mail").unwrap();

        let runner = runner("/bin/false", 2);
        let error = runner
            .deliver("user@ex.com", &file, Some("INBOX"))
            .await
            .unwrap_err();

        assert!(matches!(error, LdaError::Failed { code: 1, .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("mail.eml");
        std::fs::write(&file, b"mail").unwrap();

        let runner = runner("/nonexistent/dovecot-lda", 1);
        let error = runner.deliver("user@ex.com", &file, None).await.unwrap_err();
        assert!(matches!(error, LdaError::Spawn { .. }));
    }

    #[tokio::test]
    async fn bad_arguments_fail_without_hanging() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("mail.eml");
        std::fs::write(&file, b"mail").unwrap();

        let mut runner = runner("/bin/cat", 1);
        runner.timeout = Duration::from_millis(500);

        // cat rejects the -d/-p argument shape immediately.
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            runner.deliver("user@ex.com", &file, None),
        )
        .await
        .expect("must not hang");
        assert!(result.is_err());
    }
}
