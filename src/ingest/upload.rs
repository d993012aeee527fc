//! Uploaded-file tracking and the remote processing poll.

use crate::config::LimitsConfig;
use crate::error::LlmError;
use crate::llm::types::{FileState, RemoteFile};

use std::future::Future;
use std::time::Duration;

/// Fixed-interval poll bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl From<&LimitsConfig> for PollPolicy {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            interval: limits.poll_interval,
            max_attempts: limits.max_poll_attempts,
        }
    }
}

/// Terminal result of polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Active,
    Failed,
    TimedOut { attempts: u32 },
}

/// A remote file plus the state observed for it so far.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub remote: RemoteFile,
    state: FileState,
    poll_attempts: u32,
    observed: Vec<FileState>,
}

impl UploadedFile {
    /// Audio and video start out in `Processing`; every other upload is
    /// usable immediately.
    pub fn new(remote: RemoteFile) -> Self {
        let is_media =
            remote.mime_type.starts_with("audio/") || remote.mime_type.starts_with("video/");
        let state = match (is_media, remote.state) {
            (true, FileState::Failed) => FileState::Failed,
            (true, FileState::Active) => FileState::Active,
            (true, _) => FileState::Processing,
            (false, _) => FileState::Active,
        };

        Self {
            remote,
            state,
            poll_attempts: 0,
            observed: vec![state],
        }
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    pub fn poll_attempts(&self) -> u32 {
        self.poll_attempts
    }

    /// Every state this handle has been in, oldest first.
    pub fn observed_states(&self) -> &[FileState] {
        &self.observed
    }

    /// Record a polled state. Regressions and changes after a terminal
    /// state are ignored; returns whether the state advanced.
    pub fn observe(&mut self, state: FileState) -> bool {
        if self.state.is_terminal() || state.rank() < self.state.rank() {
            if state != self.state {
                tracing::debug!(
                    file = %self.remote.name,
                    current = ?self.state,
                    reported = ?state,
                    "ignoring file state regression"
                );
            }
            return false;
        }
        if state == self.state {
            return false;
        }
        self.state = state;
        self.observed.push(state);
        true
    }

    /// Poll until the file is terminal or the attempt budget runs out.
    ///
    /// Status lookup errors count as an attempt and are otherwise ignored.
    pub async fn poll_until_ready<F, Fut>(&mut self, policy: PollPolicy, mut fetch: F) -> PollOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<FileState, LlmError>>,
    {
        loop {
            match self.state {
                FileState::Active => return PollOutcome::Active,
                FileState::Failed => return PollOutcome::Failed,
                FileState::Pending | FileState::Processing => {}
            }

            if self.poll_attempts >= policy.max_attempts {
                return PollOutcome::TimedOut {
                    attempts: self.poll_attempts,
                };
            }

            tokio::time::sleep(policy.interval).await;
            self.poll_attempts += 1;

            match fetch().await {
                Ok(state) => {
                    self.observe(state);
                }
                Err(error) => {
                    tracing::warn!(
                        %error,
                        file = %self.remote.name,
                        attempt = self.poll_attempts,
                        "file status check failed"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn remote(mime_type: &str, state: FileState) -> RemoteFile {
        RemoteFile {
            name: "files/abc".into(),
            uri: "https://files.example/abc".into(),
            mime_type: mime_type.into(),
            state,
        }
    }

    fn policy() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(10),
            max_attempts: 60,
        }
    }

    #[test]
    fn documents_are_active_immediately() {
        let file = UploadedFile::new(remote("application/pdf", FileState::Processing));
        assert_eq!(file.state(), FileState::Active);
    }

    #[test]
    fn media_starts_processing() {
        let file = UploadedFile::new(remote("video/mp4", FileState::Pending));
        assert_eq!(file.state(), FileState::Processing);
    }

    #[test]
    fn state_never_regresses() {
        let mut file = UploadedFile::new(remote("audio/mpeg", FileState::Processing));
        assert!(!file.observe(FileState::Pending));
        assert!(file.observe(FileState::Active));
        assert!(!file.observe(FileState::Processing));
        assert!(!file.observe(FileState::Failed));
        assert_eq!(
            file.observed_states(),
            &[FileState::Processing, FileState::Active]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_active() {
        let mut file = UploadedFile::new(remote("video/mp4", FileState::Processing));
        let mut script = VecDeque::from([
            Ok(FileState::Processing),
            Err(LlmError::ProviderRequest("503".into())),
            Ok(FileState::Pending),
            Ok(FileState::Active),
        ]);

        let started = tokio::time::Instant::now();
        let outcome = file
            .poll_until_ready(policy(), || {
                let next = script.pop_front().unwrap_or(Ok(FileState::Active));
                async move { next }
            })
            .await;

        assert_eq!(outcome, PollOutcome::Active);
        assert_eq!(file.poll_attempts(), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(40));
        assert_eq!(
            file.observed_states(),
            &[FileState::Processing, FileState::Active]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_state_is_terminal() {
        let mut file = UploadedFile::new(remote("audio/wav", FileState::Processing));
        let outcome = file
            .poll_until_ready(policy(), || async { Ok(FileState::Failed) })
            .await;
        assert_eq!(outcome, PollOutcome::Failed);
        assert_eq!(file.poll_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let mut file = UploadedFile::new(remote("video/mp4", FileState::Processing));
        let mut calls = 0u32;

        let outcome = file
            .poll_until_ready(policy(), || {
                calls += 1;
                async { Ok(FileState::Processing) }
            })
            .await;

        assert_eq!(outcome, PollOutcome::TimedOut { attempts: 60 });
        assert_eq!(calls, 60);
    }
}
