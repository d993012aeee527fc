//! Typing indicator with a hard lifetime.

use crate::ChannelId;
use crate::error::TransportError;
use crate::messaging::traits::TransportDyn;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Discord shows a typing indicator for ~10s; refresh a little sooner.
const REFRESH_INTERVAL: Duration = Duration::from_secs(8);

/// Keeps the typing indicator alive until stopped, dropped, or the cap runs out.
#[derive(Debug)]
pub struct TypingIndicator {
    handle: JoinHandle<()>,
}

impl TypingIndicator {
    pub fn start(transport: Arc<dyn TransportDyn>, channel_id: ChannelId, cap: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + cap;
            loop {
                match transport.start_typing(channel_id).await {
                    Ok(()) => {}
                    Err(TransportError::PermissionDenied(reason)) => {
                        tracing::debug!(channel_id, %reason, "no permission to show typing");
                        return;
                    }
                    Err(error) => tracing::debug!(channel_id, %error, "typing indicator failed"),
                }

                let next = tokio::time::Instant::now() + REFRESH_INTERVAL;
                if next >= deadline {
                    tracing::debug!(channel_id, "typing indicator reached its cap");
                    return;
                }
                tokio::time::sleep_until(next).await;
            }
        });

        Self { handle }
    }

    pub fn stop(self) {
        // Drop aborts.
    }
}

impl Drop for TypingIndicator {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
