use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A child cancellation token that also fires after an optional timeout.
///
/// Timeouts and user cancellation travel through the same token, so code under
/// a deadline only ever polls one signal. [`Deadline::timed_out`] tells the two
/// apart afterwards.
#[derive(Debug)]
pub struct Deadline {
    parent: CancellationToken,
    token: CancellationToken,
    timer: Option<JoinHandle<()>>,
}

impl Deadline {
    /// Must be called inside a tokio runtime when `timeout` is set.
    pub fn new(parent: &CancellationToken, timeout: Option<Duration>) -> Self {
        let token = parent.child_token();
        let timer = timeout.map(|limit| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                token.cancel();
            })
        });
        Self {
            parent: parent.clone(),
            token,
            timer,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True when the deadline fired on its own rather than through the parent.
    pub fn timed_out(&self) -> bool {
        self.token.is_cancelled() && !self.parent.is_cancelled()
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_timeout() {
        let parent = CancellationToken::new();
        let deadline = Deadline::new(&parent, Some(Duration::from_secs(5)));
        assert!(!deadline.is_cancelled());

        deadline.token().cancelled().await;
        assert!(deadline.timed_out());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn parent_cancel_is_not_a_timeout() {
        let parent = CancellationToken::new();
        let deadline = Deadline::new(&parent, Some(Duration::from_secs(60)));
        parent.cancel();
        assert!(deadline.is_cancelled());
        assert!(!deadline.timed_out());
    }

    #[tokio::test]
    async fn no_timeout_never_fires() {
        let parent = CancellationToken::new();
        let deadline = Deadline::new(&parent, None);
        tokio::task::yield_now().await;
        assert!(!deadline.is_cancelled());
    }
}
