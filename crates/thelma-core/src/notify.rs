use crate::error::Result;
use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_direct_message(&self, email: &str, markdown: &str) -> Result<()>;
    async fn send_devops_alert(&self, title: &str, text: &str, ok: bool) -> Result<()>;
}

/// Used when no chat integration is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send_direct_message(&self, email: &str, _markdown: &str) -> Result<()> {
        debug!(%email, "notifications disabled, dropping direct message");
        Ok(())
    }

    async fn send_devops_alert(&self, title: &str, _text: &str, _ok: bool) -> Result<()> {
        debug!(%title, "notifications disabled, dropping devops alert");
        Ok(())
    }
}

/// Send a direct message, logging and discarding any failure.
pub async fn best_effort_dm(notifier: &dyn Notifier, email: &str, markdown: &str) {
    if email.is_empty() {
        debug!("no owner to notify");
        return;
    }
    if let Err(e) = notifier.send_direct_message(email, markdown).await {
        debug!(%email, error = %e, "failed to send direct message");
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

pub fn bee_ready_message(name: &str, url: &str) -> String {
    format!("Your BEE *{name}* is ready to go! :white_check_mark:\n{url}")
}

pub fn bee_failed_message(name: &str, err: &dyn std::fmt::Display) -> String {
    format!("BEE didn't come up properly :x: *{name}*\n```{err}```")
}

pub fn bee_start_stop_message(name: &str, stopped: bool) -> String {
    if stopped {
        format!("Your BEE *{name}* has been stopped :octagonal_sign:")
    } else {
        format!("Your BEE *{name}* has been started :arrow_forward:")
    }
}

pub fn schedule_conflict_message(name: &str) -> String {
    format!(
        "Your BEE *{name}* is scheduled to both start and stop right now, so it was left as is. \
         Please update its offline schedule."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ThelmaError;
    use crate::testing::{CallLog, FakeNotifier};

    #[tokio::test]
    async fn best_effort_swallows_errors_and_skips_ownerless() {
        let log = CallLog::default();
        let n = FakeNotifier::new(log.clone());
        n.failures.inject("notify.dm", ThelmaError::remote("slack", "user not found"));
        best_effort_dm(&n, "jdoe@broadinstitute.org", "hi").await;
        best_effort_dm(&n, "", "hi").await;
        assert_eq!(log.count("notify.dm"), 1);
    }

    #[test]
    fn failure_message_mentions_outcome() {
        let msg = bee_failed_message("my-bee", &"boom");
        assert!(msg.contains("didn't come up properly"));
        assert!(msg.contains("boom"));
    }
}
