use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::repositories::WhitelistRepository;

/// Forced disconnect of a broker session.
#[async_trait]
pub trait SessionKicker: Send + Sync {
    async fn kick(&self, client_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    /// Not whitelisted; a kick was dispatched.
    Kicked,
    /// Not whitelisted, but kicked recently enough that no new kick was sent.
    Suppressed,
}

/// Gatekeeper for client traffic.
///
/// Initial connection requests always enroll the client. Every later
/// client message is checked against the whitelist; a miss dispatches a kick
/// and the message must be dropped. Kicks are not remembered unless a
/// cooldown is configured, so each message from a non-whitelisted client
/// kicks again.
pub struct AdmissionController {
    whitelist: Arc<WhitelistRepository>,
    kicker: Arc<dyn SessionKicker>,
    cooldown: Option<Duration>,
    recent_kicks: HashMap<String, Instant>,
}

impl AdmissionController {
    pub fn new(
        whitelist: Arc<WhitelistRepository>,
        kicker: Arc<dyn SessionKicker>,
        cooldown: Option<Duration>,
    ) -> Self {
        Self {
            whitelist,
            kicker,
            cooldown,
            recent_kicks: HashMap::new(),
        }
    }

    /// Enroll a client. Returns `true` when it was not whitelisted before.
    pub fn admit(&mut self, client_id: &str) -> Result<bool> {
        if client_id.is_empty() {
            return Err(AppError::MalformedPayload(
                "empty client identifier".to_string(),
            ));
        }
        let newly = self.whitelist.admit(client_id)?;
        self.recent_kicks.remove(client_id);
        Ok(newly)
    }

    pub fn check(&mut self, client_id: &str) -> Result<Verdict> {
        if self.whitelist.is_admitted(client_id)? {
            return Ok(Verdict::Allowed);
        }

        if let Some(cooldown) = self.cooldown {
            let now = Instant::now();
            self.recent_kicks
                .retain(|_, at| now.duration_since(*at) < cooldown);
            if self.recent_kicks.contains_key(client_id) {
                return Ok(Verdict::Suppressed);
            }
            self.recent_kicks.insert(client_id.to_string(), now);
        }

        warn!(client_id, "client not in whitelist, kicking");
        self.dispatch_kick(client_id);
        Ok(Verdict::Kicked)
    }

    fn dispatch_kick(&self, client_id: &str) {
        let kicker = self.kicker.clone();
        let client_id = client_id.to_string();
        tokio::spawn(async move {
            match kicker.kick(&client_id).await {
                Ok(()) => info!(client_id = %client_id, "client kicked"),
                Err(e) => warn!(client_id = %client_id, error = %e, "kick failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct ChannelKicker(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl SessionKicker for ChannelKicker {
        async fn kick(&self, client_id: &str) -> Result<()> {
            let _ = self.0.send(client_id.to_string());
            Ok(())
        }
    }

    fn controller(
        dir: &std::path::Path,
        cooldown: Option<Duration>,
    ) -> (AdmissionController, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let whitelist = Arc::new(WhitelistRepository::open(dir).unwrap());
        (
            AdmissionController::new(whitelist, Arc::new(ChannelKicker(tx)), cooldown),
            rx,
        )
    }

    async fn next_kick(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<String> {
        timeout(Duration::from_millis(200), rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn test_admitted_client_passes_guard() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctl, mut kicks) = controller(dir.path(), None);

        assert!(ctl.admit("H1").unwrap());
        assert!(!ctl.admit("H1").unwrap());
        assert_eq!(ctl.check("H1").unwrap(), Verdict::Allowed);
        assert_eq!(next_kick(&mut kicks).await, None);
    }

    #[tokio::test]
    async fn test_unknown_client_is_kicked_every_time() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctl, mut kicks) = controller(dir.path(), None);

        assert_eq!(ctl.check("H2").unwrap(), Verdict::Kicked);
        assert_eq!(ctl.check("H2").unwrap(), Verdict::Kicked);
        assert_eq!(next_kick(&mut kicks).await.as_deref(), Some("H2"));
        assert_eq!(next_kick(&mut kicks).await.as_deref(), Some("H2"));
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_repeat_kicks() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctl, mut kicks) = controller(dir.path(), Some(Duration::from_millis(100)));

        assert_eq!(ctl.check("H2").unwrap(), Verdict::Kicked);
        assert_eq!(ctl.check("H2").unwrap(), Verdict::Suppressed);
        assert_eq!(next_kick(&mut kicks).await.as_deref(), Some("H2"));
        assert_eq!(next_kick(&mut kicks).await, None);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(ctl.check("H2").unwrap(), Verdict::Kicked);
        assert_eq!(next_kick(&mut kicks).await.as_deref(), Some("H2"));
    }

    #[tokio::test]
    async fn test_empty_identifier_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctl, _kicks) = controller(dir.path(), None);
        assert!(matches!(ctl.admit(""), Err(AppError::MalformedPayload(_))));
    }
}
