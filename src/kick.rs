use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::warn;

use crate::admission::SessionKicker;
use crate::config::KickConfig;
use crate::error::{AppError, Result};

pub fn from_config(cfg: &KickConfig) -> Result<Arc<dyn SessionKicker>> {
    let kicker: Arc<dyn SessionKicker> = match cfg {
        KickConfig::EmqxApi {
            base_url,
            api_key,
            api_secret,
            timeout_secs,
        } => Arc::new(EmqxApiKicker::new(
            base_url,
            api_key,
            api_secret,
            Duration::from_secs(*timeout_secs),
        )?),
        KickConfig::Command { argv } => Arc::new(CommandKicker::new(argv.clone())?),
        KickConfig::LogOnly => Arc::new(LogOnlyKicker),
    };
    Ok(kicker)
}

/// Kicks through the EMQX v5 management API.
pub struct EmqxApiKicker {
    client: Client,
    base_url: Url,
    api_key: String,
    api_secret: String,
}

impl EmqxApiKicker {
    pub fn new(base_url: &str, api_key: &str, api_secret: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| AppError::Config(format!("invalid kick base_url {base_url:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Config(format!(
                "kick base_url cannot carry a path: {base_url}"
            )));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        })
    }

    fn client_url(&self, client_id: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::Config(format!("kick base_url unusable: {}", self.base_url)))?
            .pop_if_empty()
            .extend(["api", "v5", "clients", client_id]);
        Ok(url)
    }
}

#[async_trait]
impl SessionKicker for EmqxApiKicker {
    async fn kick(&self, client_id: &str) -> Result<()> {
        let url = self.client_url(client_id)?;
        let resp = self
            .client
            .delete(url)
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(AppError::Kick(format!(
                "{client_id} has no session on the broker"
            ))),
            s => Err(AppError::Kick(format!("broker answered {s}"))),
        }
    }
}

/// Kicks by running an external program, e.g. `emqx_ctl` inside the broker
/// container. Any output on stderr counts as failure.
pub struct CommandKicker {
    argv: Vec<String>,
}

impl CommandKicker {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() {
            return Err(AppError::Config("kick command is empty".to_string()));
        }
        Ok(Self { argv })
    }

    fn render(&self, client_id: &str) -> Vec<String> {
        self.argv
            .iter()
            .map(|a| a.replace("{client_id}", client_id))
            .collect()
    }
}

#[async_trait]
impl SessionKicker for CommandKicker {
    async fn kick(&self, client_id: &str) -> Result<()> {
        let argv = self.render(client_id);
        let output = Command::new(&argv[0]).args(&argv[1..]).output().await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() || !stderr.trim().is_empty() {
            return Err(AppError::Kick(format!(
                "{} exited with {}: {}",
                argv[0],
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Records the decision without touching the broker.
pub struct LogOnlyKicker;

#[async_trait]
impl SessionKicker for LogOnlyKicker {
    async fn kick(&self, client_id: &str) -> Result<()> {
        warn!(client_id, "kick requested; log_only mode, broker not contacted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    #[tokio::test]
    async fn test_emqx_kick_deletes_session() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("DELETE", "/api/v5/clients/house%201")
            .match_header("authorization", "Basic a2V5OnNlY3JldA==")
            .with_status(204)
            .create_async()
            .await;

        let kicker =
            EmqxApiKicker::new(&server.url(), "key", "secret", Duration::from_secs(2)).unwrap();
        kicker.kick("house 1").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_emqx_kick_unknown_session() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("DELETE", "/api/v5/clients/H9")
            .with_status(404)
            .create_async()
            .await;

        let kicker =
            EmqxApiKicker::new(&server.url(), "key", "secret", Duration::from_secs(2)).unwrap();
        assert!(matches!(kicker.kick("H9").await, Err(AppError::Kick(_))));
    }

    #[test]
    fn test_command_substitutes_client_id() {
        let kicker = CommandKicker::new(vec![
            "emqx_ctl".into(),
            "clients".into(),
            "kick".into(),
            "{client_id}".into(),
        ])
        .unwrap();
        assert_eq!(kicker.render("H1"), vec!["emqx_ctl", "clients", "kick", "H1"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_exit_status_decides() {
        let ok = CommandKicker::new(vec!["true".into()]).unwrap();
        assert!(ok.kick("H1").await.is_ok());

        let failing = CommandKicker::new(vec!["false".into()]).unwrap();
        assert!(matches!(failing.kick("H1").await, Err(AppError::Kick(_))));
    }

    #[test]
    fn test_from_config_rejects_bad_url() {
        let cfg = KickConfig::EmqxApi {
            base_url: "not a url".into(),
            api_key: "k".into(),
            api_secret: "s".into(),
            timeout_secs: 1,
        };
        assert!(from_config(&cfg).is_err());
    }
}
