use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://locate.measurementlab.net/";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocateError {
    #[error("no available servers")]
    NoAvailableServers,

    #[error("locate query failed with status {0}")]
    QueryFailed(u16),
}

/// Finds an NDT5 server to measure against. The client consults this once at
///  startup, unless a server FQDN was pinned.
#[async_trait]
pub trait ServerLocator: Sync + Send {
    async fn locate(&self) -> anyhow::Result<String>;
}

/// Locator backed by the M-Lab locate service: an HTTP GET of
///  `<base-url><service>` answered with a JSON document carrying the chosen
///  server's FQDN. A 204 means the service has no server to offer right now.
pub struct MlabLocator {
    base_url: Url,
    service: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct LocateReply {
    fqdn: String,
}

impl MlabLocator {
    pub fn new(base_url: &str, service: &str, user_agent: &str) -> anyhow::Result<MlabLocator> {
        let base_url: Url = base_url
            .parse()
            .with_context(|| format!("invalid locate base URL: {}", base_url))?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(user_agent)
            .build()
            .context("building locate HTTP client")?;
        Ok(MlabLocator {
            base_url,
            service: service.to_string(),
            http,
        })
    }
}

#[async_trait]
impl ServerLocator for MlabLocator {
    async fn locate(&self) -> anyhow::Result<String> {
        let url = self
            .base_url
            .join(&self.service)
            .context("composing locate URL")?;
        debug!("querying locate service at {}", url);
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("querying {}", url))?;
        match response.status() {
            StatusCode::NO_CONTENT => bail!(LocateError::NoAvailableServers),
            StatusCode::OK => {}
            status => bail!(LocateError::QueryFailed(status.as_u16())),
        }
        let reply: LocateReply = response
            .json()
            .await
            .context("parsing locate service reply")?;
        if reply.fqdn.is_empty() {
            bail!("locate service returned an empty fqdn");
        }
        debug!("locate service chose {}", reply.fqdn);
        Ok(reply.fqdn)
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_new_rejects_invalid_base_url() {
        assert!(MlabLocator::new("\t", "ndt_ssl", "testing/0.1.0").is_err());
    }

    #[rstest]
    fn test_new_accepts_default_base_url() {
        MlabLocator::new(DEFAULT_BASE_URL, "ndt_ssl", "testing/0.1.0").unwrap();
    }

    #[rstest]
    fn test_service_url_composition() {
        let locator = MlabLocator::new(DEFAULT_BASE_URL, "ndt_ssl", "testing/0.1.0").unwrap();
        let url = locator.base_url.join(&locator.service).unwrap();
        assert_eq!(url.as_str(), "https://locate.measurementlab.net/ndt_ssl");
    }

    #[rstest]
    fn test_reply_parsing() {
        let reply: LocateReply =
            serde_json::from_str(r#"{"fqdn":"ndt.iupui.mlab1.mil02.measurement-lab.org"}"#)
                .unwrap();
        assert_eq!(reply.fqdn, "ndt.iupui.mlab1.mil02.measurement-lab.org");
    }
}
