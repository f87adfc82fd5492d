//! HTTP agent channel implementation.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use super::{AgentChannel, CancelCommand, ChannelError, InstallCommand};
use crate::config::AgentConfig;
use crate::db::ClientMachine;

/// Talks to the agent's HTTP endpoint on each client machine.
pub struct HttpAgentChannel {
    http: reqwest::Client,
    port: u16,
    timeout: Duration,
    public_url: String,
}

#[derive(Serialize)]
struct InstallBody<'a> {
    #[serde(flatten)]
    command: &'a InstallCommand,
    /// Where the agent posts the install result.
    report_url: String,
}

impl HttpAgentChannel {
    pub fn new(config: &AgentConfig, public_url: &str) -> Result<Self, ChannelError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ChannelError::Network(e.to_string()))?;

        Ok(Self {
            http,
            port: config.port,
            timeout: config.timeout,
            public_url: public_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, client: &ClientMachine, path: &str) -> String {
        let host = if client.ip_address.contains(':') {
            format!("[{}]", client.ip_address)
        } else {
            client.ip_address.clone()
        };
        format!("http://{}:{}/{}", host, self.port, path)
    }

    fn report_url(&self, status_id: i64) -> String {
        format!("{}/api/deployment-status/{}/result/", self.public_url, status_id)
    }

    async fn post<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<(), ChannelError> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChannelError::Timeout(self.timeout)
                } else {
                    ChannelError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let detail = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(ChannelError::Network(format!("agent returned {}: {}", status, detail)))
        } else {
            Err(ChannelError::Rejected(format!("{}: {}", status, detail)))
        }
    }
}

#[async_trait]
impl AgentChannel for HttpAgentChannel {
    async fn install(&self, client: &ClientMachine, command: &InstallCommand) -> Result<(), ChannelError> {
        let body = InstallBody {
            command,
            report_url: self.report_url(command.status_id),
        };
        self.post(&self.endpoint(client, "install"), &body).await
    }

    async fn cancel(&self, client: &ClientMachine, command: &CancelCommand) -> Result<(), ChannelError> {
        self.post(&self.endpoint(client, "cancel"), command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::PackageRef;
    use crate::db::{ClientStatus, OsType};
    use chrono::Utc;

    fn client(ip: &str) -> ClientMachine {
        ClientMachine {
            id: 1,
            hostname: "web-01".to_string(),
            ip_address: ip.to_string(),
            os_type: OsType::Linux,
            os_version: String::new(),
            status: ClientStatus::Online,
            last_seen: Utc::now(),
            registered_at: Utc::now(),
        }
    }

    fn channel() -> HttpAgentChannel {
        let config = AgentConfig {
            port: 8765,
            timeout: Duration::from_millis(200),
        };
        HttpAgentChannel::new(&config, "http://deploy.local/").unwrap()
    }

    #[test]
    fn test_endpoints() {
        let ch = channel();
        assert_eq!(ch.endpoint(&client("10.1.2.3"), "install"), "http://10.1.2.3:8765/install");
        assert_eq!(ch.endpoint(&client("fe80::1"), "cancel"), "http://[fe80::1]:8765/cancel");
        assert_eq!(
            ch.report_url(7),
            "http://deploy.local/api/deployment-status/7/result/"
        );
    }

    #[tokio::test]
    async fn test_install_unreachable_agent() {
        let command = InstallCommand {
            status_id: 1,
            deployment_id: 1,
            package: PackageRef {
                id: 1,
                name: "agent".to_string(),
                version: "1.0".to_string(),
                checksum: String::new(),
                size: 0,
                artifact_ref: String::new(),
            },
        };
        let err = channel()
            .install(&client("256.256.256.256"), &command)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
