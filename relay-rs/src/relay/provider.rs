//! Credential resolution and refresh
//!
//! Sources are tried in the usual AWS order:
//! 1. `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` (+ `AWS_SESSION_TOKEN`)
//! 2. the shared credentials/config files, profile `AWS_PROFILE` or `default`
//! 3. the container endpoint (`AWS_CONTAINER_CREDENTIALS_RELATIVE_URI` or
//!    `AWS_CONTAINER_CREDENTIALS_FULL_URI`), as on ECS and EKS
//! 4. the EC2 instance metadata service (IMDSv2), unless
//!    `AWS_EC2_METADATA_DISABLED=true`
//!
//! Remote credentials are cached and fetched again shortly before they expire.

use super::credentials::{AwsCredentials, ProfileFiles};
use super::RelayError;
use crate::error::{RelayRsError, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

const CONTAINER_HOST: &str = "http://169.254.170.2";
const IMDS_ENDPOINT: &str = "http://169.254.169.254";
const IMDS_TOKEN_TTL_SECS: &str = "21600";
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Where credentials come from
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialSource {
    /// Fixed keys (environment or profile)
    Static(AwsCredentials),
    /// Container credentials endpoint
    Container {
        uri: Url,
        authorization: Option<String>,
    },
    /// EC2 instance metadata service
    InstanceMetadata { endpoint: Url },
}

impl CredentialSource {
    /// Resolve from the process environment and home directory
    pub fn resolve() -> Result<Self> {
        Self::resolve_with(|key| std::env::var(key).ok(), dirs::home_dir())
    }

    pub(crate) fn resolve_with<F>(lookup: F, home: Option<PathBuf>) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if non_empty("AWS_ACCESS_KEY_ID").is_some() {
            return AwsCredentials::from_lookup(&lookup).map(CredentialSource::Static);
        }

        let files = ProfileFiles::from_lookup(&lookup, home.as_deref());
        if let Some(credentials) = files.load()? {
            return Ok(CredentialSource::Static(credentials));
        }
        if files.explicit {
            return Err(RelayRsError::Credentials(format!(
                "profile '{}' not found",
                files.profile
            )));
        }

        if let Some(relative) = non_empty("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI") {
            let uri = parse_url(&format!("{}{}", CONTAINER_HOST, relative))?;
            return Ok(CredentialSource::Container {
                uri,
                authorization: None,
            });
        }
        if let Some(full) = non_empty("AWS_CONTAINER_CREDENTIALS_FULL_URI") {
            let authorization = match non_empty("AWS_CONTAINER_AUTHORIZATION_TOKEN_FILE") {
                Some(path) => Some(
                    std::fs::read_to_string(&path)
                        .map_err(|e| {
                            RelayRsError::Credentials(format!("Failed to read {}: {}", path, e))
                        })?
                        .trim()
                        .to_string(),
                ),
                None => non_empty("AWS_CONTAINER_AUTHORIZATION_TOKEN"),
            };
            return Ok(CredentialSource::Container {
                uri: parse_url(&full)?,
                authorization,
            });
        }

        let imds_disabled = non_empty("AWS_EC2_METADATA_DISABLED")
            .map_or(false, |v| v.eq_ignore_ascii_case("true"));
        if imds_disabled {
            return Err(RelayRsError::Credentials(
                "no AWS credentials found in environment, profile, or container".to_string(),
            ));
        }

        let endpoint = non_empty("AWS_EC2_METADATA_SERVICE_ENDPOINT")
            .unwrap_or_else(|| IMDS_ENDPOINT.to_string());
        Ok(CredentialSource::InstanceMetadata {
            endpoint: parse_url(&endpoint)?,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CredentialSource::Static(_) => "static",
            CredentialSource::Container { .. } => "container",
            CredentialSource::InstanceMetadata { .. } => "instance-metadata",
        }
    }
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| RelayRsError::Credentials(format!("Invalid URL '{}': {}", url, e)))
}

/// JSON document served by the container and instance metadata endpoints
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RemoteCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
    expiration: Option<DateTime<Utc>>,
}

impl From<RemoteCredentials> for AwsCredentials {
    fn from(remote: RemoteCredentials) -> Self {
        AwsCredentials {
            access_key_id: remote.access_key_id,
            secret_access_key: remote.secret_access_key,
            session_token: remote.token,
            expires_at: remote.expiration,
        }
    }
}

/// Hands out valid credentials, refreshing temporary ones as needed
pub struct CredentialsProvider {
    source: CredentialSource,
    client: reqwest::Client,
    cached: Mutex<Option<AwsCredentials>>,
}

impl CredentialsProvider {
    pub fn new(source: CredentialSource) -> Self {
        Self {
            source,
            client: reqwest::Client::new(),
            cached: Mutex::new(None),
        }
    }

    /// Provider for the ambient credential chain
    pub fn from_env() -> Result<Self> {
        let source = CredentialSource::resolve()?;
        info!("AWS credentials source: {}", source.kind());
        Ok(Self::new(source))
    }

    pub fn source(&self) -> &CredentialSource {
        &self.source
    }

    /// Current credentials; a failed fetch is a transient relay error
    pub async fn credentials(&self) -> std::result::Result<AwsCredentials, RelayError> {
        if let CredentialSource::Static(ref credentials) = self.source {
            return Ok(credentials.clone());
        }

        let mut cached = self.cached.lock().await;
        if let Some(credentials) = cached.as_ref().filter(|c| c.is_fresh(Utc::now())) {
            return Ok(credentials.clone());
        }

        let fresh = match self.source {
            CredentialSource::Static(ref credentials) => credentials.clone(),
            CredentialSource::Container {
                ref uri,
                ref authorization,
            } => self.fetch_container(uri, authorization.as_deref()).await?,
            CredentialSource::InstanceMetadata { ref endpoint } => self.fetch_imds(endpoint).await?,
        };
        debug!(
            "Fetched {} credentials, expiring {:?}",
            self.source.kind(),
            fresh.expires_at
        );

        *cached = Some(fresh.clone());
        Ok(fresh)
    }

    async fn fetch_container(
        &self,
        uri: &Url,
        authorization: Option<&str>,
    ) -> std::result::Result<AwsCredentials, RelayError> {
        let mut request = self.client.get(uri.clone()).timeout(FETCH_TIMEOUT);
        if let Some(token) = authorization {
            request = request.header("authorization", token);
        }
        let body = read_body(request).await?;
        parse_remote_credentials(&body)
    }

    async fn fetch_imds(&self, endpoint: &Url) -> std::result::Result<AwsCredentials, RelayError> {
        let token = read_body(
            self.client
                .put(imds_url(endpoint, "latest/api/token")?)
                .header("x-aws-ec2-metadata-token-ttl-seconds", IMDS_TOKEN_TTL_SECS)
                .timeout(FETCH_TIMEOUT),
        )
        .await?;

        let roles_url = imds_url(endpoint, "latest/meta-data/iam/security-credentials/")?;
        let roles = read_body(
            self.client
                .get(roles_url.clone())
                .header("x-aws-ec2-metadata-token", token.trim())
                .timeout(FETCH_TIMEOUT),
        )
        .await?;
        let role = roles
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| RelayError::Transport("instance has no IAM role".to_string()))?;

        let body = read_body(
            self.client
                .get(imds_url(&roles_url, role)?)
                .header("x-aws-ec2-metadata-token", token.trim())
                .timeout(FETCH_TIMEOUT),
        )
        .await?;
        parse_remote_credentials(&body)
    }
}

impl From<AwsCredentials> for CredentialsProvider {
    fn from(credentials: AwsCredentials) -> Self {
        Self::new(CredentialSource::Static(credentials))
    }
}

fn imds_url(base: &Url, path: &str) -> std::result::Result<Url, RelayError> {
    base.join(path)
        .map_err(|e| RelayError::Transport(format!("invalid metadata URL: {}", e)))
}

async fn read_body(request: reqwest::RequestBuilder) -> std::result::Result<String, RelayError> {
    let response = request
        .send()
        .await
        .map_err(|e| RelayError::Transport(format!("credentials fetch failed: {}", e)))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| RelayError::Transport(format!("credentials fetch failed: {}", e)))?;

    if !status.is_success() {
        return Err(RelayError::Transport(format!(
            "credentials endpoint returned HTTP {}",
            status
        )));
    }
    Ok(body)
}

fn parse_remote_credentials(body: &str) -> std::result::Result<AwsCredentials, RelayError> {
    serde_json::from_str::<RemoteCredentials>(body)
        .map(AwsCredentials::from)
        .map_err(|e| RelayError::Transport(format!("malformed credentials document: {}", e)))
}
