// Instance metadata service client (session-token protocol)
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

use crate::defaults::{HTTP_TIMEOUT, TOKEN_HEADER, TOKEN_TTL_HEADER, TOKEN_TTL_SECONDS};
use crate::logging::Logger;
use crate::watcher::StopSignalSource;
use crate::{debug, info};

/// Substring of the instance-action document that requests hibernation
const HIBERNATE_MARKER: &str = "hibernate";

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("Request to {url} failed: {reason}")]
    Transport { url: String, reason: String },
    #[error("Cannot read response from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Empty session token from {0}")]
    EmptyToken(String),
}

pub type Result<T> = std::result::Result<T, MetadataError>;

fn request_error(url: &str, err: ureq::Error) -> MetadataError {
    match err {
        ureq::Error::Status(status, _) => MetadataError::Status {
            url: url.to_string(),
            status,
        },
        ureq::Error::Transport(t) => MetadataError::Transport {
            url: url.to_string(),
            reason: t.to_string(),
        },
    }
}

/// Metadata endpoints used by the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub token_url: String,
    pub action_url: String,
    pub hibernation_url: String,
}

pub struct MetadataClient {
    agent: ureq::Agent,
    endpoints: Endpoints,
    log: Logger,
}

impl MetadataClient {
    pub fn new(endpoints: Endpoints, log: Logger) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build();
        Self {
            agent,
            endpoints,
            log,
        }
    }

    /// PUT the token endpoint for a session token
    fn fetch_token(&self) -> Result<String> {
        let url = &self.endpoints.token_url;
        let resp = self
            .agent
            .put(url)
            .set(TOKEN_TTL_HEADER, TOKEN_TTL_SECONDS)
            .call()
            .map_err(|e| request_error(url, e))?;
        let token = resp.into_string().map_err(|source| MetadataError::Body {
            url: url.clone(),
            source,
        })?;
        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(MetadataError::EmptyToken(url.clone()));
        }
        Ok(token)
    }

    fn get(&self, url: &str) -> Result<String> {
        let token = self.fetch_token()?;
        let resp = self
            .agent
            .get(url)
            .set(TOKEN_HEADER, &token)
            .call()
            .map_err(|e| request_error(url, e))?;
        resp.into_string().map_err(|source| MetadataError::Body {
            url: url.to_string(),
            source,
        })
    }

    /// Current instance-action document
    pub fn instance_action(&self) -> Result<String> {
        self.get(&self.endpoints.action_url)
    }

    /// Whether hibernation is already managed by the platform. Any failure
    /// to reach the flag endpoint counts as "not configured".
    pub fn hibernation_configured(&self) -> bool {
        match self.get(&self.endpoints.hibernation_url) {
            Ok(body) => {
                let configured = !body.trim().eq_ignore_ascii_case("false");
                if configured {
                    info!(self.log, "metadata: hibernation configured by platform ({})", body.trim());
                }
                configured
            }
            Err(e) => {
                debug!(self.log, "metadata: hibernation flag unavailable: {}", e);
                false
            }
        }
    }
}

impl StopSignalSource for MetadataClient {
    /// Fail-open: every request or status error is "no signal" for this tick
    fn stop_requested(&self) -> bool {
        match self.instance_action() {
            Ok(body) => body.contains(HIBERNATE_MARKER),
            Err(e) => {
                debug!(self.log, "metadata: no stop signal ({})", e);
                false
            }
        }
    }
}
