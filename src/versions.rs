//! Latest-tag lookup for the core service images.
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::debug;

use crate::{constants::RELEASE_INDEX_TIMEOUT, error::VersionLookupError};

/// Answers "what is the newest published tag of this component".
pub trait ReleaseIndex {
    fn latest_tag(&self, component: &str) -> Result<String, VersionLookupError>;
}

#[derive(Debug, Deserialize)]
struct LatestRelease {
    tag: String,
}

/// Release index served over HTTP at `<base>/components/<name>/latest`.
pub struct HttpReleaseIndex {
    base_url: String,
    client: Client,
}

impl HttpReleaseIndex {
    pub fn new(base_url: &str) -> Result<Self, VersionLookupError> {
        let client = Client::builder().timeout(RELEASE_INDEX_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn url_for(&self, component: &str) -> String {
        format!("{}/components/{component}/latest", self.base_url)
    }
}

impl ReleaseIndex for HttpReleaseIndex {
    fn latest_tag(&self, component: &str) -> Result<String, VersionLookupError> {
        let url = self.url_for(component);
        debug!("Querying release index: {url}");

        let response = self.client.get(&url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(VersionLookupError::Status(status.as_u16()));
        }

        let body = response.text()?;
        parse_latest(&body)
    }
}

fn parse_latest(body: &str) -> Result<String, VersionLookupError> {
    let release: LatestRelease = serde_json::from_str(body)?;
    Ok(release.tag.trim().to_string())
}
