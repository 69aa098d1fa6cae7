//! Authenticated session against the control plane.
//!
//! A session is established once per run via a token-exchange POST and owns
//! the resulting bearer token together with the service catalog. Both are
//! immutable afterwards; there is no token refresh.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::CloudConfig;
use crate::openstack::OpenStackError;
use crate::openstack::types::{
    PasswordCredentials, AuthPayload, TokenRequest, TokenResponse, ServiceEntry,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
const TOKEN_HEADER: &str = "X-Auth-Token";

/// Mapping from service type to its base endpoint URL for one region.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServiceCatalog {
    endpoints: BTreeMap<String, String>,
}

impl ServiceCatalog {
    pub(crate) fn from_entries(entries: &[ServiceEntry], region: &str) -> Self {
        let mut endpoints = BTreeMap::new();
        for entry in entries {
            let url = entry
                .endpoints
                .iter()
                .find(|endpoint| endpoint.region == region)
                .map(|endpoint| endpoint.admin_url.clone());
            if let Some(url) = url {
                endpoints.insert(entry.service_type.clone(), url);
            }
        }
        Self { endpoints }
    }

    /// Returns the base endpoint URL for a service type, if the region
    /// offers one.
    #[must_use]
    pub fn endpoint(&self, service: &str) -> Option<&str> {
        self.endpoints.get(service).map(String::as_str)
    }
}

/// Joins an endpoint base with a relative path, tolerating stray slashes on
/// either side.
#[must_use]
pub fn join_url(endpoint: &str, path: &str) -> String {
    format!(
        "{}/{}",
        endpoint.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Authenticated session holding the bearer token and the service catalog.
#[derive(Clone, Debug)]
pub struct Session {
    http: reqwest::Client,
    token: String,
    catalog: ServiceCatalog,
}

impl Session {
    /// Exchanges the configured credentials for a token and resolves the
    /// service catalog for the configured region.
    ///
    /// # Errors
    ///
    /// Returns [`OpenStackError::Api`] when the identity endpoint rejects
    /// the credentials, or [`OpenStackError::Transport`] when it is
    /// unreachable.
    pub async fn authenticate(config: &CloudConfig) -> Result<Self, OpenStackError> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let request = TokenRequest {
            auth: AuthPayload {
                tenant_name: &config.tenant_name,
                password_credentials: PasswordCredentials {
                    username: &config.username,
                    password: &config.password,
                },
            },
        };

        let url = join_url(&config.auth_url, "tokens");
        let response = http.post(&url).json(&request).send().await?;
        let status = response.status();
        if !matches!(status.as_u16(), 200 | 202) {
            return Err(api_error(status.as_u16(), response).await);
        }
        let token_response: TokenResponse = response.json().await?;

        let catalog = ServiceCatalog::from_entries(
            &token_response.access.service_catalog,
            &config.region_name,
        );

        Ok(Self {
            http,
            token: token_response.access.token.id,
            catalog,
        })
    }

    /// Returns the resolved service catalog.
    #[must_use]
    pub const fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    /// Issues an authenticated GET; the only accepted status is 200.
    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, OpenStackError> {
        let response = self
            .http
            .get(url)
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await?;
        let status = response.status();
        if status.as_u16() != 200 {
            return Err(api_error(status.as_u16(), response).await);
        }
        Ok(response.json().await?)
    }

    /// Issues an authenticated POST; accepted statuses are 200 and 202.
    pub(crate) async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &impl Serialize,
    ) -> Result<T, OpenStackError> {
        let response = self
            .http
            .post(url)
            .header(TOKEN_HEADER, &self.token)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !matches!(status.as_u16(), 200 | 202) {
            return Err(api_error(status.as_u16(), response).await);
        }
        Ok(response.json().await?)
    }

    /// Issues an authenticated DELETE; the only accepted status is 204.
    pub(crate) async fn delete(&self, url: &str) -> Result<(), OpenStackError> {
        let response = self
            .http
            .delete(url)
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await?;
        let status = response.status();
        if status.as_u16() != 204 {
            return Err(api_error(status.as_u16(), response).await);
        }
        Ok(())
    }
}

async fn api_error(status: u16, response: reqwest::Response) -> OpenStackError {
    let text = response.text().await.unwrap_or_default();
    let body = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
    OpenStackError::Api { status, body }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openstack::types::ServiceEndpoint;

    fn entry(service_type: &str, pairs: &[(&str, &str)]) -> ServiceEntry {
        ServiceEntry {
            service_type: service_type.to_owned(),
            endpoints: pairs
                .iter()
                .map(|(region, url)| ServiceEndpoint {
                    region: (*region).to_owned(),
                    admin_url: (*url).to_owned(),
                })
                .collect(),
        }
    }

    #[test]
    fn catalog_picks_the_configured_region() {
        let entries = vec![
            entry(
                "compute",
                &[
                    ("dc1", "https://compute.dc1.example.net/v2/t"),
                    ("dc2", "https://compute.dc2.example.net/v2/t"),
                ],
            ),
            entry("identity", &[("dc1", "https://identity.example.net/v2.0")]),
        ];
        let catalog = ServiceCatalog::from_entries(&entries, "dc2");

        assert_eq!(
            catalog.endpoint("compute"),
            Some("https://compute.dc2.example.net/v2/t")
        );
        assert_eq!(catalog.endpoint("identity"), None);
    }

    #[test]
    fn catalog_omits_services_missing_from_the_region() {
        let entries = vec![entry("compute", &[("dc1", "https://compute.example.net")])];
        let catalog = ServiceCatalog::from_entries(&entries, "elsewhere");
        assert_eq!(catalog.endpoint("compute"), None);
    }

    #[test]
    fn join_url_normalises_slashes() {
        assert_eq!(
            join_url("https://example.net/v2/", "/servers"),
            "https://example.net/v2/servers"
        );
        assert_eq!(
            join_url("https://example.net/v2", "servers"),
            "https://example.net/v2/servers"
        );
    }
}
