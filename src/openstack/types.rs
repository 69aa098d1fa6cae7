//! Wire types for the OpenStack-style compute and identity APIs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// --- identity ---

#[derive(Debug, Serialize)]
pub(crate) struct TokenRequest<'a> {
    pub auth: AuthPayload<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AuthPayload<'a> {
    #[serde(rename = "tenantName")]
    pub tenant_name: &'a str,
    #[serde(rename = "passwordCredentials")]
    pub password_credentials: PasswordCredentials<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct PasswordCredentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access: Access,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Access {
    pub token: Token,
    #[serde(rename = "serviceCatalog", default)]
    pub service_catalog: Vec<ServiceEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Token {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServiceEntry {
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub endpoints: Vec<ServiceEndpoint>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServiceEndpoint {
    pub region: String,
    #[serde(rename = "adminURL")]
    pub admin_url: String,
}

// --- compute: servers ---

#[derive(Debug, Deserialize)]
pub(crate) struct ServerList {
    pub servers: Vec<ServerSummary>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerEnvelope {
    pub server: ServerWire,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerWire {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub addresses: HashMap<String, Vec<AddressWire>>,
    pub image: Option<ResourceRef>,
    pub flavor: Option<ResourceRef>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AddressWire {
    pub addr: String,
    pub version: u8,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResourceRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Link {
    pub href: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateServerRequest {
    pub server: CreateServerBody,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateServerBody {
    pub name: String,
    #[serde(rename = "imageRef")]
    pub image_ref: String,
    #[serde(rename = "flavorRef")]
    pub flavor_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    pub min_count: usize,
    pub max_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<NetworkRef>,
    pub user_data: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct NetworkRef {
    pub uuid: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct RebuildRequest {
    pub rebuild: RebuildBody,
}

#[derive(Debug, Serialize)]
pub(crate) struct RebuildBody {
    pub name: String,
    #[serde(rename = "imageRef")]
    pub image_ref: String,
    #[serde(rename = "adminPass")]
    pub admin_pass: String,
}

// --- compute: catalogs ---

#[derive(Debug, Deserialize)]
pub(crate) struct FlavorList {
    pub flavors: Vec<FlavorWire>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FlavorWire {
    pub id: String,
    pub name: String,
    pub ram: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImageList {
    pub images: Vec<ImageWire>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImageWire {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NetworkList {
    pub networks: Vec<NetworkWire>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NetworkWire {
    pub id: String,
    pub label: String,
}
