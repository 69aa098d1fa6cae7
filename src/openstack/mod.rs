//! OpenStack-style implementation of the compute provider.
//!
//! Speaks the classic compute API directly over HTTP: a token-exchange POST
//! against the identity endpoint, then server lifecycle and catalog calls
//! against the compute endpoint resolved from the service catalog. All
//! mutating calls attach the session token; call-specific success sets are
//! enforced per verb (GET 200, POST 200/202, DELETE 204).

mod error;
mod session;
mod types;

use std::net::Ipv4Addr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::compute::{
    ComputeProvider, FlavorInfo, InstanceDetail, InstanceSpec, InstanceStatus, ProviderFuture,
};
use crate::config::CloudConfig;
use types::{
    CreateServerBody, CreateServerRequest, FlavorList, ImageList, NetworkList, NetworkRef,
    RebuildBody, RebuildRequest, ServerEnvelope, ServerList, ServerSummary, ServerWire,
};

pub use error::OpenStackError;
pub use session::{ServiceCatalog, Session, join_url};

const COMPUTE_SERVICE: &str = "compute";

/// cloud-init payload attached to every created instance. Keeps the image's
/// apt sources intact across the provider's first-boot customisation.
const USER_DATA: &str = "#cloud-config\napt_preserve_sources_list: true\n";

/// Control-plane client backed by an authenticated [`Session`].
#[derive(Clone, Debug)]
pub struct OpenStackProvider {
    session: Session,
    admin_pass: String,
    network_label: Option<String>,
    key_name: Option<String>,
}

impl OpenStackProvider {
    /// Authenticates and wires a provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`OpenStackError::Config`] when the configuration fails
    /// validation, or any authentication failure from
    /// [`Session::authenticate`].
    pub async fn connect(config: &CloudConfig) -> Result<Self, OpenStackError> {
        config.validate()?;
        let session = Session::authenticate(config).await?;
        Ok(Self {
            session,
            admin_pass: config.password.clone(),
            network_label: config.network_label.clone(),
            key_name: config.key_name.clone(),
        })
    }

    /// Builds a provider around an already-authenticated session, for
    /// callers that need the service catalog before committing to a
    /// provider (the session stays shared through its internal client).
    #[must_use]
    pub fn with_session(session: Session, admin_pass: String) -> Self {
        Self {
            session,
            admin_pass,
            network_label: None,
            key_name: None,
        }
    }

    fn compute_url(&self, path: &str) -> Result<String, OpenStackError> {
        let endpoint = self.session.catalog().endpoint(COMPUTE_SERVICE).ok_or(
            OpenStackError::MissingService {
                service: String::from(COMPUTE_SERVICE),
            },
        )?;
        Ok(join_url(endpoint, path))
    }

    async fn list_servers(&self) -> Result<Vec<ServerSummary>, OpenStackError> {
        let url = self.compute_url("servers")?;
        let list: ServerList = self.session.get_json(&url).await?;
        Ok(list.servers)
    }

    async fn find_server_id(&self, name: &str) -> Result<Option<String>, OpenStackError> {
        let servers = self.list_servers().await?;
        Ok(servers
            .into_iter()
            .find(|server| server.name == name)
            .map(|server| server.id))
    }

    async fn server_by_id(&self, id: &str) -> Result<Option<ServerWire>, OpenStackError> {
        let url = self.compute_url(&format!("servers/{id}"))?;
        match self.session.get_json::<ServerEnvelope>(&url).await {
            Ok(envelope) => Ok(Some(envelope.server)),
            // The instance can disappear between the listing scan and the
            // detail fetch; absence is data, not an error.
            Err(OpenStackError::Api { status: 404, .. }) => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn server_by_name(&self, name: &str) -> Result<Option<ServerWire>, OpenStackError> {
        let Some(id) = self.find_server_id(name).await? else {
            return Ok(None);
        };
        self.server_by_id(&id).await
    }

    /// Resolves an image label to its provider identifier, or `None` when
    /// the label is absent from the catalog.
    ///
    /// # Errors
    ///
    /// Returns any API or transport failure from the listing call.
    pub async fn image_id(&self, name: &str) -> Result<Option<String>, OpenStackError> {
        let url = self.compute_url("images")?;
        let list: ImageList = self.session.get_json(&url).await?;
        Ok(list
            .images
            .into_iter()
            .find(|image| image.name == name)
            .map(|image| image.id))
    }

    /// Resolves a flavor label to its provider identifier, or `None` when
    /// the label is absent from the catalog.
    ///
    /// # Errors
    ///
    /// Returns any API or transport failure from the listing call.
    pub async fn flavor_id(&self, name: &str) -> Result<Option<String>, OpenStackError> {
        let url = self.compute_url("flavors/detail")?;
        let list: FlavorList = self.session.get_json(&url).await?;
        Ok(list
            .flavors
            .into_iter()
            .find(|flavor| flavor.name == name)
            .map(|flavor| flavor.id))
    }

    /// Resolves a network label to its provider UUID, or `None` when no
    /// network carries the label.
    ///
    /// # Errors
    ///
    /// Returns any API or transport failure from the listing call.
    pub async fn network_uuid(&self, label: &str) -> Result<Option<String>, OpenStackError> {
        let url = self.compute_url("os-networks")?;
        let list: NetworkList = self.session.get_json(&url).await?;
        Ok(list
            .networks
            .into_iter()
            .find(|network| network.label == label)
            .map(|network| network.id))
    }

    async fn build_create_request(
        &self,
        spec: &InstanceSpec,
    ) -> Result<CreateServerRequest, OpenStackError> {
        let image_ref =
            self.image_id(&spec.image)
                .await?
                .ok_or_else(|| OpenStackError::UnknownImage {
                    name: spec.image.clone(),
                })?;
        let flavor_ref =
            self.flavor_id(&spec.flavor)
                .await?
                .ok_or_else(|| OpenStackError::UnknownFlavor {
                    name: spec.flavor.clone(),
                })?;

        let mut networks = Vec::new();
        if let Some(label) = &self.network_label {
            if let Some(uuid) = self.network_uuid(label).await? {
                networks.push(NetworkRef { uuid });
            }
        }

        Ok(CreateServerRequest {
            server: CreateServerBody {
                name: spec.name.clone(),
                image_ref,
                flavor_ref,
                key_name: self.key_name.clone(),
                min_count: spec.count,
                max_count: spec.count,
                networks,
                user_data: BASE64.encode(USER_DATA),
            },
        })
    }
}

fn detail_from_wire(server: ServerWire) -> InstanceDetail {
    let mut addresses: Vec<Ipv4Addr> = Vec::new();
    for entries in server.addresses.values() {
        for address in entries {
            if address.version == 4 {
                if let Ok(parsed) = address.addr.parse() {
                    addresses.push(parsed);
                }
            }
        }
    }

    InstanceDetail {
        id: server.id,
        name: server.name,
        status: InstanceStatus::from(server.status.as_str()),
        image_id: server.image.as_ref().and_then(|image| image.id.clone()),
        flavor_id: server.flavor.as_ref().and_then(|flavor| flavor.id.clone()),
        addresses,
    }
}

fn rebuild_image_ref(server: &ServerWire) -> Option<String> {
    let image = server.image.as_ref()?;
    image
        .links
        .first()
        .map(|link| link.href.clone())
        .or_else(|| image.id.clone())
}

impl ComputeProvider for OpenStackProvider {
    type Error = OpenStackError;

    fn create_instance<'a>(&'a self, spec: &'a InstanceSpec) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            spec.validate()?;
            let request = self.build_create_request(spec).await?;
            let url = self.compute_url("servers")?;
            let _: serde_json::Value = self.session.post_json(&url, &request).await?;
            Ok(())
        })
    }

    fn delete_instance<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, bool, Self::Error> {
        Box::pin(async move {
            let Some(id) = self.find_server_id(name).await? else {
                return Ok(false);
            };
            let url = self.compute_url(&format!("servers/{id}"))?;
            self.session.delete(&url).await?;
            Ok(true)
        })
    }

    fn rebuild_instance<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let server =
                self.server_by_name(name)
                    .await?
                    .ok_or_else(|| OpenStackError::NotFound {
                        name: name.to_owned(),
                    })?;
            let image_ref =
                rebuild_image_ref(&server).ok_or_else(|| OpenStackError::MissingImageRef {
                    name: name.to_owned(),
                })?;

            let request = RebuildRequest {
                rebuild: RebuildBody {
                    name: name.to_owned(),
                    image_ref,
                    admin_pass: self.admin_pass.clone(),
                },
            };
            let url = self.compute_url(&format!("servers/{}/action", server.id))?;
            let _: serde_json::Value = self.session.post_json(&url, &request).await?;
            Ok(())
        })
    }

    fn instance_detail<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<InstanceDetail>, Self::Error> {
        Box::pin(async move {
            let server = self.server_by_name(name).await?;
            Ok(server.map(detail_from_wire))
        })
    }

    fn list_flavors(&self) -> ProviderFuture<'_, Vec<FlavorInfo>, Self::Error> {
        Box::pin(async move {
            let url = self.compute_url("flavors/detail")?;
            let list: FlavorList = self.session.get_json(&url).await?;
            Ok(list
                .flavors
                .into_iter()
                .map(|flavor| FlavorInfo {
                    id: flavor.id,
                    name: flavor.name,
                    ram: flavor.ram,
                })
                .collect())
        })
    }
}
