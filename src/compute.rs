//! Provider-agnostic compute model shared by the provisioning pipeline.

use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;

use thiserror::Error;

/// Desired state for one logical instance group.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceSpec {
    /// Logical base name. Instances are named after it, with a `-{n}` suffix
    /// when more than one is requested.
    pub name: String,
    /// Human readable boot image label. The provider resolves this to a
    /// provider specific image identifier.
    pub image: String,
    /// Flavor (commercial sizing) label, resolved the same way.
    pub flavor: String,
    /// Number of instances to provision. Must be at least one.
    pub count: usize,
}

impl InstanceSpec {
    /// Validates the spec, returning a descriptive error when a required
    /// field is missing or the count is zero.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Validation`] when any string field is empty, or
    /// [`SpecError::ZeroCount`] when `count == 0`.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.name.is_empty() {
            return Err(SpecError::Validation(String::from("name")));
        }
        if self.image.is_empty() {
            return Err(SpecError::Validation(String::from("image")));
        }
        if self.flavor.is_empty() {
            return Err(SpecError::Validation(String::from("flavor")));
        }
        if self.count == 0 {
            return Err(SpecError::ZeroCount);
        }
        Ok(())
    }

    /// Expands the spec into concrete instance names.
    ///
    /// A singleton keeps its bare name; larger groups are suffixed `-1`
    /// through `-N`. Every downstream component relies on this rule, so it
    /// must not change independently of the inventory generator.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        if self.count == 1 {
            vec![self.name.clone()]
        } else {
            (1..=self.count)
                .map(|index| format!("{}-{index}", self.name))
                .collect()
        }
    }

    /// Derives a single-instance request for `name`, keeping the image and
    /// flavor of this spec. Used when recreating one member of a group.
    #[must_use]
    pub fn single(&self, name: &str) -> Self {
        Self {
            name: name.to_owned(),
            image: self.image.clone(),
            flavor: self.flavor.clone(),
            count: 1,
        }
    }
}

/// Errors raised while validating an [`InstanceSpec`].
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SpecError {
    /// Raised when a required field is empty.
    #[error("missing or empty field: {0}")]
    Validation(String),
    /// Raised when the requested count is zero.
    #[error("instance count must be at least one")]
    ZeroCount,
}

/// Lifecycle status reported by the control plane.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstanceStatus {
    /// The instance is still being built.
    Build,
    /// The instance is up and has addresses assigned.
    Active,
    /// The control plane gave up on the instance.
    Error,
    /// Any other provider specific status.
    Other(String),
}

impl From<&str> for InstanceStatus {
    fn from(value: &str) -> Self {
        match value {
            "BUILD" => Self::Build,
            "ACTIVE" => Self::Active,
            "ERROR" => Self::Error,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl InstanceStatus {
    /// Returns `true` when the instance has finished booting.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Point-in-time view of a provisioned instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceDetail {
    /// Provider specific identifier.
    pub id: String,
    /// Instance name as registered with the control plane.
    pub name: String,
    /// Current lifecycle status.
    pub status: InstanceStatus,
    /// Identifier of the image the instance was built from, when reported.
    pub image_id: Option<String>,
    /// Identifier of the flavor the instance runs on, when reported.
    pub flavor_id: Option<String>,
    /// IPv4 addresses assigned so far, in provider order.
    pub addresses: Vec<Ipv4Addr>,
}

impl InstanceDetail {
    /// Returns the first IPv4 address, if any has been assigned yet.
    #[must_use]
    pub fn first_ipv4(&self) -> Option<Ipv4Addr> {
        self.addresses.first().copied()
    }
}

/// Flavor catalog entry used to order sizing requests by RAM.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlavorInfo {
    /// Provider specific identifier.
    pub id: String,
    /// Human readable flavor label.
    pub name: String,
    /// RAM in megabytes; the sole ordering criterion for sizing.
    pub ram: u64,
}

/// Appends the DNS suffix to an instance name, producing the fully qualified
/// name the rest of the pipeline addresses hosts by.
#[must_use]
pub fn fqdn(name: &str, suffix: &str) -> String {
    format!("{name}{suffix}")
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Minimal interface implemented by cloud control-plane clients.
pub trait ComputeProvider {
    /// Provider specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Issues an asynchronous creation request. Returns once the control
    /// plane has accepted the request; the instance boots out of band.
    fn create_instance<'a>(
        &'a self,
        spec: &'a InstanceSpec,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Deletes the named instance if it exists. Returns whether an instance
    /// was found; deleting an absent instance is not an error.
    fn delete_instance<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, bool, Self::Error>;

    /// Re-images the named instance in place using its current image.
    /// Fails when the instance does not exist.
    fn rebuild_instance<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, (), Self::Error>;

    /// Fetches instance details by name, or `None` when the instance is
    /// absent from the listing (the terminal "deleted" signal).
    fn instance_detail<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<InstanceDetail>, Self::Error>;

    /// Lists the flavor catalog.
    fn list_flavors(&self) -> ProviderFuture<'_, Vec<FlavorInfo>, Self::Error>;
}
