//! Fleet provisioning: demand aggregation and instance reconciliation.
//!
//! The provisioner turns a selected test set into one client spec and one
//! server spec (taking the maximum requirement over the set), reconciles
//! each named instance against the control plane, and then hands the fleet
//! to the availability poller. Only the total server count is reconciled
//! across tests; the per-group partition belongs to each test alone.

use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::sleep;

use crate::availability::{AvailabilityError, AvailabilityPoller, ProvisioningTimeout};
use crate::compute::{ComputeProvider, FlavorInfo, InstanceSpec, fqdn};
use crate::inventory::Fleet;
use crate::suite::TestCase;

const DELETE_TIMEOUT: Duration = Duration::from_secs(120);
const DELETE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How the provisioner treats an instance that already exists.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SizingPolicy {
    /// Delete and recreate every instance, regardless of its current size.
    #[default]
    AlwaysRecreate,
    /// Re-image instances whose current flavor already satisfies the
    /// request instead of recreating them. Opt-in: in-place rebuilds have
    /// proven unreliable on some deployments.
    RebuildInPlace,
}

/// Aggregated instance demand for one run of the suite.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FleetDemand {
    /// Client group spec: maximum flavor and count over the test set.
    pub clients: InstanceSpec,
    /// Server group spec: maximum flavor and maximum per-test total.
    pub servers: InstanceSpec,
}

/// Errors raised while aggregating demand.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum DemandError {
    /// Raised when no tests were selected; there is nothing to size for.
    #[error("cannot size a fleet for an empty test set")]
    EmptySuite,
    /// Raised when a test requires a flavor the provider does not offer.
    #[error("flavor '{name}' not present in the provider catalog")]
    UnknownFlavor {
        /// Flavor label that failed to resolve.
        name: String,
    },
}

/// Errors raised while provisioning.
#[derive(Debug, Error)]
pub enum ProvisionError<E>
where
    E: std::error::Error + 'static,
{
    /// The control plane rejected or failed a lifecycle call.
    #[error("control plane error during provisioning: {0}")]
    Provider(#[source] E),
    /// An instance was still listed after the deletion deadline.
    #[error("instance '{instance}' still present after the deletion deadline")]
    DeleteTimeout {
        /// Instance that refused to disappear.
        instance: String,
    },
    /// An availability check missed its deadline.
    #[error(transparent)]
    Timeout(#[from] ProvisioningTimeout),
}

impl<E> From<AvailabilityError<E>> for ProvisionError<E>
where
    E: std::error::Error + 'static,
{
    fn from(value: AvailabilityError<E>) -> Self {
        match value {
            AvailabilityError::Timeout(timeout) => Self::Timeout(timeout),
            AvailabilityError::Provider(err) => Self::Provider(err),
        }
    }
}

fn flavor_ram(flavors: &[FlavorInfo], name: &str) -> Result<u64, DemandError> {
    flavors
        .iter()
        .find(|flavor| flavor.name == name)
        .map(|flavor| flavor.ram)
        .ok_or_else(|| DemandError::UnknownFlavor {
            name: name.to_owned(),
        })
}

fn max_flavor<'a, I>(flavors: &[FlavorInfo], names: I) -> Result<String, DemandError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(u64, &str)> = None;
    for name in names {
        let ram = flavor_ram(flavors, name)?;
        if best.is_none_or(|(best_ram, _)| ram > best_ram) {
            best = Some((ram, name));
        }
    }
    best.map(|(_, name)| name.to_owned())
        .ok_or(DemandError::EmptySuite)
}

/// Computes the aggregate demand of a test set: the maximum flavor (ordered
/// by RAM) and maximum count required by any test, with the server count
/// taken as the maximum over tests of that test's per-group total.
///
/// # Errors
///
/// Returns [`DemandError::EmptySuite`] for an empty set and
/// [`DemandError::UnknownFlavor`] when a test names a flavor missing from
/// the catalog.
pub fn aggregate_demand(
    tests: &[TestCase],
    flavors: &[FlavorInfo],
    base_name: &str,
    image: &str,
) -> Result<FleetDemand, DemandError> {
    if tests.is_empty() {
        return Err(DemandError::EmptySuite);
    }

    let client_flavor = max_flavor(
        flavors,
        tests
            .iter()
            .map(|test| test.config.env.clients.flavor.as_str()),
    )?;
    let client_count = tests
        .iter()
        .map(|test| test.config.env.clients.count)
        .max()
        .unwrap_or(1);

    let server_flavor = max_flavor(
        flavors,
        tests
            .iter()
            .map(|test| test.config.env.servers.flavor.as_str()),
    )?;
    let server_count = tests
        .iter()
        .map(|test| test.config.env.servers.count_per_group.iter().sum())
        .max()
        .unwrap_or(1);

    Ok(FleetDemand {
        clients: InstanceSpec {
            name: format!("{base_name}-client"),
            image: image.to_owned(),
            flavor: client_flavor,
            count: client_count,
        },
        servers: InstanceSpec {
            name: format!("{base_name}-server"),
            image: image.to_owned(),
            flavor: server_flavor,
            count: server_count,
        },
    })
}

/// Tuning knobs forwarded to the availability poller.
#[derive(Clone, Copy, Debug)]
pub struct AvailabilityTuning {
    /// SSH port probed by the reachability check.
    pub ssh_port: u16,
    /// Inter-attempt delay shared by all checks.
    pub poll_interval: Duration,
    /// Boot-status deadline.
    pub boot_timeout: Duration,
    /// SSH reachability deadline.
    pub ssh_timeout: Duration,
    /// Name-resolution deadline.
    pub dns_timeout: Duration,
}

impl Default for AvailabilityTuning {
    fn default() -> Self {
        Self {
            ssh_port: 22,
            poll_interval: Duration::from_secs(3),
            boot_timeout: Duration::from_secs(300),
            ssh_timeout: Duration::from_secs(60),
            dns_timeout: Duration::from_secs(60),
        }
    }
}

/// Reconciles desired instances against the control plane and waits for the
/// resulting fleet to become usable.
#[derive(Debug)]
pub struct Provisioner<C: ComputeProvider> {
    provider: C,
    policy: SizingPolicy,
    hostname_suffix: String,
    delete_timeout: Duration,
    delete_poll_interval: Duration,
    availability: AvailabilityTuning,
}

impl<C: ComputeProvider> Provisioner<C> {
    /// Creates a provisioner with the default always-recreate policy.
    #[must_use]
    pub fn new(provider: C, hostname_suffix: impl Into<String>) -> Self {
        Self {
            provider,
            policy: SizingPolicy::default(),
            hostname_suffix: hostname_suffix.into(),
            delete_timeout: DELETE_TIMEOUT,
            delete_poll_interval: DELETE_POLL_INTERVAL,
            availability: AvailabilityTuning::default(),
        }
    }

    /// Overrides the sizing policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: SizingPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Overrides the deletion wait knobs.
    ///
    /// This is primarily used by tests to keep timeout scenarios fast.
    #[must_use]
    pub const fn with_delete_wait(mut self, timeout: Duration, interval: Duration) -> Self {
        self.delete_timeout = timeout;
        self.delete_poll_interval = interval;
        self
    }

    /// Overrides the availability tuning.
    #[must_use]
    pub const fn with_availability(mut self, tuning: AvailabilityTuning) -> Self {
        self.availability = tuning;
        self
    }

    /// Provisions the demanded fleet and blocks until it is usable.
    ///
    /// Reconciliation handles the two groups in order (clients, then
    /// servers); creation requests are always single-instance so each name
    /// can be converged independently. A failed availability check fails
    /// provisioning as a whole; the caller must not proceed to test
    /// execution.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when a lifecycle call fails, a deletion
    /// never completes, or an availability check misses its deadline.
    pub async fn provision(
        &self,
        demand: &FleetDemand,
        flavors: &[FlavorInfo],
    ) -> Result<Fleet, ProvisionError<C::Error>> {
        for spec in [&demand.clients, &demand.servers] {
            self.converge_group(spec, flavors).await?;
        }

        let mut names = demand.clients.names();
        names.extend(demand.servers.names());

        let tuning = self.availability;
        let poller = AvailabilityPoller::new(&self.provider, self.hostname_suffix.clone())
            .with_ssh_port(tuning.ssh_port)
            .with_poll_interval(tuning.poll_interval)
            .with_deadlines(tuning.boot_timeout, tuning.ssh_timeout, tuning.dns_timeout);
        poller.await_fleet(&names).await?;

        let suffix = self.hostname_suffix.as_str();
        Ok(Fleet {
            clients: demand
                .clients
                .names()
                .iter()
                .map(|name| fqdn(name, suffix))
                .collect(),
            servers: demand
                .servers
                .names()
                .iter()
                .map(|name| fqdn(name, suffix))
                .collect(),
        })
    }

    async fn converge_group(
        &self,
        spec: &InstanceSpec,
        flavors: &[FlavorInfo],
    ) -> Result<(), ProvisionError<C::Error>> {
        for name in spec.names() {
            if self.policy == SizingPolicy::RebuildInPlace
                && self.satisfied(&name, &spec.flavor, flavors).await?
            {
                tracing::info!(instance = %name, "re-imaging instance in place");
                self.provider
                    .rebuild_instance(&name)
                    .await
                    .map_err(ProvisionError::Provider)?;
                continue;
            }

            tracing::info!(instance = %name, "recreating instance");
            let existed = self
                .provider
                .delete_instance(&name)
                .await
                .map_err(ProvisionError::Provider)?;
            if existed {
                self.wait_until_gone(&name).await?;
            }
            self.provider
                .create_instance(&spec.single(&name))
                .await
                .map_err(ProvisionError::Provider)?;
        }
        Ok(())
    }

    /// Whether the existing instance's flavor has at least the RAM of the
    /// required flavor. Missing instances, unknown flavors, and detail gaps
    /// all count as unsatisfied.
    async fn satisfied(
        &self,
        name: &str,
        required_flavor: &str,
        flavors: &[FlavorInfo],
    ) -> Result<bool, ProvisionError<C::Error>> {
        let Some(detail) = self
            .provider
            .instance_detail(name)
            .await
            .map_err(ProvisionError::Provider)?
        else {
            return Ok(false);
        };

        let current = detail
            .flavor_id
            .as_deref()
            .and_then(|id| flavors.iter().find(|flavor| flavor.id == id))
            .map(|flavor| flavor.ram);
        let required = flavors
            .iter()
            .find(|flavor| flavor.name == required_flavor)
            .map(|flavor| flavor.ram);

        match (current, required) {
            (Some(current), Some(required)) => Ok(current >= required),
            _ => Ok(false),
        }
    }

    async fn wait_until_gone(&self, name: &str) -> Result<(), ProvisionError<C::Error>> {
        let deadline = Instant::now() + self.delete_timeout;
        while Instant::now() <= deadline {
            let detail = self
                .provider
                .instance_detail(name)
                .await
                .map_err(ProvisionError::Provider)?;
            if detail.is_none() {
                return Ok(());
            }
            sleep(self.delete_poll_interval).await;
        }

        Err(ProvisionError::DeleteTimeout {
            instance: name.to_owned(),
        })
    }
}
