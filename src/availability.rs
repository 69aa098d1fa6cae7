//! Deadline-bounded availability checks for a freshly provisioned fleet.
//!
//! Three convergence checks run to completion in a fixed order, each under
//! its own wall-clock deadline: boot status, SSH reachability, and name
//! resolution. Every check drains a work queue from the front and re-queues
//! unconverged items at the back, so retries stay round-robin with a fixed
//! inter-attempt delay rather than backing off.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use crate::compute::{ComputeProvider, fqdn};

const BOOT_TIMEOUT: Duration = Duration::from_secs(300);
const SSH_TIMEOUT: Duration = Duration::from_secs(60);
const DNS_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_secs(3);
const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_SSH_PORT: u16 = 22;

/// The convergence check that missed its deadline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConvergenceCheck {
    /// Waiting for instances to report an active boot status.
    BootStatus,
    /// Waiting for the SSH port to accept TCP connections.
    SshReachable,
    /// Waiting for hostnames to resolve to the addresses the control plane
    /// assigned.
    NameResolution,
}

impl fmt::Display for ConvergenceCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BootStatus => "boot status",
            Self::SshReachable => "ssh reachability",
            Self::NameResolution => "name resolution",
        };
        f.write_str(label)
    }
}

/// A poll loop's deadline elapsed before every item converged.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{check} check missed its deadline; still pending: {}", .pending.join(", "))]
pub struct ProvisioningTimeout {
    /// Which convergence check timed out.
    pub check: ConvergenceCheck,
    /// Items that never converged, in queue order.
    pub pending: Vec<String>,
}

/// Errors raised while waiting for the fleet.
#[derive(Debug, Error)]
pub enum AvailabilityError<E>
where
    E: std::error::Error + 'static,
{
    /// A convergence check missed its deadline.
    #[error(transparent)]
    Timeout(#[from] ProvisioningTimeout),
    /// The control plane failed while the poller was consulting it.
    #[error("control plane error during availability check: {0}")]
    Provider(#[source] E),
}

/// Runs the three convergence checks against a provider.
#[derive(Debug)]
pub struct AvailabilityPoller<'a, C> {
    provider: &'a C,
    hostname_suffix: String,
    ssh_port: u16,
    poll_interval: Duration,
    boot_timeout: Duration,
    ssh_timeout: Duration,
    dns_timeout: Duration,
}

impl<'a, C> AvailabilityPoller<'a, C>
where
    C: ComputeProvider,
{
    /// Creates a poller with production deadlines.
    #[must_use]
    pub fn new(provider: &'a C, hostname_suffix: impl Into<String>) -> Self {
        Self {
            provider,
            hostname_suffix: hostname_suffix.into(),
            ssh_port: DEFAULT_SSH_PORT,
            poll_interval: POLL_INTERVAL,
            boot_timeout: BOOT_TIMEOUT,
            ssh_timeout: SSH_TIMEOUT,
            dns_timeout: DNS_TIMEOUT,
        }
    }

    /// Overrides the SSH port probed by the reachability check.
    #[must_use]
    pub const fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    /// Overrides the inter-attempt delay.
    ///
    /// This is primarily used by tests to keep timeout scenarios fast.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides every check deadline at once.
    ///
    /// This is primarily used by tests to keep timeout scenarios fast.
    #[must_use]
    pub const fn with_deadlines(mut self, boot: Duration, ssh: Duration, dns: Duration) -> Self {
        self.boot_timeout = boot;
        self.ssh_timeout = ssh;
        self.dns_timeout = dns;
        self
    }

    /// Blocks until every named instance is booted, reachable over SSH, and
    /// resolvable to the address the control plane assigned. Returns the
    /// mapping from fully qualified name to IPv4 address.
    ///
    /// Success requires all three checks to converge for every host; any
    /// deadline miss aborts the whole availability step.
    ///
    /// # Errors
    ///
    /// Returns [`AvailabilityError::Timeout`] when a check misses its
    /// deadline, or [`AvailabilityError::Provider`] when the control plane
    /// fails mid-poll.
    pub async fn await_fleet(
        &self,
        names: &[String],
    ) -> Result<BTreeMap<String, Ipv4Addr>, AvailabilityError<C::Error>> {
        tracing::info!("waiting for instances to finish booting");
        let addresses = self.await_boot(names).await?;
        tracing::info!("waiting for instances to accept ssh connections");
        self.await_ssh(&addresses).await?;
        tracing::info!("waiting for hostnames to resolve to their addresses");
        self.await_resolution(&addresses).await?;
        Ok(addresses)
    }

    async fn await_boot(
        &self,
        names: &[String],
    ) -> Result<BTreeMap<String, Ipv4Addr>, AvailabilityError<C::Error>> {
        let deadline = Instant::now() + self.boot_timeout;
        let mut queue: VecDeque<String> = names.iter().cloned().collect();
        let mut addresses = BTreeMap::new();

        while let Some(name) = queue.pop_front() {
            if Instant::now() > deadline {
                queue.push_front(name);
                return Err(timeout_error(ConvergenceCheck::BootStatus, queue));
            }

            let detail = self
                .provider
                .instance_detail(&name)
                .await
                .map_err(AvailabilityError::Provider)?;
            let address = detail
                .filter(|detail| detail.status.is_active())
                .and_then(|detail| detail.first_ipv4());

            // ERROR is treated the same as BUILD here: the instance never
            // converges and trips the deadline instead.
            if let Some(address) = address {
                addresses.insert(fqdn(&name, &self.hostname_suffix), address);
            } else {
                queue.push_back(name);
                sleep(self.poll_interval).await;
            }
        }

        Ok(addresses)
    }

    async fn await_ssh(
        &self,
        addresses: &BTreeMap<String, Ipv4Addr>,
    ) -> Result<(), AvailabilityError<C::Error>> {
        let deadline = Instant::now() + self.ssh_timeout;
        let mut queue: VecDeque<Ipv4Addr> = addresses.values().copied().collect();

        while let Some(address) = queue.pop_front() {
            if Instant::now() > deadline {
                queue.push_front(address);
                let pending = queue.into_iter().map(|ip| ip.to_string()).collect();
                return Err(ProvisioningTimeout {
                    check: ConvergenceCheck::SshReachable,
                    pending,
                }
                .into());
            }

            let connect = timeout(
                SSH_CONNECT_TIMEOUT,
                TcpStream::connect((address, self.ssh_port)),
            )
            .await;
            if !matches!(connect, Ok(Ok(_))) {
                queue.push_back(address);
                sleep(self.poll_interval).await;
            }
        }

        Ok(())
    }

    async fn await_resolution(
        &self,
        addresses: &BTreeMap<String, Ipv4Addr>,
    ) -> Result<(), AvailabilityError<C::Error>> {
        let deadline = Instant::now() + self.dns_timeout;
        let mut queue: VecDeque<(String, Ipv4Addr)> = addresses
            .iter()
            .map(|(host, ip)| (host.clone(), *ip))
            .collect();

        while let Some((host, expected)) = queue.pop_front() {
            if Instant::now() > deadline {
                queue.push_front((host, expected));
                let pending: Vec<String> =
                    queue.into_iter().map(|(pending_host, _)| pending_host).collect();
                return Err(timeout_error(ConvergenceCheck::NameResolution, pending));
            }

            if resolves_to(&host, self.ssh_port, expected).await {
                continue;
            }
            queue.push_back((host, expected));
            sleep(self.poll_interval).await;
        }

        Ok(())
    }
}

async fn resolves_to(host: &str, port: u16, expected: Ipv4Addr) -> bool {
    match tokio::net::lookup_host((host, port)).await {
        Ok(mut resolved) => resolved.any(|addr| addr.ip() == std::net::IpAddr::V4(expected)),
        Err(_) => false,
    }
}

fn timeout_error<E>(
    check: ConvergenceCheck,
    pending: impl IntoIterator<Item = String>,
) -> AvailabilityError<E>
where
    E: std::error::Error + 'static,
{
    ProvisioningTimeout {
        check,
        pending: pending.into_iter().collect(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{
        FlavorInfo, InstanceDetail, InstanceSpec, InstanceStatus, ProviderFuture,
    };
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted provider double: each instance name maps to a queue of
    /// detail snapshots returned in order, the last one repeating.
    #[derive(Default)]
    struct ScriptedProvider {
        details: Mutex<HashMap<String, VecDeque<Option<InstanceDetail>>>>,
    }

    impl ScriptedProvider {
        fn script(name: &str, snapshots: Vec<Option<InstanceDetail>>) -> Self {
            let provider = Self::default();
            provider.add(name, snapshots);
            provider
        }

        fn add(&self, name: &str, snapshots: Vec<Option<InstanceDetail>>) {
            self.details
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(name.to_owned(), snapshots.into_iter().collect());
        }

        fn next_detail(&self, name: &str) -> Option<InstanceDetail> {
            let mut details = self
                .details
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let queue = details.get_mut(name)?;
            if queue.len() > 1 {
                queue.pop_front().flatten()
            } else {
                queue.front().cloned().flatten()
            }
        }
    }

    #[derive(Debug, Error)]
    #[error("scripted provider failure")]
    struct ScriptedError;

    impl ComputeProvider for ScriptedProvider {
        type Error = ScriptedError;

        fn create_instance<'a>(
            &'a self,
            _spec: &'a InstanceSpec,
        ) -> ProviderFuture<'a, (), Self::Error> {
            Box::pin(async { Ok(()) })
        }

        fn delete_instance<'a>(&'a self, _name: &'a str) -> ProviderFuture<'a, bool, Self::Error> {
            Box::pin(async { Ok(false) })
        }

        fn rebuild_instance<'a>(&'a self, _name: &'a str) -> ProviderFuture<'a, (), Self::Error> {
            Box::pin(async { Ok(()) })
        }

        fn instance_detail<'a>(
            &'a self,
            name: &'a str,
        ) -> ProviderFuture<'a, Option<InstanceDetail>, Self::Error> {
            let detail = self.next_detail(name);
            Box::pin(async move { Ok(detail) })
        }

        fn list_flavors(&self) -> ProviderFuture<'_, Vec<FlavorInfo>, Self::Error> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    fn detail(name: &str, status: InstanceStatus, address: Option<Ipv4Addr>) -> InstanceDetail {
        InstanceDetail {
            id: format!("id-{name}"),
            name: name.to_owned(),
            status,
            image_id: None,
            flavor_id: None,
            addresses: address.into_iter().collect(),
        }
    }

    fn fast_poller<C: ComputeProvider>(provider: &C) -> AvailabilityPoller<'_, C> {
        AvailabilityPoller::new(provider, "")
            .with_poll_interval(Duration::from_millis(1))
            .with_deadlines(
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::from_millis(100),
            )
    }

    #[tokio::test]
    async fn boot_check_records_address_once_active() {
        let localhost = Ipv4Addr::new(127, 0, 0, 1);
        let provider = ScriptedProvider::script(
            "node",
            vec![
                Some(detail("node", InstanceStatus::Build, None)),
                Some(detail("node", InstanceStatus::Active, Some(localhost))),
            ],
        );
        let poller = fast_poller(&provider);

        let addresses = poller
            .await_boot(&[String::from("node")])
            .await
            .unwrap_or_else(|err| panic!("boot check should converge: {err}"));
        assert_eq!(addresses.get("node"), Some(&localhost));
    }

    #[tokio::test]
    async fn boot_check_applies_the_hostname_suffix() {
        let localhost = Ipv4Addr::new(127, 0, 0, 1);
        let provider = ScriptedProvider::script(
            "node",
            vec![Some(detail("node", InstanceStatus::Active, Some(localhost)))],
        );
        let poller = AvailabilityPoller::new(&provider, ".ci.example.net")
            .with_poll_interval(Duration::from_millis(1));

        let addresses = poller
            .await_boot(&[String::from("node")])
            .await
            .unwrap_or_else(|err| panic!("boot check should converge: {err}"));
        assert!(addresses.contains_key("node.ci.example.net"));
    }

    #[tokio::test]
    async fn instance_stuck_in_error_trips_the_boot_deadline() {
        let provider = ScriptedProvider::script(
            "node",
            vec![Some(detail("node", InstanceStatus::Error, None))],
        );
        let poller = fast_poller(&provider);

        let err = poller
            .await_boot(&[String::from("node")])
            .await
            .expect_err("stuck instance should time out");
        assert!(
            matches!(
                err,
                AvailabilityError::Timeout(ProvisioningTimeout {
                    check: ConvergenceCheck::BootStatus,
                    ref pending,
                }) if pending == &vec![String::from("node")]
            ),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn ssh_check_succeeds_when_port_listens() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|err| panic!("bind listener: {err}"));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("listener addr: {err}"));
        tokio::spawn(async move { if let Ok((_stream, _peer)) = listener.accept().await {} });

        let provider = ScriptedProvider::default();
        let poller = fast_poller(&provider).with_ssh_port(addr.port());
        let mut addresses = BTreeMap::new();
        addresses.insert(String::from("node"), Ipv4Addr::new(127, 0, 0, 1));

        poller
            .await_ssh(&addresses)
            .await
            .unwrap_or_else(|err| panic!("ssh should be reachable: {err}"));
    }

    #[tokio::test]
    async fn ssh_check_times_out_when_port_closed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|err| panic!("bind listener: {err}"));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("listener addr: {err}"));
        drop(listener);

        let provider = ScriptedProvider::default();
        let poller = fast_poller(&provider).with_ssh_port(addr.port());
        let mut addresses = BTreeMap::new();
        addresses.insert(String::from("node"), Ipv4Addr::new(127, 0, 0, 1));

        let err = poller
            .await_ssh(&addresses)
            .await
            .expect_err("closed port should time out");
        assert!(matches!(
            err,
            AvailabilityError::Timeout(ProvisioningTimeout {
                check: ConvergenceCheck::SshReachable,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn resolution_check_accepts_a_matching_address() {
        let provider = ScriptedProvider::default();
        let poller = fast_poller(&provider);
        let mut addresses = BTreeMap::new();
        addresses.insert(String::from("localhost"), Ipv4Addr::new(127, 0, 0, 1));

        poller
            .await_resolution(&addresses)
            .await
            .unwrap_or_else(|err| panic!("localhost should resolve: {err}"));
    }

    #[tokio::test]
    async fn resolution_check_times_out_on_mismatch() {
        let provider = ScriptedProvider::default();
        let poller = fast_poller(&provider);
        let mut addresses = BTreeMap::new();
        // localhost never resolves to a documentation-range address.
        addresses.insert(String::from("localhost"), Ipv4Addr::new(203, 0, 113, 9));

        let err = poller
            .await_resolution(&addresses)
            .await
            .expect_err("mismatch should time out");
        assert!(matches!(
            err,
            AvailabilityError::Timeout(ProvisioningTimeout {
                check: ConvergenceCheck::NameResolution,
                ..
            })
        ));
    }
}
