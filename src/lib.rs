//! Core library for the fleetrun integration-test orchestrator.
//!
//! The crate provisions a fleet of cloud instances against an
//! OpenStack-style control plane, waits for the fleet to become usable,
//! describes it to the configuration-management collaborator as an
//! inventory, and drives an ordered suite of setup/run/teardown tests
//! against it.

pub mod artifacts;
pub mod availability;
pub mod compute;
pub mod config;
pub mod exec;
pub mod inventory;
pub mod openstack;
pub mod orchestrator;
pub mod playbook;
pub mod provision;
pub mod report;
pub mod suite;

pub use availability::{AvailabilityError, AvailabilityPoller, ConvergenceCheck, ProvisioningTimeout};
pub use compute::{
    ComputeProvider, FlavorInfo, InstanceDetail, InstanceSpec, InstanceStatus, ProviderFuture,
};
pub use config::{CloudConfig, ConfigError};
pub use exec::{CommandOutput, CommandRunner, ProcessCommandRunner, StreamingCommandRunner};
pub use inventory::{Fleet, GroupNames, InventoryDoc, Topology, build_inventory, plan_topology};
pub use openstack::{OpenStackError, OpenStackProvider, ServiceCatalog, Session};
pub use orchestrator::{OrchestrateError, Orchestrator, RunResult, all_passed};
pub use playbook::{PlaybookError, Playbooks};
pub use provision::{
    DemandError, FleetDemand, ProvisionError, Provisioner, SizingPolicy, aggregate_demand,
};
pub use report::Reporter;
pub use suite::{OrderHint, RunKind, RunSpec, SuiteError, SuiteParams, TestCase, discover_tests};
