//! Binary entry point for the fleetrun CLI.

use std::io::{self, Write};
use std::process;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use fleetrun::artifacts::{ARTIFACTS_PATH, ArtifactStore};
use fleetrun::inventory::InventoryError;
use fleetrun::provision::{ProvisionError, SizingPolicy};
use fleetrun::{
    CloudConfig, ComputeProvider, ConfigError, DemandError, Fleet, OpenStackError,
    OpenStackProvider, OrchestrateError, Orchestrator, Provisioner, Reporter,
    StreamingCommandRunner, SuiteError, SuiteParams, TestCase, aggregate_demand, all_passed,
    discover_tests,
};

const EXIT_OK: i32 = 0;
const EXIT_TESTS_FAILED: i32 = 1;
const EXIT_INTERNAL_ERROR: i32 = 3;

#[derive(Debug, Parser)]
#[command(
    name = "fleetrun",
    about = "Provision a cloud fleet and run an integration test suite against it"
)]
#[command(group(clap::ArgGroup::new("fleet_source").required(true).multiple(false)))]
struct Cli {
    /// Directory holding test descriptors (test_*.cfg).
    #[arg(long)]
    configs_dir: String,

    /// JSON file with suite-level parameter overrides.
    #[arg(long)]
    testsuite_params: Option<String>,

    /// Tag selecting which tests to run; repeatable, any overlap qualifies.
    #[arg(long = "tag", required = true)]
    tags: Vec<String>,

    /// Increase log verbosity.
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Emit CI service messages on standard output.
    #[arg(long)]
    teamcity: bool,

    /// SSH user used to connect to the test machines.
    #[arg(long, default_value = "root")]
    user: String,

    /// Directory holding playbooks; generated inventories and group
    /// variable files are written next to them.
    #[arg(long, default_value = "ansible")]
    playbooks_dir: String,

    /// Re-image satisfied instances in place instead of recreating them.
    #[arg(long)]
    rebuild_in_place: bool,

    /// Path to a previously written fleet snapshot.
    #[arg(long, group = "fleet_source")]
    inventory: Option<String>,

    /// Base name for freshly provisioned instances.
    #[arg(long, group = "fleet_source")]
    instance_name: Option<String>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Suite(#[from] SuiteError),
    #[error(transparent)]
    Cloud(#[from] OpenStackError),
    #[error(transparent)]
    Demand(#[from] DemandError),
    #[error("provisioning failed: {0}")]
    Provision(#[from] ProvisionError<OpenStackError>),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Orchestrate(#[from] OrchestrateError),
}

impl CliError {
    /// Setup and teardown failures count as test failures; everything else
    /// is an internal error.
    const fn exit_code(&self) -> i32 {
        match self {
            Self::Orchestrate(
                OrchestrateError::Setup { .. } | OrchestrateError::Teardown { .. },
            ) => EXIT_TESTS_FAILED,
            _ => EXIT_INTERNAL_ERROR,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let teamcity = cli.teamcity;

    let exit_code = match run(cli).await {
        Ok(true) => EXIT_OK,
        Ok(false) => EXIT_TESTS_FAILED,
        Err(err) => {
            report_error(&err);
            err.exit_code()
        }
    };

    if teamcity {
        publish_artifacts().await;
    }

    process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<bool, CliError> {
    let configs_dir = Utf8PathBuf::from(cli.configs_dir);
    let playbooks_dir = Utf8PathBuf::from(cli.playbooks_dir);

    let tests = discover_tests(&configs_dir, &cli.tags)?;
    tracing::info!(count = tests.len(), "discovered tests");
    let suite_params = SuiteParams::load(cli.testsuite_params.as_deref().map(Utf8Path::new))?;

    let fleet = if let Some(path) = &cli.inventory {
        Fleet::load(Utf8Path::new(path))?
    } else {
        let base_name = cli.instance_name.as_deref().unwrap_or(env!("CARGO_PKG_NAME"));
        let policy = if cli.rebuild_in_place {
            SizingPolicy::RebuildInPlace
        } else {
            SizingPolicy::AlwaysRecreate
        };
        let fleet = provision_fleet(base_name, &tests, policy).await?;
        fleet.save(&playbooks_dir.join("fleet.json"))?;
        fleet
    };

    let reporter = Reporter::new(cli.teamcity);
    let orchestrator = Orchestrator::new(
        playbooks_dir,
        fleet,
        StreamingCommandRunner,
        reporter,
        cli.user,
        cli.teamcity,
    );
    orchestrator.prepare_environment(&tests, &suite_params)?;
    let results = orchestrator.run_tests(&tests)?;
    Ok(all_passed(&results))
}

async fn provision_fleet(
    base_name: &str,
    tests: &[TestCase],
    policy: SizingPolicy,
) -> Result<Fleet, CliError> {
    let config = CloudConfig::load_without_cli_args()?;
    config.validate()?;

    let provider = OpenStackProvider::connect(&config).await?;
    let flavors = provider.list_flavors().await?;
    let demand = aggregate_demand(tests, &flavors, base_name, &config.image)?;

    let provisioner = Provisioner::new(provider, config.suffix()).with_policy(policy);
    Ok(provisioner.provision(&demand, &flavors).await?)
}

async fn publish_artifacts() {
    let Some(store) = ArtifactStore::from_env() else {
        return;
    };
    let reporter = Reporter::new(true);
    reporter.block_opened("LOGS: Links");
    for url in store.upload_dir(Utf8Path::new(ARTIFACTS_PATH)).await {
        writeln!(io::stdout(), "{url}").ok();
    }
    reporter.block_closed("LOGS: Links");
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "info" } else { "error" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        writeln!(target, "  caused by: {cause}").ok();
        source = cause.source();
    }
}
