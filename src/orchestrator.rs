//! Test orchestration: environment preparation and the per-test
//! setup → execute → teardown state machine.
//!
//! Tests run strictly sequentially, one test fully resolved before the next
//! begins. A failed execute is recorded and the suite continues; a failed
//! setup or teardown aborts the whole run, because after either the shared
//! fleet state can no longer be trusted.

use std::ffi::OsString;
use std::fs;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::exec::{CommandRunner, ExecError};
use crate::inventory::{
    Fleet, GroupNames, InventoryError, TEST_ALIAS, build_inventory, plan_topology,
    write_group_vars,
};
use crate::playbook::{PlaybookError, Playbooks};
use crate::report::Reporter;
use crate::suite::{Params, RunKind, RunSpec, SuiteParams, TestCase, merge_optional_params,
    merge_params};

/// Playbook (and inventory stem) used to prepare the whole fleet before any
/// test executes.
pub const FLEET_PREPARE_PLAYBOOK: &str = "fleet-prepare";

/// Group-name stem used for the whole-fleet inventory.
const FLEET_GROUP_STEM: &str = "setup";

/// Default external test-runner binary.
pub const DEFAULT_TEST_RUNNER_BIN: &str = "pytest";

/// Outcome of one run of one test. Never mutated after creation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunResult {
    /// Test the run belongs to.
    pub test: String,
    /// Index of the run within the test's declaration order.
    pub run_index: usize,
    /// Whether the run passed.
    pub passed: bool,
    /// Failure detail for failed runs.
    pub detail: Option<String>,
}

/// Errors that abort orchestration.
#[derive(Debug, Error)]
pub enum OrchestrateError {
    /// A test's setup procedure failed; the remaining suite is aborted.
    #[error("setup for test '{test}' failed: {source}")]
    Setup {
        /// Test whose setup failed.
        test: String,
        /// Underlying playbook failure.
        #[source]
        source: PlaybookError,
    },
    /// A test's teardown procedure failed; the remaining suite is aborted.
    #[error("teardown for test '{test}' failed: {source}")]
    Teardown {
        /// Test whose teardown failed.
        test: String,
        /// Underlying playbook failure.
        #[source]
        source: PlaybookError,
    },
    /// Environment preparation failed before any test ran.
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    /// The whole-fleet prepare playbook failed.
    #[error("fleet preparation failed: {0}")]
    Prepare(#[from] PlaybookError),
    /// The external test runner could not be started.
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Drives the test pipeline against a provisioned fleet.
#[derive(Clone, Debug)]
pub struct Orchestrator<R: CommandRunner + Clone> {
    playbooks_dir: Utf8PathBuf,
    fleet: Fleet,
    playbooks: Playbooks<R>,
    runner: R,
    reporter: Reporter,
    ssh_user: String,
    test_runner_bin: String,
    teamcity: bool,
}

impl<R: CommandRunner + Clone> Orchestrator<R> {
    /// Creates an orchestrator over the given fleet and process runner.
    #[must_use]
    pub fn new(
        playbooks_dir: Utf8PathBuf,
        fleet: Fleet,
        runner: R,
        reporter: Reporter,
        ssh_user: impl Into<String>,
        teamcity: bool,
    ) -> Self {
        Self {
            playbooks_dir,
            fleet,
            playbooks: Playbooks::new(runner.clone()),
            runner,
            reporter,
            ssh_user: ssh_user.into(),
            test_runner_bin: String::from(DEFAULT_TEST_RUNNER_BIN),
            teamcity,
        }
    }

    /// Overrides the external test-runner binary.
    #[must_use]
    pub fn with_test_runner_bin(mut self, bin: impl Into<String>) -> Self {
        self.test_runner_bin = bin.into();
        self
    }

    /// Overrides the configuration-management binary.
    #[must_use]
    pub fn with_playbook_bin(mut self, bin: impl Into<String>) -> Self {
        self.playbooks = Playbooks::new(self.runner.clone()).with_bin(bin);
        self
    }

    fn inventory_path(&self, name: &str) -> Utf8PathBuf {
        self.playbooks_dir.join(format!("{name}.hosts"))
    }

    fn vars_path(&self, group: &str) -> Utf8PathBuf {
        self.playbooks_dir.join(format!("group_vars/{group}.json"))
    }

    fn playbook_path(&self, name: &str) -> Utf8PathBuf {
        self.playbooks_dir.join(name)
    }

    /// Writes every inventory and variable file, then runs the whole-fleet
    /// prepare playbook. All files are written before any test executes so
    /// a mid-suite failure never leaves a test without its environment
    /// description.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestrateError::Inventory`] when planning or writing
    /// fails and [`OrchestrateError::Prepare`] when the prepare playbook
    /// fails.
    pub fn prepare_environment(
        &self,
        tests: &[TestCase],
        suite_params: &SuiteParams,
    ) -> Result<(), OrchestrateError> {
        const BLOCK: &str = "PREPARE TEST ENVIRONMENT";
        self.reporter.block_opened(BLOCK);
        let result = self.prepare_inner(tests, suite_params);
        self.reporter.block_closed(BLOCK);
        result
    }

    fn prepare_inner(
        &self,
        tests: &[TestCase],
        suite_params: &SuiteParams,
    ) -> Result<(), OrchestrateError> {
        let group_vars_dir = self.playbooks_dir.join("group_vars");
        fs::create_dir_all(&group_vars_dir).map_err(|err| InventoryError::Io {
            path: group_vars_dir.clone(),
            message: err.to_string(),
        })?;

        if let Some(global) = suite_params.global() {
            write_group_vars(&self.vars_path(TEST_ALIAS), global)?;
        }

        for test in tests {
            let env = &test.config.env;
            let groups = GroupNames::for_test(&test.name);
            let topology = plan_topology(
                env.clients.count,
                &env.servers.count_per_group,
                &self.fleet,
            )?;
            build_inventory(&topology, &groups, &self.ssh_user)
                .write(&self.inventory_path(&test.name))?;

            let params =
                merge_optional_params(&test.config.params, suite_params.for_test(&test.name));
            write_group_vars(&self.vars_path(&groups.test), &params)?;
        }

        self.prepare_fleet()?;
        Ok(())
    }

    /// The prepare playbook treats the entire fleet as one server group.
    fn prepare_fleet(&self) -> Result<(), OrchestrateError> {
        let groups = GroupNames::for_test(FLEET_GROUP_STEM);
        let topology = plan_topology(
            self.fleet.clients.len(),
            &[self.fleet.servers.len()],
            &self.fleet,
        )?;
        let inventory = self.inventory_path(FLEET_PREPARE_PLAYBOOK);
        build_inventory(&topology, &groups, &self.ssh_user).write(&inventory)?;

        self.playbooks
            .run(&self.playbook_path(FLEET_PREPARE_PLAYBOOK), &inventory, None)?;
        Ok(())
    }

    /// Runs every test in order and aggregates per-run results.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestrateError::Setup`] or [`OrchestrateError::Teardown`]
    /// when a fixed phase fails (aborting the remaining suite), and
    /// [`OrchestrateError::Exec`] when an external process cannot be
    /// started at all.
    pub fn run_tests(&self, tests: &[TestCase]) -> Result<Vec<RunResult>, OrchestrateError> {
        let mut results = Vec::new();
        for test in tests {
            for (run_index, run) in test.config.runs.iter().enumerate() {
                results.push(self.run_one(test, run_index, run)?);
            }
        }
        Ok(results)
    }

    fn run_one(
        &self,
        test: &TestCase,
        run_index: usize,
        run: &RunSpec,
    ) -> Result<RunResult, OrchestrateError> {
        let block = format!("TEST: {}", run.name);
        self.reporter.block_opened(&block);
        tracing::info!(
            test = %test.name,
            run = %run.name,
            description = %run.description,
            clients = test.config.env.clients.count,
            server_groups = ?test.config.env.servers.count_per_group,
            "running test"
        );

        let mut extra = merge_params(&test.config.params, &run.params);
        extra.insert(
            String::from("test_name"),
            serde_json::Value::String(run.name.clone()),
        );

        if let Err(err) = self.run_fixed_phase(test, &test.config.env.setup_playbook, &extra) {
            let record = format!("{}_setup", test.name);
            self.reporter
                .test_failed(&record, &err.to_string(), &format!("{err:?}"));
            self.reporter.block_closed(&block);
            return Err(OrchestrateError::Setup {
                test: test.name.clone(),
                source: err,
            });
        }

        self.reporter.test_started(&run.name);
        let (passed, detail) = self.execute_run(test, run, &extra)?;
        if !passed {
            self.reporter.test_failed(
                &run.name,
                detail.as_deref().unwrap_or("test run failed"),
                "",
            );
        }
        self.reporter.test_finished(&run.name);

        if let Err(err) = self.run_fixed_phase(test, &test.config.env.teardown_playbook, &extra) {
            let record = format!("{}_teardown", test.name);
            self.reporter
                .test_failed(&record, &err.to_string(), &format!("{err:?}"));
            self.reporter.block_closed(&block);
            return Err(OrchestrateError::Teardown {
                test: test.name.clone(),
                source: err,
            });
        }

        self.reporter.block_closed(&block);
        Ok(RunResult {
            test: test.name.clone(),
            run_index,
            passed,
            detail,
        })
    }

    fn run_fixed_phase(
        &self,
        test: &TestCase,
        playbook: &str,
        extra: &Params,
    ) -> Result<(), PlaybookError> {
        self.playbooks.run(
            &self.playbook_path(playbook),
            &self.inventory_path(&test.name),
            Some(extra),
        )
    }

    fn execute_run(
        &self,
        test: &TestCase,
        run: &RunSpec,
        extra: &Params,
    ) -> Result<(bool, Option<String>), OrchestrateError> {
        match &run.kind {
            RunKind::Playbook { playbook } => {
                match self.playbooks.run(
                    &self.playbook_path(playbook),
                    &self.inventory_path(&test.name),
                    Some(extra),
                ) {
                    Ok(()) => Ok((true, None)),
                    Err(err @ PlaybookError::ExitStatus { .. }) => {
                        tracing::error!(test = %test.name, run = %run.name, "{err}");
                        Ok((false, Some(err.to_string())))
                    }
                    Err(PlaybookError::Exec(err)) => Err(err.into()),
                }
            }
            RunKind::RemoteTest { target, options } => {
                self.execute_remote_test(test, target, options)
            }
        }
    }

    /// Dispatches the external test runner once per selected client host,
    /// sequentially; the run fails when the runner fails on any host.
    fn execute_remote_test(
        &self,
        test: &TestCase,
        target: &str,
        options: &[String],
    ) -> Result<(bool, Option<String>), OrchestrateError> {
        let mut passed = true;
        let mut detail = None;

        let selected = self
            .fleet
            .clients
            .iter()
            .take(test.config.env.clients.count);
        for host in selected {
            let args = self.remote_test_args(host, target, options);
            tracing::info!(host = %host, target = %target, "dispatching remote test run");

            let output = self.runner.run(&self.test_runner_bin, &args)?;
            if !output.is_success() {
                passed = false;
                let status = output
                    .code
                    .map_or_else(|| String::from("killed"), |code| code.to_string());
                detail = Some(format!("test runner failed on {host} (exit code: {status})"));
            }
        }

        Ok((passed, detail))
    }

    fn remote_test_args(&self, host: &str, target: &str, options: &[String]) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        if self.teamcity {
            args.push(OsString::from("--teamcity"));
        }
        args.extend(options.iter().map(OsString::from));
        args.push(OsString::from("-d"));
        args.push(OsString::from("--tx"));
        args.push(OsString::from(format!("ssh={host} -l {} -q", self.ssh_user)));
        args.push(OsString::from(target));
        args
    }
}

/// Returns `true` when every recorded run passed.
#[must_use]
pub fn all_passed(results: &[RunResult]) -> bool {
    results.iter().all(|result| result.passed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::{ClientsEnv, OrderHint, ServersEnv, TestConfig, TestEnv};
    use std::sync::{Arc, Mutex};

    /// Runner double: records invocations, fails any whose argument list
    /// contains a configured marker.
    #[derive(Clone, Default)]
    struct FakeRunner {
        state: Arc<Mutex<RunnerState>>,
    }

    #[derive(Default)]
    struct RunnerState {
        calls: Vec<(String, Vec<String>)>,
        fail_markers: Vec<String>,
    }

    impl FakeRunner {
        fn fail_on(&self, marker: &str) {
            self.state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .fail_markers
                .push(marker.to_owned());
        }

        fn calls(&self) -> Vec<(String, Vec<String>)> {
            self.state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .calls
                .clone()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(
            &self,
            program: &str,
            args: &[OsString],
        ) -> Result<crate::exec::CommandOutput, ExecError> {
            let rendered: Vec<String> = args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect();
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state.calls.push((program.to_owned(), rendered.clone()));
            let failed = state
                .fail_markers
                .iter()
                .any(|marker| rendered.iter().any(|arg| arg.contains(marker.as_str())));
            Ok(crate::exec::CommandOutput {
                code: Some(i32::from(failed)),
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    fn fleet() -> Fleet {
        Fleet {
            clients: vec![
                String::from("c-1.net"),
                String::from("c-2.net"),
                String::from("c-3.net"),
            ],
            servers: vec![String::from("s-1.net"), String::from("s-2.net")],
        }
    }

    fn playbook_test(name: &str, playbook: &str) -> TestCase {
        TestCase {
            name: name.to_owned(),
            config: TestConfig {
                tags: vec![String::from("t")],
                order: OrderHint::None,
                params: Params::new(),
                env: TestEnv {
                    clients: ClientsEnv {
                        count: 1,
                        flavor: String::from("m1.small"),
                    },
                    servers: ServersEnv {
                        count_per_group: vec![1],
                        flavor: String::from("m1.small"),
                    },
                    setup_playbook: format!("{name}-setup"),
                    teardown_playbook: format!("{name}-teardown"),
                },
                runs: vec![RunSpec {
                    name: format!("{name}-run"),
                    description: String::new(),
                    kind: RunKind::Playbook {
                        playbook: playbook.to_owned(),
                    },
                    params: Params::new(),
                }],
            },
        }
    }

    fn remote_test(name: &str, clients: usize) -> TestCase {
        let mut test = playbook_test(name, "unused");
        test.config.env.clients.count = clients;
        test.config.runs = vec![RunSpec {
            name: format!("{name}-run"),
            description: String::new(),
            kind: RunKind::RemoteTest {
                target: String::from("smoke/"),
                options: vec![String::from("--timeout=60")],
            },
            params: Params::new(),
        }];
        test
    }

    fn orchestrator(runner: &FakeRunner) -> Orchestrator<FakeRunner> {
        Orchestrator::new(
            Utf8PathBuf::from("/ansible"),
            fleet(),
            runner.clone(),
            Reporter::new(false),
            "root",
            false,
        )
    }

    #[test]
    fn failed_playbook_run_is_recorded_and_the_suite_continues() {
        let runner = FakeRunner::default();
        runner.fail_on("broken.yml");
        let orchestrator = orchestrator(&runner);
        let tests = vec![
            playbook_test("first", "broken"),
            playbook_test("second", "healthy"),
        ];

        let results = orchestrator
            .run_tests(&tests)
            .unwrap_or_else(|err| panic!("suite should continue: {err}"));

        assert_eq!(results.len(), 2);
        assert!(!results[0].passed);
        assert!(results[0].detail.is_some());
        assert!(results[1].passed);
        assert!(!all_passed(&results));

        // Teardown ran for the failed test before the suite moved on.
        let calls = runner.calls();
        assert!(calls.iter().any(|(_, args)| args
            .iter()
            .any(|arg| arg.ends_with("first-teardown.yml"))));
    }

    #[test]
    fn setup_failure_aborts_before_execute_and_teardown() {
        let runner = FakeRunner::default();
        runner.fail_on("only-setup.yml");
        let orchestrator = orchestrator(&runner);
        let tests = vec![
            playbook_test("only", "payload"),
            playbook_test("never", "payload"),
        ];

        let err = orchestrator
            .run_tests(&tests)
            .expect_err("setup failure should abort");
        assert!(
            matches!(err, OrchestrateError::Setup { ref test, .. } if test == "only"),
            "unexpected error: {err}"
        );

        let calls = runner.calls();
        let invoked: Vec<&str> = calls
            .iter()
            .flat_map(|(_, args)| args.iter())
            .map(String::as_str)
            .collect();
        assert!(
            !invoked.iter().any(|arg| arg.ends_with("payload.yml")),
            "execute must not run after a failed setup"
        );
        assert!(
            !invoked.iter().any(|arg| arg.ends_with("only-teardown.yml")),
            "teardown must not run after a failed setup"
        );
        assert!(
            !invoked.iter().any(|arg| arg.contains("never")),
            "later tests must not run after a failed setup"
        );
    }

    #[test]
    fn teardown_failure_aborts_the_remaining_suite() {
        let runner = FakeRunner::default();
        runner.fail_on("one-teardown.yml");
        let orchestrator = orchestrator(&runner);
        let tests = vec![
            playbook_test("one", "payload"),
            playbook_test("two", "payload"),
        ];

        let err = orchestrator
            .run_tests(&tests)
            .expect_err("teardown failure should abort");
        assert!(matches!(
            err,
            OrchestrateError::Teardown { ref test, .. } if test == "one"
        ));

        let calls = runner.calls();
        assert!(
            !calls
                .iter()
                .any(|(_, args)| args.iter().any(|arg| arg.contains("two"))),
            "later tests must not run after a failed teardown"
        );
    }

    #[test]
    fn remote_test_runs_once_per_selected_client() {
        let runner = FakeRunner::default();
        let orchestrator = orchestrator(&runner);
        let tests = vec![remote_test("dist", 2)];

        let results = orchestrator
            .run_tests(&tests)
            .unwrap_or_else(|err| panic!("run: {err}"));
        assert!(results[0].passed);

        let remote_calls: Vec<Vec<String>> = runner
            .calls()
            .into_iter()
            .filter(|(program, _)| program == "pytest")
            .map(|(_, args)| args)
            .collect();
        assert_eq!(remote_calls.len(), 2, "one dispatch per selected client");
        assert!(remote_calls[0].contains(&String::from("ssh=c-1.net -l root -q")));
        assert!(remote_calls[1].contains(&String::from("ssh=c-2.net -l root -q")));
        assert!(remote_calls[0].contains(&String::from("--timeout=60")));
        assert_eq!(remote_calls[0].last(), Some(&String::from("smoke/")));
    }

    #[test]
    fn remote_test_fails_when_any_host_fails() {
        let runner = FakeRunner::default();
        runner.fail_on("ssh=c-2.net");
        let orchestrator = orchestrator(&runner);
        let tests = vec![remote_test("dist", 3)];

        let results = orchestrator
            .run_tests(&tests)
            .unwrap_or_else(|err| panic!("run: {err}"));

        assert!(!results[0].passed);
        let detail = results[0].detail.as_deref().unwrap_or_default();
        assert!(detail.contains("c-2.net"), "detail names the host: {detail}");

        // All three selected hosts were still attempted.
        let dispatches = runner
            .calls()
            .into_iter()
            .filter(|(program, _)| program == "pytest")
            .count();
        assert_eq!(dispatches, 3);
    }

    #[test]
    fn prepare_writes_every_environment_file_before_running_the_playbook() {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let playbooks_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non-utf8 temp path: {}", path.display()));

        let runner = FakeRunner::default();
        let orchestrator = Orchestrator::new(
            playbooks_dir.clone(),
            fleet(),
            runner.clone(),
            Reporter::new(false),
            "qa",
            false,
        );

        let mut test = playbook_test("write", "payload");
        test.config
            .params
            .insert(String::from("retries"), serde_json::json!(1));
        let suite_params: SuiteParams =
            serde_json::from_str(r#"{"_global": {"zone": "a"}, "write": {"retries": 5}}"#)
                .unwrap_or_else(|err| panic!("decode: {err}"));

        orchestrator
            .prepare_environment(&[test], &suite_params)
            .unwrap_or_else(|err| panic!("prepare: {err}"));

        let inventory = fs::read_to_string(playbooks_dir.join("write.hosts"))
            .unwrap_or_else(|err| panic!("read inventory: {err}"));
        assert!(inventory.contains("[clients-write]\nc-1.net ansible_ssh_user=qa"));

        let vars = fs::read_to_string(playbooks_dir.join("group_vars/test-write.json"))
            .unwrap_or_else(|err| panic!("read vars: {err}"));
        assert!(vars.contains(r#""retries":5"#), "suite override wins: {vars}");

        let global = fs::read_to_string(playbooks_dir.join("group_vars/test.json"))
            .unwrap_or_else(|err| panic!("read global vars: {err}"));
        assert!(global.contains(r#""zone":"a""#));

        // Whole-fleet inventory spans every server in one group.
        let prepare = fs::read_to_string(playbooks_dir.join("fleet-prepare.hosts"))
            .unwrap_or_else(|err| panic!("read prepare inventory: {err}"));
        assert!(prepare.contains("[servers-1]\ns-1.net ansible_ssh_user=qa\ns-2.net ansible_ssh_user=qa"));

        // The prepare playbook ran against the whole-fleet inventory.
        let calls = runner.calls();
        assert!(calls.iter().any(|(program, args)| {
            program == "ansible-playbook"
                && args.iter().any(|arg| arg.ends_with("fleet-prepare.yml"))
        }));
    }
}
