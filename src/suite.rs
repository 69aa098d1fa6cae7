//! Test suite configuration: descriptors, discovery, and ordering.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use thiserror::Error;

/// Parameter mapping carried by tests, runs, and suite overrides.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// File name prefix identifying test descriptors.
pub const TEST_CONFIG_PREFIX: &str = "test_";
/// File name extension identifying test descriptors.
pub const TEST_CONFIG_EXTENSION: &str = "cfg";

/// Scheduling preference among an otherwise unordered test set.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OrderHint {
    /// Run before unordered tests.
    TryFirst,
    /// No preference.
    #[default]
    None,
    /// Run after unordered tests.
    TryLast,
}

impl OrderHint {
    const fn rank(self) -> u8 {
        match self {
            Self::TryFirst => 0,
            Self::None => 1,
            Self::TryLast => 2,
        }
    }
}

/// Client-side environment requirements of one test.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ClientsEnv {
    /// Number of client hosts the test drives.
    pub count: usize,
    /// Flavor label required for the clients.
    pub flavor: String,
}

/// Server-side environment requirements of one test.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ServersEnv {
    /// Server count per group; the group partition belongs to the test, the
    /// provisioned fleet only guarantees the total.
    pub count_per_group: Vec<usize>,
    /// Flavor label required for the servers.
    pub flavor: String,
}

/// Environment requirements plus the fixed setup/teardown procedures.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct TestEnv {
    /// Client requirements.
    pub clients: ClientsEnv,
    /// Server requirements.
    pub servers: ServersEnv,
    /// Playbook run before every run of the test.
    pub setup_playbook: String,
    /// Playbook run after every run of the test.
    pub teardown_playbook: String,
}

/// How one run of a test is executed. Resolved at configuration-load time;
/// an unknown `type` value fails the load instead of surfacing later as an
/// undeterminable run.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunKind {
    /// One invocation of the configuration-management process.
    Playbook {
        /// Playbook path relative to the playbooks directory, without the
        /// `.yml` extension.
        playbook: String,
    },
    /// One invocation of the external test runner per selected client host.
    RemoteTest {
        /// Target passed to the test runner.
        target: String,
        /// Extra runner options, prepended to the distribution arguments.
        #[serde(default)]
        options: Vec<String>,
    },
}

/// One run of a test, executed in declaration order.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RunSpec {
    /// Display name used in reporting.
    pub name: String,
    /// Free-text description shown in the per-run banner.
    #[serde(default)]
    pub description: String,
    /// Execution method.
    #[serde(flatten)]
    pub kind: RunKind,
    /// Run-level parameter overrides, merged over the test's defaults.
    #[serde(default)]
    pub params: Params,
}

/// Parsed test descriptor.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TestConfig {
    /// Selection tags; a test qualifies when any requested tag matches.
    pub tags: Vec<String>,
    /// Scheduling preference.
    #[serde(default)]
    pub order: OrderHint,
    /// Default parameters for every run.
    #[serde(default)]
    pub params: Params,
    /// Environment requirements and fixed procedures.
    pub env: TestEnv,
    /// Runs, in declaration order.
    pub runs: Vec<RunSpec>,
}

/// A discovered test: the descriptor plus the name derived from its file.
#[derive(Clone, Debug, PartialEq)]
pub struct TestCase {
    /// Test name (`test_<name>.cfg` minus prefix and extension).
    pub name: String,
    /// Parsed descriptor.
    pub config: TestConfig,
}

/// Errors raised while loading suite configuration.
#[derive(Debug, Error)]
pub enum SuiteError {
    /// Raised when the configuration directory cannot be walked.
    #[error("failed to read {path}: {message}")]
    Io {
        /// Path that could not be read.
        path: Utf8PathBuf,
        /// Human readable error message.
        message: String,
    },
    /// Raised when a descriptor does not decode, including unknown run
    /// `type` values.
    #[error("invalid test config {path}: {message}")]
    Parse {
        /// Descriptor path.
        path: Utf8PathBuf,
        /// Decoder error message.
        message: String,
    },
}

fn descriptor_name(path: &Utf8Path) -> Option<&str> {
    if path.extension() != Some(TEST_CONFIG_EXTENSION) {
        return None;
    }
    path.file_stem()
        .and_then(|stem| stem.strip_prefix(TEST_CONFIG_PREFIX))
        .filter(|name| !name.is_empty())
}

fn walk_descriptors(dir: &Utf8Path, found: &mut Vec<Utf8PathBuf>) -> Result<(), SuiteError> {
    let entries = fs::read_dir(dir).map_err(|err| SuiteError::Io {
        path: dir.to_path_buf(),
        message: err.to_string(),
    })?;
    for entry in entries {
        let entry = entry.map_err(|err| SuiteError::Io {
            path: dir.to_path_buf(),
            message: err.to_string(),
        })?;
        let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
            continue;
        };
        if path.is_dir() {
            walk_descriptors(&path, found)?;
        } else if descriptor_name(&path).is_some() {
            found.push(path);
        }
    }
    Ok(())
}

fn load_descriptor(path: &Utf8Path) -> Result<TestConfig, SuiteError> {
    let raw = fs::read_to_string(path).map_err(|err| SuiteError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    serde_json::from_str(&raw).map_err(|err| SuiteError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn tags_overlap(config_tags: &[String], requested: &[String]) -> bool {
    config_tags.iter().any(|tag| requested.contains(tag))
}

/// Discovers test descriptors under `configs_dir`, keeps those whose tag set
/// overlaps `tags`, and orders them: `tryfirst` tests, then unordered tests,
/// then `trylast` tests, lexicographically by name inside each bucket so a
/// suite always runs in the same order regardless of directory scan order.
///
/// # Errors
///
/// Returns [`SuiteError::Io`] when the directory cannot be walked and
/// [`SuiteError::Parse`] when a descriptor does not decode.
pub fn discover_tests(configs_dir: &Utf8Path, tags: &[String]) -> Result<Vec<TestCase>, SuiteError> {
    let mut paths = Vec::new();
    walk_descriptors(configs_dir, &mut paths)?;

    let mut tests = Vec::new();
    for path in paths {
        let config = load_descriptor(&path)?;
        if !tags_overlap(&config.tags, tags) {
            continue;
        }
        let Some(name) = descriptor_name(&path) else {
            continue;
        };
        tests.push(TestCase {
            name: name.to_owned(),
            config,
        });
    }

    tests.sort_by(|a, b| {
        (a.config.order.rank(), &a.name).cmp(&(b.config.order.rank(), &b.name))
    });
    Ok(tests)
}

/// Suite-level parameter overrides keyed by test name, with a `_global`
/// section applied to the umbrella `test` group.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct SuiteParams(Params);

const GLOBAL_SECTION: &str = "_global";

impl SuiteParams {
    /// Loads suite overrides from a JSON file; `None` yields empty overrides.
    ///
    /// # Errors
    ///
    /// Returns [`SuiteError::Io`] when the file cannot be read and
    /// [`SuiteError::Parse`] when it does not decode to an object of objects.
    pub fn load(path: Option<&Utf8Path>) -> Result<Self, SuiteError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = fs::read_to_string(path).map_err(|err| SuiteError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|err| SuiteError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// Returns the `_global` section, if present.
    #[must_use]
    pub fn global(&self) -> Option<&Params> {
        self.section(GLOBAL_SECTION)
    }

    /// Returns the overrides for one test, if present.
    #[must_use]
    pub fn for_test(&self, name: &str) -> Option<&Params> {
        if name == GLOBAL_SECTION {
            return None;
        }
        self.section(name)
    }

    fn section(&self, key: &str) -> Option<&Params> {
        self.0.get(key).and_then(serde_json::Value::as_object)
    }
}

/// Merges parameter mappings by top-level key, with `overrides` winning.
/// Neither input is mutated; ad-hoc nested merging is deliberately not
/// supported.
#[must_use]
pub fn merge_params(defaults: &Params, overrides: &Params) -> Params {
    let mut merged = defaults.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Convenience wrapper for merging an optional override set.
#[must_use]
pub fn merge_optional_params(defaults: &Params, overrides: Option<&Params>) -> Params {
    overrides.map_or_else(|| defaults.clone(), |overrides| merge_params(defaults, overrides))
}
