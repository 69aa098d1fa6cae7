//! Upload of collected test artifacts to an HTTP file store.
//!
//! CI provides the build name and number; both are only used to namespace
//! the upload path. When the store URL or either CI variable is absent the
//! upload step is skipped entirely.

use std::env;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

/// Directory tests drop their artifacts into.
pub const ARTIFACTS_PATH: &str = "/tmp/test-artifacts";

/// Environment variable naming the artifact store base URL.
pub const STORAGE_URL_ENV: &str = "FLEETRUN_STORAGE_URL";
/// CI-provided build configuration name.
pub const BUILD_NAME_ENV: &str = "TEAMCITY_BUILDCONF_NAME";
/// CI-provided build number.
pub const BUILD_NUMBER_ENV: &str = "BUILD_NUMBER";

/// Errors raised while uploading artifacts.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// Raised when an artifact cannot be read from disk.
    #[error("failed to read artifact {path}: {message}")]
    Io {
        /// Artifact path.
        path: Utf8PathBuf,
        /// OS error message.
        message: String,
    },
    /// Raised when the store rejects an upload.
    #[error("artifact store returned status {status} for {file}")]
    Rejected {
        /// HTTP status returned by the store.
        status: u16,
        /// File name that was being uploaded.
        file: String,
    },
    /// Raised when the store is unreachable.
    #[error("artifact store unreachable: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Uploads artifacts into a per-build namespace on the store.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    storage_url: String,
    build_name: String,
    build_number: String,
    http: reqwest::Client,
}

impl ArtifactStore {
    /// Builds a store from the environment, or `None` when any of the
    /// store URL, build name, or build number is unset.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let storage_url = env::var(STORAGE_URL_ENV).ok()?;
        let build_name = env::var(BUILD_NAME_ENV).ok()?.replace(' ', "_");
        let build_number = env::var(BUILD_NUMBER_ENV).ok()?;
        Some(Self {
            storage_url,
            build_name,
            build_number,
            http: reqwest::Client::new(),
        })
    }

    fn upload_url(&self, file_name: &str) -> String {
        format!(
            "{}/upload/fleetrun/{}/{}/{file_name}",
            self.storage_url.trim_end_matches('/'),
            self.build_name,
            self.build_number
        )
    }

    /// Uploads one file and returns the URL it can be fetched from.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError`] when the file cannot be read or the store
    /// rejects the upload.
    pub async fn upload(&self, path: &Utf8Path) -> Result<String, ArtifactError> {
        let file_name = path.file_name().unwrap_or(path.as_str());
        let body = fs::read(path).map_err(|err| ArtifactError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;

        let url = self.upload_url(file_name);
        let response = self.http.post(&url).body(body).send().await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(ArtifactError::Rejected {
                status,
                file: file_name.to_owned(),
            });
        }

        Ok(url.replace("/upload/", "/get/"))
    }

    /// Uploads every regular file in `dir`, returning the fetch URLs of the
    /// successful uploads. Individual failures are logged and skipped so one
    /// unreadable artifact cannot hide the rest.
    pub async fn upload_dir(&self, dir: &Utf8Path) -> Vec<String> {
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };

        let mut urls = Vec::new();
        for entry in entries.flatten() {
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            if !path.is_file() {
                continue;
            }
            match self.upload(&path).await {
                Ok(url) => urls.push(url),
                Err(err) => tracing::error!(artifact = %path, "upload failed: {err}"),
            }
        }
        urls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ArtifactStore {
        ArtifactStore {
            storage_url: String::from("http://files.example.net/"),
            build_name: String::from("Nightly_QA"),
            build_number: String::from("42"),
            http: reqwest::Client::new(),
        }
    }

    #[test]
    fn upload_url_namespaces_by_build() {
        assert_eq!(
            store().upload_url("node.log"),
            "http://files.example.net/upload/fleetrun/Nightly_QA/42/node.log"
        );
    }

    #[test]
    fn fetch_url_swaps_upload_for_get() {
        let url = store().upload_url("node.log").replace("/upload/", "/get/");
        assert_eq!(
            url,
            "http://files.example.net/get/fleetrun/Nightly_QA/42/node.log"
        );
    }
}
