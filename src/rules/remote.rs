//! Downloading rule files over HTTP.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use tokio::fs;
use url::Url;

use super::{RuleError, RuleFile};

/// Default timeout for HTTP requests in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

const USER_AGENT: &str = concat!("dnsfs/", env!("CARGO_PKG_VERSION"));

/// Error type for rule downloads.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("invalid URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported URL scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("invalid rule file name {0:?}")]
    InvalidFileName(String),

    #[error("HTTP request failed for {url}: status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("timeout fetching {url}")]
    Timeout { url: String },

    #[error("downloaded rules are invalid: {0}")]
    Rules(#[from] RuleError),

    #[error("I/O error writing {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("failed to create HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

/// Fetches rule files into a rule directory.
pub struct RuleDownloader {
    client: Client,
    directory: PathBuf,
}

impl RuleDownloader {
    /// Create a downloader writing into `directory`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(directory: PathBuf) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(DownloadError::ClientBuild)?;

        Ok(Self { client, directory })
    }

    /// Download `url` and store it as `file_name` in the rule directory.
    ///
    /// The body is parsed before anything is written, so an invalid rule list
    /// never lands in the directory and breaks the next server start. An
    /// existing file with the same name is replaced.
    pub async fn download(&self, url: &str, file_name: &str) -> Result<RuleFile, DownloadError> {
        let parsed = Url::parse(url).map_err(|source| DownloadError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::UnsupportedScheme(parsed.scheme().to_string()));
        }

        let target = self.target_path(file_name)?;

        let response = self.client.get(parsed).send().await.map_err(|err| {
            if err.is_timeout() {
                DownloadError::Timeout {
                    url: url.to_string(),
                }
            } else {
                DownloadError::Network {
                    url: url.to_string(),
                    source: err,
                }
            }
        })?;

        if !response.status().is_success() {
            return Err(DownloadError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let content = response
            .text()
            .await
            .map_err(|err| DownloadError::Network {
                url: url.to_string(),
                source: err,
            })?;

        let (rule_file, content) = {
            let target = target.clone();
            tokio::task::spawn_blocking(move || {
                RuleFile::parse(&target, &content).map(|file| (file, content))
            })
            .await??
        };

        write_atomically(&target, content.as_bytes()).await?;

        tracing::info!(
            url = %url,
            path = ?target,
            rules = rule_file.rules.len(),
            "downloaded rule file"
        );

        Ok(rule_file)
    }

    /// Resolve a plain file name inside the rule directory.
    fn target_path(&self, file_name: &str) -> Result<PathBuf, DownloadError> {
        let name = Path::new(file_name);
        let is_plain = name.file_name().is_some_and(|base| base == name.as_os_str());
        if file_name.is_empty() || file_name.starts_with('.') || !is_plain {
            return Err(DownloadError::InvalidFileName(file_name.to_string()));
        }
        Ok(self.directory.join(name))
    }
}

async fn write_atomically(path: &Path, content: &[u8]) -> Result<(), DownloadError> {
    let io_error = |source| DownloadError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(io_error)?;
    }

    let mut temp = path.as_os_str().to_owned();
    temp.push(".part");
    let temp = PathBuf::from(temp);

    fs::write(&temp, content).await.map_err(io_error)?;
    fs::rename(&temp, path).await.map_err(io_error)?;
    Ok(())
}
