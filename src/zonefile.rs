use std::{net::IpAddr, path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::{fs, process::Command, time};
use tracing::instrument;

use crate::{
    config::{FileBackendConfig, ReloadAction},
    hybrid::LocalBackend,
    record::{DnsRecord, Removal},
    Error,
};

const HEADER: &str = "# Dynamic Docker container records
# This file is automatically managed by dockerdns
# Manual changes will be overwritten

";

const HEADER_MARKER: &str = "Dynamic Docker container records";

const RELOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Writes `local-data` fragment lines for a local resolver and asks it to
/// reload. The fragment file is owned exclusively by this backend; the first
/// non-blank bytes are always the managed-file header.
pub(crate) struct ZoneFileBackend {
    path: PathBuf,
    reload: ReloadAction,
}

fn record_line(hostname: &str, domain: &str, ip: IpAddr) -> String {
    format!("local-data: \"{hostname}.{domain}. IN A {ip}\"")
}

fn record_prefix(hostname: &str, domain: &str) -> String {
    format!("local-data: \"{hostname}.{domain}.")
}

impl ZoneFileBackend {
    pub(crate) fn new(config: &FileBackendConfig) -> Self {
        Self {
            path: config.records_file.clone(),
            reload: config.reload.clone(),
        }
    }

    async fn read_lines(&self) -> Result<Vec<String>, Error> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => {
                if !contents.contains(HEADER_MARKER) {
                    tracing::warn!(
                        file = %self.path.display(),
                        "Fragment file has no managed header, recreating"
                    );
                    return Ok(HEADER.lines().map(str::to_owned).collect());
                }

                Ok(contents.lines().map(str::to_owned).collect())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(HEADER.lines().map(str::to_owned).collect())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_lines(&self, lines: Vec<String>) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut contents = lines.join("\n");
        contents.push('\n');

        // Write-then-rename keeps the resolver from ever seeing a torn file.
        let temp = self.path.with_extension("tmp");
        fs::write(&temp, contents).await?;
        fs::rename(&temp, &self.path).await?;

        Ok(())
    }

    /// Creates the fragment file with its header when absent or unmanaged.
    pub(crate) async fn ensure_file(&self) -> Result<(), Error> {
        let recreate = match fs::read_to_string(&self.path).await {
            Ok(contents) => !contents.contains(HEADER_MARKER),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };

        if recreate {
            tracing::info!(file = %self.path.display(), "Creating fragment file");
            self.write_lines(HEADER.lines().map(str::to_owned).collect())
                .await?;
        }

        Ok(())
    }

    /// Replaces any line for (hostname, domain) and appends the new record.
    /// Returns whether the file actually changed, so re-adding an identical
    /// record commits nothing.
    #[instrument(level = "debug", skip(self))]
    pub(crate) async fn add(&self, hostname: &str, ip: IpAddr, domain: &str) -> Result<bool, Error> {
        let prefix = record_prefix(hostname, domain);

        let original = self.read_lines().await?;
        let mut lines: Vec<String> = original
            .iter()
            .filter(|line| !line.trim_start().starts_with(&prefix))
            .cloned()
            .collect();
        lines.push(record_line(hostname, domain, ip));

        if lines == original {
            tracing::debug!(hostname, domain, %ip, "Fragment record already present");
            return Ok(false);
        }

        self.write_lines(lines).await?;

        tracing::info!(hostname, domain, %ip, "Added fragment record");
        Ok(true)
    }

    /// Drops any line for (hostname, domain). Succeeds when none matched.
    #[instrument(level = "debug", skip(self))]
    pub(crate) async fn remove(&self, hostname: &str, domain: &str) -> Result<bool, Error> {
        let prefix = record_prefix(hostname, domain);

        let mut lines = self.read_lines().await?;
        let before = lines.len();
        lines.retain(|line| !line.trim_start().starts_with(&prefix));

        if lines.len() == before {
            tracing::debug!(hostname, domain, "No fragment record to remove");
            return Ok(false);
        }

        self.write_lines(lines).await?;
        tracing::info!(hostname, domain, "Removed fragment record");
        Ok(true)
    }

    /// Drops every record line naming this hostname in any domain.
    #[instrument(level = "debug", skip(self))]
    pub(crate) async fn remove_all(&self, hostname: &str) -> Result<bool, Error> {
        let needle = format!("\"{hostname}.");

        let mut lines = self.read_lines().await?;
        let before = lines.len();
        lines.retain(|line| {
            !(line.trim_start().starts_with("local-data: \"") && line.contains(&needle))
        });

        if lines.len() == before {
            tracing::debug!(hostname, "No fragment records to remove");
            return Ok(false);
        }

        let removed = before - lines.len();
        self.write_lines(lines).await?;
        tracing::info!(hostname, removed, "Removed fragment records");
        Ok(true)
    }

    /// Signals the local resolver to pick up the fragment, either by running
    /// the configured command or by touching the sentinel file.
    pub(crate) async fn reload(&self) -> Result<(), Error> {
        match &self.reload {
            ReloadAction::Command(argv) => self.reload_command(argv).await,
            ReloadAction::Sentinel(path) => {
                fs::write(path, b"").await?;
                tracing::info!(sentinel = %path.display(), "Touched reload sentinel");
                Ok(())
            }
        }
    }

    async fn reload_command(&self, argv: &[String]) -> Result<(), Error> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::config("Empty reload command"))?;

        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match time::timeout(RELOAD_TIMEOUT, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                tracing::error!(command = %argv.join(" "), "Resolver reload timed out");
                return Err(Error::IoError {
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, "reload timed out"),
                });
            }
        };

        if output.status.success() {
            tracing::info!("Resolver reloaded");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(
                command = %argv.join(" "),
                status = %output.status,
                stderr = %stderr.trim(),
                "Resolver reload failed"
            );
            Err(Error::IoError {
                source: std::io::Error::other("reload command failed"),
            })
        }
    }
}

#[async_trait]
impl LocalBackend for ZoneFileBackend {
    fn name(&self) -> &'static str {
        "zonefile"
    }

    async fn apply_add(&self, record: &DnsRecord) -> bool {
        match self.add(&record.hostname, record.ip, &record.domain).await {
            Ok(changed) => changed,
            Err(e) => {
                tracing::error!(record = %record, error = %e, "Fragment add failed");
                false
            }
        }
    }

    async fn apply_remove(&self, removal: &Removal) -> bool {
        let result = match removal {
            Removal::Container { hostname } => self.remove_all(hostname).await,
            Removal::Record {
                hostname, domain, ..
            } => self.remove(hostname, domain).await,
        };

        match result {
            Ok(changed) => changed,
            Err(e) => {
                tracing::error!(removal = %removal, error = %e, "Fragment remove failed");
                false
            }
        }
    }

    async fn reload(&self) -> bool {
        ZoneFileBackend::reload(self).await.is_ok()
    }
}
