//! # Firmware Upload
//!
//! Flashing is delegated to an external toolchain behind the narrow
//! [`FirmwareUploader`] interface. [`ArduinoCli`] drives `arduino-cli`:
//!
//! | Artifact | Steps |
//! |----------|-------|
//! | `.ino` sketch | `compile --fqbn <fqbn> <sketch>`, then `upload -p <port> --fqbn <fqbn> <sketch>` |
//! | `.hex` image | `upload -p <port> -b <fqbn> -i <image>` |
//!
//! The tool is probed with `arduino-cli version` first, and the whole
//! operation is bounded by one timeout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::FirmwareConfig;
use crate::error::UploadError;

/// Result of a successful upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    /// A sketch was compiled before uploading
    pub compiled: bool,
    /// Tool output from the upload step
    pub output: String,
}

/// Flashes a firmware artifact onto the board at a serial address.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FirmwareUploader: Send + Sync {
    async fn upload(&self, address: &str, artifact: &Path) -> Result<UploadOutcome, UploadError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArtifactKind {
    Sketch,
    Hex,
}

impl ArtifactKind {
    fn of(artifact: &Path) -> Result<Self, UploadError> {
        let extension = artifact
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
        match extension.as_deref() {
            Some("ino") => Ok(ArtifactKind::Sketch),
            Some("hex") => Ok(ArtifactKind::Hex),
            _ => Err(UploadError::UnsupportedArtifact(artifact.to_path_buf())),
        }
    }
}

/// `arduino-cli` based uploader
#[derive(Debug, Clone)]
pub struct ArduinoCli {
    cli_path: PathBuf,
    fqbn: String,
    timeout: Duration,
}

impl ArduinoCli {
    pub fn new(cli_path: impl Into<PathBuf>, fqbn: impl Into<String>, timeout: Duration) -> Self {
        Self {
            cli_path: cli_path.into(),
            fqbn: fqbn.into(),
            timeout,
        }
    }

    pub fn from_config(config: &FirmwareConfig) -> Self {
        Self::new(
            &config.cli_path,
            config.fqbn.clone(),
            Duration::from_secs(config.timeout_s),
        )
    }

    /// Arguments for each step, in order
    fn steps(&self, address: &str, artifact: &Path, kind: ArtifactKind) -> Vec<(&'static str, Vec<String>)> {
        let artifact = artifact.to_string_lossy().to_string();
        match kind {
            ArtifactKind::Sketch => vec![
                (
                    "compile",
                    vec!["compile".into(), "--fqbn".into(), self.fqbn.clone(), artifact.clone()],
                ),
                (
                    "upload",
                    vec![
                        "upload".into(),
                        "-p".into(),
                        address.to_string(),
                        "--fqbn".into(),
                        self.fqbn.clone(),
                        artifact,
                    ],
                ),
            ],
            ArtifactKind::Hex => vec![(
                "upload",
                vec![
                    "upload".into(),
                    "-p".into(),
                    address.to_string(),
                    "-b".into(),
                    self.fqbn.clone(),
                    "-i".into(),
                    artifact,
                ],
            )],
        }
    }

    async fn probe(&self) -> Result<(), UploadError> {
        let tool = self.cli_path.display().to_string();
        let status = Command::new(&self.cli_path)
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|_| UploadError::ToolNotFound(tool.clone()))?;

        if !status.success() {
            return Err(UploadError::ToolNotFound(tool));
        }
        Ok(())
    }

    async fn run(&self, stage: &'static str, args: &[String]) -> Result<String, UploadError> {
        debug!("Running {} {}", self.cli_path.display(), args.join(" "));

        let output = Command::new(&self.cli_path)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(UploadError::Failed {
                stage,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn upload_inner(&self, address: &str, artifact: &Path, kind: ArtifactKind) -> Result<UploadOutcome, UploadError> {
        self.probe().await?;

        let mut output = String::new();
        for (stage, args) in self.steps(address, artifact, kind) {
            info!("arduino-cli {} for {}", stage, address);
            output = self.run(stage, &args).await?;
        }

        Ok(UploadOutcome {
            compiled: kind == ArtifactKind::Sketch,
            output,
        })
    }
}

#[async_trait]
impl FirmwareUploader for ArduinoCli {
    async fn upload(&self, address: &str, artifact: &Path) -> Result<UploadOutcome, UploadError> {
        let kind = ArtifactKind::of(artifact)?;

        // kill_on_drop stops the child when the timeout drops the future
        tokio::time::timeout(self.timeout, self.upload_inner(address, artifact, kind))
            .await
            .map_err(|_| UploadError::Timeout(self.timeout))?
    }
}
