//! Video geometry via an external probe.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use crate::storage::Orientation;

const FFPROBE: &str = "ffprobe";

const LANDSCAPE_RATIO: f64 = 16.0 / 9.0;
const PORTRAIT_RATIO: f64 = 9.0 / 16.0;
const TOLERANCE: f64 = 0.05;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("error running probe: {0}")]
    ProbeExecutionFailed(#[from] std::io::Error),
    #[error("unreadable probe output: {0}")]
    ProbeOutputMalformed(#[from] serde_json::Error),
    #[error("no streams found")]
    NoStreamsFound,
    #[error("invalid stream dimensions: width={width}, height={height}")]
    InvalidStreamDimensions { width: u32, height: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct ProbeOutput {
    #[serde(default)]
    pub streams: Vec<Stream>,
}

/// One entry of `streams`. Audio streams carry no geometry, so both default to 0.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct Stream {
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

impl ProbeOutput {
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<ProbeOutput>;
}

/// `ffprobe -v error -print_format json -show_streams <file>`
#[derive(Debug, Clone)]
pub struct FfProbe {
    program: PathBuf,
}

impl Default for FfProbe {
    fn default() -> Self {
        Self::new(FFPROBE)
    }
}

impl FfProbe {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl MediaProbe for FfProbe {
    async fn probe(&self, path: &Path) -> Result<ProbeOutput> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(["-v", "error", "-print_format", "json", "-show_streams"])
            .arg(path)
            .kill_on_drop(true);
        let output = command.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ProbeExecutionFailed(std::io::Error::other(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            ))));
        }
        ProbeOutput::from_json(&output.stdout)
    }
}

/// Buckets the first listed stream. Later streams are never looked at, so a
/// file whose first stream is audio fails with `InvalidStreamDimensions`.
pub async fn classify(probe: &dyn MediaProbe, path: &Path) -> Result<Orientation> {
    let output = probe.probe(path).await?;
    let first = output.streams.first().ok_or(Error::NoStreamsFound)?;
    let orientation = orientation_of(first.width, first.height)?;
    tracing::debug!(
        path = %path.display(),
        width = first.width,
        height = first.height,
        %orientation,
        "classified video"
    );
    Ok(orientation)
}

pub fn orientation_of(width: u32, height: u32) -> Result<Orientation> {
    if width == 0 || height == 0 {
        return Err(Error::InvalidStreamDimensions { width, height });
    }
    let ratio = f64::from(width) / f64::from(height);
    if deviation(ratio, LANDSCAPE_RATIO) < TOLERANCE {
        Ok(Orientation::Landscape)
    } else if deviation(ratio, PORTRAIT_RATIO) < TOLERANCE {
        Ok(Orientation::Portrait)
    } else {
        Ok(Orientation::Other)
    }
}

fn deviation(actual: f64, target: f64) -> f64 {
    (actual - target).abs() / target
}
