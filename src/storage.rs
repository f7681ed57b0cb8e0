use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use crate::identifier::AssetIdentifier;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("storage root {path} unavailable: {source}")]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Orientation bucket of a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Orientation {
    Landscape,
    Portrait,
    Other,
}

impl Orientation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::Landscape => "landscape",
            Orientation::Portrait => "portrait",
            Orientation::Other => "other",
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to find a stored asset again. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetReference {
    identifier: AssetIdentifier,
    extension: String,
    classification: Option<Orientation>,
}

impl AssetReference {
    pub fn new(
        identifier: AssetIdentifier,
        extension: impl Into<String>,
        classification: Option<Orientation>,
    ) -> Self {
        Self {
            identifier,
            extension: extension.into(),
            classification,
        }
    }

    pub fn identifier(&self) -> &AssetIdentifier {
        &self.identifier
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn classification(&self) -> Option<Orientation> {
        self.classification
    }

    /// `{identifier}{extension}`
    pub fn file_name(&self) -> String {
        format!("{}{}", self.identifier, self.extension)
    }

    /// Object key, `{classification}/{identifier}{extension}` when classified.
    pub fn key(&self) -> String {
        match self.classification {
            Some(orientation) => format!("{orientation}/{}", self.file_name()),
            None => self.file_name(),
        }
    }
}

/// How a reference turns into a key and a public URL.
///
/// Both storage modes share [`LocationStrategy::public_url`]; they only differ
/// in the base they hang keys off and in how a reference is keyed.
pub trait LocationStrategy: Send + Sync {
    fn base_url(&self) -> String;

    fn key(&self, reference: &AssetReference) -> String;

    /// Where the asset lives on local disk, if this mode keeps it there.
    fn disk_path(&self, _reference: &AssetReference) -> Option<PathBuf> {
        None
    }

    fn public_url(&self, reference: &AssetReference) -> String {
        format!("{}/{}", self.base_url(), self.key(reference))
    }
}

/// Assets written under `root` and served by this process at `/assets`.
#[derive(Debug, Clone)]
pub struct LocalAssets {
    root: PathBuf,
    port: u16,
}

impl LocalAssets {
    pub fn new(root: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            root: root.into(),
            port,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl LocationStrategy for LocalAssets {
    fn base_url(&self) -> String {
        format!("http://localhost:{}/assets", self.port)
    }

    fn key(&self, reference: &AssetReference) -> String {
        reference.file_name()
    }

    fn disk_path(&self, reference: &AssetReference) -> Option<PathBuf> {
        Some(self.root.join(reference.file_name()))
    }
}

/// Assets in an S3 bucket, addressed virtual-host style.
#[derive(Debug, Clone)]
pub struct ObjectAssets {
    bucket: String,
    region: String,
}

impl ObjectAssets {
    pub fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
        }
    }
}

impl LocationStrategy for ObjectAssets {
    fn base_url(&self) -> String {
        format!("https://{}.s3.{}.amazonaws.com", self.bucket, self.region)
    }

    fn key(&self, reference: &AssetReference) -> String {
        reference.key()
    }
}

/// Creates the assets root if it is missing.
///
/// Safe to race: a directory that already exists counts as success.
pub async fn ensure_storage_root(root: &Path) -> Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    #[cfg(unix)]
    builder.mode(0o755);
    match builder.create(root).await {
        Ok(()) => {
            tracing::info!(path = %root.display(), "created assets directory");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists && root.is_dir() => Ok(()),
        Err(source) => Err(Error::StorageUnavailable {
            path: root.to_path_buf(),
            source,
        }),
    }
}
