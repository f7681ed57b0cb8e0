//! Turns an uploaded file into a stored asset referenced from its video.
//!
//! Either the asset is stored *and* the video points at it, or neither
//! happens: a record update that fails removes the freshly stored asset
//! again, and buffered temp files are dropped on every path. Once a new
//! asset is attached, the one it replaced is deleted.

use std::{io, sync::Arc, time::Duration};

use bytes::Bytes;
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::{
    blob::{self, AssetStore, StoredAsset},
    database::{self, Video, VideoStore},
    identifier::AssetIdentifier,
    media_type::{self, THUMBNAIL_TYPES, VIDEO_TYPES},
    probe::{self, MediaProbe},
    storage::{AssetReference, LocationStrategy},
};

pub const MAX_THUMBNAIL_BYTES: u64 = 10 << 20;
pub const MAX_VIDEO_BYTES: u64 = 1 << 30;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    MediaType(#[from] media_type::Error),
    #[error(transparent)]
    Probe(#[from] probe::Error),
    #[error("probe did not finish within {0:?}")]
    ProbeTimedOut(Duration),
    #[error("couldn't store asset: {0}")]
    Asset(#[from] blob::Error),
    #[error("couldn't update video: {0}")]
    Database(#[from] database::Error),
    #[error("couldn't buffer upload: {0}")]
    Io(#[from] io::Error),
    #[error("video {0} not found")]
    VideoNotFound(Uuid),
    #[error("video {0} does not belong to you")]
    Forbidden(Uuid),
    #[error("video {0} has no thumbnail")]
    ThumbnailMissing(Uuid),
    #[error("upload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct Limits {
    pub max_thumbnail_bytes: u64,
    pub max_video_bytes: u64,
    pub probe_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_thumbnail_bytes: MAX_THUMBNAIL_BYTES,
            max_video_bytes: MAX_VIDEO_BYTES,
            probe_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct Uploader {
    videos: Arc<dyn VideoStore>,
    assets: Arc<dyn AssetStore>,
    locator: Arc<dyn LocationStrategy>,
    probe: Arc<dyn MediaProbe>,
    limits: Limits,
}

impl Uploader {
    pub fn new(
        videos: Arc<dyn VideoStore>,
        assets: Arc<dyn AssetStore>,
        locator: Arc<dyn LocationStrategy>,
        probe: Arc<dyn MediaProbe>,
    ) -> Self {
        Self {
            videos,
            assets,
            locator,
            probe,
            limits: Limits::default(),
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Fetches `video_id`, failing unless `owner` owns it.
    pub async fn authorize(&self, owner: Uuid, video_id: Uuid) -> Result<Video> {
        let video = self
            .videos
            .get_video(video_id)
            .await?
            .ok_or(Error::VideoNotFound(video_id))?;
        if video.user_id != owner {
            return Err(Error::Forbidden(video_id));
        }
        Ok(video)
    }

    #[tracing::instrument(skip(self, data), fields(size = data.len()))]
    pub async fn upload_thumbnail(
        &self,
        owner: Uuid,
        video_id: Uuid,
        content_type: &str,
        data: Bytes,
    ) -> Result<Video> {
        check_size(data.len() as u64, self.limits.max_thumbnail_bytes)?;
        let media_type = media_type::parse_media_type(content_type)?;
        media_type::ensure_kind(media_type, THUMBNAIL_TYPES)?;
        let extension = media_type::extension_for(media_type)?;
        let video = self.authorize(owner, video_id).await?;

        let reference = AssetReference::new(AssetIdentifier::generate(), extension, None);
        let key = self.locator.key(&reference);
        self.assets.put(&key, media_type, data).await?;

        let url = self.locator.public_url(&reference);
        self.attach(video, Slot::Thumbnail, &key, url).await
    }

    /// `upload` is the buffered request body; it is removed once this returns.
    #[tracing::instrument(skip(self, upload))]
    pub async fn upload_video(
        &self,
        owner: Uuid,
        video_id: Uuid,
        content_type: &str,
        upload: NamedTempFile,
    ) -> Result<Video> {
        let size = tokio::fs::metadata(upload.path()).await?.len();
        check_size(size, self.limits.max_video_bytes)?;
        let media_type = media_type::parse_media_type(content_type)?;
        media_type::ensure_kind(media_type, VIDEO_TYPES)?;
        let extension = media_type::extension_for(media_type)?;
        let video = self.authorize(owner, video_id).await?;

        let identifier = AssetIdentifier::generate();
        let orientation = tokio::time::timeout(
            self.limits.probe_timeout,
            probe::classify(self.probe.as_ref(), upload.path()),
        )
        .await
        .map_err(|_| Error::ProbeTimedOut(self.limits.probe_timeout))??;

        let reference = AssetReference::new(identifier, extension, Some(orientation));
        let key = self.locator.key(&reference);
        self.assets.put_file(&key, media_type, upload.path()).await?;
        tracing::info!(%video_id, %key, %orientation, size, "stored video");

        let url = self.locator.public_url(&reference);
        self.attach(video, Slot::Video, &key, url).await
    }

    /// The thumbnail currently referenced by `video_id`.
    pub async fn thumbnail(&self, video_id: Uuid) -> Result<StoredAsset> {
        let video = self
            .videos
            .get_video(video_id)
            .await?
            .ok_or(Error::VideoNotFound(video_id))?;
        let key = video
            .thumbnail_url
            .as_deref()
            .and_then(|url| self.key_for_url(url))
            .ok_or(Error::ThumbnailMissing(video_id))?;
        Ok(self.assets.get(&key).await?)
    }

    pub async fn asset(&self, key: &str) -> Result<StoredAsset> {
        Ok(self.assets.get(key).await?)
    }

    /// Store key behind one of our public URLs. `None` for foreign URLs.
    fn key_for_url(&self, url: &str) -> Option<String> {
        let base = format!("{}/", self.locator.base_url());
        url.strip_prefix(&base)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
    }

    async fn attach(&self, mut video: Video, slot: Slot, key: &str, url: String) -> Result<Video> {
        let previous = slot.of(&mut video).replace(url);
        if let Err(err) = self.videos.update_video(&video).await {
            if let Err(cleanup) = self.assets.delete(key).await {
                tracing::warn!(%key, error = %cleanup, "couldn't roll back stored asset");
            }
            return Err(err.into());
        }

        let replaced = previous.as_deref().and_then(|url| self.key_for_url(url));
        if let Some(old) = replaced.filter(|old| old != key) {
            match self.assets.delete(&old).await {
                Ok(()) => tracing::debug!(%old, "removed replaced asset"),
                Err(err) => tracing::warn!(%old, error = %err, "couldn't remove replaced asset"),
            }
        }
        Ok(video)
    }
}

/// Which URL of a video an upload fills in.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Thumbnail,
    Video,
}

impl Slot {
    fn of(self, video: &mut Video) -> &mut Option<String> {
        match self {
            Slot::Thumbnail => &mut video.thumbnail_url,
            Slot::Video => &mut video.video_url,
        }
    }
}

fn check_size(size: u64, limit: u64) -> Result<()> {
    if size > limit {
        return Err(Error::TooLarge { size, limit });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        io::Write,
        path::Path,
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex,
        },
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        blob::{DiskStore, MemoryStore},
        identifier::IDENTIFIER_LEN,
        probe::{tests::FakeProbe, ProbeOutput},
        storage::{LocalAssets, ObjectAssets},
    };

    const LANDSCAPE: &str = r#"{"streams":[{"width":1920,"height":1080}]}"#;

    #[derive(Default)]
    struct FakeVideos {
        videos: Mutex<HashMap<Uuid, Video>>,
        fail_updates: AtomicBool,
    }

    impl FakeVideos {
        fn with(video: &Video) -> Arc<Self> {
            let videos = Self::default();
            videos.videos.lock().unwrap().insert(video.id, video.clone());
            Arc::new(videos)
        }

        fn stored(&self, id: Uuid) -> Video {
            self.videos.lock().unwrap()[&id].clone()
        }
    }

    #[async_trait]
    impl VideoStore for FakeVideos {
        async fn get_video(&self, id: Uuid) -> database::Result<Option<Video>> {
            Ok(self.videos.lock().unwrap().get(&id).cloned())
        }

        async fn update_video(&self, video: &Video) -> database::Result<()> {
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(sqlx::Error::PoolClosed.into());
            }
            self.videos.lock().unwrap().insert(video.id, video.clone());
            Ok(())
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl MediaProbe for HangingProbe {
        async fn probe(&self, _path: &Path) -> probe::Result<ProbeOutput> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ProbeOutput::default())
        }
    }

    struct Fixture {
        owner: Uuid,
        video: Video,
        videos: Arc<FakeVideos>,
        assets: Arc<MemoryStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let owner = Uuid::new_v4();
            let video = Video::new(owner, "boots", "");
            Self {
                owner,
                videos: FakeVideos::with(&video),
                video,
                assets: Arc::new(MemoryStore::new()),
            }
        }

        fn uploader(
            &self,
            locator: Arc<dyn LocationStrategy>,
            probe: Arc<dyn MediaProbe>,
        ) -> Uploader {
            Uploader::new(self.videos.clone(), self.assets.clone(), locator, probe)
        }

        fn local(&self) -> Uploader {
            self.uploader(
                Arc::new(LocalAssets::new("assets", 8091)),
                Arc::new(FakeProbe(LANDSCAPE)),
            )
        }
    }

    fn temp_video(contents: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file
    }

    #[tokio::test]
    async fn thumbnail_is_stored_and_referenced() {
        let fx = Fixture::new();
        let uploader = fx.local();
        let video = uploader
            .upload_thumbnail(fx.owner, fx.video.id, "image/png", Bytes::from_static(b"png"))
            .await
            .unwrap();

        let url = video.thumbnail_url.clone().unwrap();
        let name = url.strip_prefix("http://localhost:8091/assets/").unwrap();
        let (id, ext) = name.split_at(IDENTIFIER_LEN);
        assert_eq!(ext, ".png");
        assert!(AssetIdentifier::try_from(id).is_ok());
        assert_eq!(fx.videos.stored(fx.video.id).thumbnail_url, Some(url));

        let asset = uploader.thumbnail(fx.video.id).await.unwrap();
        assert_eq!(asset.data, Bytes::from_static(b"png"));
        assert_eq!(asset.content_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn replaced_assets_are_removed() {
        let fx = Fixture::new();
        let uploader = fx.local();
        let first = uploader
            .upload_thumbnail(fx.owner, fx.video.id, "image/png", Bytes::from_static(b"one"))
            .await
            .unwrap();
        let second = uploader
            .upload_thumbnail(fx.owner, fx.video.id, "image/jpeg", Bytes::from_static(b"two"))
            .await
            .unwrap();
        assert_ne!(first.thumbnail_url, second.thumbnail_url);
        assert_eq!(fx.assets.len().await, 1);
        let asset = uploader.thumbnail(fx.video.id).await.unwrap();
        assert_eq!(asset.data, Bytes::from_static(b"two"));

        for contents in [b"first cut".as_slice(), b"second cut".as_slice()] {
            uploader
                .upload_video(fx.owner, fx.video.id, "video/mp4", temp_video(contents))
                .await
                .unwrap();
        }
        assert_eq!(fx.assets.len().await, 2);
        let url = fx.videos.stored(fx.video.id).video_url.unwrap();
        let key = url.strip_prefix("http://localhost:8091/assets/").unwrap();
        assert_eq!(
            fx.assets.get(key).await.unwrap().data,
            Bytes::from_static(b"second cut")
        );
    }

    #[tokio::test]
    async fn foreign_urls_are_left_alone() {
        let fx = Fixture::new();
        let mut video = fx.video.clone();
        video.thumbnail_url = Some("https://cdn.example.com/elsewhere.png".to_string());
        fx.videos.update_video(&video).await.unwrap();
        fx.assets
            .put("elsewhere.png", "image/png", Bytes::from_static(b"keep"))
            .await
            .unwrap();

        fx.local()
            .upload_thumbnail(fx.owner, fx.video.id, "image/png", Bytes::from_static(b"png"))
            .await
            .unwrap();
        assert_eq!(fx.assets.len().await, 2);
    }

    #[tokio::test]
    async fn disk_thumbnail_keeps_its_type() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new();
        let uploader = Uploader::new(
            fx.videos.clone(),
            Arc::new(DiskStore::new(dir.path())),
            Arc::new(LocalAssets::new(dir.path(), 8091)),
            Arc::new(FakeProbe(LANDSCAPE)),
        );
        let video = uploader
            .upload_thumbnail(fx.owner, fx.video.id, "image/png", Bytes::from_static(b"png"))
            .await
            .unwrap();
        let name = video
            .thumbnail_url
            .as_deref()
            .and_then(|url| url.strip_prefix("http://localhost:8091/assets/"))
            .unwrap();
        assert!(dir.path().join(name).is_file());

        let asset = uploader.thumbnail(fx.video.id).await.unwrap();
        assert_eq!(asset.data, Bytes::from_static(b"png"));
        assert_eq!(asset.content_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn rejected_thumbnails_store_nothing() {
        let fx = Fixture::new();
        let uploader = fx.local();
        let png = || Bytes::from_static(b"png");

        let err = uploader
            .upload_thumbnail(Uuid::new_v4(), fx.video.id, "image/png", png())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let err = uploader
            .upload_thumbnail(fx.owner, Uuid::new_v4(), "image/png", png())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VideoNotFound(_)));

        let err = uploader
            .upload_thumbnail(fx.owner, fx.video.id, "png", png())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MediaType(media_type::Error::MalformedMediaType(_))
        ));

        let err = uploader
            .upload_thumbnail(fx.owner, fx.video.id, "image/gif", png())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MediaType(media_type::Error::Unsupported { .. })));

        let uploader = uploader.with_limits(Limits {
            max_thumbnail_bytes: 2,
            ..Limits::default()
        });
        let err = uploader
            .upload_thumbnail(fx.owner, fx.video.id, "image/png", png())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TooLarge { size: 3, limit: 2 }));

        assert!(fx.assets.is_empty().await);
        assert_eq!(fx.videos.stored(fx.video.id).thumbnail_url, None);
    }

    #[tokio::test]
    async fn failed_record_update_rolls_back_asset() {
        let fx = Fixture::new();
        fx.videos.fail_updates.store(true, Ordering::SeqCst);
        let err = fx
            .local()
            .upload_thumbnail(fx.owner, fx.video.id, "image/jpeg", Bytes::from_static(b"jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        assert!(fx.assets.is_empty().await);

        let err = fx
            .local()
            .upload_video(fx.owner, fx.video.id, "video/mp4", temp_video(b"mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        assert!(fx.assets.is_empty().await);
    }

    #[tokio::test]
    async fn video_lands_in_orientation_bucket() {
        let fx = Fixture::new();
        let uploader = fx.uploader(
            Arc::new(ObjectAssets::new("b", "r")),
            Arc::new(FakeProbe(r#"{"streams":[{"width":1080,"height":1920}]}"#)),
        );
        let video = uploader
            .upload_video(fx.owner, fx.video.id, "video/mp4", temp_video(b"mp4 bytes"))
            .await
            .unwrap();

        let url = video.video_url.unwrap();
        let key = url.strip_prefix("https://b.s3.r.amazonaws.com/").unwrap();
        assert!(key.starts_with("portrait/") && key.ends_with(".mp4"), "{key}");
        assert_eq!(key.len(), "portrait/".len() + IDENTIFIER_LEN + ".mp4".len());
        let asset = fx.assets.get(key).await.unwrap();
        assert_eq!(asset.data, Bytes::from_static(b"mp4 bytes"));
    }

    #[tokio::test]
    async fn classification_failures_leave_nothing_behind() {
        let fx = Fixture::new();
        let upload = temp_video(b"not a video");
        let temp_path = upload.path().to_path_buf();
        let err = fx
            .uploader(
                Arc::new(LocalAssets::new("assets", 8091)),
                Arc::new(FakeProbe(r#"{"streams":[]}"#)),
            )
            .upload_video(fx.owner, fx.video.id, "video/mp4", upload)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Probe(probe::Error::NoStreamsFound)));
        assert!(!temp_path.exists());
        assert!(fx.assets.is_empty().await);
        assert_eq!(fx.videos.stored(fx.video.id).video_url, None);
    }

    #[tokio::test]
    async fn hung_probe_times_out() {
        let fx = Fixture::new();
        let uploader = fx
            .uploader(
                Arc::new(LocalAssets::new("assets", 8091)),
                Arc::new(HangingProbe),
            )
            .with_limits(Limits {
                probe_timeout: Duration::from_millis(20),
                ..Limits::default()
            });
        let err = uploader
            .upload_video(fx.owner, fx.video.id, "video/mp4", temp_video(b"mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProbeTimedOut(_)));
        assert!(fx.assets.is_empty().await);
    }

    #[tokio::test]
    async fn video_requires_mp4() {
        let fx = Fixture::new();
        let err = fx
            .local()
            .upload_video(fx.owner, fx.video.id, "video/webm", temp_video(b"webm"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MediaType(media_type::Error::Unsupported { .. })));
    }

    #[tokio::test]
    async fn missing_thumbnail() {
        let fx = Fixture::new();
        let err = fx.local().thumbnail(fx.video.id).await.unwrap_err();
        assert!(matches!(err, Error::ThumbnailMissing(_)));
    }
}
