use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{migrate, sqlite::SqlitePoolOptions, SqlitePool};
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] migrate::MigrateError),
    #[error("corrupt id {0:?} in database")]
    CorruptId(String),
}
pub type Result<T> = std::result::Result<T, Error>;

/// The record an uploaded asset belongs to.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct Video {
    #[schema(value_type = String)]
    pub id: Uuid,
    #[schema(value_type = String)]
    pub user_id: Uuid,
    pub title: String,
    pub description: String,
    pub thumbnail_url: Option<String>,
    pub video_url: Option<String>,
    #[schema(value_type = String)]
    pub created_at: DateTime<Utc>,
    #[schema(value_type = String)]
    pub updated_at: DateTime<Utc>,
}

impl Video {
    pub fn new(user_id: Uuid, title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            title: title.into(),
            description: description.into(),
            thumbnail_url: None,
            video_url: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Owning records, kept by someone else.
#[async_trait]
pub trait VideoStore: Send + Sync {
    async fn get_video(&self, id: Uuid) -> Result<Option<Video>>;

    async fn update_video(&self, video: &Video) -> Result<()>;
}

#[derive(sqlx::FromRow)]
struct VideoRow {
    id: String,
    user_id: String,
    title: String,
    description: String,
    thumbnail_url: Option<String>,
    video_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<VideoRow> for Video {
    type Error = Error;

    fn try_from(row: VideoRow) -> Result<Self> {
        let parse = |raw: String| Uuid::parse_str(&raw).map_err(|_| Error::CorruptId(raw));
        Ok(Self {
            id: parse(row.id)?,
            user_id: parse(row.user_id)?,
            title: row.title,
            description: row.description,
            thumbnail_url: row.thumbnail_url,
            video_url: row.video_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new().connect(database_url).await?;
        migrate!().run(&pool).await?;
        Ok(Self { pool })
    }

    /// Single connection in-memory database, gone when dropped.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        migrate!().run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn create_video(&self, video: &Video) -> Result<()> {
        sqlx::query(
            "INSERT INTO videos (id, user_id, title, description, thumbnail_url, video_url, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(video.id.to_string())
        .bind(video.user_id.to_string())
        .bind(&video.title)
        .bind(&video.description)
        .bind(&video.thumbnail_url)
        .bind(&video.video_url)
        .bind(video.created_at)
        .bind(video.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl VideoStore for Database {
    async fn get_video(&self, id: Uuid) -> Result<Option<Video>> {
        let row = sqlx::query_as::<_, VideoRow>(
            "SELECT id, user_id, title, description, thumbnail_url, video_url, created_at, updated_at
             FROM videos WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Video::try_from).transpose()
    }

    async fn update_video(&self, video: &Video) -> Result<()> {
        let result = sqlx::query(
            "UPDATE videos
             SET title = ?, description = ?, thumbnail_url = ?, video_url = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&video.title)
        .bind(&video.description)
        .bind(&video.thumbnail_url)
        .bind(&video.video_url)
        .bind(Utc::now())
        .bind(video.id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::Sqlx(sqlx::Error::RowNotFound));
        }
        log::debug!("updated video {}", video.id);
        Ok(())
    }
}

#[tokio::test]
async fn video_round_trip() {
    let db = Database::in_memory().await.unwrap();
    let mut video = Video::new(Uuid::new_v4(), "boots", "a video about boots");
    db.create_video(&video).await.unwrap();

    let stored = db.get_video(video.id).await.unwrap().unwrap();
    assert_eq!(stored.user_id, video.user_id);
    assert_eq!(stored.thumbnail_url, None);

    video.thumbnail_url = Some("http://localhost:8091/assets/abc.png".to_string());
    db.update_video(&video).await.unwrap();
    let stored = db.get_video(video.id).await.unwrap().unwrap();
    assert_eq!(stored.thumbnail_url, video.thumbnail_url);
    assert!(stored.updated_at >= stored.created_at);

    assert!(db.get_video(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn updating_missing_video_fails() {
    let db = Database::in_memory().await.unwrap();
    let video = Video::new(Uuid::new_v4(), "ghost", "");
    assert!(matches!(
        db.update_video(&video).await,
        Err(Error::Sqlx(sqlx::Error::RowNotFound))
    ));
}
