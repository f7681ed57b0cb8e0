use std::{io, path::PathBuf};

use axum::{
    async_trait,
    extract::{
        multipart::{Field, MultipartError},
        DefaultBodyLimit, FromRequestParts, MatchedPath, Multipart, Path, State,
    },
    http::{header, request::Parts, Request, StatusCode},
    response::{IntoResponse, Response},
    routing, Json, Router,
};
use futures::TryStreamExt;
use log::{error, info};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, services::ServeDir, trace::TraceLayer,
};
use tracing::info_span;
use utoipa::{
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
    Modify, OpenApi, ToSchema,
};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::{
    blob,
    database::Video,
    media_type,
    probe,
    upload::{self, Uploader},
};

/// Header the authenticating proxy in front of us puts the caller's id in.
pub const OWNER_HEADER: &str = "x-user-id";

// Headroom for multipart framing on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 << 10;

/// How `/assets` is answered.
#[derive(Debug, Clone)]
pub enum AssetServing {
    /// Straight from the assets directory.
    Disk(PathBuf),
    /// Through the uploader's asset store.
    Store,
    /// Somewhere else entirely, e.g. S3.
    External,
}

pub fn router(uploader: Uploader, assets: AssetServing) -> Router {
    let trace_layer = TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
        // Log the matched route's path (with placeholders not filled in).
        let matched_path = request
            .extensions()
            .get::<MatchedPath>()
            .map(MatchedPath::as_str);

        info_span!("http_request", method = ?request.method(), matched_path)
    });
    let cors_layer = CorsLayer::new()
        .allow_headers(tower_http::cors::Any)
        .allow_methods(tower_http::cors::Any)
        .allow_origin(tower_http::cors::Any);

    let thumbnail_limit = uploader.limits().max_thumbnail_bytes as usize + MULTIPART_OVERHEAD;
    let video_limit = uploader.limits().max_video_bytes as usize + MULTIPART_OVERHEAD;
    let mut app = Router::new()
        .route(
            "/api/thumbnail_upload/:video_id",
            routing::post(upload_thumbnail).layer(DefaultBodyLimit::max(thumbnail_limit)),
        )
        .route(
            "/api/video_upload/:video_id",
            routing::post(upload_video).layer(DefaultBodyLimit::max(video_limit)),
        )
        .route("/api/thumbnails/:video_id", routing::get(get_thumbnail));
    app = match assets {
        AssetServing::Disk(root) => app.nest_service("/assets", ServeDir::new(root)),
        AssetServing::Store => app.route("/assets/*key", routing::get(get_asset)),
        AssetServing::External => app,
    };
    app.with_state(uploader)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors_layer)
        .layer(trace_layer)
        .layer(CompressionLayer::new().gzip(true).deflate(true))
}

/// The authenticated caller, as vouched for by the proxy.
#[derive(Debug, Clone, Copy)]
pub struct Owner(pub Uuid);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Owner {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .map(Owner)
            .ok_or(ApiError::Unauthorized)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("missing or invalid {OWNER_HEADER} header")]
    Unauthorized,
    #[error("no {0:?} file in form")]
    MissingField(&'static str),
    #[error("missing Content-Type for {0}")]
    MissingContentType(&'static str),
    #[error("unable to parse form: {0}")]
    Multipart(#[from] MultipartError),
    #[error("couldn't read upload: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Upload(#[from] upload::Error),
}

#[derive(serde::Serialize, ToSchema)]
pub struct ErrorBody {
    error: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        use upload::Error as U;
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::MissingField(_) | ApiError::MissingContentType(_) => StatusCode::BAD_REQUEST,
            ApiError::Multipart(err) => err.status(),
            ApiError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Upload(err) => match err {
                U::MediaType(media_type::Error::MalformedMediaType(_)) => StatusCode::BAD_REQUEST,
                U::MediaType(media_type::Error::Unsupported { .. }) => {
                    StatusCode::UNSUPPORTED_MEDIA_TYPE
                }
                U::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                U::Forbidden(_) => StatusCode::FORBIDDEN,
                U::VideoNotFound(_) | U::ThumbnailMissing(_) => StatusCode::NOT_FOUND,
                U::Asset(blob::Error::NotFound(_)) => StatusCode::NOT_FOUND,
                U::Asset(blob::Error::InvalidKey(_)) => StatusCode::BAD_REQUEST,
                U::Probe(
                    probe::Error::NoStreamsFound | probe::Error::InvalidStreamDimensions { .. },
                ) => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{self}");
        } else {
            info!("rejected request: {self}");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn content_type_of(field: &Field<'_>, field_name: &'static str) -> Result<String, ApiError> {
    field
        .content_type()
        .map(str::to_owned)
        .ok_or(ApiError::MissingContentType(field_name))
}

/// Streams a form field into a temp file, stopping one byte past `limit`.
async fn buffer_to_temp(field: Field<'_>, limit: u64) -> Result<NamedTempFile, ApiError> {
    let body_with_io_error = field.map_err(|err| io::Error::new(io::ErrorKind::Other, err));
    let body_reader = StreamReader::new(body_with_io_error);
    tokio::pin!(body_reader);

    let upload = NamedTempFile::new()?;
    let mut file = tokio::fs::File::from_std(upload.reopen()?);
    let mut limited = body_reader.take(limit + 1);
    tokio::io::copy(&mut limited, &mut file).await?;
    file.flush().await?;
    Ok(upload)
}

#[utoipa::path(
    post,
    path = "/api/thumbnail_upload/{video_id}",
    params(("video_id" = String, Path, description = "Video the thumbnail belongs to")),
    responses(
        (status = 200, description = "Thumbnail stored", body = Video),
        (status = 400, description = "Malformed upload", body = ErrorBody),
        (status = 403, description = "Video belongs to someone else", body = ErrorBody),
    ),
    security(("owner" = []))
)]
async fn upload_thumbnail(
    State(uploader): State<Uploader>,
    Owner(owner): Owner,
    Path(video_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<Json<Video>, ApiError> {
    info!("uploading thumbnail for video {video_id} by user {owner}");
    let mut thumbnail = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("thumbnail") {
            let content_type = content_type_of(&field, "thumbnail")?;
            thumbnail = Some((content_type, field.bytes().await?));
            break;
        }
    }
    let (content_type, data) = thumbnail.ok_or(ApiError::MissingField("thumbnail"))?;
    let video = uploader
        .upload_thumbnail(owner, video_id, &content_type, data)
        .await?;
    Ok(Json(video))
}

#[utoipa::path(
    post,
    path = "/api/video_upload/{video_id}",
    params(("video_id" = String, Path, description = "Video the file belongs to")),
    responses(
        (status = 200, description = "Video stored", body = Video),
        (status = 400, description = "Malformed upload", body = ErrorBody),
        (status = 403, description = "Video belongs to someone else", body = ErrorBody),
        (status = 422, description = "Not a video we can classify", body = ErrorBody),
    ),
    security(("owner" = []))
)]
async fn upload_video(
    State(uploader): State<Uploader>,
    Owner(owner): Owner,
    Path(video_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<Json<Video>, ApiError> {
    info!("uploading video {video_id} by user {owner}");
    // Don't buffer a whole video for someone who can't attach it.
    uploader.authorize(owner, video_id).await?;

    let mut video_file = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("video") {
            let content_type = content_type_of(&field, "video")?;
            let upload = buffer_to_temp(field, uploader.limits().max_video_bytes).await?;
            video_file = Some((content_type, upload));
            break;
        }
    }
    let (content_type, upload) = video_file.ok_or(ApiError::MissingField("video"))?;
    let video = uploader
        .upload_video(owner, video_id, &content_type, upload)
        .await?;
    Ok(Json(video))
}

#[utoipa::path(
    get,
    path = "/api/thumbnails/{video_id}",
    params(("video_id" = String, Path, description = "Video whose thumbnail to fetch")),
    responses(
        (status = 200, description = "Thumbnail bytes", body = Vec<u8>),
        (status = 404, description = "No such video or thumbnail", body = ErrorBody),
    )
)]
async fn get_thumbnail(
    State(uploader): State<Uploader>,
    Path(video_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let asset = uploader.thumbnail(video_id).await?;
    Ok(asset_response(asset))
}

async fn get_asset(
    State(uploader): State<Uploader>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    let asset = uploader.asset(&key).await?;
    Ok(asset_response(asset))
}

fn asset_response(asset: blob::StoredAsset) -> Response {
    let content_type = asset
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    ([(header::CONTENT_TYPE, content_type)], asset.data).into_response()
}

#[derive(OpenApi)]
#[openapi(
    paths(
        upload_thumbnail,
        upload_video,
        get_thumbnail,
    ),
    components(schemas(Video, ErrorBody)),
    modifiers(&SecurityAddon),
    tags(
        (name = "assets", description = "Thumbnail and video uploads")
    )
)]
struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "owner",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("X-User-Id"))),
            )
        }
    }
}
