//! Content-type handling for uploads.
//!
//! The subtype of the declared media type becomes the file extension as is.
//! It comes straight from the client, so it must never be used to decide how
//! a stored file is executed or interpreted downstream.

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("malformed media type {0:?}")]
    MalformedMediaType(String),
    #[error("unsupported media type {found:?}, expected one of {expected:?}")]
    Unsupported {
        found: String,
        expected: &'static [&'static str],
    },
}

pub type Result<T> = std::result::Result<T, Error>;

pub const THUMBNAIL_TYPES: &[&str] = &["image/jpeg", "image/png"];
pub const VIDEO_TYPES: &[&str] = &["video/mp4"];

/// `video/mp4` -> `.mp4`. Everything after the first `/` is kept verbatim.
pub fn extension_for(media_type: &str) -> Result<String> {
    match media_type.split_once('/') {
        Some((_, subtype)) => Ok(format!(".{subtype}")),
        None => Err(Error::MalformedMediaType(media_type.to_string())),
    }
}

/// The accepted media type a stored file name was minted from, if any.
/// Only [`THUMBNAIL_TYPES`] and [`VIDEO_TYPES`] are recognized.
pub fn known_type_for(file_name: &str) -> Option<&'static str> {
    let (_, extension) = file_name.rsplit_once('.')?;
    THUMBNAIL_TYPES
        .iter()
        .chain(VIDEO_TYPES)
        .copied()
        .find(|known| {
            known
                .split_once('/')
                .is_some_and(|(_, subtype)| subtype.eq_ignore_ascii_case(extension))
        })
}

/// Drops MIME parameters, `image/png; charset=binary` -> `image/png`.
pub fn parse_media_type(header: &str) -> Result<&str> {
    let essence = header.split(';').next().unwrap_or_default().trim();
    if essence.is_empty() || !essence.contains('/') {
        return Err(Error::MalformedMediaType(header.to_string()));
    }
    Ok(essence)
}

pub fn ensure_kind(media_type: &str, expected: &'static [&'static str]) -> Result<()> {
    if expected
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(media_type))
    {
        Ok(())
    } else {
        Err(Error::Unsupported {
            found: media_type.to_string(),
            expected,
        })
    }
}

#[test]
fn subtype_becomes_extension() {
    for (media_type, ext) in [
        ("video/mp4", ".mp4"),
        ("image/png", ".png"),
        ("image/jpeg", ".jpeg"),
        ("application/x-whatever", ".x-whatever"),
        ("a/b/c", ".b/c"),
        ("text/", "."),
    ] {
        assert_eq!(extension_for(media_type).unwrap(), ext);
    }
}

#[test]
fn missing_slash_is_malformed() {
    assert_eq!(
        extension_for("mp4"),
        Err(Error::MalformedMediaType("mp4".to_string()))
    );
    assert!(extension_for("").is_err());
}

#[test]
fn type_from_file_name() {
    assert_eq!(known_type_for("abc.png"), Some("image/png"));
    assert_eq!(known_type_for("portrait/abc.mp4"), Some("video/mp4"));
    assert_eq!(known_type_for("abc.JPEG"), Some("image/jpeg"));
    assert_eq!(known_type_for("abc.jpg"), None);
    assert_eq!(known_type_for("abc.x-whatever"), None);
    assert_eq!(known_type_for("abc"), None);
}

#[test]
fn parameters_are_stripped() {
    assert_eq!(parse_media_type("image/png; charset=binary"), Ok("image/png"));
    assert_eq!(parse_media_type(" video/mp4 "), Ok("video/mp4"));
    assert!(parse_media_type("; q=1").is_err());
    assert!(parse_media_type("png").is_err());
}

#[test]
fn kind_restrictions() {
    assert!(ensure_kind("image/jpeg", THUMBNAIL_TYPES).is_ok());
    assert!(ensure_kind("IMAGE/PNG", THUMBNAIL_TYPES).is_ok());
    assert!(matches!(
        ensure_kind("image/gif", THUMBNAIL_TYPES),
        Err(Error::Unsupported { .. })
    ));
    assert!(ensure_kind("video/mp4", VIDEO_TYPES).is_ok());
    assert!(ensure_kind("video/webm", VIDEO_TYPES).is_err());
}
