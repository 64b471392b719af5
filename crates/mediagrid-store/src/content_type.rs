//! The closed set of media types supported by the CDN.

use std::path::Path;

use image::ImageFormat;

use crate::resource::Resource;
use crate::version::{ImageVersion, Version};
use crate::{CdnError, Result};

/// A media type the CDN knows how to store and derive versions from.
///
/// Each content type has a distinct MIME string (sent in headers when the
/// resource is requested) and a distinct lower-case file extension (used
/// internally in the filesystem and externally in the URL).  The CDN only
/// stores binary files, so there is no character-encoding counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Jpeg,
    Png,
    Gif,
}

impl ContentType {
    pub(crate) const ALL: [ContentType; 3] =
        [ContentType::Jpeg, ContentType::Png, ContentType::Gif];

    pub fn mime(self) -> &'static str {
        match self {
            ContentType::Jpeg => "image/jpeg",
            ContentType::Png => "image/png",
            ContentType::Gif => "image/gif",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ContentType::Jpeg => "jpg",
            ContentType::Png => "png",
            ContentType::Gif => "gif",
        }
    }

    pub(crate) fn image_format(self) -> ImageFormat {
        match self {
            ContentType::Jpeg => ImageFormat::Jpeg,
            ContentType::Png => ImageFormat::Png,
            ContentType::Gif => ImageFormat::Gif,
        }
    }

    /// Gets the content type for a file extension, case-sensitive.
    pub fn for_extension(extension: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|ct| ct.extension() == extension)
            .ok_or_else(|| {
                CdnError::BadArgument(format!("no content type with extension {extension:?}"))
            })
    }

    /// Gets the content type for a MIME string, case-insensitive, matching
    /// up to the first `;` and trimmed.
    pub fn for_mime(mime: &str) -> Result<Self> {
        let trimmed = match mime.find(';') {
            Some(pos) => &mime[..pos],
            None => mime,
        }
        .trim();
        Self::ALL
            .into_iter()
            .find(|ct| ct.mime().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| CdnError::BadArgument(format!("no content type with MIME type {mime:?}")))
    }

    /// Sniffs a content type from leading magic bytes, when recognisable.
    pub(crate) fn sniff(bytes: &[u8]) -> Option<Self> {
        match image::guess_format(bytes).ok()? {
            ImageFormat::Jpeg => Some(ContentType::Jpeg),
            ImageFormat::Png => Some(ContentType::Png),
            ImageFormat::Gif => Some(ContentType::Gif),
            _ => None,
        }
    }

    /// Creates the correct version, reading the underlying file to
    /// determine its metadata.
    pub(crate) fn version_by_read_file(
        self,
        resource: &Resource,
        version_file: &Path,
    ) -> Result<Version> {
        Ok(Version::Image(ImageVersion::by_read_file(
            resource,
            self,
            version_file,
        )?))
    }

    /// Creates the correct version, parsing its metadata from the filename.
    pub(crate) fn version_by_parse_filename(
        self,
        resource: &Resource,
        version_file: &Path,
    ) -> Result<Version> {
        Ok(Version::Image(ImageVersion::by_parse_filename(
            resource,
            self,
            version_file,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_lookup_is_case_sensitive() {
        assert_eq!(ContentType::for_extension("jpg").unwrap(), ContentType::Jpeg);
        assert_eq!(ContentType::for_extension("png").unwrap(), ContentType::Png);
        assert_eq!(ContentType::for_extension("gif").unwrap(), ContentType::Gif);
        assert!(ContentType::for_extension("JPG").is_err());
        assert!(ContentType::for_extension("jpeg").is_err());
        assert!(ContentType::for_extension("").is_err());
    }

    #[test]
    fn mime_lookup_is_case_insensitive_and_strips_parameters() {
        assert_eq!(ContentType::for_mime("image/jpeg").unwrap(), ContentType::Jpeg);
        assert_eq!(ContentType::for_mime("Image/JPEG").unwrap(), ContentType::Jpeg);
        assert_eq!(
            ContentType::for_mime("image/png; charset=binary").unwrap(),
            ContentType::Png
        );
        assert_eq!(ContentType::for_mime("  image/gif  ").unwrap(), ContentType::Gif);
        assert!(ContentType::for_mime("image/webp").is_err());
    }

    #[test]
    fn sniff_recognises_magic_bytes() {
        assert_eq!(
            ContentType::sniff(&[0xff, 0xd8, 0xff, 0xe0, 0, 0, 0, 0]),
            Some(ContentType::Jpeg)
        );
        assert_eq!(
            ContentType::sniff(b"\x89PNG\r\n\x1a\n\0\0\0\0"),
            Some(ContentType::Png)
        );
        assert_eq!(ContentType::sniff(b"GIF89a\0\0\0\0"), Some(ContentType::Gif));
        assert_eq!(ContentType::sniff(b"not an image"), None);
    }
}
