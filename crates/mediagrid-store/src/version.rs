//! Versions of a resource.
//!
//! A resource always has the original version and any number of derived
//! versions.  For image types the dimensions are carried in the filename,
//! `<width>x<height>.<extension>`, so enumerating versions never needs to
//! decode pixels.  Versions are immutable once visible; equality between
//! two versions is equality of their paths.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use tracing::debug;

use crate::content_type::ContentType;
use crate::fs_util;
use crate::fsck::{FsckIssue, FsckReport, Severity};
use crate::resource::Resource;
use crate::{CdnError, Result, EXTENSION_SEPARATOR, NEW_EXTENSION};

/// The character separating width from height in a version filename.
const DIMENSION_SEPARATOR: char = 'x';

/// Rounds `value · num / den` to the nearest integer, computed in `f64`.
///
/// Half-way cases round away from zero, matching the filenames of every
/// version already on disk.
fn round_scaled(value: u32, num: u32, den: u32) -> u32 {
    (value as f64 * num as f64 / den as f64).round() as u32
}

/// Parses `<width>x<height>` from a version filename prefix.
///
/// Both numbers must be canonical decimals (no leading zeros or signs) and
/// at least 1.
fn parse_dimension_prefix(version_file: &Path, prefix: &str) -> Result<(u32, u32)> {
    let Some(sep_pos) = prefix.find(DIMENSION_SEPARATOR) else {
        return Err(CdnError::BadArgument(format!(
            "unable to find dimension separator {DIMENSION_SEPARATOR:?} in filename prefix \
             {prefix:?} for path {}",
            version_file.display()
        )));
    };
    let parse_side = |s: &str, side: &str| -> Result<u32> {
        let value: u32 = s.parse().map_err(|_| {
            CdnError::BadArgument(format!(
                "invalid {side} {s:?} in filename prefix {prefix:?} for path {}",
                version_file.display()
            ))
        })?;
        if value.to_string() != s {
            return Err(CdnError::BadArgument(format!(
                "non-canonical {side} {s:?} in filename prefix {prefix:?} for path {}",
                version_file.display()
            )));
        }
        if value < 1 {
            return Err(CdnError::BadArgument(format!(
                "invalid {side} {value} in filename prefix {prefix:?} for path {}",
                version_file.display()
            )));
        }
        Ok(value)
    };
    let width = parse_side(&prefix[..sep_pos], "width")?;
    let height = parse_side(&prefix[sep_pos + 1..], "height")?;
    Ok((width, height))
}

/// One concrete file representing a resource.
///
/// Currently all supported types are raster images; the enum leaves room
/// for future kinds (video) that carry different metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Version {
    Image(ImageVersion),
}

impl Version {
    pub fn content_type(&self) -> ContentType {
        match self {
            Version::Image(v) => v.content_type(),
        }
    }

    pub fn file(&self) -> &Path {
        match self {
            Version::Image(v) => v.file(),
        }
    }

    pub fn resource(&self) -> &Resource {
        match self {
            Version::Image(v) => v.resource(),
        }
    }

    /// The canonical filename of this version within its resource
    /// directory.
    pub fn filename(&self) -> String {
        match self {
            Version::Image(v) => v.filename(),
        }
    }

    pub fn as_image(&self) -> Option<&ImageVersion> {
        match self {
            Version::Image(v) => Some(v),
        }
    }

    fn check_is_regular_file(&self) -> Result<()> {
        let meta = fs::symlink_metadata(self.file())?;
        if !meta.is_file() {
            return Err(CdnError::InvalidState(format!(
                "version is not a regular file: {}",
                self.file().display()
            )));
        }
        Ok(())
    }

    /// File size in bytes.
    pub fn size(&self) -> Result<u64> {
        self.check_is_regular_file()?;
        Ok(fs::symlink_metadata(self.file())?.len())
    }

    pub(crate) fn fsck_version(&self, report: &mut FsckReport) {
        match fs::symlink_metadata(self.file()) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => report.put(
                self.file().to_path_buf(),
                FsckIssue::new(Severity::Severe, "Version is not a regular file"),
            ),
            Err(_) => report.put(
                self.file().to_path_buf(),
                FsckIssue::new(Severity::Severe, "Version file missing"),
            ),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file().display())
    }
}

/// A raster-image version with pixel dimensions.
#[derive(Debug, Clone)]
pub struct ImageVersion {
    resource: Resource,
    content_type: ContentType,
    file: PathBuf,
    width: u32,
    height: u32,
}

impl PartialEq for ImageVersion {
    fn eq(&self, other: &Self) -> bool {
        self.file == other.file
    }
}

impl Eq for ImageVersion {}

impl ImageVersion {
    /// Creates a version by decoding enough of the file to learn its
    /// dimensions.
    pub(crate) fn by_read_file(
        resource: &Resource,
        content_type: ContentType,
        version_file: &Path,
    ) -> Result<Self> {
        let (width, height) = image::image_dimensions(version_file).map_err(|e| CdnError::Image {
            path: version_file.to_path_buf(),
            source: e,
        })?;
        Ok(ImageVersion {
            resource: resource.clone(),
            content_type,
            file: version_file.to_path_buf(),
            width,
            height,
        })
    }

    /// Creates a version by parsing the `<width>x<height>` filename, with
    /// no decoding.
    pub(crate) fn by_parse_filename(
        resource: &Resource,
        content_type: ContentType,
        version_file: &Path,
    ) -> Result<Self> {
        let filename = fs_util::file_name(version_file);
        let dot_extension = format!("{EXTENSION_SEPARATOR}{}", content_type.extension());
        let Some(prefix) = filename.strip_suffix(&dot_extension) else {
            return Err(CdnError::BadArgument(format!(
                "version file has mismatched extension: expected {}, but path is {}",
                content_type.extension(),
                version_file.display()
            )));
        };
        let (width, height) = parse_dimension_prefix(version_file, prefix)?;
        Ok(ImageVersion {
            resource: resource.clone(),
            content_type,
            file: version_file.to_path_buf(),
            width,
            height,
        })
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn filename(&self) -> String {
        self.filename_for(self.width, self.height)
    }

    fn filename_for(&self, width: u32, height: u32) -> String {
        format!(
            "{width}{DIMENSION_SEPARATOR}{height}{EXTENSION_SEPARATOR}{}",
            self.content_type.extension()
        )
    }

    /// Scales this version to a different resolution, reusing a cached
    /// version when one fits.
    ///
    /// Typically called on the original version, but works on any.  Only
    /// proportional scaling is performed, and only downward from the
    /// biggest existing version: a request to scale up returns the highest
    /// resolution available.  When both `width` and `height` are given,
    /// the result is the largest image fitting inside both; the returned
    /// width or height may be less than requested but never more (the
    /// caller letterboxes if it needs a fixed-proportion area).
    ///
    /// Holds the resource lock while searching and rendering, which
    /// prevents duplicate work on concurrent requests for the same size.
    /// The cluster is synchronised only after the lock is released; peers
    /// rendering the same version concurrently resolve through standard
    /// monitoring.
    ///
    /// Returns `self` when both arguments are `None` or when the resulting
    /// dimensions match this version.
    pub fn scale(&self, width: Option<u32>, height: Option<u32>) -> Result<ImageVersion> {
        let requested_width = width;
        let requested_height = height;
        let mut auto_width = false;
        let mut auto_height = false;
        let (mut width, mut height) = match (width, height) {
            (None, None) => return Ok(self.clone()),
            (None, Some(h)) => {
                auto_width = true;
                (round_scaled(self.width, h, self.height), h)
            }
            (Some(w), None) => {
                auto_height = true;
                (w, round_scaled(self.height, w, self.width))
            }
            (Some(w), Some(h)) => (w, h),
        };
        if width == self.width && height == self.height {
            return Ok(self.clone());
        }
        let sync_path;
        let new_version;
        {
            let _lock = self.resource.lock(false)?;
            let mut biggest: Option<ImageVersion> = None;
            for v in self.resource.versions(Some(self.content_type))? {
                let Version::Image(version) = v;
                if version.width == width && version.height == height {
                    return Ok(version);
                }
                // Keep track of the biggest
                let replace = match &biggest {
                    None => true,
                    Some(b) => version.width > b.width || version.height > b.height,
                };
                if replace {
                    biggest = Some(version.clone());
                }
                // Match in one dimension, not over in the other, for
                // disproportionate requests
                if (version.width == width && version.height <= height)
                    || (version.height == height && version.width <= width)
                {
                    return Ok(version);
                }
            }
            // At least self is of the same type
            let biggest = biggest.ok_or_else(|| {
                CdnError::InvalidState(format!(
                    "no versions of type {} in {}",
                    self.content_type.extension(),
                    self.resource.dir().display()
                ))
            })?;
            // Constrain bounds by the biggest available
            if width > biggest.width {
                width = biggest.width;
                if auto_height {
                    height = biggest.height;
                }
            }
            if height > biggest.height {
                height = biggest.height;
                if auto_width {
                    width = biggest.width;
                }
            }
            if width == biggest.width && height == biggest.height {
                return Ok(biggest);
            }

            // Compute and compare proportional scalings, keeping the smaller
            let vertical_letterbox_width = round_scaled(biggest.width, height, biggest.height);
            let horizontal_letterbox_height = round_scaled(biggest.height, width, biggest.width);
            if vertical_letterbox_width < width && height < horizontal_letterbox_height {
                width = vertical_letterbox_width;
            } else {
                height = horizontal_letterbox_height;
            }
            debug_assert!(width < biggest.width || height < biggest.height);
            debug_assert!(requested_width.is_none_or(|w| width <= w));
            debug_assert!(requested_height.is_none_or(|h| height <= h));

            let new_filename = self.filename_for(width, height);
            let new_file = self.resource.dir().join(&new_filename);
            let temp_file = self
                .resource
                .dir()
                .join(format!("{new_filename}{EXTENSION_SEPARATOR}{NEW_EXTENSION}"));
            let rendered = biggest.scale_into(width, height, &temp_file).and_then(|()| {
                fs_util::move_into_place(&temp_file, &new_file).map_err(CdnError::from)
            });
            if rendered.is_err() {
                if let Err(e) = fs::remove_file(&temp_file) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        debug!(path = %temp_file.display(), "unable to remove temp file: {e}");
                    }
                }
            }
            rendered?;
            sync_path = new_file.clone();
            let Version::Image(version) = self
                .content_type
                .version_by_parse_filename(&self.resource, &new_file)?;
            new_version = version;
        }
        self.resource.replicator().replicate(&[sync_path]);
        Ok(new_version)
    }

    /// Renders this version scaled to `new_width`×`new_height` into
    /// `temp_file`, using bicubic resampling.  Refuses to scale up.
    fn scale_into(&self, new_width: u32, new_height: u32, temp_file: &Path) -> Result<()> {
        if new_width > self.width || new_height > self.height {
            return Err(CdnError::BadArgument(format!(
                "refusing to scale up: {new_width}x{new_height} from {}x{}",
                self.width, self.height
            )));
        }
        let img = image::open(&self.file).map_err(|e| CdnError::Image {
            path: self.file.clone(),
            source: e,
        })?;
        let scaled = img.resize_exact(new_width, new_height, FilterType::CatmullRom);

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(crate::fs_util::NEW_FILE_MODE);
        }
        let file = options.open(temp_file)?;
        let mut writer = BufWriter::new(file);
        scaled
            .write_to(&mut writer, self.content_type.image_format())
            .map_err(|e| CdnError::Image {
                path: temp_file.to_path_buf(),
                source: e,
            })?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_scaled_matches_existing_filenames() {
        assert_eq!(round_scaled(584, 389, 778), 292);
        assert_eq!(round_scaled(778, 100, 584), 133);
        assert_eq!(round_scaled(292, 100, 389), 75);
        assert_eq!(round_scaled(584, 778, 778), 584);
    }

    #[test]
    fn dimension_prefix_canonical_only() {
        let path = Path::new("389x292.jpg");
        assert_eq!(parse_dimension_prefix(path, "389x292").unwrap(), (389, 292));
        assert_eq!(parse_dimension_prefix(path, "1x1").unwrap(), (1, 1));
        assert!(parse_dimension_prefix(path, "389").is_err());
        assert!(parse_dimension_prefix(path, "0389x292").is_err());
        assert!(parse_dimension_prefix(path, "389x+292").is_err());
        assert!(parse_dimension_prefix(path, "0x292").is_err());
        assert!(parse_dimension_prefix(path, "389x0").is_err());
        assert!(parse_dimension_prefix(path, "x292").is_err());
        assert!(parse_dimension_prefix(path, "389x").is_err());
    }
}
