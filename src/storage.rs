// SPDX-License-Identifier: MPL-2.0

//! Storage utilities for photo output and HDR intermediate files
//!
//! An HDR bracket writes its source frames into a hidden directory next to
//! the final photo:
//!
//! ```text
//! <dir>/.IMG_20260101_120000_unstitch.hdr/0.jpg ... N-1.jpg   (while stacking)
//! <dir>/IMG_20260101_120000_unstitch_hdr.jpg                  (stacked output)
//! <dir>/IMG_20260101_120000_unstitch.hdr/                     (kept sources, visible)
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const HDR_DIR_SUFFIX: &str = "_unstitch.hdr";
const HDR_OUTPUT_SUFFIX: &str = "_unstitch_hdr.jpg";
const THUMBNAIL_SUFFIX: &str = ".thumb.jpg";

/// Default photo directory (~/Pictures/pano-rig)
pub fn default_photo_dir() -> PathBuf {
    dirs::picture_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pano-rig")
}

/// Timestamped base name for a new photo, e.g. `IMG_20260101_120000`
pub fn timestamped_basename() -> String {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    format!("IMG_{}", timestamp)
}

/// Paths belonging to one HDR bracket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HdrLayout {
    pub parent: PathBuf,
    pub basename: String,
}

impl HdrLayout {
    pub fn new(parent: impl Into<PathBuf>, basename: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            basename: basename.into(),
        }
    }

    /// Hidden directory the source frames are written into
    pub fn hidden_dir(&self) -> PathBuf {
        self.parent
            .join(format!(".{}{}", self.basename, HDR_DIR_SUFFIX))
    }

    /// Directory name once sources are kept
    pub fn visible_dir(&self) -> PathBuf {
        self.parent
            .join(format!("{}{}", self.basename, HDR_DIR_SUFFIX))
    }

    /// Stacked output image
    pub fn output_file(&self) -> PathBuf {
        self.parent
            .join(format!("{}{}", self.basename, HDR_OUTPUT_SUFFIX))
    }

    /// Thumbnail generated from the middle exposure
    pub fn thumbnail_file(&self) -> PathBuf {
        self.hidden_dir()
            .join(format!("{}{}", self.basename, THUMBNAIL_SUFFIX))
    }

    /// Source file for exposure `index`
    pub fn source_file(&self, index: usize) -> PathBuf {
        self.hidden_dir().join(source_file_name(index))
    }
}

/// File name of an indexed HDR source frame
pub fn source_file_name(index: usize) -> String {
    format!("{}.jpg", index)
}

/// Create the hidden bracket directory, clearing leftovers from a crashed run
pub fn create_hdr_dir(layout: &HdrLayout) -> io::Result<PathBuf> {
    let dir = layout.hidden_dir();
    if dir.exists() {
        warn!(dir = %dir.display(), "Removing stale HDR directory");
        fs::remove_dir_all(&dir)?;
    }
    fs::create_dir_all(&dir)?;
    debug!(dir = %dir.display(), "Created HDR directory");
    Ok(dir)
}

/// Keep or drop the bracket sources once stacking is over
pub fn finalize_hdr_dir(layout: &HdrLayout, keep_sources: bool) -> io::Result<()> {
    let hidden = layout.hidden_dir();
    if !hidden.exists() {
        return Ok(());
    }
    if keep_sources {
        let thumbnail = layout.thumbnail_file();
        if thumbnail.exists() {
            fs::remove_file(&thumbnail)?;
        }
        let visible = layout.visible_dir();
        fs::rename(&hidden, &visible)?;
        info!(dir = %visible.display(), "Kept HDR sources");
    } else {
        fs::remove_dir_all(&hidden)?;
        debug!(dir = %hidden.display(), "Deleted HDR sources");
    }
    Ok(())
}

/// Count the indexed source files present in `dir`
pub fn count_source_files(dir: &Path, count: usize) -> usize {
    (0..count)
        .filter(|index| dir.join(source_file_name(*index)).is_file())
        .count()
}

/// Write a small JPEG thumbnail of `source` to `dest`
pub fn create_thumbnail(source: &Path, dest: &Path, max_side: u32) -> Result<(), String> {
    let img = image::open(source).map_err(|e| format!("Failed to open {}: {}", source.display(), e))?;
    img.thumbnail(max_side, max_side)
        .to_rgb8()
        .save_with_format(dest, image::ImageFormat::Jpeg)
        .map_err(|e| format!("Failed to write thumbnail: {}", e))?;
    debug!(path = %dest.display(), "Thumbnail written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hdr_layout_names() {
        let layout = HdrLayout::new("/photos", "IMG_1");
        assert_eq!(layout.hidden_dir(), PathBuf::from("/photos/.IMG_1_unstitch.hdr"));
        assert_eq!(layout.visible_dir(), PathBuf::from("/photos/IMG_1_unstitch.hdr"));
        assert_eq!(layout.output_file(), PathBuf::from("/photos/IMG_1_unstitch_hdr.jpg"));
        assert_eq!(layout.source_file(2), PathBuf::from("/photos/.IMG_1_unstitch.hdr/2.jpg"));
    }

    #[test]
    fn test_finalize_keep_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = HdrLayout::new(tmp.path(), "IMG_2");

        create_hdr_dir(&layout).unwrap();
        fs::write(layout.source_file(0), b"x").unwrap();
        finalize_hdr_dir(&layout, true).unwrap();
        assert!(!layout.hidden_dir().exists());
        assert!(layout.visible_dir().join("0.jpg").exists());

        let layout = HdrLayout::new(tmp.path(), "IMG_3");
        create_hdr_dir(&layout).unwrap();
        finalize_hdr_dir(&layout, false).unwrap();
        assert!(!layout.hidden_dir().exists());
        assert!(!layout.visible_dir().exists());
    }

    #[test]
    fn test_kept_sources_drop_thumbnail() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = HdrLayout::new(tmp.path(), "IMG_4");

        create_hdr_dir(&layout).unwrap();
        fs::write(layout.source_file(0), b"x").unwrap();
        fs::write(layout.thumbnail_file(), b"thumb").unwrap();
        finalize_hdr_dir(&layout, true).unwrap();

        let visible = layout.visible_dir();
        assert!(visible.join("0.jpg").is_file());
        assert!(!visible.join("IMG_4.thumb.jpg").exists());
    }
}
