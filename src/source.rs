//! Input discovery and image loading.
//!
//! Listing is read-only and sorted by relative path so every run visits
//! images in the same order.

use image::{DynamicImage, ImageFormat};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{InspectError, Result};
use crate::types::InspectionTask;

/// The set of eligible images under an input directory.
///
/// The listing is taken once; `tasks()` can be called any number of times
/// and always yields the same sequence.
#[derive(Debug, Clone)]
pub struct ImageSource {
    root: PathBuf,
    entries: Vec<PathBuf>,
}

impl ImageSource {
    pub fn open(root: &Path, extensions: &[String], recursive: bool) -> Result<Self> {
        if !root.is_dir() {
            return Err(InspectError::config(format!(
                "input directory does not exist: {}",
                root.display()
            )));
        }

        let max_depth = if recursive { usize::MAX } else { 1 };
        let mut entries = Vec::new();
        for entry in WalkDir::new(root).min_depth(1).max_depth(max_depth) {
            let entry = entry.map_err(|e| {
                InspectError::config(format!("cannot list {}: {}", root.display(), e))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            if has_extension(&path, extensions) {
                entries.push(path);
            }
        }
        entries.sort_by_cached_key(|p| relative_id(root, p));

        debug!("Found {} candidate images under {}", entries.len(), root.display());
        Ok(Self {
            root: root.to_path_buf(),
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tasks(&self) -> impl Iterator<Item = InspectionTask> + '_ {
        self.entries.iter().map(move |path| InspectionTask {
            task_id: relative_id(&self.root, path),
            source_image_path: path.clone(),
        })
    }
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|want| want.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

fn relative_id(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// A decoded input image together with its original encoded bytes.
pub struct SourceImage {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    pub image: DynamicImage,
}

impl SourceImage {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = read_bytes(path)?;
        let format = image::guess_format(&bytes)
            .or_else(|_| ImageFormat::from_path(path))
            .map_err(|e| InspectError::image_read(path, e))?;
        let image = image::load_from_memory_with_format(&bytes, format)
            .map_err(|e| InspectError::image_read(path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            bytes,
            format,
            image,
        })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

pub fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| InspectError::image_read(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"x").unwrap();
    }

    fn ids(source: &ImageSource) -> Vec<String> {
        source.tasks().map(|t| t.task_id).collect()
    }

    #[test]
    fn test_lists_matching_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.jpg", "a.JPG", "c.png", "notes.txt", "d.jpeg"] {
            touch(&dir.path().join(name));
        }
        touch(&dir.path().join("nested/e.jpg"));

        let source = ImageSource::open(dir.path(), &["jpg".into()], false).unwrap();
        assert_eq!(ids(&source), vec!["a.JPG", "b.jpg"]);

        let source =
            ImageSource::open(dir.path(), &["jpg".into(), "jpeg".into(), "png".into()], false)
                .unwrap();
        assert_eq!(ids(&source), vec!["a.JPG", "b.jpg", "c.png", "d.jpeg"]);
    }

    #[test]
    fn test_recursive_listing_uses_relative_ids() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("z.jpg"));
        touch(&dir.path().join("line1/cam2/001.jpg"));
        touch(&dir.path().join("line1/001.jpg"));

        let source = ImageSource::open(dir.path(), &["jpg".into()], true).unwrap();
        assert_eq!(ids(&source), vec!["line1/001.jpg", "line1/cam2/001.jpg", "z.jpg"]);
    }

    #[test]
    fn test_tasks_are_restartable() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("1.jpg"));
        touch(&dir.path().join("2.jpg"));
        let source = ImageSource::open(dir.path(), &["jpg".into()], false).unwrap();
        assert_eq!(ids(&source), ids(&source));
        assert_eq!(source.len(), 2);
    }

    #[test]
    fn test_missing_directory_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ImageSource::open(&dir.path().join("nope"), &["jpg".into()], false).unwrap_err();
        assert!(matches!(err, InspectError::Configuration(_)));
    }

    #[test]
    fn test_load_rejects_undecodable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        fs::write(&path, b"definitely not a jpeg").unwrap();
        let err = SourceImage::load(&path).err().unwrap();
        assert!(matches!(err, InspectError::ImageRead { .. }));
    }

    #[test]
    fn test_load_keeps_original_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.png");
        image::RgbImage::from_pixel(8, 6, image::Rgb([10, 20, 30]))
            .save(&path)
            .unwrap();

        let source = SourceImage::load(&path).unwrap();
        assert_eq!((source.width(), source.height()), (8, 6));
        assert_eq!(source.format, ImageFormat::Png);
        assert_eq!(source.bytes, fs::read(&path).unwrap());
    }
}
