//! Deployment image collection
//!
//! Gathers the compiled `*.pe` images sitting next to a test assembly,
//! attaches version metadata, and packs them into a [`DeploymentBlob`].

use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};

/// Extension of compiled images
pub const IMAGE_EXTENSION: &str = "pe";

/// Version used when no metadata is available for an image
pub const UNKNOWN_VERSION: &str = "0.0.0.0";

/// Directory holding `path`, `.` for a bare file name
pub fn containing_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Image collection errors
#[derive(Error, Debug)]
pub enum ImageError {
    /// Directory or file could not be read
    #[error("I/O error reading {path}: {source}")]
    Io {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Metadata could not be parsed
    #[error("Invalid image metadata in {path}: {message}")]
    Metadata {
        /// Offending path
        path: PathBuf,
        /// Parser message
        message: String,
    },
}

/// Version information for one image
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct ImageMetadata {
    /// Assembly version
    pub version: String,
    /// Native interface version, class libraries only
    #[serde(default)]
    pub native_version: Option<String>,
}

/// Source of image version metadata
#[cfg_attr(test, mockall::automock)]
pub trait MetadataReader: Send + Sync {
    /// Read the metadata of the assembly compiled into `image`
    fn read(&self, image: &Path) -> Result<ImageMetadata, ImageError>;
}

/// Reads versions from an `images.toml` manifest next to the images
///
/// ```toml
/// [images.mscorlib]
/// version = "1.12.0.4"
/// native_version = "100.5.0.17"
/// ```
#[derive(Debug, Default)]
pub struct ManifestMetadataReader {
    cache: parking_lot::Mutex<HashMap<PathBuf, HashMap<String, ImageMetadata>>>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    images: HashMap<String, ImageMetadata>,
}

impl ManifestMetadataReader {
    /// File name of the manifest
    pub const FILE_NAME: &'static str = "images.toml";

    /// Create a reader
    pub fn new() -> Self {
        Self::default()
    }

    fn load(dir: &Path) -> Result<HashMap<String, ImageMetadata>, ImageError> {
        let path = dir.join(Self::FILE_NAME);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&path).map_err(|source| ImageError::Io {
            path: path.clone(),
            source,
        })?;
        let manifest: Manifest = toml::from_str(&content).map_err(|e| ImageError::Metadata {
            path,
            message: e.to_string(),
        })?;
        Ok(manifest.images)
    }
}

impl MetadataReader for ManifestMetadataReader {
    fn read(&self, image: &Path) -> Result<ImageMetadata, ImageError> {
        let dir = containing_dir(image);
        let stem = image
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut cache = self.cache.lock();
        if !cache.contains_key(dir) {
            cache.insert(dir.to_path_buf(), Self::load(dir)?);
        }
        let entry = cache.get(dir).and_then(|images| images.get(&stem)).cloned();

        Ok(entry.unwrap_or_else(|| {
            trace!(image = %image.display(), "no manifest entry, version unknown");
            ImageMetadata {
                version: UNKNOWN_VERSION.to_string(),
                native_version: None,
            }
        }))
    }
}

/// One compiled image to transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentImage {
    /// Path of the `.pe` file
    pub path: PathBuf,
    /// Assembly version
    pub version: String,
    /// Native interface version, class libraries only
    pub native_version: Option<String>,
}

impl DeploymentImage {
    /// File name without extension
    pub fn name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Ordered, 4-byte padded image buffers for one deployment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentBlob {
    buffers: Vec<Bytes>,
}

impl DeploymentBlob {
    /// Alignment every buffer is padded to
    pub const ALIGNMENT: usize = 4;

    /// Build a blob from raw image contents
    pub fn from_raw<I, B>(images: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let buffers = images.into_iter().map(|raw| pad(raw.as_ref())).collect();
        Self { buffers }
    }

    /// Read and pad every image from disk
    pub fn load(images: &[DeploymentImage]) -> Result<Self, ImageError> {
        let mut buffers = Vec::with_capacity(images.len());
        for image in images {
            let raw = std::fs::read(&image.path).map_err(|source| ImageError::Io {
                path: image.path.clone(),
                source,
            })?;
            trace!(image = %image.path.display(), len = raw.len(), "image loaded");
            buffers.push(pad(&raw));
        }
        Ok(Self { buffers })
    }

    /// Buffers in deployment order
    pub fn buffers(&self) -> &[Bytes] {
        &self.buffers
    }

    /// Number of buffers
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the blob carries no images
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Total size in bytes
    pub fn total_size(&self) -> usize {
        self.buffers.iter().map(Bytes::len).sum()
    }

    /// Copy every buffer into fresh storage
    #[must_use]
    pub fn deep_copy(&self) -> Self {
        Self {
            buffers: self
                .buffers
                .iter()
                .map(|b| Bytes::copy_from_slice(b))
                .collect(),
        }
    }
}

fn pad(raw: &[u8]) -> Bytes {
    let padded_len = raw.len().div_ceil(DeploymentBlob::ALIGNMENT) * DeploymentBlob::ALIGNMENT;
    let mut buf = BytesMut::with_capacity(padded_len);
    buf.extend_from_slice(raw);
    buf.resize(padded_len, 0);
    buf.freeze()
}

/// Collects the images to deploy for a test source
pub struct ImageCollector<'a> {
    reader: &'a dyn MetadataReader,
}

impl<'a> ImageCollector<'a> {
    /// Create a collector using the given metadata reader
    pub fn new(reader: &'a dyn MetadataReader) -> Self {
        Self { reader }
    }

    /// Collect every image in the directory of `source`, sorted by path
    pub fn collect_for_source(&self, source: &Path) -> Result<Vec<DeploymentImage>, ImageError> {
        self.collect_dir(containing_dir(source))
    }

    /// Collect every image in `dir`, sorted by path
    pub fn collect_dir(&self, dir: &Path) -> Result<Vec<DeploymentImage>, ImageError> {
        let entries = std::fs::read_dir(dir).map_err(|source| ImageError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ImageError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(IMAGE_EXTENSION))
            {
                paths.push(path);
            }
        }
        paths.sort();

        let mut images = Vec::with_capacity(paths.len());
        for path in paths {
            let metadata = self.reader.read(&path)?;
            debug!(
                image = %path.display(),
                version = %metadata.version,
                native_version = metadata.native_version.as_deref().unwrap_or("-"),
                "image collected"
            );
            images.push(DeploymentImage {
                path,
                version: metadata.version,
                native_version: metadata.native_version,
            });
        }
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_padding() {
        let blob = DeploymentBlob::from_raw([vec![1u8, 2, 3], vec![1, 2, 3, 4], vec![9; 5]]);
        let lens: Vec<usize> = blob.buffers().iter().map(Bytes::len).collect();
        assert_eq!(lens, vec![4, 4, 8]);
        assert_eq!(&blob.buffers()[0][..], &[1, 2, 3, 0]);
        assert_eq!(blob.total_size(), 16);
    }

    #[test]
    fn test_deep_copy_is_equal() {
        let blob = DeploymentBlob::from_raw([b"abcde".to_vec()]);
        let copy = blob.deep_copy();
        assert_eq!(blob, copy);
        assert_ne!(blob.buffers()[0].as_ptr(), copy.buffers()[0].as_ptr());
    }

    #[test]
    fn test_collect_dir_uses_reader() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.pe"), b"bbb").unwrap();
        fs::write(dir.path().join("a.pe"), b"aaaa").unwrap();
        fs::write(dir.path().join("a.dll"), b"ignored").unwrap();

        let mut reader = MockMetadataReader::new();
        reader.expect_read().times(2).returning(|path| {
            Ok(ImageMetadata {
                version: format!("1.0.{}", path.file_stem().unwrap().len()),
                native_version: None,
            })
        });

        let images = ImageCollector::new(&reader).collect_dir(dir.path()).unwrap();
        let names: Vec<String> = images.iter().map(DeploymentImage::name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(images[0].version, "1.0.1");

        let blob = DeploymentBlob::load(&images).unwrap();
        assert_eq!(blob.len(), 2);
        assert_eq!(blob.total_size(), 8);
    }

    #[test]
    fn test_bare_source_collects_from_working_dir() {
        assert_eq!(containing_dir(Path::new("Tests.pe")), Path::new("."));
        assert_eq!(containing_dir(Path::new("bin/Tests.pe")), Path::new("bin"));

        let reader = MockMetadataReader::new();
        let images = ImageCollector::new(&reader)
            .collect_for_source(Path::new("Tests.pe"))
            .unwrap();
        assert!(images.is_empty());
    }

    #[test]
    fn test_empty_dir_gives_empty_blob() {
        let dir = tempfile::tempdir().unwrap();
        let reader = MockMetadataReader::new();
        let images = ImageCollector::new(&reader).collect_dir(dir.path()).unwrap();
        assert!(images.is_empty());
        assert!(DeploymentBlob::load(&images).unwrap().is_empty());
    }

    #[test]
    fn test_manifest_reader() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(ManifestMetadataReader::FILE_NAME),
            "[images.mscorlib]\nversion = \"1.12.0.4\"\nnative_version = \"100.5.0.17\"\n",
        )
        .unwrap();

        let reader = ManifestMetadataReader::new();
        let lib = reader.read(&dir.path().join("mscorlib.pe")).unwrap();
        assert_eq!(lib.version, "1.12.0.4");
        assert_eq!(lib.native_version.as_deref(), Some("100.5.0.17"));

        let tests = reader.read(&dir.path().join("Tests.pe")).unwrap();
        assert_eq!(tests.version, UNKNOWN_VERSION);
        assert!(tests.native_version.is_none());
    }
}
