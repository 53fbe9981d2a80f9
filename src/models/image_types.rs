use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where the pixels of an image come from.
#[derive(Clone, PartialEq)]
pub enum ImageSource {
    Bytes(Arc<[u8]>),
    Path(PathBuf),
}

/// A cheap-to-clone reference to a user-selected image.
#[derive(Clone, PartialEq)]
pub struct ImageHandle {
    pub name: String,
    pub source: ImageSource,
}

impl ImageHandle {
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let name = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        Self {
            name,
            source: ImageSource::Path(path.to_path_buf()),
        }
    }

    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            source: ImageSource::Bytes(bytes.into()),
        }
    }
}

impl fmt::Debug for ImageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ImageSource::Bytes(b) => write!(f, "ImageHandle({}, {} bytes)", self.name, b.len()),
            ImageSource::Path(p) => write!(f, "ImageHandle({})", p.display()),
        }
    }
}
