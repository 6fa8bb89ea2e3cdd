//! Lazy file-backed byte source served to the device.
//!
//! An [`Image`] is a cheap descriptor (path, basename, category) until it is
//! opened; opening discovers the size and positions the stream at byte 0.
//! Data is pulled in blocks from the current position, so the serving loop
//! never holds more than one block in memory.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::{debug, error};

use crate::error::ImageError;

// =============================================================================
// Public Interface
// =============================================================================

/// Category of an image, as carried in the serve list.
///
/// The category decides whether the completion of a flash sequence must wait
/// for the device's size-echo confirmation after the final image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    BootStage,
    UpdateEmmc,
    UpdateSpi,
    UpdateNand,
}

/// A file to be served over the bulk endpoint.
#[derive(Debug)]
pub struct Image {
    path: PathBuf,
    name: String,
    kind: ImageKind,
    file: Option<File>,
    size: u64,
}

impl Image {
    pub fn new(path: impl Into<PathBuf>, kind: ImageKind) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Image {
            path,
            name,
            kind,
            file: None,
            size: 0,
        }
    }

    /// Basename of the image, the key the device requests it by.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    /// Size in bytes. Meaningful only after [`Image::open`] has succeeded at
    /// least once.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Open the backing file and discover its size.
    ///
    /// Re-opening an already open image closes it and restarts from byte 0.
    pub fn open(&mut self) -> Result<(), ImageError> {
        debug!("loading image: {}", self.path.display());

        if !self.path.exists() {
            error!("image file does not exist: {}", self.path.display());
            return Err(ImageError::NotFound(self.path.clone()));
        }

        // Drop any previous handle so the position restarts at zero.
        self.file = None;

        let file = File::open(&self.path).map_err(|source| ImageError::Permission {
            path: self.path.clone(),
            source,
        })?;
        let size = file
            .metadata()
            .map_err(|source| ImageError::Permission {
                path: self.path.clone(),
                source,
            })?
            .len();

        debug!("image size: {}", size);

        self.size = size;
        self.file = Some(file);

        Ok(())
    }

    /// Read the next block of up to `buf.len()` bytes from the current
    /// position, returning the number of bytes read. Returns 0 at EOF.
    ///
    /// Fails with [`ImageError::Short`] if the file shrank since it was
    /// opened and a full block can no longer be produced.
    pub fn next_block(&mut self, buf: &mut [u8]) -> Result<usize, ImageError> {
        let path = self.path.clone();
        let file = self.file.as_mut().ok_or_else(|| ImageError::NotFound(path))?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        // A partial block is only legal at the end of the file.
        if filled < buf.len() {
            let consumed = Self::stream_position(file)?;
            if consumed < self.size {
                return Err(ImageError::Short(self.path.clone()));
            }
        }

        Ok(filled)
    }

    fn stream_position(file: &mut File) -> Result<u64, ImageError> {
        use std::io::{Seek, SeekFrom};
        Ok(file.seek(SeekFrom::Current(0))?)
    }
}

impl Clone for Image {
    /// Clones the descriptor only; the clone starts closed.
    fn clone(&self) -> Self {
        Image {
            path: self.path.clone(),
            name: self.name.clone(),
            kind: self.kind,
            file: None,
            size: 0,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
