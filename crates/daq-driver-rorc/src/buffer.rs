//! File-backed DMA page buffer.
//!
//! The buffer is a `MAP_SHARED` mapping of the channel's `pages` file, so the
//! data written by the card (or by the dummy backend's own mapping) is visible
//! through every mapping of the same file.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::debug;

use crate::error::{Result, RorcError};
use crate::fifo::PageDescriptor;
use crate::params::ChannelParameters;

/// Memory mapping of a channel's DMA pages.
pub struct PageBuffer {
    path: PathBuf,
    mmap: MmapMut,
    page_size: usize,
    page_count: u32,
    created: bool,
}

impl PageBuffer {
    /// Map the page buffer file, creating and sizing it when needed.
    pub fn open_or_create(path: &Path, params: &ChannelParameters) -> Result<Self> {
        let created = !path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| RorcError::filesystem(path, e))?;

        let size = params.buffer_size() as u64;
        let current = file
            .metadata()
            .map_err(|e| RorcError::filesystem(path, e))?
            .len();
        if current != size {
            file.set_len(size).map_err(|e| RorcError::filesystem(path, e))?;
        }

        // SAFETY: the file is sized above and only mapped by the lock holder
        // and its backend; nothing truncates it while the mapping lives.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| RorcError::filesystem(path, e))?;

        debug!(path = %path.display(), size, created, "Mapped DMA page buffer");

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            page_size: params.page_size,
            page_count: params.page_count,
            created,
        })
    }

    /// Whether this call created the backing file.
    pub fn created(&self) -> bool {
        self.created
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages.
    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Start of the mapping, for DMA address translation.
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// True for an empty mapping (never the case for validated parameters).
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Descriptor for page `index` at the given bus address.
    pub fn descriptor(&self, index: u32, bus_address: u64) -> Result<PageDescriptor> {
        self.check_index(index)?;
        Ok(PageDescriptor {
            index,
            offset: index as u64 * self.page_size as u64,
            size: self.page_size as u32,
            bus_address,
        })
    }

    /// Bytes of the page a descriptor refers to.
    pub fn data(&self, page: &PageDescriptor) -> Result<&[u8]> {
        let range = self.range(page)?;
        Ok(&self.mmap[range])
    }

    /// Mutable bytes of the page a descriptor refers to.
    pub fn data_mut(&mut self, page: &PageDescriptor) -> Result<&mut [u8]> {
        let range = self.range(page)?;
        Ok(&mut self.mmap[range])
    }

    /// Flush dirty pages to the backing file.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush().map_err(|e| RorcError::filesystem(&self.path, e))
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if index >= self.page_count {
            return Err(RorcError::invalid_argument(format!(
                "Page {} out of range: buffer has {} pages",
                index, self.page_count
            )));
        }
        Ok(())
    }

    /// Check that `page` describes its own slot of this buffer.
    ///
    /// Offset and size must be those of slot `page.index`; the bus address
    /// is not checked here, the backend owns the bus address table.
    pub fn check_descriptor(&self, page: &PageDescriptor) -> Result<()> {
        self.check_index(page.index)?;
        let offset = u64::from(page.index) * self.page_size as u64;
        if page.offset != offset || page.size as usize != self.page_size {
            return Err(RorcError::invalid_argument(format!(
                "Descriptor of page {} has offset {} and size {}, expected {} and {}",
                page.index, page.offset, page.size, offset, self.page_size
            )));
        }
        Ok(())
    }

    fn range(&self, page: &PageDescriptor) -> Result<std::ops::Range<usize>> {
        self.check_descriptor(page)?;
        // index < page_count, so the slot lies inside the mapping
        let start = page.index as usize * self.page_size;
        Ok(start..start + self.page_size)
    }
}

impl std::fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBuffer")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("page_count", &self.page_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn params() -> ChannelParameters {
        ChannelParameters::builder()
            .page_size(4096)
            .page_count(4)
            .build()
            .unwrap()
    }

    #[test]
    fn test_create_sizes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages");

        let buffer = PageBuffer::open_or_create(&path, &params()).unwrap();
        assert!(buffer.created());
        assert_eq!(buffer.len(), 4 * 4096);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * 4096);

        drop(buffer);
        let reopened = PageBuffer::open_or_create(&path, &params()).unwrap();
        assert!(!reopened.created());
    }

    #[test]
    fn test_shared_mappings_see_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages");

        let reader = PageBuffer::open_or_create(&path, &params()).unwrap();
        let mut writer = PageBuffer::open_or_create(&path, &params()).unwrap();

        let page = writer.descriptor(2, 0).unwrap();
        writer.data_mut(&page).unwrap()[..4].copy_from_slice(&[1, 2, 3, 4]);

        assert_eq!(&reader.data(&page).unwrap()[..4], &[1, 2, 3, 4]);
        assert_eq!(page.offset, 2 * 4096);
    }

    #[test]
    fn test_out_of_range_page() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = PageBuffer::open_or_create(&dir.path().join("pages"), &params()).unwrap();
        assert!(buffer.descriptor(4, 0).is_err());
    }

    #[test]
    fn test_descriptor_must_match_slot() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = PageBuffer::open_or_create(&dir.path().join("pages"), &params()).unwrap();
        let page = buffer.descriptor(0, 0).unwrap();

        let overflowing = PageDescriptor {
            offset: u64::MAX - 10,
            ..page
        };
        let err = buffer.data(&overflowing).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        // Slot 0 carrying slot 3's offset
        let aliased = PageDescriptor {
            offset: 3 * 4096,
            ..page
        };
        assert_eq!(buffer.data(&aliased).unwrap_err().kind(), ErrorKind::InvalidArgument);

        let short = PageDescriptor { size: 16, ..page };
        assert_eq!(buffer.check_descriptor(&short).unwrap_err().kind(), ErrorKind::InvalidArgument);

        assert_eq!(buffer.data(&page).unwrap().len(), 4096);
    }
}
