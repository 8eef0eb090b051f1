//! Share-file management: create, initialise, validate and map the
//! file that holds every page of the cache.
//!
//! The file is a flat array of `num_pages * page_size` bytes with no
//! global header; each page is self-describing. It is (re)created
//! when missing, when the attacher asks for it (`init_file`), or when
//! its size on disk disagrees with the requested geometry.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use memmap2::MmapMut;
use tracing::debug;

use crate::error::{Error, Result};
use crate::layout::{self, PageHeader, PAGE_MAGIC};

/// The mapped share file, owning the file handle and mapping for one
/// process. The region itself is shared; no process owns its bytes.
pub struct Region {
    file: File,
    mmap: MmapMut,
    num_pages: u32,
    page_size: u32,
}

impl Region {
    /// Open (creating and initialising if needed) the share file at
    /// `path` with the given geometry, and map it.
    pub fn open(path: &Path, num_pages: u32, page_size: u32, start_slots: u32, init_file: bool) -> Result<Region> {
        let total = u64::from(num_pages) * u64::from(page_size);

        // Drop an existing file when re-initialisation was requested
        // or its size does not match the requested geometry.
        match fs::metadata(path) {
            Ok(meta) => {
                if init_file || meta.len() != total {
                    match fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(Error::Io(e)),
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }

        if !path.exists() {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o640)
                .open(path)
            {
                Ok(mut file) => {
                    debug!(path = %path.display(), num_pages, page_size, "initialising share file");
                    let image = page_image(page_size, start_slots);
                    for _ in 0..num_pages {
                        file.write_all(&image)?;
                    }
                }
                // Another attacher won the create race; fall through
                // and open what it wrote.
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        if size != total {
            return Err(Error::Config(format!(
                "share file {} is {} bytes but geometry needs {}",
                path.display(),
                size,
                total
            )));
        }

        // Safety: the mapping spans exactly the file we just opened
        // read-write; all further access is bounds-checked against
        // the page geometry.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Region {
            file,
            mmap,
            num_pages,
            page_size,
        })
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Byte offset of `page` within the file, for range locking.
    pub fn page_offset(&self, page: u32) -> u64 {
        u64::from(page) * u64::from(self.page_size)
    }

    /// Base pointer of `page` within the mapping.
    ///
    /// The pointed-at bytes are shared with other processes; they must
    /// only be read or written while this process holds the page lock.
    pub fn page_ptr(&mut self, page: u32) -> *mut u8 {
        assert!(page < self.num_pages);
        let offset = self.page_offset(page) as usize;
        // Safety: offset is within the mapping by the assert above.
        unsafe { self.mmap.as_mut_ptr().add(offset) }
    }

    /// Overwrite `page` with a freshly initialised empty page. Used to
    /// repair a corrupt page; caller must hold the page lock.
    pub fn reinit_page(&mut self, page: u32, start_slots: u32) {
        let image = page_image(self.page_size, start_slots);
        let offset = self.page_offset(page) as usize;
        self.mmap[offset..offset + self.page_size as usize].copy_from_slice(&image);
    }
}

/// Build the byte image of one empty page: header plus zeroed slot
/// directory and heap.
fn page_image(page_size: u32, start_slots: u32) -> Vec<u8> {
    let mut image = vec![0u8; page_size as usize];
    let header = PageHeader {
        magic: PAGE_MAGIC,
        num_slots: start_slots,
        free_slots: start_slots,
        old_slots: 0,
        free_data: layout::heap_start(start_slots),
        free_bytes: page_size - layout::heap_start(start_slots),
        _reserved: [0; 2],
    };
    // Safety: PageHeader is repr(C), exactly HEADER_SIZE bytes of
    // plain u32s, and the image is at least that long.
    unsafe {
        std::ptr::write_unaligned(image.as_mut_ptr() as *mut PageHeader, header);
    }
    image
}
