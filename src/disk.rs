//! Block device abstraction over a single memory-mapped backing file.
//!
//! A [`DiskDriver`] owns the backing file descriptor and the memory map
//! covering the whole file (header, bitmap, and data area). It is the only
//! thing in the crate that knows byte offsets into that mapping; every
//! other module addresses blocks purely by index.

use std::fs::{File, OpenOptions};
use std::path::Path;

use log::{debug, trace, warn};
use memmap2::MmapMut;

use crate::bitmap::Bitmap;
use crate::error::{Result, SimpleFsError};
use crate::layout::{DiskHeader, BLOCK_SIZE, DISK_HEADER_SIZE};

fn bitmap_bytes(num_blocks: usize) -> usize {
    num_blocks.div_ceil(8)
}

fn mapping_len(num_blocks: usize) -> usize {
    DISK_HEADER_SIZE + bitmap_bytes(num_blocks) + num_blocks * BLOCK_SIZE
}

/// Owns the backing file, its memory map, and the bitmap view aliasing
/// the map's bitmap region.
pub struct DiskDriver {
    file: File,
    mmap: MmapMut,
    num_blocks: usize,
}

impl DiskDriver {
    /// Opens (or creates and formats the header/bitmap region of) the
    /// backing file at `path`, sized for exactly `num_blocks` blocks.
    ///
    /// If `path` already exists, `num_blocks` is ignored in favor of the
    /// block count recorded in the file's own header: an existing disk's
    /// shape is not renegotiated by the caller.
    pub fn init(path: &Path, num_blocks: usize) -> Result<Self> {
        let exists = path.exists();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let num_blocks = if exists {
            let len = file.metadata()?.len() as usize;
            if len < DISK_HEADER_SIZE {
                return Err(SimpleFsError::IoFailed);
            }
            let probe = unsafe { MmapMut::map_mut(&file)? };
            let header = DiskHeader::from_bytes(&probe[..DISK_HEADER_SIZE]);
            drop(probe);
            header.num_blocks as usize
        } else {
            num_blocks
        };

        let total_len = mapping_len(num_blocks);
        file.set_len(total_len as u64)?;

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        if !exists {
            debug!("formatting new disk with {num_blocks} blocks ({total_len} bytes)");
            let header = DiskHeader {
                num_blocks: num_blocks as i32,
                free_blocks: num_blocks as i32,
                first_free_block: 0,
            };
            mmap[..DISK_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        }

        Ok(Self {
            file,
            mmap,
            num_blocks,
        })
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    fn bitmap_len(&self) -> usize {
        bitmap_bytes(self.num_blocks)
    }

    fn data_offset(&self) -> usize {
        DISK_HEADER_SIZE + self.bitmap_len()
    }

    /// Reads the persistent header.
    pub fn header(&self) -> DiskHeader {
        DiskHeader::from_bytes(&self.mmap[..DISK_HEADER_SIZE])
    }

    fn write_header(&mut self, header: DiskHeader) {
        self.mmap[..DISK_HEADER_SIZE].copy_from_slice(&header.to_bytes());
    }

    /// Borrows the bitmap region of the mapping as a [`Bitmap`] view.
    pub fn bitmap(&mut self) -> Bitmap<'_> {
        let len = self.bitmap_len();
        Bitmap::new(&mut self.mmap[DISK_HEADER_SIZE..DISK_HEADER_SIZE + len], self.num_blocks)
    }

    fn check_range(&self, block_num: usize) -> Result<()> {
        if block_num >= self.num_blocks {
            return Err(SimpleFsError::OutOfRange);
        }
        Ok(())
    }

    /// Copies block `block_num`'s contents into `dst`. Fails with
    /// `BlockFree` if the bitmap marks the block as unallocated.
    pub fn read_block(&mut self, block_num: usize, dst: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        self.check_range(block_num)?;
        if !self.bitmap().get(block_num)? {
            return Err(SimpleFsError::BlockFree);
        }
        let off = self.data_offset() + block_num * BLOCK_SIZE;
        dst.copy_from_slice(&self.mmap[off..off + BLOCK_SIZE]);
        Ok(())
    }

    /// Writes `src` into block `block_num`, marking it allocated if it
    /// wasn't already, then flushes.
    pub fn write_block(&mut self, block_num: usize, src: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.check_range(block_num)?;

        let was_free = !self.bitmap().get(block_num)?;
        self.bitmap().set(block_num, true)?;

        let off = self.data_offset() + block_num * BLOCK_SIZE;
        self.mmap[off..off + BLOCK_SIZE].copy_from_slice(src);

        let mut header = self.header();
        if was_free {
            header.free_blocks -= 1;
        }
        self.write_header(header);

        let first_free = self.bitmap().get_first(0, false)?;
        let mut header = self.header();
        header.first_free_block = first_free.map(|i| i as i32).unwrap_or(-1);
        self.write_header(header);

        self.flush()?;

        trace!("wrote block {block_num}, free_blocks={}", self.header().free_blocks);
        Ok(())
    }

    /// Marks block `block_num` free, updating `free_blocks` and
    /// `first_free_block` if needed, then flushes.
    pub fn free_block(&mut self, block_num: usize) -> Result<()> {
        self.check_range(block_num)?;

        let was_set = self.bitmap().get(block_num)?;
        self.bitmap().set(block_num, false)?;

        let mut header = self.header();
        if was_set {
            header.free_blocks += 1;
        }
        if header.first_free_block < 0 || block_num < header.first_free_block as usize {
            header.first_free_block = block_num as i32;
        }
        self.write_header(header);
        self.flush()?;

        trace!("freed block {block_num}, free_blocks={}", self.header().free_blocks);
        Ok(())
    }

    /// Returns the first free block at or after `start`.
    pub fn first_free(&mut self, start: usize) -> Result<Option<usize>> {
        self.bitmap().get_first(start, false)
    }

    /// Clears every bitmap bit and resets the free-block counters to a
    /// brand-new disk's values. Used only by `fs::format`.
    pub(crate) fn reset_allocation(&mut self) -> Result<()> {
        let num_blocks = self.num_blocks;
        {
            let mut bitmap = self.bitmap();
            for i in 0..num_blocks {
                bitmap.set(i, false)?;
            }
        }
        self.write_header(DiskHeader {
            num_blocks: num_blocks as i32,
            free_blocks: num_blocks as i32,
            first_free_block: 0,
        });
        self.flush()
    }

    /// Synchronously persists the entire mapping to the backing file.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    /// Truncates the backing file to the mapping size and releases the
    /// map and file descriptor.
    pub fn destroy(self) -> Result<()> {
        let len = mapping_len(self.num_blocks) as u64;
        self.flush()?;
        self.file.set_len(len)?;
        if self.file.metadata().is_err() {
            warn!("destroy: backing file already gone");
        }
        drop(self.mmap);
        drop(self.file);
        Ok(())
    }
}
