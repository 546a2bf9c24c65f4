//! `SimpleFs` core: format, init, and every directory/file operation
//! layered on top of [`crate::disk::DiskDriver`].
//!
//! No operation here caches more than one block's worth of state across
//! calls: every handle is re-validated against the disk (through
//! `DiskDriver`'s bitmap-guarded reads) on each use, matching the "no
//! in-memory write-back cache beyond the OS page cache" contract of the
//! format.

use std::path::Path;

use log::{info, trace, warn};

use crate::disk::DiskDriver;
use crate::error::{Result, SimpleFsError};
use crate::layout::{
    BlockHeader, DirectoryBlock, FileBlock, FileControlBlock, FirstDirectoryBlock,
    FirstFileBlock, BLOCK_HEADER_SIZE, BLOCK_SIZE, CONT_DIR_ENTRIES, FCB_SIZE, FIRST_DIR_ENTRIES,
    NONE_BLOCK,
};

/// In-memory cursor for an open directory.
///
/// Owns a cached copy of the object's metadata plus a weak link to its
/// parent, re-materialised on `changedir` rather than kept as a live
/// borrow.
#[derive(Debug, Clone)]
pub struct DirectoryHandle {
    block_in_disk: i32,
    fcb: FileControlBlock,
    /// Block index of the parent's `FirstDirectoryBlock`; `None` at the
    /// root.
    parent: Option<i32>,
}

impl DirectoryHandle {
    pub fn name(&self) -> &str {
        self.fcb.name_str()
    }

    pub fn block_in_disk(&self) -> i32 {
        self.block_in_disk
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// In-memory cursor for an open file: cached FCB plus the current
/// read/write position.
#[derive(Debug, Clone)]
pub struct FileHandle {
    block_in_disk: i32,
    fcb: FileControlBlock,
    pos_in_file: usize,
}

impl FileHandle {
    pub fn name(&self) -> &str {
        self.fcb.name_str()
    }

    pub fn block_in_disk(&self) -> i32 {
        self.block_in_disk
    }

    pub fn size_in_bytes(&self) -> usize {
        self.fcb.size_in_bytes as usize
    }

    pub fn pos_in_file(&self) -> usize {
        self.pos_in_file
    }
}

/// Splits a directory entry's flat slot index into (node index in chain,
/// slot within that node). Node 0 is the `FirstDirectoryBlock`; node `k
/// > 0` is the `k`th continuation `DirectoryBlock`.
fn dir_slot_location(flat_idx: usize) -> (usize, usize) {
    if flat_idx < FIRST_DIR_ENTRIES {
        (0, flat_idx)
    } else {
        let rem = flat_idx - FIRST_DIR_ENTRIES;
        (1 + rem / CONT_DIR_ENTRIES, rem % CONT_DIR_ENTRIES)
    }
}

/// Splits a byte offset within a file into (node index in chain, offset
/// within that node's data payload).
fn file_offset_location(pos: usize) -> (usize, usize) {
    if pos < FirstFileBlock::DATA_LEN {
        (0, pos)
    } else {
        let rem = pos - FirstFileBlock::DATA_LEN;
        (1 + rem / FileBlock::DATA_LEN, rem % FileBlock::DATA_LEN)
    }
}

/// The filesystem core: one `DiskDriver` plus the operations of the
/// on-disk format contract.
pub struct SimpleFs {
    disk: DiskDriver,
}

impl SimpleFs {
    /// Binds a filesystem to `disk`, formatting it first if the bitmap is
    /// empty (no blocks allocated means no root has ever been written).
    /// Returns the bound filesystem and a handle to the root directory.
    pub fn init(path: &Path, num_blocks: usize) -> Result<(Self, DirectoryHandle)> {
        let mut disk = DiskDriver::init(path, num_blocks)?;

        if disk.header().first_free_block == 0 {
            info!("disk at {path:?} is unformatted, formatting now");
            Self::format(&mut disk)?;
        }

        let mut fs = Self { disk };
        let root_node = fs.read_first_dir(0)?;
        let root = DirectoryHandle {
            block_in_disk: 0,
            fcb: root_node.fcb,
            parent: None,
        };
        Ok((fs, root))
    }

    /// Clears every bitmap bit and writes a fresh root directory at block
    /// 0. Calling `format` twice in a row leaves the disk bit-identical.
    pub fn format(disk: &mut DiskDriver) -> Result<()> {
        disk.reset_allocation()?;
        let fcb = FileControlBlock::new(NONE_BLOCK, 0, "/", true);
        let root = FirstDirectoryBlock::new(fcb);
        disk.write_block(0, &root.to_block())?;
        Ok(())
    }

    /// Releases the backing disk and truncates the file to its mapped
    /// size.
    pub fn destroy(self) -> Result<()> {
        self.disk.destroy()
    }

    /// Releases an open file handle. On-disk state is unchanged; closing
    /// consumes the handle by value, so there is nothing left to
    /// double-close.
    pub fn close_file(&self, _handle: FileHandle) {}

    /// Releases an open directory handle. See [`Self::close_file`].
    pub fn close_dir(&self, _handle: DirectoryHandle) {}

    // -- raw block (de)serialization helpers --------------------------

    fn read_raw(&mut self, block_idx: i32) -> Result<[u8; BLOCK_SIZE]> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.disk.read_block(block_idx as usize, &mut buf)?;
        Ok(buf)
    }

    fn read_block_header(&mut self, block_idx: i32) -> Result<BlockHeader> {
        let buf = self.read_raw(block_idx)?;
        Ok(BlockHeader::read_from(&buf[..BLOCK_HEADER_SIZE]))
    }

    fn set_next_block(&mut self, block_idx: i32, next: i32) -> Result<()> {
        let mut buf = self.read_raw(block_idx)?;
        let mut header = BlockHeader::read_from(&buf[..BLOCK_HEADER_SIZE]);
        header.next_block = next;
        header.write_to(&mut buf[..BLOCK_HEADER_SIZE]);
        self.disk.write_block(block_idx as usize, &buf)
    }

    fn read_fcb_at(&mut self, block_idx: i32) -> Result<FileControlBlock> {
        let buf = self.read_raw(block_idx)?;
        Ok(FileControlBlock::read_from(
            &buf[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + FCB_SIZE],
        ))
    }

    fn read_first_dir(&mut self, block_idx: i32) -> Result<FirstDirectoryBlock> {
        Ok(FirstDirectoryBlock::from_block(&self.read_raw(block_idx)?))
    }

    fn write_first_dir(&mut self, block_idx: i32, node: &FirstDirectoryBlock) -> Result<()> {
        self.disk.write_block(block_idx as usize, &node.to_block())
    }

    fn read_cont_dir(&mut self, block_idx: i32) -> Result<DirectoryBlock> {
        Ok(DirectoryBlock::from_block(&self.read_raw(block_idx)?))
    }

    fn write_cont_dir(&mut self, block_idx: i32, node: &DirectoryBlock) -> Result<()> {
        self.disk.write_block(block_idx as usize, &node.to_block())
    }

    fn read_first_file(&mut self, block_idx: i32) -> Result<FirstFileBlock> {
        Ok(FirstFileBlock::from_block(&self.read_raw(block_idx)?))
    }

    fn write_first_file(&mut self, block_idx: i32, node: &FirstFileBlock) -> Result<()> {
        self.disk.write_block(block_idx as usize, &node.to_block())
    }

    fn write_file_block(&mut self, block_idx: i32, node: &FileBlock) -> Result<()> {
        self.disk.write_block(block_idx as usize, &node.to_block())
    }

    /// Walks a `next_block` chain starting at `head`, returning every
    /// block index in order. Rejects chains that don't terminate within
    /// `num_blocks` steps as corrupt.
    fn chain_blocks(&mut self, head: i32) -> Result<Vec<i32>> {
        let mut blocks = vec![head];
        let mut current = head;
        let limit = self.disk.num_blocks();

        loop {
            let header = self.read_block_header(current)?;
            if header.next_block == NONE_BLOCK {
                break;
            }
            current = header.next_block;
            blocks.push(current);
            if blocks.len() > limit {
                warn!("chain starting at block {head} did not terminate, treating as corrupt");
                return Err(SimpleFsError::CorruptChain);
            }
        }

        Ok(blocks)
    }

    // -- directory entry slot access -----------------------------------

    fn get_slot(&mut self, head: i32, flat_idx: usize) -> Result<i32> {
        let (node_idx, slot) = dir_slot_location(flat_idx);
        if node_idx == 0 {
            Ok(self.read_first_dir(head)?.file_blocks[slot])
        } else {
            let chain = self.chain_blocks(head)?;
            let node_block = *chain.get(node_idx).ok_or(SimpleFsError::CorruptChain)?;
            Ok(self.read_cont_dir(node_block)?.file_blocks[slot])
        }
    }

    fn set_slot(&mut self, head: i32, flat_idx: usize, value: i32) -> Result<()> {
        let (node_idx, slot) = dir_slot_location(flat_idx);
        if node_idx == 0 {
            let mut first = self.read_first_dir(head)?;
            first.file_blocks[slot] = value;
            self.write_first_dir(head, &first)
        } else {
            let chain = self.chain_blocks(head)?;
            let node_block = *chain.get(node_idx).ok_or(SimpleFsError::CorruptChain)?;
            let mut node = self.read_cont_dir(node_block)?;
            node.file_blocks[slot] = value;
            self.write_cont_dir(node_block, &node)
        }
    }

    /// Allocates a new continuation `DirectoryBlock`, linking it after
    /// the current tail of `head`'s chain.
    fn allocate_dir_continuation(&mut self, chain: &[i32]) -> Result<i32> {
        let tail = *chain.last().expect("chain always has at least the head");
        let tail_header = self.read_block_header(tail)?;
        let new_idx = self
            .disk
            .first_free(0)?
            .ok_or(SimpleFsError::DiskFull)? as i32;
        let new_node = DirectoryBlock::new(tail_header.block_in_file + 1, tail);
        self.write_cont_dir(new_idx, &new_node)?;
        self.set_next_block(tail, new_idx)?;
        Ok(new_idx)
    }

    /// Links a newly allocated child's first block into the parent
    /// directory at `head`, at the lowest-index free slot (always
    /// `num_entries`, the slot-0 sentinel contract keeps entries
    /// compact).
    fn insert_entry(&mut self, head: i32, child_block: i32) -> Result<()> {
        let first = self.read_first_dir(head)?;
        let flat_idx = first.num_entries as usize;
        let (node_idx, _slot) = dir_slot_location(flat_idx);

        if node_idx > 0 {
            let chain = self.chain_blocks(head)?;
            if node_idx >= chain.len() {
                self.allocate_dir_continuation(&chain)?;
            }
        }

        self.set_slot(head, flat_idx, child_block)?;

        let mut first = self.read_first_dir(head)?;
        first.num_entries += 1;
        self.write_first_dir(head, &first)
    }

    /// Finds the entry named `name` with `is_dir == want_dir` among
    /// `head`'s entries and returns its first-block index.
    fn find_entry(&mut self, head: i32, name: &str, want_dir: bool) -> Result<i32> {
        let first = self.read_first_dir(head)?;
        for idx in 0..first.num_entries as usize {
            let slot = self.get_slot(head, idx)?;
            let fcb = self.read_fcb_at(slot)?;
            if fcb.is_dir == want_dir && fcb.name_str() == name {
                return Ok(slot);
            }
        }
        Err(SimpleFsError::NotFound)
    }

    /// Unlinks the entry named `name` (matching `want_dir`) from `head`,
    /// shifting later slots down so the slot-0 sentinel contract holds,
    /// and returns the removed child's first-block index.
    fn remove_entry(&mut self, head: i32, name: &str, want_dir: bool) -> Result<i32> {
        let first = self.read_first_dir(head)?;
        let num_entries = first.num_entries as usize;

        let mut found = None;
        for idx in 0..num_entries {
            let slot = self.get_slot(head, idx)?;
            let fcb = self.read_fcb_at(slot)?;
            if fcb.is_dir == want_dir && fcb.name_str() == name {
                found = Some((idx, slot));
                break;
            }
        }
        let (idx, child_block) = found.ok_or(SimpleFsError::NotFound)?;

        for j in idx..num_entries - 1 {
            let next = self.get_slot(head, j + 1)?;
            self.set_slot(head, j, next)?;
        }
        self.set_slot(head, num_entries - 1, 0)?;

        let mut first = self.read_first_dir(head)?;
        first.num_entries -= 1;
        self.write_first_dir(head, &first)?;

        Ok(child_block)
    }

    /// Frees every block belonging to the object whose first block is
    /// `head`.
    fn free_chain(&mut self, head: i32) -> Result<()> {
        for block in self.chain_blocks(head)? {
            self.disk.free_block(block as usize)?;
        }
        Ok(())
    }

    // -- public directory/file operations ------------------------------

    /// Lists the names of `dir`'s entries in stable insertion order.
    pub fn readdir(&mut self, dir: &DirectoryHandle) -> Result<Vec<String>> {
        let first = self.read_first_dir(dir.block_in_disk)?;
        let mut names = Vec::with_capacity(first.num_entries as usize);
        for idx in 0..first.num_entries as usize {
            let slot = self.get_slot(dir.block_in_disk, idx)?;
            names.push(self.read_fcb_at(slot)?.name_str().to_string());
        }
        Ok(names)
    }

    /// Opens the file named `name` inside `dir`.
    pub fn open_file(&mut self, dir: &DirectoryHandle, name: &str) -> Result<FileHandle> {
        let block = self.find_entry(dir.block_in_disk, name, false)?;
        let fcb = self.read_fcb_at(block)?;
        Ok(FileHandle {
            block_in_disk: block,
            fcb,
            pos_in_file: 0,
        })
    }

    /// Looks up the subdirectory named `name` inside `dir`.
    pub fn find_dir(&mut self, dir: &DirectoryHandle, name: &str) -> Result<DirectoryHandle> {
        let block = self.find_entry(dir.block_in_disk, name, true)?;
        let fcb = self.read_fcb_at(block)?;
        Ok(DirectoryHandle {
            block_in_disk: block,
            fcb,
            parent: Some(dir.block_in_disk),
        })
    }

    /// Creates a new, empty regular file named `name` in `dir`.
    pub fn create_file(&mut self, dir: &DirectoryHandle, name: &str) -> Result<FileHandle> {
        if self.disk.header().free_blocks <= 2 {
            return Err(SimpleFsError::DiskFull);
        }
        if self.find_entry(dir.block_in_disk, name, false).is_ok() {
            return Err(SimpleFsError::Exists);
        }

        let block_idx = self.disk.first_free(0)?.ok_or(SimpleFsError::DiskFull)? as i32;
        let fcb = FileControlBlock::new(dir.block_in_disk, block_idx, name, false);
        let first_block = FirstFileBlock::new(fcb);
        self.write_first_file(block_idx, &first_block)?;
        self.insert_entry(dir.block_in_disk, block_idx)?;

        trace!("created file {name:?} at block {block_idx}");
        Ok(FileHandle {
            block_in_disk: block_idx,
            fcb,
            pos_in_file: 0,
        })
    }

    /// Creates a new, empty subdirectory named `name` in `dir`.
    pub fn mkdir(&mut self, dir: &DirectoryHandle, name: &str) -> Result<DirectoryHandle> {
        if self.disk.header().free_blocks <= 1 {
            return Err(SimpleFsError::DiskFull);
        }
        if self.find_entry(dir.block_in_disk, name, true).is_ok() {
            return Err(SimpleFsError::Exists);
        }

        let block_idx = self.disk.first_free(0)?.ok_or(SimpleFsError::DiskFull)? as i32;
        let fcb = FileControlBlock::new(dir.block_in_disk, block_idx, name, true);
        let new_dir = FirstDirectoryBlock::new(fcb);
        self.write_first_dir(block_idx, &new_dir)?;
        self.insert_entry(dir.block_in_disk, block_idx)?;

        trace!("created directory {name:?} at block {block_idx}");
        Ok(DirectoryHandle {
            block_in_disk: block_idx,
            fcb,
            parent: Some(dir.block_in_disk),
        })
    }

    /// Moves `handle` to `name` (a child subdirectory) or, for `".."`,
    /// to its parent. Fails with `AtRoot` when `".."` is requested at the
    /// root.
    pub fn changedir(&mut self, handle: &mut DirectoryHandle, name: &str) -> Result<()> {
        if name == ".." {
            let parent_block = handle.parent.ok_or(SimpleFsError::AtRoot)?;
            let parent_fcb = self.read_fcb_at(parent_block)?;
            let grandparent = (parent_fcb.directory_block != NONE_BLOCK)
                .then_some(parent_fcb.directory_block);
            handle.block_in_disk = parent_block;
            handle.fcb = parent_fcb;
            handle.parent = grandparent;
            return Ok(());
        }

        let child_block = self.find_entry(handle.block_in_disk, name, true)?;
        let child_fcb = self.read_fcb_at(child_block)?;
        handle.parent = Some(handle.block_in_disk);
        handle.block_in_disk = child_block;
        handle.fcb = child_fcb;
        Ok(())
    }

    /// Moves `f`'s cursor to `pos`, which must lie within the capacity
    /// currently spanned by `f`'s block chain.
    pub fn seek(&mut self, f: &mut FileHandle, pos: usize) -> Result<()> {
        let chain_len = self.chain_blocks(f.block_in_disk)?.len();
        let capacity = FirstFileBlock::DATA_LEN + (chain_len - 1) * FileBlock::DATA_LEN;
        if pos > capacity {
            return Err(SimpleFsError::OutOfRange);
        }
        f.pos_in_file = pos;
        Ok(())
    }

    fn read_block_data(&mut self, block_idx: i32, is_first: bool) -> Result<Vec<u8>> {
        let buf = self.read_raw(block_idx)?;
        Ok(if is_first {
            FirstFileBlock::from_block(&buf).data
        } else {
            FileBlock::from_block(&buf).data
        })
    }

    /// Reads up to `size` bytes from `f`'s current position into `dst`,
    /// advancing the cursor by the number of bytes actually produced.
    pub fn read(&mut self, f: &mut FileHandle, dst: &mut [u8], size: usize) -> Result<usize> {
        if f.pos_in_file > f.fcb.size_in_bytes as usize {
            return Err(SimpleFsError::InvalidArgs);
        }

        let size = size.min(dst.len());
        let remaining_in_file = (f.fcb.size_in_bytes as usize).saturating_sub(f.pos_in_file);
        let to_read = size.min(remaining_in_file);

        let chain = self.chain_blocks(f.block_in_disk)?;
        let mut produced = 0usize;
        let mut pos = f.pos_in_file;

        while produced < to_read {
            let (node_idx, in_block_off) = file_offset_location(pos);
            let block_idx = *chain.get(node_idx).ok_or(SimpleFsError::CorruptChain)?;
            let data = self.read_block_data(block_idx, node_idx == 0)?;
            let n = (data.len() - in_block_off).min(to_read - produced);
            dst[produced..produced + n].copy_from_slice(&data[in_block_off..in_block_off + n]);
            produced += n;
            pos += n;
        }

        f.pos_in_file = pos;
        Ok(produced)
    }

    /// Extends the chain by one continuation `FileBlock`, linking it
    /// after `tail`.
    fn append_file_block(&mut self, tail: i32) -> Result<i32> {
        let tail_header = self.read_block_header(tail)?;
        let new_idx = self
            .disk
            .first_free(0)?
            .ok_or(SimpleFsError::DiskFull)? as i32;
        let new_block = FileBlock::new(tail_header.block_in_file + 1, tail);
        self.write_file_block(new_idx, &new_block)?;
        self.set_next_block(tail, new_idx)?;
        Ok(new_idx)
    }

    /// Returns the block index holding the data for `node_idx` in `head`'s
    /// chain, extending the chain one block at a time if necessary.
    fn ensure_file_block(&mut self, head: i32, node_idx: usize) -> Result<i32> {
        let chain = self.chain_blocks(head)?;
        if node_idx < chain.len() {
            return Ok(chain[node_idx]);
        }

        let mut tail = *chain.last().unwrap();
        let mut len = chain.len();
        while len <= node_idx {
            tail = self.append_file_block(tail)?;
            len += 1;
        }
        Ok(tail)
    }

    /// Writes `size` bytes from `src` starting at `f`'s current position,
    /// overwriting existing content and extending the chain as needed.
    /// If allocation runs out mid-write, returns the count of bytes
    /// actually written (already durable) rather than an error — matching
    /// a short write, not a failed one.
    pub fn write(&mut self, f: &mut FileHandle, src: &[u8], size: usize) -> Result<usize> {
        let size = size.min(src.len());
        let mut produced = 0usize;
        let mut pos = f.pos_in_file;

        while produced < size {
            let (node_idx, in_block_off) = file_offset_location(pos);
            let block_idx = match self.ensure_file_block(f.block_in_disk, node_idx) {
                Ok(idx) => idx,
                Err(SimpleFsError::DiskFull) => break,
                Err(e) => return Err(e),
            };
            let is_first = node_idx == 0;
            let cap = if is_first {
                FirstFileBlock::DATA_LEN
            } else {
                FileBlock::DATA_LEN
            };
            let n = (cap - in_block_off).min(size - produced);

            let mut buf = self.read_raw(block_idx)?;
            let data_off = if is_first {
                BLOCK_HEADER_SIZE + FCB_SIZE
            } else {
                BLOCK_HEADER_SIZE
            };
            buf[data_off + in_block_off..data_off + in_block_off + n]
                .copy_from_slice(&src[produced..produced + n]);
            self.disk.write_block(block_idx as usize, &buf)?;

            produced += n;
            pos += n;
        }

        f.pos_in_file = pos;
        let new_size = pos.max(f.fcb.size_in_bytes as usize);
        let chain_len = self.chain_blocks(f.block_in_disk)?.len();

        let mut first = self.read_first_file(f.block_in_disk)?;
        first.fcb.size_in_bytes = new_size as i32;
        first.fcb.size_in_blocks = chain_len as i32;
        self.write_first_file(f.block_in_disk, &first)?;
        f.fcb = first.fcb;

        self.disk.flush()?;
        trace!("wrote {produced} bytes to {:?}, new size {new_size}", f.name());
        Ok(produced)
    }

    /// Removes the entry named `name` from `dir`. If it is a directory,
    /// every entry inside it is removed first (the entry list is
    /// snapshotted before recursing, since removal mutates it).
    pub fn remove(&mut self, dir: &DirectoryHandle, name: &str) -> Result<()> {
        if let Ok(child_block) = self.find_entry(dir.block_in_disk, name, false) {
            self.remove_entry(dir.block_in_disk, name, false)?;
            self.free_chain(child_block)?;
            self.disk.flush()?;
            trace!("removed file {name:?}");
            return Ok(());
        }

        if let Ok(child_block) = self.find_entry(dir.block_in_disk, name, true) {
            let child = DirectoryHandle {
                block_in_disk: child_block,
                fcb: self.read_fcb_at(child_block)?,
                parent: Some(dir.block_in_disk),
            };
            let child_names = self.readdir(&child)?;
            for entry_name in child_names {
                self.remove(&child, &entry_name)?;
            }

            self.remove_entry(dir.block_in_disk, name, true)?;
            self.free_chain(child_block)?;
            self.disk.flush()?;
            trace!("recursively removed directory {name:?}");
            return Ok(());
        }

        Err(SimpleFsError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn scratch_fs(num_blocks: usize) -> (tempfile::TempDir, SimpleFs, DirectoryHandle) {
        let _ = env_logger::try_init();
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let (fs, root) = SimpleFs::init(&path, num_blocks).unwrap();
        (dir, fs, root)
    }

    #[test]
    fn format_and_init_creates_root() {
        let (_dir, mut fs, root) = scratch_fs(1000);
        assert_eq!(root.name(), "/");
        assert!(root.is_root());
        assert_eq!(fs.readdir(&root).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn create_then_reopen_rejects_duplicate() {
        let (_dir, mut fs, root) = scratch_fs(1000);
        let handle = fs.create_file(&root, "a.txt").unwrap();
        fs.close_file(handle);

        assert!(matches!(
            fs.create_file(&root, "a.txt"),
            Err(SimpleFsError::Exists)
        ));

        let opened = fs.open_file(&root, "a.txt").unwrap();
        assert_eq!(opened.name(), "a.txt");
    }

    #[test]
    fn mkdir_and_changedir_round_trip() {
        let (_dir, mut fs, root) = scratch_fs(1000);
        fs.mkdir(&root, "pluto").unwrap();

        let mut cursor = root.clone();
        fs.changedir(&mut cursor, "pluto").unwrap();
        assert_eq!(cursor.name(), "pluto");

        fs.changedir(&mut cursor, "..").unwrap();
        assert_eq!(cursor.name(), "/");

        assert!(matches!(
            fs.changedir(&mut cursor, ".."),
            Err(SimpleFsError::AtRoot)
        ));
    }

    #[test]
    fn large_write_spans_multiple_blocks_and_reads_back() {
        let (_dir, mut fs, root) = scratch_fs(1000);
        let mut f = fs.create_file(&root, "big.bin").unwrap();

        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let written = fs.write(&mut f, &payload, payload.len()).unwrap();
        assert_eq!(written, payload.len());

        let expected_blocks = if payload.len() <= FirstFileBlock::DATA_LEN {
            1
        } else {
            1 + (payload.len() - FirstFileBlock::DATA_LEN).div_ceil(FileBlock::DATA_LEN)
        };
        assert_eq!(f.fcb.size_in_blocks, expected_blocks as i32);

        fs.seek(&mut f, 0).unwrap();
        let mut buf = vec![0u8; payload.len()];
        let read = fs.read(&mut f, &mut buf, payload.len()).unwrap();
        assert_eq!(read, payload.len());
        assert_eq!(buf, payload);
    }

    #[test]
    fn short_write_within_first_block_reports_one_block() {
        let (_dir, mut fs, root) = scratch_fs(1000);
        let mut f = fs.create_file(&root, "small.txt").unwrap();
        let payload = b"a 420 byte-ish message".repeat(19); // well under first-block capacity
        fs.write(&mut f, &payload, payload.len()).unwrap();
        assert_eq!(f.fcb.size_in_blocks, 1);
    }

    #[test]
    fn recursive_remove_frees_every_block() {
        let (_dir, mut fs, root) = scratch_fs(1000);
        let free_before = fs.disk.header().free_blocks;

        let pluto = fs.mkdir(&root, "pluto").unwrap();
        fs.mkdir(&pluto, "sora").unwrap();
        let f = fs.create_file(&pluto, "prova.txt").unwrap();
        fs.close_file(f);

        fs.remove(&root, "pluto").unwrap();

        assert!(matches!(
            fs.find_dir(&root, "pluto"),
            Err(SimpleFsError::NotFound)
        ));
        assert_eq!(fs.readdir(&root).unwrap(), Vec::<String>::new());
        assert_eq!(fs.disk.header().free_blocks, free_before);
    }

    #[test]
    fn remove_nonexistent_is_not_found_and_leaves_bitmap_untouched() {
        let (_dir, mut fs, root) = scratch_fs(1000);
        let free_before = fs.disk.header().free_blocks;
        assert!(matches!(
            fs.remove(&root, "nope"),
            Err(SimpleFsError::NotFound)
        ));
        assert_eq!(fs.disk.header().free_blocks, free_before);
    }

    #[test]
    fn readdir_yields_insertion_order() {
        let (_dir, mut fs, root) = scratch_fs(1000);
        for name in ["b", "a", "c"] {
            let h = fs.create_file(&root, name).unwrap();
            fs.close_file(h);
        }
        assert_eq!(fs.readdir(&root).unwrap(), vec!["b", "a", "c"]);
    }

    #[test]
    fn directory_chain_grows_past_first_block_capacity() {
        let (_dir, mut fs, root) = scratch_fs(2000);
        let total = FIRST_DIR_ENTRIES + 5;
        for i in 0..total {
            let h = fs.create_file(&root, &format!("f{i}")).unwrap();
            fs.close_file(h);
        }
        let names = fs.readdir(&root).unwrap();
        assert_eq!(names.len(), total);
        for i in 0..total {
            assert!(fs.open_file(&root, &format!("f{i}")).is_ok());
        }
    }

    #[test]
    fn format_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let (mut fs, _root) = SimpleFs::init(&path, 100).unwrap();
        let header_before = fs.disk.header();
        SimpleFs::format(&mut fs.disk).unwrap();
        assert_eq!(fs.disk.header(), header_before);
    }

    #[test]
    fn create_file_fails_disk_full_at_two_free_blocks() {
        // format() consumes block 0 for the root, leaving exactly 2 free.
        let (_dir, mut fs, root) = scratch_fs(3);
        assert_eq!(fs.disk.header().free_blocks, 2);
        assert!(matches!(
            fs.create_file(&root, "a.txt"),
            Err(SimpleFsError::DiskFull)
        ));
    }

    #[test]
    fn mkdir_fails_disk_full_at_one_free_block() {
        // format() consumes block 0 for the root, leaving exactly 1 free.
        let (_dir, mut fs, root) = scratch_fs(2);
        assert_eq!(fs.disk.header().free_blocks, 1);
        assert!(matches!(
            fs.mkdir(&root, "pluto"),
            Err(SimpleFsError::DiskFull)
        ));
    }

    #[test]
    fn write_returns_partial_count_when_disk_fills_mid_write() {
        // format() uses block 0; create_file uses one more, leaving 2 free
        // blocks to extend the chain with before the disk is full.
        let (_dir, mut fs, root) = scratch_fs(4);
        let mut f = fs.create_file(&root, "big.bin").unwrap();

        let capacity_with_two_more_blocks = FirstFileBlock::DATA_LEN + 2 * FileBlock::DATA_LEN;
        let payload = vec![7u8; capacity_with_two_more_blocks + 50];

        let written = fs.write(&mut f, &payload, payload.len()).unwrap();
        assert_eq!(written, capacity_with_two_more_blocks);
        assert_eq!(f.fcb.size_in_bytes as usize, capacity_with_two_more_blocks);

        // Bytes already written stay durable even though the disk is full.
        fs.seek(&mut f, 0).unwrap();
        let mut buf = vec![0u8; capacity_with_two_more_blocks];
        let read = fs.read(&mut f, &mut buf, buf.len()).unwrap();
        assert_eq!(read, capacity_with_two_more_blocks);
        assert_eq!(buf, &payload[..capacity_with_two_more_blocks]);
    }

    #[test]
    fn cyclic_next_block_chain_is_corrupt() {
        let (_dir, mut fs, root) = scratch_fs(50);
        let mut f = fs.create_file(&root, "loop.bin").unwrap();
        let head = f.block_in_disk;

        // Wire a second block into the chain, then point it back at the
        // head, forming a cycle `chain_blocks` must not loop forever on.
        let extra = fs.disk.first_free(0).unwrap().unwrap() as i32;
        fs.write_file_block(extra, &FileBlock::new(1, head)).unwrap();
        fs.set_next_block(head, extra).unwrap();
        fs.set_next_block(extra, head).unwrap();

        assert!(matches!(
            fs.chain_blocks(head),
            Err(SimpleFsError::CorruptChain)
        ));
        assert!(matches!(
            fs.read(&mut f, &mut [0u8; 4], 4),
            Err(SimpleFsError::CorruptChain)
        ));
    }

    #[test]
    fn read_past_size_in_bytes_is_invalid_args() {
        let (_dir, mut fs, root) = scratch_fs(1000);
        let mut f = fs.create_file(&root, "short.txt").unwrap();
        fs.write(&mut f, b"hi", 2).unwrap();

        // Within the first block's capacity, but past size_in_bytes.
        fs.seek(&mut f, 100).unwrap();
        let mut buf = [0u8; 10];
        assert!(matches!(
            fs.read(&mut f, &mut buf, 10),
            Err(SimpleFsError::InvalidArgs)
        ));
    }
}
