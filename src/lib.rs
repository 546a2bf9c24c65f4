//! A block-structured hierarchical file system backed by a single
//! memory-mapped host file.
//!
//! The on-disk layout is a fixed [`layout::DiskHeader`], a packed
//! [`bitmap::Bitmap`] tracking block occupancy, and a flat array of
//! [`layout::BLOCK_SIZE`]-byte blocks. Files and directories are both
//! linked lists of blocks threaded through [`layout::BlockHeader`]; the
//! first block of each carries a [`layout::FileControlBlock`] with the
//! object's name and size. [`disk::DiskDriver`] owns the memory map and
//! enforces the bitmap; [`fs::SimpleFs`] builds directories, files, and
//! path navigation on top of it.
//!
//! ```no_run
//! use simplefs::SimpleFs;
//!
//! let (mut fs, root) = SimpleFs::init("disk.img".as_ref(), 1000)?;
//! let mut file = fs.create_file(&root, "hello.txt")?;
//! fs.write(&mut file, b"hi", 2)?;
//! fs.close_file(file);
//! # Ok::<(), simplefs::SimpleFsError>(())
//! ```

pub mod bitmap;
pub mod disk;
pub mod error;
pub mod fs;
pub mod layout;

pub use disk::DiskDriver;
pub use error::{Result, SimpleFsError};
pub use fs::{DirectoryHandle, FileHandle, SimpleFs};
pub use layout::BLOCK_SIZE;
