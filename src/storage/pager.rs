//! Disk-backed page management layer.
//!
//! The `pager` module defines the [`Pager`] struct, which is responsible
//! for moving [`Page`] structures between memory and the backing shard
//! file, for allocating new pages, and for maintaining the metadata page
//! (page 0) that anchors the whole file.
//!
//! # Responsibilities
//!
//! - Validating an existing shard file at open (magic, format version,
//!   metadata checksum).
//! - Reading and writing fixed-size pages at `pageId × pageSize`.
//! - Allocating pages, preferring the metadata free list over extending
//!   the file.
//! - Issuing monotonically increasing primary keys from the persisted
//!   counter.
//!
//! # Metadata page
//!
//! Page 0 stores, in its body: the magic number `"DPLY"`, the format
//! version, the page size, the next free page id, the next primary key,
//! the root index page id, the head and current pages of the data chain,
//! and the free list. Every field is little-endian; the layout constants
//! below are the authoritative offsets.
//!
//! # Design Notes
//!
//! - Writes are write-through: `write_page` seals the checksum, writes
//!   the full page, and flushes, so the file is authoritative once the
//!   call returns.
//! - Corruption is surfaced, never repaired: a checksum or page-id
//!   mismatch fails the read with [`PagerError::CorruptPage`].
//!
//! # See Also
//! - [`Page`]: The fixed-size unit of storage.
use std::{
    fs::{File, OpenOptions},
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::PathBuf,
};

use log::{debug, info, trace};

use crate::codec;

use super::{
    PageId, PagerError, Pk, ShardError,
    page::{MAX_PAGE_SIZE, MIN_PAGE_SIZE, PAGE_HEADER_SIZE, Page, PageType},
};

pub const MAGIC: &[u8; 4] = b"DPLY";
pub const FORMAT_VERSION: u16 = 1;

const METADATA_PAGE_ID: PageId = 0;

// Metadata body layout; offsets are absolute within page 0.
const META_MAGIC: usize = PAGE_HEADER_SIZE;
const META_VERSION: usize = META_MAGIC + 4;
const META_PAGE_SIZE: usize = META_VERSION + 2;
const META_NEXT_PAGE_ID: usize = META_PAGE_SIZE + 4;
const META_NEXT_PK: usize = META_NEXT_PAGE_ID + 4;
const META_ROOT_INDEX: usize = META_NEXT_PK + 6;
const META_HEAD_DATA: usize = META_ROOT_INDEX + 4;
const META_CURRENT_DATA: usize = META_HEAD_DATA + 4;
const META_FREE_LEN: usize = META_CURRENT_DATA + 4;
const META_FREE_LIST: usize = META_FREE_LEN + 2;

/// Bytes that must be present to learn the page size of an existing
/// file: the common header plus the magic, version, and pageSize fields.
const META_PROBE_LEN: usize = META_NEXT_PAGE_ID;

/// In-memory mirror of the metadata page.
#[derive(Debug, Clone)]
pub struct ShardMetadata {
    pub page_size: u32,
    pub next_page_id: PageId,
    pub next_pk: Pk,
    /// Root of the B+Tree index; 0 while no index has been built.
    pub root_index_page: PageId,
    /// First page of the data chain; 0 while no row has been inserted.
    pub head_data_page: PageId,
    /// Page currently receiving inserts; 0 while no row has been inserted.
    pub current_data_page: PageId,
    pub free_pages: Vec<PageId>,
}

impl ShardMetadata {
    fn fresh(page_size: u32) -> Self {
        Self {
            page_size,
            next_page_id: 1,
            next_pk: 1,
            root_index_page: 0,
            head_data_page: 0,
            current_data_page: 0,
            free_pages: Vec::new(),
        }
    }

    /// Number of free-list entries the metadata body can hold.
    fn free_list_capacity(page_size: usize) -> usize {
        (page_size - META_FREE_LIST) / 4
    }

    fn encode(&self, page: &mut Page) {
        page.write_bytes(META_MAGIC, MAGIC);
        let buf = page.as_bytes_mut();
        codec::write_u16(buf, META_VERSION, FORMAT_VERSION);
        codec::write_u32(buf, META_PAGE_SIZE, self.page_size);
        codec::write_u32(buf, META_NEXT_PAGE_ID, self.next_page_id);
        codec::write_u48(buf, META_NEXT_PK, self.next_pk);
        codec::write_u32(buf, META_ROOT_INDEX, self.root_index_page);
        codec::write_u32(buf, META_HEAD_DATA, self.head_data_page);
        codec::write_u32(buf, META_CURRENT_DATA, self.current_data_page);
        codec::write_u16(buf, META_FREE_LEN, self.free_pages.len() as u16);
        let mut offset = META_FREE_LIST;
        for id in &self.free_pages {
            codec::write_u32(buf, offset, *id);
            offset += 4;
        }
    }

    fn decode(page: &Page) -> Result<Self, PagerError> {
        let buf = page.as_bytes();
        if &buf[META_MAGIC..META_MAGIC + 4] != MAGIC {
            return Err(PagerError::InvalidShardFile {
                reason: "bad magic number",
            });
        }
        if codec::read_u16(buf, META_VERSION) != FORMAT_VERSION {
            return Err(PagerError::InvalidShardFile {
                reason: "unsupported format version",
            });
        }
        let free_len = codec::read_u16(buf, META_FREE_LEN) as usize;
        if free_len > Self::free_list_capacity(buf.len()) {
            return Err(PagerError::InvalidShardFile {
                reason: "free list overruns the metadata page",
            });
        }
        let mut free_pages = Vec::with_capacity(free_len);
        let mut offset = META_FREE_LIST;
        for _ in 0..free_len {
            free_pages.push(codec::read_u32(buf, offset));
            offset += 4;
        }
        Ok(Self {
            page_size: codec::read_u32(buf, META_PAGE_SIZE),
            next_page_id: codec::read_u32(buf, META_NEXT_PAGE_ID),
            next_pk: codec::read_u48(buf, META_NEXT_PK),
            root_index_page: codec::read_u32(buf, META_ROOT_INDEX),
            head_data_page: codec::read_u32(buf, META_HEAD_DATA),
            current_data_page: codec::read_u32(buf, META_CURRENT_DATA),
            free_pages,
        })
    }
}

#[derive(Debug)]
pub struct Pager {
    metadata: ShardMetadata,
    page_size: usize,
    reader: BufReader<File>,
    writer: BufWriter<File>,
    fresh: bool,
}

impl Pager {
    /// Opens or creates the shard file.
    ///
    /// A non-empty file has its metadata page validated immediately:
    /// magic, format version, and checksum must all hold, otherwise the
    /// open fails with `InvalidShardFile`. The persisted page size wins
    /// over `page_size` for existing files.
    pub fn open(path: PathBuf, page_size: usize) -> Result<Self, ShardError> {
        let f = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| ShardError::Pager {
                cause: PagerError::Io(e),
            })?;

        let file_len = f
            .metadata()
            .map_err(|e| ShardError::Pager {
                cause: PagerError::Io(e),
            })?
            .len();
        let mut reader = BufReader::new(f.try_clone().map_err(|e| ShardError::Pager {
            cause: PagerError::Io(e),
        })?);
        let writer = BufWriter::new(f);

        let (metadata, fresh) = if file_len == 0 {
            if !Self::plausible_page_size(page_size) {
                return Err(ShardError::Pager {
                    cause: PagerError::InvalidPageSize { size: page_size },
                });
            }
            (ShardMetadata::fresh(page_size as u32), true)
        } else {
            (Self::validate_existing(&mut reader, file_len)?, false)
        };

        let page_size = metadata.page_size as usize;
        Ok(Self {
            metadata,
            page_size,
            reader,
            writer,
            fresh,
        })
    }

    /// Formats the metadata page of a freshly created file. Loading an
    /// existing file happened at `open`; calling this again is a no-op.
    pub fn init(&mut self) -> Result<(), ShardError> {
        if self.fresh {
            self.write_metadata()?;
            self.fresh = false;
            info!("formatted new shard file, page size {}", self.page_size);
        }
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn metadata(&self) -> &ShardMetadata {
        &self.metadata
    }

    /// Read a page present in the shard file.
    ///
    /// # Errors
    ///
    /// Fails with `CorruptPage` if `id` has never been allocated, if the
    /// stored page id disagrees with the requested one, or if the
    /// checksum does not match the contents.
    pub fn read_page(&mut self, id: PageId) -> Result<Page, ShardError> {
        if id >= self.metadata.next_page_id {
            return Err(ShardError::Pager {
                cause: PagerError::CorruptPage {
                    id,
                    reason: "page id out of range",
                },
            });
        }

        let mut buf = vec![0; self.page_size];
        self.read_bytes(id as u64 * self.page_size as u64, &mut buf)?;
        let page = Page::from_bytes(buf);

        if page.page_id() != id {
            return Err(ShardError::Pager {
                cause: PagerError::CorruptPage {
                    id,
                    reason: "page id mismatch",
                },
            });
        }
        if !page.verify_checksum() {
            return Err(ShardError::Pager {
                cause: PagerError::CorruptPage {
                    id,
                    reason: "checksum mismatch",
                },
            });
        }

        trace!("read page {id}");
        Ok(page)
    }

    /// Seals the page checksum and writes the full page at
    /// `pageId × pageSize`.
    pub fn write_page(&mut self, page: &mut Page) -> Result<(), ShardError> {
        page.seal();
        let offset = page.page_id() as u64 * self.page_size as u64;
        let id = page.page_id();
        self.write_bytes(offset, page.as_bytes())?;
        trace!("wrote page {id}");
        Ok(())
    }

    /// Allocates a page, preferring the metadata free list over
    /// extending the file. The returned page is already persisted with a
    /// pre-populated header.
    pub fn allocate_page(&mut self, _type: PageType) -> Result<Page, ShardError> {
        let id = match self.metadata.free_pages.pop() {
            Some(id) => id,
            None => {
                let id = self.metadata.next_page_id;
                self.metadata.next_page_id += 1;
                id
            }
        };
        self.write_metadata()?;

        let mut page = Page::new(self.page_size, _type, id);
        self.write_page(&mut page)?;
        debug!("allocated page {id} ({:?})", _type);
        Ok(page)
    }

    /// Returns a page to the allocation pool.
    ///
    /// The core row path never frees pages; this exists for the format's
    /// free list. When the list cannot hold another entry the page is
    /// leaked rather than failing the caller.
    pub fn free_page(&mut self, id: PageId) -> Result<(), ShardError> {
        if self.metadata.free_pages.len() >= ShardMetadata::free_list_capacity(self.page_size) {
            debug!("free list full; leaking page {id}");
            return Ok(());
        }
        self.metadata.free_pages.push(id);
        self.write_metadata()
    }

    /// Issues the next primary key and persists the counter.
    pub fn allocate_pk(&mut self) -> Result<Pk, ShardError> {
        let pk = self.metadata.next_pk;
        if pk > codec::U48_MAX {
            return Err(ShardError::Pager {
                cause: PagerError::PkExhausted,
            });
        }
        self.metadata.next_pk += 1;
        self.write_metadata()?;
        Ok(pk)
    }

    pub fn set_head_data_page(&mut self, id: PageId) -> Result<(), ShardError> {
        self.metadata.head_data_page = id;
        self.write_metadata()
    }

    pub fn set_current_data_page(&mut self, id: PageId) -> Result<(), ShardError> {
        self.metadata.current_data_page = id;
        self.write_metadata()
    }

    /// Persists metadata and flushes any buffered writes.
    pub fn flush(&mut self) -> Result<(), ShardError> {
        self.write_metadata()?;
        self.writer.flush().map_err(|e| ShardError::Pager {
            cause: PagerError::Io(e),
        })
    }

    fn write_metadata(&mut self) -> Result<(), ShardError> {
        let mut page = Page::new(self.page_size, PageType::Metadata, METADATA_PAGE_ID);
        self.metadata.encode(&mut page);
        self.write_page(&mut page)
    }

    fn plausible_page_size(size: usize) -> bool {
        (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size) && size.is_power_of_two()
    }

    fn validate_existing(
        reader: &mut BufReader<File>,
        file_len: u64,
    ) -> Result<ShardMetadata, ShardError> {
        let invalid = |reason: &'static str| ShardError::Pager {
            cause: PagerError::InvalidShardFile { reason },
        };

        if file_len < META_PROBE_LEN as u64 {
            return Err(invalid("file too small for a metadata page"));
        }

        let mut probe = [0u8; META_PROBE_LEN];
        reader
            .seek(SeekFrom::Start(0))
            .and_then(|_| reader.read_exact(&mut probe))
            .map_err(|e| ShardError::Pager {
                cause: PagerError::Io(e),
            })?;

        if &probe[META_MAGIC..META_MAGIC + 4] != MAGIC {
            return Err(invalid("bad magic number"));
        }
        if codec::read_u16(&probe, META_VERSION) != FORMAT_VERSION {
            return Err(invalid("unsupported format version"));
        }
        let page_size = codec::read_u32(&probe, META_PAGE_SIZE) as usize;
        if !Self::plausible_page_size(page_size) {
            return Err(invalid("implausible page size"));
        }
        if file_len < page_size as u64 {
            return Err(invalid("truncated metadata page"));
        }

        let mut buf = vec![0; page_size];
        reader
            .seek(SeekFrom::Start(0))
            .and_then(|_| reader.read_exact(&mut buf))
            .map_err(|e| ShardError::Pager {
                cause: PagerError::Io(e),
            })?;
        let page = Page::from_bytes(buf);

        if page.page_type() != Some(PageType::Metadata) || page.page_id() != METADATA_PAGE_ID {
            return Err(invalid("page 0 is not a metadata page"));
        }
        if !page.verify_checksum() {
            return Err(invalid("metadata checksum mismatch"));
        }

        let metadata = ShardMetadata::decode(&page).map_err(|cause| ShardError::Pager { cause })?;
        trace!("shard metadata: {metadata:?}");
        Ok(metadata)
    }

    fn read_bytes(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), ShardError> {
        self.reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| ShardError::Pager {
                cause: PagerError::Io(e),
            })?;
        self.reader
            .read_exact(buf)
            .map_err(|e| ShardError::Pager {
                cause: PagerError::Io(e),
            })?;

        Ok(())
    }

    fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> Result<(), ShardError> {
        self.writer
            .seek(SeekFrom::Start(offset))
            .map_err(|e| ShardError::Pager {
                cause: PagerError::Io(e),
            })?;
        self.writer
            .write_all(bytes)
            .map_err(|e| ShardError::Pager {
                cause: PagerError::Io(e),
            })?;
        self.writer.flush().map_err(|e| ShardError::Pager {
            cause: PagerError::Io(e),
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempdir::TempDir;

    use crate::storage::PAGE_ID_NONE;

    use super::*;

    fn open_pager(dir: &TempDir, page_size: usize) -> Pager {
        let mut pager = Pager::open(dir.path().join("data.shard"), page_size).unwrap();
        pager.init().unwrap();
        pager
    }

    #[test]
    fn init_writes_one_metadata_page() {
        let temp = TempDir::new("pager").unwrap();
        let _ = open_pager(&temp, 4096);

        let bytes = fs::read(temp.path().join("data.shard")).unwrap();
        assert_eq!(bytes.len(), 4096);
        assert_eq!(&bytes[META_MAGIC..META_MAGIC + 4], b"DPLY");
    }

    #[test]
    fn rejects_invalid_page_sizes() {
        let temp = TempDir::new("pager").unwrap();
        for size in [0, 128, 255, 3000, 131072] {
            let result = Pager::open(temp.path().join("bad.shard"), size);
            assert!(matches!(
                result,
                Err(ShardError::Pager {
                    cause: PagerError::InvalidPageSize { .. }
                })
            ));
        }
    }

    #[test]
    fn open_rejects_garbage_file() {
        let temp = TempDir::new("pager").unwrap();
        let path = temp.path().join("data.shard");
        fs::write(&path, b"invalid data").unwrap();

        let result = Pager::open(path, 4096);
        assert!(matches!(
            result,
            Err(ShardError::Pager {
                cause: PagerError::InvalidShardFile { .. }
            })
        ));
    }

    #[test]
    fn open_rejects_unknown_version() {
        let temp = TempDir::new("pager").unwrap();
        let path = temp.path().join("data.shard");
        {
            let _ = open_pager(&temp, 4096);
        }

        let mut bytes = fs::read(&path).unwrap();
        codec::write_u16(&mut bytes, META_VERSION, 99);
        // Re-seal so only the version is wrong.
        let mut page = Page::from_bytes(bytes);
        page.seal();
        fs::write(&path, page.as_bytes()).unwrap();

        let result = Pager::open(path, 4096);
        assert!(matches!(
            result,
            Err(ShardError::Pager {
                cause: PagerError::InvalidShardFile {
                    reason: "unsupported format version"
                }
            })
        ));
    }

    #[test]
    fn open_rejects_tampered_metadata() {
        let temp = TempDir::new("pager").unwrap();
        let path = temp.path().join("data.shard");
        {
            let _ = open_pager(&temp, 4096);
        }

        let mut bytes = fs::read(&path).unwrap();
        bytes[300] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let result = Pager::open(path, 4096);
        assert!(matches!(
            result,
            Err(ShardError::Pager {
                cause: PagerError::InvalidShardFile {
                    reason: "metadata checksum mismatch"
                }
            })
        ));
    }

    #[test]
    fn pager_allocate() {
        let temp = TempDir::new("pager").unwrap();
        let mut pager = open_pager(&temp, 4096);

        let page = pager.allocate_page(PageType::Data).unwrap();
        assert_eq!(page.page_id(), 1);
        assert_eq!(page.next_page_id(), PAGE_ID_NONE);
        assert_eq!(page.remaining_capacity(), 4096 - 100);
        assert_eq!(pager.metadata().next_page_id, 2);
    }

    #[test]
    fn pager_write_read_roundtrip() {
        let temp = TempDir::new("pager").unwrap();
        let mut pager = open_pager(&temp, 4096);

        let mut page = pager.allocate_page(PageType::Data).unwrap();
        page.write_bytes(PAGE_HEADER_SIZE, b"hello page");
        pager.write_page(&mut page).unwrap();

        let loaded = pager.read_page(page.page_id()).unwrap();
        assert_eq!(loaded.read_bytes(PAGE_HEADER_SIZE, 10), b"hello page");
        assert_eq!(loaded.page_type(), Some(PageType::Data));
    }

    #[test]
    fn read_detects_corruption() {
        let temp = TempDir::new("pager").unwrap();
        let path = temp.path().join("data.shard");
        let mut pager = open_pager(&temp, 4096);

        let mut page = pager.allocate_page(PageType::Data).unwrap();
        pager.write_page(&mut page).unwrap();

        // Damage the page body behind the pager's back.
        let mut bytes = fs::read(&path).unwrap();
        bytes[4096 + 2000] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let result = pager.read_page(1);
        assert!(matches!(
            result,
            Err(ShardError::Pager {
                cause: PagerError::CorruptPage {
                    reason: "checksum mismatch",
                    ..
                }
            })
        ));
    }

    #[test]
    fn read_rejects_unallocated_id() {
        let temp = TempDir::new("pager").unwrap();
        let mut pager = open_pager(&temp, 4096);

        assert!(matches!(
            pager.read_page(5),
            Err(ShardError::Pager {
                cause: PagerError::CorruptPage {
                    reason: "page id out of range",
                    ..
                }
            })
        ));
    }

    #[test]
    fn metadata_survives_reopen() {
        let temp = TempDir::new("pager").unwrap();
        let path = temp.path().join("data.shard");

        {
            let mut pager = open_pager(&temp, 4096);
            pager.allocate_page(PageType::Data).unwrap();
            pager.allocate_pk().unwrap();
            pager.allocate_pk().unwrap();
            pager.set_head_data_page(1).unwrap();
            pager.set_current_data_page(1).unwrap();
            pager.flush().unwrap();
        }

        let pager = Pager::open(path, 4096).unwrap();
        assert_eq!(pager.metadata().next_page_id, 2);
        assert_eq!(pager.metadata().next_pk, 3);
        assert_eq!(pager.metadata().head_data_page, 1);
        assert_eq!(pager.metadata().current_data_page, 1);
        assert_eq!(pager.page_size(), 4096);
    }

    #[test]
    fn pager_free_list_reuse() {
        let temp = TempDir::new("pager").unwrap();
        let mut pager = open_pager(&temp, 4096);

        let _ = pager.allocate_page(PageType::Data).unwrap();
        let freed = pager.allocate_page(PageType::Data).unwrap().page_id();
        let _ = pager.allocate_page(PageType::Data).unwrap();

        pager.free_page(freed).unwrap();
        assert_eq!(pager.allocate_page(PageType::Data).unwrap().page_id(), freed);
    }

    #[test]
    fn existing_page_size_wins_over_option() {
        let temp = TempDir::new("pager").unwrap();
        let path = temp.path().join("data.shard");
        {
            let _ = open_pager(&temp, 1024);
        }

        let pager = Pager::open(path, 8192).unwrap();
        assert_eq!(pager.page_size(), 1024);
    }
}
