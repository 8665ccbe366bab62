//! Core abstractions and implementation for the paged storage layer.
//!
//! This module hosts the on-disk primitives of a shard file: fixed-size
//! [`Page`](page::Page) buffers, the [`Pager`](pager::Pager) that moves
//! them between memory and the backing file, the slotted-row layout of
//! data pages, and overflow chains for bodies that do not fit inline.
//!
//! # Overview
//!
//! A shard is a single file made of fixed-size pages. Page 0 is the
//! metadata page; data pages form a singly linked chain that receives
//! inserted rows; overflow pages hold the bodies of rows too large for a
//! data page. Every page carries a common 100-byte header whose checksum
//! covers the rest of the page.
//!
//! # Key Components
//!
//! - [`pager::Pager`]: file I/O by page id, page allocation, metadata.
//! - [`slotted`]: row placement inside a data page.
//! - [`overflow`]: chains for oversized row bodies.
//! - [`ShardError`]: the error tree surfaced by every public operation.
//!
//! # See Also
//! - [`shard`](crate::shard): the facade composing these pieces.
pub mod overflow;
pub mod page;
pub mod pager;
pub mod slotted;

use std::io;

use thiserror::Error;

/// Identifier of a page within the shard file.
pub type PageId = u32;

/// Primary key of a row; 6 bytes on disk, issued strictly increasing.
pub type Pk = u64;

/// `nextPageId` sentinel marking the end of a page chain.
pub const PAGE_ID_NONE: PageId = 0xFFFF_FFFF;

/// Physical address of a row: its slot inside a specific data page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rid {
    pub slot: u16,
    pub page_id: PageId,
}

/// List of possible errors that can be thrown by the storage module
#[derive(Debug, Error)]
pub enum ShardError {
    #[error("page error: {cause}")]
    Page { cause: PageError },

    #[error("paging error: {cause}")]
    Pager { cause: PagerError },

    #[error("transaction error: {cause}")]
    Transaction { cause: TransactionError },

    #[error("row with pk {pk} does not exist")]
    NotFound { pk: Pk },

    #[error("row body is not valid UTF-8: {cause}")]
    Codec { cause: std::string::FromUtf8Error },

    #[error("shard is not initialized")]
    Uninitialized,

    #[error("shard is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum PageError {
    #[error("out of space")]
    Full,
    #[error("slot {slot} does not exist")]
    InvalidSlot { slot: u16 },
    #[error("row body of {size} bytes exceeds the 65535 byte limit")]
    RowTooLarge { size: usize },
}

#[derive(Debug, Error)]
pub enum PagerError {
    #[error("io error; {0}")]
    Io(#[from] io::Error),
    #[error("invalid shard file: {reason}")]
    InvalidShardFile { reason: &'static str },
    #[error("corrupt page {id}: {reason}")]
    CorruptPage { id: PageId, reason: &'static str },
    #[error("page size {size} is invalid; expected a power of two in [256, 65536]")]
    InvalidPageSize { size: usize },
    #[error("primary key space exhausted")]
    PkExhausted,
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("transaction is closed")]
    Closed,
    #[error("write conflict on pk {pk}")]
    WriteConflict { pk: Pk },
}

impl From<PageError> for ShardError {
    fn from(cause: PageError) -> Self {
        ShardError::Page { cause }
    }
}

impl From<PagerError> for ShardError {
    fn from(cause: PagerError) -> Self {
        ShardError::Pager { cause }
    }
}

impl From<TransactionError> for ShardError {
    fn from(cause: TransactionError) -> Self {
        ShardError::Transaction { cause }
    }
}
