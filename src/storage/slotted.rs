//! Slotted row layout for data pages.
//!
//! Rows grow forward from the end of the common header; the slot array
//! grows backward from the end of the page. Each slot is a 2-byte offset
//! to the start of a row, and slot `i` occupies the 2 bytes at
//! `pageSize − 2 − 2·i`, so slot 0 is the last 2 bytes of the page.
//!
//! A row is a 9-byte header followed by its body:
//!
//! ```text
//! [flag: u8][bodySize: u16][pk: u48]
//! ```
//!
//! Bit 0 of the flag marks a deleted row, bit 2 an overflow row. An
//! overflow row stores only the 4-byte id of its first overflow page
//! inline, while `bodySize` keeps the full logical payload size.
//!
//! Deleting a row sets the flag bit in place; space is never reclaimed
//! here. Because primary keys are issued monotonically and rows are only
//! appended, the slot array of every data page is sorted by pk and can
//! be binary-searched.
//!
//! # See Also
//! - [`overflow`](crate::storage::overflow): chains for oversized bodies.

use crate::codec;

use super::{
    PageError, PagerError, Pk, ShardError,
    page::{PAGE_HEADER_SIZE, Page},
};

pub const ROW_HEADER_SIZE: usize = 9;
pub const SLOT_SIZE: usize = 2;

/// `bodySize` is a u16; no row body may exceed this many bytes.
pub const MAX_BODY_SIZE: usize = 65535;

/// Flag bit marking a deleted row.
pub const FLAG_DELETED: u8 = 0;
/// Flag bit marking a row whose body lives in an overflow chain.
pub const FLAG_OVERFLOW: u8 = 2;

const ROW_FLAG: usize = 0;
const ROW_BODY_SIZE: usize = 1;
const ROW_PK: usize = 3;

/// Parsed 9-byte row header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowHeader {
    pub flag: u8,
    pub body_size: u16,
    pub pk: Pk,
}

impl RowHeader {
    pub fn deleted(&self) -> bool {
        codec::get_bit(self.flag, FLAG_DELETED)
    }

    pub fn overflow(&self) -> bool {
        codec::get_bit(self.flag, FLAG_OVERFLOW)
    }

    /// Bytes the body occupies inside the data page. Overflow rows store
    /// only the 4-byte head page id of their chain.
    pub fn stored_body_len(&self) -> usize {
        if self.overflow() { 4 } else { self.body_size as usize }
    }
}

/// Page bytes needed to place a row whose in-page body is `stored_len`
/// bytes: header, body, and one slot.
pub fn required_space(stored_len: usize) -> usize {
    ROW_HEADER_SIZE + stored_len + SLOT_SIZE
}

/// Whether the page has room for a row with an in-page body of
/// `stored_len` bytes.
pub fn fits(page: &Page, stored_len: usize) -> bool {
    page.remaining_capacity() as usize >= required_space(stored_len)
}

/// Appends a row and returns its slot index.
///
/// `body_size` is the logical body size recorded in the header; `body`
/// is what is stored in the page. They differ only for overflow rows.
///
/// # Errors
///
/// Fails with [`PageError::Full`] when the remaining capacity cannot
/// hold the row plus its slot.
pub fn insert_row(
    page: &mut Page,
    pk: Pk,
    flag: u8,
    body_size: u16,
    body: &[u8],
) -> Result<u16, ShardError> {
    if !fits(page, body.len()) {
        return Err(ShardError::Page {
            cause: PageError::Full,
        });
    }

    let count = page.inserted_row_count() as u16;
    let remaining = page.remaining_capacity() as usize;
    let rows_end = page.size() - remaining - SLOT_SIZE * count as usize;
    let slot_at = slot_pos(page.size(), count);

    let buf = page.as_bytes_mut();
    buf[rows_end + ROW_FLAG] = flag;
    codec::write_u16(buf, rows_end + ROW_BODY_SIZE, body_size);
    codec::write_u48(buf, rows_end + ROW_PK, pk);
    buf[rows_end + ROW_HEADER_SIZE..rows_end + ROW_HEADER_SIZE + body.len()]
        .copy_from_slice(body);
    codec::write_u16(buf, slot_at, rows_end as u16);

    page.set_inserted_row_count(count as u32 + 1);
    page.set_remaining_capacity((remaining - required_space(body.len())) as u32);
    Ok(count)
}

/// Parses the header of the row at `slot`.
pub fn row_header(page: &Page, slot: u16) -> Result<RowHeader, ShardError> {
    let offset = slot_offset(page, slot)?;
    let buf = page.as_bytes();
    Ok(RowHeader {
        flag: buf[offset + ROW_FLAG],
        body_size: codec::read_u16(buf, offset + ROW_BODY_SIZE),
        pk: codec::read_u48(buf, offset + ROW_PK),
    })
}

/// Reads the row at `slot`: parsed header plus the in-page body bytes.
pub fn read_row(page: &Page, slot: u16) -> Result<(RowHeader, Vec<u8>), ShardError> {
    let offset = slot_offset(page, slot)?;
    let header = row_header(page, slot)?;

    let body_start = offset + ROW_HEADER_SIZE;
    let body_end = body_start + header.stored_body_len();
    if body_end > slot_array_start(page) {
        return Err(corrupt(page, "row overruns the slot array"));
    }
    Ok((header, page.read_bytes(body_start, body_end - body_start).to_vec()))
}

/// Sets or clears the deleted bit of the row at `slot`, returning the
/// prior flag byte.
pub fn set_deleted(page: &mut Page, slot: u16, deleted: bool) -> Result<u8, ShardError> {
    let offset = slot_offset(page, slot)?;
    let buf = page.as_bytes_mut();
    let prior = buf[offset + ROW_FLAG];
    buf[offset + ROW_FLAG] = if deleted {
        codec::set_bit(prior, FLAG_DELETED)
    } else {
        codec::clear_bit(prior, FLAG_DELETED)
    };
    Ok(prior)
}

/// Binary-searches the slot array for `pk`.
pub fn find_pk(page: &Page, pk: Pk) -> Result<Option<u16>, ShardError> {
    let count = page.inserted_row_count() as u16;
    codec::binary_search_by_key(count, pk, |slot| row_header(page, slot).map(|h| h.pk))
}

/// Re-derives the free byte count from the slot array and compares it to
/// the header field. Run when a page is loaded for structural mutation.
pub fn verify_capacity(page: &Page) -> Result<(), ShardError> {
    let count = page.inserted_row_count() as u16;
    let rows_end = if count == 0 {
        PAGE_HEADER_SIZE
    } else {
        let offset = slot_offset(page, count - 1)?;
        let header = row_header(page, count - 1)?;
        offset + ROW_HEADER_SIZE + header.stored_body_len()
    };

    let expected = page.size() - rows_end - SLOT_SIZE * count as usize;
    if page.remaining_capacity() as usize != expected {
        return Err(corrupt(page, "remaining capacity mismatch"));
    }
    Ok(())
}

/// Absolute position of slot `slot`'s 2 bytes.
fn slot_pos(page_size: usize, slot: u16) -> usize {
    page_size - SLOT_SIZE - SLOT_SIZE * slot as usize
}

/// First byte of the slot array given the current row count.
fn slot_array_start(page: &Page) -> usize {
    page.size() - SLOT_SIZE * page.inserted_row_count() as usize
}

/// Resolves `slot` to its row offset, validating both the slot index and
/// the stored offset.
fn slot_offset(page: &Page, slot: u16) -> Result<usize, ShardError> {
    let count = page.inserted_row_count() as u16;
    if slot >= count {
        return Err(ShardError::Page {
            cause: PageError::InvalidSlot { slot },
        });
    }

    let offset = codec::read_u16(page.as_bytes(), slot_pos(page.size(), slot)) as usize;
    if offset < PAGE_HEADER_SIZE || offset + ROW_HEADER_SIZE > slot_array_start(page) {
        return Err(corrupt(page, "slot offset out of range"));
    }
    Ok(offset)
}

fn corrupt(page: &Page, reason: &'static str) -> ShardError {
    ShardError::Pager {
        cause: PagerError::CorruptPage {
            id: page.page_id(),
            reason,
        },
    }
}
