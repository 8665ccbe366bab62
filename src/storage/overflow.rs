//! Overflow chains for row bodies that do not fit a data page.
//!
//! A body of L bytes is split across ⌈L / (pageSize − 100)⌉ overflow
//! pages linked through their `nextPageId` headers; the last page of the
//! chain carries the end-of-chain sentinel. The owning row keeps only
//! the id of the first chain page inline, with its `bodySize` field
//! recording the full logical size.
//!
//! Reading walks the chain and concatenates page bodies until the
//! logical size has been collected; a chain that ends early is reported
//! as corruption.

use log::debug;

use super::{
    PAGE_ID_NONE, PageId, PagerError, ShardError,
    page::{PAGE_HEADER_SIZE, Page, PageType},
    pager::Pager,
};

/// Payload bytes one overflow page can hold.
pub fn page_capacity(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE
}

/// Writes `payload` into a freshly allocated chain of overflow pages and
/// returns the id of the chain head.
pub fn write_chain(pager: &mut Pager, payload: &[u8]) -> Result<PageId, ShardError> {
    let capacity = page_capacity(pager.page_size());
    let count = payload.len().div_ceil(capacity).max(1);

    let mut pages: Vec<Page> = Vec::with_capacity(count);
    for _ in 0..count {
        pages.push(pager.allocate_page(PageType::Overflow)?);
    }
    for index in 0..count - 1 {
        let next = pages[index + 1].page_id();
        pages[index].set_next_page_id(next);
    }

    for (page, chunk) in pages.iter_mut().zip(payload.chunks(capacity)) {
        page.write_bytes(PAGE_HEADER_SIZE, chunk);
        page.set_remaining_capacity((capacity - chunk.len()) as u32);
    }
    for page in &mut pages {
        pager.write_page(page)?;
    }

    let head = pages[0].page_id();
    debug!(
        "wrote overflow chain of {count} pages for {} bytes, head {head}",
        payload.len()
    );
    Ok(head)
}

/// Reassembles `total` payload bytes starting from the chain page
/// `head`.
pub fn read_chain(pager: &mut Pager, head: PageId, total: usize) -> Result<Vec<u8>, ShardError> {
    let capacity = page_capacity(pager.page_size());
    let mut payload = Vec::with_capacity(total);
    let mut current = head;

    while payload.len() < total {
        if current == PAGE_ID_NONE {
            return Err(ShardError::Pager {
                cause: PagerError::CorruptPage {
                    id: head,
                    reason: "overflow chain shorter than the row body",
                },
            });
        }
        let page = pager.read_page(current)?;
        if page.page_type() != Some(PageType::Overflow) {
            return Err(ShardError::Pager {
                cause: PagerError::CorruptPage {
                    id: current,
                    reason: "expected an overflow page",
                },
            });
        }

        let take = capacity.min(total - payload.len());
        payload.extend_from_slice(page.read_bytes(PAGE_HEADER_SIZE, take));
        current = page.next_page_id();
    }

    Ok(payload)
}
