//! Shard facade: the public entry points of the engine.
//!
//! A [`Shard`] owns one storage file. Records (strings or raw byte
//! blobs) are inserted and retrieved by a monotonically issued 6-byte
//! primary key; oversized bodies are split across an overflow chain.
//! Mutations may run under a [`Transaction`], which journals them for
//! rollback and hides uncommitted deletes from other readers.
//!
//! # Example
//! ```rust
//! use dataply::{Shard, ShardOptions};
//!
//! let dir = tempdir::TempDir::new("shard-example").unwrap();
//! let shard = Shard::open(dir.path().join("data.shard"), ShardOptions::default()).unwrap();
//! shard.init().unwrap();
//!
//! let pk = shard.insert("Hello, World!", None).unwrap();
//! assert_eq!(shard.select(pk, None).unwrap().as_deref(), Some("Hello, World!"));
//!
//! let tx = shard.create_transaction().unwrap();
//! shard.delete(pk, Some(&tx)).unwrap();
//! tx.rollback().unwrap();
//! assert!(shard.select(pk, None).unwrap().is_some());
//!
//! shard.close().unwrap();
//! ```
//!
//! # Design Notes
//!
//! - The shard state sits behind one mutex shared by the facade and
//!   every transaction handle; it is the per-shard monitor serializing
//!   structural operations.
//! - `select` decodes the body as UTF-8; `select_raw` hands back the
//!   exact bytes that were inserted.
//!
//! # See Also
//! - [`storage`](crate::storage): the paged layer underneath.
//! - [`transaction`](crate::transaction): journaling and visibility.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use log::debug;

use crate::{
    codec,
    storage::{
        PAGE_ID_NONE, PageError, Pk, Rid, ShardError, TransactionError, overflow,
        page::{DEFAULT_PAGE_SIZE, Page, PageType},
        pager::Pager,
        slotted,
        slotted::RowHeader,
    },
    transaction::{TransactionManager, TxId, TxStatus, WriteOp},
};

/// Configuration accepted by [`Shard::open`].
///
/// `page_size` only matters when the file is created; an existing shard
/// keeps the page size persisted in its metadata.
#[derive(Debug, Clone, Copy)]
pub struct ShardOptions {
    pub page_size: usize,
}

impl Default for ShardOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShardState {
    Opened,
    Ready,
    Closed,
}

#[derive(Debug)]
struct ShardInner {
    pager: Pager,
    txns: TransactionManager,
    state: ShardState,
}

/// Handle to one shard file.
pub struct Shard {
    inner: Arc<Mutex<ShardInner>>,
}

/// Handle to an in-memory transaction created by
/// [`Shard::create_transaction`].
pub struct Transaction {
    inner: Arc<Mutex<ShardInner>>,
    id: TxId,
}

impl Shard {
    /// Opens or creates the shard file at `path`.
    ///
    /// An existing non-empty file is validated immediately: bad magic,
    /// unsupported version, or a metadata checksum mismatch fail with
    /// `InvalidShardFile`. The shard is not usable until [`init`]
    /// completes.
    ///
    /// [`init`]: Shard::init
    pub fn open<P: Into<PathBuf>>(path: P, options: ShardOptions) -> Result<Self, ShardError> {
        let pager = Pager::open(path.into(), options.page_size)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(ShardInner {
                pager,
                txns: TransactionManager::new(),
                state: ShardState::Opened,
            })),
        })
    }

    /// Formats a freshly created file, or finishes loading an existing
    /// one. Idempotent while the shard is open.
    pub fn init(&self) -> Result<(), ShardError> {
        let mut inner = self.lock();
        if inner.state == ShardState::Closed {
            return Err(ShardError::Closed);
        }
        inner.pager.init()?;
        inner.state = ShardState::Ready;
        Ok(())
    }

    /// Flushes state and releases the shard. Further operations fail
    /// with `Closed`.
    pub fn close(&self) -> Result<(), ShardError> {
        let mut inner = self.lock();
        if inner.state == ShardState::Ready {
            inner.pager.flush()?;
        }
        inner.state = ShardState::Closed;
        Ok(())
    }

    /// Inserts a record and returns its primary key. Strings are stored
    /// as their UTF-8 bytes.
    pub fn insert<B: AsRef<[u8]>>(
        &self,
        data: B,
        tx: Option<&Transaction>,
    ) -> Result<Pk, ShardError> {
        let mut inner = self.lock();
        inner.ensure_ready()?;
        let tx_id = self.resolve(&inner, tx)?;

        let body = data.as_ref();
        if body.len() > slotted::MAX_BODY_SIZE {
            return Err(ShardError::Page {
                cause: PageError::RowTooLarge { size: body.len() },
            });
        }

        let pk = inner.pager.allocate_pk()?;
        let inline_limit = inner.pager.page_size() - crate::storage::page::PAGE_HEADER_SIZE;
        let rid = if slotted::required_space(body.len()) <= inline_limit {
            inner.place_row(pk, 0, body.len() as u16, body)?
        } else {
            let head = overflow::write_chain(&mut inner.pager, body)?;
            let mut head_bytes = [0u8; 4];
            codec::write_u32(&mut head_bytes, 0, head);
            let flag = codec::set_bit(0, slotted::FLAG_OVERFLOW);
            inner.place_row(pk, flag, body.len() as u16, &head_bytes)?
        };

        if let Some(id) = tx_id {
            inner.txns.record_insert(id, pk, rid)?;
        }
        debug!("inserted pk {pk} at slot {} of page {}", rid.slot, rid.page_id);
        Ok(pk)
    }

    /// Retrieves a record as a UTF-8 string. Returns `None` when the pk
    /// does not exist or is not visible to `tx`.
    pub fn select(&self, pk: Pk, tx: Option<&Transaction>) -> Result<Option<String>, ShardError> {
        match self.select_raw(pk, tx)? {
            Some(bytes) => codec::decode_utf8(bytes)
                .map(Some)
                .map_err(|cause| ShardError::Codec { cause }),
            None => Ok(None),
        }
    }

    /// Retrieves the exact bytes of a record. Returns `None` when the pk
    /// does not exist or is not visible to `tx`.
    pub fn select_raw(
        &self,
        pk: Pk,
        tx: Option<&Transaction>,
    ) -> Result<Option<Vec<u8>>, ShardError> {
        let mut inner = self.lock();
        inner.ensure_ready()?;
        let tx_id = self.resolve(&inner, tx)?;

        let Some((page, slot, header)) = inner.locate(pk)? else {
            return Ok(None);
        };
        if header.deleted() || inner.txns.hidden_from(pk, tx_id) {
            return Ok(None);
        }

        let (_, stored) = slotted::read_row(&page, slot)?;
        if header.overflow() {
            let head = codec::read_u32(&stored, 0);
            let body = overflow::read_chain(&mut inner.pager, head, header.body_size as usize)?;
            Ok(Some(body))
        } else {
            Ok(Some(stored))
        }
    }

    /// Marks the record deleted.
    ///
    /// Inside a transaction the delete is journaled and becomes durable
    /// at commit; outside one it is applied immediately. Fails with
    /// `NotFound` for unknown (or already deleted) pks and with
    /// `WriteConflict` when another active transaction holds a pending
    /// delete on the same pk.
    pub fn delete(&self, pk: Pk, tx: Option<&Transaction>) -> Result<(), ShardError> {
        let mut inner = self.lock();
        inner.ensure_ready()?;
        let tx_id = self.resolve(&inner, tx)?;

        let Some((mut page, slot, header)) = inner.locate(pk)? else {
            return Err(ShardError::NotFound { pk });
        };
        if header.deleted() {
            return Err(ShardError::NotFound { pk });
        }

        let rid = Rid {
            slot,
            page_id: page.page_id(),
        };
        match tx_id {
            Some(id) => {
                inner.txns.record_delete(id, pk, rid, header.flag)?;
                debug!("transaction {id} journaled delete of pk {pk}");
            }
            None => {
                if inner.txns.pending_delete_owner(pk).is_some() {
                    return Err(ShardError::Transaction {
                        cause: TransactionError::WriteConflict { pk },
                    });
                }
                slotted::set_deleted(&mut page, slot, true)?;
                inner.pager.write_page(&mut page)?;
                inner.txns.tick();
                debug!("deleted pk {pk}");
            }
        }
        Ok(())
    }

    /// Opens a transaction against this shard.
    pub fn create_transaction(&self) -> Result<Transaction, ShardError> {
        let mut inner = self.lock();
        inner.ensure_ready()?;
        let id = inner.txns.begin();
        Ok(Transaction {
            inner: Arc::clone(&self.inner),
            id,
        })
    }

    /// Page size of the underlying file.
    pub fn page_size(&self) -> usize {
        self.lock().pager.page_size()
    }

    fn resolve(
        &self,
        inner: &ShardInner,
        tx: Option<&Transaction>,
    ) -> Result<Option<TxId>, ShardError> {
        match tx {
            None => Ok(None),
            Some(tx) => {
                if !Arc::ptr_eq(&self.inner, &tx.inner) {
                    return Err(ShardError::Transaction {
                        cause: TransactionError::Closed,
                    });
                }
                inner
                    .txns
                    .ensure_active(tx.id)
                    .map_err(|cause| ShardError::Transaction { cause })?;
                Ok(Some(tx.id))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, ShardInner> {
        self.inner.lock().expect("shard monitor poisoned")
    }
}

impl Transaction {
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Applies the journaled mutations, advances the commit clock, and
    /// closes the transaction.
    pub fn commit(&self) -> Result<(), ShardError> {
        let mut inner = self.lock();
        inner.ensure_ready()?;
        let record = inner
            .txns
            .take_for_close(self.id)
            .map_err(|cause| ShardError::Transaction { cause })?;

        for op in &record.write_set {
            if let WriteOp::Delete { rid, .. } = op {
                let mut page = inner.pager.read_page(rid.page_id)?;
                slotted::set_deleted(&mut page, rid.slot, true)?;
                inner.pager.write_page(&mut page)?;
            }
        }
        inner.txns.finish(record, TxStatus::Committed);
        Ok(())
    }

    /// Undoes the journaled mutations in reverse order and closes the
    /// transaction. Journaled deletes were never persisted and are
    /// simply discarded; journaled inserts are tombstoned.
    pub fn rollback(&self) -> Result<(), ShardError> {
        let mut inner = self.lock();
        inner.ensure_ready()?;
        let record = inner
            .txns
            .take_for_close(self.id)
            .map_err(|cause| ShardError::Transaction { cause })?;

        for op in record.write_set.iter().rev() {
            match op {
                WriteOp::Delete { .. } => {}
                WriteOp::Insert { rid, .. } => {
                    let mut page = inner.pager.read_page(rid.page_id)?;
                    slotted::set_deleted(&mut page, rid.slot, true)?;
                    inner.pager.write_page(&mut page)?;
                }
            }
        }
        inner.txns.finish(record, TxStatus::RolledBack);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ShardInner> {
        self.inner.lock().expect("shard monitor poisoned")
    }
}

impl ShardInner {
    fn ensure_ready(&self) -> Result<(), ShardError> {
        match self.state {
            ShardState::Ready => Ok(()),
            ShardState::Opened => Err(ShardError::Uninitialized),
            ShardState::Closed => Err(ShardError::Closed),
        }
    }

    /// Places a row on the current insert page, allocating and linking a
    /// fresh data page when the current one cannot hold it.
    fn place_row(
        &mut self,
        pk: Pk,
        flag: u8,
        body_size: u16,
        stored: &[u8],
    ) -> Result<Rid, ShardError> {
        let current = self.pager.metadata().current_data_page;
        let mut page = if current == 0 {
            let page = self.pager.allocate_page(PageType::Data)?;
            self.pager.set_head_data_page(page.page_id())?;
            self.pager.set_current_data_page(page.page_id())?;
            page
        } else {
            let page = self.pager.read_page(current)?;
            slotted::verify_capacity(&page)?;
            if slotted::fits(&page, stored.len()) {
                page
            } else {
                let fresh = self.pager.allocate_page(PageType::Data)?;
                let mut previous = page;
                previous.set_next_page_id(fresh.page_id());
                self.pager.write_page(&mut previous)?;
                self.pager.set_current_data_page(fresh.page_id())?;
                fresh
            }
        };

        let slot = slotted::insert_row(&mut page, pk, flag, body_size, stored)?;
        let page_id = page.page_id();
        self.pager.write_page(&mut page)?;
        Ok(Rid { slot, page_id })
    }

    /// Walks the data-page chain from its head looking for `pk`. Every
    /// allocated data page is visited before concluding absence.
    fn locate(&mut self, pk: Pk) -> Result<Option<(Page, u16, RowHeader)>, ShardError> {
        let mut current = self.pager.metadata().head_data_page;
        if current == 0 {
            return Ok(None);
        }

        loop {
            let page = self.pager.read_page(current)?;
            if let Some(slot) = slotted::find_pk(&page, pk)? {
                let header = slotted::row_header(&page, slot)?;
                return Ok(Some((page, slot, header)));
            }
            let next = page.next_page_id();
            if next == PAGE_ID_NONE {
                return Ok(None);
            }
            current = next;
        }
    }
}
