//! Operation dispatch.
//!
//! Every page mutation is an operation registered under an [`OperationId`].
//! The log records the id and the operation's arguments, and the registry
//! maps the id back to code for forward execution, redo and undo. An
//! operation is undone either by running its inverse operation over the same
//! arguments, or by restoring a pre-image the dispatcher captured into the
//! log entry before the operation ran.
//!
//! The registry is built once by [`OperationRegistryBuilder`] and is
//! immutable afterwards.

pub mod builtin;

use std::{fmt, ops::Range};

use crate::{
    error::{StorageError, StorageResult},
    log::{LogEntry, PreImage, UpdateBody},
    page::{Page, PageType},
    store::TxStore,
    Lsn, RecordId, Xid,
};

pub type OperationId = u16;

/// Size of the operation table.
pub const MAX_OPERATIONS: usize = 80;

/// Ids below this are reserved for built-in operations.
pub const FIRST_USER_OPERATION: OperationId = 32;

/// What an operation function sees.
#[derive(Clone, Copy, Debug)]
pub struct OperationArgs<'a> {
    pub xid: Xid,
    pub rid: RecordId,
    pub args: &'a [u8],
}

impl<'a> OperationArgs<'a> {
    pub fn from_update(xid: Xid, update: &'a UpdateBody) -> Self {
        Self {
            xid,
            rid: update.rid,
            args: &update.args,
        }
    }
}

pub type PhysicalFn = fn(&OperationArgs<'_>, &mut Page) -> StorageResult<()>;
pub type LogicalFn = fn(&TxStore, Xid, &OperationArgs<'_>) -> StorageResult<()>;
/// Byte range of the page an operation overwrites.
pub type FootprintFn = fn(&OperationArgs<'_>, &Page) -> StorageResult<Range<usize>>;

/// How an operation is undone.
#[derive(Clone, Copy, Debug)]
pub enum Inverse {
    /// Run this operation with the same arguments.
    Operation(OperationId),
    /// Restore the bytes in this range, captured before the operation ran.
    PreImage(FootprintFn),
}

/// How an operation changes state.
#[derive(Clone, Copy, Debug)]
pub enum Mutation {
    /// Changes one latched page.
    Physical(PhysicalFn),
    /// Runs against the engine; its entries carry a logical record id.
    Logical(LogicalFn),
}

#[derive(Clone, Copy, Debug)]
pub struct OperationDescriptor {
    pub id: OperationId,
    pub name: &'static str,
    /// Page type the operation requires, if any.
    pub page_type: Option<PageType>,
    /// Operation replayed by redo, usually `id` itself.
    pub redo: OperationId,
    pub undo: Inverse,
    pub mutation: Mutation,
}

impl OperationDescriptor {
    fn physical(&self) -> StorageResult<PhysicalFn> {
        match self.mutation {
            Mutation::Physical(f) => Ok(f),
            Mutation::Logical(_) => Err(StorageError::internal(format!(
                "operation {} is logical and cannot touch a page",
                self.name
            ))),
        }
    }

    fn check_page_type(&self, page: &Page) -> StorageResult<()> {
        let Some(expected) = self.page_type else {
            return Ok(());
        };
        let actual = page.page_type()?;
        if actual != expected {
            return Err(StorageError::internal(format!(
                "operation {} expects a {expected:?} page, page {} is {actual:?}",
                self.name,
                page.id()
            )));
        }
        Ok(())
    }

    fn apply(&self, args: &OperationArgs<'_>, page: &mut Page) -> StorageResult<()> {
        let f = self.physical()?;
        self.check_page_type(page)?;
        f(args, page)
    }
}

#[derive(Clone, Default)]
pub struct OperationRegistryBuilder {
    table: Vec<Option<OperationDescriptor>>,
}

impl fmt::Debug for OperationRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.table.iter().flatten().map(|op| (op.id, op.name)))
            .finish()
    }
}

impl OperationRegistryBuilder {
    pub fn new() -> Self {
        Self {
            table: vec![None; MAX_OPERATIONS],
        }
    }

    /// A builder holding every built-in operation.
    pub fn with_builtins() -> Self {
        let mut builder = Self::new();
        for descriptor in builtin::descriptors() {
            // Built-in ids are distinct and in range.
            if let Err(e) = builder.register(descriptor) {
                tracing::error!(error = %e, "built-in operation rejected");
            }
        }
        builder
    }

    /// Adds `descriptor`. Out-of-range and duplicate ids are errors.
    pub fn register(&mut self, descriptor: OperationDescriptor) -> StorageResult<&mut Self> {
        let id = descriptor.id as usize;
        if self.table.is_empty() {
            self.table = vec![None; MAX_OPERATIONS];
        }
        let Some(slot) = self.table.get_mut(id) else {
            return Err(StorageError::internal(format!(
                "operation id {id} is out of range (max {})",
                MAX_OPERATIONS - 1
            )));
        };
        if let Some(existing) = slot {
            return Err(StorageError::internal(format!(
                "operation id {id} is already registered to {}",
                existing.name
            )));
        }
        *slot = Some(descriptor);
        Ok(self)
    }

    /// Freezes the table. Every redo and inverse id must be registered.
    pub fn build(self) -> StorageResult<OperationRegistry> {
        let registered = |id: OperationId| {
            self.table
                .get(id as usize)
                .is_some_and(|slot| slot.is_some())
        };
        for op in self.table.iter().flatten() {
            if !registered(op.redo) {
                return Err(StorageError::UnknownOperation { op: op.redo });
            }
            if let Inverse::Operation(inverse) = op.undo {
                if !registered(inverse) {
                    return Err(StorageError::UnknownOperation { op: inverse });
                }
            }
        }
        let mut table = self.table;
        table.resize(MAX_OPERATIONS, None);
        Ok(OperationRegistry { table })
    }
}

/// Immutable operation table.
pub struct OperationRegistry {
    table: Vec<Option<OperationDescriptor>>,
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("registered", &self.table.iter().flatten().count())
            .finish()
    }
}

impl OperationRegistry {
    pub fn get(&self, op: OperationId) -> StorageResult<&OperationDescriptor> {
        self.table
            .get(op as usize)
            .and_then(Option::as_ref)
            .ok_or(StorageError::UnknownOperation { op })
    }

    pub fn is_logical(&self, op: OperationId) -> StorageResult<bool> {
        Ok(matches!(self.get(op)?.mutation, Mutation::Logical(_)))
    }

    /// Fills in `update.preimage` if the operation is undone from one. Must
    /// run against the page before the operation is applied.
    pub fn capture_preimage(&self, xid: Xid, update: &mut UpdateBody, page: &Page) -> StorageResult<()> {
        let Inverse::PreImage(footprint) = self.get(update.op)?.undo else {
            return Ok(());
        };
        let range = footprint(&OperationArgs::from_update(xid, update), page)?;
        let bytes = page.read(range.start, range.len())?.to_vec();
        update.preimage = Some(PreImage {
            offset: range.start as u32,
            bytes,
        });
        Ok(())
    }

    /// Runs `update` against a copy of `page`, so a failing operation is
    /// caught before it is logged.
    pub fn check_forward(&self, xid: Xid, update: &UpdateBody, page: &Page) -> StorageResult<()> {
        let mut scratch = page.clone();
        self.get(update.op)?
            .apply(&OperationArgs::from_update(xid, update), &mut scratch)
    }

    /// Runs an appended Update entry against its latched page and stamps the
    /// page with the entry's LSN.
    pub fn dispatch_forward(&self, entry: &LogEntry, page: &mut Page) -> StorageResult<()> {
        let update = expect_update(entry)?;
        self.get(update.op)?
            .apply(&OperationArgs::from_update(entry.xid, update), page)?;
        page.set_lsn(entry.lsn);
        Ok(())
    }

    /// Replays an Update entry if the page predates it. Returns whether the
    /// page changed.
    pub fn dispatch_redo(&self, entry: &LogEntry, page: &mut Page) -> StorageResult<bool> {
        if page.lsn() >= entry.lsn {
            return Ok(false);
        }
        let update = expect_update(entry)?;
        let redo = self.get(self.get(update.op)?.redo)?;
        redo.apply(&OperationArgs::from_update(entry.xid, update), page)?;
        page.set_lsn(entry.lsn);
        Ok(true)
    }

    /// Undoes `update` on its page and stamps `effective_lsn`, the LSN of the
    /// CLR that records the undo. Skipped if the page already reflects that
    /// CLR. Returns whether the page changed.
    pub fn dispatch_undo(
        &self,
        xid: Xid,
        update: &UpdateBody,
        effective_lsn: Lsn,
        page: &mut Page,
    ) -> StorageResult<bool> {
        if page.lsn() >= effective_lsn {
            return Ok(false);
        }
        let descriptor = self.get(update.op)?;
        match descriptor.undo {
            Inverse::Operation(inverse) => {
                self.get(inverse)?
                    .apply(&OperationArgs::from_update(xid, update), page)?;
            }
            Inverse::PreImage(_) => {
                let preimage = update.preimage.as_ref().ok_or_else(|| {
                    StorageError::internal(format!(
                        "entry for {} on {} lacks its pre-image",
                        descriptor.name, update.rid
                    ))
                })?;
                page.write(preimage.offset as usize, &preimage.bytes)?;
            }
        }
        page.set_lsn(effective_lsn);
        Ok(true)
    }

    /// Runs the logical inverse of `update` through the store.
    pub fn dispatch_logical_undo(&self, store: &TxStore, xid: Xid, update: &UpdateBody) -> StorageResult<()> {
        let descriptor = self.get(update.op)?;
        let Inverse::Operation(inverse) = descriptor.undo else {
            return Err(StorageError::internal(format!(
                "logical operation {} has no inverse operation",
                descriptor.name
            )));
        };
        match self.get(inverse)?.mutation {
            Mutation::Logical(f) => f(store, xid, &OperationArgs::from_update(xid, update)),
            Mutation::Physical(_) => Err(StorageError::internal(format!(
                "inverse of logical operation {} is physical",
                descriptor.name
            ))),
        }
    }
}

fn expect_update(entry: &LogEntry) -> StorageResult<&UpdateBody> {
    entry.update().ok_or_else(|| {
        StorageError::internal(format!(
            "{} entry at {} is not an update",
            entry.body.name(),
            entry.lsn
        ))
    })
}

#[cfg(test)]
mod operation_registry_tests {
    use super::*;
    use crate::{
        log::EntryBody,
        operations::builtin::{PAGE_SET_RANGE, INITIALIZE_PAGE, SET},
        page::{PAGE_DATA_OFFSET, PAGE_SIZE},
    };

    fn registry() -> OperationRegistry {
        OperationRegistryBuilder::with_builtins().build().unwrap()
    }

    fn entry(lsn: u64, op: OperationId, rid: RecordId, args: Vec<u8>) -> LogEntry {
        let mut entry = LogEntry::new(1, None, EntryBody::Update(UpdateBody::new(op, rid, args)));
        entry.lsn = Lsn::new(lsn);
        entry
    }

    fn noop(_: &OperationArgs<'_>, _: &mut Page) -> StorageResult<()> {
        Ok(())
    }

    fn descriptor(id: OperationId, undo: OperationId) -> OperationDescriptor {
        OperationDescriptor {
            id,
            name: "test",
            page_type: None,
            redo: id,
            undo: Inverse::Operation(undo),
            mutation: Mutation::Physical(noop),
        }
    }

    #[test]
    fn registration_rejects_bad_ids() {
        let mut builder = OperationRegistryBuilder::with_builtins();
        assert!(builder.register(descriptor(SET, SET)).is_err());
        assert!(builder.register(descriptor(MAX_OPERATIONS as u16, 0)).is_err());
        builder.register(descriptor(FIRST_USER_OPERATION, FIRST_USER_OPERATION)).unwrap();
        let registry = builder.build().unwrap();
        assert_eq!(registry.get(FIRST_USER_OPERATION).unwrap().name, "test");
        assert!(matches!(
            registry.get(FIRST_USER_OPERATION + 1),
            Err(StorageError::UnknownOperation { .. })
        ));
    }

    #[test]
    fn dangling_inverse_fails_build() {
        let mut builder = OperationRegistryBuilder::new();
        builder.register(descriptor(40, 41)).unwrap();
        assert!(matches!(
            builder.build(),
            Err(StorageError::UnknownOperation { op: 41 })
        ));
    }

    #[test]
    fn redo_is_gated_by_page_lsn() {
        let registry = registry();
        let mut page = Page::new(4);
        let mut args = (PAGE_DATA_OFFSET as u32).to_be_bytes().to_vec();
        args.extend_from_slice(&[7, 0]);
        let set = entry(50, PAGE_SET_RANGE, RecordId::page(4), args);

        assert!(registry.dispatch_redo(&set, &mut page).unwrap());
        assert_eq!(page.lsn(), Lsn::new(50));
        assert_eq!(page.read(PAGE_DATA_OFFSET, 1).unwrap(), &[7]);

        page.write(PAGE_DATA_OFFSET, &[9]).unwrap();
        assert!(!registry.dispatch_redo(&set, &mut page).unwrap());
        assert_eq!(page.read(PAGE_DATA_OFFSET, 1).unwrap(), &[9]);
    }

    #[test]
    fn preimage_undo_restores_the_page() {
        let registry = registry();
        let mut page = Page::new(2);
        page.set_page_type(PageType::Raw);
        page.write(PAGE_SIZE - 3, &[1, 2, 3]).unwrap();
        page.set_lsn(Lsn::new(10));

        let mut init = entry(20, INITIALIZE_PAGE, RecordId::page(2), builtin::initialize_args(PageType::Record));
        let EntryBody::Update(update) = &mut init.body else {
            unreachable!()
        };
        registry.capture_preimage(1, update, &page).unwrap();
        registry.dispatch_forward(&init, &mut page).unwrap();
        assert_eq!(page.page_type().unwrap(), PageType::Record);

        let update = init.update().unwrap();
        assert!(registry.dispatch_undo(1, update, Lsn::new(30), &mut page).unwrap());
        assert_eq!(page.page_type().unwrap(), PageType::Raw);
        assert_eq!(page.read(PAGE_SIZE - 3, 3).unwrap(), &[1, 2, 3]);
        assert_eq!(page.lsn(), Lsn::new(30));
        // Already compensated.
        assert!(!registry.dispatch_undo(1, update, Lsn::new(30), &mut page).unwrap());
    }

    #[test]
    fn page_type_mismatch_is_internal() {
        let registry = registry();
        let mut page = Page::new(1);
        let set = entry(5, SET, RecordId::new(1, 0, 1), vec![1, 0]);
        let err = registry.dispatch_forward(&set, &mut page).unwrap_err();
        assert!(matches!(err, StorageError::Internal(_)));
    }
}
