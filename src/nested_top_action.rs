//! Nested top actions.
//!
//! A nested top action makes a run of physical updates look like one logical
//! step to undo. [`begin`] logs a logical placeholder Update; the caller then
//! performs its physical updates; [`end`] logs a dummy CLR whose `undo_next`
//! is the placeholder. If the transaction later rolls back, undo jumps from
//! that CLR straight to the placeholder, skipping the physical updates, and
//! runs the placeholder operation's logical inverse instead.

use crate::{
    error::{StorageError, StorageResult},
    log::{EntryBody, LogManager, UpdateBody},
    operations::{OperationId, OperationRegistry},
    transaction_table::TransactionTable,
    Lsn, RecordId, Xid,
};

/// Handle returned by [`TxStore::begin_nested_top_action`](crate::TxStore::begin_nested_top_action).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use = "a nested top action must be ended"]
pub struct NestedTopAction {
    /// The transaction's prevLSN before the placeholder.
    pub prev_lsn: Option<Lsn>,
    /// LSN of the placeholder entry.
    pub compensated_lsn: Lsn,
}

pub(crate) fn begin(
    log: &LogManager,
    transactions: &TransactionTable,
    registry: &OperationRegistry,
    xid: Xid,
    op: OperationId,
    args: &[u8],
) -> StorageResult<NestedTopAction> {
    if !registry.is_logical(op)? {
        return Err(StorageError::internal(format!(
            "nested top action placeholder {} must be a logical operation",
            registry.get(op)?.name
        )));
    }
    let placeholder = transactions.append(
        log,
        xid,
        EntryBody::Update(UpdateBody::new(op, RecordId::logical(), args.to_vec())),
    )?;
    tracing::trace!(xid, lsn = %placeholder.lsn, op, "nested top action begun");
    Ok(NestedTopAction {
        prev_lsn: placeholder.prev_lsn,
        compensated_lsn: placeholder.lsn,
    })
}

pub(crate) fn end(
    log: &LogManager,
    transactions: &TransactionTable,
    xid: Xid,
    nta: NestedTopAction,
) -> StorageResult<Lsn> {
    let clr = transactions.append(
        log,
        xid,
        EntryBody::Clr {
            undo_next: Some(nta.compensated_lsn),
            compensated_lsn: nta.compensated_lsn,
            compensated: None,
        },
    )?;
    tracing::trace!(xid, lsn = %clr.lsn, "nested top action ended");
    Ok(clr.lsn)
}
