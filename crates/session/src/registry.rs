//! Outstanding transfer index
//!
//! While a transfer is submitted the registry owns it, keyed by its
//! [`TransferId`]. The transport reports completions by id; the registry
//! resolves the id, removes the entry and hands the transfer to its
//! callback. An id that is no longer indexed is simply ignored, which is
//! what makes cancel-after-complete and late native events harmless.
//!
//! Every native submission runs under a shared gate. Closing the registry
//! takes the gate exclusively, so shutdown never finishes a transfer whose
//! submission is still in flight, and nothing is submitted afterwards.

use crate::event_lock::EventLockGuard;
use crate::panic_message;
use crate::transfer::{CompletionRecord, Transfer, TransferId};
use crate::transport::Transport;
use common::{Error, TransferStatus};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, trace, warn};

/// A refused submission; the transfer is handed back untouched
#[derive(Debug, thiserror::Error)]
#[error("Transfer submission failed: {error}")]
pub struct SubmitError {
    #[source]
    pub error: Error,
    pub transfer: Transfer,
}

impl From<SubmitError> for Error {
    fn from(err: SubmitError) -> Self {
        err.error
    }
}

/// Index of submitted transfers
pub struct TransferRegistry {
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<TransferId, Transfer>>,
    /// `true` once closed; held for reading across each native submit
    gate: RwLock<bool>,
}

impl TransferRegistry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            pending: Mutex::new(HashMap::new()),
            gate: RwLock::new(false),
        }
    }

    /// Submit a configured (or previously finished) transfer
    ///
    /// The transfer is indexed before the native submission so a completion
    /// can never arrive for an id the registry does not know yet.
    pub fn submit(&self, mut transfer: Transfer) -> Result<TransferId, SubmitError> {
        let closed = self.gate.read().unwrap();
        if *closed {
            return Err(SubmitError {
                error: Error::SessionClosed,
                transfer,
            });
        }

        let descriptor = match transfer.arm() {
            Ok(descriptor) => descriptor,
            Err(error) => return Err(SubmitError { error, transfer }),
        };
        let id = descriptor.id;

        self.pending.lock().unwrap().insert(id, transfer);

        if let Err(error) = self.transport.submit(&descriptor) {
            debug!("Transport refused transfer {}: {}", id, error);
            let refused = self.pending.lock().unwrap().remove(&id);
            return match refused {
                Some(mut transfer) => {
                    transfer.disarm();
                    Err(SubmitError { error, transfer })
                }
                None => {
                    // The transport reported an outcome for it anyway; the callback has run
                    warn!(
                        "Transfer {} refused ({}) after its completion was delivered",
                        id, error
                    );
                    Ok(id)
                }
            };
        }
        drop(closed);

        debug!(
            "Submitted {:?} transfer {} on endpoint {} ({} bytes)",
            descriptor.kind, id, descriptor.endpoint, descriptor.length
        );
        Ok(id)
    }

    /// Request cancellation of a pending transfer
    ///
    /// The callback still runs exactly once with whatever status the
    /// transport reports. Unknown or already finished ids are a no-op.
    pub fn cancel(&self, id: TransferId) -> common::Result<()> {
        if !self.contains(id) {
            trace!("Cancel for transfer {} ignored, not pending", id);
            return Ok(());
        }
        match self.transport.cancel(id) {
            Ok(()) => {
                debug!("Cancellation requested for transfer {}", id);
                Ok(())
            }
            // Finished between the check and the native call
            Err(Error::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Request cancellation of everything pending
    pub fn cancel_all(&self) -> usize {
        let ids = self.pending_ids();
        for &id in &ids {
            match self.transport.cancel(id) {
                Ok(()) | Err(Error::NotFound) => {}
                Err(e) => warn!("Failed to cancel transfer {}: {}", id, e),
            }
        }
        ids.len()
    }

    /// Deliver a completion reported by the transport
    ///
    /// Returns `false` when the id is not pending.
    pub fn complete(&self, _guard: &EventLockGuard<'_>, id: TransferId, record: CompletionRecord) -> bool {
        let transfer = self.pending.lock().unwrap().remove(&id);
        let Some(mut transfer) = transfer else {
            debug!("Completion for unknown transfer {} ignored", id);
            return false;
        };

        trace!(
            "Transfer {} finished: {:?}, {} bytes",
            id, record.status, record.actual_length
        );
        transfer.finish(record);
        deliver(transfer);
        true
    }

    /// Refuse further submissions
    ///
    /// Blocks until submissions already inside the transport have returned.
    /// Returns `false` if the registry was already closed.
    pub fn close(&self) -> bool {
        let mut closed = self.gate.write().unwrap();
        !std::mem::replace(&mut *closed, true)
    }

    pub fn is_closed(&self) -> bool {
        *self.gate.read().unwrap()
    }

    /// Close the registry and finish every pending transfer with `SessionClosed`
    ///
    /// Buffers the transport may still reference are leaked instead of
    /// freed. Returns the number of transfers finished this way.
    pub fn force_close(&self, _guard: &EventLockGuard<'_>) -> usize {
        self.close();
        let mut leftovers: Vec<Transfer> = self
            .pending
            .lock()
            .unwrap()
            .drain()
            .map(|(_, transfer)| transfer)
            .collect();
        leftovers.sort_by_key(|t| t.id());

        let count = leftovers.len();
        for mut transfer in leftovers {
            if !self.transport.abandon(transfer.id()) {
                warn!(
                    "Transfer {} may still be referenced natively, leaking its buffer",
                    transfer.id()
                );
                transfer.abandon_buffer();
            }
            transfer.finish(CompletionRecord::with_status(TransferStatus::SessionClosed));
            deliver(transfer);
        }
        count
    }

    pub fn contains(&self, id: TransferId) -> bool {
        self.pending.lock().unwrap().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending ids in submission order
    pub fn pending_ids(&self) -> Vec<TransferId> {
        let mut ids: Vec<TransferId> = self.pending.lock().unwrap().keys().copied().collect();
        ids.sort();
        ids
    }
}

/// Hand a finished transfer to its callback, isolating panics
fn deliver(transfer: Transfer) {
    let id = transfer.id();
    let Some(callback) = transfer.callback() else {
        trace!("Transfer {} has no callback, dropping it", id);
        return;
    };
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(transfer))) {
        error!(
            "Panic in completion callback for transfer {}: {}",
            id,
            panic_message(panic.as_ref())
        );
    }
}
