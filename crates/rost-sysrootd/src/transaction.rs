//! Transaction tracker collaborator.
//!
//! The coordinator only asks which transaction is active, follows changes of
//! that answer, and forwards captured output lines to it.

use std::sync::Arc;

use tokio::sync::watch;

/// An in-progress operation owned by a remote client
pub trait Transaction: Send + Sync {
    /// Address of the client that started the transaction
    fn client_address(&self) -> Option<String>;

    /// Deliver one line of captured output to the transaction's owner
    fn emit_message(&self, line: &str);
}

pub type ActiveTransaction = Option<Arc<dyn Transaction>>;

/// Tracks the single active transaction, if any
pub struct TransactionMonitor {
    active: watch::Sender<ActiveTransaction>,
}

impl Default for TransactionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionMonitor {
    pub fn new() -> Self {
        let (active, _) = watch::channel(None);
        Self { active }
    }

    pub fn set_active(&self, transaction: Arc<dyn Transaction>) {
        self.active.send_replace(Some(transaction));
    }

    pub fn clear(&self) {
        self.active.send_replace(None);
    }

    pub fn active_transaction(&self) -> ActiveTransaction {
        self.active.borrow().clone()
    }

    /// Receiver that wakes on every change of the active transaction
    pub fn subscribe(&self) -> watch::Receiver<ActiveTransaction> {
        self.active.subscribe()
    }
}

/// Address string published for `transaction`; empty when none
pub fn transaction_address(transaction: &ActiveTransaction) -> String {
    transaction
        .as_ref()
        .and_then(|t| t.client_address())
        .unwrap_or_default()
}
