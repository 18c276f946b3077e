//! Mailbox creation and worker lifecycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::error::DispatchError;
use crate::mailbox::{Mailbox, MailboxId};

/// Creates mailboxes bound to worker threads (async mailboxes) or inline
/// (cooperative mailboxes), and tracks them for shutdown.
///
/// The factory is a cheap cloneable handle; every mailbox keeps one so
/// actors can create peers at runtime.
#[derive(Clone)]
pub struct MailboxFactory {
    inner: Arc<FactoryInner>,
}

struct FactoryInner {
    config: RuntimeConfig,
    next_id: AtomicU64,
    mailboxes: DashMap<MailboxId, Weak<Mailbox>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MailboxFactory {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                config,
                next_id: AtomicU64::new(1),
                mailboxes: DashMap::new(),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Allocate a fresh identity. Also used for the control identity of
    /// callers that have no mailbox, so those never collide with real
    /// mailbox ids.
    pub(crate) fn next_id(&self) -> MailboxId {
        MailboxId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a cooperative mailbox. It executes on whichever thread holds
    /// its control token.
    pub fn mailbox(&self) -> Arc<Mailbox> {
        let mailbox = Mailbox::new(
            self.next_id(),
            false,
            self.clone(),
            self.inner.config.initial_buffer_capacity,
        );
        self.register(&mailbox);
        mailbox
    }

    /// Create a mailbox bound to a dedicated worker thread. Crossing into
    /// it always uses queued delivery.
    pub fn async_mailbox(&self) -> Result<Arc<Mailbox>, DispatchError> {
        let mailbox = Mailbox::new(
            self.next_id(),
            true,
            self.clone(),
            self.inner.config.initial_buffer_capacity,
        );
        let (wake_tx, wake_rx) = bounded(1);
        mailbox.bind_worker(wake_tx);

        let weak = Arc::downgrade(&mailbox);
        let handle = thread::Builder::new()
            .name(format!("hypha-worker-{}", mailbox.id()))
            .spawn(move || run_worker(weak, wake_rx))
            .map_err(DispatchError::WorkerSpawn)?;

        self.inner.workers.lock().push(handle);
        self.register(&mailbox);
        Ok(mailbox)
    }

    fn register(&self, mailbox: &Arc<Mailbox>) {
        self.inner
            .mailboxes
            .insert(mailbox.id(), Arc::downgrade(mailbox));
    }

    /// Number of live mailboxes created by this factory.
    pub fn mailbox_count(&self) -> usize {
        self.inner
            .mailboxes
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    /// Close every async mailbox and join its worker. Messages still
    /// queued on closed mailboxes are dropped.
    pub fn shutdown(&self) {
        for entry in self.inner.mailboxes.iter() {
            if let Some(mailbox) = entry.value().upgrade() {
                mailbox.close();
            }
        }
        let workers: Vec<JoinHandle<()>> = self.inner.workers.lock().drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }
        self.inner
            .mailboxes
            .retain(|_, weak| weak.strong_count() > 0);
    }
}

impl Default for MailboxFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker loop for an async mailbox: wait for a wake signal, drain the
/// inbound queue, flush outbound buckets, repeat. Exits when the mailbox
/// is closed or dropped.
fn run_worker(mailbox: Weak<Mailbox>, wake: Receiver<()>) {
    let id = match mailbox.upgrade() {
        Some(mailbox) => mailbox.id(),
        None => return,
    };
    debug!(mailbox = %id, "mailbox worker started");

    while wake.recv().is_ok() {
        // Coalesce any extra wakeups; one drain covers them all.
        while wake.try_recv().is_ok() {}

        let Some(mailbox) = mailbox.upgrade() else {
            break;
        };
        mailbox.drain_inbound();
        mailbox.send_pending_messages();
    }

    debug!(mailbox = %id, "mailbox worker stopped");
}
