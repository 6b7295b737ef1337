//! Local listener table.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;
use serde_json::Value;

pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifier handed out by [`LocalRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A listener that panicked while handling a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerFault {
    pub id: SubscriptionId,
    pub message: String,
}

impl fmt::Display for ListenerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener {} panicked: {}", self.id, self.message)
    }
}

/// Result of one local invocation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationReport {
    pub invoked: usize,
    pub faults: Vec<ListenerFault>,
}

struct Table {
    next_id: u64,
    callbacks: IndexMap<SubscriptionId, Callback>,
}

/// Insertion-ordered map from subscription id to callback.
///
/// Ids are `{prefix}{n}` with `n` strictly increasing for the lifetime of the
/// registry, so an id is never handed out twice.
pub struct LocalRegistry {
    prefix: String,
    table: Mutex<Table>,
}

impl LocalRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            table: Mutex::new(Table {
                next_id: 0,
                callbacks: IndexMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, callback: Callback) -> SubscriptionId {
        let mut table = self.lock();
        let id = SubscriptionId(format!("{}{}", self.prefix, table.next_id));
        table.next_id += 1;
        table.callbacks.insert(id.clone(), callback);
        id
    }

    /// Returns `true` if the id was registered.
    pub fn unregister(&self, id: &SubscriptionId) -> bool {
        self.lock().callbacks.shift_remove(id).is_some()
    }

    pub fn count(&self) -> usize {
        self.lock().callbacks.len()
    }

    pub fn clear(&self) {
        self.lock().callbacks.clear();
    }

    /// Invoke every registered callback in insertion order.
    ///
    /// The table is not locked while a callback runs, so callbacks may
    /// register, unregister or dispatch. Callbacks added during the pass are
    /// not invoked by it; callbacks removed during the pass are skipped. A
    /// panicking callback is recorded and the pass continues.
    pub fn invoke_all(&self, payload: &Value) -> InvocationReport {
        let snapshot: Vec<(SubscriptionId, Callback)> = self
            .lock()
            .callbacks
            .iter()
            .map(|(id, cb)| (id.clone(), cb.clone()))
            .collect();

        let mut report = InvocationReport::default();
        for (id, callback) in snapshot {
            if !self.lock().callbacks.contains_key(&id) {
                continue;
            }
            report.invoked += 1;
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(payload))) {
                let message = panic_message(panic.as_ref());
                tracing::warn!("listener {id} panicked: {message}");
                report.faults.push(ListenerFault { id, message });
            }
        }
        report
    }
}

impl fmt::Debug for LocalRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRegistry")
            .field("prefix", &self.prefix)
            .field("count", &self.count())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
