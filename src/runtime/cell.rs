//! Single-assignment data cells.
//!
//! A cell goes from `Empty` to `Value` or `Failed` exactly once; readers
//! await the transition. Waiting also marks the cell *demanded*, which
//! is the signal lazy producers block on before starting.

use super::RuntimeError;
use crate::value::CValue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
enum CellState {
    Empty,
    Value(CValue),
    Failed(Arc<RuntimeError>),
}

/// Latch-like single-assignment cell.
#[derive(Debug)]
pub struct DataCell {
    state: Mutex<CellState>,
    notify: Notify,
    demanded: AtomicBool,
    demand_notify: Notify,
}

impl Default for DataCell {
    fn default() -> Self {
        DataCell {
            state: Mutex::new(CellState::Empty),
            notify: Notify::new(),
            demanded: AtomicBool::new(false),
            demand_notify: Notify::new(),
        }
    }
}

impl DataCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the value. Returns `false` if the cell was already written;
    /// the first write always wins.
    pub fn set_value(&self, value: CValue) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, CellState::Empty) {
            return false;
        }
        *state = CellState::Value(value);
        drop(state);
        self.notify.notify_waiters();
        true
    }

    /// Mark the cell failed. Returns `false` if already written.
    pub fn set_failed(&self, error: Arc<RuntimeError>) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, CellState::Empty) {
            return false;
        }
        *state = CellState::Failed(error);
        drop(state);
        self.notify.notify_waiters();
        true
    }

    /// Non-blocking read.
    pub fn get(&self) -> Option<Result<CValue, Arc<RuntimeError>>> {
        match &*self.state.lock() {
            CellState::Empty => None,
            CellState::Value(value) => Some(Ok(value.clone())),
            CellState::Failed(error) => Some(Err(Arc::clone(error))),
        }
    }

    pub fn is_set(&self) -> bool {
        !matches!(*self.state.lock(), CellState::Empty)
    }

    /// Await the cell's value, marking it demanded.
    pub async fn wait(&self) -> Result<CValue, Arc<RuntimeError>> {
        self.demand();
        loop {
            let notified = self.notify.notified();
            if let Some(result) = self.get() {
                return result;
            }
            notified.await;
        }
    }

    /// Mark the cell demanded without waiting for its value.
    pub fn demand(&self) {
        if !self.demanded.swap(true, Ordering::SeqCst) {
            self.demand_notify.notify_waiters();
        }
    }

    pub fn is_demanded(&self) -> bool {
        self.demanded.load(Ordering::SeqCst)
    }

    /// Await the first demand. Lazy producers call this before running.
    pub async fn wait_demanded(&self) {
        loop {
            let notified = self.demand_notify.notified();
            if self.is_demanded() {
                return;
            }
            notified.await;
        }
    }
}
