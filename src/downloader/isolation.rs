use std::future::Future;
use crate::errors::{AppError, ErrorInfo};
use super::UnitOutcome;

/// How a task ended once every unit has settled.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskVerdict {
    Completed,
    Failed(ErrorInfo),
    Cancelled,
}

/// Tracks the single terminal outcome of every unit in a task.
#[derive(Debug, Default)]
pub struct IsolationLedger {
    slots: Vec<Option<std::result::Result<(), ErrorInfo>>>,
}

impl IsolationLedger {
    pub fn new(units: usize) -> Self {
        Self {
            slots: vec![None; units],
        }
    }

    /// Grows the ledger when units are attached after creation (playlist expansion).
    pub fn resize(&mut self, units: usize) {
        self.slots.resize(units, None);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Records a unit's outcome. Returns false if the unit already settled
    /// or the index is out of range.
    pub fn record(&mut self, index: usize, outcome: std::result::Result<(), ErrorInfo>) -> bool {
        match self.slots.get_mut(index) {
            Some(slot @ None) => {
                *slot = Some(outcome);
                true
            }
            _ => false,
        }
    }

    pub fn is_recorded(&self, index: usize) -> bool {
        matches!(self.slots.get(index), Some(Some(_)))
    }

    pub fn settled(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_settled(&self) -> bool {
        !self.slots.is_empty() && self.slots.iter().all(Option::is_some)
    }

    pub fn unsettled(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.is_none().then_some(i))
            .collect()
    }

    /// Final verdict. Only meaningful once `is_settled()`.
    pub fn verdict(&self, cancel_requested: bool) -> TaskVerdict {
        if cancel_requested {
            return TaskVerdict::Cancelled;
        }

        let errors: Vec<&ErrorInfo> = self
            .slots
            .iter()
            .filter_map(|s| match s {
                Some(Err(e)) => Some(e),
                _ => None,
            })
            .collect();

        if errors.is_empty() || errors.len() < self.slots.len() {
            return TaskVerdict::Completed;
        }

        if let [only] = errors.as_slice() {
            return TaskVerdict::Failed((*only).clone());
        }

        let first_type = &errors[0].error_type;
        let error_type = if errors.iter().all(|e| &e.error_type == first_type) {
            first_type.clone()
        } else {
            "AllUnitsFailed".to_string()
        };

        TaskVerdict::Failed(ErrorInfo {
            error: format!("All {} units failed; first error: {}", errors.len(), errors[0].error),
            error_type,
            retryable: errors.iter().all(|e| e.retryable),
        })
    }
}

/// Runs one unit's work on its own tokio task so a panic inside a backend
/// is turned into that unit's failure instead of unwinding into the caller.
pub async fn run_isolated<F>(unit_index: usize, work: F) -> UnitOutcome
where
    F: Future<Output = UnitOutcome> + Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(outcome) => outcome,
        Err(join_error) if join_error.is_panic() => {
            let payload = join_error.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!("[EXEC] unit {} panicked: {}", unit_index, message);
            UnitOutcome::Failed(AppError::Backend(format!("unit {} panicked: {}", unit_index, message)))
        }
        Err(_) => UnitOutcome::Failed(AppError::Cancelled(format!("unit {} aborted", unit_index))),
    }
}
