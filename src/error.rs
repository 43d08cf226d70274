//! Scheduler errors
//!
//! An idle cycle or a missed hard deadline is a scheduling outcome, not
//! an error.
//!
//! Author: Moroya Sakamoto

use crate::task::TaskId;

/// Errors returned by the task table and the execution engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SchedError {
    /// Every slot in the task table is occupied
    #[error("task table full")]
    TableFull,

    /// The id does not name an occupied slot
    #[error("unknown task id {}", .0.index())]
    UnknownTask(TaskId),

    /// A current-task operation was called outside a task body
    #[error("no task is currently executing")]
    NoCurrentTask,

    /// Nested yields went past `MAX_YIELD_DEPTH`
    #[error("yield nesting too deep ({depth} levels)")]
    YieldDepthExceeded { depth: usize },
}

/// Scheduler result alias
pub type Result<T> = core::result::Result<T, SchedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(SchedError::TableFull.to_string(), "task table full");
        assert_eq!(
            SchedError::UnknownTask(TaskId::new(7)).to_string(),
            "unknown task id 7"
        );
        assert_eq!(
            SchedError::YieldDepthExceeded { depth: 8 }.to_string(),
            "yield nesting too deep (8 levels)"
        );
    }
}
