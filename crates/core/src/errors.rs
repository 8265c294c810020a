use thiserror::Error;

use crate::domain::task::TaskStatus;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid task transition from {from:?} to {to:?}")]
    InvalidTaskTransition { from: TaskStatus, to: TaskStatus },
}

#[cfg(test)]
mod tests {
    use crate::domain::task::TaskStatus;
    use crate::errors::DomainError;

    #[test]
    fn transition_error_names_both_states() {
        let error =
            DomainError::InvalidTaskTransition { from: TaskStatus::Completed, to: TaskStatus::Running };

        assert_eq!(error.to_string(), "invalid task transition from Completed to Running");
    }
}
