//! Device allocation.
//!
//! - `matcher`: pure predicates deciding whether a device satisfies a request
//! - `coordinator`: the single critical section every state transition goes
//!   through
//! - `allocator`: the polling loop racing a timeout, plus bulk release

mod allocator;
mod coordinator;
pub mod matcher;

use devlab_model::{AllocatedTo, Device, DEFAULT_TEAM};
use thiserror::Error;

use crate::hosts::HostError;
use crate::store::StoreError;

pub use allocator::Allocator;
pub use coordinator::{AllocationCoordinator, InventoryOutcome};

/// Who is asking for a transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub request_id: String,
    pub user: Option<String>,
    pub requestor_ip: Option<String>,
    pub team: Option<String>,
    pub job_link: Option<String>,
}

impl SessionContext {
    /// Context for transitions initiated by the master itself.
    pub fn system(actor: &str) -> Self {
        Self {
            request_id: actor.to_string(),
            user: Some(actor.to_string()),
            ..Default::default()
        }
    }

    /// Team to account usage against.
    pub fn team_or_default(&self) -> &str {
        self.team
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(DEFAULT_TEAM)
    }

    pub fn allocated_to(&self) -> AllocatedTo {
        AllocatedTo {
            ip: self.requestor_ip.clone(),
            user: self.user.clone(),
            job_link: self.job_link.clone(),
            team: Some(self.team_or_default().to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("unable to allocate device for request '{request}' even after {elapsed_secs} seconds")]
    Timeout { request: String, elapsed_secs: u64 },

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("allocation task ended without a result")]
    Abandoned,

    /// Some drivers could not be stopped. `released` holds the devices that
    /// were released anyway; the others stay busy.
    #[error(
        "released {} device(s), could not stop {} driver(s): {}",
        .released.len(),
        .failures.len(),
        join_errors(.failures)
    )]
    PartialRelease {
        released: Vec<Device>,
        failures: Vec<HostError>,
    },
}

fn join_errors(errors: &[HostError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl AllocationError {
    /// The poll loop retries these instead of surfacing them.
    pub fn is_transient(&self) -> bool {
        match self {
            AllocationError::Host(e) => e.is_transient(),
            AllocationError::PartialRelease { failures, .. } => {
                failures.iter().all(HostError::is_transient)
            }
            AllocationError::Store(StoreError::Unavailable(_)) => true,
            _ => false,
        }
    }
}

pub type AllocationResult<T> = Result<T, AllocationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_team_defaults_to_common() {
        let ctx = SessionContext::default();
        assert_eq!(ctx.team_or_default(), "common");

        let ctx = SessionContext {
            team: Some(" ".to_string()),
            ..Default::default()
        };
        assert_eq!(ctx.allocated_to().team.as_deref(), Some("common"));
    }

    #[test]
    fn test_transient_classification() {
        let unreachable = AllocationError::Host(HostError::Unreachable {
            host: "h1".to_string(),
            message: "refused".to_string(),
        });
        assert!(unreachable.is_transient());

        let rejected = AllocationError::Host(HostError::Rejected {
            host: "h1".to_string(),
            status: 503,
            message: "exhausted".to_string(),
        });
        assert!(!rejected.is_transient());
        assert!(!AllocationError::Validation("x".to_string()).is_transient());
    }
}
