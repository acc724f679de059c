//! Domain types shared by the entities, services and handlers.

pub mod exception;
pub mod order;
pub mod proposal;

pub use exception::{ExceptionStatus, ExceptionType, ResolutionAction};
pub use order::{InstanceStatus, OrderStatus};
pub use proposal::{ItemChange, Proposal, ProposalLimits, RawProposal, SerialChange, Tracking};
