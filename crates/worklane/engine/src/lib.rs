//! Worklane Engine - the contract and milestone lifecycle core.
//!
//! Three components over the ledger store:
//! - [`ContractEngine`]: contract creation, term edits, stage advances.
//! - [`MilestoneEngine`]: progress recording, status edges, detail edits.
//! - [`EscrowReconciler`]: escrow funding/release/refund and the
//!   asynchronous hold-confirmation path that brings internal state in line
//!   with the payment processor's ground truth.
//!
//! Every operation takes the acting [`worklane_types::Principal`]
//! explicitly, checks authorization and state preconditions before any
//! write, and performs its mutation as a single store transaction.

#![deny(unsafe_code)]

mod contract;
mod error;
mod milestone;
mod reconciler;

pub use contract::{ContractAggregate, ContractEngine, CreateContract, TermsUpdate};
pub use error::{EngineError, EngineResult};
pub use milestone::MilestoneEngine;
pub use reconciler::{EscrowFunding, EscrowReconciler};
