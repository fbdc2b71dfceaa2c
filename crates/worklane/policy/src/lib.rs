//! Worklane Policy - authorization for lifecycle transitions
//!
//! Pure, synchronous functions mapping (principal, entity, requested
//! transition) to allow or a typed [`Denial`]. Rules are always role *and*
//! relationship to the entity, never role alone; admins bypass relationship
//! checks but not structural ones (engine-only edges stay engine-only).
//!
//! State preconditions are validated here as well so the policy is complete
//! on its own, but the engines check edge validity first and surface those
//! failures through their own error taxonomy.

#![deny(unsafe_code)]

use worklane_types::{
    Contract, ContractEvent, ContractStage, Denial, DenyReason, Milestone, MilestoneEvent,
    MilestoneStatus, Principal, Project, Role,
};

/// Contract creation: only the client who owns the project (or an admin).
pub fn authorize_contract_create(principal: &Principal, project: &Project) -> Result<(), Denial> {
    if principal.is_admin() {
        return Ok(());
    }
    if principal.role != Role::Client {
        return Err(Denial::new(
            DenyReason::RoleNotAllowed,
            format!("role {:?} cannot create contracts", principal.role),
        ));
    }
    if principal.id != project.client_id {
        return Err(Denial::new(
            DenyReason::NotOwner,
            format!("caller does not own project {}", project.id),
        ));
    }
    Ok(())
}

/// Contract transitions: term edits and stage advances.
pub fn authorize_contract(
    principal: &Principal,
    contract: &Contract,
    event: ContractEvent,
) -> Result<(), Denial> {
    match event {
        ContractEvent::EditTerms => {
            if contract.stage != ContractStage::Proposal {
                return Err(Denial::new(
                    DenyReason::InvalidSourceState,
                    format!("terms are frozen once stage leaves proposal ({})", contract.stage),
                ));
            }
            if principal.is_admin() {
                return Ok(());
            }
            require_owner(principal, contract)
        }
        ContractEvent::AdvanceStage(target) => {
            if contract.stage.is_terminal() {
                return Err(Denial::new(
                    DenyReason::TerminalState,
                    format!("contract {} is {}", contract.id, contract.stage),
                ));
            }
            if target == ContractStage::Proposal {
                return Err(Denial::new(
                    DenyReason::UnknownTransition,
                    "no transition re-enters proposal",
                ));
            }
            if !contract.stage.can_advance_to(target) {
                return Err(Denial::new(
                    DenyReason::InvalidSourceState,
                    format!("{} -> {} is not a defined edge", contract.stage, target),
                ));
            }
            if principal.is_admin() {
                return Ok(());
            }
            match target {
                // The freelancer accepts the proposed terms, and later
                // submits the delivery for review.
                ContractStage::Approval | ContractStage::Review => {
                    require_freelancer(principal, contract)
                }
                // The client funds the engagement and signs off on it.
                ContractStage::Payment | ContractStage::Completed => {
                    require_owner(principal, contract)
                }
                ContractStage::Cancelled | ContractStage::Disputed => {
                    require_participant(principal, contract)
                }
                ContractStage::Proposal => unreachable!("rejected above"),
            }
        }
    }
}

/// Milestone transitions: progress narration, status edges, detail edits.
pub fn authorize_milestone(
    principal: &Principal,
    contract: &Contract,
    milestone: &Milestone,
    event: MilestoneEvent,
) -> Result<(), Denial> {
    match event {
        MilestoneEvent::RecordProgress => {
            if principal.is_admin() {
                return Ok(());
            }
            require_freelancer(principal, contract)
        }
        MilestoneEvent::SetStatus(target) => {
            // Paid is written by the escrow reconciler, never by a caller —
            // not even an admin.
            if target == MilestoneStatus::Paid {
                return Err(Denial::new(
                    DenyReason::EngineOnly,
                    "paid is set by escrow settlement only",
                ));
            }
            if target == MilestoneStatus::Pending {
                return Err(Denial::new(
                    DenyReason::UnknownTransition,
                    "no transition re-enters pending",
                ));
            }
            if milestone.status.is_terminal() {
                return Err(Denial::new(
                    DenyReason::TerminalState,
                    format!("milestone {} is {}", milestone.id, milestone.status),
                ));
            }
            if !milestone.status.can_move_to(target) {
                return Err(Denial::new(
                    DenyReason::InvalidSourceState,
                    format!("{} -> {} is not a defined edge", milestone.status, target),
                ));
            }
            if principal.is_admin() {
                return Ok(());
            }
            match target {
                MilestoneStatus::InProgress
                | MilestoneStatus::Completed
                | MilestoneStatus::PaymentRequested => require_freelancer(principal, contract),
                MilestoneStatus::Cancelled => require_participant(principal, contract),
                MilestoneStatus::Pending | MilestoneStatus::Paid => {
                    unreachable!("rejected above")
                }
            }
        }
        MilestoneEvent::EditDetails => {
            if milestone.status != MilestoneStatus::Pending {
                return Err(Denial::new(
                    DenyReason::InvalidSourceState,
                    format!("details are frozen once status leaves pending ({})", milestone.status),
                ));
            }
            if principal.is_admin() {
                return Ok(());
            }
            require_owner(principal, contract)
        }
    }
}

/// Funding a milestone's escrow hold: the paying client only.
pub fn authorize_funding(principal: &Principal, contract: &Contract) -> Result<(), Denial> {
    if principal.is_admin() {
        return Ok(());
    }
    require_owner(principal, contract)
}

/// Releasing held funds to the freelancer: the paying client only.
pub fn authorize_release(principal: &Principal, contract: &Contract) -> Result<(), Denial> {
    if principal.is_admin() {
        return Ok(());
    }
    require_owner(principal, contract)
}

/// Refunding held funds and cancelling: either party.
pub fn authorize_refund(principal: &Principal, contract: &Contract) -> Result<(), Denial> {
    if principal.is_admin() {
        return Ok(());
    }
    require_participant(principal, contract)
}

fn require_owner(principal: &Principal, contract: &Contract) -> Result<(), Denial> {
    if principal.role == Role::Client && principal.id == contract.client_id {
        Ok(())
    } else {
        Err(Denial::new(
            DenyReason::NotOwner,
            format!("caller is not the client on contract {}", contract.id),
        ))
    }
}

fn require_freelancer(principal: &Principal, contract: &Contract) -> Result<(), Denial> {
    if principal.role == Role::Freelancer && principal.id == contract.freelancer_id {
        Ok(())
    } else {
        Err(Denial::new(
            DenyReason::NotFreelancer,
            format!("caller is not the freelancer on contract {}", contract.id),
        ))
    }
}

fn require_participant(principal: &Principal, contract: &Contract) -> Result<(), Denial> {
    let related = (principal.role == Role::Client && principal.id == contract.client_id)
        || (principal.role == Role::Freelancer && principal.id == contract.freelancer_id);
    if related {
        Ok(())
    } else {
        Err(Denial::new(
            DenyReason::NotParticipant,
            format!("caller is not a party to contract {}", contract.id),
        ))
    }
}
