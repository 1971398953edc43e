//! Per-user execution state machine
//!
//! `AmountInput -> Validating -> Confirming -> Executing -> Succeeded | Failed`.
//! A failed validation returns to `AmountInput`; `Failed` re-enters
//! `Executing` with the same plan on retry. All moves go through
//! `transition`, and the state is persisted per user as JSON.

use crate::protocols::ProtocolKind;
use crate::{Error, Result};
use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Deposit,
    Withdraw,
    /// Swap `token_in` into the protocol's asset, then deposit
    Zap,
}

/// What the user asked for, resolved by the command layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    pub protocol: ProtocolKind,
    pub pool_id: String,
    /// APY shown at confirmation and stored as the entry APY
    pub apy: f64,
    /// Zap input token
    #[serde(default)]
    pub token_in: Option<Address>,
    #[serde(default = "default_slippage")]
    pub slippage_percent: f64,
}

fn default_slippage() -> f64 {
    0.5
}

impl Operation {
    pub fn deposit(protocol: ProtocolKind, pool_id: &str, apy: f64) -> Self {
        Self {
            kind: OperationKind::Deposit,
            protocol,
            pool_id: pool_id.to_string(),
            apy,
            token_in: None,
            slippage_percent: default_slippage(),
        }
    }

    pub fn withdraw(protocol: ProtocolKind, pool_id: &str) -> Self {
        Self {
            kind: OperationKind::Withdraw,
            protocol,
            pool_id: pool_id.to_string(),
            apy: 0.0,
            token_in: None,
            slippage_percent: default_slippage(),
        }
    }

    pub fn zap(protocol: ProtocolKind, pool_id: &str, apy: f64, token_in: Address, slippage_percent: f64) -> Self {
        Self {
            kind: OperationKind::Zap,
            protocol,
            pool_id: pool_id.to_string(),
            apy,
            token_in: Some(token_in),
            slippage_percent,
        }
    }
}

/// Everything needed to execute, fixed at confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub operation: Operation,
    pub amount: f64,
    pub projected_yearly_yield: f64,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExecutionState {
    AmountInput {
        operation: Operation,
        #[serde(default)]
        last_error: Option<String>,
    },
    Validating {
        operation: Operation,
        amount: f64,
    },
    Confirming {
        plan: ExecutionPlan,
    },
    Executing {
        plan: ExecutionPlan,
    },
    Succeeded {
        plan: ExecutionPlan,
        tx_hash: String,
    },
    Failed {
        plan: ExecutionPlan,
        error: String,
    },
}

impl ExecutionState {
    pub fn start(operation: Operation) -> Self {
        ExecutionState::AmountInput {
            operation,
            last_error: None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExecutionState::AmountInput { .. } => "amount_input",
            ExecutionState::Validating { .. } => "validating",
            ExecutionState::Confirming { .. } => "confirming",
            ExecutionState::Executing { .. } => "executing",
            ExecutionState::Succeeded { .. } => "succeeded",
            ExecutionState::Failed { .. } => "failed",
        }
    }

    pub fn operation(&self) -> &Operation {
        match self {
            ExecutionState::AmountInput { operation, .. }
            | ExecutionState::Validating { operation, .. } => operation,
            ExecutionState::Confirming { plan }
            | ExecutionState::Executing { plan }
            | ExecutionState::Succeeded { plan, .. }
            | ExecutionState::Failed { plan, .. } => &plan.operation,
        }
    }

    pub fn plan(&self) -> Option<&ExecutionPlan> {
        match self {
            ExecutionState::Confirming { plan }
            | ExecutionState::Executing { plan }
            | ExecutionState::Succeeded { plan, .. }
            | ExecutionState::Failed { plan, .. } => Some(plan),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    AmountEntered(f64),
    Validated,
    Rejected(String),
    Confirmed,
    Submitted { tx_hash: String },
    SubmissionFailed(String),
    Retry,
}

impl ExecutionEvent {
    fn name(&self) -> &'static str {
        match self {
            ExecutionEvent::AmountEntered(_) => "amount_entered",
            ExecutionEvent::Validated => "validated",
            ExecutionEvent::Rejected(_) => "rejected",
            ExecutionEvent::Confirmed => "confirmed",
            ExecutionEvent::Submitted { .. } => "submitted",
            ExecutionEvent::SubmissionFailed(_) => "submission_failed",
            ExecutionEvent::Retry => "retry",
        }
    }
}

/// The only way execution state changes
pub fn transition(state: ExecutionState, event: ExecutionEvent) -> Result<ExecutionState> {
    use ExecutionEvent as E;
    use ExecutionState as S;

    match (state, event) {
        (S::AmountInput { operation, .. }, E::AmountEntered(amount)) => {
            Ok(S::Validating { operation, amount })
        }
        (S::Validating { operation, amount }, E::Validated) => {
            let projected_yearly_yield = match operation.kind {
                OperationKind::Withdraw => 0.0,
                _ => amount * operation.apy / 100.0,
            };
            Ok(S::Confirming {
                plan: ExecutionPlan {
                    operation,
                    amount,
                    projected_yearly_yield,
                    attempts: 0,
                },
            })
        }
        (S::Validating { operation, .. }, E::Rejected(reason)) => Ok(S::AmountInput {
            operation,
            last_error: Some(reason),
        }),
        (S::Confirming { mut plan }, E::Confirmed) => {
            plan.attempts += 1;
            Ok(S::Executing { plan })
        }
        (S::Executing { plan }, E::Submitted { tx_hash }) => Ok(S::Succeeded { plan, tx_hash }),
        (S::Executing { plan }, E::SubmissionFailed(error)) => Ok(S::Failed { plan, error }),
        (S::Failed { mut plan, .. }, E::Retry) => {
            plan.attempts += 1;
            Ok(S::Executing { plan })
        }
        (state, event) => Err(Error::InvalidTransition(format!(
            "{} cannot handle {}",
            state.name(),
            event.name()
        ))),
    }
}
