//! Core types and rules for the atelier credit ledger.
//!
//! This crate holds everything about credits that does not touch I/O:
//!
//! - **Identifiers**: `UserId`, `TransactionId`
//! - **Accounts**: `CreditAccount`, `PlanTier`, `PlanStatus`, `BillingPeriod`, `UserRecord`
//! - **Allocation**: the plan-change / renewal classifier and monthly reset arithmetic
//! - **Plans**: variant-id and product-name resolution for billing webhooks
//! - **History**: `CreditTransaction`, `TransactionKind`
//!
//! # Credit unit
//!
//! One credit pays for one AI generation. Credits are whole numbers stored as
//! `i64`; a paid plan grants its monthly allowance every calendar month
//! regardless of whether it is billed monthly or annually.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod account;
pub mod allocation;
pub mod credits;
pub mod error;
pub mod ids;
pub mod plans;

pub use account::{
    BillingPeriod, CreditAccount, CreditInfo, DeductOutcome, PlanStatus, PlanTier,
    SubscriptionUpdate, UserRecord, AGENCY_PLAN_CREDITS, BASIC_PLAN_CREDITS,
    LOW_CREDITS_THRESHOLD, PRO_PLAN_CREDITS, SIGNUP_BONUS_CREDITS,
};
pub use allocation::{
    add_one_month, classify_transition, compute_allocation, end_of_day, monthly_reset_total,
    Allocation, AllocationInput, PlanTransition,
};
pub use credits::{CreditTransaction, TransactionKind};
pub use error::{BillingError, Result};
pub use ids::{IdError, TransactionId, UserId};
pub use plans::{map_provider_status, VariantConfig};
