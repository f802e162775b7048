//! Credits module (append-only usage ledger).
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns.
//! Storage adapters live in `genforge-infra::ledger` and drive every balance
//! change through [`CreditAccount`] decisions.

pub mod ledger;

pub use ledger::{
    reconstruct_balance, CreditAccount, CreditError, CreditLedgerEntry, DebitReceipt, EntryType,
    RefundReceipt,
};
