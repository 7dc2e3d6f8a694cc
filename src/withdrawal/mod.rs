//! Withdrawal requests and their admin approval

pub mod workflow;

pub use workflow::WithdrawalWorkflow;
