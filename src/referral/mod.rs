//! Referral attribution

pub mod engine;

pub use engine::ReferralEngine;
