//! Deployment module

pub mod checkout;
pub mod fsm;
pub mod lifecycle;
pub mod pipeline;
