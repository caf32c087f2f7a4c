//! Unattended multi-signal trading loop: independent signal modules feed a
//! regime-weighted combiner, a risk manager gates sizing and daily losses,
//! and an execution coordinator keeps an auditable order ledger.

pub mod broker;
pub mod config;
pub mod control;
pub mod execution;
pub mod market;
pub mod portfolio;
pub mod rate_limit;
pub mod regime;
pub mod risk;
pub mod runner;
pub mod signal;
pub mod singleton;
