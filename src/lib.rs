//! Lumishot backend: credit-metered AI headshot generation.
//!
//! The heart of the service is a per-user credit ledger with slow organic
//! recovery (one credit per idle hour, capped per day) and a local-midnight
//! reset to the daily baseline. An HTTP gateway exposes the ledger and a
//! billed generation endpoint backed by Replicate.

pub mod config;
pub mod credits;
pub mod gateway;
pub mod generation;
pub mod security;
