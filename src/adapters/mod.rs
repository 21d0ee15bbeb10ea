//! Adapters
//!
//! Inbound adapters serve the management listener; outbound adapters
//! implement the domain ports on concrete storage.

pub mod inbound;
pub mod outbound;
