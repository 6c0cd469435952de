//! Routing plane: rule parsing and per-entry-point dispatch.

pub mod http;
pub mod rule;
pub mod tcp;
pub mod udp;
