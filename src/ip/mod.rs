//! Interface addressing.
//!
//! This module resolves the address lists written in the topology file into
//! typed IPv4/IPv6 bindings and groups them under router interfaces.

pub mod alias;
pub mod interface;

// Re-export commonly used types
pub use alias::{parse_cidr, AddressError, Alias, Cidr, V4Binding, V6Binding};
pub use interface::{Interface, InterfaceError};
