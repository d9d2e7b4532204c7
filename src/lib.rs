//! # esxlab - multi-VM router labs on an ESXi host
//!
//! A lab is described by one YAML topology file: the FTP host holding
//! installation images, the ESX host, shared and isolated networks, and
//! router VMs with their interfaces, addresses and configuration commands.
//! `esxlab` turns that description into a validated model and drives the
//! host through the lab lifecycle, configuring each router over its serial
//! console.
//!
//! ## Architecture
//!
//! - `ip`: address parsing, interfaces and VLAN aliases
//! - `config`: schema tables, the section tree and the topology reader
//! - `network`: port groups derived from `NET` sections
//! - `vm`: platforms, generated router commands and console prompts
//! - `session`: the expect-style interactive session seam
//! - `backend`: the compute backend seam and its ESX shell implementation
//! - `probe`: host reachability
//! - `pool`: per-phase worker pools with critical failure tagging
//! - `orchestrator`: the lifecycle itself
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use esxlab::config::load_topology;
//! use std::path::Path;
//!
//! let reader = load_topology(Path::new("lab.yaml"), None)?;
//! for vm in &reader.vms {
//!     println!("{}: {}", vm.name_on_host, vm.ctrl_addr());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Error Handling
//!
//! Every module has its own `thiserror` enum; the binary reports them with
//! `color_eyre` and exits non-zero on critical failures.

pub mod backend;
pub mod config;
pub mod ip;
pub mod network;
pub mod orchestrator;
pub mod pool;
pub mod probe;
pub mod session;
pub mod vm;
