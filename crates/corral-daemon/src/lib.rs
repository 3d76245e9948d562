//! # corral-daemon
//!
//! The process-spawning side of a Corral container.
//!
//! `corral-initd` runs inside the container's namespaces. It tells the host
//! it is ready through a [`rendezvous`] pipe, then serves the control
//! socket handed to it by the host:
//!
//! - [`wire`]: newline-terminated JSON requests and responses.
//! - [`listener`]: accept loop; responses carry descriptors as
//!   `SCM_RIGHTS`.
//! - [`daemon`]: dispatches run, attach and signal requests.
//! - [`preparer`] and [`spawner`]: turn a process spec into a running
//!   child with pipes or a pty.
//! - [`reaper`]: the only place exit statuses are collected.
//!
//! [`client`] is the host half of the protocol and yields process handles
//! that own the received descriptors.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod client;
pub mod daemon;
pub mod listener;
pub mod preparer;
pub mod reaper;
pub mod rendezvous;
pub mod spawner;
pub mod wire;
