//! # corral-core
//!
//! Low-level Linux primitives for the Corral runtime.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: unshare flags and user-namespace id maps.
//! - **Resource limits**: `setrlimit(2)` for spawned processes.
//! - **Pseudo-terminals**: pty pairs, controlling terminals, window size.
//! - **Descriptor hand-off**: close-on-exec control and `SCM_RIGHTS`
//!   transfer over Unix sockets.
//! - **Users**: name to uid/gid/home resolution.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod fd;
pub mod namespace;
pub mod pty;
pub mod rlimit;
pub mod user;
