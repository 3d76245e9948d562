//! Container orchestration for the Corral runtime.
//!
//! A [`Backend`](backend::Backend) creates containers through a
//! [`ContainerPool`](pool::ContainerPool), which binds each one to an
//! allocation from the resource pool, and registers them in a
//! [`ContainerRepository`](repository::ContainerRepository). Snapshots
//! written on stop let a restarted host pick its containers up again.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod container;
pub mod fence;
pub mod linux_container;
pub mod pool;
pub mod quota;
pub mod repository;
pub mod snapshot;
pub mod system_info;
