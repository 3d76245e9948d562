//! Backend lifecycle tests against an in-memory container pool.

#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use corral_common::error::{CorralError, Result};
use corral_common::types::{
    Capacity, ContainerSpec, ContainerState, Handle, ProcessSpec, Properties, TtySpec,
};
use corral_daemon::client::Process;
use corral_runtime::backend::{Backend, LinuxBackend, RoutePredicate, RoutingBackend};
use corral_runtime::container::{Container, ContainerInfo};
use corral_runtime::pool::ContainerPool;
use corral_runtime::repository::InMemoryRepository;
use corral_runtime::system_info::SystemInfo;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct FakeSnapshot {
    handle: Handle,
    properties: Properties,
}

#[derive(Debug)]
struct FakeContainer {
    handle: Handle,
    properties: Properties,
    fail_start: bool,
    state: Mutex<ContainerState>,
}

impl Container for FakeContainer {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    fn properties(&self) -> Properties {
        self.properties.clone()
    }

    fn grace_time(&self) -> Option<Duration> {
        None
    }

    fn state(&self) -> ContainerState {
        *self.state.lock().unwrap()
    }

    fn start(&self) -> Result<()> {
        if self.fail_start {
            return Err(CorralError::Sync {
                message: "unexpected end of file".into(),
            });
        }
        *self.state.lock().unwrap() = ContainerState::Active;
        Ok(())
    }

    fn stop(&self, _kill: bool) -> Result<()> {
        *self.state.lock().unwrap() = ContainerState::Stopped;
        Ok(())
    }

    fn info(&self) -> Result<ContainerInfo> {
        if self.properties.contains_key("broken") {
            return Err(CorralError::Config {
                message: "cannot describe".into(),
            });
        }
        Ok(ContainerInfo {
            handle: self.handle.clone(),
            state: self.state(),
            host_ip: Ipv4Addr::new(10, 254, 0, 1),
            container_ip: Ipv4Addr::new(10, 254, 0, 2),
            container_path: PathBuf::from("/depot").join(self.handle.as_str()),
            properties: self.properties.clone(),
            process_ids: Vec::new(),
            created_at: Utc::now(),
        })
    }

    fn snapshot(&self, out: &mut dyn Write) -> Result<()> {
        if self.properties.contains_key("unsavable") {
            return Err(CorralError::Config {
                message: "cannot snapshot".into(),
            });
        }
        let snapshot = FakeSnapshot {
            handle: self.handle.clone(),
            properties: self.properties.clone(),
        };
        serde_json::to_writer(out, &snapshot)?;
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn run(&self, _spec: &ProcessSpec, _tty: Option<TtySpec>) -> Result<Box<dyn Process>> {
        Err(CorralError::Spawn {
            message: "not supported".into(),
        })
    }

    fn attach(&self, pid: i32) -> Result<i32> {
        Err(CorralError::ProcessNotFound { pid })
    }
}

/// Pool recording every call, with handles standing in for allocations.
#[derive(Debug, Default)]
struct FakePool {
    issued: Mutex<HashSet<Handle>>,
    events: Mutex<Vec<String>>,
}

impl FakePool {
    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn issued(&self) -> usize {
        self.issued.lock().unwrap().len()
    }

    fn build(&self, handle: Handle, properties: Properties) -> Result<Arc<dyn Container>> {
        if !self.issued.lock().unwrap().insert(handle.clone()) {
            return Err(CorralError::ResourceConflict {
                message: format!("{handle} already issued"),
            });
        }
        Ok(Arc::new(FakeContainer {
            fail_start: properties.contains_key("fail-start"),
            handle,
            properties,
            state: Mutex::new(ContainerState::Creating),
        }))
    }
}

impl ContainerPool for FakePool {
    fn setup(&self) -> Result<()> {
        self.record("setup".into());
        Ok(())
    }

    fn create(&self, spec: &ContainerSpec) -> Result<Arc<dyn Container>> {
        let handle = spec.handle.clone().unwrap_or_else(Handle::generate);
        self.record(format!("create {handle}"));
        self.build(handle, spec.properties.clone())
    }

    fn restore(&self, snapshot: &mut dyn Read) -> Result<Arc<dyn Container>> {
        let snapshot: FakeSnapshot = serde_json::from_reader(snapshot)?;
        self.record(format!("restore {}", snapshot.handle));
        self.build(snapshot.handle, snapshot.properties)
    }

    fn destroy(&self, container: &dyn Container) -> Result<()> {
        container.stop(false)?;
        let _ = self.issued.lock().unwrap().remove(container.handle());
        self.record(format!("destroy {}", container.handle()));
        Ok(())
    }

    fn prune(&self, keep: &HashSet<Handle>) -> Result<()> {
        let mut kept: Vec<_> = keep.iter().map(Handle::as_str).collect();
        kept.sort_unstable();
        self.record(format!("prune {}", kept.join(",")));
        self.issued.lock().unwrap().retain(|h| keep.contains(h));
        Ok(())
    }

    fn max_containers(&self) -> usize {
        256
    }
}

#[derive(Debug)]
struct FixedSystem;

impl SystemInfo for FixedSystem {
    fn total_memory(&self) -> Result<u64> {
        Ok(8 << 30)
    }

    fn total_disk(&self) -> Result<u64> {
        Ok(100 << 30)
    }
}

fn backend(pool: &Arc<FakePool>) -> LinuxBackend {
    LinuxBackend::new(
        Arc::clone(pool) as Arc<dyn ContainerPool>,
        Arc::new(InMemoryRepository::new()),
        Arc::new(FixedSystem),
    )
}

fn spec(handle: &str) -> ContainerSpec {
    ContainerSpec {
        handle: Some(Handle::new(handle)),
        ..ContainerSpec::default()
    }
}

fn labelled(handle: &str, pairs: &[(&str, &str)]) -> ContainerSpec {
    ContainerSpec {
        properties: pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect(),
        ..spec(handle)
    }
}

#[test]
fn duplicate_handle_is_rejected_until_destroyed() {
    let pool = Arc::new(FakePool::default());
    let backend = backend(&pool);

    let first = backend.create(&spec("h1")).unwrap();
    assert_eq!(first.state(), ContainerState::Active);

    let err = backend.create(&spec("h1")).unwrap_err();
    assert!(matches!(err, CorralError::HandleExists { handle } if handle == "h1"));
    assert_eq!(pool.issued(), 1);

    backend.destroy(&Handle::new("h1")).unwrap();
    let again = backend.create(&spec("h1")).unwrap();
    assert_eq!(again.handle().as_str(), "h1");
}

#[test]
fn destroying_unknown_handle_changes_nothing() {
    let pool = Arc::new(FakePool::default());
    let backend = backend(&pool);
    let _ = backend.create(&spec("h1")).unwrap();
    let before = pool.events();

    let err = backend.destroy(&Handle::new("ghost")).unwrap_err();
    assert!(matches!(err, CorralError::ContainerNotFound { handle } if handle == "ghost"));
    assert_eq!(pool.events(), before);
    assert!(backend.lookup(&Handle::new("h1")).is_ok());
}

#[test]
fn failed_start_destroys_the_container() {
    let pool = Arc::new(FakePool::default());
    let backend = backend(&pool);

    let err = backend.create(&labelled("h1", &[("fail-start", "")])).unwrap_err();
    assert!(matches!(err, CorralError::Sync { .. }));
    assert_eq!(pool.issued(), 0);
    assert_eq!(pool.events(), vec!["create h1", "destroy h1"]);
    assert!(matches!(
        backend.lookup(&Handle::new("h1")),
        Err(CorralError::ContainerNotFound { .. })
    ));
}

#[test]
fn property_filter_requires_every_pair() {
    let pool = Arc::new(FakePool::default());
    let backend = backend(&pool);
    let _ = backend.create(&labelled("a", &[("app", "web"), ("tier", "front")])).unwrap();
    let _ = backend.create(&labelled("b", &[("app", "web")])).unwrap();
    let _ = backend.create(&labelled("c", &[("app", "db")])).unwrap();

    let handles = |filter: &[(&str, &str)]| -> Vec<String> {
        let filter: Properties = filter
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        backend
            .containers(&filter)
            .unwrap()
            .iter()
            .map(|c| c.handle().to_string())
            .collect()
    };

    assert_eq!(handles(&[]), vec!["a", "b", "c"]);
    assert_eq!(handles(&[("app", "web")]), vec!["a", "b"]);
    assert_eq!(handles(&[("app", "web"), ("tier", "front")]), vec!["a"]);
    assert!(handles(&[("missing", "")]).is_empty());
}

#[test]
fn bulk_info_keeps_errors_per_handle() {
    let pool = Arc::new(FakePool::default());
    let backend = backend(&pool);
    let _ = backend.create(&spec("ok")).unwrap();
    let _ = backend.create(&labelled("broken", &[("broken", "yes")])).unwrap();

    let info = backend.bulk_info(&[Handle::new("ok"), Handle::new("broken"), Handle::new("ghost")]);
    assert_eq!(info.len(), 3);
    assert_eq!(info[&Handle::new("ok")].as_ref().unwrap().state, ContainerState::Active);
    assert!(matches!(info[&Handle::new("broken")], Err(CorralError::Config { .. })));
    assert!(matches!(
        info[&Handle::new("ghost")],
        Err(CorralError::ContainerNotFound { .. })
    ));
}

#[test]
fn capacity_combines_host_totals_and_pool_limit() {
    let pool = Arc::new(FakePool::default());
    let capacity = backend(&pool).capacity().unwrap();
    assert_eq!(
        capacity,
        Capacity {
            memory_in_bytes: 8 << 30,
            disk_in_bytes: 100 << 30,
            max_containers: 256,
        }
    );
}

#[test]
fn snapshots_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let snapshots = dir.path().join("snapshots");

    let old_pool = Arc::new(FakePool::default());
    let old = backend(&old_pool).with_snapshots(&snapshots);
    let _ = old.create(&labelled("a", &[("app", "web")])).unwrap();
    let _ = old.create(&spec("b")).unwrap();
    old.stop().unwrap();
    assert!(snapshots.join("a").is_file());
    assert!(snapshots.join("b").is_file());
    fs::write(snapshots.join("corrupt"), b"{not json").unwrap();

    let pool = Arc::new(FakePool::default());
    let restarted = backend(&pool).with_snapshots(&snapshots);
    restarted.start().unwrap();

    let restored = restarted.lookup(&Handle::new("a")).unwrap();
    assert_eq!(restored.properties()["app"], "web");
    assert!(restarted.lookup(&Handle::new("b")).is_ok());

    assert!(!snapshots.join("a").exists());
    assert!(!snapshots.join("b").exists());
    assert!(snapshots.join("corrupt").exists());

    // Prune runs once, after every restore.
    assert_eq!(pool.events(), vec!["restore a", "restore b", "prune a,b"]);
}

#[test]
fn stop_saves_the_rest_and_reports_the_first_failure() {
    let dir = tempfile::tempdir().unwrap();
    let snapshots = dir.path().join("snapshots");
    let pool = Arc::new(FakePool::default());
    let backend = backend(&pool).with_snapshots(&snapshots);
    let _ = backend.create(&labelled("a", &[("unsavable", "yes")])).unwrap();
    let _ = backend.create(&spec("b")).unwrap();

    let err = backend.stop().unwrap_err();
    assert!(matches!(err, CorralError::Config { message } if message == "cannot snapshot"));
    assert!(snapshots.join("b").is_file());
    assert!(!snapshots.join("a").exists());
}

#[test]
fn start_without_snapshots_prunes_everything_unregistered() {
    let pool = Arc::new(FakePool::default());
    let _ = pool.create(&spec("leftover")).unwrap();
    let backend = backend(&pool);
    backend.start().unwrap();
    assert_eq!(pool.issued(), 0);
    assert_eq!(pool.events().last().unwrap(), "prune ");
}

#[test]
fn routing_sends_creates_by_predicate_and_calls_by_owner() {
    let fallback_pool = Arc::new(FakePool::default());
    let routed_pool = Arc::new(FakePool::default());
    let fallback: Arc<dyn Backend> = Arc::new(backend(&fallback_pool));
    let routed: Arc<dyn Backend> = Arc::new(backend(&routed_pool));
    let router = RoutingBackend::new(Arc::clone(&fallback))
        .route(RoutePredicate::RootfsPrefix("docker://".into()), Arc::clone(&routed));

    let docker = ContainerSpec {
        rootfs: "docker:///busybox".into(),
        ..spec("d1")
    };
    let _ = router.create(&docker).unwrap();
    let _ = router.create(&spec("l1")).unwrap();
    assert_eq!(routed_pool.issued(), 1);
    assert_eq!(fallback_pool.issued(), 1);

    assert!(matches!(
        router.create(&spec("d1")),
        Err(CorralError::HandleExists { .. })
    ));

    let all = router.containers(&Properties::new()).unwrap();
    assert_eq!(all.len(), 2);
    let info = router.bulk_info(&[Handle::new("d1"), Handle::new("l1")]);
    assert!(info.values().all(Result::is_ok));

    router.destroy(&Handle::new("d1")).unwrap();
    assert_eq!(routed_pool.issued(), 0);
    assert!(matches!(
        router.destroy(&Handle::new("d1")),
        Err(CorralError::ContainerNotFound { .. })
    ));
    assert_eq!(router.capacity().unwrap().max_containers, 256);
}

#[test]
fn routing_by_handle_prefix() {
    let predicate = RoutePredicate::HandlePrefix("yarn-".into());
    assert!(predicate.matches(&spec("yarn-1")));
    assert!(!predicate.matches(&spec("web-1")));
    assert!(!predicate.matches(&ContainerSpec::default()));
}

#[test]
fn routing_setup_reaches_each_backend_once() {
    let pool = Arc::new(FakePool::default());
    let shared: Arc<dyn Backend> = Arc::new(backend(&pool));
    let router = RoutingBackend::new(Arc::clone(&shared))
        .route(RoutePredicate::HandlePrefix("x".into()), Arc::clone(&shared));
    router.setup().unwrap();
    router.ping().unwrap();
    assert_eq!(pool.events(), vec!["setup"]);
}

#[test]
fn repository_order_is_stable() {
    let pool = Arc::new(FakePool::default());
    let backend = backend(&pool);
    for handle in ["c", "a", "b"] {
        let _ = backend.create(&spec(handle)).unwrap();
    }
    let order: Vec<_> = backend
        .containers(&BTreeMap::new())
        .unwrap()
        .iter()
        .map(|c| c.handle().to_string())
        .collect();
    assert_eq!(order, vec!["a", "b", "c"]);
}
