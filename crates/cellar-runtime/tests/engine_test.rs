//! Container lifecycle tests with every kernel seam replaced.
//!
//! Mounts go to the recording syscall double, links and NAT rules to the
//! in-memory network doubles, cgroup roots are temp directories, and the
//! "init process" is an ordinary child process.
//!
//! Covered scenarios:
//! 1. A detached run with limits, a volume, and a published port
//! 2. Stop and removal of that container
//! 3. Rollback when the network attachment or command delivery fails
//! 4. A foreground run that waits and tears down
//! 5. Released resources are never released a second time

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::fs::File;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;
use std::sync::Arc;

use cellar_common::config::RuntimePaths;
use cellar_common::error::{CellarError, Result};
use cellar_common::types::{ContainerStatus, ResourceLimits};
use cellar_core::cgroup::CgroupHierarchy;
use cellar_core::syscall::TestSyscall;
use cellar_network::bridge::BridgeDriver;
use cellar_network::driver::RetryPolicy;
use cellar_network::firewall::{NatRule, RecordingFirewall};
use cellar_network::link::{LinkControl, RecordingLinks};
use cellar_network::NetworkRegistry;
use cellar_runtime::container::is_alive;
use cellar_runtime::process::{InitProcess, Launcher, SpawnConfig};
use cellar_runtime::{Engine, RunOptions};
use nix::errno::Errno;
use nix::unistd::Pid;

/// Starts `sh -c SCRIPT` and hands back a file as the command pipe.
///
/// Without `deliverable`, the pipe is opened read-only and the command
/// write fails.
struct ShellLauncher {
    script: &'static str,
    pipe_dir: PathBuf,
    deliverable: bool,
}

impl Launcher for ShellLauncher {
    fn spawn(&self, _config: &SpawnConfig<'_>) -> Result<InitProcess> {
        let child = Command::new("sh")
            .args(["-c", self.script])
            .spawn()
            .expect("spawn shell");
        let pid = Pid::from_raw(i32::try_from(child.id()).unwrap());
        let path = self.pipe_dir.join(format!("{pid}.cmd"));
        let mut pipe = File::create(&path).expect("pipe file");
        if !self.deliverable {
            pipe = File::open(&path).expect("read-only pipe file");
        }
        Ok(InitProcess::new(pid, pipe))
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    paths: RuntimePaths,
    syscall: Rc<TestSyscall>,
    links: Arc<RecordingLinks>,
    firewall: Arc<RecordingFirewall>,
    engine: Engine,
}

impl Fixture {
    fn cgroup_dir(&self, subsystem: &str, id: &str) -> PathBuf {
        self.dir.path().join("cgroup").join(subsystem).join("cellar").join(id)
    }
}

fn write_image(paths: &RuntimePaths, image: &str) {
    std::fs::create_dir_all(paths.image_dir()).expect("image dir");
    let mut builder =
        tar::Builder::new(File::create(paths.image_archive(image)).expect("create archive"));
    let data = b"root:x:0:0::/root:/bin/sh\n";
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "etc/passwd", &data[..])
        .expect("append");
    builder.finish().expect("finish archive");
}

fn fixture(script: &'static str) -> Fixture {
    build_fixture(script, true)
}

fn build_fixture(script: &'static str, deliverable: bool) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = RuntimePaths::under(dir.path());
    write_image(&paths, "busybox");

    let links = Arc::new(RecordingLinks::new());
    let firewall = Arc::new(RecordingFirewall::new());
    let mut networks = NetworkRegistry::new(paths.clone(), links.clone(), firewall.clone());
    networks.register_driver(Box::new(
        BridgeDriver::new(links.clone(), firewall.clone())
            .with_lookup_policy(RetryPolicy::immediate(1)),
    ));
    let _ = networks
        .create_network("bridge", "192.168.10.0/24", "backend")
        .expect("create network");

    let cgroup_root = dir.path().join("cgroup");
    let cpuset_root = cgroup_root.join("cpuset");
    std::fs::create_dir_all(&cpuset_root).expect("cpuset root");
    std::fs::write(cpuset_root.join("cpuset.cpus"), "0-3\n").expect("cpuset.cpus");
    std::fs::write(cpuset_root.join("cpuset.mems"), "0\n").expect("cpuset.mems");
    let cgroups = CgroupHierarchy::from_roots(
        ["cpu", "cpuset", "memory"].map(|s| (s, cgroup_root.join(s))),
    );

    let syscall = Rc::new(TestSyscall::new());
    let pipe_dir = dir.path().join("pipes");
    std::fs::create_dir_all(&pipe_dir).expect("pipe dir");
    let launcher = ShellLauncher {
        script,
        pipe_dir,
        deliverable,
    };
    let engine = Engine::with_parts(
        paths.clone(),
        syscall.clone(),
        Box::new(launcher),
        cgroups,
        networks,
    );
    Fixture {
        dir,
        paths,
        syscall,
        links,
        firewall,
        engine,
    }
}

fn detached_options(host_volume: &Path) -> RunOptions {
    RunOptions {
        image: "busybox".into(),
        command: vec!["top".into(), "-b".into()],
        name: Some("web".into()),
        volume: Some(format!("{}:/data", host_volume.display())),
        limits: ResourceLimits {
            memory: Some("64m".into()),
            ..ResourceLimits::default()
        },
        network: Some("backend".into()),
        publish: vec!["8080:80".into()],
        ..RunOptions::default()
    }
}

// ── Detached lifecycle ───────────────────────────────────────────────

#[test]
fn detached_run_wires_every_resource() {
    let f = fixture("sleep 30");
    let host_volume = f.dir.path().join("host-data");
    let outcome = f.engine.run(&detached_options(&host_volume)).expect("run");

    assert_eq!(outcome.name, "web");
    assert!(outcome.exit_code.is_none());
    assert!(outcome.warnings.is_empty());

    let record = f.engine.store().load("web").expect("record");
    assert_eq!(record.status, ContainerStatus::Running);
    assert_eq!(record.pid, outcome.pid);
    assert_eq!(record.command, "top -b");
    assert_eq!(record.ip_address, Some(Ipv4Addr::new(192, 168, 10, 2)));
    assert_eq!(record.port_mapping, vec!["8080:80"]);
    let id = record.id.as_str();
    assert_eq!(record.cgroup_path.as_deref(), Some(format!("cellar/{id}").as_str()));

    // Root overlay first, then the volume bind inside it.
    let targets: Vec<_> = f.syscall.mounts().into_iter().map(|m| m.target).collect();
    let root = f.paths.mount_point("web");
    assert_eq!(targets, vec![root.clone(), root.join("data")]);

    let memory = f.cgroup_dir("memory", id);
    assert_eq!(
        std::fs::read_to_string(memory.join("memory.limit_in_bytes")).unwrap(),
        "64m"
    );
    assert_eq!(
        std::fs::read_to_string(memory.join("tasks")).unwrap().trim(),
        outcome.pid.to_string()
    );

    // Only a memory limit was asked for, yet the cpuset group can take
    // the pid because it inherited the root's CPUs and memory nodes.
    let cpuset = f.cgroup_dir("cpuset", id);
    assert_eq!(std::fs::read_to_string(cpuset.join("cpuset.cpus")).unwrap(), "0-3");
    assert_eq!(std::fs::read_to_string(cpuset.join("cpuset.mems")).unwrap(), "0");
    assert_eq!(
        std::fs::read_to_string(cpuset.join("tasks")).unwrap().trim(),
        outcome.pid.to_string()
    );

    assert!(f.firewall.rules().iter().any(|rule| matches!(
        rule,
        NatRule::PortForward { destination, .. } if *destination == Ipv4Addr::new(192, 168, 10, 2)
    )));

    let pipe = f.dir.path().join("pipes").join(format!("{}.cmd", outcome.pid));
    assert_eq!(std::fs::read_to_string(pipe).unwrap(), "top -b");
    assert!(f.paths.container_log("web").is_file());

    let _ = f.engine.stop("web").expect("stop");
}

#[test]
fn stopped_container_is_removed_completely() {
    let f = fixture("sleep 30");
    let host_volume = f.dir.path().join("host-data");
    let outcome = f.engine.run(&detached_options(&host_volume)).expect("run");
    let id = f.engine.store().load("web").unwrap().id;

    assert!(matches!(f.engine.remove("web"), Err(CellarError::Config { .. })));

    let stopped = f.engine.stop("web").expect("stop");
    assert_eq!(stopped.status, ContainerStatus::Stopped);
    assert!(!is_alive(outcome.pid));

    f.engine.remove("web").expect("remove");
    assert!(!f.engine.store().exists("web"));
    assert!(!f.syscall.is_mounted(&f.paths.mount_point("web")));
    assert!(!f.paths.write_layer("web").exists());
    assert!(!f.cgroup_dir("memory", id.as_str()).exists());
    assert!(f.firewall.rules().iter().all(|r| !matches!(r, NatRule::PortForward { .. })));
    assert!(host_volume.is_dir(), "host side of a volume is never deleted");

    // The released address is handed out again.
    let ip = f.engine.networks().ipam().alloc("192.168.10.0/24").unwrap();
    assert_eq!(ip, Ipv4Addr::new(192, 168, 10, 2));
}

#[test]
fn names_are_unique_while_a_record_exists() {
    let f = fixture("sleep 30");
    let options = RunOptions {
        image: "busybox".into(),
        command: vec!["sh".into()],
        name: Some("solo".into()),
        ..RunOptions::default()
    };
    let _ = f.engine.run(&options).expect("first run");
    let mounts = f.syscall.mounts().len();

    assert!(matches!(f.engine.run(&options), Err(CellarError::Config { .. })));
    assert_eq!(f.syscall.mounts().len(), mounts);
    let _ = f.engine.stop("solo").expect("stop");
}

// ── Rollback ─────────────────────────────────────────────────────────

#[test]
fn failed_attachment_unwinds_in_reverse() {
    let f = fixture("sleep 30");
    // The bridge vanished after the network was created, so the
    // endpoint cannot be connected once the process is running.
    f.links.delete_link("backend").expect("drop bridge");

    let host_volume = f.dir.path().join("host-data");
    let err = f.engine.run(&detached_options(&host_volume)).unwrap_err();
    assert!(matches!(err, CellarError::NotFound { kind: "interface", .. }), "{err}");

    assert!(!f.engine.store().exists("web"));
    assert!(!f.paths.container_dir("web").exists());
    let root = f.paths.mount_point("web");
    assert!(!f.syscall.is_mounted(&root));
    assert!(!f.syscall.is_mounted(&root.join("data")));
    assert!(!f.paths.write_layer("web").exists());
    let cgroup_parent = f.dir.path().join("cgroup").join("memory").join("cellar");
    assert_eq!(std::fs::read_dir(cgroup_parent).unwrap().count(), 0);

    // Volume unmounted before root.
    let unmounts = f.syscall.unmounts();
    assert_eq!(unmounts, vec![root.join("data"), root]);

    let ip = f.engine.networks().ipam().alloc("192.168.10.0/24").unwrap();
    assert_eq!(ip, Ipv4Addr::new(192, 168, 10, 2));
}

#[test]
fn undelivered_command_unwinds_the_container() {
    let f = build_fixture("sleep 30", false);
    let host_volume = f.dir.path().join("host-data");
    assert!(f.engine.run(&detached_options(&host_volume)).is_err());

    assert!(!f.engine.store().exists("web"));
    assert!(!f.syscall.is_mounted(&f.paths.mount_point("web")));
    assert!(f.links.links().iter().all(|l| !l.starts_with("veth")));
    let ip = f.engine.networks().ipam().alloc("192.168.10.0/24").unwrap();
    assert_eq!(ip, Ipv4Addr::new(192, 168, 10, 2));
}

#[test]
fn malformed_volume_is_a_warning() {
    let f = fixture("sleep 30");
    let options = RunOptions {
        image: "busybox".into(),
        command: vec!["sh".into()],
        name: Some("novol".into()),
        volume: Some("only-one-part".into()),
        ..RunOptions::default()
    };
    let outcome = f.engine.run(&options).expect("run");
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(f.syscall.mounts().len(), 1);
    let _ = f.engine.stop("novol").expect("stop");
}

// ── Foreground ───────────────────────────────────────────────────────

#[test]
fn foreground_run_reports_exit_and_tears_down() {
    let f = fixture("exit 3");
    let options = RunOptions {
        image: "busybox".into(),
        command: vec!["false".into()],
        tty: true,
        name: Some("fg".into()),
        network: Some("backend".into()),
        ..RunOptions::default()
    };
    let outcome = f.engine.run(&options).expect("run");
    assert_eq!(outcome.exit_code, Some(3));
    assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);

    let record = f.engine.store().load("fg").expect("record kept");
    assert_eq!(record.status, ContainerStatus::Exited);
    assert!(!f.syscall.is_mounted(&f.paths.mount_point("fg")));
    assert!(f.links.links().iter().all(|l| !l.starts_with("veth")));
    assert!(!f.paths.container_log("fg").exists());

    assert_eq!(record.network, None);
    assert_eq!(record.ip_address, None);
    assert_eq!(record.endpoint_device, None);

    let listed = f.engine.list().expect("list");
    assert_eq!(listed.len(), 1);
}

// ── Release exactly once ─────────────────────────────────────────────

#[test]
fn removing_a_finished_foreground_container_keeps_reused_addresses() {
    let f = fixture("exit 0");
    let foreground = RunOptions {
        image: "busybox".into(),
        command: vec!["true".into()],
        tty: true,
        name: Some("fg".into()),
        network: Some("backend".into()),
        ..RunOptions::default()
    };
    let _ = f.engine.run(&foreground).expect("foreground run");

    let detached = RunOptions {
        image: "busybox".into(),
        command: vec!["top".into()],
        name: Some("bg".into()),
        network: Some("backend".into()),
        ..RunOptions::default()
    };
    let _ = f.engine.run(&detached).expect("detached run");
    let bg_ip = f.engine.store().load("bg").unwrap().ip_address;
    assert_eq!(bg_ip, Some(Ipv4Addr::new(192, 168, 10, 2)));

    f.engine.remove("fg").expect("remove fg");

    let next = f.engine.networks().ipam().alloc("192.168.10.0/24").unwrap();
    assert_eq!(next, Ipv4Addr::new(192, 168, 10, 3));
    assert_eq!(f.engine.store().load("bg").unwrap().ip_address, bg_ip);
    let _ = f.engine.stop("bg").expect("stop");
}

#[test]
fn retried_removal_releases_nothing_twice() {
    let f = fixture("sleep 30");
    let host_volume = f.dir.path().join("host-data");
    let _ = f.engine.run(&detached_options(&host_volume)).expect("run");
    let _ = f.engine.stop("web").expect("stop");

    let root = f.paths.mount_point("web");
    f.syscall.fail_umount(&root, Errno::EBUSY);
    let err = f.engine.remove("web").unwrap_err();
    assert!(matches!(&err, CellarError::Partial { failures, .. } if failures.len() == 1), "{err}");

    let kept = f.engine.store().load("web").expect("record kept for retry");
    assert_eq!(kept.ip_address, None);
    assert_eq!(kept.cgroup_path, None);

    // The released address goes to a new container before the retry.
    let other = RunOptions {
        image: "busybox".into(),
        command: vec!["top".into()],
        name: Some("other".into()),
        network: Some("backend".into()),
        ..RunOptions::default()
    };
    let _ = f.engine.run(&other).expect("other run");
    let other_ip = f.engine.store().load("other").unwrap().ip_address;
    assert_eq!(other_ip, Some(Ipv4Addr::new(192, 168, 10, 2)));

    f.syscall.clear_failures();
    f.engine.remove("web").expect("retried remove");
    assert!(!f.syscall.is_mounted(&root));
    assert!(!f.engine.store().exists("web"));

    let next = f.engine.networks().ipam().alloc("192.168.10.0/24").unwrap();
    assert_eq!(next, Ipv4Addr::new(192, 168, 10, 3));
    let _ = f.engine.stop("other").expect("stop");
}
