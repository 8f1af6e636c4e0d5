//! Runtime engine that orchestrates container lifecycle.
//!
//! Creation is a transaction: every sub-resource that comes up pushes an
//! undo step, and a failure anywhere runs exactly those steps in reverse
//! before the error is returned. Teardown of a finished container walks
//! the same resources in reverse creation order and keeps going past
//! failures.

use std::path::PathBuf;
use std::rc::Rc;

use cellar_common::config::RuntimePaths;
use cellar_common::constants::STOP_GRACE_PERIOD;
use cellar_common::error::{CellarError, Result, StepErrors};
use cellar_common::types::{ContainerId, ContainerStatus, ResourceLimits};
use cellar_core::cgroup::{CgroupHierarchy, CgroupManager, SubsystemRegistry, container_cgroup_path};
use cellar_core::filesystem::{VolumeMapping, Workspace};
use cellar_core::namespace::NamespaceConfig;
use cellar_core::syscall::{Syscall, create_syscall};
use cellar_network::{Endpoint, NetworkRegistry, PortMapping};
use nix::unistd::Pid;

use crate::container::{ContainerRecord, is_alive, validate_container_name};
use crate::logs;
use crate::process::{self, CloneLauncher, InitProcess, Launcher, SpawnConfig};
use crate::state::{ContainerStore, NameClaim};

/// Everything `cellar run` asks for.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Image name; its archive lives in the image directory.
    pub image: String,
    /// User command and arguments.
    pub command: Vec<String>,
    /// Stay attached to the terminal and wait for the container.
    pub tty: bool,
    /// Container name; defaults to the generated id.
    pub name: Option<String>,
    /// Raw `host:container` volume mapping.
    pub volume: Option<String>,
    /// Extra `KEY=VALUE` environment entries.
    pub env: Vec<String>,
    /// Cgroup limits; nothing is created when all are empty.
    pub limits: ResourceLimits,
    /// Network to attach to.
    pub network: Option<String>,
    /// Raw `host:container` port mappings. Requires a network.
    pub publish: Vec<String>,
}

/// Result of a successful `run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Generated container id.
    pub id: ContainerId,
    /// Container name.
    pub name: String,
    /// Host pid of the init process.
    pub pid: u32,
    /// Exit code, for containers run in the foreground.
    pub exit_code: Option<i32>,
    /// Degraded-but-continued conditions worth showing the user.
    pub warnings: Vec<String>,
}

/// Validated form of [`RunOptions`].
struct Plan {
    id: ContainerId,
    name: String,
    ports: Vec<PortMapping>,
    claim: NameClaim,
}

enum Undo {
    Workspace(Option<VolumeMapping>),
    Record,
    Cgroup(PathBuf),
    Process(Pid),
    Endpoint(Endpoint),
}

impl Undo {
    const fn step(&self) -> &'static str {
        match self {
            Self::Workspace(_) => "teardown workspace",
            Self::Record => "remove record",
            Self::Cgroup(_) => "destroy cgroup",
            Self::Process(_) => "kill init process",
            Self::Endpoint(_) => "release endpoint",
        }
    }
}

/// Undo log of a container being created.
struct Transaction<'e> {
    engine: &'e Engine,
    name: String,
    undo: Vec<Undo>,
}

impl<'e> Transaction<'e> {
    const fn new(engine: &'e Engine, name: String) -> Self {
        Self {
            engine,
            name,
            undo: Vec::new(),
        }
    }

    fn push(&mut self, undo: Undo) {
        self.undo.push(undo);
    }

    fn commit(self) {
        tracing::debug!(container = %self.name, steps = self.undo.len(), "creation committed");
    }

    fn rollback(mut self) -> StepErrors {
        let mut errors = StepErrors::new();
        while let Some(undo) = self.undo.pop() {
            let step = undo.step();
            let result = match undo {
                Undo::Endpoint(endpoint) => self.engine.networks.release(&endpoint),
                Undo::Process(pid) => process::kill_and_reap(pid),
                Undo::Cgroup(path) => self.engine.cgroup(path).destroy(),
                Undo::Record => self.engine.store.remove(&self.name),
                Undo::Workspace(volume) => self
                    .engine
                    .workspace()
                    .teardown(&self.name, volume.as_ref()),
            };
            if let Err(e) = result {
                tracing::error!(container = %self.name, step, error = %e, "rollback step failed");
                errors.push(step, e);
            }
        }
        errors
    }
}

/// The runtime engine that coordinates all container operations.
///
/// Owns the kernel-facing seams and the registries each invocation
/// needs; it is constructed once at process start.
pub struct Engine {
    paths: RuntimePaths,
    syscall: Rc<dyn Syscall>,
    launcher: Box<dyn Launcher>,
    cgroups: CgroupHierarchy,
    subsystems: SubsystemRegistry,
    networks: NetworkRegistry,
    store: ContainerStore,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("paths", &self.paths)
            .field("cgroups", &self.cgroups)
            .field("subsystems", &self.subsystems)
            .field("networks", &self.networks)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine for the live host: real syscalls, `clone(2)`,
    /// the mounted cgroup hierarchy, and every persisted network.
    ///
    /// # Errors
    ///
    /// Returns an error if mountinfo or the networks directory cannot be
    /// read.
    pub fn new(paths: RuntimePaths) -> Result<Self> {
        let networks = NetworkRegistry::open(paths.clone())?;
        let cgroups = CgroupHierarchy::discover()?;
        Ok(Self::with_parts(
            paths,
            Rc::from(create_syscall()),
            Box::new(CloneLauncher),
            cgroups,
            networks,
        ))
    }

    /// Creates an engine from explicit parts.
    #[must_use]
    pub fn with_parts(
        paths: RuntimePaths,
        syscall: Rc<dyn Syscall>,
        launcher: Box<dyn Launcher>,
        cgroups: CgroupHierarchy,
        networks: NetworkRegistry,
    ) -> Self {
        Self {
            store: ContainerStore::new(paths.clone()),
            paths,
            syscall,
            launcher,
            cgroups,
            subsystems: SubsystemRegistry::default(),
            networks,
        }
    }

    /// The on-disk layout.
    #[must_use]
    pub const fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    /// The network registry.
    #[must_use]
    pub const fn networks(&self) -> &NetworkRegistry {
        &self.networks
    }

    /// The container record store.
    #[must_use]
    pub const fn store(&self) -> &ContainerStore {
        &self.store
    }

    /// Creates and starts a container.
    ///
    /// Every option is validated before anything on the host changes.
    /// With `tty` set, blocks until the container exits, tears it down,
    /// and marks its record exited.
    ///
    /// # Errors
    ///
    /// Returns a validation error, or the error of the creation step that
    /// failed after everything before it was rolled back.
    pub fn run(&self, options: &RunOptions) -> Result<RunOutcome> {
        let plan = self.plan(options)?;
        let mut tx = Transaction::new(self, plan.name.clone());
        let created = self
            .create(&plan, options, &mut tx)
            .and_then(|(mut init, record, warnings)| {
                init.send_command(&options.command)?;
                Ok((init, record, warnings))
            });
        let (init, mut record, mut warnings) = match created {
            Ok(created) => created,
            Err(e) => {
                let failures = tx.rollback();
                if !failures.is_empty() {
                    tracing::error!(container = %plan.name, %failures, "rollback left resources behind");
                }
                return Err(e);
            }
        };
        tx.commit();
        drop(plan.claim);
        tracing::info!(container = %record.name, id = %record.id, pid = record.pid, "container started");

        let mut outcome = RunOutcome {
            id: plan.id,
            name: plan.name,
            pid: record.pid,
            exit_code: None,
            warnings: Vec::new(),
        };
        if options.tty {
            let exit_code = init.wait()?;
            tracing::info!(container = %record.name, exit_code, "container exited");
            for failure in self.teardown(&mut record).iter() {
                warnings.push(format!("{}: {}", failure.step, failure.error));
            }
            let _ = self
                .store
                .update(&record.name, |r| r.status = ContainerStatus::Exited)?;
            outcome.exit_code = Some(exit_code);
        }
        outcome.warnings = warnings;
        Ok(outcome)
    }

    fn plan(&self, options: &RunOptions) -> Result<Plan> {
        if options.command.is_empty() {
            return Err(CellarError::MissingCommand);
        }
        if options.image.is_empty() {
            return Err(CellarError::config("an image is required"));
        }
        let id = ContainerId::generate();
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| id.as_str().to_owned());
        validate_container_name(&name)?;
        if let Some(entry) = options.env.iter().find(|e| !e.contains('=')) {
            return Err(CellarError::config(format!(
                "environment entry {entry:?} must be KEY=VALUE"
            )));
        }
        let ports = options
            .publish
            .iter()
            .map(|p| p.parse::<PortMapping>())
            .collect::<Result<Vec<_>>>()?;
        match &options.network {
            Some(network) => {
                let _ = self.networks.get(network)?;
            }
            None if !ports.is_empty() => {
                return Err(CellarError::config("publishing ports requires a network"));
            }
            None => {}
        }
        let claim = self.store.claim(&name)?;
        Ok(Plan {
            id,
            name,
            ports,
            claim,
        })
    }

    fn create(
        &self,
        plan: &Plan,
        options: &RunOptions,
        tx: &mut Transaction<'_>,
    ) -> Result<(InitProcess, ContainerRecord, Vec<String>)> {
        let mut warnings = Vec::new();

        let mounted = self.workspace().create(
            &plan.name,
            &options.image,
            options.volume.as_deref(),
        )?;
        tx.push(Undo::Workspace(mounted.volume.clone()));
        if let Some(e) = &mounted.volume_error {
            warnings.push(format!("volume not mounted: {e}"));
        }

        tx.push(Undo::Record);
        let log = if options.tty {
            None
        } else {
            Some(logs::create_log(&self.paths, &plan.name)?)
        };

        let cgroup = if options.limits.is_empty() {
            None
        } else {
            let path = container_cgroup_path(plan.id.as_str());
            tx.push(Undo::Cgroup(path.clone()));
            self.cgroup(path.clone()).set_limits(&options.limits)?;
            Some(path)
        };

        let init = self.launcher.spawn(&SpawnConfig {
            root: &mounted.root,
            log: log.as_ref(),
            env: &options.env,
            namespaces: NamespaceConfig::default(),
        })?;
        tx.push(Undo::Process(init.pid()));
        drop(log);

        let mut record = ContainerRecord::new(
            plan.id.clone(),
            &plan.name,
            &options.image,
            &options.command,
            init.raw_pid(),
        );
        record.volume = options.volume.clone().unwrap_or_default();
        record.port_mapping = plan.ports.iter().map(ToString::to_string).collect();

        if let Some(path) = cgroup {
            self.cgroup(path.clone()).apply(record.pid)?;
            record.cgroup_path = Some(path.display().to_string());
        }
        self.store.save(&record)?;

        if let Some(network) = &options.network {
            let endpoint = self
                .networks
                .connect(network, plan.id.as_str(), plan.ports.clone())?;
            tx.push(Undo::Endpoint(endpoint.clone()));
            self.networks.attach(&endpoint, record.pid)?;
            record.set_endpoint(&endpoint);
            self.store.save(&record)?;
        }

        Ok((init, record, warnings))
    }

    /// Stops a running container: `SIGTERM`, a grace period, then
    /// `SIGKILL`. The record is kept with status `stopped`.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::NotFound`] for an unknown container, or an
    /// error if the process cannot be signaled.
    pub fn stop(&self, name: &str) -> Result<ContainerRecord> {
        let record = self.store.load(name)?;
        if record.status != ContainerStatus::Running {
            tracing::info!(container = name, status = %record.status, "container not running");
            return Ok(record);
        }
        if is_alive(record.pid) {
            let pid = i32::try_from(record.pid)
                .map_err(|_| CellarError::config(format!("pid {} out of range", record.pid)))?;
            process::terminate(Pid::from_raw(pid), STOP_GRACE_PERIOD)?;
        }
        let record = self
            .store
            .update(name, |r| r.status = ContainerStatus::Stopped)?;
        tracing::info!(container = name, "container stopped");
        Ok(record)
    }

    /// Tears a container down and deletes its record.
    ///
    /// The record is kept if any teardown step fails, so removal can be
    /// retried.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Config`] for a running container, or
    /// [`CellarError::Partial`] listing failed teardown steps.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut record = self.store.load(name)?;
        let _ = record.refresh_status();
        if record.status == ContainerStatus::Running {
            return Err(CellarError::config(format!(
                "container {name} is running; stop it first"
            )));
        }
        self.teardown(&mut record).into_result("container removal")?;
        self.store.remove(name)?;
        tracing::info!(container = name, "container removed");
        Ok(())
    }

    /// Every container record, with statuses refreshed.
    ///
    /// # Errors
    ///
    /// Returns an error if the containers directory cannot be listed.
    pub fn list(&self) -> Result<Vec<ContainerRecord>> {
        self.store.list()
    }

    /// Output captured from a detached container.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::NotFound`] for an unknown container, or an
    /// error if the log cannot be read.
    pub fn logs(&self, name: &str) -> Result<String> {
        let _ = self.store.load(name)?;
        logs::read_logs(&self.paths, name)
    }

    /// Releases the network endpoint, cgroup, and workspace of a
    /// container whose process is gone. Every step is attempted.
    ///
    /// Each released resource is cleared from `record` and the stored
    /// record right away, so a repeated teardown never releases it again.
    pub fn teardown(&self, record: &mut ContainerRecord) -> StepErrors {
        let mut errors = StepErrors::new();
        match record.endpoint() {
            Ok(Some(endpoint)) => {
                if errors
                    .record("release endpoint", self.networks.release(&endpoint))
                    .is_some()
                {
                    record.clear_endpoint();
                    self.forget(record, &mut errors, ContainerRecord::clear_endpoint);
                }
            }
            Ok(None) => {}
            Err(e) => errors.push("release endpoint", e),
        }
        if let Some(path) = &record.cgroup_path {
            let destroyed = self.cgroup(PathBuf::from(path)).destroy();
            if errors.record("destroy cgroup", destroyed).is_some() {
                record.cgroup_path = None;
                self.forget(record, &mut errors, |r| r.cgroup_path = None);
            }
        }
        let volume = record.volume_mapping();
        let _ = errors.record(
            "teardown workspace",
            self.workspace().teardown(&record.name, volume.as_ref()),
        );
        for failure in errors.iter() {
            tracing::error!(container = %record.name, step = %failure.step, error = %failure.error, "teardown step failed");
        }
        errors
    }

    /// Applies `clear` to the stored record, if there is one.
    fn forget<F>(&self, record: &ContainerRecord, errors: &mut StepErrors, clear: F)
    where
        F: FnOnce(&mut ContainerRecord),
    {
        if !self.store.exists(&record.name) {
            return;
        }
        let _ = errors.record("update record", self.store.update(&record.name, clear));
    }

    fn workspace(&self) -> Workspace<'_> {
        Workspace::new(&self.paths, self.syscall.as_ref())
    }

    fn cgroup(&self, path: PathBuf) -> CgroupManager<'_> {
        CgroupManager::new(path, &self.cgroups, &self.subsystems)
    }
}
