//! Recording stub collaborators and fixtures for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use twin_repl::config::TwinConfig;
use twin_repl::virsh::definition_name;
use twin_repl::{
    Database, DomainHandle, Drivers, Hypervisor, RemoteChannel, ReplicationOrchestrator, Result,
    RunState, Snapshotter, TwinError,
};

/// In-memory hypervisor recording every call.
#[derive(Default)]
pub struct StubHypervisor {
    pub states: Mutex<HashMap<String, RunState>>,
    pub calls: Mutex<Vec<String>>,
    pub definitions: Mutex<Vec<String>>,
    /// Domains that ignore graceful shutdown.
    pub ignores_shutdown: Mutex<HashSet<String>>,
    /// Domains that survive destroy.
    pub survives_destroy: Mutex<HashSet<String>>,
    /// Refuse to start any domain.
    pub start_fails: bool,
    /// Refuse to create transient domains.
    pub transient_fails: bool,
    /// Written when a transient domain boots, as a guest would.
    pub ack_marker: Option<PathBuf>,
    /// Files whose existence is recorded when a transient domain boots.
    pub observed_at_boot: Mutex<Vec<(PathBuf, bool)>>,
    /// Paths to check at boot time.
    pub observe: Vec<PathBuf>,
    /// Directory replaced by a plain file when a transient domain boots.
    pub clobber_at_boot: Option<PathBuf>,
}

impl StubHypervisor {
    pub fn with_domains(names: &[&str]) -> Self {
        let stub = Self::default();
        {
            let mut states = stub.states.lock().unwrap();
            for name in names {
                states.insert(name.to_string(), RunState::Running);
            }
        }
        stub
    }

    pub fn set_state(&self, name: &str, state: RunState) {
        self.states.lock().unwrap().insert(name.to_string(), state);
    }

    pub fn state(&self, name: &str) -> Option<RunState> {
        self.states.lock().unwrap().get(name).copied()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, call: &str) -> bool {
        self.calls().iter().any(|c| c == call)
    }

    pub fn definitions(&self) -> Vec<String> {
        self.definitions.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Hypervisor for StubHypervisor {
    async fn lookup(&self, name: &str) -> Result<Option<DomainHandle>> {
        self.record(format!("lookup {}", name));
        let known = self.states.lock().unwrap().contains_key(name);
        Ok(known.then(|| DomainHandle::new(name)))
    }

    async fn start(&self, domain: &DomainHandle) -> Result<()> {
        self.record(format!("start {}", domain));
        if self.start_fails {
            return Err(TwinError::Hypervisor {
                msg: "cannot allocate memory".to_string(),
            });
        }
        self.set_state(domain.name(), RunState::Running);
        Ok(())
    }

    async fn shutdown(&self, domain: &DomainHandle) -> Result<()> {
        self.record(format!("shutdown {}", domain));
        if !self.ignores_shutdown.lock().unwrap().contains(domain.name()) {
            self.set_state(domain.name(), RunState::Stopped);
        }
        Ok(())
    }

    async fn destroy(&self, domain: &DomainHandle) -> Result<()> {
        self.record(format!("destroy {}", domain));
        if !self.survives_destroy.lock().unwrap().contains(domain.name()) {
            self.set_state(domain.name(), RunState::Stopped);
        }
        Ok(())
    }

    async fn run_state(&self, domain: &DomainHandle) -> Result<RunState> {
        Ok(self.state(domain.name()).unwrap_or(RunState::Stopped))
    }

    async fn create_transient(&self, definition: &str) -> Result<DomainHandle> {
        let name = definition_name(definition).unwrap_or("transient").to_string();
        self.record(format!("create_transient {}", name));
        self.definitions.lock().unwrap().push(definition.to_string());
        {
            let mut observed = self.observed_at_boot.lock().unwrap();
            for path in &self.observe {
                observed.push((path.clone(), path.exists()));
            }
        }
        if self.transient_fails {
            return Err(TwinError::Hypervisor {
                msg: "unsupported configuration".to_string(),
            });
        }
        self.set_state(&name, RunState::Running);
        if let Some(ref dir) = self.clobber_at_boot {
            std::fs::remove_dir_all(dir).unwrap();
            std::fs::write(dir, b"").unwrap();
        }
        if let Some(ref marker) = self.ack_marker {
            std::fs::write(marker, b"").unwrap();
        }
        Ok(DomainHandle::new(name))
    }
}

/// Database recording lock calls.
#[derive(Default)]
pub struct StubDatabase {
    pub calls: Arc<Mutex<Vec<String>>>,
    pub fail_lock: bool,
}

#[async_trait]
impl Database for StubDatabase {
    async fn acquire_read_lock(&self) -> Result<()> {
        self.calls.lock().unwrap().push("lock".to_string());
        if self.fail_lock {
            return Err(TwinError::Database {
                msg: "access denied".to_string(),
            });
        }
        Ok(())
    }

    async fn release_lock(&self) -> Result<()> {
        self.calls.lock().unwrap().push("unlock".to_string());
        Ok(())
    }
}

/// Snapshotter writing a fixed payload, sharing a call log with the database.
pub struct StubSnapshotter {
    pub dir: PathBuf,
    pub payload: Vec<u8>,
    pub fail: bool,
    pub log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Snapshotter for StubSnapshotter {
    async fn create_snapshot(&self, domain: &str) -> Result<PathBuf> {
        self.log.lock().unwrap().push("snapshot".to_string());
        if self.fail {
            return Err(TwinError::Snapshot {
                domain: domain.to_string(),
                msg: "no space left on device".to_string(),
            });
        }
        let path = self.dir.join(format!("{}-snapshot.raw", domain));
        std::fs::write(&path, &self.payload)?;
        Ok(path)
    }
}

/// Remote host simulated by a local directory tree.
#[derive(Default)]
pub struct StubRemote {
    pub calls: Mutex<Vec<String>>,
    /// Write only the first half of the payload, then fail.
    pub partial_push: bool,
}

impl StubRemote {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteChannel for StubRemote {
    async fn exec(&self, argv: &[&str]) -> Result<()> {
        self.calls.lock().unwrap().push(argv.join(" "));
        let path = Path::new(argv[argv.len() - 1]);
        match argv[0] {
            "rm" => match std::fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
            "mkdir" => Ok(std::fs::create_dir_all(path)?),
            "touch" => {
                std::fs::write(path, b"")?;
                Ok(())
            }
            other => Err(TwinError::Remote {
                msg: format!("unexpected command {}", other),
            }),
        }
    }

    async fn push(&self, local: &Path, remote_dir: &Path) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("push {}", local.display()));
        let payload = std::fs::read(local)?;
        let target = remote_dir.join("hda.raw");
        if self.partial_push {
            std::fs::write(&target, &payload[..payload.len() / 2])?;
            return Err(TwinError::Remote {
                msg: "rsync: connection unexpectedly closed".to_string(),
            });
        }
        std::fs::write(&target, &payload)?;
        Ok(())
    }
}

/// Directory layout for one test host pair.
pub struct Fixture {
    pub tmp: TempDir,
    pub config: TwinConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let mut config = TwinConfig {
            wait_time_secs: 1,
            poll_interval_ms: 10,
            work_dir: root.join("work"),
            mount_point: root.join("images"),
            template_dir: root.join("templates"),
            ..TwinConfig::default()
        };
        config.remote.host = "standby.test".to_string();
        config.remote.work_dir = root.join("remote");
        for dir in [&config.work_dir, &config.mount_point, &config.template_dir, &config.remote.work_dir] {
            std::fs::create_dir_all(dir).unwrap();
        }
        Self { tmp, config }
    }

    pub fn root(&self) -> &Path {
        self.tmp.path()
    }

    pub fn local_incoming(&self, domain: &str) -> PathBuf {
        self.config.work_dir.join(domain).join("incoming")
    }

    pub fn remote_incoming(&self, domain: &str) -> PathBuf {
        self.config.remote.work_dir.join(domain).join("incoming")
    }

    /// Lay out a received image, its completion marker, a production image and a template.
    pub fn stage_receive(&self, domain: &str) {
        let incoming = self.local_incoming(domain);
        std::fs::create_dir_all(&incoming).unwrap();
        std::fs::write(incoming.join("hda.raw"), b"replica").unwrap();
        std::fs::write(incoming.join("complete.txt"), b"").unwrap();

        let production = self.config.production_image(domain);
        std::fs::create_dir_all(production.parent().unwrap()).unwrap();
        std::fs::write(&production, b"production").unwrap();

        std::fs::write(
            self.config.template_path(domain),
            format!(
                "<domain type='kvm'>\n  <name>{}-test</name>\n  <disk><source file='{{{{disk}}}}'/></disk>\n</domain>\n",
                domain
            ),
        )
        .unwrap();
    }

    pub fn production_contents(&self, domain: &str) -> Vec<u8> {
        std::fs::read(self.config.production_image(domain)).unwrap()
    }

    pub fn orchestrator(
        &self,
        hypervisor: Arc<StubHypervisor>,
        database: Arc<StubDatabase>,
        snapshotter: Arc<StubSnapshotter>,
        remote: Arc<StubRemote>,
    ) -> ReplicationOrchestrator {
        ReplicationOrchestrator::new(
            Arc::new(self.config.clone()),
            Drivers {
                hypervisor,
                database,
                snapshotter,
                remote,
            },
        )
    }

    pub fn snapshotter(&self, log: Arc<Mutex<Vec<String>>>) -> StubSnapshotter {
        StubSnapshotter {
            dir: self.root().to_path_buf(),
            payload: vec![0xAB; 4096],
            fail: false,
            log,
        }
    }
}
