use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use nix::{errno::Errno, sys::signal::{Signal, kill}, unistd::Pid};
use tokio::process::{Child, Command};

use crate::{constants::DIAGNOSTICS_TAIL, error::Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        ExitInfo { code: status.code(), signal: status.signal() }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Spawn {
    pub program: String,
    pub args: Vec<String>,
    /// Receives stdout and stderr.
    pub log: Option<PathBuf>,
    /// Written by the child itself; read back as the last resort of the kill ladder.
    pub pid_file: Option<PathBuf>,
}

impl Spawn {
    /// Splits a full argument vector into program and arguments.
    pub fn from_argv(argv: &[String]) -> Result<Self, Error> {
        let (program, args) = argv.split_first().ok_or_else(|| Error::Invalid("empty command line".to_string()))?;
        Ok(Spawn { program: program.clone(), args: args.to_vec(), log: None, pid_file: None })
    }

    pub fn log<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.log = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn pid_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.pid_file = Some(path.as_ref().to_path_buf());
        self
    }
}

#[async_trait::async_trait]
pub trait Process: Send {
    fn id(&self) -> Option<u32>;

    /// Non-blocking exit check; once exited, keeps returning the same status.
    fn try_wait(&mut self) -> Result<Option<ExitInfo>, Error>;

    fn suspend(&mut self) -> Result<(), Error>;

    fn resume(&mut self) -> Result<(), Error>;

    /// Without `escalate` a single SIGTERM. With it the full ladder:
    /// SIGINT, SIGTERM, SIGKILL, then SIGKILL to the pid in the pid file.
    async fn terminate(&mut self, escalate: bool) -> Result<Option<ExitInfo>, Error>;

    fn diagnostics(&self) -> Option<String>;
}

#[async_trait::async_trait]
pub trait Launcher: Send + Sync {
    async fn spawn(&self, spawn: &Spawn) -> Result<Box<dyn Process>, Error>;
}

pub struct ChildProcess {
    child: Child,
    pid: Option<u32>,
    pid_file: Option<PathBuf>,
    log: Option<PathBuf>,
    grace: Duration,
    exit: Option<ExitInfo>,
}

impl ChildProcess {
    fn signal(&self, signal: Signal) -> Result<(), Error> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_for(&mut self, grace: Duration) -> Result<Option<ExitInfo>, Error> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let exit = ExitInfo::from(status?);
                self.exit = Some(exit);
                Ok(Some(exit))
            },
            Err(_) => Ok(None),
        }
    }

    fn pid_from_file(&self) -> Option<i32> {
        let text = std::fs::read_to_string(self.pid_file.as_ref()?).ok()?;
        text.trim().parse().ok()
    }
}

#[async_trait::async_trait]
impl Process for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    fn try_wait(&mut self) -> Result<Option<ExitInfo>, Error> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait()?.map(ExitInfo::from);
        }
        Ok(self.exit)
    }

    fn suspend(&mut self) -> Result<(), Error> {
        self.signal(Signal::SIGSTOP)
    }

    fn resume(&mut self) -> Result<(), Error> {
        self.signal(Signal::SIGCONT)
    }

    async fn terminate(&mut self, escalate: bool) -> Result<Option<ExitInfo>, Error> {
        if let Some(exit) = self.try_wait()? {
            return Ok(Some(exit));
        }
        if !escalate {
            self.signal(Signal::SIGTERM)?;
            return self.wait_for(self.grace).await;
        }

        // A stopped process can't handle the polite signals.
        if let Err(e) = self.signal(Signal::SIGCONT) {
            log::warn!("SIGCONT to {:?} failed: {}", self.pid, e);
        }
        for signal in [Signal::SIGINT, Signal::SIGTERM] {
            if let Err(e) = self.signal(signal) {
                log::warn!("{:?} to {:?} failed: {}", signal, self.pid, e);
            }
            if let Some(exit) = self.wait_for(self.grace).await? {
                return Ok(Some(exit));
            }
        }

        if let Err(e) = self.child.start_kill() {
            log::warn!("SIGKILL to {:?} failed: {}", self.pid, e);
        }
        if let Some(exit) = self.wait_for(self.grace).await? {
            return Ok(Some(exit));
        }

        if let Some(pid) = self.pid_from_file() {
            log::warn!("Process {:?} survived SIGKILL, killing pid {} from pid file", self.pid, pid);
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                log::warn!("SIGKILL to {} failed: {}", pid, e);
            }
        }
        self.wait_for(self.grace).await
    }

    fn diagnostics(&self) -> Option<String> {
        tail(self.log.as_ref()?, DIAGNOSTICS_TAIL)
    }
}

fn tail(path: &Path, bytes: u64) -> Option<String> {
    let mut file = File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(bytes))).ok()?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer).ok()?;
    let text = String::from_utf8_lossy(&buffer).trim().to_string();
    if text.is_empty() { None } else { Some(text) }
}

/// Spawns real OS processes.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    grace: Duration,
}

impl CommandLauncher {
    pub fn new(grace: Duration) -> Self {
        CommandLauncher { grace }
    }
}

#[async_trait::async_trait]
impl Launcher for CommandLauncher {
    async fn spawn(&self, spawn: &Spawn) -> Result<Box<dyn Process>, Error> {
        let mut command = Command::new(&spawn.program);
        command.args(&spawn.args).stdin(Stdio::null()).kill_on_drop(true);
        match &spawn.log {
            Some(path) => {
                let file = File::create(path)?;
                command.stdout(Stdio::from(file.try_clone()?)).stderr(Stdio::from(file));
            },
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            },
        }

        log::debug!("Spawning {} {}", spawn.program, spawn.args.join(" "));
        let child = command
            .spawn()
            .map_err(|e| Error::Process(format!("failed to spawn {}: {}", spawn.program, e)))?;
        let pid = child.id();
        Ok(Box::new(ChildProcess {
            child,
            pid,
            pid_file: spawn.pid_file.clone(),
            log: spawn.log.clone(),
            grace: self.grace,
            exit: None,
        }))
    }
}
