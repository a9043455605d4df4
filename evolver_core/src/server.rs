use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Process control for one target server instance.
///
/// The fuzzer never reimplements the target's lifecycle; it only drives it
/// through this capability. Implementations are shared between the server
/// pool and whichever worker currently holds the reservation, hence `&self`.
pub trait Server: Send + Sync + fmt::Debug {
    fn id(&self) -> u32;

    /// Where the protocol engine connects, as `host:port`.
    fn endpoint(&self) -> &str;

    /// Directory the target writes its own execution traces into.
    fn traces_folder(&self) -> &Path;

    /// The file one run of this server leaves its trace output in.
    fn trace_output(&self) -> PathBuf {
        self.traces_folder().join(self.id().to_string())
    }

    /// Starts the target, or confirms it is already running.
    fn start(&self) -> anyhow::Result<()>;

    /// Kills whatever is running and starts a fresh process.
    fn restart(&self) -> anyhow::Result<()>;

    /// Kills the process if it is still running and reaps it.
    fn stop(&self) -> anyhow::Result<()>;

    /// `true` once the process has terminated (or was never started).
    fn exited(&self) -> bool;
}

/// Settings for a [`CommandServer`].
///
/// Arguments may contain `{port}`, `{id}` and `{traces}` placeholders, which
/// expand to the server's port, numeric id and trace-output file.
#[derive(Debug, Clone)]
pub struct CommandServerConfig {
    pub command: Vec<String>,
    pub host: String,
    pub port: u16,
    pub traces_folder: PathBuf,
    pub working_dir: Option<PathBuf>,
}

/// A [`Server`] backed by a spawned child process.
pub struct CommandServer {
    id: u32,
    endpoint: String,
    config: CommandServerConfig,
    child: Mutex<Option<Child>>,
}

impl CommandServer {
    pub fn new(id: u32, config: CommandServerConfig) -> Self {
        Self {
            id,
            endpoint: format!("{}:{}", config.host, config.port),
            config,
            child: Mutex::new(None),
        }
    }

    fn expand_argument(&self, template: &str) -> String {
        template
            .replace("{port}", &self.config.port.to_string())
            .replace("{id}", &self.id.to_string())
            .replace("{traces}", &self.trace_output().to_string_lossy())
    }

    fn spawn(&self) -> anyhow::Result<Child> {
        let program = self
            .config
            .command
            .first()
            .ok_or_else(|| anyhow::anyhow!("Server {} has an empty command", self.id))?;
        let mut cmd = Command::new(self.expand_argument(program));
        for arg in &self.config.command[1..] {
            cmd.arg(self.expand_argument(arg));
        }
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!(
                "Failed to spawn server {} command '{:?}': {}",
                self.id,
                self.config.command,
                e
            )
        })?;
        debug!(server = self.id, pid = child.id(), "spawned target server");
        Ok(child)
    }

    fn kill_and_reap(id: u32, child: &mut Child) -> anyhow::Result<()> {
        if child.try_wait()?.is_none() {
            if let Err(e) = child.kill() {
                warn!(server = id, error = %e, "failed to kill target server");
            }
        }
        child.wait()?;
        Ok(())
    }
}

impl fmt::Debug for CommandServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandServer")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl Server for CommandServer {
    fn id(&self) -> u32 {
        self.id
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn traces_folder(&self) -> &Path {
        &self.config.traces_folder
    }

    fn start(&self) -> anyhow::Result<()> {
        let mut guard = self.child.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(child) = guard.as_mut() {
            if child.try_wait()?.is_none() {
                return Ok(());
            }
        }
        *guard = Some(self.spawn()?);
        Ok(())
    }

    fn restart(&self) -> anyhow::Result<()> {
        let mut guard = self.child.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(mut child) = guard.take() {
            Self::kill_and_reap(self.id, &mut child)?;
        }
        *guard = Some(self.spawn()?);
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        let mut guard = self.child.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(mut child) = guard.take() {
            Self::kill_and_reap(self.id, &mut child)?;
        }
        Ok(())
    }

    fn exited(&self) -> bool {
        let mut guard = self.child.lock().unwrap_or_else(|p| p.into_inner());
        match guard.as_mut() {
            None => true,
            Some(child) => match child.try_wait() {
                Ok(Some(_)) => true,
                Ok(None) => false,
                Err(e) => {
                    warn!(server = self.id, error = %e, "error polling target server");
                    true
                }
            },
        }
    }
}

impl Drop for CommandServer {
    fn drop(&mut self) {
        let child = self
            .child
            .get_mut()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(mut child) = child {
            let _ = Self::kill_and_reap(self.id, &mut child);
        }
    }
}


#[cfg(all(test, unix))]
mod command_server_tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn config(command: &[&str], traces_folder: &Path) -> CommandServerConfig {
        CommandServerConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
            host: "127.0.0.1".to_string(),
            port: 4433,
            traces_folder: traces_folder.to_path_buf(),
            working_dir: None,
        }
    }

    fn wait_for_exit(server: &CommandServer) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if server.exited() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn never_started_server_counts_as_exited() {
        let dir = tempdir().unwrap();
        let server = CommandServer::new(0, config(&["true"], dir.path()));
        assert!(server.exited());
        assert_eq!(server.endpoint(), "127.0.0.1:4433");
        assert_eq!(server.trace_output(), dir.path().join("0"));
    }

    #[test]
    fn short_lived_process_exits_on_its_own() {
        let dir = tempdir().unwrap();
        let server = CommandServer::new(1, config(&["sh", "-c", "exit 0"], dir.path()));
        server.start().unwrap();
        assert!(wait_for_exit(&server), "process should have exited");
    }

    #[test]
    fn stop_kills_a_running_process() {
        let dir = tempdir().unwrap();
        let server = CommandServer::new(2, config(&["sleep", "30"], dir.path()));
        server.start().unwrap();
        assert!(!server.exited());
        server.start().unwrap();
        server.stop().unwrap();
        assert!(server.exited());
    }

    #[test]
    fn restart_replaces_the_process() {
        let dir = tempdir().unwrap();
        let server = CommandServer::new(3, config(&["sleep", "30"], dir.path()));
        server.start().unwrap();
        server.restart().unwrap();
        assert!(!server.exited());
        server.stop().unwrap();
    }

    #[test]
    fn placeholders_expand_into_the_command_line() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("args");
        let script = format!("echo {{port}} {{id}} {{traces}} > {}", marker.display());
        let server = CommandServer::new(7, config(&["sh", "-c", &script], dir.path()));
        server.start().unwrap();
        assert!(wait_for_exit(&server));
        let written = std::fs::read_to_string(&marker).unwrap();
        let expected = format!("4433 7 {}\n", dir.path().join("7").display());
        assert_eq!(written, expected);
    }

    #[test]
    fn empty_command_is_rejected() {
        let dir = tempdir().unwrap();
        let server = CommandServer::new(4, config(&[], dir.path()));
        assert!(server.start().is_err());
    }
}
