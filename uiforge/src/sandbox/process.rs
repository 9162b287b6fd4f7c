//! Credential-less subprocess isolate
//!
//! Runs generated script in a separate interpreter process with a cleared
//! environment, optionally jailed by bubblewrap (`--unshare-all`, so no
//! network). The bridge runner evaluates the script in a fresh vm context
//! whose only globals are `query`, `action`, console and timers;
//! line-delimited JSON over stdin/stdout is the only message channel and
//! stderr is logged.

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::bridge::{Outlet, BRIDGE_SCRIPT};
use super::isolate::{IsolateLauncher, IsolatedContext, SandboxProgram};
use super::messages::{ContextId, Envelope, SandboxMessage};
use crate::config::SandboxSettings;
use crate::error::{ForgeError, ForgeResult};

/// Env var to run the interpreter without bubblewrap (when user namespaces
/// are unavailable). Less secure.
pub const UIFORGE_NO_SANDBOX: &str = "UIFORGE_NO_SANDBOX";

const PROGRAM_FILE: &str = "program.js";
const JAIL_DIR: &str = "/sandbox";
const JAIL_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

pub fn no_sandbox_requested() -> bool {
    std::env::var(UIFORGE_NO_SANDBOX)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v == "yes")
        .unwrap_or(false)
}

fn is_bwrap_available() -> bool {
    std::process::Command::new("which")
        .arg("bwrap")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Entry module for the interpreter: the fragment as one JSON literal, then
/// the bridge runner. The generated script is never spliced in as code; the
/// runner evaluates it inside its own vm context.
pub fn render_program(program: &SandboxProgram) -> String {
    let fragment = serde_json::json!({
        "markup": program.markup,
        "styles": program.styles,
        "script": program.script,
    });
    format!(
        "'use strict';\nconst UIFORGE_PROGRAM = {};\n{}",
        fragment, BRIDGE_SCRIPT
    )
}

#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    settings: SandboxSettings,
}

impl ProcessLauncher {
    pub fn new(settings: SandboxSettings) -> Self {
        Self { settings }
    }

    fn jailed(&self) -> bool {
        self.settings.use_bubblewrap && !no_sandbox_requested()
    }

    fn build_command(&self, work_dir: &Path, jailed: bool) -> Command {
        let mut cmd = if jailed {
            let mut cmd = Command::new("bwrap");
            cmd.arg("--unshare-all");
            cmd.arg("--die-with-parent");
            cmd.arg("--new-session");
            for dir in ["/usr", "/lib", "/lib64", "/bin", "/etc/alternatives"] {
                if Path::new(dir).exists() {
                    cmd.arg("--ro-bind").arg(dir).arg(dir);
                }
            }
            cmd.arg("--proc").arg("/proc");
            cmd.arg("--dev").arg("/dev");
            cmd.arg("--tmpfs").arg("/tmp");
            cmd.arg("--ro-bind").arg(work_dir).arg(JAIL_DIR);
            cmd.arg("--chdir").arg(JAIL_DIR);
            cmd.arg(&self.settings.interpreter);
            cmd.args(&self.settings.args);
            cmd.arg(format!("{}/{}", JAIL_DIR, PROGRAM_FILE));
            cmd
        } else {
            let mut cmd = Command::new(&self.settings.interpreter);
            cmd.args(&self.settings.args);
            cmd.arg(work_dir.join(PROGRAM_FILE));
            cmd.current_dir(work_dir);
            cmd
        };

        // Host credentials and tokens never reach the guest.
        cmd.env_clear();
        cmd.env("PATH", JAIL_PATH);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl IsolateLauncher for ProcessLauncher {
    async fn launch(
        &self,
        program: SandboxProgram,
        outbox: mpsc::UnboundedSender<Envelope>,
    ) -> ForgeResult<Arc<dyn IsolatedContext>> {
        let jailed = self.jailed();
        if self.settings.use_bubblewrap && !jailed {
            log::warn!("{} is set; running the sandbox interpreter unjailed", UIFORGE_NO_SANDBOX);
        }
        if jailed && !is_bwrap_available() {
            return Err(ForgeError::Sandbox(format!(
                "bubblewrap not found. Install it, or set {}=1 to run unjailed",
                UIFORGE_NO_SANDBOX
            )));
        }

        let work_dir = tempfile::tempdir()
            .map_err(|e| ForgeError::Sandbox(format!("Failed to create temp dir: {}", e)))?;
        tokio::fs::write(work_dir.path().join(PROGRAM_FILE), render_program(&program))
            .await
            .map_err(|e| ForgeError::Sandbox(format!("Failed to write program: {}", e)))?;

        let mut child = self
            .build_command(work_dir.path(), jailed)
            .spawn()
            .map_err(|e| {
                ForgeError::Sandbox(format!(
                    "Failed to spawn {}: {}",
                    if jailed { "bwrap" } else { self.settings.interpreter.as_str() },
                    e
                ))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ForgeError::Sandbox("Failed to capture stdin".to_string()))?;
        let mut stdout = BufReader::new(
            child
                .stdout
                .take()
                .ok_or_else(|| ForgeError::Sandbox("Failed to capture stdout".to_string()))?,
        );
        let mut stderr = BufReader::new(
            child
                .stderr
                .take()
                .ok_or_else(|| ForgeError::Sandbox("Failed to capture stderr".to_string()))?,
        );

        let id = ContextId::new();
        let outlet = Outlet::new(id, outbox);
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        // Stdout reader: every JSON object line is an outbound message
        let reader = tokio::spawn(async move {
            let mut line = String::new();
            loop {
                line.clear();
                match stdout.read_line(&mut line).await {
                    Ok(0) => {
                        log::debug!("Sandbox {} stdout closed", id);
                        break;
                    }
                    Ok(_) => match serde_json::from_str::<Value>(line.trim()) {
                        Ok(payload @ Value::Object(_)) => {
                            if !outlet.post_raw(payload) {
                                break;
                            }
                        }
                        _ => log::debug!("Sandbox {} wrote non-message line: {}", id, line.trim()),
                    },
                    Err(e) => {
                        log::error!("Error reading sandbox {} stdout: {}", id, e);
                        break;
                    }
                }
            }
        });

        // Stderr reader: guest console output
        let logger = tokio::spawn(async move {
            let mut line = String::new();
            loop {
                line.clear();
                match stderr.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => log::info!("[sandbox {}] {}", id, line.trim_end()),
                }
            }
        });

        // Stdin writer: inbound messages, one per line
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = stdin.write_all(msg.as_bytes()).await {
                    log::error!("Failed to write to sandbox {} stdin: {}", id, e);
                    break;
                }
                if let Err(e) = stdin.write_all(b"\n").await {
                    log::error!("Failed to write newline to sandbox {} stdin: {}", id, e);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    log::error!("Failed to flush sandbox {} stdin: {}", id, e);
                    break;
                }
            }
        });

        log::info!(
            "Launched {} isolate {} ({})",
            if jailed { "bubblewrap" } else { "process" },
            id,
            self.settings.interpreter
        );

        Ok(Arc::new(ProcessContext {
            id,
            tx,
            child: Mutex::new(Some(child)),
            tasks: Mutex::new(vec![reader, logger, writer]),
            _work_dir: work_dir,
        }))
    }
}

struct ProcessContext {
    id: ContextId,
    tx: mpsc::UnboundedSender<String>,
    child: Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    _work_dir: TempDir,
}

impl IsolatedContext for ProcessContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn post(&self, message: SandboxMessage) -> bool {
        match serde_json::to_string(&message) {
            Ok(line) => self.tx.send(line).is_ok(),
            Err(e) => {
                log::error!("Failed to serialize message for sandbox {}: {}", self.id, e);
                false
            }
        }
    }

    fn terminate(&self) {
        let child = self
            .child
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                log::debug!("Sandbox {} already exited: {}", self.id, e);
            }
            log::debug!("Terminated process isolate {}", self.id);
        }
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }
}

impl Drop for ProcessContext {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::messages::ApiResponse;
    use serde_json::json;

    fn unjailed() -> ProcessLauncher {
        ProcessLauncher::new(SandboxSettings {
            use_bubblewrap: false,
            ..SandboxSettings::default()
        })
    }

    #[test]
    fn generated_script_is_embedded_as_data() {
        let program = SandboxProgram {
            markup: "<div id=\"app\"></div>".to_string(),
            styles: String::new(),
            script: "query('listTasks');\nrequire('fs');".to_string(),
        };
        let rendered = render_program(&program);
        assert!(rendered.starts_with("'use strict';\nconst UIFORGE_PROGRAM = {"));

        let literal = rendered
            .lines()
            .nth(1)
            .and_then(|line| line.strip_prefix("const UIFORGE_PROGRAM = "))
            .and_then(|line| line.strip_suffix(';'))
            .unwrap();
        let fragment: Value = serde_json::from_str(literal).unwrap();
        assert_eq!(fragment["script"], "query('listTasks');\nrequire('fs');");
        assert_eq!(fragment["markup"], "<div id=\"app\"></div>");

        // the raw script text only occurs inside the JSON literal
        assert!(!rendered.contains("require('fs');\n"));
        assert!(rendered.contains("vm.runInContext(program.script, context"));
    }

    #[test]
    fn unjailed_command_has_clean_environment() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = unjailed().build_command(dir.path(), false);
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "node");
        let args: Vec<_> = std_cmd.get_args().collect();
        assert_eq!(args, vec![dir.path().join(PROGRAM_FILE).as_os_str()]);
        let envs: Vec<_> = std_cmd.get_envs().collect();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].0, "PATH");
    }

    #[test]
    fn jailed_command_unshares_everything() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = ProcessLauncher::default().build_command(dir.path(), true);
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "bwrap");
        let args: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "--unshare-all");
        assert!(!args.iter().any(|a| a == "--share-net"));
        assert_eq!(args.last().map(String::as_str), Some("/sandbox/program.js"));
    }

    #[tokio::test]
    #[ignore = "requires node on PATH"]
    async fn node_guest_round_trip() {
        let program = SandboxProgram {
            script: "query('listTasks', { status: 'todo' }).then((rows) => { throw new Error('got ' + rows.length); });"
                .to_string(),
            ..SandboxProgram::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let context = unjailed().launch(program, tx).await.unwrap();

        let request = rx.recv().await.unwrap();
        assert_eq!(request.source, context.id());
        assert_eq!(request.payload["ref"], "listTasks");
        assert_eq!(request.payload["params"], json!({"status": "todo"}));

        let id = request.payload["id"].as_str().unwrap().to_string();
        assert!(context.post(SandboxMessage::ApiResponse(ApiResponse::success(id, json!([1, 2])))));

        let report = rx.recv().await.unwrap();
        assert_eq!(report.payload["kind"], "sandbox-error");
        assert_eq!(report.payload["message"], "got 2");
        context.terminate();
    }

    #[tokio::test]
    #[ignore = "requires node on PATH"]
    async fn node_guest_has_no_ambient_host_access() {
        let program = SandboxProgram {
            script: "throw new Error([typeof require, typeof process, typeof fetch, typeof module, typeof query].join(','));"
                .to_string(),
            ..SandboxProgram::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let context = unjailed().launch(program, tx).await.unwrap();

        let report = rx.recv().await.unwrap();
        assert_eq!(report.payload["kind"], "sandbox-error");
        assert_eq!(
            report.payload["message"],
            "undefined,undefined,undefined,undefined,function"
        );
        assert_eq!(report.payload["line"], 1);
        context.terminate();
    }
}
