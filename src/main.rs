use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const DEFAULT_PROJECT: &str = "localai";
const DEFAULT_STACK_PAUSE_SECS: u64 = 10;
const INTERRUPT_GRACE: Duration = Duration::from_secs(5);

const HOSTS_BLOCK_OPEN: &str = "# >>> local-ai-packaged";
const HOSTS_BLOCK_CLOSE: &str = "# <<< local-ai-packaged";
const LOOPBACK_ADDRESS: &str = "127.0.0.1";

const CANONICAL_HOSTNAMES: [&str; 14] = [
    "raven.lan",
    "n8n.lan",
    "openwebui.lan",
    "studio.lan",
    "comfyui.lan",
    "whisper.lan",
    "va.lan",
    "nocodb.lan",
    "crawl4ai.lan",
    "qdrant.lan",
    "lmstudio.lan",
    "kokoro.lan",
    "traefik.lan",
    "flowise.lan",
];

const SUBREPO_URL: &str = "https://github.com/supabase/supabase.git";
const SUBREPO_DIR: &str = "supabase";
const SUBREPO_SUBTREE: &str = "docker";
const SUBREPO_REF: &str = "master";

const POOLER_SERVICE: &str = "supavisor";
const POOLER_PORT: u16 = 6543;

const CERT_FILE: &str = "local-cert.pem";
const KEY_FILE: &str = "local-key.pem";

#[derive(Parser, Debug)]
#[command(name = "orchestrator", version, about = "Local AI platform orchestrator")]
struct Cli {
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, global = true, hide = true)]
    root: Option<PathBuf>,
    #[arg(long, global = true, hide = true)]
    hosts_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Launch {
        #[arg(long, value_enum)]
        profile: Profile,
        #[arg(long, default_value = DEFAULT_PROJECT)]
        project: String,
        #[arg(long, default_value_t = false)]
        skip_certs: bool,
        #[arg(long, hide = true, default_value_t = DEFAULT_STACK_PAUSE_SECS)]
        pause_secs: u64,
    },
    PlanRemoteAccess {
        #[arg(long)]
        server_address: Option<String>,
        #[arg(long, default_value_t = false)]
        dns: bool,
        #[arg(long, default_value_t = false)]
        update_local: bool,
    },
    Status {
        #[arg(long, default_value = DEFAULT_PROJECT)]
        project: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Profile {
    GpuNvidia,
    GpuAmd,
    Cpu,
    None,
}

impl Profile {
    fn as_str(self) -> &'static str {
        match self {
            Self::GpuNvidia => "gpu-nvidia",
            Self::GpuAmd => "gpu-amd",
            Self::Cpu => "cpu",
            Self::None => "none",
        }
    }
}

fn profile_supported_on(profile: Profile, os: &str) -> bool {
    profile != Profile::GpuAmd || os == "linux"
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StackKind {
    Infra,
    Ai,
}

impl StackKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Infra => "infra",
            Self::Ai => "ai",
        }
    }
}

impl fmt::Display for StackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
enum OrchestratorError {
    #[error("usage error: {0}")]
    Usage(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("config parse error at {path}:{line}: expected a comment, a blank line, or KEY=VALUE")]
    ConfigParse { path: String, line: usize },
    #[error("certificate generation failed: {message}")]
    Certificate {
        message: String,
        details: ErrorDetails,
    },
    #[error("sub-repo fetch failed: {message}")]
    SubRepoFetch {
        message: String,
        details: ErrorDetails,
    },
    #[error("sub-repo ref not found: {message}")]
    SubRepoRefNotFound {
        message: String,
        details: ErrorDetails,
    },
    #[error("sub-stack preparation failed: {0}")]
    SubStack(String),
    #[error("hosts file corrupt: {0}")]
    HostsCorrupt(String),
    #[error("hosts file unwritable: {0}")]
    HostsUnwritable(String),
    #[error("{kind} stack launch failed: {message}")]
    Stack {
        kind: StackKind,
        message: String,
        details: ErrorDetails,
    },
    #[error("interrupted")]
    Interrupted,
    #[error("process error: {0}")]
    Process(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

fn exit_code_for(err: &OrchestratorError) -> i32 {
    match err {
        OrchestratorError::Usage(_) => 2,
        OrchestratorError::Config(_) | OrchestratorError::ConfigParse { .. } => 10,
        OrchestratorError::Certificate { .. } => 11,
        OrchestratorError::SubRepoFetch { .. }
        | OrchestratorError::SubRepoRefNotFound { .. }
        | OrchestratorError::SubStack(_) => 12,
        OrchestratorError::HostsCorrupt(_) | OrchestratorError::HostsUnwritable(_) => 13,
        OrchestratorError::Stack {
            kind: StackKind::Infra,
            ..
        } => 20,
        OrchestratorError::Stack {
            kind: StackKind::Ai, ..
        } => 21,
        OrchestratorError::Interrupted => 130,
        OrchestratorError::Process(_)
        | OrchestratorError::Io(_)
        | OrchestratorError::Json(_) => 1,
    }
}

fn error_code_for(err: &OrchestratorError) -> &'static str {
    match err {
        OrchestratorError::Usage(_) => "usage",
        OrchestratorError::Config(_) => "config",
        OrchestratorError::ConfigParse { .. } => "config_parse",
        OrchestratorError::Certificate { .. } => "certificate",
        OrchestratorError::SubRepoFetch { .. } => "subrepo_fetch",
        OrchestratorError::SubRepoRefNotFound { .. } => "subrepo_ref_not_found",
        OrchestratorError::SubStack(_) => "substack",
        OrchestratorError::HostsCorrupt(_) => "hosts_corrupt",
        OrchestratorError::HostsUnwritable(_) => "hosts_unwritable",
        OrchestratorError::Stack {
            kind: StackKind::Infra,
            ..
        } => "infra_stack_failed",
        OrchestratorError::Stack {
            kind: StackKind::Ai, ..
        } => "ai_stack_failed",
        OrchestratorError::Interrupted => "interrupted",
        OrchestratorError::Process(_) => "process",
        OrchestratorError::Io(_) => "io",
        OrchestratorError::Json(_) => "json",
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct ErrorDetails {
    error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw_stderr: Option<String>,
}

impl ErrorDetails {
    fn bare(error_code: &str) -> Self {
        Self {
            error_code: error_code.to_string(),
            hint: None,
            command: None,
            raw_stderr: None,
        }
    }
}

fn error_details_for(err: &OrchestratorError) -> ErrorDetails {
    match err {
        OrchestratorError::Certificate { details, .. }
        | OrchestratorError::SubRepoFetch { details, .. }
        | OrchestratorError::SubRepoRefNotFound { details, .. }
        | OrchestratorError::Stack { details, .. } => details.clone(),
        OrchestratorError::HostsCorrupt(_) => ErrorDetails {
            error_code: "hosts_corrupt".to_string(),
            hint: Some(
                "Remove the stray sentinel lines from the hosts file and re-run.".to_string(),
            ),
            command: None,
            raw_stderr: None,
        },
        OrchestratorError::HostsUnwritable(_) => ErrorDetails {
            error_code: "hosts_unwritable".to_string(),
            hint: Some(
                "Re-run with elevated privileges (e.g. sudo) or apply the sentinel block manually."
                    .to_string(),
            ),
            command: None,
            raw_stderr: None,
        },
        _ => ErrorDetails::bare(error_code_for(err)),
    }
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ErrorDetails>,
}

#[derive(Debug, Clone)]
struct Context {
    root: PathBuf,
    hosts_file: PathBuf,
    json: bool,
    interrupted: Arc<AtomicBool>,
}

impl Context {
    fn env_path(&self) -> PathBuf {
        self.root.join(".env")
    }

    fn certs_dir(&self) -> PathBuf {
        self.root.join("certs")
    }

    fn subrepo_dir(&self) -> PathBuf {
        self.root.join(SUBREPO_DIR)
    }

    fn infra_compose_path(&self) -> PathBuf {
        self.subrepo_dir()
            .join(SUBREPO_SUBTREE)
            .join("docker-compose.yml")
    }
}

fn default_hosts_path() -> PathBuf {
    if cfg!(windows) {
        let system_root = env::var("SystemRoot").unwrap_or_else(|_| "C:\\Windows".to_string());
        PathBuf::from(format!(
            "{system_root}\\System32\\drivers\\etc\\hosts"
        ))
    } else {
        PathBuf::from("/etc/hosts")
    }
}

fn check_interrupted(ctx: &Context) -> Result<(), OrchestratorError> {
    if ctx.interrupted.load(Ordering::Relaxed) {
        return Err(OrchestratorError::Interrupted);
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct CommandOutput {
    status_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

trait CommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        env_overrides: &BTreeMap<String, String>,
        capture: bool,
    ) -> Result<CommandOutput, io::Error>;
}

struct HostCommandRunner {
    interrupted: Arc<AtomicBool>,
    interrupt_signal: Arc<AtomicUsize>,
}

impl HostCommandRunner {
    fn new(interrupted: Arc<AtomicBool>, interrupt_signal: Arc<AtomicUsize>) -> Self {
        Self {
            interrupted,
            interrupt_signal,
        }
    }

    fn wait_with_interrupt(&self, child: &mut Child) -> io::Result<ExitStatus> {
        let mut signaled = false;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if self.interrupted.load(Ordering::Relaxed) && !signaled {
                signaled = true;
                #[cfg(unix)]
                {
                    // The child gets the same signal the orchestrator received.
                    let mut signal = self.interrupt_signal.load(Ordering::Relaxed) as libc::c_int;
                    if signal == 0 {
                        signal = libc::SIGINT;
                    }
                    unsafe {
                        libc::kill(child.id() as libc::pid_t, signal);
                    }
                }
                #[cfg(not(unix))]
                {
                    let _ = child.kill();
                }
                let deadline = Instant::now() + INTERRUPT_GRACE;
                while Instant::now() < deadline {
                    if let Some(status) = child.try_wait()? {
                        return Ok(status);
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                let _ = child.kill();
                return child.wait();
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

fn status_code_of(status: &ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or(if status.success() { 0 } else { 1 })
}

impl CommandRunner for HostCommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        env_overrides: &BTreeMap<String, String>,
        capture: bool,
    ) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(cwd);
        for (key, value) in env_overrides {
            cmd.env(key, value);
        }
        if capture {
            let output = cmd.output()?;
            Ok(CommandOutput {
                status_code: status_code_of(&output.status),
                stdout: output.stdout,
                stderr: output.stderr,
            })
        } else {
            let mut child = cmd.spawn()?;
            let status = self.wait_with_interrupt(&mut child)?;
            Ok(CommandOutput {
                status_code: status_code_of(&status),
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }
}

#[derive(Debug)]
struct CommandFailure {
    command: String,
    status_code: Option<i32>,
    stderr: String,
    hint: Option<String>,
}

impl CommandFailure {
    fn into_details(self, error_code: &str) -> ErrorDetails {
        ErrorDetails {
            error_code: error_code.to_string(),
            hint: self.hint,
            command: Some(self.command),
            raw_stderr: if self.stderr.is_empty() {
                None
            } else {
                Some(self.stderr)
            },
        }
    }
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => {
                write!(
                    f,
                    "command failed with status {} while running `{}`",
                    code, self.command
                )?;
                if !self.stderr.is_empty() {
                    write!(f, ": {}", self.stderr)?;
                }
            }
            None => write!(
                f,
                "failed to run command `{}`: {}",
                self.command, self.stderr
            )?,
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHint: {hint}")?;
        }
        Ok(())
    }
}

fn render_command(program: &str, args: &[String]) -> String {
    fn shell_quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_string());
    parts.extend(args.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

fn spawn_hint(program: &str) -> Option<&'static str> {
    match program {
        "docker" => Some("Install Docker and ensure `docker` is on your PATH."),
        "git" => Some("Install git and ensure it is on your PATH."),
        "openssl" => Some("Install openssl and ensure it is on your PATH."),
        _ => None,
    }
}

fn stderr_tail(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    let lines: Vec<&str> = trimmed.lines().collect();
    if lines.len() <= 6 {
        return trimmed.to_string();
    }
    lines[lines.len() - 6..].join("\n")
}

fn run_command<R: CommandRunner>(
    runner: &R,
    program: &str,
    args: &[String],
    cwd: &Path,
    env_overrides: &BTreeMap<String, String>,
    capture: bool,
) -> Result<CommandOutput, CommandFailure> {
    let command = render_command(program, args);
    let output = runner
        .run(program, args, cwd, env_overrides, capture)
        .map_err(|err| {
            let hint = if err.kind() == io::ErrorKind::NotFound {
                spawn_hint(program).map(|hint| hint.to_string())
            } else {
                None
            };
            CommandFailure {
                command: command.clone(),
                status_code: None,
                stderr: err.to_string(),
                hint,
            }
        })?;
    if output.status_code != 0 {
        return Err(CommandFailure {
            command,
            status_code: Some(output.status_code),
            stderr: stderr_tail(&output.stderr),
            hint: None,
        });
    }
    Ok(output)
}

fn ensure_dir(path: &Path) -> Result<(), OrchestratorError> {
    if path.exists() {
        if path.is_dir() {
            return Ok(());
        }
        return Err(OrchestratorError::Config(format!(
            "path exists and is not a directory: {}",
            path.display()
        )));
    }
    fs::create_dir_all(path)?;
    Ok(())
}

fn replace_atomically(path: &Path, content: &str) -> io::Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));
    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[derive(Debug, Clone)]
enum EnvEntry {
    Comment(String),
    Blank(String),
    Assignment {
        key: String,
        prefix: String,
        value: String,
    },
}

#[derive(Debug, Clone)]
struct EnvFile {
    entries: Vec<EnvEntry>,
    ends_with_newline: bool,
}

fn parse_env_line(line: &str) -> Option<EnvEntry> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Some(EnvEntry::Blank(line.to_string()));
    }
    if trimmed.starts_with('#') {
        return Some(EnvEntry::Comment(line.to_string()));
    }
    let eq = line.find('=')?;
    let key = line[..eq].trim();
    let mut chars = key.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some(EnvEntry::Assignment {
        key: key.to_string(),
        prefix: line[..=eq].to_string(),
        value: line[eq + 1..].to_string(),
    })
}

impl EnvFile {
    fn parse(content: &str, path: &Path) -> Result<Self, OrchestratorError> {
        let ends_with_newline = content.ends_with('\n');
        let mut raw_lines: Vec<&str> = content.split('\n').collect();
        if ends_with_newline {
            raw_lines.pop();
        }
        if content.is_empty() {
            raw_lines.clear();
        }
        let mut entries = Vec::with_capacity(raw_lines.len());
        for (idx, line) in raw_lines.iter().enumerate() {
            let entry = parse_env_line(line).ok_or_else(|| OrchestratorError::ConfigParse {
                path: path.display().to_string(),
                line: idx + 1,
            })?;
            entries.push(entry);
        }
        Ok(Self {
            entries,
            ends_with_newline,
        })
    }

    fn load(path: &Path) -> Result<Self, OrchestratorError> {
        if !path.exists() {
            return Err(OrchestratorError::Config(format!(
                "configuration file not found: {}; create it next to docker-compose.yml before launching",
                path.display()
            )));
        }
        let content = fs::read_to_string(path)?;
        Self::parse(&content, path)
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find_map(|entry| match entry {
            EnvEntry::Assignment { key: k, value, .. } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    fn set_or_append(&mut self, key: &str, value: &str) -> bool {
        for entry in &mut self.entries {
            if let EnvEntry::Assignment { key: k, value: v, .. } = entry {
                if k == key {
                    if v == value {
                        return false;
                    }
                    *v = value.to_string();
                    return true;
                }
            }
        }
        self.entries.push(EnvEntry::Assignment {
            key: key.to_string(),
            prefix: format!("{key}="),
            value: value.to_string(),
        });
        self.ends_with_newline = true;
        true
    }

    fn ensure_default(&mut self, key: &str, value: &str, leading_comment: Option<&str>) -> bool {
        if self.get(key).is_some() {
            return false;
        }
        if let Some(comment) = leading_comment {
            self.entries.push(EnvEntry::Comment(comment.to_string()));
        }
        self.set_or_append(key, value);
        true
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for (idx, entry) in self.entries.iter().enumerate() {
            if idx > 0 {
                out.push('\n');
            }
            match entry {
                EnvEntry::Comment(text) | EnvEntry::Blank(text) => out.push_str(text),
                EnvEntry::Assignment { prefix, value, .. } => {
                    out.push_str(prefix);
                    out.push_str(value);
                }
            }
        }
        if self.ends_with_newline && !self.entries.is_empty() {
            out.push('\n');
        }
        out
    }
}

fn ensure_certificates<R: CommandRunner>(
    ctx: &Context,
    runner: &R,
    cert_dir: &Path,
) -> Result<bool, OrchestratorError> {
    let cert_path = cert_dir.join(CERT_FILE);
    let key_path = cert_dir.join(KEY_FILE);
    if cert_path.exists() && key_path.exists() {
        println!("Certificates already exist.");
        return Ok(false);
    }
    ensure_dir(cert_dir)?;
    println!("Generating self-signed certificates...");
    let mut args: Vec<String> = ["req", "-x509", "-nodes", "-days", "365", "-newkey", "rsa:2048"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.push("-keyout".to_string());
    args.push(key_path.to_string_lossy().to_string());
    args.push("-out".to_string());
    args.push(cert_path.to_string_lossy().to_string());
    args.push("-subj".to_string());
    args.push("/CN=*.lan".to_string());
    args.push("-addext".to_string());
    args.push("subjectAltName = DNS:*.lan,DNS:localhost".to_string());
    run_command(runner, "openssl", &args, &ctx.root, &BTreeMap::new(), true).map_err(
        |failure| OrchestratorError::Certificate {
            message: failure.to_string(),
            details: failure.into_details("certificate"),
        },
    )?;
    #[cfg(unix)]
    {
        // The private key must not be world-readable.
        if key_path.exists() {
            fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
        }
    }
    println!("Certificates generated successfully.");
    Ok(true)
}

fn canonical_hostnames() -> Vec<&'static str> {
    let mut names = CANONICAL_HOSTNAMES.to_vec();
    names.sort_unstable();
    names
}

fn render_hosts_block(address: &str) -> String {
    let mut block = String::new();
    block.push_str(HOSTS_BLOCK_OPEN);
    block.push('\n');
    for hostname in canonical_hostnames() {
        block.push_str(&format!("{address}\t{hostname}\n"));
    }
    block.push_str(HOSTS_BLOCK_CLOSE);
    block.push('\n');
    block
}

fn strip_hosts_block(content: &str) -> Result<Vec<String>, OrchestratorError> {
    if content.is_empty() {
        return Ok(Vec::new());
    }
    let ends_with_newline = content.ends_with('\n');
    let mut raw_lines: Vec<&str> = content.split('\n').collect();
    if ends_with_newline {
        raw_lines.pop();
    }
    let mut kept = Vec::new();
    let mut in_block = false;
    for line in raw_lines {
        let trimmed = line.trim();
        if trimmed == HOSTS_BLOCK_OPEN {
            if in_block {
                return Err(OrchestratorError::HostsCorrupt(format!(
                    "nested `{HOSTS_BLOCK_OPEN}` sentinel; remove the stray sentinel lines and re-run"
                )));
            }
            in_block = true;
        } else if trimmed == HOSTS_BLOCK_CLOSE {
            if !in_block {
                return Err(OrchestratorError::HostsCorrupt(format!(
                    "`{HOSTS_BLOCK_CLOSE}` sentinel without a matching opener; remove the stray sentinel lines and re-run"
                )));
            }
            in_block = false;
        } else if !in_block {
            kept.push(line.to_string());
        }
    }
    if in_block {
        return Err(OrchestratorError::HostsCorrupt(format!(
            "`{HOSTS_BLOCK_OPEN}` sentinel without a matching closer; remove the stray sentinel lines and re-run"
        )));
    }
    Ok(kept)
}

fn reconcile_hosts(path: &Path, address: &str) -> Result<bool, OrchestratorError> {
    let existing = if path.exists() {
        fs::read_to_string(path)?
    } else {
        String::new()
    };
    let kept = strip_hosts_block(&existing)?;
    let mut next = String::new();
    for line in &kept {
        next.push_str(line);
        next.push('\n');
    }
    next.push_str(&render_hosts_block(address));
    if next == existing {
        return Ok(false);
    }
    replace_atomically(path, &next).map_err(|err| {
        if err.kind() == io::ErrorKind::PermissionDenied {
            OrchestratorError::HostsUnwritable(format!(
                "{}: {}; re-run with elevated privileges (e.g. sudo) or apply the sentinel block manually",
                path.display(),
                err
            ))
        } else {
            OrchestratorError::Io(err)
        }
    })?;
    Ok(true)
}

fn classify_subrepo_failure(failure: CommandFailure) -> OrchestratorError {
    let stderr = failure.stderr.to_lowercase();
    let message = failure.to_string();
    if stderr.contains("couldn't find remote ref")
        || stderr.contains("unknown revision")
        || (stderr.contains("pathspec") && stderr.contains("did not match"))
    {
        OrchestratorError::SubRepoRefNotFound {
            message,
            details: failure.into_details("subrepo_ref_not_found"),
        }
    } else {
        OrchestratorError::SubRepoFetch {
            message,
            details: failure.into_details("subrepo_fetch"),
        }
    }
}

fn git_command<R: CommandRunner>(
    ctx: &Context,
    runner: &R,
    args: &[&str],
) -> Result<CommandOutput, OrchestratorError> {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    run_command(runner, "git", &args, &ctx.root, &BTreeMap::new(), true)
        .map_err(classify_subrepo_failure)
}

fn ensure_subrepo<R: CommandRunner>(ctx: &Context, runner: &R) -> Result<(), OrchestratorError> {
    let target = ctx.subrepo_dir();
    let target_str = target.to_string_lossy().to_string();
    if target.join(".git").exists() {
        println!("Supabase checkout already exists, updating...");
        git_command(
            ctx,
            runner,
            &["-C", &target_str, "fetch", "--depth", "1", "origin", SUBREPO_REF],
        )?;
        git_command(
            ctx,
            runner,
            &["-C", &target_str, "reset", "--hard", "FETCH_HEAD"],
        )?;
    } else {
        println!("Cloning the Supabase repository...");
        git_command(
            ctx,
            runner,
            &[
                "clone",
                "--filter=blob:none",
                "--no-checkout",
                SUBREPO_URL,
                SUBREPO_DIR,
            ],
        )?;
        git_command(
            ctx,
            runner,
            &["-C", &target_str, "sparse-checkout", "init", "--cone"],
        )?;
        git_command(
            ctx,
            runner,
            &["-C", &target_str, "sparse-checkout", "set", SUBREPO_SUBTREE],
        )?;
        git_command(ctx, runner, &["-C", &target_str, "checkout", SUBREPO_REF])?;
    }
    let compose_path = ctx.infra_compose_path();
    if !compose_path.exists() {
        return Err(OrchestratorError::SubRepoFetch {
            message: format!("checkout did not produce {}", compose_path.display()),
            details: ErrorDetails::bare("subrepo_fetch"),
        });
    }
    Ok(())
}

fn copy_env_to_subrepo(ctx: &Context) -> Result<(), OrchestratorError> {
    let src = ctx.env_path();
    let dst = ctx.subrepo_dir().join(SUBREPO_SUBTREE).join(".env");
    println!("Copying .env into {}...", dst.display());
    fs::copy(&src, &dst).map_err(|err| {
        OrchestratorError::SubStack(format!(
            "could not copy {} to {}: {}",
            src.display(),
            dst.display(),
            err
        ))
    })?;
    Ok(())
}

fn is_blank_or_comment(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

fn leading_space_count(line: &str) -> Result<usize, OrchestratorError> {
    let mut count = 0usize;
    for ch in line.chars() {
        match ch {
            ' ' => count += 1,
            '\t' => {
                return Err(OrchestratorError::SubStack(
                    "tabs are not supported in compose file indentation".to_string(),
                ))
            }
            _ => break,
        }
    }
    Ok(count)
}

fn match_block_key_line(line: &str, key: &str) -> Result<Option<usize>, OrchestratorError> {
    if is_blank_or_comment(line) {
        return Ok(None);
    }
    let indent = leading_space_count(line)?;
    let rest = &line[indent..];
    if !rest.starts_with(key) {
        return Ok(None);
    }
    let mut idx = key.len();
    while idx < rest.len() && rest.as_bytes()[idx].is_ascii_whitespace() {
        idx += 1;
    }
    if idx >= rest.len() || rest.as_bytes()[idx] != b':' {
        return Ok(None);
    }
    idx += 1;
    while idx < rest.len() && rest.as_bytes()[idx].is_ascii_whitespace() {
        idx += 1;
    }
    if idx >= rest.len() || rest.as_bytes()[idx] == b'#' {
        return Ok(Some(indent));
    }
    Ok(None)
}

fn block_end(
    lines: &[String],
    body_start: usize,
    parent_indent: usize,
) -> Result<usize, OrchestratorError> {
    for (idx, line) in lines.iter().enumerate().skip(body_start) {
        if is_blank_or_comment(line) {
            continue;
        }
        if leading_space_count(line)? <= parent_indent {
            return Ok(idx);
        }
    }
    Ok(lines.len())
}

fn ensure_pooler_port(content: &str) -> Result<(String, bool), OrchestratorError> {
    let ends_with_newline = content.ends_with('\n');
    let mut lines: Vec<String> = content.split('\n').map(|s| s.to_string()).collect();
    if ends_with_newline {
        lines.pop();
    }

    let mut services_idx = None;
    for (idx, line) in lines.iter().enumerate() {
        if match_block_key_line(line, "services")? == Some(0) {
            services_idx = Some(idx);
            break;
        }
    }
    let services_idx = services_idx.ok_or_else(|| {
        OrchestratorError::SubStack(
            "no top-level `services:` mapping in the sub-stack compose file".to_string(),
        )
    })?;
    let services_end = block_end(&lines, services_idx + 1, 0)?;

    let mut service_idx = None;
    let mut service_indent = 0usize;
    for idx in services_idx + 1..services_end {
        if let Some(indent) = match_block_key_line(&lines[idx], POOLER_SERVICE)? {
            if indent > 0 {
                service_idx = Some(idx);
                service_indent = indent;
                break;
            }
        }
    }
    let service_idx = service_idx.ok_or_else(|| {
        OrchestratorError::SubStack(format!(
            "service `{POOLER_SERVICE}` not found in the sub-stack compose file"
        ))
    })?;
    let service_end = block_end(&lines, service_idx + 1, service_indent)?;

    let mut body_indent = service_indent + 2;
    for line in lines.iter().take(service_end).skip(service_idx + 1) {
        if !is_blank_or_comment(line) {
            body_indent = leading_space_count(line)?;
            break;
        }
    }

    let mut ports_idx = None;
    for idx in service_idx + 1..service_end {
        if match_block_key_line(&lines[idx], "ports")? == Some(body_indent) {
            ports_idx = Some(idx);
            break;
        }
    }

    let mapping = format!("{POOLER_PORT}:{POOLER_PORT}");
    match ports_idx {
        Some(ports_idx) => {
            let ports_end = block_end(&lines, ports_idx + 1, body_indent)?;
            let mut entry_indent = None;
            let mut last_entry_idx = ports_idx;
            let mut found = false;
            for idx in ports_idx + 1..ports_end {
                let line = &lines[idx];
                if is_blank_or_comment(line) {
                    continue;
                }
                if entry_indent.is_none() {
                    entry_indent = Some(leading_space_count(line)?);
                }
                last_entry_idx = idx;
                if line.contains(&mapping) {
                    found = true;
                }
            }
            if found {
                return Ok((content.to_string(), false));
            }
            let indent = entry_indent.unwrap_or(body_indent + 2);
            lines.insert(
                last_entry_idx + 1,
                format!("{:indent$}- \"{mapping}\"", "", indent = indent),
            );
        }
        None => {
            let indent = body_indent;
            lines.insert(service_idx + 1, format!("{:indent$}ports:", "", indent = indent));
            let entry_indent = indent + 2;
            lines.insert(
                service_idx + 2,
                format!("{:indent$}- \"{mapping}\"", "", indent = entry_indent),
            );
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    Ok((out, true))
}

fn patch_pooler_ports(compose_path: &Path) -> Result<bool, OrchestratorError> {
    let content = fs::read_to_string(compose_path).map_err(|err| {
        OrchestratorError::SubStack(format!(
            "could not read {}: {}",
            compose_path.display(),
            err
        ))
    })?;
    let (patched, changed) = ensure_pooler_port(&content)?;
    if changed {
        replace_atomically(compose_path, &patched)?;
        println!(
            "Exposed pooler port {POOLER_PORT} in {}.",
            compose_path.display()
        );
    }
    Ok(changed)
}

#[derive(Debug, Clone)]
struct Stack {
    kind: StackKind,
    compose_files: Vec<PathBuf>,
    overlay_if_present: Option<PathBuf>,
    supports_profile: bool,
}

impl Stack {
    fn file_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for file in &self.compose_files {
            args.push("-f".to_string());
            args.push(file.to_string_lossy().to_string());
        }
        if let Some(overlay) = &self.overlay_if_present {
            if overlay.exists() {
                args.push("-f".to_string());
                args.push(overlay.to_string_lossy().to_string());
            }
        }
        args
    }
}

fn stacks_for(ctx: &Context) -> Vec<Stack> {
    vec![
        Stack {
            kind: StackKind::Infra,
            compose_files: vec![ctx.infra_compose_path()],
            overlay_if_present: None,
            supports_profile: false,
        },
        Stack {
            kind: StackKind::Ai,
            compose_files: vec![ctx.root.join("docker-compose.yml")],
            overlay_if_present: Some(ctx.root.join("docker-compose.host-cache.yml")),
            supports_profile: true,
        },
    ]
}

fn buildkit_env() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("DOCKER_BUILDKIT".to_string(), "1".to_string());
    env
}

fn compose_down<R: CommandRunner>(ctx: &Context, runner: &R, project: &str, stacks: &[Stack]) {
    let mut args = vec!["compose".to_string(), "-p".to_string(), project.to_string()];
    for stack in stacks {
        args.extend(stack.file_args());
    }
    args.push("down".to_string());
    println!("Stopping any existing '{project}' containers...");
    if let Err(failure) = run_command(runner, "docker", &args, &ctx.root, &buildkit_env(), false) {
        // Tear-down is best-effort; a missing project is not a failure.
        eprintln!("warning: compose down did not complete cleanly: {failure}");
    }
}

fn compose_up_stack<R: CommandRunner>(
    ctx: &Context,
    runner: &R,
    project: &str,
    stack: &Stack,
    profile: Profile,
) -> Result<(), OrchestratorError> {
    let mut args = vec!["compose".to_string(), "-p".to_string(), project.to_string()];
    if stack.supports_profile && profile != Profile::None {
        args.push("--profile".to_string());
        args.push(profile.as_str().to_string());
    }
    args.extend(stack.file_args());
    args.push("up".to_string());
    args.push("-d".to_string());
    args.push("--build".to_string());
    println!("Starting the {} stack...", stack.kind.as_str());
    let result = run_command(runner, "docker", &args, &ctx.root, &buildkit_env(), false);
    if ctx.interrupted.load(Ordering::Relaxed) {
        return Err(OrchestratorError::Interrupted);
    }
    result.map_err(|failure| {
        let error_code = match stack.kind {
            StackKind::Infra => "infra_stack_failed",
            StackKind::Ai => "ai_stack_failed",
        };
        OrchestratorError::Stack {
            kind: stack.kind,
            message: failure.to_string(),
            details: failure.into_details(error_code),
        }
    })?;
    Ok(())
}

fn sleep_interruptible(ctx: &Context, duration: Duration) -> Result<(), OrchestratorError> {
    let step = Duration::from_millis(100);
    let mut remaining = duration;
    while !remaining.is_zero() {
        check_interrupted(ctx)?;
        let chunk = remaining.min(step);
        thread::sleep(chunk);
        remaining -= chunk;
    }
    check_interrupted(ctx)
}

fn bring_up<R: CommandRunner>(
    ctx: &Context,
    runner: &R,
    project: &str,
    stacks: &[Stack],
    profile: Profile,
    pause: Duration,
) -> Result<(), OrchestratorError> {
    for stack in stacks {
        for file in &stack.compose_files {
            if !file.exists() {
                return Err(OrchestratorError::Config(format!(
                    "missing compose file: {}",
                    file.display()
                )));
            }
        }
    }
    compose_down(ctx, runner, project, stacks);
    check_interrupted(ctx)?;
    for (idx, stack) in stacks.iter().enumerate() {
        if idx > 0 {
            println!(
                "Waiting {}s for the {} stack to settle...",
                pause.as_secs(),
                stacks[idx - 1].kind.as_str()
            );
            sleep_interruptible(ctx, pause)?;
        }
        compose_up_stack(ctx, runner, project, stack, profile)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
struct HostEntry {
    hostname: String,
    address: String,
}

#[derive(Debug, Clone, Serialize)]
struct RemoteAccessPlan {
    server_address: String,
    entries: Vec<HostEntry>,
}

impl RemoteAccessPlan {
    fn new(server_address: &str, hostnames: &[&str]) -> Self {
        let entries = hostnames
            .iter()
            .map(|hostname| HostEntry {
                hostname: hostname.to_string(),
                address: server_address.to_string(),
            })
            .collect();
        Self {
            server_address: server_address.to_string(),
            entries,
        }
    }

    fn hosts_fragment(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&format!("{}\t{}\n", entry.address, entry.hostname));
        }
        out
    }

    fn dns_zone_fragment(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&format!("{}. IN A {}\n", entry.hostname, entry.address));
        }
        out
    }

    fn client_instructions(&self, include_dns: bool) -> String {
        let address = &self.server_address;
        let banner = "=".repeat(60);
        let mut text = String::new();
        text.push_str(&format!("{banner}\nREMOTE ACCESS PLAN\n{banner}\n\n"));
        text.push_str(&format!("Local AI services are served from: {address}\n\n"));
        text.push_str("1. CLIENT HOST-NAME ENTRIES\n\n");
        text.push_str(
            "Append the block below to /etc/hosts on each Linux or macOS client\n(requires root, e.g. `sudo tee -a /etc/hosts`):\n\n",
        );
        text.push_str(&self.hosts_fragment());
        text.push_str(
            "\nOn Windows clients append the same block to\n%SystemRoot%\\System32\\drivers\\etc\\hosts from an elevated editor.\n\n",
        );
        text.push_str(
            "2. ACCEPT THE SELF-SIGNED CERTIFICATE\n\nEach service presents a certificate for *.lan; the first visit shows a\nbrowser warning. Choose \"Advanced\" and proceed to the site.\n\n",
        );
        if include_dns {
            text.push_str(
                "3. AUTHORITATIVE DNS RECORDS\n\nInstead of per-client hosts entries, serve these A records from the\nLAN's authoritative DNS server:\n\n",
            );
            text.push_str(&self.dns_zone_fragment());
            text.push('\n');
        }
        text.push_str(&format!(
            "If a client cannot connect, first verify it can ping {address} and that\nthe container engine is running on the server (`docker ps`).\n"
        ));
        text
    }
}

fn is_lan_candidate(address: &str) -> bool {
    let Ok(ip) = address.parse::<Ipv4Addr>() else {
        return false;
    };
    if ip.is_loopback() {
        return false;
    }
    // The default docker bridge ranges are not reachable from other LAN hosts.
    let octets = ip.octets();
    !(octets[0] == 172 && (octets[1] == 17 || octets[1] == 18))
}

fn first_lan_address_from_ip_output(text: &str) -> Option<String> {
    let mut by_interface: BTreeMap<String, String> = BTreeMap::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[2] != "inet" {
            continue;
        }
        let interface = fields[1].trim_end_matches(':').to_string();
        let Some(address) = fields[3].split('/').next() else {
            continue;
        };
        if !is_lan_candidate(address) {
            continue;
        }
        by_interface.entry(interface).or_insert_with(|| address.to_string());
    }
    by_interface.into_values().next()
}

fn first_lan_address_from_list(text: &str) -> Option<String> {
    text.split_whitespace()
        .find(|candidate| is_lan_candidate(candidate))
        .map(|candidate| candidate.to_string())
}

fn detect_server_address<R: CommandRunner>(
    ctx: &Context,
    runner: &R,
) -> Result<String, OrchestratorError> {
    let ip_args: Vec<String> = ["-o", "-4", "addr", "show", "up"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if let Ok(output) = run_command(runner, "ip", &ip_args, &ctx.root, &BTreeMap::new(), true) {
        let text = String::from_utf8_lossy(&output.stdout);
        if let Some(address) = first_lan_address_from_ip_output(&text) {
            return Ok(address);
        }
    }
    let hostname_args: Vec<String> = ["-I"].iter().map(|s| s.to_string()).collect();
    if let Ok(output) = run_command(
        runner,
        "hostname",
        &hostname_args,
        &ctx.root,
        &BTreeMap::new(),
        true,
    ) {
        let text = String::from_utf8_lossy(&output.stdout);
        if let Some(address) = first_lan_address_from_list(&text) {
            return Ok(address);
        }
    }
    Err(OrchestratorError::Process(
        "could not determine the LAN address of this host; pass --server-address".to_string(),
    ))
}

fn parse_compose_ps_output(text: &str) -> serde_json::Value {
    match serde_json::from_str(text) {
        Ok(value) => match value {
            // Some Compose versions return a single object for a single row,
            // or null for none. Normalize to an array.
            serde_json::Value::Object(_) => serde_json::Value::Array(vec![value]),
            serde_json::Value::Null => serde_json::Value::Array(Vec::new()),
            _ => value,
        },
        Err(_) => {
            let mut items = Vec::new();
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
                    items.push(value);
                }
            }
            serde_json::Value::Array(items)
        }
    }
}

fn handle_launch<R: CommandRunner>(
    ctx: &Context,
    runner: &R,
    profile: Profile,
    project: &str,
    pause: Duration,
    skip_certs: bool,
) -> Result<(), OrchestratorError> {
    let started_at = Utc::now().to_rfc3339();

    let env_path = ctx.env_path();
    let mut env_file = EnvFile::load(&env_path)?;
    if env_file.ensure_default(
        "POOLER_TENANT_ID",
        "1000",
        Some("# Tenant id used by the connection pooler."),
    ) {
        replace_atomically(&env_path, &env_file.render())?;
        println!("Added POOLER_TENANT_ID=1000 to {}.", env_path.display());
    }
    check_interrupted(ctx)?;

    if skip_certs {
        println!("Skipping certificate generation.");
    } else {
        ensure_certificates(ctx, runner, &ctx.certs_dir())?;
    }
    check_interrupted(ctx)?;

    ensure_subrepo(ctx, runner)?;
    check_interrupted(ctx)?;

    copy_env_to_subrepo(ctx)?;
    patch_pooler_ports(&ctx.infra_compose_path())?;
    check_interrupted(ctx)?;

    match reconcile_hosts(&ctx.hosts_file, LOOPBACK_ADDRESS) {
        Ok(true) => println!(
            "Hosts file updated: {} service names now resolve to {LOOPBACK_ADDRESS}.",
            canonical_hostnames().len()
        ),
        Ok(false) => println!("Hosts file already up to date."),
        Err(err) => {
            eprintln!("warning: hosts file not updated: {err}");
            eprintln!("warning: service names will not resolve until the hosts block is applied.");
        }
    }

    let stacks = stacks_for(ctx);
    bring_up(ctx, runner, project, &stacks, profile, pause)?;

    output(
        ctx,
        json!({
            "action": "launch",
            "project": project,
            "profile": profile.as_str(),
            "started_at": started_at,
        }),
    )
}

fn handle_plan_remote_access<R: CommandRunner>(
    ctx: &Context,
    runner: &R,
    server_address: Option<String>,
    dns: bool,
    update_local: bool,
) -> Result<(), OrchestratorError> {
    let address = match server_address {
        Some(raw) => raw
            .parse::<Ipv4Addr>()
            .map_err(|_| {
                OrchestratorError::Usage(format!(
                    "invalid --server-address '{raw}': expected a dotted IPv4 address"
                ))
            })?
            .to_string(),
        None => detect_server_address(ctx, runner)?,
    };
    let hostnames = canonical_hostnames();
    let plan = RemoteAccessPlan::new(&address, &hostnames);

    if update_local {
        reconcile_hosts(&ctx.hosts_file, &address)?;
        println!(
            "Local hosts file now maps {} service names to {address}.",
            hostnames.len()
        );
    }

    if ctx.json {
        return output(
            ctx,
            json!({
                "server_address": plan.server_address,
                "entries": plan.entries,
                "hosts_fragment": plan.hosts_fragment(),
                "dns_zone_fragment": plan.dns_zone_fragment(),
                "updated_local_hosts": update_local,
            }),
        );
    }
    print!("{}", plan.client_instructions(dns));
    Ok(())
}

fn handle_status<R: CommandRunner>(
    ctx: &Context,
    runner: &R,
    project: &str,
) -> Result<(), OrchestratorError> {
    let stacks = stacks_for(ctx);
    let mut args = vec!["compose".to_string(), "-p".to_string(), project.to_string()];
    for stack in &stacks {
        for file in &stack.compose_files {
            if !file.exists() {
                return Err(OrchestratorError::Config(format!(
                    "missing compose file: {}",
                    file.display()
                )));
            }
        }
        args.extend(stack.file_args());
    }
    args.push("ps".to_string());
    args.push("--format".to_string());
    args.push("json".to_string());
    let cmd_output = run_command(runner, "docker", &args, &ctx.root, &BTreeMap::new(), true)
        .map_err(|failure| OrchestratorError::Process(failure.to_string()))?;
    let text = String::from_utf8_lossy(&cmd_output.stdout);
    let rows = parse_compose_ps_output(&text);
    if ctx.json {
        let payload = JsonResult {
            ok: true,
            result: Some(rows),
            error: None,
            error_details: None,
        };
        print_json(&payload)?;
        return Ok(());
    }
    let items = rows.as_array().cloned().unwrap_or_default();
    if items.is_empty() {
        println!("No containers running.");
        return Ok(());
    }
    for item in items {
        let name = item.get("Name").and_then(|v| v.as_str()).unwrap_or("-");
        let state = item.get("State").and_then(|v| v.as_str()).unwrap_or("-");
        let status = item.get("Status").and_then(|v| v.as_str()).unwrap_or("-");
        println!("{name}\t{state}\t{status}");
    }
    Ok(())
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), OrchestratorError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), OrchestratorError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

fn main() {
    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupt_signal = Arc::new(AtomicUsize::new(0));
    #[cfg(unix)]
    {
        // Record which signal fired before raising the shared flag, so the
        // runner forwards the same signal to an in-flight child.
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            let _ = signal_hook::flag::register_usize(
                signal,
                Arc::clone(&interrupt_signal),
                signal as usize,
            );
            let _ = signal_hook::flag::register(signal, Arc::clone(&interrupted));
        }
    }

    let cli = Cli::parse();
    let ctx = Context {
        root: cli.root.clone().unwrap_or_else(|| PathBuf::from(".")),
        hosts_file: cli.hosts_file.clone().unwrap_or_else(default_hosts_path),
        json: cli.json,
        interrupted: Arc::clone(&interrupted),
    };
    let runner = HostCommandRunner::new(Arc::clone(&interrupted), Arc::clone(&interrupt_signal));

    let result = match cli.command {
        Commands::Launch {
            profile,
            project,
            skip_certs,
            pause_secs,
        } => {
            if !profile_supported_on(profile, env::consts::OS) {
                Err(OrchestratorError::Usage(format!(
                    "profile '{}' is only supported on Linux hosts (detected '{}')",
                    profile.as_str(),
                    env::consts::OS
                )))
            } else {
                handle_launch(
                    &ctx,
                    &runner,
                    profile,
                    &project,
                    Duration::from_secs(pause_secs),
                    skip_certs,
                )
            }
        }
        Commands::PlanRemoteAccess {
            server_address,
            dns,
            update_local,
        } => handle_plan_remote_access(&ctx, &runner, server_address, dns, update_local),
        Commands::Status { project } => handle_status(&ctx, &runner, &project),
    };

    if let Err(err) = result {
        let err = if interrupted.load(Ordering::Relaxed) {
            OrchestratorError::Interrupted
        } else {
            err
        };
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: Some(error_details_for(&err)),
            };
            let _ = print_json(&payload);
        } else {
            eprintln!("{err}");
            if matches!(err, OrchestratorError::Usage(_)) {
                eprintln!("Run `orchestrator --help` for usage.");
            }
        }
        std::process::exit(exit_code_for(&err));
    }
}
