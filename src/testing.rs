//! Test doubles for the console, the dispatcher host and downloads
//!
//! [`ScriptedConsole`] plays a master image shell: it echoes lines, prints
//! the prompt (with `[rc=N]` once `PS1` is configured) and keeps a small
//! model of mounts and files so session and deploy code can run against
//! it. Scripted [`Responder`]s override that model for matching lines.
//!
//! Everything here is deterministic and never sleeps: an `expect` that
//! finds nothing in the buffered output times out immediately.

use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::artifact::Downloader;
use crate::console::{search, Connection, ExpectOutcome};
use crate::error::{Error, Result};
use crate::host::{HostCommand, HostOps, HostOutput};
use crate::shell::prompt::PS1_WITH_RC;

/// Output printed between a reset and the shell prompt
pub const BOOT_LOG: &str = "\nU-Boot 2011.06\nStarting kernel ...\n\n[    0.000000] Booting Linux on physical CPU 0\n";

/// Partition table dump with a boot and a root partition
pub const PARTED_DUMP: &str = "BYT;\n\
    /tmp/lava.img:3221225472B:file:512:512:msdos::;\n\
    1:4194304B:58720255B:54525952B:fat32::boot, lba;\n\
    2:58720256B:3221225471B:3162505216B:ext4::;\n";

/// Scripted reaction to a console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Responder {
    /// Finish with this exit status and no output
    Rc(i32),
    /// Print this and exit 0
    Output(String),
    /// Echo, then nothing: the command never returns
    Silence,
    /// The console stream ends
    Close,
    /// The board reboots and comes up at the plain master prompt
    Boot,
    /// The board goes down and stays quiet
    Hang,
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    responder: Responder,
    remaining: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Mount {
    source: String,
    target: String,
}

#[derive(Debug)]
struct ConsoleState {
    prompt: String,
    shell_up: bool,
    rc_mode: bool,
    closed: bool,
    last_rc: i32,
    buffer: String,
    sent: Vec<String>,
    rules: Vec<Rule>,
    mounts: Vec<Mount>,
    files: BTreeMap<String, String>,
    dirs: BTreeSet<String>,
    formatted: Vec<String>,
    unmounted: Vec<String>,
}

/// In-memory master image shell
#[derive(Debug, Clone)]
pub struct ScriptedConsole {
    state: Arc<Mutex<ConsoleState>>,
}

impl ScriptedConsole {
    /// A board that prints nothing until a [`Responder::Boot`] line
    pub fn powered_off(prompt: &str) -> Self {
        let mut files = BTreeMap::new();
        files.insert(
            "/etc/resolv.conf".to_string(),
            "nameserver 192.168.1.1\n".to_string(),
        );
        let dirs = ["/", "/etc", "/tmp", "/mnt"]
            .iter()
            .map(|d| d.to_string())
            .collect();

        Self {
            state: Arc::new(Mutex::new(ConsoleState {
                prompt: prompt.to_string(),
                shell_up: false,
                rc_mode: false,
                closed: false,
                last_rc: 0,
                buffer: String::new(),
                sent: Vec::new(),
                rules: Vec::new(),
                mounts: Vec::new(),
                files,
                dirs,
                formatted: Vec::new(),
                unmounted: Vec::new(),
            })),
        }
    }

    /// A master shell that is up but still has the stock prompt
    pub fn at_plain_prompt(prompt: &str) -> Self {
        let console = Self::powered_off(prompt);
        console.lock().shell_up = true;
        console
    }

    /// A master shell already printing `[rc=N]` prompts
    pub fn ready(prompt: &str) -> Self {
        let console = Self::at_plain_prompt(prompt);
        console.lock().rc_mode = true;
        console
    }

    fn lock(&self) -> MutexGuard<'_, ConsoleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// React to every line containing `pattern`
    pub fn respond(&self, pattern: &str, responder: Responder) {
        self.push_rule(pattern, responder, None);
    }

    /// React to the next `times` lines containing `pattern`
    pub fn respond_times(&self, pattern: &str, responder: Responder, times: usize) {
        self.push_rule(pattern, responder, Some(times));
    }

    fn push_rule(&self, pattern: &str, responder: Responder, remaining: Option<usize>) {
        self.lock().rules.push(Rule {
            pattern: pattern.to_string(),
            responder,
            remaining,
        });
    }

    /// Every line sent, blank nudges excluded
    pub fn sent(&self) -> Vec<String> {
        self.lock()
            .sent
            .iter()
            .filter(|l| !l.is_empty())
            .cloned()
            .collect()
    }

    /// Sent lines containing `needle`
    pub fn sent_matching(&self, needle: &str) -> Vec<String> {
        self.sent().into_iter().filter(|l| l.contains(needle)).collect()
    }

    /// Number of blank lines sent to wake the prompt
    pub fn nudges(&self) -> usize {
        self.lock().sent.iter().filter(|l| l.is_empty()).count()
    }

    /// Current mount targets, in mount order
    pub fn mounts(&self) -> Vec<String> {
        self.lock().mounts.iter().map(|m| m.target.clone()).collect()
    }

    /// Mount targets released so far, in order
    pub fn unmounted(&self) -> Vec<String> {
        self.lock().unmounted.clone()
    }

    /// Labels reformatted so far, in order
    pub fn formatted(&self) -> Vec<String> {
        self.lock().formatted.clone()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.lock().files.get(path).cloned()
    }

    pub fn set_file(&self, path: &str, contents: &str) {
        self.lock().files.insert(path.to_string(), contents.to_string());
    }

    pub fn is_shell_up(&self) -> bool {
        self.lock().shell_up
    }

    pub fn is_rc_prompt(&self) -> bool {
        self.lock().rc_mode
    }
}

#[async_trait]
impl Connection for ScriptedConsole {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::ConnectionClosed {
                waiting_for: format!("console to accept `{}`", line),
            });
        }
        state.sent.push(line.to_string());
        state.handle(line);
        Ok(())
    }

    async fn expect(&mut self, patterns: &[Regex], _timeout: Duration) -> Result<ExpectOutcome> {
        let mut state = self.lock();
        if let Some((found, end)) = search(&state.buffer, patterns) {
            state.buffer.drain(..end);
            return Ok(ExpectOutcome::Matched(found));
        }
        if state.closed {
            state.buffer.clear();
            return Ok(ExpectOutcome::Eof);
        }
        Ok(ExpectOutcome::Timeout)
    }
}

impl ConsoleState {
    fn prompt_text(&self) -> String {
        if self.rc_mode {
            format!("{}[rc={}]: ", self.prompt, self.last_rc)
        } else {
            self.prompt.clone()
        }
    }

    fn echo(&mut self, line: &str) {
        if self.shell_up {
            self.buffer.push_str(line);
            self.buffer.push('\n');
        }
    }

    fn finish(&mut self, output: &str, rc: i32) {
        if !self.shell_up {
            return;
        }
        self.buffer.push_str(output);
        if !output.is_empty() && !output.ends_with('\n') {
            self.buffer.push('\n');
        }
        self.last_rc = rc;
        let prompt = self.prompt_text();
        self.buffer.push_str(&prompt);
    }

    fn take_rule(&mut self, line: &str) -> Option<Responder> {
        let rule = self.rules.iter_mut().find(|r| {
            r.remaining != Some(0) && !r.pattern.is_empty() && line.contains(r.pattern.as_str())
        })?;
        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        Some(rule.responder.clone())
    }

    fn handle(&mut self, line: &str) {
        if let Some(responder) = self.take_rule(line) {
            self.echo(line);
            match responder {
                Responder::Rc(rc) => self.finish("", rc),
                Responder::Output(text) => self.finish(&text, 0),
                Responder::Silence => {}
                Responder::Close => self.closed = true,
                Responder::Boot => {
                    self.shell_up = true;
                    self.rc_mode = false;
                    self.last_rc = 0;
                    self.buffer.push_str(BOOT_LOG);
                    let prompt = self.prompt.clone();
                    self.buffer.push_str(&prompt);
                }
                Responder::Hang => self.shell_up = false,
            }
            return;
        }

        if !self.shell_up {
            return;
        }
        self.echo(line);
        if line == PS1_WITH_RC {
            self.rc_mode = true;
            self.finish("", 0);
            return;
        }
        if line.trim().is_empty() {
            let rc = self.last_rc;
            self.finish("", rc);
            return;
        }
        let (output, rc) = self.execute(line);
        self.finish(&output, rc);
    }

    /// Best-effort model of the handful of commands sessions rely on
    fn execute(&mut self, line: &str) -> (String, i32) {
        let words = split_words(line);
        let start = words
            .iter()
            .position(|w| !(w.contains('=') && !w.contains('/')))
            .unwrap_or(words.len());
        let words = &words[start..];
        let Some(program) = words.first().map(String::as_str) else {
            return (String::new(), 0);
        };

        // Commands in another directory or root are not modelled
        if program == "chroot" || program == "cd" {
            return (String::new(), 0);
        }
        if words.iter().any(|w| w == "|") {
            return self.pipeline(words);
        }

        let args: Vec<&str> = words[1..].iter().map(String::as_str).collect();
        let operands: Vec<&str> = args.iter().copied().filter(|a| !a.starts_with('-')).collect();
        match program {
            "mount" => self.mount(&args, &operands),
            "umount" => match operands.first() {
                Some(target) => self.umount(target),
                None => ("umount: missing operand".to_string(), 1),
            },
            p if p.starts_with("mkfs.") => self.mkfs(&args),
            "mkdir" => {
                for dir in operands {
                    self.dirs.insert(dir.to_string());
                }
                (String::new(), 0)
            }
            "cp" | "mv" => match operands.as_slice() {
                [src, dst] => self.copy(src, dst, program == "mv"),
                _ => (format!("{}: missing operand", program), 1),
            },
            "rm" => {
                for path in operands {
                    self.remove(path);
                }
                (String::new(), 0)
            }
            "echo" => match args.iter().position(|a| *a == ">") {
                Some(idx) if idx + 1 < args.len() => {
                    let mut text = args[..idx].join(" ");
                    text.push('\n');
                    self.files.insert(args[idx + 1].to_string(), text);
                    (String::new(), 0)
                }
                _ => (args.join(" "), 0),
            },
            "ping" => ("1 packets transmitted, 1 received, 0% packet loss".to_string(), 0),
            _ => (String::new(), 0),
        }
    }

    fn pipeline(&mut self, words: &[String]) -> (String, i32) {
        let unmounts_dev = words.iter().any(|w| w == "/proc/mounts") && words.iter().any(|w| w == "xargs");
        if !unmounts_dev {
            return (String::new(), 0);
        }
        let Some(prefix) = words
            .iter()
            .position(|w| w == "grep")
            .and_then(|i| words.get(i + 1))
            .map(|p| p.trim_start_matches('^').to_string())
        else {
            return (String::new(), 1);
        };

        // /proc/mounts lists mounts in the order they were made
        let mut targets: Vec<String> = self
            .mounts
            .iter()
            .map(|m| m.target.clone())
            .filter(|t| t.starts_with(&prefix))
            .collect();
        if let Some(sort) = words.iter().position(|w| w == "sort") {
            targets.sort();
            if words.get(sort + 1).is_some_and(|w| w == "-r") {
                targets.reverse();
            }
        }

        // xargs hands every target to one umount, which tries each in turn
        let mut errors = Vec::new();
        for target in &targets {
            let (output, rc) = self.umount(target);
            if rc != 0 {
                errors.push(output);
            }
        }
        if errors.is_empty() {
            (String::new(), 0)
        } else {
            (errors.join("\n"), 123)
        }
    }

    fn mount(&mut self, args: &[&str], operands: &[&str]) -> (String, i32) {
        let [source, target] = operands else {
            return ("mount: bad usage".to_string(), 1);
        };
        if args.contains(&"--rbind") {
            self.mounts.push(Mount {
                source: source.to_string(),
                target: target.to_string(),
            });
            self.mounts.push(Mount {
                source: "devpts".to_string(),
                target: format!("{}/pts", target),
            });
            return (String::new(), 0);
        }
        if self.mounts.iter().any(|m| m.source == *source) {
            return (format!("mount: {} already mounted", source), 32);
        }
        self.mounts.push(Mount {
            source: source.to_string(),
            target: target.to_string(),
        });
        for dir in [target.to_string(), format!("{}/etc", target), format!("{}/dev", target)] {
            self.dirs.insert(dir);
        }
        (String::new(), 0)
    }

    fn umount(&mut self, what: &str) -> (String, i32) {
        let Some(idx) = self
            .mounts
            .iter()
            .rposition(|m| m.target == what || m.source == what)
        else {
            return (format!("umount: {}: not mounted", what), 1);
        };
        let nested = format!("{}/", self.mounts[idx].target);
        if self.mounts.iter().any(|m| m.target.starts_with(&nested)) {
            return (format!("umount: {}: target is busy", what), 16);
        }
        let released = self.mounts.remove(idx);
        self.unmounted.push(released.target);
        (String::new(), 0)
    }

    fn mkfs(&mut self, args: &[&str]) -> (String, i32) {
        let Some(device) = args.iter().find(|a| a.starts_with("/dev/")) else {
            return ("mkfs: no device".to_string(), 1);
        };
        if self.mounts.iter().any(|m| m.source == *device) {
            return (
                format!("{} is mounted; will not make a filesystem here!", device),
                1,
            );
        }
        let label = device.trim_start_matches("/dev/disk/by-label/").to_string();
        self.formatted.push(label);
        (String::new(), 0)
    }

    fn is_dir(&self, path: &str) -> bool {
        let nested = format!("{}/", path.trim_end_matches('/'));
        self.dirs.contains(path) || self.files.keys().any(|f| f.starts_with(&nested))
    }

    fn copy(&mut self, src: &str, dst: &str, remove_source: bool) -> (String, i32) {
        let Some(contents) = self.files.get(src).cloned() else {
            return (format!("cannot stat '{}': No such file or directory", src), 1);
        };
        let dest = if self.is_dir(dst) {
            let name = Path::new(src)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!("{}/{}", dst.trim_end_matches('/'), name)
        } else {
            dst.to_string()
        };
        if remove_source {
            self.files.remove(src);
        }
        self.files.insert(dest, contents);
        (String::new(), 0)
    }

    fn remove(&mut self, path: &str) {
        let nested = format!("{}/", path.trim_end_matches('/'));
        self.files.retain(|f, _| f != path && !f.starts_with(&nested));
        self.dirs.retain(|d| d != path && !d.starts_with(&nested));
    }
}

/// Split a rendered command line into words, undoing sh quoting
pub fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '"' => {
                in_word = true;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                current.push(escaped);
                            }
                        }
                        _ => current.push(q),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            _ => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

#[derive(Debug, Default)]
struct HostState {
    commands: Vec<HostCommand>,
    responses: HashMap<String, HostOutput>,
    creates: HashMap<String, String>,
}

/// Host that records commands instead of running them
///
/// Unscripted programs succeed with no output, except `parted` (which
/// prints [`PARTED_DUMP`]) and the image tool (which prints a version).
#[derive(Debug, Clone, Default)]
pub struct RecordingHost {
    state: Arc<Mutex<HostState>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        let host = Self::default();
        host.respond("parted", HostOutput::ok(PARTED_DUMP));
        host.respond("linaro-media-create", HostOutput::ok("linaro-media-create 2012.01\n"));
        host
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer every run of `program` with `output`
    pub fn respond(&self, program: &str, output: HostOutput) {
        self.lock().responses.insert(program.to_string(), output);
    }

    /// Have `program` write `file_name` into its working directory
    pub fn creates(&self, program: &str, file_name: &str) {
        self.lock()
            .creates
            .insert(program.to_string(), file_name.to_string());
    }

    pub fn commands(&self) -> Vec<HostCommand> {
        self.lock().commands.clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.lock().commands.iter().map(|c| c.program.clone()).collect()
    }

    pub fn ran(&self, program: &str) -> bool {
        self.lock().commands.iter().any(|c| c.program == program)
    }
}

#[async_trait]
impl HostOps for RecordingHost {
    async fn run(&self, command: &HostCommand) -> Result<HostOutput> {
        let (output, created) = {
            let mut state = self.lock();
            state.commands.push(command.clone());
            let output = state
                .responses
                .get(&command.program)
                .cloned()
                .unwrap_or_else(|| HostOutput::ok(""));
            let created = match (&command.current_dir, state.creates.get(&command.program)) {
                (Some(dir), Some(name)) if output.success() => Some(dir.join(name)),
                _ => None,
            };
            (output, created)
        };
        if let Some(path) = created {
            tokio::fs::write(&path, b"generated").await?;
        }
        Ok(output)
    }
}

#[derive(Debug, Default)]
struct DownloadState {
    counts: HashMap<String, usize>,
    failing: BTreeSet<String>,
}

/// Downloader that writes placeholder bytes and counts requests per URL
#[derive(Debug, Clone, Default)]
pub struct CountingDownloader {
    state: Arc<Mutex<DownloadState>>,
}

impl CountingDownloader {
    fn lock(&self) -> MutexGuard<'_, DownloadState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make downloads of `url` fail
    pub fn fail(&self, url: &str) {
        self.lock().failing.insert(url.to_string());
    }

    pub fn count(&self, url: &str) -> usize {
        self.lock().counts.get(url).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.lock().counts.values().sum()
    }
}

#[async_trait]
impl Downloader for CountingDownloader {
    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        {
            let mut state = self.lock();
            if state.failing.contains(url) {
                return Err(Error::ArtifactFetchFailed {
                    url: url.to_string(),
                    reason: "HTTP 404 Not Found".to_string(),
                });
            }
            *state.counts.entry(url.to_string()).or_default() += 1;
        }
        tokio::fs::write(dest, format!("contents of {}", url)).await?;
        Ok(())
    }
}
