//! Typed shell command builder
//!
//! Commands sent to the master image are assembled from a program and its
//! arguments instead of by string interpolation. Every argument is quoted
//! for POSIX `sh`, and anything that cannot travel over a line-oriented
//! console (newlines, carriage returns, NUL) is rejected at render time.

use std::fmt;

use crate::error::{Error, Result};

/// Maximum rendered length accepted on a serial console line
pub const MAX_COMMAND_LENGTH: usize = 4096;

/// A shell command line for the device console
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Simple {
        env: Vec<(String, String)>,
        program: String,
        args: Vec<String>,
        redirect: Option<String>,
    },
    Pipeline(Vec<ShellCommand>),
    AndThen(Vec<ShellCommand>),
    Sequence(Vec<ShellCommand>),
    /// Pre-rendered text, for the rare line that needs shell expansion
    Raw(String),
}

impl ShellCommand {
    /// Start a simple command
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            kind: Kind::Simple {
                env: Vec::new(),
                program: program.into(),
                args: Vec::new(),
                redirect: None,
            },
        }
    }

    /// A line sent verbatim; `$`, quotes and substitutions stay live
    pub fn raw(text: impl Into<String>) -> Self {
        Self {
            kind: Kind::Raw(text.into()),
        }
    }

    /// Append one argument
    ///
    /// On a compound command this extends the last stage; on a raw line
    /// the quoted word is appended to the text.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        let arg = arg.into();
        self.edit_tail(|kind| match kind {
            Kind::Simple { args, .. } => args.push(arg),
            Kind::Raw(text) => {
                text.push(' ');
                text.push_str(&quote(&arg));
            }
            _ => {}
        });
        self
    }

    /// Append several arguments
    pub fn args<I, S>(self, new_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        new_args.into_iter().fold(self, |cmd, arg| cmd.arg(arg))
    }

    /// Prefix an environment assignment (`KEY=value cmd`) to the last stage
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value) = (key.into(), value.into());
        self.edit_tail(|kind| match kind {
            Kind::Simple { env, .. } => env.push((key, value)),
            Kind::Raw(text) => *text = format!("{}={} {}", key, quote(&value), text),
            _ => {}
        });
        self
    }

    /// Redirect stdout of the last stage to a file, truncating it
    pub fn write_to(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.edit_tail(|kind| match kind {
            Kind::Simple { redirect, .. } => *redirect = Some(path),
            Kind::Raw(text) => {
                text.push_str(" > ");
                text.push_str(&quote(&path));
            }
            _ => {}
        });
        self
    }

    /// Apply `edit` to the innermost last stage
    fn edit_tail(&mut self, edit: impl FnOnce(&mut Kind)) {
        match &mut self.kind {
            Kind::Pipeline(stages) | Kind::AndThen(stages) | Kind::Sequence(stages) => {
                if let Some(last) = stages.last_mut() {
                    last.edit_tail(edit);
                }
            }
            kind => edit(kind),
        }
    }

    /// `self | next`
    pub fn pipe(self, next: ShellCommand) -> Self {
        match self.kind {
            Kind::Pipeline(mut stages) => {
                stages.push(next);
                Self {
                    kind: Kind::Pipeline(stages),
                }
            }
            kind => Self {
                kind: Kind::Pipeline(vec![Self { kind }, next]),
            },
        }
    }

    /// `self && next`
    pub fn and_then(self, next: ShellCommand) -> Self {
        match self.kind {
            Kind::AndThen(mut steps) => {
                steps.push(next);
                Self {
                    kind: Kind::AndThen(steps),
                }
            }
            kind => Self {
                kind: Kind::AndThen(vec![Self { kind }, next]),
            },
        }
    }

    /// `self; next`
    pub fn then(self, next: ShellCommand) -> Self {
        match self.kind {
            Kind::Sequence(mut steps) => {
                steps.push(next);
                Self {
                    kind: Kind::Sequence(steps),
                }
            }
            kind => Self {
                kind: Kind::Sequence(vec![Self { kind }, next]),
            },
        }
    }

    /// `cd dir && self`
    pub fn in_dir(self, dir: impl Into<String>) -> Self {
        ShellCommand::new("cd").arg(dir).and_then(self)
    }

    /// Run this command inside `root` via chroot
    ///
    /// Simple commands are prefixed directly; anything with pipes,
    /// redirections or sequencing runs under `sh -c` so that every stage
    /// stays inside the chroot.
    pub fn within_chroot(&self, root: &str) -> Result<Self> {
        match &self.kind {
            Kind::Simple {
                env,
                program,
                args,
                redirect: None,
            } if env.is_empty() => Ok(ShellCommand::new("chroot")
                .arg(root)
                .arg(program.clone())
                .args(args.iter().cloned())),
            _ => Ok(ShellCommand::new("chroot")
                .arg(root)
                .args(["sh", "-c"])
                .arg(self.render()?)),
        }
    }

    /// Program name of a simple command
    pub fn program(&self) -> Option<&str> {
        match &self.kind {
            Kind::Simple { program, .. } => Some(program),
            _ => None,
        }
    }

    /// Render the command line, validating every piece
    pub fn render(&self) -> Result<String> {
        let line = self.render_unchecked();
        validate_line(&line)?;
        Ok(line)
    }

    fn render_unchecked(&self) -> String {
        match &self.kind {
            Kind::Simple {
                env,
                program,
                args,
                redirect,
            } => {
                let mut words: Vec<String> = env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, quote(v)))
                    .collect();
                words.push(quote(program));
                words.extend(args.iter().map(|a| quote(a)));
                if let Some(path) = redirect {
                    words.push(">".to_string());
                    words.push(quote(path));
                }
                words.join(" ")
            }
            Kind::Pipeline(stages) => join_grouped(stages, " | "),
            Kind::AndThen(steps) => join_grouped(steps, " && "),
            Kind::Sequence(steps) => join_grouped(steps, "; "),
            Kind::Raw(text) => text.clone(),
        }
    }

    fn is_compound(&self) -> bool {
        matches!(
            self.kind,
            Kind::Pipeline(_) | Kind::AndThen(_) | Kind::Sequence(_)
        )
    }
}

fn join_grouped(parts: &[ShellCommand], separator: &str) -> String {
    parts
        .iter()
        .map(|part| {
            if part.is_compound() {
                format!("{{ {}; }}", part.render_unchecked())
            } else {
                part.render_unchecked()
            }
        })
        .collect::<Vec<_>>()
        .join(separator)
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render_unchecked())
    }
}

/// Quote a word for POSIX sh
///
/// Words made only of characters with no special meaning pass through
/// untouched so logs stay readable.
pub fn quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '@' | '%' | '+' | '=' | ',')
        });
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Reject lines that would break the console's line protocol
pub fn validate_line(line: &str) -> Result<()> {
    let reason = if line.trim().is_empty() {
        Some("command cannot be empty")
    } else if line.contains('\0') {
        Some("command contains a NUL byte")
    } else if line.contains('\n') || line.contains('\r') {
        Some("command spans multiple lines")
    } else if line.len() > MAX_COMMAND_LENGTH {
        Some("command exceeds the console line limit")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(Error::CommandValidationFailed {
            command: line.chars().take(80).collect(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}
