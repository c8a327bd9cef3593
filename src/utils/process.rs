use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};

#[derive(Clone, Debug)]
enum Arg {
    Plain(String),
    /// Passed through unchanged, shown as `<redacted>` in logs and errors.
    Secret(String),
}

impl Arg {
    fn value(&self) -> &str {
        match self {
            Arg::Plain(v) | Arg::Secret(v) => v,
        }
    }
}

/// One program invocation. Every command this tool runs is captured: stdin is
/// closed, stdout is returned, stderr ends up in the error.
#[derive(Clone, Debug)]
pub struct CmdSpec {
    program: String,
    args: Vec<Arg>,
}

impl CmdSpec {
    #[must_use]
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(Arg::Plain(a.into()));
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, it: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(it.into_iter().map(|a| Arg::Plain(a.into())));
        self
    }

    #[must_use]
    pub fn secret(mut self, a: impl Into<String>) -> Self {
        self.args.push(Arg::Secret(a.into()));
        self
    }

    /// Runs this command as the trailing arguments of `program prefix..`.
    #[must_use]
    pub fn under<I, S>(self, program: &str, prefix: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut outer = CmdSpec::new(program).args(prefix).arg(self.program);
        outer.args.extend(self.args);
        outer
    }

    #[inline]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Real argument values, secrets included.
    pub fn argv(&self) -> Vec<&str> {
        self.args.iter().map(Arg::value).collect()
    }

    pub fn has_secrets(&self) -> bool {
        self.args.iter().any(|a| matches!(a, Arg::Secret(_)))
    }

    /// Loggable shell form.
    pub fn render(&self) -> String {
        self.join(|a| match a {
            Arg::Plain(v) => sh_quote(v),
            Arg::Secret(_) => "<redacted>".into(),
        })
    }

    /// Shell form for a remote shell to execute; carries secrets in clear.
    pub fn to_shell(&self) -> String {
        self.join(|a| sh_quote(a.value()))
    }

    fn join(&self, f: impl Fn(&Arg) -> String) -> String {
        std::iter::once(sh_quote(&self.program))
            .chain(self.args.iter().map(f))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.argv()).stdin(Stdio::null());
        cmd
    }
}

pub trait Runner: Send + Sync {
    /// Stdout of a zero exit; any other exit is an error carrying stderr.
    fn capture(&self, cmd: &CmdSpec) -> Result<String>;
    /// Exit status as a bool; only spawn errors are `Err`.
    fn probe(&self, cmd: &CmdSpec) -> Result<bool>;
}

#[derive(Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Runner for ProcessRunner {
    fn capture(&self, spec: &CmdSpec) -> Result<String> {
        tracing::debug!("exec: {}", spec.render());
        let out = spec
            .to_command()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("spawn {}", spec.program()))?;
        if out.status.success() {
            return Ok(String::from_utf8_lossy(&out.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        match stderr.trim() {
            "" => bail!("command failed: {} ({})", spec.render(), out.status),
            msg => bail!("command failed: {} ({}): {msg}", spec.render(), out.status),
        }
    }

    fn probe(&self, spec: &CmdSpec) -> Result<bool> {
        tracing::debug!("exec(probe): {}", spec.render());
        let status = spec
            .to_command()
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("spawn {}", spec.program()))?;
        Ok(status.success())
    }
}

pub fn sh_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".into();
    }
    if !s
        .bytes()
        .any(|b| b.is_ascii_whitespace() || b"'\"\\$`;&|<>()*{}!#~".contains(&b))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(sh_quote(""), "''");
        assert_eq!(sh_quote("/dev/mapper/vgdata-lvdata"), "/dev/mapper/vgdata-lvdata");
        assert_eq!(sh_quote("db.getSiblingDB('local')"), "'db.getSiblingDB('\\''local'\\'')'");
        assert_eq!(sh_quote("{$set: 1}"), "'{$set: 1}'");
    }

    #[test]
    fn secrets_hidden_from_render_only() {
        let cmd = CmdSpec::new("mongosh")
            .args(["--quiet", "--eval", "db.hello()"])
            .secret("mongodb://admin:pw@h1:27017");
        assert!(cmd.has_secrets());
        assert_eq!(cmd.render(), "mongosh --quiet --eval 'db.hello()' <redacted>");
        assert_eq!(cmd.argv().last(), Some(&"mongodb://admin:pw@h1:27017"));
        assert!(cmd.to_shell().ends_with(" mongodb://admin:pw@h1:27017"));

        let outer = cmd.under("runuser", ["-u", "mongod", "--"]);
        assert_eq!(outer.program(), "runuser");
        assert!(outer.render().starts_with("runuser -u mongod -- mongosh --quiet"));
        assert!(outer.render().ends_with("<redacted>"));
    }

    #[cfg(unix)]
    #[test]
    fn capture_and_probe() {
        let r = ProcessRunner::new();
        let out = r.capture(&CmdSpec::new("sh").args(["-c", "echo hi"])).unwrap();
        assert_eq!(out, "hi\n");

        let err = r
            .capture(&CmdSpec::new("sh").args(["-c", "echo boom >&2; exit 3"]))
            .unwrap_err();
        assert!(format!("{err:#}").contains("boom"));

        assert!(!r.probe(&CmdSpec::new("sh").args(["-c", "exit 1"])).unwrap());
        assert!(r.probe(&CmdSpec::new("no-such-binary-kairos")).is_err());
    }
}
