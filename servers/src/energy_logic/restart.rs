//! Hard recovery: replace the running process with a fresh copy of itself,
//! started with exactly the arguments this one received.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Command;

/// How this process was started.
#[derive(Debug, Clone)]
pub struct Invocation {
    program: PathBuf,
    #[cfg_attr(not(unix), allow(dead_code))]
    argv0: OsString,
    args: Vec<OsString>,
}

impl Invocation {
    /// Records the current executable and argv. Call before anything can
    /// change the working directory.
    pub fn capture() -> Result<Self> {
        let program = std::env::current_exe().context("cannot determine the current executable")?;
        let mut argv = std::env::args_os();
        let argv0 = argv.next().unwrap_or_else(|| program.clone().into_os_string());
        Ok(Self {
            program,
            argv0,
            args: argv.collect(),
        })
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.arg0(&self.argv0);
        }
        command
    }

    /// Replaces this process image. Only returns on failure.
    #[cfg(unix)]
    pub fn reexec(&self) -> anyhow::Error {
        use std::os::unix::process::CommandExt;
        log::warn!("Re-executing {} {:?}", self.program.display(), self.args);
        log::logger().flush();
        let err = self.command().exec();
        anyhow::Error::new(err).context(format!("failed to re-execute {}", self.program.display()))
    }

    /// Runs a fresh copy and exits with its exit code. Only returns on failure.
    #[cfg(not(unix))]
    pub fn reexec(&self) -> anyhow::Error {
        log::warn!("Restarting {} {:?}", self.program.display(), self.args);
        log::logger().flush();
        match self.command().status() {
            Ok(status) => std::process::exit(status.code().unwrap_or(1)),
            Err(err) => anyhow::Error::new(err).context(format!("failed to restart {}", self.program.display())),
        }
    }
}
