//! Process module.
//!
//! This module contains cross platform helpers around the
//! `std::process` crate, used to retrieve secrets from user-defined
//! shell commands.

use log::debug;
use std::{
    env, io,
    process::{Command, Stdio},
    result, string,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot spawn process for command {1:?}")]
    SpawnProcessError(#[source] io::Error, String),
    #[error("command {0:?} exited with status {1}")]
    ExitStatusError(String, i32),
    #[error("cannot parse command output")]
    ParseCmdOutputError(#[source] string::FromUtf8Error),
}

pub type Result<T> = result::Result<T, Error>;

/// Runs the given shell command and returns its standard output as
/// an UTF-8 string.
pub fn run(cmd: &str) -> Result<String> {
    debug!("running command: {}", cmd);

    let windows = cfg!(target_os = "windows")
        && env::var("MSYSTEM")
            .map(|env| !env.starts_with("MINGW"))
            .unwrap_or_default();

    let output = if windows {
        Command::new("cmd")
            .args(["/C", cmd])
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
    } else {
        Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
    }
    .map_err(|err| Error::SpawnProcessError(err, cmd.to_owned()))?;

    if !output.status.success() {
        let code = output.status.code().unwrap_or(-1);
        return Err(Error::ExitStatusError(cmd.to_owned(), code));
    }

    String::from_utf8(output.stdout).map_err(Error::ParseCmdOutputError)
}

#[cfg(all(test, unix))]
mod tests {
    #[test]
    fn run_returns_stdout() {
        assert_eq!(super::run("echo 'password'").unwrap(), "password\n");
    }

    #[test]
    fn run_fails_on_non_zero_exit() {
        assert!(matches!(
            super::run("exit 3"),
            Err(super::Error::ExitStatusError(_, 3))
        ));
    }
}
