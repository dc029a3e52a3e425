// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External process helpers.
//!
//! Both the mirror and the vendoring step shell out to tools that report
//! failure only through their exit status. Every call goes through here so
//! that status is always checked.

use std::{
    ffi::{OsStr, OsString},
    process::Command,
};

/// Run command to completion, returning its combined output.
///
/// # Errors
///
/// - Return [`SyscallError::Spawn`] if command cannot be started.
/// - Return [`SyscallError::Exit`] if command exits unsuccessfully.
pub(crate) fn syscall_non_interactive(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
) -> Result<String> {
    let output = Command::new(cmd.as_ref())
        .args(args)
        .output()
        .map_err(|source| SyscallError::Spawn {
            source,
            program: cmd.as_ref().to_os_string(),
        })?;
    let message = chomp_output(&output.stdout, &output.stderr);

    if !output.status.success() {
        return Err(SyscallError::Exit {
            program: cmd.as_ref().to_os_string(),
            code: output.status.code(),
            message,
        });
    }

    Ok(message)
}

/// Join stdout and stderr of a finished command into one message.
fn chomp_output(stdout: &[u8], stderr: &[u8]) -> String {
    let stdout = String::from_utf8_lossy(stdout).into_owned();
    let stderr = String::from_utf8_lossy(stderr).into_owned();
    let mut message = String::new();

    if !stdout.is_empty() {
        message.push_str(format!("stdout: {stdout}").as_str());
    }

    if !stderr.is_empty() {
        message.push_str(format!("stderr: {stderr}").as_str());
    }

    // INVARIANT: Chomp trailing newlines.
    message
        .strip_suffix("\r\n")
        .or(message.strip_suffix('\n'))
        .map(ToString::to_string)
        .unwrap_or(message)
}

pub(crate) fn describe_status(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "<killed by signal>".into(),
    }
}

/// External process error types.
#[derive(Debug, thiserror::Error)]
pub enum SyscallError {
    /// Command could not be started.
    #[error("failed to run {:?}", .program)]
    Spawn {
        #[source]
        source: std::io::Error,
        program: OsString,
    },

    /// Command ran but reported failure.
    #[error("{:?} exited with status {}:\n{}", .program, describe_status(.code), .message)]
    Exit {
        program: OsString,
        code: Option<i32>,
        message: String,
    },
}

/// Friendly result alias :3
type Result<T, E = SyscallError> = std::result::Result<T, E>;
