use crate::request::Credentials;
use crate::retry::with_retries;
use crate::{MigrationError, Result, log_debug};
use base64::prelude::*;
use std::process::{Output, Stdio};
use tokio::process::Command;

// ssh reports its own failures (unreachable host, refused, handshake) as 255.
const SSH_CONNECTION_FAILURE: i32 = 255;
// sshpass: invalid/incorrect password.
const SSHPASS_BAD_PASSWORD: i32 = 5;

/// Run a local program to completion and return its stdout.
///
/// The child is killed if the returned future is dropped, so a step timeout
/// does not leave the program running.
pub async fn run_local(program: &str, args: &[String]) -> Result<String> {
    log_debug!("exec: {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| spawn_error(program, e))?;

    check_output(program, &output)?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn spawn_error(program: &str, err: std::io::Error) -> MigrationError {
    if err.kind() == std::io::ErrorKind::NotFound {
        MigrationError::command(program, "not installed or not on PATH")
    } else {
        MigrationError::Io(err)
    }
}

fn check_output(program: &str, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr
    };
    Err(MigrationError::command(program, message))
}

/// Encode a script for `powershell -EncodedCommand` (base64 of UTF-16LE).
pub fn encode_powershell(script: &str) -> String {
    let utf16: Vec<u8> = script
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    BASE64_STANDARD.encode(utf16)
}

/// Remote command execution over OpenSSH.
///
/// With a password, `sshpass -e` feeds it through the `SSHPASS` environment
/// variable so it never appears in the process list.
#[derive(Clone)]
pub struct RemoteShell {
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
    retries: u32,
}

impl RemoteShell {
    pub fn new(credentials: &Credentials, port: u16, retries: u32) -> Self {
        Self {
            host: credentials.host.clone(),
            port,
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            retries,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn destination(&self) -> String {
        if self.username.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.username, self.host)
        }
    }

    fn build(&self, remote_command: &str) -> Command {
        let mut ssh_args = vec![
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "ConnectTimeout=15".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];

        let mut cmd = match &self.password {
            Some(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg("ssh").env("SSHPASS", password);
                cmd
            }
            None => {
                ssh_args.push("-o".to_string());
                ssh_args.push("BatchMode=yes".to_string());
                Command::new("ssh")
            }
        };
        cmd.args(ssh_args)
            .arg(self.destination())
            .arg(remote_command)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn run_once(&self, remote_command: &str) -> Result<String> {
        let program = if self.password.is_some() { "sshpass" } else { "ssh" };
        let output = self
            .build(remote_command)
            .output()
            .await
            .map_err(|e| spawn_error(program, e))?;

        match output.status.code() {
            Some(SSH_CONNECTION_FAILURE) => {
                return Err(MigrationError::Connection(format!(
                    "ssh to {}: {}",
                    self.host,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            Some(SSHPASS_BAD_PASSWORD) if self.password.is_some() => {
                return Err(MigrationError::Authentication(format!(
                    "{} rejected the password for {}",
                    self.host, self.username
                )));
            }
            _ => {}
        }

        check_output(&format!("ssh {}", self.host), &output)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a shell command on the remote host. Connection failures are retried.
    pub async fn run(&self, remote_command: &str) -> Result<String> {
        log_debug!("ssh {}: {}", self.host, remote_command);
        let what = format!("ssh {}", self.host);
        with_retries(&what, self.retries, || self.run_once(remote_command)).await
    }

    pub async fn run_powershell(&self, script: &str) -> Result<String> {
        log_debug!("PowerShell on {}:\n{}", self.host, script);
        let command = format!(
            "powershell -NoProfile -NonInteractive -EncodedCommand {}",
            encode_powershell(script)
        );
        with_retries(&format!("PowerShell on {}", self.host), self.retries, || {
            self.run_once(&command)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn powershell_encoding_is_utf16le_base64() {
        // "ls" -> 6C 00 73 00
        assert_eq!(encode_powershell("ls"), "bABzAA==");
    }

    #[test]
    fn destination_includes_user() {
        let shell = RemoteShell::new(
            &Credentials {
                host: "hv01".into(),
                username: "admin".into(),
                password: None,
            },
            22,
            0,
        );
        assert_eq!(shell.destination(), "admin@hv01");
        assert_eq!(shell.host(), "hv01");
        assert_eq!(shell.port(), 22);
    }

    #[tokio::test]
    async fn abandoned_command_is_killed() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("finished");
        let script = format!("sleep 1; touch '{}'", marker.display());

        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            run_local("sh", &["-c".into(), script]),
        )
        .await;
        assert!(outcome.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "child outlived its timeout");
    }

    #[tokio::test]
    async fn missing_program_is_reported_as_command_error() {
        let err = run_local("vmshift-definitely-not-installed", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Command { .. }), "{err}");
    }

    #[tokio::test]
    async fn failing_program_surfaces_stderr() {
        let err = run_local("sh", &["-c".into(), "echo boom >&2; exit 3".into()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
