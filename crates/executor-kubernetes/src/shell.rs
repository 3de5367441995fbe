//! Scripts mounted into the pod and the commands that launch them.

use thiserror::Error;

pub const DETECT_SHELL_SCRIPT_NAME: &str = "detect_shell_script";

/// Candidate shells, tried in order by the detect script.
const SHELL_CANDIDATES: &[&str] = &[
    "/usr/local/bin/bash",
    "/usr/bin/bash",
    "/bin/bash",
    "/usr/local/bin/sh",
    "/usr/bin/sh",
    "/bin/sh",
    "/busybox/sh",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShellError {
    #[error("shell {0:?} requires a script file and cannot be fed through attach")]
    NeedsScriptFile(String),

    #[error("shell {0:?} is not supported")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    Bash,
    Sh,
}

impl Shell {
    pub fn from_name(name: &str) -> Result<Self, ShellError> {
        match name {
            "" | "bash" => Ok(Shell::Bash),
            "sh" => Ok(Shell::Sh),
            "pwsh" | "powershell" => Err(ShellError::NeedsScriptFile(name.to_string())),
            other => Err(ShellError::Unsupported(other.to_string())),
        }
    }

    fn prelude(&self) -> &'static str {
        match self {
            Shell::Bash => "set -eo pipefail\n",
            Shell::Sh => "set -e\n",
        }
    }
}

/// Finds a usable shell in the image and execs it with the given arguments.
pub fn detect_shell_script() -> String {
    let mut script = String::new();
    for shell in SHELL_CANDIDATES {
        script.push_str(&format!("if [ -x {shell} ]; then\n\texec {shell} $@\nfi\n"));
    }
    script.push_str("echo shell not found\nexit 1\n");
    script
}

/// Arguments for the build and helper containers: a shell that reads commands from stdin.
pub fn container_args() -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        detect_shell_script().replace("$@", ""),
    ]
}

/// Wrap a stage body so its exit status is printed as a marker line when it ends.
pub fn stage_script(shell: Shell, path: &str, body: &str) -> String {
    format!(
        "trap 'printf '\\''{{\"command_exit_code\": %d, \"script\": \"%s\"}}\\n'\\'' $? \"{path}\"' EXIT\n{}{}\n",
        shell.prelude(),
        body.trim_end()
    )
}

/// Where the scripts configmap is mounted and what each file is called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLayout {
    dir: String,
}

impl ScriptLayout {
    pub fn new(base_dir: &str, project_id: i64, job_id: i64) -> Self {
        let dir = if base_dir.is_empty() {
            format!("/scripts-{}-{}", project_id, job_id)
        } else {
            format!("{}/scripts", base_dir.trim_end_matches('/'))
        };
        Self { dir }
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// Configmap key for a stage. Keys only allow `[-._a-zA-Z0-9]`.
    pub fn stage_key(stage: &str) -> String {
        stage
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    pub fn stage_path(&self, stage: &str) -> String {
        format!("{}/{}", self.dir, Self::stage_key(stage))
    }

    pub fn detect_shell_path(&self) -> String {
        format!("{}/{}", self.dir, DETECT_SHELL_SCRIPT_NAME)
    }

    /// Line written to the container's stdin to start a stage in the background.
    pub fn attach_command(&self, stage: &str) -> String {
        format!(
            "sh -c '({} {}) 2>&1 &'\n",
            self.detect_shell_path(),
            self.stage_path(stage)
        )
    }
}
