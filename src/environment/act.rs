//! Nested Runner Integration
//!
//! Installs and drives `gh act`, the nested workflow runner:
//! - Installing the pinned `gh act` extension
//! - Writing the local interceptor action the nested jobs call back into
//! - Launching the runner detached with its output in the log file
//! - Terminating it once the last stage is done

use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

use log::{debug, info, warn};
use sysinfo::{Pid, System};

use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::workflow::document::INTERCEPTOR_ACTION;

/// Pinned version of the `gh act` extension.
pub const GH_ACT_VERSION: &str = "0.2.79";

const GH_ACT_REPOSITORY: &str = "https://github.com/nektos/gh-act";

/// Creates a `gh` command authenticated with the given token.
fn gh_command(token: &str) -> Command {
    let mut cmd = Command::new("gh");
    cmd.env("GH_TOKEN", token);
    cmd
}

fn run_checked(cmd: &mut Command, what: &str) -> Result<(), RunnerError> {
    let status = cmd
        .status()
        .map_err(|e| RunnerError::Launch(format!("{}: {}", what, e)))?;
    if !status.success() {
        return Err(RunnerError::Launch(format!(
            "{} exited with {:?}",
            what,
            status.code()
        )));
    }
    Ok(())
}

/// Installs the pinned `gh act` extension and prints its version.
pub fn install(token: &str) -> Result<(), RunnerError> {
    let tag = format!("v{}", GH_ACT_VERSION);
    info!("Installing gh cli extension nektos/gh-act@{} ...", tag);

    run_checked(
        gh_command(token).args(["extension", "install", GH_ACT_REPOSITORY, "--pin", &tag]),
        "gh extension install",
    )?;
    run_checked(gh_command(token).args(["act", "--version"]), "gh act --version")
}

/// Writes the local interceptor action into `dir`.
///
/// Both hooks re-enter this executable as `interceptor pre` and
/// `interceptor main`; the action inputs reach it as `INPUT_*` variables.
pub fn write_interceptor_action(dir: &Path, executable: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;

    let action = r#"name: steps-interceptor
description: Holds a nested step at the stage checkpoints of the enclosing runner
inputs:
  step:
    required: true
  temp-dir:
    required: true
  job-id:
    required: true
  timeout:
    required: false
    default: "30"
  host-working-directory:
    required: false
  host-env:
    required: false
runs:
  using: node20
  pre: pre.js
  main: main.js
"#;
    fs::write(dir.join("action.yml"), action)?;

    let executable = serde_json::to_string(&executable.to_string_lossy())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    for hook in ["pre", "main"] {
        let script = format!(
            "const {{ execFileSync }} = require('node:child_process');\n\
             try {{\n  execFileSync({}, ['interceptor', '{}'], {{ stdio: 'inherit' }});\n}} catch (error) {{\n  process.exit(error.status ?? 1);\n}}\n",
            executable, hook
        );
        fs::write(dir.join(format!("{}.js", hook)), script)?;
    }

    debug!("Interceptor action written to {}", dir.display());
    Ok(())
}

/// Arguments of the nested runner invocation.
pub fn launch_args(config: &RunnerConfig, step_count: usize) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "act".into(),
        "--workflows".into(),
        config.workflow_path().to_string_lossy().into_owned(),
        "--concurrent-jobs".into(),
        step_count.to_string(),
        // Work in place instead of copying the working directory
        "--bind".into(),
        "--platform".into(),
        "host=-self-hosted".into(),
        "--local-repository".into(),
        format!(
            "{}={}",
            INTERCEPTOR_ACTION,
            config.interceptor_dir().to_string_lossy()
        ),
    ];

    if let Some(event_path) = &config.event_path {
        args.extend(["--eventpath".into(), event_path.clone()]);
    }
    if let Some(actor) = &config.actor {
        args.extend(["--actor".into(), actor.clone()]);
    }
    args.extend([
        "--secret".into(),
        format!("GITHUB_TOKEN={}", config.token),
        "--no-skip-checkout".into(),
    ]);
    for (key, value) in &config.injected_env {
        args.extend(["--env".into(), format!("{}={}", key, value)]);
    }
    args.extend(["--action-offline-mode".into(), "--json".into()]);
    args
}

/// Launches the nested runner detached, appending its output to the log file.
///
/// Returns the runner's pid.
pub fn launch(config: &RunnerConfig, step_count: usize) -> Result<u32, RunnerError> {
    let log = File::options()
        .create(true)
        .append(true)
        .open(config.log_path())?;

    let mut cmd = gh_command(&config.token);
    cmd.args(launch_args(config, step_count))
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group, so the runner outlives this stage
        cmd.process_group(0);
    }

    let child = cmd
        .spawn()
        .map_err(|e| RunnerError::Launch(format!("gh act: {}", e)))?;
    let pid = child.id();
    info!("Nested runner started (pid {})", pid);
    Ok(pid)
}

/// Best-effort termination of the nested runner. Failures are only logged.
pub fn terminate(pid: u32) {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    if !system.refresh_process(pid) {
        debug!("Nested runner {} already exited", pid);
        return;
    }

    match system.process(pid) {
        Some(process) if process.kill() => info!("Nested runner {} terminated", pid),
        Some(_) => warn!("Failed to terminate nested runner {}", pid),
        None => debug!("Nested runner {} already exited", pid),
    }
}
