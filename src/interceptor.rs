//! Step-Side Interceptor
//!
//! Runs inside every nested job as the `pre` and `post` steps around the
//! user step, holding it at the stage checkpoints until the orchestrator
//! releases it.
//!
//! | Slot | Hook | Behaviour |
//! |------|------|-----------|
//! | `pre` | pre | export host env, link working dir, wait for Pre, print `Pre::Start` |
//! | `pre` | main | print `Pre::End`, wait for the step's Main trigger, print `Main::Start` |
//! | `post` | main | print `Main::End`, wait for Post, print `Post::Start` |
//!
//! Only the wait for the Pre stage is bounded by the configured timeout:
//! the orchestrator signals it right after launching the runner. The Main
//! trigger of a step arrives once its dependencies finished, and Post
//! arrives once the rest of the enclosing job finished, so both wait as
//! long as it takes.

use std::path::Path;
use std::str::FromStr;

use log::{debug, info};

use crate::config::InterceptorConfig;
use crate::environment::JobContext;
use crate::error::{ConfigError, RunnerError};
use crate::monitoring::{LifecycleMarker, MarkerKind};
use crate::sync::{wait_for_trigger, FileMailbox, TriggerKey, TriggerMessage};
use crate::workflow::document::SKIP_GUARD_VARIABLE;
use crate::workflow::Stage;

/// Lifecycle hook of the interceptor action being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Pre,
    Main,
}

impl FromStr for Hook {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre" => Ok(Hook::Pre),
            "main" => Ok(Hook::Main),
            _ => Err(format!("Unknown interceptor hook: {}", s)),
        }
    }
}

/// Runs one interceptor hook.
pub async fn run_hook(
    hook: Hook,
    config: &InterceptorConfig,
    context: &mut dyn JobContext,
) -> Result<(), RunnerError> {
    let slot = match Stage::from_str(&config.step) {
        Ok(stage) if stage != Stage::Main => stage,
        _ => {
            return Err(ConfigError::Invalid {
                name: "step".to_string(),
                message: format!("Unexpected step: {}", config.step),
            }
            .into())
        }
    };
    let mailbox = FileMailbox::new(&config.temp_dir);
    debug!("Interceptor {:?} hook of {} slot for {}", hook, slot, config.job_id);

    match (slot, hook) {
        (Stage::Pre, Hook::Pre) => {
            for (name, value) in &config.host_env {
                context.export_variable(name, value)?;
            }
            if let Some(host_dir) = &config.host_working_dir {
                link_working_directory(host_dir)?;
            }

            let key = TriggerKey::stage(Stage::Pre);
            wait_for_trigger(&mailbox, &key, config.timeout).await?;
            print_marker(context, Stage::Pre, MarkerKind::Start);
        }
        (Stage::Pre, Hook::Main) => {
            print_marker(context, Stage::Pre, MarkerKind::End);

            let key = TriggerKey::step(Stage::Main, config.job_id.clone());
            let message = wait_for_trigger(&mailbox, &key, None).await?;
            if message == TriggerMessage::Skip {
                info!("Skipping step");
                context.export_variable(SKIP_GUARD_VARIABLE, "true")?;
            }
            print_marker(context, Stage::Main, MarkerKind::Start);
        }
        (Stage::Post, Hook::Main) => {
            print_marker(context, Stage::Main, MarkerKind::End);

            let key = TriggerKey::stage(Stage::Post);
            wait_for_trigger(&mailbox, &key, None).await?;
            print_marker(context, Stage::Post, MarkerKind::Start);
        }
        // The post slot has nothing to do before the user step
        _ => {}
    }
    Ok(())
}

fn print_marker(context: &mut dyn JobContext, stage: Stage, kind: MarkerKind) {
    context.write_line(&LifecycleMarker::new(stage, kind).to_string());
}

/// Replaces the nested job's working directory with a link to the host one.
#[cfg(unix)]
fn link_working_directory(host_dir: &Path) -> std::io::Result<()> {
    let job_dir = std::env::current_dir()?;
    if job_dir == host_dir {
        return Ok(());
    }

    std::fs::remove_dir_all(&job_dir)?;
    std::os::unix::fs::symlink(host_dir, &job_dir)?;
    debug!("Linked {} to {}", job_dir.display(), host_dir.display());
    Ok(())
}

#[cfg(not(unix))]
fn link_working_directory(host_dir: &Path) -> std::io::Result<()> {
    debug!("Working directory linking unsupported, keeping {}", host_dir.display());
    Ok(())
}
