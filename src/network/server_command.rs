/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::StreamConfig;
use crate::{config::ServerSettings, error::OrchestratorError, process_control::ProcessSpec};
use anyhow::Context;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Arguments selecting the serving mode, sources, ports and network flags for a set of streams.
/// One stream uses `serve` with direct flags; several use `serve-files`, sharing one condition
/// when they all agree and mapping mount to profile otherwise.
pub fn build_server_args(streams: &[StreamConfig], data_port: u16, control_port: u16) -> Vec<String> {
    let mut args = vec![];

    if let [stream] = streams {
        args.extend([
            "serve".to_string(),
            "-f".to_string(),
            stream.source.display().to_string(),
            "--port".to_string(),
            data_port.to_string(),
            "--api-port".to_string(),
            control_port.to_string(),
        ]);
        if stream.auto_repeat {
            args.push("--auto-repeat".to_string());
        }
        args.extend(stream.network.to_cli_args());
        return args;
    }

    args.extend([
        "serve-files".to_string(),
        "--port".to_string(),
        data_port.to_string(),
        "--api-port".to_string(),
        control_port.to_string(),
    ]);
    for stream in streams {
        args.push("-f".to_string());
        args.push(stream.source.display().to_string());
    }

    match streams.split_first() {
        Some((first, rest)) if rest.iter().all(|s| s.network == first.network) => {
            args.extend(first.network.to_cli_args());
        }
        _ => {
            let per_source: Vec<String> = streams
                .iter()
                .filter_map(|s| {
                    s.network
                        .profile
                        .as_ref()
                        .map(|profile| format!("{}:{}", s.mount_path(), profile))
                })
                .collect();
            if !per_source.is_empty() {
                args.push("--per-source-network".to_string());
                args.push(per_source.join(","));
            }
        }
    }
    args
}

/// Full process description for a server: the configured program and prefix arguments followed
/// by the generated ones.
pub fn server_spec(
    process_name: &str,
    settings: &ServerSettings,
    program: &str,
    cwd: Option<PathBuf>,
    streams: &[StreamConfig],
    data_port: u16,
    control_port: u16,
) -> ProcessSpec {
    let args = settings
        .args
        .iter()
        .cloned()
        .chain(build_server_args(streams, data_port, control_port));
    let spec = ProcessSpec::new(process_name, program, args);
    match cwd {
        Some(cwd) => spec.cwd(cwd),
        None => spec,
    }
}

/// Whether `binary` names a build artifact rather than something looked up on PATH.
fn is_artifact_path(binary: &str) -> bool {
    binary.contains(std::path::MAIN_SEPARATOR) || binary.contains('/')
}

/// Resolves the program to launch. A bare program name is used as is. An artifact path is reused
/// when it already exists; otherwise `build_command` is run in `cwd` and the artifact must exist
/// afterwards.
pub async fn ensure_binary(settings: &ServerSettings, cwd: &Path) -> anyhow::Result<String> {
    if !is_artifact_path(&settings.binary) {
        return Ok(settings.binary.clone());
    }

    let path = cwd.join(&settings.binary);
    if let Ok(existing) = std::fs::canonicalize(&path) {
        debug!("Reusing server binary {}", existing.display());
        return Ok(existing.display().to_string());
    }

    let Some(build_command) = &settings.build_command else {
        return Err(OrchestratorError::configuration(format!(
            "server binary {} does not exist and no build command is configured",
            path.display()
        )));
    };

    info!("Server binary {} missing, building: {}", path.display(), build_command);
    let words = shlex::split(build_command).ok_or_else(|| {
        OrchestratorError::configuration(format!(
            "build command is not POSIX compliant: {build_command}"
        ))
    })?;
    let Some((program, args)) = words.split_first() else {
        return Err(OrchestratorError::configuration("build command is empty"));
    };

    let status = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .status()
        .await
        .context(format!("Failed to run build command: {build_command}"))?;
    if !status.success() {
        return Err(OrchestratorError::configuration(format!(
            "build command '{build_command}' failed with {status}"
        )));
    }

    std::fs::canonicalize(&path)
        .map(|built| built.display().to_string())
        .map_err(|_| {
            OrchestratorError::configuration(format!(
                "build finished but {} still does not exist",
                path.display()
            ))
        })
}
