//! overdrive wrapper entrypoint: launches the wrapped command, builds an
//! optimization request from the launch environment and hands it to the
//! agent, then waits for the command to finish.

mod config;
mod net;
mod request;

use crate::request::{now_ts, OptimizationRequest};
use std::collections::HashMap;
use std::process::Stdio;

/// Arguments after the wrapper's own flags are the command to launch.
fn split_command_args() -> (Option<String>, Vec<String>) {
    let mut profile = None;
    let mut command = Vec::new();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--profile" | "-p" => profile = args.next(),
            "--version" | "-V" => {}
            _ => {
                command.push(arg);
                command.extend(args.by_ref());
            }
        }
    }
    (profile, command)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    // only a leading flag counts: the wrapped command keeps its own flags
    if matches!(std::env::args().nth(1).as_deref(), Some("--version") | Some("-V")) {
        println!("overdrive {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let (arg_profile, command) = split_command_args();
    if command.is_empty() {
        eprintln!("Command not informed. Aborting...");
        std::process::exit(1);
    }

    let user_env: HashMap<String, String> = std::env::vars().collect();
    let inline_config = std::env::var("OVERDRIVE_CONFIG").ok().filter(|c| !c.trim().is_empty());
    let profile_add = std::env::var("OVERDRIVE_PROFILE_ADD").ok().filter(|c| !c.trim().is_empty());
    let profile = arg_profile
        .or_else(|| std::env::var("OVERDRIVE_PROFILE").ok())
        .filter(|p| !p.trim().is_empty());

    let cmd_str = command.join(" ");
    tracing::info!("launching command: {cmd_str}");

    let mut child = match tokio::process::Command::new(&command[0])
        .args(&command[1..])
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            eprintln!("An error occurred when launching: {cmd_str}");
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let uid = nix::unistd::Uid::current();
    let user_name = nix::unistd::User::from_uid(uid)
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_default();

    let request = OptimizationRequest {
        pid: child.id().map(|p| p as i32).unwrap_or(-1),
        command: cmd_str,
        user_name,
        profile: if inline_config.is_some() { None } else { profile },
        config: inline_config,
        profile_config: profile_add,
        user_env,
        created_at: now_ts(),
    };

    let endpoint = config::load(uid.as_raw()).await;
    let machine_id = if endpoint.encrypted_requests {
        let id = net::read_machine_id().await;
        if id.is_none() {
            tracing::warn!("encryption is disabled: machine id not available");
        }
        id
    } else {
        None
    };

    net::send(&request, &endpoint, machine_id.as_deref()).await?;

    // keep wrapping the command so launchers see its real lifetime
    let status = child.wait().await?;
    std::process::exit(status.code().unwrap_or(0));
}
