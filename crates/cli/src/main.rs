// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Photon CLI: a thin client over the daemon socket protocol.
//!
//! Every command here transits the wire protocol; nothing reaches daemon
//! internals any other way.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod client;

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use photon_core::{JobId, SessionId};
use photon_daemon::protocol::{Request, Response};
use serde_json::{Map, Value};
use tokio::io::AsyncBufReadExt;

use crate::client::DaemonClient;

#[derive(Parser)]
#[command(name = "photon", version, about = "Photon daemon client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon for a photon
    Start {
        photon: String,
        /// Photon source file (defaults to `<photon>.ts`)
        source: Option<PathBuf>,
    },
    /// Stop a running daemon
    Stop { photon: String },
    /// Check whether a daemon is running
    Status { photon: String },
    /// Invoke a method
    Call {
        photon: String,
        method: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        #[arg(long)]
        session: Option<String>,
        /// Call deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Acquire a named lock
    Lock {
        photon: String,
        name: String,
        #[arg(long)]
        session: String,
        /// Lease duration in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Queue instead of failing fast when held
        #[arg(long)]
        wait: bool,
    },
    /// Release a named lock
    Unlock {
        photon: String,
        name: String,
        #[arg(long)]
        session: String,
    },
    /// List live locks
    Locks { photon: String },
    /// Register a cron job
    Schedule {
        photon: String,
        job_id: String,
        method: String,
        cron: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Remove a cron job
    Unschedule { photon: String, job_id: String },
    /// List scheduled jobs
    Jobs { photon: String },
    /// Publish a message to a channel
    Publish {
        photon: String,
        channel: String,
        /// Message as JSON
        message: String,
    },
    /// Subscribe to a channel and stream messages
    Watch { photon: String, channel: String },
    /// Hot-reload the photon source
    Reload { photon: String, source: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Start { photon, source } => {
            let client = client::ensure_running(&photon, source.as_deref()).await?;
            let response = client
                .request(Request::Ping {
                    id: "start-ping".to_string(),
                })
                .await?;
            match response {
                Response::Pong { .. } => println!("{} is running", photon),
                other => bail!("unexpected response: {:?}", other),
            }
        }

        Command::Stop { photon } => {
            let client = DaemonClient::connect(&photon).await?;
            let id = client.next_id();
            print_response(client.request(Request::Shutdown { id }).await?)?;
        }

        Command::Status { photon } => match DaemonClient::connect(&photon).await {
            Ok(client) => {
                let id = client.next_id();
                match client.request(Request::Ping { id }).await {
                    Ok(Response::Pong { .. }) => println!("{}: running", photon),
                    _ => println!("{}: not responding", photon),
                }
            }
            Err(_) => println!("{}: not running", photon),
        },

        Command::Call {
            photon,
            method,
            args,
            session,
            timeout_ms,
        } => {
            let client = DaemonClient::connect(&photon).await?;
            let id = client.next_id();
            let request = Request::Command {
                id,
                method,
                args: parse_args(&args)?,
                session_id: session.map(SessionId::new),
                timeout: timeout_ms,
            };
            call_with_prompts(client, request).await?;
        }

        Command::Lock {
            photon,
            name,
            session,
            timeout_ms,
            wait,
        } => {
            let client = DaemonClient::connect(&photon).await?;
            let id = client.next_id();
            print_response(
                client
                    .request(Request::Lock {
                        id,
                        lock_name: name,
                        session_id: SessionId::new(session),
                        lock_timeout: timeout_ms,
                        wait,
                    })
                    .await?,
            )?;
        }

        Command::Unlock {
            photon,
            name,
            session,
        } => {
            let client = DaemonClient::connect(&photon).await?;
            let id = client.next_id();
            print_response(
                client
                    .request(Request::Unlock {
                        id,
                        lock_name: name,
                        session_id: SessionId::new(session),
                    })
                    .await?,
            )?;
        }

        Command::Locks { photon } => {
            let client = DaemonClient::connect(&photon).await?;
            let id = client.next_id();
            print_response(client.request(Request::ListLocks { id }).await?)?;
        }

        Command::Schedule {
            photon,
            job_id,
            method,
            cron,
            args,
        } => {
            let client = DaemonClient::connect(&photon).await?;
            let id = client.next_id();
            print_response(
                client
                    .request(Request::Schedule {
                        id,
                        job_id: JobId::new(job_id),
                        method,
                        cron,
                        args: parse_args(&args)?,
                    })
                    .await?,
            )?;
        }

        Command::Unschedule { photon, job_id } => {
            let client = DaemonClient::connect(&photon).await?;
            let id = client.next_id();
            print_response(
                client
                    .request(Request::Unschedule {
                        id,
                        job_id: JobId::new(job_id),
                    })
                    .await?,
            )?;
        }

        Command::Jobs { photon } => {
            let client = DaemonClient::connect(&photon).await?;
            let id = client.next_id();
            print_response(client.request(Request::ListJobs { id }).await?)?;
        }

        Command::Publish {
            photon,
            channel,
            message,
        } => {
            let client = DaemonClient::connect(&photon).await?;
            let id = client.next_id();
            let message: Value =
                serde_json::from_str(&message).context("message must be valid JSON")?;
            print_response(
                client
                    .request(Request::Publish {
                        id,
                        channel,
                        message,
                    })
                    .await?,
            )?;
        }

        Command::Watch { photon, channel } => {
            let mut client = DaemonClient::connect(&photon).await?;
            let id = client.next_id();
            print_response(
                client
                    .request(Request::Subscribe {
                        id,
                        channel: channel.clone(),
                        session_id: None,
                    })
                    .await?,
            )?;
            eprintln!("watching {:?} (ctrl-c to stop)", channel);
            while let Some(frame) = client.next_notification().await {
                if let Response::ChannelMessage { channel, message, .. } = frame {
                    println!(
                        "{}",
                        serde_json::json!({ "channel": channel, "message": message })
                    );
                }
            }
        }

        Command::Reload { photon, source } => {
            let client = DaemonClient::connect(&photon).await?;
            let id = client.next_id();
            print_response(
                client
                    .request(Request::Reload {
                        id,
                        photon_path: source,
                    })
                    .await?,
            )?;
        }
    }
    Ok(())
}

/// Await a command's result while answering any `prompt` frames from
/// stdin.
async fn call_with_prompts(mut client: DaemonClient, request: Request) -> anyhow::Result<()> {
    let mut pending = client.send(request)?;
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            response = &mut pending => {
                let response = response.map_err(|_| client::ClientError::ConnectionClosed)?;
                return print_response(response);
            }
            frame = client.next_notification() => {
                match frame {
                    Some(Response::Prompt { id, prompt }) => {
                        eprint!("{} ", prompt);
                        let answer = stdin.next_line().await?.unwrap_or_default();
                        client.send_nowait(Request::PromptResponse {
                            id,
                            prompt_value: Value::String(answer),
                        })?;
                    }
                    Some(_) => {}
                    None => bail!("connection closed"),
                }
            }
        }
    }
}

fn parse_args(raw: &str) -> anyhow::Result<Map<String, Value>> {
    serde_json::from_str(raw).context("args must be a JSON object")
}

fn print_response(response: Response) -> anyhow::Result<()> {
    match response {
        Response::Result { data, .. } => {
            println!("{}", serde_json::to_string_pretty(&data)?);
            Ok(())
        }
        Response::Pong { .. } => {
            println!("pong");
            Ok(())
        }
        Response::Error { error, kind, .. } => match kind {
            Some(kind) => bail!("{}: {}", kind, error),
            None => bail!("{}", error),
        },
        other => bail!("unexpected frame: {:?}", other),
    }
}
