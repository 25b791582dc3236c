#![forbid(unsafe_code)]

//! `agent-intercept-ctl`: local CLI companion for `agent-intercept`.
//!
//! Connects to the IPC socket and sends JSON commands to the daemon.

use std::io::{BufRead, BufReader, Write};

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

use agent_intercept::client::info::Info;
use agent_intercept::ipc::server::{IpcRequest, IpcResponse};
use agent_intercept::models::intercept::InterceptSpec;
use agent_intercept::models::result::CreateInterceptRequest;

#[derive(Debug, Parser)]
#[command(
    name = "agent-intercept-ctl",
    about = "Local CLI for the agent-intercept daemon",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the daemon's `ipc_name` config).
    #[arg(long, default_value = "agent-intercept")]
    ipc_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the session's intercepts and ingests.
    List {
        /// Include IDs, mechanism and metadata.
        #[arg(long)]
        debug: bool,
    },

    /// Show the record of one intercept as JSON.
    Info {
        /// Intercept name.
        name: String,
    },

    /// Create an intercept and wait until it is active.
    Intercept {
        /// Workload to intercept.
        workload: String,
        /// Intercept name; defaults to the workload name.
        #[arg(long)]
        name: Option<String>,
        /// Port identifier (`<name|number>[/<TCP|UDP>]`) of the intercepted port.
        #[arg(long)]
        port: Option<String>,
        /// Service selecting the intercepted port.
        #[arg(long)]
        service: Option<String>,
        /// Container receiving the traffic.
        #[arg(long)]
        container: Option<String>,
        /// Local destination host.
        #[arg(long, default_value = "127.0.0.1")]
        target_host: String,
        /// Local destination port; defaults to the intercepted container port.
        #[arg(long, default_value_t = 0)]
        target_port: u16,
        /// Local directory to mount the remote volumes on.
        #[arg(long)]
        mount: Option<String>,
        /// Mount read-only.
        #[arg(long)]
        read_only: bool,
        /// Replace the app container instead of running alongside it.
        #[arg(long)]
        replace: bool,
    },

    /// Remove an intercept.
    Remove {
        /// Intercept name.
        name: String,
    },

    /// Remove every intercept and stop every handler.
    Leave,

    /// Register the local handler of an intercept or ingest.
    Interceptor {
        /// Intercept ID or `workload/container` ingest key.
        id: String,
        /// Handler process id.
        #[arg(long)]
        pid: Option<u32>,
        /// Handler container name or id.
        #[arg(long)]
        container: Option<String>,
    },

    /// Forget the handler of an intercept or ingest.
    DropInterceptor {
        /// Intercept ID or `workload/container` ingest key.
        id: String,
    },
}

fn build_request(command: Command) -> IpcRequest {
    match command {
        Command::List { debug } => IpcRequest {
            command: "list".into(),
            debug,
            ..IpcRequest::default()
        },
        Command::Info { name } => IpcRequest {
            command: "info".into(),
            name: Some(name),
            ..IpcRequest::default()
        },
        Command::Intercept {
            workload,
            name,
            port,
            service,
            container,
            target_host,
            target_port,
            mount,
            read_only,
            replace,
        } => IpcRequest {
            command: "intercept".into(),
            request: Some(CreateInterceptRequest {
                spec: InterceptSpec {
                    name: name.unwrap_or_else(|| workload.clone()),
                    agent: workload,
                    port_identifier: port.unwrap_or_default(),
                    service_name: service.unwrap_or_default(),
                    container_name: container.unwrap_or_default(),
                    target_host,
                    target_port,
                    replace,
                    ..InterceptSpec::default()
                },
                mount_point: mount.unwrap_or_default(),
                read_only,
                ..CreateInterceptRequest::default()
            }),
            ..IpcRequest::default()
        },
        Command::Remove { name } => IpcRequest {
            command: "remove".into(),
            name: Some(name),
            ..IpcRequest::default()
        },
        Command::Leave => IpcRequest {
            command: "leave".into(),
            ..IpcRequest::default()
        },
        Command::Interceptor { id, pid, container } => IpcRequest {
            command: "interceptor".into(),
            id: Some(id),
            pid,
            container,
            ..IpcRequest::default()
        },
        Command::DropInterceptor { id } => IpcRequest {
            command: "drop-interceptor".into(),
            id: Some(id),
            ..IpcRequest::default()
        },
    }
}

fn main() {
    let args = Cli::parse();
    let is_list = matches!(args.command, Command::List { .. });
    let debug = matches!(args.command, Command::List { debug: true });
    let request = build_request(args.command);

    match send_ipc_command(&args.ipc_name, &request) {
        Ok(response) if response.ok => match response.data {
            Some(data) if is_list => print_list(&data, debug),
            Some(data) => println!("{}", serde_json::to_string_pretty(&data).unwrap_or_default()),
            None => println!("OK"),
        },
        Ok(response) => {
            let err_msg = response.error.as_deref().unwrap_or("unknown error");
            eprintln!("Error: {err_msg}");
            std::process::exit(1);
        }
        Err(err) => {
            eprintln!("Failed to connect to daemon: {err}");
            eprintln!("Is agent-intercept running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
}

fn print_list(data: &serde_json::Value, debug: bool) {
    let intercepts: Vec<Info> = data
        .get("intercepts")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    if intercepts.is_empty() {
        println!("No intercepts");
    }
    for mut info in intercepts {
        info.debug = debug;
        print!("{}", info.render());
    }
    if let Some(ingests) = data.get("ingests").and_then(serde_json::Value::as_array) {
        for ingest in ingests {
            if let Some(key) = ingest.get("key").and_then(serde_json::Value::as_str) {
                println!("ingest {key}");
            }
        }
    }
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &IpcRequest,
) -> std::result::Result<IpcResponse, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: IpcResponse = serde_json::from_str(response_line.trim())?;
    Ok(response)
}
