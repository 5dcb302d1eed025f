use tokio::net::UnixStream;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use common::{ChangeSet, IpcRequest, IpcResponse, MonitorMessage, ResourceRecord, Severity, Snapshot};

#[derive(Parser)]
#[command(name = "driftwatch", about = "Control and watch the driftwatch agent")]
struct Cli {
    /// Agent socket
    #[arg(long, env = "DRIFTWATCH_SOCKET", default_value_t = common::default_socket_path())]
    socket: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start continuous monitoring
    Start,
    /// Stop continuous monitoring
    Stop,
    /// Show monitor status
    Status,
    /// Run one scan now and print the drift it found
    Scan,
    /// Subscribe and print updates as they arrive
    Watch {
        /// Ask for an immediate scan after subscribing
        #[arg(long)]
        force_scan: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start => print_message(send_request(&cli.socket, IpcRequest::Start).await?),
        Command::Stop => print_message(send_request(&cli.socket, IpcRequest::Stop).await?),
        Command::Status => print_status(send_request(&cli.socket, IpcRequest::Status).await?),
        Command::Scan => {
            println!("{}", "Scanning...".bright_yellow());
            print_scan(send_request(&cli.socket, IpcRequest::Scan).await?);
        }
        Command::Watch { force_scan } => watch(&cli.socket, force_scan).await?,
    }

    Ok(())
}

async fn send_request(socket_path: &str, request: IpcRequest) -> Result<IpcResponse> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("cannot reach agent at {} (is driftwatch-agent running?)", socket_path))?;
    let (reader, mut writer) = stream.into_split();

    let mut request_json = serde_json::to_string(&request)?;
    request_json.push('\n');
    writer.write_all(request_json.as_bytes()).await?;

    let Some(line) = BufReader::new(reader).lines().next_line().await? else {
        bail!("agent closed the connection without answering");
    };
    let response: IpcResponse = serde_json::from_str(&line)?;
    Ok(response)
}

fn print_error(response: &IpcResponse) {
    let reason = response.data.get("error")
        .or_else(|| response.data.get("message"))
        .and_then(|v| v.as_str())
        .unwrap_or("Unknown error");
    println!("{} {}", "✗ Error:".red().bold(), reason);
}

fn print_message(response: IpcResponse) {
    if !response.success {
        print_error(&response);
        return;
    }
    let message = response.data["message"].as_str().unwrap_or("?");
    println!("{} Monitoring {}", "✓".bright_green().bold(), message.bright_white().bold());
}

fn print_status(response: IpcResponse) {
    if !response.success {
        print_error(&response);
        return;
    }

    let data = &response.data;
    let running = data["running"].as_bool().unwrap_or(false);
    let state = if running { "running".bright_green().bold() } else { "idle".yellow().bold() };
    let last = data["lastScanTimestamp"]
        .as_str()
        .map(local_time)
        .unwrap_or_else(|| "never".to_string());

    println!("\n{}", "driftwatch status".bright_cyan().bold());
    println!("{}", "─".repeat(40).bright_cyan());
    println!("  {:18} {}", "State:".bright_cyan(), state);
    println!("  {:18} {}", "Subscribers:".bright_cyan(), data["subscriberCount"].as_u64().unwrap_or(0));
    println!("  {:18} {}s", "Scan interval:".bright_cyan(), data["scanInterval"].as_u64().unwrap_or(0));
    println!("  {:18} {}", "Last scan:".bright_cyan(), last.dimmed());
    println!();
}

fn print_scan(response: IpcResponse) {
    if !response.success {
        print_error(&response);
        return;
    }

    match serde_json::from_value::<Option<ChangeSet>>(response.data["changes"].clone()) {
        Ok(Some(changes)) => print_changes(&changes, None),
        Ok(None) => println!("{}", "No drift detected.".bright_green()),
        Err(e) => println!("{} {}", "✗ Unreadable change set:".red().bold(), e),
    }
}

async fn watch(socket_path: &str, force_scan: bool) -> Result<()> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("cannot reach agent at {}", socket_path))?;
    let (reader, mut writer) = stream.into_split();

    let mut request_json = serde_json::to_string(&IpcRequest::Subscribe)?;
    request_json.push('\n');
    writer.write_all(request_json.as_bytes()).await?;
    if force_scan {
        writer.write_all(b"{\"action\":\"force_scan\"}\n").await?;
    }

    println!("{}", "Connected, waiting for updates (Ctrl-C to quit)".bright_cyan());

    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    println!("{}", "Agent closed the connection".yellow());
                    break;
                };
                match serde_json::from_str::<MonitorMessage>(&line) {
                    Ok(message) => print_update(&message),
                    Err(e) => println!("{} {}", "✗ Unreadable update:".red(), e),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}

fn print_update(message: &MonitorMessage) {
    match message {
        MonitorMessage::InitialState { data, timestamp } => {
            println!("\n{} {}", "Current state".bright_cyan().bold(), local_time(timestamp).dimmed());
            print_snapshot(data);
        }
        MonitorMessage::ServiceScanComplete { service, data, timestamp } => {
            println!(
                "\n{} {} - {} resources {}",
                "Service scan completed:".bright_cyan(),
                service.bright_white().bold(),
                data.len(),
                local_time(timestamp).dimmed()
            );
            print_records(data);
        }
        MonitorMessage::ChangesDetected { changes, scan_duration, .. } => {
            print_changes(changes, Some(*scan_duration));
        }
        MonitorMessage::Error { error, .. } => {
            println!("{} {}", "✗ Error from agent:".red().bold(), error);
        }
    }
}

fn print_snapshot(snapshot: &Snapshot) {
    for service in snapshot.services() {
        let records = snapshot.records(service);
        println!("  {} {} resources", format!("{}:", service).bright_white().bold(), records.len());
        print_records(records);
    }
}

fn print_records(records: &[ResourceRecord]) {
    for record in records.iter().filter(|r| !r.misconfigurations.is_empty()) {
        println!("  Misconfigurations found in {}:", record.resource_id.bright_white());
        for finding in &record.misconfigurations {
            println!("    - {} {}: {}", severity_label(finding.severity), finding.kind, finding.description);
        }
    }
}

fn print_changes(changes: &ChangeSet, scan_duration: Option<f64>) {
    match scan_duration {
        Some(secs) => println!("\n{} (scan took {:.2} seconds)", "Changes detected".bright_yellow().bold(), secs),
        None => println!("\n{}", "Changes detected".bright_yellow().bold()),
    }

    for (service, service_changes) in changes.iter() {
        println!("  {}", format!("{} changes:", service).bright_white().bold());
        if !service_changes.new.is_empty() {
            println!("    {} {}", "New issues:".red(), service_changes.new.len());
            for record in &service_changes.new {
                println!("      + {}", record.resource_id);
            }
        }
        if !service_changes.resolved.is_empty() {
            println!("    {} {}", "Resolved issues:".green(), service_changes.resolved.len());
            for record in &service_changes.resolved {
                println!("      - {}", record.resource_id);
            }
        }
        if !service_changes.changed.is_empty() {
            println!("    {} {}", "Changed issues:".yellow(), service_changes.changed.len());
            for changed in &service_changes.changed {
                println!(
                    "      ~ {} ({} -> {} findings)",
                    changed.resource_id,
                    changed.previous.misconfigurations.len(),
                    changed.current.misconfigurations.len()
                );
            }
        }
    }
}

fn local_time(timestamp: &str) -> String {
    chrono::DateTime::parse_from_rfc3339(timestamp)
        .map(|ts| ts.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|_| timestamp.to_string())
}

fn severity_label(severity: Severity) -> ColoredString {
    match severity {
        Severity::High => "HIGH".bright_red().bold(),
        Severity::Medium => "MEDIUM".bright_yellow().bold(),
        Severity::Low => "LOW".bright_blue(),
    }
}
