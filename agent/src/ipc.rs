use crate::monitor::{Monitor, ScanOutcome};
use crate::hub::SubscriberId;
use common::{ClientCommand, IpcRequest, IpcResponse, MonitorMessage, ScanReport, StatusReport};
use anyhow::Result;
use tokio::net::{UnixListener, UnixStream};
use tokio::net::unix::OwnedReadHalf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use log::{info, error, warn, debug};
use std::sync::Arc;

pub async fn start_ipc_server(monitor: Arc<Monitor>, socket_path: String, start_on_subscribe: bool) -> Result<()> {
    // Remove old socket if exists
    let _ = std::fs::remove_file(&socket_path);

    if let Some(parent) = std::path::Path::new(&socket_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let listener = UnixListener::bind(&socket_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o660);
        std::fs::set_permissions(&socket_path, perms)?;
    }

    info!("IPC server listening on {}", socket_path);

    tokio::spawn(serve(listener, monitor, start_on_subscribe));

    Ok(())
}

async fn serve(listener: UnixListener, monitor: Arc<Monitor>, start_on_subscribe: bool) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let monitor = monitor.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, monitor, start_on_subscribe).await {
                        error!("Client error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Accept error: {}", e);
            }
        }
    }
}

async fn handle_client(stream: UnixStream, monitor: Arc<Monitor>, start_on_subscribe: bool) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let Some(request_line) = lines.next_line().await? else {
        return Ok(());
    };
    info!("IPC request: {}", request_line.trim());

    let response = match serde_json::from_str::<IpcRequest>(&request_line) {
        Ok(IpcRequest::Subscribe) => {
            return serve_subscriber(lines, writer, monitor, start_on_subscribe).await;
        }
        Ok(req) => handle_request(req, &monitor).await,
        Err(e) => {
            warn!("Invalid request: {}", e);
            IpcResponse {
                success: false,
                data: serde_json::json!({"error": format!("Invalid request: {}", e)}),
            }
        }
    };

    let response_json = serde_json::to_string(&response)?;
    writer.write_all(response_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    Ok(())
}

async fn handle_request(req: IpcRequest, monitor: &Arc<Monitor>) -> IpcResponse {
    match req {
        IpcRequest::Start => {
            let outcome = monitor.start().await;
            message_response(true, outcome.message())
        }
        IpcRequest::Stop => {
            let outcome = monitor.stop().await;
            message_response(true, outcome.message())
        }
        IpcRequest::Status => {
            let report = StatusReport::from(monitor.status());
            IpcResponse {
                success: true,
                data: serde_json::to_value(report).unwrap_or_default(),
            }
        }
        IpcRequest::Scan => handle_scan(monitor).await,
        IpcRequest::Subscribe => message_response(false, "subscribe must be the first request on a connection"),
    }
}

async fn handle_scan(monitor: &Arc<Monitor>) -> IpcResponse {
    let (success, report) = match monitor.force_scan().await {
        ScanOutcome::Completed { changes, completed_at } => (
            true,
            ScanReport {
                message: "scan completed".to_string(),
                changes: (!changes.is_empty()).then_some(changes),
                timestamp: completed_at.to_rfc3339(),
            },
        ),
        ScanOutcome::NotRunning => (
            false,
            ScanReport {
                message: "not running".to_string(),
                changes: None,
                timestamp: common::now_rfc3339(),
            },
        ),
        ScanOutcome::Cancelled => (
            false,
            ScanReport {
                message: "scan cancelled".to_string(),
                changes: None,
                timestamp: common::now_rfc3339(),
            },
        ),
        ScanOutcome::Failed(reason) => (
            false,
            ScanReport {
                message: format!("scan failed: {}", reason),
                changes: None,
                timestamp: common::now_rfc3339(),
            },
        ),
    };

    IpcResponse {
        success,
        data: serde_json::to_value(report).unwrap_or_default(),
    }
}

fn message_response(success: bool, message: &str) -> IpcResponse {
    IpcResponse {
        success,
        data: serde_json::json!({ "message": message }),
    }
}

async fn serve_subscriber(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    mut writer: tokio::net::unix::OwnedWriteHalf,
    monitor: Arc<Monitor>,
    start_on_subscribe: bool,
) -> Result<()> {
    let subscription = monitor.connect();
    let id = subscription.id;
    let mut messages = subscription.messages;

    if start_on_subscribe && !monitor.is_running() {
        info!("Starting monitoring via subscriber {}", id);
        let monitor = monitor.clone();
        tokio::spawn(async move {
            monitor.start().await;
        });
    }

    let mut writer_task = tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            let mut line = serde_json::to_string(&*message)?;
            line.push('\n');
            writer.write_all(line.as_bytes()).await?;
        }
        Ok::<_, anyhow::Error>(())
    });

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_command(&line, id, &monitor),
                Ok(None) => break,
                Err(e) => {
                    warn!("Subscriber {} read error: {}", id, e);
                    break;
                }
            },
            written = &mut writer_task => {
                if let Ok(Err(e)) = written {
                    debug!("Subscriber {} write failed: {}", id, e);
                }
                break;
            }
        }
    }

    monitor.disconnect(id);
    writer_task.abort();
    Ok(())
}

fn handle_command(line: &str, id: SubscriberId, monitor: &Arc<Monitor>) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    debug!("Subscriber {} sent: {}", id, line);

    match serde_json::from_str::<ClientCommand>(line) {
        Ok(ClientCommand::ForceScan) => {
            info!("Received force_scan command from subscriber {}", id);
            let monitor = monitor.clone();
            tokio::spawn(async move {
                // results reach every subscriber through the cycle broadcasts
                match monitor.force_scan().await {
                    ScanOutcome::NotRunning => {
                        monitor.send_to(id, MonitorMessage::error("monitoring is not running"));
                    }
                    ScanOutcome::Failed(reason) => {
                        monitor.send_to(id, MonitorMessage::error(format!("scan failed: {}", reason)));
                    }
                    ScanOutcome::Completed { .. } | ScanOutcome::Cancelled => {}
                }
            });
        }
        Err(e) => {
            warn!("Invalid command from subscriber {}: {}", id, e);
            monitor.send_to(id, MonitorMessage::error(format!("Invalid command: {}", e)));
        }
    }
}
