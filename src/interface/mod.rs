//! Line-delimited JSON front end for a [`JobManager`]: one request object per
//! input line, one response object per output line.

pub mod handlers;
pub mod request;

use crate::core::jobs::JobManager;
use crate::err::Result;
use crate::global_var::LOGGER;
use crate::interface::handlers::run_handler;
use crate::interface::request::{Envelope, Response};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

pub const BAD_REQUEST: &str = "BadRequest";

/// Parse and run one request line.
pub async fn handle_line(manager: &JobManager, line: &str) -> Response {
    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(e) => {
            // still echo the id when the line is at least a JSON object
            let id = serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|v| v.get("id").cloned());
            return Response::error(id, BAD_REQUEST, e.to_string());
        }
    };
    let op = envelope.request.op();
    LOGGER.debug(format!("Received request: {:?}", &envelope));
    match run_handler(manager, envelope.request).await {
        Ok(data) => Response::ok(envelope.id, data),
        Err(e) => {
            LOGGER.warn(format!("Request {} failed: {}", op, e));
            Response::from_job_error(envelope.id, &e)
        }
    }
}

/// Serve requests from `reader` until end of input. Requests run
/// concurrently, so responses may come back out of order; the optional
/// request `id` is echoed to correlate them.
pub async fn serve<R, W>(manager: Arc<JobManager>, reader: R, writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(mut line) = rx.recv().await {
            line.push('\n');
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    });

    let mut in_flight = JoinSet::new();
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let manager = manager.clone();
        let tx = tx.clone();
        in_flight.spawn(async move {
            let response = handle_line(&manager, &line).await;
            let encoded = serde_json::to_string(&response).unwrap_or_else(|e| {
                format!(
                    r#"{{"ok":false,"error":{{"kind":"Internal","message":"cannot encode response: {}"}}}}"#,
                    e
                )
            });
            if tx.send(encoded).await.is_err() {
                LOGGER.error("Response writer is gone, dropping response");
            }
        });
        while in_flight.try_join_next().is_some() {}
    }

    while in_flight.join_next().await.is_some() {}
    drop(tx);
    writer_task.await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::collaborators::{JsonResultExtractor, ScriptResolver};
    use crate::core::jobs::ManagerConfig;
    use crate::utilities::TmpDirGuard;
    use std::os::unix::fs::PermissionsExt;
    use tokio::io::BufReader;

    async fn manager(tmp: &TmpDirGuard) -> Arc<JobManager> {
        Arc::new(
            JobManager::open(
                ManagerConfig::new(tmp.join("state")),
                Arc::new(ScriptResolver::new(Some(tmp.to_path_buf()), None)),
                Arc::new(JsonResultExtractor),
            )
            .await
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn bad_lines_get_bad_request_responses() {
        let tmp = TmpDirGuard::new("interface_bad");
        let m = manager(&tmp).await;
        let r = handle_line(&m, "not json").await;
        assert_eq!(r.error.unwrap().kind, BAD_REQUEST);
        let r = handle_line(&m, r#"{"id": 3, "op": "nope"}"#).await;
        assert_eq!(r.id, Some(serde_json::json!(3)));
        assert!(!r.ok);
        let r = handle_line(&m, r#"{"op": "status", "job_id": "../etc"}"#).await;
        assert_eq!(r.error.unwrap().kind, "InvalidJobId");
        let r = handle_line(&m, r#"{"op": "status", "job_id": "00000000000000aa"}"#).await;
        assert_eq!(r.error.unwrap().kind, "JobNotFound");
        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn log_reports_total_line_count_beside_the_tail() {
        let tmp = TmpDirGuard::new("interface_log_total");
        let script = tmp.join("five.sh");
        std::fs::write(&script, "#!/bin/sh\nfor i in 1 2 3 4 5; do echo l$i; done\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let m = manager(&tmp).await;

        let r = handle_line(&m, r#"{"op": "submit", "script": "five.sh"}"#).await;
        let data = r.data.unwrap();
        let job_id = data["job_id"].as_str().unwrap().to_string();
        let id = crate::core::jobs::JobId::parse(&job_id).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(20);
        while !m.status(&id).await.unwrap().status.is_terminal() {
            assert!(std::time::Instant::now() < deadline);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let line = format!(r#"{{"op": "log", "job_id": "{}", "tail": 2}}"#, job_id);
        let data = handle_line(&m, &line).await.data.unwrap();
        assert_eq!(data["lines"], serde_json::json!(["l4", "l5"]));
        assert_eq!(data["total_lines"], serde_json::json!(5));
        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn serve_answers_every_line() {
        let tmp = TmpDirGuard::new("interface_serve");
        let script = tmp.join("ok.sh");
        std::fs::write(&script, "#!/bin/sh\necho done\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let m = manager(&tmp).await;

        let input = concat!(
            r#"{"id": 1, "op": "submit", "script": "ok.sh", "args": {"input": "abc"}}"#,
            "\n\n",
            r#"{"id": 2, "op": "list"}"#,
            "\n",
            "garbage\n",
        );
        let (client, server) = tokio::io::duplex(64 * 1024);
        serve(m.clone(), BufReader::new(input.as_bytes()), server)
            .await
            .unwrap();

        let mut out = String::new();
        let mut client = BufReader::new(client);
        loop {
            let mut line = String::new();
            let n = tokio::io::AsyncBufReadExt::read_line(&mut client, &mut line)
                .await
                .unwrap();
            if n == 0 {
                break;
            }
            out.push_str(&line);
        }
        let responses: Vec<Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(responses.len(), 3);
        let submit = responses.iter().find(|r| r["id"] == serde_json::json!(1)).unwrap();
        assert_eq!(submit["ok"], serde_json::json!(true));
        assert_eq!(submit["data"]["name"], serde_json::json!("ok_abc"));
        assert!(responses.iter().any(|r| r["error"]["kind"] == serde_json::json!(BAD_REQUEST)));
        m.shutdown().await.unwrap();
    }
}
