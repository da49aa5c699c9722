mod calc;
mod db;
mod ipc;
mod rollup;
mod scale;
mod transcript;
mod weighting;

use serde_json::json;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    // stdout carries the protocol, so logs go to stderr.
    let filter =
        EnvFilter::try_from_env("GRADEBOOKD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .init();
}

fn main() {
    init_tracing();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "gradebookd starting");

    let mut state = ipc::AppState {
        workspace: None,
        db: None,
    };

    if let Ok(path) = std::env::var("GRADEBOOKD_WORKSPACE") {
        let path = PathBuf::from(path);
        match db::open_db(&path) {
            Ok(conn) => {
                tracing::info!(workspace = %path.display(), "workspace opened from environment");
                state.workspace = Some(path);
                state.db = Some(conn);
            }
            Err(e) => {
                tracing::error!(workspace = %path.display(), error = %e, "could not open workspace from environment");
            }
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed; shutting down");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                tracing::warn!(error = %e, "malformed request line");
                let _ = writeln!(
                    stdout,
                    "{}",
                    json!({ "ok": false, "error": { "code": "bad_json", "message": e.to_string() } })
                );
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }

    tracing::info!("gradebookd stopped");
}
