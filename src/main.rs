mod calc;
mod db;
mod ipc;
mod schema;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    // stdout carries the protocol, so logs go to stderr.
    let filter = std::env::var("ACADEMYD_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}

fn reply(out: &mut impl Write, line: &str) -> io::Result<()> {
    writeln!(out, "{}", line)?;
    out.flush()
}

fn main() {
    init_logging();

    let mut state = ipc::AppState::default();
    if let Some(path) = std::env::var_os("ACADEMYD_WORKSPACE").map(PathBuf::from) {
        if let Err(e) = ipc::open_workspace(&mut state, &path) {
            tracing::error!("could not open {}: {e:#}", path.to_string_lossy());
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("bad request line: {}", e);
                // No id to echo back.
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                if let Err(e) = reply(&mut stdout, &resp.to_string()) {
                    tracing::error!("stdout closed: {}", e);
                    break;
                }
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let line =
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string());
        if let Err(e) = reply(&mut stdout, &line) {
            tracing::error!("stdout closed: {}", e);
            break;
        }
    }
}
