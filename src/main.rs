mod aggregate;
mod classify;
mod config;
mod db;
mod engine;
mod grading;
mod ipc;
mod logging;
mod ranking;
mod report;
mod school;
mod sources;
mod store;

use std::io::{self, BufRead, Write};

use serde_json::json;
use tracing::{debug, error, warn};

fn main() {
    if let Err(e) = logging::init_logging() {
        eprintln!("termreportd: logging disabled: {e}");
    }

    let mut state = ipc::AppState::new();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => {
                debug!(id = %req.id, method = %req.method, "request");
                ipc::handle_request(&mut state, req)
            }
            Err(e) => {
                // No id to echo back.
                warn!(error = %e, "unparseable request line");
                json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                })
            }
        };

        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
