//! Minimal stdio MCP server for integration tests.
//!
//! Speaks newline-delimited JSON-RPC on stdin/stdout. Tools:
//! - `read_file { path }`: returns the file's contents
//! - `slow_echo { text, delay_ms }`: echoes `text` after sleeping
//!
//! Resources: `fixture://readme` (text) and `fixture://logo` (blob).
//!
//! Environment:
//! - `FIXTURE_PID_FILE`: write this process's pid here on startup
//! - `FIXTURE_TOOLS`: comma-separated subset of tools to advertise

use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

const PROTOCOL_VERSION: &str = "2025-03-26";
const README_TEXT: &str = "The fixture server exposes read_file and slow_echo.";

type Stdout = Arc<Mutex<std::io::Stdout>>;

fn send(out: &Stdout, message: &Value) {
    if let Ok(mut out) = out.lock() {
        let _ = writeln!(out, "{message}");
        let _ = out.flush();
    }
}

fn result(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error(id: &Value, code: i32, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

fn text_result(text: &str, is_error: bool) -> Value {
    json!({"content": [{"type": "text", "text": text}], "isError": is_error})
}

fn advertised_tools() -> Vec<&'static str> {
    let all = ["read_file", "slow_echo"];
    match std::env::var("FIXTURE_TOOLS") {
        Ok(list) => all
            .into_iter()
            .filter(|t| list.split(',').any(|w| w.trim() == *t))
            .collect(),
        Err(_) => all.to_vec(),
    }
}

fn tool_descriptor(name: &str) -> Value {
    match name {
        "read_file" => json!({
            "name": "read_file",
            "description": "Read a UTF-8 text file",
            "inputSchema": {
                "type": "object",
                "properties": {"path": {"type": "string", "description": "Absolute path"}},
                "required": ["path"]
            }
        }),
        _ => json!({
            "name": "slow_echo",
            "description": "Echo text after a delay",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "text": {"type": "string"},
                    "delay_ms": {"type": "integer"}
                },
                "required": ["text"]
            }
        }),
    }
}

fn call_tool(id: Value, params: &Value, out: Stdout) {
    let name = params["name"].as_str().unwrap_or_default().to_string();
    let args = params.get("arguments").cloned().unwrap_or(Value::Null);

    if !advertised_tools().contains(&name.as_str()) {
        send(&out, &error(&id, -32602, &format!("unknown tool: {name}")));
        return;
    }

    match name.as_str() {
        "read_file" => {
            let path = args["path"].as_str().unwrap_or_default();
            let reply = match std::fs::read_to_string(path) {
                Ok(text) => text_result(&text, false),
                Err(e) => text_result(&format!("cannot read {path}: {e}"), true),
            };
            send(&out, &result(&id, reply));
        }
        _ => {
            let text = args["text"].as_str().unwrap_or_default().to_string();
            let delay = args["delay_ms"].as_u64().unwrap_or(0);
            // Sleep off the main loop so other requests keep flowing.
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(delay));
                send(&out, &result(&id, text_result(&text, false)));
            });
        }
    }
}

fn handle(message: Value, out: &Stdout) {
    let Some(method) = message.get("method").and_then(Value::as_str) else {
        return;
    };
    // Notifications carry no id and get no reply.
    let Some(id) = message.get("id").cloned() else {
        return;
    };
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    let reply = match method {
        "initialize" => result(
            &id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}, "resources": {}},
                "serverInfo": {"name": "mcp-fixture-server", "version": env!("CARGO_PKG_VERSION")}
            }),
        ),
        "ping" => result(&id, json!({})),
        "tools/list" => {
            let tools: Vec<Value> = advertised_tools().into_iter().map(tool_descriptor).collect();
            result(&id, json!({"tools": tools}))
        }
        "tools/call" => {
            call_tool(id, &params, Arc::clone(out));
            return;
        }
        "resources/list" => result(
            &id,
            json!({"resources": [
                {"uri": "fixture://readme", "name": "readme", "mimeType": "text/plain"},
                {"uri": "fixture://logo", "name": "logo", "mimeType": "image/png"}
            ]}),
        ),
        "resources/read" => match params["uri"].as_str() {
            Some("fixture://readme") => result(
                &id,
                json!({"contents": [{"uri": "fixture://readme", "mimeType": "text/plain", "text": README_TEXT}]}),
            ),
            Some("fixture://logo") => result(
                &id,
                json!({"contents": [{"uri": "fixture://logo", "mimeType": "image/png", "blob": "iVBORw0KGgo="}]}),
            ),
            _ => error(&id, -32002, "resource not found"),
        },
        other => error(&id, -32601, &format!("method not found: {other}")),
    };
    send(out, &reply);
}

fn main() {
    if let Ok(path) = std::env::var("FIXTURE_PID_FILE") {
        let _ = std::fs::write(path, std::process::id().to_string());
    }
    eprintln!("mcp-fixture-server started");

    let out: Stdout = Arc::new(Mutex::new(std::io::stdout()));
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(message) => handle(message, &out),
            Err(_) => send(&out, &error(&Value::Null, -32700, "parse error")),
        }
    }
}
