//! A minimal stdio MCP server used by the integration tests and demos.
//!
//! Announces readiness on stderr, then answers initialize, tools/list,
//! tools/call and resources/* over newline-delimited JSON-RPC. Behavior
//! knobs via environment:
//! - `MOCK_TOOLS` — comma-separated tool names (default `read_file`)
//! - `MOCK_SCHEME` — URI scheme for listed resources (default `mock`)
//! - `MOCK_SLEEP_MS` — delay before every response
//! Calling the tool named `crash` terminates the process.

use std::io::{self, BufRead, Write};

use serde_json::{json, Value};

fn main() {
    eprintln!("mock upstream server started");

    let tools: Vec<String> = std::env::var("MOCK_TOOLS")
        .unwrap_or_else(|_| "read_file".to_string())
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    let scheme = std::env::var("MOCK_SCHEME").unwrap_or_else(|_| "mock".to_string());
    let sleep_ms: u64 = std::env::var("MOCK_SLEEP_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let request: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        if id.is_null() {
            continue; // notification
        }

        if sleep_ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
        }

        let method = request["method"].as_str().unwrap_or("");
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        let response = match method {
            "initialize" => ok(
                &id,
                json!({
                    "protocolVersion": params
                        .get("protocolVersion")
                        .and_then(Value::as_str)
                        .unwrap_or("2025-03-26"),
                    "capabilities": { "tools": {}, "resources": {} },
                    "serverInfo": { "name": "mock-upstream", "version": env!("CARGO_PKG_VERSION") },
                }),
            ),
            "tools/list" => {
                let defs: Vec<Value> = tools
                    .iter()
                    .map(|name| {
                        json!({
                            "name": name,
                            "description": format!("mock tool {}", name),
                            "inputSchema": { "type": "object" },
                        })
                    })
                    .collect();
                ok(&id, json!({ "tools": defs }))
            }
            "tools/call" => {
                let name = params["name"].as_str().unwrap_or("");
                if name == "crash" {
                    std::process::exit(3);
                }
                let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
                ok(
                    &id,
                    json!({
                        "content": [{
                            "type": "text",
                            "text": format!("{} executed", name),
                        }],
                        "echo": { "name": name, "arguments": arguments },
                        "isError": false,
                    }),
                )
            }
            "resources/list" => ok(
                &id,
                json!({
                    "resources": [{
                        "uri": format!("{}://item/1", scheme),
                        "name": "item-1",
                        "mimeType": "text/plain",
                    }],
                }),
            ),
            "resources/read" => ok(
                &id,
                json!({
                    "contents": [{
                        "uri": params["uri"].as_str().unwrap_or(""),
                        "mimeType": "text/plain",
                        "text": "mock resource body",
                    }],
                }),
            ),
            other => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("method not found: {}", other) },
            }),
        };

        let mut payload = response.to_string();
        payload.push('\n');
        if out.write_all(payload.as_bytes()).is_err() || out.flush().is_err() {
            break;
        }
    }
}

fn ok(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}
