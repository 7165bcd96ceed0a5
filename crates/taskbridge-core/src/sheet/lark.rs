//! Lark Bitable gateway, speaking JSON-RPC to the vendor broker subprocess.
//!
//! The vendor ships a stdio broker that fronts the Bitable, contact, and
//! messaging APIs. This gateway spawns it once, performs the initialize
//! handshake, and serializes tool calls over the pipe. Calls are
//! line-delimited JSON-RPC 2.0; notifications interleaved with responses
//! are skipped while waiting for a matching id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    JsonMap, MessageTarget, RecordQuery, SheetFieldDef, SheetGateway, SheetRecord, SheetTableInfo,
};
use crate::config::SheetConfig;
use crate::gateway::GatewayError;
use crate::model::{SheetRecordRef, SheetTableRef};

const PROTOCOL_VERSION: &str = "2024-11-05";
const DEFAULT_PAGE_SIZE: u32 = 100;

struct BrokerIo {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// Lark implementation of [`SheetGateway`].
pub struct LarkSheet {
    io: Mutex<BrokerIo>,
    use_oauth: bool,
    deadline: Duration,
    next_id: AtomicU64,
}

impl LarkSheet {
    /// Spawns the broker subprocess and performs the initialize handshake.
    ///
    /// # Errors
    ///
    /// Returns `Transient` when the broker cannot be spawned or does not
    /// answer the handshake, `Unauthorized` when it rejects the credentials.
    pub async fn spawn(cfg: &SheetConfig) -> Result<Self, GatewayError> {
        let mut command = Command::new("npx");
        command
            .arg("-y")
            .arg("@larksuiteoapi/lark-mcp")
            .arg("mcp")
            .arg("-a")
            .arg(&cfg.app_id)
            .arg("-s")
            .arg(cfg.app_secret.expose_secret())
            .arg("-d")
            .arg(&cfg.domain);
        if cfg.use_oauth {
            command.arg("--oauth");
        }
        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|err| GatewayError::Transient(format!("broker spawn failed: {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::Transient("broker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Transient("broker stdout unavailable".into()))?;

        let gateway = Self {
            io: Mutex::new(BrokerIo {
                child,
                stdin,
                stdout: BufReader::new(stdout).lines(),
            }),
            use_oauth: cfg.use_oauth,
            deadline: cfg.deadline,
            next_id: AtomicU64::new(0),
        };
        gateway.initialize().await?;
        Ok(gateway)
    }

    async fn initialize(&self) -> Result<(), GatewayError> {
        self.rpc(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "taskbridge",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )
        .await?;

        let mut io = self.io.lock().await;
        let note = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" });
        write_line(&mut io.stdin, &note).await?;
        Ok(())
    }

    /// Sends one JSON-RPC request and waits for the matching response.
    async fn rpc(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let mut io = self.io.lock().await;
        write_line(&mut io.stdin, &request).await?;

        let response = tokio::time::timeout(self.deadline, read_response(&mut io, id))
            .await
            .map_err(|_| GatewayError::Transient(format!("broker call {method} timed out")))??;

        if let Some(error) = response.get("error") {
            return Err(GatewayError::Transient(format!(
                "broker error for {method}: {error}"
            )));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Calls one broker tool and unwraps the vendor API envelope.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, GatewayError> {
        debug!(tool = name, "sheet tool call");
        let result = self
            .rpc("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;

        // The broker wraps tool output as a content array of text items
        // holding the raw API response body.
        let body = result
            .get("content")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .and_then(|item| item.get("text"))
            .and_then(Value::as_str)
            .map_or_else(|| Ok(result.clone()), serde_json::from_str::<Value>)
            .map_err(|err| GatewayError::Transient(format!("broker payload decode: {err}")))?;

        if let Some(code) = body.get("code").and_then(Value::as_i64) {
            if code != 0 {
                let msg = body
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(classify_api_code(code, msg));
            }
        }

        Ok(body.get("data").cloned().unwrap_or(body))
    }

    /// Terminates the broker subprocess.
    pub async fn shutdown(&self) {
        let mut io = self.io.lock().await;
        if let Err(err) = io.child.kill().await {
            warn!(error = %err, "broker shutdown failed");
        }
    }

    fn bitable_args(&self, mut arguments: Value) -> Value {
        if let Some(map) = arguments.as_object_mut() {
            map.insert("useUAT".into(), Value::Bool(self.use_oauth));
        }
        arguments
    }
}

#[async_trait]
impl SheetGateway for LarkSheet {
    async fn create_record(
        &self,
        table: &SheetTableRef,
        fields: &JsonMap,
    ) -> Result<String, GatewayError> {
        let data = self
            .call_tool(
                "bitable_v1_appTableRecord_create",
                self.bitable_args(json!({
                    "path": { "app_token": table.app_token, "table_id": table.table_id },
                    "data": { "fields": fields },
                })),
            )
            .await?;

        data.pointer("/record/record_id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| GatewayError::Transient("record create returned no record id".into()))
    }

    async fn get_record(&self, record: &SheetRecordRef) -> Result<SheetRecord, GatewayError> {
        let data = self
            .call_tool(
                "bitable_v1_appTableRecord_get",
                self.bitable_args(json!({
                    "path": {
                        "app_token": record.app_token,
                        "table_id": record.table_id,
                        "record_id": record.record_id,
                    },
                })),
            )
            .await?;

        data.get("record")
            .and_then(|raw| parse_record(raw))
            .ok_or_else(|| GatewayError::NotFound(format!("record {}", record.record_id)))
    }

    async fn update_record(
        &self,
        record: &SheetRecordRef,
        fields: &JsonMap,
    ) -> Result<(), GatewayError> {
        self.call_tool(
            "bitable_v1_appTableRecord_update",
            self.bitable_args(json!({
                "path": {
                    "app_token": record.app_token,
                    "table_id": record.table_id,
                    "record_id": record.record_id,
                },
                "data": { "fields": fields },
            })),
        )
        .await?;
        Ok(())
    }

    async fn search_records(
        &self,
        table: &SheetTableRef,
        query: &RecordQuery,
    ) -> Result<Vec<SheetRecord>, GatewayError> {
        let mut data = json!({});
        if let Some((field, since)) = &query.modified_since {
            data["filter"] = json!({
                "conjunction": "and",
                "conditions": [{
                    "field_name": field,
                    "operator": "isGreater",
                    "value": ["ExactDate", since.timestamp_millis().to_string()],
                }],
            });
        }

        let result = self
            .call_tool(
                "bitable_v1_appTableRecord_search",
                self.bitable_args(json!({
                    "path": { "app_token": table.app_token, "table_id": table.table_id },
                    "data": data,
                    "params": { "page_size": query.page_size.unwrap_or(DEFAULT_PAGE_SIZE) },
                })),
            )
            .await?;

        Ok(result
            .get("items")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(parse_record).collect())
            .unwrap_or_default())
    }

    async fn lookup_open_id(&self, email: &str) -> Result<Option<String>, GatewayError> {
        let data = self
            .call_tool(
                "contact_v3_user_batchGetId",
                json!({
                    "data": { "emails": [email] },
                    "params": { "user_id_type": "open_id" },
                }),
            )
            .await?;

        Ok(data
            .pointer("/user_list/0/user_id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned))
    }

    async fn send_text(&self, target: &MessageTarget, text: &str) -> Result<(), GatewayError> {
        let content = serde_json::to_string(&json!({ "text": text }))
            .map_err(|err| GatewayError::InvalidRequest(err.to_string()))?;
        self.call_tool(
            "im_v1_message_create",
            json!({
                "data": {
                    "receive_id": target.receive_id(),
                    "msg_type": "text",
                    "content": content,
                },
                "params": { "receive_id_type": target.id_type() },
            }),
        )
        .await?;
        Ok(())
    }

    async fn list_tables(&self, app_token: &str) -> Result<Vec<SheetTableInfo>, GatewayError> {
        let data = self
            .call_tool(
                "bitable_v1_appTable_list",
                self.bitable_args(json!({ "path": { "app_token": app_token } })),
            )
            .await?;

        Ok(data
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        Some(SheetTableInfo {
                            table_id: item.get("table_id")?.as_str()?.to_owned(),
                            name: item.get("name")?.as_str()?.to_owned(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_table(
        &self,
        app_token: &str,
        name: &str,
        fields: &[SheetFieldDef],
    ) -> Result<String, GatewayError> {
        let field_defs: Vec<Value> = fields.iter().map(field_def_json).collect();
        let data = self
            .call_tool(
                "bitable_v1_appTable_create",
                self.bitable_args(json!({
                    "path": { "app_token": app_token },
                    "data": {
                        "table": {
                            "name": name,
                            "default_view_name": "Main View",
                            "fields": field_defs,
                        },
                    },
                })),
            )
            .await?;

        data.get("table_id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| GatewayError::Transient("table create returned no table id".into()))
    }
}

async fn write_line(stdin: &mut ChildStdin, message: &Value) -> Result<(), GatewayError> {
    let mut line = serde_json::to_vec(message)
        .map_err(|err| GatewayError::InvalidRequest(err.to_string()))?;
    line.push(b'\n');
    stdin
        .write_all(&line)
        .await
        .map_err(|err| GatewayError::Transient(format!("broker write failed: {err}")))
}

/// Reads lines until the response with the given id arrives, skipping
/// notifications and unrelated responses.
async fn read_response(io: &mut BrokerIo, id: u64) -> Result<Value, GatewayError> {
    loop {
        let line = io
            .stdout
            .next_line()
            .await
            .map_err(|err| GatewayError::Transient(format!("broker read failed: {err}")))?
            .ok_or_else(|| GatewayError::Transient("broker exited".into()))?;

        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        if message.get("id").and_then(Value::as_u64) == Some(id) {
            return Ok(message);
        }
    }
}

fn parse_record(raw: &Value) -> Option<SheetRecord> {
    let record_id = raw.get("record_id")?.as_str()?.to_owned();
    let fields = raw
        .get("fields")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let last_modified = raw
        .get("last_modified_time")
        .and_then(Value::as_i64)
        .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms));
    Some(SheetRecord {
        record_id,
        fields,
        last_modified,
    })
}

fn field_def_json(def: &SheetFieldDef) -> Value {
    let mut value = json!({ "field_name": def.name, "type": def.kind });
    if !def.options.is_empty() {
        value["property"] = json!({
            "options": def
                .options
                .iter()
                .map(|name| json!({ "name": name }))
                .collect::<Vec<_>>(),
        });
    }
    value
}

/// Maps vendor API error codes onto the shared taxonomy.
///
/// The 999916xx family is authentication/token trouble; 12540xx covers
/// missing bitable objects. Frequency-limit responses carry a throttling
/// message rather than a dedicated code.
fn classify_api_code(code: i64, msg: &str) -> GatewayError {
    let lowered = msg.to_ascii_lowercase();
    if (99_991_600..=99_991_699).contains(&code) {
        GatewayError::Unauthorized(format!("sheet api error {code}: {msg}"))
    } else if lowered.contains("frequency") || lowered.contains("too many") {
        GatewayError::RateLimited {
            retry_after: Duration::from_secs(60),
        }
    } else if (1_254_040..=1_254_049).contains(&code) {
        GatewayError::NotFound(format!("sheet api error {code}: {msg}"))
    } else {
        GatewayError::InvalidRequest(format!("sheet api error {code}: {msg}"))
    }
}
