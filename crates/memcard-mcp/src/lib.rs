//! MCP (Model Context Protocol) server for the PS1 memory card emulator.
//!
//! Exposes a virtual memory card as a JSON-RPC 2.0 server over
//! stdin/stdout. Tools allow scripts and AI agents to create cards, drive
//! the wire protocol byte by byte, perform sector/block I/O, and move card
//! images in and out via the `format-mcd` container formats.
//!
//! # Protocol
//!
//! Reads newline-delimited JSON-RPC 2.0 requests from stdin, writes
//! responses to stdout. Purely headless.
//!
//! Sector, block, and card payloads travel base64-encoded. The raw
//! `transfer` tool accepts `null` as the high-impedance command and keeps
//! the card powered between calls; the higher-level I/O tools reseat the
//! card (power-cycling it) and therefore abort any raw transaction in
//! progress.

use std::io::{self, BufRead, Write};

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use format_mcd::{McdFormat, McdImage};
use peripheral_psx_memcard::{
    MemoryCard, MemoryCardSlot, BLOCK_COUNT, BLOCK_SIZE, CARD_SIZE, SECTOR_COUNT, SECTOR_SIZE,
};

// ---------------------------------------------------------------------------
// JSON-RPC types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: JsonValue,
    id: JsonValue,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
    id: JsonValue,
}

#[derive(Serialize)]
struct RpcError {
    code: i32,
    message: String,
}

impl RpcResponse {
    fn success(id: JsonValue, result: JsonValue) -> Self {
        Self {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id,
        }
    }

    fn error(id: JsonValue, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(RpcError { code, message }),
            id,
        }
    }
}

// ---------------------------------------------------------------------------
// MCP Server
// ---------------------------------------------------------------------------

/// MCP server wrapping a virtual memory card.
///
/// The card rests unpowered between tool calls; each high-level I/O tool
/// seats it in a fresh slot for the duration of the operation.
pub struct McpServer {
    card: Option<MemoryCard>,
}

impl McpServer {
    #[must_use]
    pub fn new() -> Self {
        Self { card: None }
    }

    /// Run the server loop: read JSON-RPC from stdin, write responses to
    /// stdout.
    pub fn run(&mut self) {
        let stdin = io::stdin();
        let stdout = io::stdout();
        let mut stdout = stdout.lock();

        for line in stdin.lock().lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            let response = self.handle_line(&line);
            let _ = writeln!(stdout, "{response}");
            let _ = stdout.flush();
        }
    }

    /// Handle one request line, returning the serialised response.
    pub fn handle_line(&mut self, line: &str) -> String {
        let request: RpcRequest = match serde_json::from_str(line.trim()) {
            Ok(r) => r,
            Err(e) => {
                let resp = RpcResponse::error(JsonValue::Null, -32700, format!("Parse error: {e}"));
                return serde_json::to_string(&resp).unwrap_or_default();
            }
        };

        let response = if request.jsonrpc == "2.0" {
            self.dispatch(&request.method, &request.params, request.id)
        } else {
            RpcResponse::error(request.id, -32600, "Invalid JSON-RPC version".to_string())
        };
        serde_json::to_string(&response).unwrap_or_default()
    }

    /// Dispatch a method call to the appropriate handler.
    fn dispatch(&mut self, method: &str, params: &JsonValue, id: JsonValue) -> RpcResponse {
        match method {
            "new_card" => self.handle_new_card(params, id),
            "load_card" => self.handle_load_card(params, id),
            "dump_card" => self.handle_dump_card(id),
            "save" => self.handle_save(params, id),
            "identify" => self.handle_identify(id),
            "transfer" => self.handle_transfer(params, id),
            "read_sector" => self.handle_read_sector(params, id),
            "write_sector" => self.handle_write_sector(params, id),
            "read_block" => self.handle_read_block(params, id),
            "write_block" => self.handle_write_block(params, id),
            "query" => self.handle_query(id),
            _ => RpcResponse::error(id, -32601, format!("Unknown method: {method}")),
        }
    }

    /// Ensure a card exists, returning a mutable reference.
    fn require_card(&mut self, id: &JsonValue) -> Result<&mut MemoryCard, RpcResponse> {
        match self.card.as_mut() {
            Some(card) => Ok(card),
            None => Err(RpcResponse::error(
                id.clone(),
                -32000,
                "No card. Call 'new_card' first.".to_string(),
            )),
        }
    }

    // === Tool handlers ===

    fn handle_new_card(&mut self, params: &JsonValue, id: JsonValue) -> RpcResponse {
        let card = if params.get("data").is_some() || params.get("path").is_some() {
            let bytes = match load_image_param(params, &id) {
                Ok(b) => b,
                Err(e) => return e,
            };
            match McdImage::from_bytes(&bytes) {
                Ok(image) => MemoryCard::from_bytes(image.into_card_bytes()),
                Err(e) => {
                    return RpcResponse::error(id, -32000, format!("Image parse failed: {e}"))
                }
            }
        } else {
            MemoryCard::new()
        };
        self.card = Some(card);
        RpcResponse::success(id, serde_json::json!({"status": "ok"}))
    }

    fn handle_load_card(&mut self, params: &JsonValue, id: JsonValue) -> RpcResponse {
        let bytes = match load_image_param(params, &id) {
            Ok(b) => b,
            Err(e) => return e,
        };
        let image = match McdImage::from_bytes(&bytes) {
            Ok(image) => image,
            Err(e) => return RpcResponse::error(id, -32000, format!("Image parse failed: {e}")),
        };
        let card = match self.require_card(&id) {
            Ok(c) => c,
            Err(e) => return e,
        };
        card.bytes_mut().copy_from_slice(image.card_bytes());
        RpcResponse::success(id, serde_json::json!({"status": "ok"}))
    }

    fn handle_dump_card(&mut self, id: JsonValue) -> RpcResponse {
        let card = match self.require_card(&id) {
            Ok(c) => c,
            Err(e) => return e,
        };
        let b64 = base64::engine::general_purpose::STANDARD.encode(card.bytes());
        RpcResponse::success(id, serde_json::json!({"data": b64}))
    }

    fn handle_save(&mut self, params: &JsonValue, id: JsonValue) -> RpcResponse {
        let format = match params.get("format").and_then(|v| v.as_str()) {
            None | Some("raw") => McdFormat::Raw,
            Some("gme") => McdFormat::Gme,
            Some(other) => {
                return RpcResponse::error(id, -32602, format!("Unknown format: {other}"))
            }
        };
        let card = match self.require_card(&id) {
            Ok(c) => c,
            Err(e) => return e,
        };
        let mut image = McdImage::new();
        image.card_bytes_mut().copy_from_slice(card.bytes());
        let bytes = match format {
            McdFormat::Raw => image.to_raw_bytes(),
            McdFormat::Gme => image.to_gme_bytes(),
        };

        if let Some(path) = params.get("path").and_then(|v| v.as_str()) {
            match std::fs::write(path, &bytes) {
                Ok(()) => RpcResponse::success(
                    id,
                    serde_json::json!({"status": "ok", "bytes": bytes.len()}),
                ),
                Err(e) => RpcResponse::error(id, -32000, format!("Cannot write file: {e}")),
            }
        } else {
            let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
            RpcResponse::success(id, serde_json::json!({"data": b64}))
        }
    }

    fn handle_identify(&mut self, id: JsonValue) -> RpcResponse {
        let card = match self.require_card(&id) {
            Ok(c) => c,
            Err(e) => return e,
        };
        let _ = card.power_off();
        let mut slot = MemoryCardSlot::new();
        if !slot.insert_card(card) {
            return RpcResponse::error(id, -32000, "Card refused insertion".to_string());
        }

        let commands = [0x81, 0x53, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut responses = Vec::with_capacity(commands.len());
        for command in commands {
            let (ack, data) = slot.transfer(Some(command));
            responses.push((ack, data));
        }
        slot.remove_card();

        let flag = responses[1].1;
        let payload: Vec<JsonValue> = responses[6..10]
            .iter()
            .map(|&(_, d)| d.map_or(JsonValue::Null, |b| serde_json::json!(b)))
            .collect();
        RpcResponse::success(
            id,
            serde_json::json!({
                "flag": flag,
                "id": payload,
            }),
        )
    }

    fn handle_transfer(&mut self, params: &JsonValue, id: JsonValue) -> RpcResponse {
        let command = match params.get("command") {
            None | Some(JsonValue::Null) => None,
            Some(v) => match v.as_u64() {
                Some(b) if b <= 0xFF => Some(b as u8),
                _ => {
                    return RpcResponse::error(
                        id,
                        -32602,
                        "'command' must be a byte or null".to_string(),
                    )
                }
            },
        };
        let card = match self.require_card(&id) {
            Ok(c) => c,
            Err(e) => return e,
        };
        // Raw transfers run against a powered card; power persists across
        // calls so multi-byte transactions can be driven one request at a
        // time
        if !card.powered_on() {
            card.power_on();
        }
        let (ack, data) = card.transfer(command);
        RpcResponse::success(id, serde_json::json!({"ack": ack, "data": data}))
    }

    fn handle_read_sector(&mut self, params: &JsonValue, id: JsonValue) -> RpcResponse {
        let Some(index) = params.get("index").and_then(|v| v.as_u64()) else {
            return RpcResponse::error(id, -32602, "Missing 'index'".to_string());
        };
        let card = match self.require_card(&id) {
            Ok(c) => c,
            Err(e) => return e,
        };
        let _ = card.power_off();
        let mut slot = MemoryCardSlot::new();
        if !slot.insert_card(card) {
            return RpcResponse::error(id, -32000, "Card refused insertion".to_string());
        }
        let mut sector = [0u8; SECTOR_SIZE];
        let ok = slot.read_sector(index as usize, &mut sector);
        slot.remove_card();
        if !ok {
            return RpcResponse::error(id, -32000, format!("Read of sector {index} failed"));
        }
        let b64 = base64::engine::general_purpose::STANDARD.encode(sector);
        RpcResponse::success(id, serde_json::json!({"data": b64}))
    }

    fn handle_write_sector(&mut self, params: &JsonValue, id: JsonValue) -> RpcResponse {
        let Some(index) = params.get("index").and_then(|v| v.as_u64()) else {
            return RpcResponse::error(id, -32602, "Missing 'index'".to_string());
        };
        let bytes = match decode_data_param(params, &id) {
            Ok(b) => b,
            Err(e) => return e,
        };
        let Ok(sector) = <[u8; SECTOR_SIZE]>::try_from(bytes.as_slice()) else {
            return RpcResponse::error(
                id,
                -32602,
                format!("'data' must decode to {SECTOR_SIZE} bytes"),
            );
        };
        let card = match self.require_card(&id) {
            Ok(c) => c,
            Err(e) => return e,
        };
        let _ = card.power_off();
        let mut slot = MemoryCardSlot::new();
        if !slot.insert_card(card) {
            return RpcResponse::error(id, -32000, "Card refused insertion".to_string());
        }
        let ok = slot.write_sector(index as usize, &sector);
        slot.remove_card();
        if ok {
            RpcResponse::success(id, serde_json::json!({"status": "ok"}))
        } else {
            RpcResponse::error(id, -32000, format!("Write of sector {index} failed"))
        }
    }

    fn handle_read_block(&mut self, params: &JsonValue, id: JsonValue) -> RpcResponse {
        let Some(index) = params.get("index").and_then(|v| v.as_u64()) else {
            return RpcResponse::error(id, -32602, "Missing 'index'".to_string());
        };
        let card = match self.require_card(&id) {
            Ok(c) => c,
            Err(e) => return e,
        };
        let _ = card.power_off();
        let mut slot = MemoryCardSlot::new();
        if !slot.insert_card(card) {
            return RpcResponse::error(id, -32000, "Card refused insertion".to_string());
        }
        let mut block = [0u8; BLOCK_SIZE];
        let ok = slot.read_block(index as usize, &mut block);
        slot.remove_card();
        if !ok {
            return RpcResponse::error(id, -32000, format!("Read of block {index} failed"));
        }
        let b64 = base64::engine::general_purpose::STANDARD.encode(block);
        RpcResponse::success(id, serde_json::json!({"data": b64}))
    }

    fn handle_write_block(&mut self, params: &JsonValue, id: JsonValue) -> RpcResponse {
        let Some(index) = params.get("index").and_then(|v| v.as_u64()) else {
            return RpcResponse::error(id, -32602, "Missing 'index'".to_string());
        };
        let bytes = match decode_data_param(params, &id) {
            Ok(b) => b,
            Err(e) => return e,
        };
        if bytes.len() != BLOCK_SIZE {
            return RpcResponse::error(
                id,
                -32602,
                format!("'data' must decode to {BLOCK_SIZE} bytes"),
            );
        }
        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(&bytes);
        let card = match self.require_card(&id) {
            Ok(c) => c,
            Err(e) => return e,
        };
        let _ = card.power_off();
        let mut slot = MemoryCardSlot::new();
        if !slot.insert_card(card) {
            return RpcResponse::error(id, -32000, "Card refused insertion".to_string());
        }
        let ok = slot.write_block(index as usize, &block);
        slot.remove_card();
        if ok {
            RpcResponse::success(id, serde_json::json!({"status": "ok"}))
        } else {
            RpcResponse::error(id, -32000, format!("Write of block {index} failed"))
        }
    }

    fn handle_query(&mut self, id: JsonValue) -> RpcResponse {
        let (present, powered) = match self.card.as_ref() {
            Some(card) => (true, card.powered_on()),
            None => (false, false),
        };
        RpcResponse::success(
            id,
            serde_json::json!({
                "card_present": present,
                "powered_on": powered,
                "sector_size": SECTOR_SIZE,
                "sector_count": SECTOR_COUNT,
                "block_size": BLOCK_SIZE,
                "block_count": BLOCK_COUNT,
                "card_size": CARD_SIZE,
            }),
        )
    }
}

impl Default for McpServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a base64 `data` parameter.
fn decode_data_param(params: &JsonValue, id: &JsonValue) -> Result<Vec<u8>, RpcResponse> {
    let Some(b64) = params.get("data").and_then(|v| v.as_str()) else {
        return Err(RpcResponse::error(
            id.clone(),
            -32602,
            "Missing 'data' (base64)".to_string(),
        ));
    };
    base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| RpcResponse::error(id.clone(), -32602, format!("Invalid base64: {e}")))
}

/// Load an image payload from `data` (base64) or `path`.
fn load_image_param(params: &JsonValue, id: &JsonValue) -> Result<Vec<u8>, RpcResponse> {
    if params.get("data").is_some() {
        decode_data_param(params, id)
    } else if let Some(path) = params.get("path").and_then(|v| v.as_str()) {
        std::fs::read(path)
            .map_err(|e| RpcResponse::error(id.clone(), -32602, format!("Cannot read file: {e}")))
    } else {
        Err(RpcResponse::error(
            id.clone(),
            -32602,
            "Provide 'data' (base64) or 'path'".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(server: &mut McpServer, method: &str, params: JsonValue) -> JsonValue {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });
        let response = server.handle_line(&request.to_string());
        serde_json::from_str(&response).expect("response is valid JSON")
    }

    #[test]
    fn unknown_method_errors() {
        let mut server = McpServer::new();
        let response = call(&mut server, "frobnicate", serde_json::json!({}));
        assert_eq!(response["error"]["code"], -32601);
    }

    #[test]
    fn tools_require_a_card() {
        let mut server = McpServer::new();
        let response = call(&mut server, "read_sector", serde_json::json!({"index": 0}));
        assert_eq!(response["error"]["code"], -32000);
    }

    #[test]
    fn query_reports_geometry() {
        let mut server = McpServer::new();
        let response = call(&mut server, "query", serde_json::json!({}));
        assert_eq!(response["result"]["card_present"], false);
        assert_eq!(response["result"]["sector_size"], 128);
        assert_eq!(response["result"]["card_size"], 131_072);
    }

    #[test]
    fn sector_round_trip_over_rpc() {
        let mut server = McpServer::new();
        let response = call(&mut server, "new_card", serde_json::json!({}));
        assert_eq!(response["result"]["status"], "ok");

        let data: Vec<u8> = (0..SECTOR_SIZE).map(|i| (i * 5 % 256) as u8).collect();
        let b64 = base64::engine::general_purpose::STANDARD.encode(&data);
        let response = call(
            &mut server,
            "write_sector",
            serde_json::json!({"index": 0x115, "data": b64}),
        );
        assert_eq!(response["result"]["status"], "ok");

        let response = call(
            &mut server,
            "read_sector",
            serde_json::json!({"index": 0x115}),
        );
        let out = base64::engine::general_purpose::STANDARD
            .decode(response["result"]["data"].as_str().expect("data present"))
            .expect("payload decodes");
        assert_eq!(out, data);
    }

    #[test]
    fn out_of_range_sector_errors() {
        let mut server = McpServer::new();
        call(&mut server, "new_card", serde_json::json!({}));
        let response = call(
            &mut server,
            "read_sector",
            serde_json::json!({"index": 0x400}),
        );
        assert_eq!(response["error"]["code"], -32000);
    }

    #[test]
    fn identify_reports_flag_and_id() {
        let mut server = McpServer::new();
        call(&mut server, "new_card", serde_json::json!({}));
        let response = call(&mut server, "identify", serde_json::json!({}));
        assert_eq!(response["result"]["flag"], 0x08);
        assert_eq!(
            response["result"]["id"],
            serde_json::json!([0x04, 0x00, 0x00, 0x80])
        );
    }

    #[test]
    fn raw_transfer_drives_the_protocol() {
        let mut server = McpServer::new();
        call(&mut server, "new_card", serde_json::json!({}));
        let response = call(&mut server, "transfer", serde_json::json!({"command": 0x81}));
        assert_eq!(response["result"]["ack"], true);
        assert_eq!(response["result"]["data"], JsonValue::Null);
        let response = call(&mut server, "transfer", serde_json::json!({"command": 0x53}));
        assert_eq!(response["result"]["ack"], true);
        assert_eq!(response["result"]["data"], 0x08);
    }

    #[test]
    fn save_returns_gme_with_magic() {
        let mut server = McpServer::new();
        call(&mut server, "new_card", serde_json::json!({}));
        let response = call(&mut server, "save", serde_json::json!({"format": "gme"}));
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(response["result"]["data"].as_str().expect("data present"))
            .expect("payload decodes");
        assert_eq!(&bytes[..11], b"123-456-STD");
        assert_eq!(bytes.len(), 3904 + CARD_SIZE);
    }

    #[test]
    fn new_card_from_image_data() {
        let mut raw = vec![0u8; CARD_SIZE];
        raw[0x115 * SECTOR_SIZE] = 0xCD;
        let b64 = base64::engine::general_purpose::STANDARD.encode(&raw);

        let mut server = McpServer::new();
        let response = call(&mut server, "new_card", serde_json::json!({"data": b64}));
        assert_eq!(response["result"]["status"], "ok");

        let response = call(
            &mut server,
            "read_sector",
            serde_json::json!({"index": 0x115}),
        );
        let out = base64::engine::general_purpose::STANDARD
            .decode(response["result"]["data"].as_str().expect("data present"))
            .expect("payload decodes");
        assert_eq!(out[0], 0xCD);
    }

    #[test]
    fn invalid_jsonrpc_version_rejected() {
        let mut server = McpServer::new();
        let response = server.handle_line(r#"{"jsonrpc": "1.0", "method": "query", "id": 1}"#);
        let response: JsonValue = serde_json::from_str(&response).expect("valid JSON");
        assert_eq!(response["error"]["code"], -32600);
    }
}
