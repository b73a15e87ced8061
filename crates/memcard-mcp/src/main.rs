//! Headless JSON-RPC tool server for the PS1 memory card emulator.

use memcard_mcp::McpServer;

fn main() {
    let mut server = McpServer::new();
    server.run();
}
