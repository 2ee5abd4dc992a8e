//! tether-cli: operator frontend for the Tether HTTP API
//!
//! Thin blocking client over the REST endpoints. Every subcommand prints a
//! human-readable summary, or the raw response body with `--json`.
//!
//! # Subcommands
//! - `status`                          server health
//! - `list <owner>`                    an owner's connections
//! - `show <id>`                       one connection
//! - `add <owner>`                     create a connection and print its QR
//! - `disconnect <id>`                 stop the live session
//! - `delete <id>`                     remove the connection and its artifacts
//! - `restore <id>`                    restore one connection
//! - `restore-all`                     restore every ready connection
//! - `sweep`                           run a cleanup sweep
//! - `send <id> <to> <text>`           send a text message

use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8780";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "tether-cli", version, about = "Tether connection lifecycle CLI")]
struct Cli {
    /// Tether HTTP server URL (overrides TETHER_HTTP_URL env var)
    #[arg(long, env = "TETHER_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Print the raw JSON response
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show Tether server status
    Status,

    /// List connections belonging to an owner
    List { owner_id: String },

    /// Show one connection
    Show { connection_id: String },

    /// Create a connection and print the pairing QR
    Add { owner_id: String },

    /// Disconnect the live session of a connection
    Disconnect { connection_id: String },

    /// Delete a connection record and its session artifacts
    Delete { connection_id: String },

    /// Restore one connection
    Restore { connection_id: String },

    /// Restore every connection persisted as ready
    RestoreAll,

    /// Run a cleanup sweep now
    Sweep,

    /// Send a text message through a ready connection
    Send {
        connection_id: String,
        /// Recipient phone number or full address
        to: String,
        /// Message text
        text: String,
    },
}

// ============================================================================
// API Response Types
// ============================================================================

/// Connection as returned under the `connection` key.
#[derive(Debug, Deserialize)]
pub struct ConnectionSummary {
    pub id: String,
    pub owner_id: String,
    pub status: String,
    #[serde(default)]
    pub active: bool,
    pub live_status: Option<String>,
    pub account_info: Option<Value>,
    pub error: Option<String>,
    pub disconnect_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListResponse {
    pub count: usize,
    pub connections: Vec<ConnectionSummary>,
}

#[derive(Debug, Deserialize)]
pub struct AddedConnection {
    pub connection_id: String,
    pub status: String,
    pub qr: Option<String>,
}

// ============================================================================
// Formatting
// ============================================================================

/// One line per connection: id, status, live marker and phone if known.
pub fn connection_line(c: &ConnectionSummary) -> String {
    let mut line = format!("{}  {:<18}", c.id, c.status);
    if c.active {
        match &c.live_status {
            Some(live) if live != &c.status => line.push_str(&format!(" live:{}", live)),
            _ => line.push_str(" live"),
        }
    }
    if let Some(phone) = c
        .account_info
        .as_ref()
        .and_then(|info| info["phone_number"].as_str())
    {
        line.push_str(&format!(" +{}", phone));
    }
    line.trim_end().to_string()
}

/// Multi-line detail view for `show`.
pub fn connection_details(c: &ConnectionSummary) -> String {
    let mut out = vec![
        format!("Connection: {}", c.id),
        format!("Owner:      {}", c.owner_id),
        format!("Status:     {}", c.status),
        format!(
            "Session:    {}",
            if c.active {
                c.live_status.as_deref().unwrap_or("active")
            } else {
                "inactive"
            }
        ),
    ];
    if let Some(reason) = &c.disconnect_reason {
        out.push(format!("Reason:     {}", reason));
    }
    if let Some(error) = &c.error {
        out.push(format!("Error:      {}", error));
    }
    out.join("\n")
}

/// `key: value` lines for a flat report object, in server order.
pub fn report_lines(report: &Value) -> Vec<String> {
    match report.as_object() {
        Some(fields) => fields
            .iter()
            .map(|(key, value)| format!("{:<20} {}", format!("{}:", key), value))
            .collect(),
        None => vec![report.to_string()],
    }
}

/// Error text from a `{status: "error", code, error}` body.
pub fn error_message(body: &Value) -> String {
    match (body["code"].as_str(), body["error"].as_str()) {
        (Some(code), Some(error)) => format!("{} ({})", error, code),
        (None, Some(error)) => error.to_string(),
        _ => match (body["code"].as_str(), body["message"].as_str()) {
            (Some(code), Some(message)) => format!("{} ({})", message, code),
            _ => body.to_string(),
        },
    }
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

struct Api {
    server: String,
    client: reqwest::blocking::Client,
}

impl Api {
    fn new(server: &str) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            // restore waits for a QR or ready event
            .timeout(std::time::Duration::from_secs(120))
            .build()?;
        Ok(Self {
            server: server.to_string(),
            client,
        })
    }

    /// Send a request and return the JSON body; non-2xx exits with the
    /// server's error message.
    fn call(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> Value {
        self.send(self.client.request(method, self.url(path)), body)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server, path)
    }

    fn send(&self, mut request: reqwest::blocking::RequestBuilder, body: Option<Value>) -> Value {
        if let Some(body) = body {
            request = request.json(&body);
        }

        let resp = match request.send() {
            Ok(r) => r,
            Err(e) => {
                eprintln!("tether-cli: request to {} failed: {}", self.server, e);
                std::process::exit(1);
            }
        };

        let status = resp.status();
        let body: Value = resp.json().unwrap_or(Value::Null);
        if !status.is_success() {
            eprintln!("tether-cli: server returned {}: {}", status, error_message(&body));
            std::process::exit(1);
        }
        body
    }

    fn get(&self, path: &str) -> Value {
        self.call(reqwest::Method::GET, path, None)
    }

    /// `GET /connections` with the owner id URL-encoded.
    fn list_request(&self, owner_id: &str) -> reqwest::blocking::RequestBuilder {
        self.client
            .get(self.url("/connections"))
            .query(&[("owner_id", owner_id)])
    }

    fn post(&self, path: &str, body: Option<Value>) -> Value {
        self.call(reqwest::Method::POST, path, body)
    }

    fn delete(&self, path: &str) -> Value {
        self.call(reqwest::Method::DELETE, path, None)
    }
}

fn print_json(body: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(body)?);
    Ok(())
}

fn do_status(api: &Api, json: bool) -> anyhow::Result<()> {
    let body = api.get("/health");
    if json {
        return print_json(&body);
    }
    println!("Tether server:   {}", body["status"].as_str().unwrap_or("unknown"));
    println!("Version:         {}", body["version"].as_str().unwrap_or("?"));
    println!("Storage:         {}", body["storage"].as_str().unwrap_or("?"));
    println!("Active sessions: {}", body["active_sessions"]);
    Ok(())
}

fn do_list(api: &Api, owner_id: &str, json: bool) -> anyhow::Result<()> {
    let body = api.send(api.list_request(owner_id), None);
    if json {
        return print_json(&body);
    }
    let list: ListResponse = serde_json::from_value(body)?;
    if list.count == 0 {
        eprintln!("No connections for owner: {}", owner_id);
        return Ok(());
    }
    for c in &list.connections {
        println!("{}", connection_line(c));
    }
    Ok(())
}

fn do_show(api: &Api, id: &str, json: bool) -> anyhow::Result<()> {
    let body = api.get(&format!("/connections/{}", id));
    if json {
        return print_json(&body);
    }
    let connection: ConnectionSummary = serde_json::from_value(body["connection"].clone())?;
    println!("{}", connection_details(&connection));
    Ok(())
}

fn do_add(api: &Api, owner_id: &str, json: bool) -> anyhow::Result<()> {
    let body = api.post(
        "/connections",
        Some(serde_json::json!({ "owner_id": owner_id })),
    );
    if json {
        return print_json(&body);
    }
    let added: AddedConnection = serde_json::from_value(body["connection"].clone())?;
    println!("Connection: {}", added.connection_id);
    println!("Status:     {}", added.status);
    if let Some(qr) = added.qr {
        println!("QR:         {}", qr);
    }
    Ok(())
}

fn do_restore(api: &Api, id: &str, json: bool) -> anyhow::Result<()> {
    let body = api.post(&format!("/connections/{}/restore", id), None);
    if json {
        return print_json(&body);
    }
    println!("{}", body["message"].as_str().unwrap_or("restored"));
    if let Some(status) = body["status"].as_str() {
        println!("Status: {}", status);
    }
    if let Some(qr) = body["qr_code"].as_str() {
        println!("QR:     {}", qr);
    }
    Ok(())
}

fn do_report(api: &Api, path: &str, json: bool) -> anyhow::Result<()> {
    let body = api.post(path, None);
    if json {
        return print_json(&body);
    }
    for line in report_lines(&body["report"]) {
        println!("{}", line);
    }
    Ok(())
}

fn do_send(api: &Api, id: &str, to: &str, text: &str, json: bool) -> anyhow::Result<()> {
    let body = api.post(
        &format!("/connections/{}/messages", id),
        Some(serde_json::json!({ "to": to, "content": text })),
    );
    if json {
        return print_json(&body);
    }
    println!("Sent: {}", body["message"]["id"].as_str().unwrap_or("?"));
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();
    let json = cli.json;

    let result = Api::new(&server).and_then(|api| match &cli.command {
        Commands::Status => do_status(&api, json),
        Commands::List { owner_id } => do_list(&api, owner_id, json),
        Commands::Show { connection_id } => do_show(&api, connection_id, json),
        Commands::Add { owner_id } => do_add(&api, owner_id, json),
        Commands::Disconnect { connection_id } => {
            let body = api.delete(&format!("/connections/{}", connection_id));
            if json {
                return print_json(&body);
            }
            println!("Disconnected {}", connection_id);
            Ok(())
        }
        Commands::Delete { connection_id } => {
            let body = api.delete(&format!("/connections/{}/record", connection_id));
            if json {
                return print_json(&body);
            }
            println!("Deleted {}", connection_id);
            Ok(())
        }
        Commands::Restore { connection_id } => do_restore(&api, connection_id, json),
        Commands::RestoreAll => do_report(&api, "/admin/restore", json),
        Commands::Sweep => do_report(&api, "/admin/sweep", json),
        Commands::Send {
            connection_id,
            to,
            text,
        } => do_send(&api, connection_id, to, text, json),
    });

    if let Err(e) = result {
        eprintln!("tether-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn summary(body: Value) -> ConnectionSummary {
        serde_json::from_value(body).expect("valid connection body")
    }

    // ========================================================================
    // TEST 1: connection body from the server deserializes
    // ========================================================================
    #[test]
    fn test_connection_summary_parses_server_shape() {
        let c = summary(json!({
            "id": "c1",
            "owner_id": "o1",
            "status": "ready",
            "active": true,
            "live_status": "ready",
            "qr_code": null,
            "account_info": {"phone_number": "15550001111"},
            "created_at": "2026-01-01T00:00:00Z",
            "error": null,
            "disconnect_reason": null
        }));
        assert_eq!(c.status, "ready");
        assert!(c.active);
    }

    // ========================================================================
    // TEST 2: list line shows live marker and phone
    // ========================================================================
    #[test]
    fn test_connection_line_ready() {
        let c = summary(json!({
            "id": "c1", "owner_id": "o1", "status": "ready", "active": true,
            "live_status": "ready", "account_info": {"phone_number": "15550001111"}
        }));
        let line = connection_line(&c);
        assert!(line.starts_with("c1  ready"));
        assert!(line.contains(" live"));
        assert!(line.ends_with("+15550001111"));
    }

    // ========================================================================
    // TEST 3: live status differing from persisted status is shown
    // ========================================================================
    #[test]
    fn test_connection_line_live_differs() {
        let c = summary(json!({
            "id": "c2", "owner_id": "o1", "status": "disconnected", "active": true,
            "live_status": "waiting_connection"
        }));
        assert!(connection_line(&c).contains("live:waiting_connection"));

        let inactive = summary(json!({
            "id": "c3", "owner_id": "o1", "status": "disconnected"
        }));
        assert_eq!(connection_line(&inactive), "c3  disconnected");
    }

    // ========================================================================
    // TEST 4: details include reason and error when present
    // ========================================================================
    #[test]
    fn test_connection_details() {
        let c = summary(json!({
            "id": "c1", "owner_id": "o1", "status": "auth_failed", "active": false,
            "error": "bad credentials", "disconnect_reason": null
        }));
        let details = connection_details(&c);
        assert!(details.contains("Session:    inactive"));
        assert!(details.contains("Error:      bad credentials"));
        assert!(!details.contains("Reason:"));
    }

    // ========================================================================
    // TEST 5: report lines keep every field
    // ========================================================================
    #[test]
    fn test_report_lines() {
        let lines = report_lines(&json!({"total": 3, "restored": 2, "failed": 1}));
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().any(|l| l.starts_with("restored:") && l.ends_with('2')));
    }

    // ========================================================================
    // TEST 6: owner ids are URL-encoded in the list query
    // ========================================================================
    #[test]
    fn test_list_request_encodes_owner() {
        let api = Api::new("http://127.0.0.1:8780").unwrap();
        let request = api.list_request("team a&b#1").build().unwrap();

        assert_eq!(request.url().path(), "/connections");
        assert!(request.url().fragment().is_none());
        let pairs: Vec<(String, String)> = request.url().query_pairs().into_owned().collect();
        assert_eq!(pairs, vec![("owner_id".to_string(), "team a&b#1".to_string())]);
    }

    // ========================================================================
    // TEST 7: error bodies from both error shapes
    // ========================================================================
    #[test]
    fn test_error_message_shapes() {
        let standard = json!({"status": "error", "code": "not_found", "error": "connection c9 not found"});
        assert_eq!(error_message(&standard), "connection c9 not found (not_found)");

        let restore = json!({"success": false, "code": "needs_reauth", "message": "re-authentication required"});
        assert_eq!(error_message(&restore), "re-authentication required (needs_reauth)");

        assert_eq!(error_message(&Value::Null), "null");
    }
}
