//! TCP Server for KVSQL
//!
//! Clients send one SQL statement per line and receive one JSON-encoded
//! `Response` per line. Each connection runs in its own task with its own
//! session; closing the connection rolls back any open transaction.

use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::executor::{Database, Response};
use crate::storage::Value;

/// Output format for query results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

/// KVSQL TCP Server
pub struct Server {
    db: Arc<Database>,
}

impl Server {
    /// Create a new server
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        let address = self.db.config().bind_address();
        let listener = TcpListener::bind(&address).await?;
        info!(address = %listener.local_addr()?, "listening");
        Ok(listener)
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve(&self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let db = Arc::clone(&self.db);
                        tokio::spawn(async move {
                            info!(%peer, "client connected");
                            if let Err(e) = handle_connection(stream, db).await {
                                warn!(%peer, error = %e, "connection error");
                            }
                            info!(%peer, "client disconnected");
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                },
            }
        }
    }
}

/// Handle a client connection
async fn handle_connection(stream: TcpStream, db: Arc<Database>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut session = db.session();

    while let Some(line) = lines.next_line().await? {
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if matches!(query, ".quit" | ".exit") {
            break;
        }

        let response = session.execute(query);
        debug!(conn = session.connection_id(), success = response.success, "responding");
        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        writer.write_all(encoded.as_bytes()).await?;
    }

    writer.shutdown().await?;
    Ok(())
}

/// Format a response for people
pub fn format_response(response: &Response, format: OutputFormat) -> String {
    if format == OutputFormat::Json {
        return match serde_json::to_string_pretty(response) {
            Ok(json) => json + "\n",
            Err(e) => format!("{{\"success\":false,\"error\":\"Serialization error: {}\"}}\n", e),
        };
    }

    let mut output = String::new();
    for warning in &response.warnings {
        output.push_str(&format!("Warning: {}\n", warning));
    }
    if let Some(error) = &response.error {
        output.push_str(&format!("Error: {}\n", error));
        return output;
    }
    if response.data.is_empty() {
        if response.affected_rows > 0 {
            output.push_str(&format!("{} row(s) affected\n", response.affected_rows));
        } else {
            output.push_str("OK\n");
        }
        return output;
    }

    // Columns in first-seen order across every row
    let mut columns: Vec<&str> = Vec::new();
    for row in &response.data {
        for name in row.keys() {
            if !columns.contains(&name.as_str()) {
                columns.push(name);
            }
        }
    }

    let cells: Vec<Vec<String>> = response
        .data
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|c| row.get(*c).map(display_cell).unwrap_or_default())
                .collect()
        })
        .collect();

    let mut widths: Vec<usize> = columns.iter().map(|c| c.chars().count()).collect();
    for row in &cells {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let separator: String = widths
        .iter()
        .map(|w| "-".repeat(*w + 2))
        .collect::<Vec<String>>()
        .join("+");
    output.push_str(&format!("+{}+\n", separator));

    let header: String = columns
        .iter()
        .zip(&widths)
        .map(|(c, w)| format!(" {:^width$} ", c, width = *w))
        .collect::<Vec<String>>()
        .join("|");
    output.push_str(&format!("|{}|\n", header));
    output.push_str(&format!("+{}+\n", separator));

    for row in &cells {
        let line: String = row
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!(" {:>width$} ", v, width = *w))
            .collect::<Vec<String>>()
            .join("|");
        output.push_str(&format!("|{}|\n", line));
    }
    output.push_str(&format!("+{}+\n", separator));
    output.push_str(&format!("{} row(s) returned\n", response.data.len()));
    output
}

/// Strings print bare in tables
fn display_cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::Store;
    use indexmap::IndexMap;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_format_table() {
        let mut first = IndexMap::new();
        first.insert("a".to_string(), Value::Integer(1));
        first.insert("name".to_string(), Value::from("x"));
        let mut second = IndexMap::new();
        second.insert("a".to_string(), Value::Integer(22));
        second.insert("extra".to_string(), Value::Boolean(true));

        let output = format_response(&Response::rows(vec![first, second]), OutputFormat::Table);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], "+----+------+-------+");
        assert_eq!(lines[1], "| a  | name | extra |");
        assert_eq!(lines[3], "|  1 |    x |       |");
        assert_eq!(lines[4], "| 22 |      |  true |");
        assert_eq!(lines[6], "2 row(s) returned");
    }

    #[test]
    fn test_format_messages() {
        assert_eq!(format_response(&Response::affected(3), OutputFormat::Table), "3 row(s) affected\n");
        assert_eq!(format_response(&Response::ok(), OutputFormat::Table), "OK\n");
        assert_eq!(
            format_response(
                &Response::failure("boom").with_warning("careful"),
                OutputFormat::Table
            ),
            "Warning: careful\nError: boom\n"
        );
    }

    #[tokio::test]
    async fn test_line_protocol() {
        let db = Database::new(Store::memory(), EngineConfig::new().port(0));
        let server = Server::new(Arc::clone(&db));
        let listener = server.bind().await.unwrap();
        let address = listener.local_addr().unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let serving = tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = stopped.await;
                })
                .await
        });

        let mut client = TcpStream::connect(address).await.unwrap();
        client
            .write_all(b"INSERT INTO t {\"a\": 1}\nSELECT a FROM t\n\n.quit\n")
            .await
            .unwrap();
        let mut received = String::new();
        client.read_to_string(&mut received).await.unwrap();

        let responses: Vec<Response> = received
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].affected_rows, 1);
        assert_eq!(responses[1].data[0].get("a"), Some(&Value::Integer(1)));

        stop.send(()).unwrap();
        serving.await.unwrap().unwrap();
    }
}
