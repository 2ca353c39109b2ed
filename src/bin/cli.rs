//! KVSQL - CLI Client
//!
//! Interactive shell over an in-process database.

use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing_subscriber::EnvFilter;

use kvsql::executor::{Database, Session};
use kvsql::server::{format_response, OutputFormat};

const PROMPT: &str = "kvsql> ";
const CONTINUATION_PROMPT: &str = "  ...> ";

/// Print welcome banner
fn print_banner() {
    println!(
        r#"
 _                  _
| | ____   _____  __ _| |
| |/ /\ \ / / __|/ _` | |
|   <  \ V /\__ \ (_| | |
|_|\_\  \_/ |___/\__, |_|
                    |_|

 SQL over an ordered key-value store
 Type '.help' for help, '.quit' to exit
"#
    );
}

/// Print help message
fn print_help() {
    println!(
        r#"
Commands:
  .help              Show this help message
  .quit              Exit
  .mode json|table   Set the output format
  .vacuum            Reclaim expired rows now

SQL Commands (end with ';'):
  INSERT INTO t {{"a": 1}}, {{"a": 2}}
  INSERT INTO t (a, b) VALUES (1, 'x')
  SELECT a, count(*) FROM t WHERE a > 0 GROUP BY a ORDER BY a DESC LIMIT 10
  UPDATE t SET a = a + 1 WHERE b = 'x'
  DELETE FROM t WHERE a IS NULL
  CREATE INDEX t_a ON t (a)          DROP INDEX t_a
  CREATE NOTIFICATION n ON t         DROP NOTIFICATION n
  DROP TABLE [IF EXISTS] t
  BEGIN / COMMIT / ROLLBACK
  EXPLAIN SELECT ...
"#
    );
}

/// Handle special dot commands. Returns false to exit.
fn handle_special_command(cmd: &str, session: &Session, format: &mut OutputFormat) -> bool {
    let parts: Vec<&str> = cmd.split_whitespace().collect();

    match parts.as_slice() {
        [".help"] => print_help(),
        [".quit"] | [".exit"] => return false,
        [".mode", "json"] => *format = OutputFormat::Json,
        [".mode", "table"] => *format = OutputFormat::Table,
        [".vacuum"] => match session.database().vacuum().sweep() {
            Ok(stats) => println!(
                "Reclaimed {} row(s) and {} transient table(s)",
                stats.rows_reclaimed, stats.tables_reclaimed
            ),
            Err(e) => eprintln!("Error: {}", e.user_message()),
        },
        _ => {
            eprintln!("Unknown command: {}", cmd);
            eprintln!("Type '.help' for available commands.");
        }
    }
    true
}

/// Main REPL loop
fn run_repl() -> Result<()> {
    let db = Database::in_memory();
    let mut session = db.session();
    let mut editor = DefaultEditor::new()?;
    let mut format = OutputFormat::Table;
    let mut buffer = String::new();

    print_banner();

    loop {
        let prompt = if buffer.is_empty() { PROMPT } else { CONTINUATION_PROMPT };
        let line = match editor.readline(prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                buffer.clear();
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let trimmed = line.trim();

        if buffer.is_empty() && trimmed.starts_with('.') {
            let _ = editor.add_history_entry(trimmed);
            if !handle_special_command(trimmed, &session, &mut format) {
                break;
            }
            continue;
        }
        if trimmed.is_empty() {
            continue;
        }

        buffer.push_str(&line);
        buffer.push('\n');
        if !trimmed.ends_with(';') {
            continue;
        }

        let statement = buffer.trim();
        let _ = editor.add_history_entry(statement);
        print!("{}", format_response(&session.execute(statement), format));
        buffer.clear();
    }

    println!("Goodbye!");
    Ok(())
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    run_repl()
}
