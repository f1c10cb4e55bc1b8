//! Sofa CLI Client
//!
//! Interactive command-line client for sofa servers.
//!
//! # Usage
//!
//! ```bash
//! # Connect to local server
//! sofa
//!
//! # Connect to remote server
//! sofa --host example.com --port 6380
//!
//! # Execute single command
//! sofa -c "GET user:123"
//!
//! # Follow the change feed
//! sofa -c "CHANGES CONTINUOUS"
//! ```

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Sofa Command Line Interface
#[derive(Parser, Debug)]
#[command(name = "sofa")]
#[command(author, version, about = "Sofa CLI - revisioned document store client")]
struct Args {
    /// Server hostname
    #[arg(short = 'H', long, default_value = "127.0.0.1", env = "SOFA_HOST")]
    host: String,

    /// Server port
    #[arg(short, long, default_value = "6380", env = "SOFA_PORT")]
    port: u16,

    /// Execute command and exit
    #[arg(short, long)]
    command: Option<String>,

    /// Quiet mode (no banner)
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let addr = format!("{}:{}", args.host, args.port);

    // Connect
    let mut stream = connect(&addr)?;

    if !args.quiet {
        println!(
            "{}",
            format!(
                r#"
  ╔═╗╔═╗╔═╗╔═╗  CLI
  ╚═╗║ ║╠╣ ╠═╣  Connected to {}
  ╚═╝╚═╝╚  ╩ ╩  Type 'help' for commands, 'quit' to exit
"#,
                addr
            )
            .cyan()
        );
    }

    // Single command mode
    if let Some(cmd) = args.command {
        return execute_command(&mut stream, &cmd);
    }

    // Interactive mode
    let mut rl = DefaultEditor::new()?;
    let history_path = home_dir()
        .map(|p| p.join(".sofa_history"))
        .unwrap_or_default();

    let _ = rl.load_history(&history_path);

    loop {
        let prompt = format!("{}> ", "sofa".green());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                // Handle local commands
                match line.to_uppercase().as_str() {
                    "QUIT" | "EXIT" => {
                        let _ = execute_command(&mut stream, "QUIT");
                        break;
                    }
                    "HELP" => {
                        print_help();
                        continue;
                    }
                    "CLEAR" => {
                        print!("\x1B[2J\x1B[1;1H");
                        continue;
                    }
                    _ => {}
                }

                // Execute remote command
                if let Err(e) = execute_command(&mut stream, line) {
                    eprintln!("{} {}", "Error:".red(), e);

                    // Try to reconnect
                    match connect(&addr) {
                        Ok(new_stream) => {
                            stream = new_stream;
                            println!("{}", "Reconnected.".yellow());
                        }
                        Err(_) => {
                            eprintln!("{}", "Connection lost.".red());
                            break;
                        }
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    Ok(())
}

fn connect(addr: &str) -> Result<TcpStream> {
    let stream =
        TcpStream::connect(addr).with_context(|| format!("Failed to connect to {}", addr))?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    Ok(stream)
}

fn execute_command(stream: &mut TcpStream, cmd: &str) -> Result<()> {
    // Send command
    writeln!(stream, "{}", cmd)?;
    stream.flush()?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut out = std::io::stdout();
    let streaming = render_reply(&mut reader, &mut out, 0)?;

    // CHANGES CONTINUOUS acknowledges and then keeps sending change frames
    if streaming && is_continuous_feed(cmd) {
        println!("{}", "Following changes, Ctrl-C to stop".dimmed());
        stream.set_read_timeout(None)?;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                bail!("Server closed the connection");
            }
            render_line(line.trim_end(), &mut reader, &mut out, 0)?;
        }
    }
    Ok(())
}

fn is_continuous_feed(cmd: &str) -> bool {
    let mut words = cmd.split_whitespace().map(str::to_uppercase);
    words.next().as_deref() == Some("CHANGES") && words.any(|w| w == "CONTINUOUS")
}

/// Read and print one reply; returns whether it was `+OK`
fn render_reply(reader: &mut impl BufRead, out: &mut impl Write, depth: usize) -> Result<bool> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        bail!("Server closed the connection");
    }
    render_line(line.trim_end(), reader, out, depth)
}

fn render_line(
    response: &str,
    reader: &mut impl BufRead,
    out: &mut impl Write,
    depth: usize,
) -> Result<bool> {
    let indent = "  ".repeat(depth);

    if response.starts_with("+OK") {
        writeln!(out, "{}{}", indent, response.green())?;
        return Ok(true);
    } else if response.starts_with("+PONG") {
        writeln!(out, "{}{}", indent, "PONG".green())?;
    } else if response.starts_with("-ERR") {
        writeln!(out, "{}{}", indent, response.red())?;
    } else if let Some(n) = response.strip_prefix(':') {
        // Integer
        writeln!(out, "{}{}", indent, n.yellow())?;
    } else if response == "$-1" {
        writeln!(out, "{}{}", indent, "(nil)".dimmed())?;
    } else if response.starts_with('$') {
        // Bulk string, usually JSON
        let mut data = String::new();
        reader.read_line(&mut data)?;
        writeln!(out, "{}{}", indent, pretty(data.trim_end()))?;
    } else if let Some(count) = response.strip_prefix('*') {
        // Array
        let count: usize = count.parse().unwrap_or(0);
        if count == 0 {
            writeln!(out, "{}{}", indent, "(empty)".dimmed())?;
        }
        for i in 0..count {
            write!(out, "{}{}) ", indent, i + 1)?;
            render_reply(reader, out, depth + 1)?;
        }
    } else if let Some(frame) = response.strip_prefix('#') {
        // Change frame
        let (seq, record) = frame.split_once(' ').unwrap_or((frame, ""));
        writeln!(out, "{}{} {}", indent, format!("#{}", seq).blue(), record)?;
    } else {
        writeln!(out, "{}{}", indent, response)?;
    }
    Ok(false)
}

fn pretty(data: &str) -> String {
    serde_json::from_str::<serde_json::Value>(data)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or_else(|| data.to_string())
}

fn print_help() {
    println!(
        r#"
{}

{}
  GET <id>                               Get a document
  PUT <json>                             Create or update (include _rev to update)
  PUTFOREIGN <json>                      Store a document with its own _rev
  DEL <id> <rev>                         Delete a document
  BULK [ATOMIC] <json-array>             Write many documents at once
  KEYS [start] [end]                     List document IDs

{}
  CHANGES [SINCE <n>]                    Changes after sequence n
  CHANGES [SINCE <n>] CONTINUOUS         Follow changes as they happen

{}
  REPLICATE <url> [SINCE <n>] [CONTINUOUS]  Pull from another node
  UNREPLICATE <id>                       Stop a continuous replication

{}
  PING                                   Check connection
  INFO                                   Server information
  QUIT                                   Close connection

{}
  help                                   Show this help
  clear                                  Clear screen
  quit/exit                              Exit CLI
"#,
        "Sofa Commands".cyan().bold(),
        "Documents".yellow().bold(),
        "Changes".yellow().bold(),
        "Replication".yellow().bold(),
        "Server".yellow().bold(),
        "Local".yellow().bold(),
    );
}

fn home_dir() -> Option<std::path::PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(std::path::PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn render(input: &str) -> (bool, String) {
        colored::control::set_override(false);
        let mut reader = Cursor::new(input.as_bytes().to_vec());
        let mut out = Vec::new();
        let ok = render_reply(&mut reader, &mut out, 0).unwrap();
        (ok, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_render_array_of_change_frames() {
        let (ok, out) = render("*2\r\n#1 {\"id\":\"a\"}\r\n#2 {\"id\":\"b\"}\r\n");
        assert!(!ok);
        assert_eq!(out, "1)   #1 {\"id\":\"a\"}\n2)   #2 {\"id\":\"b\"}\n");
    }

    #[test]
    fn test_render_bulk_json_and_nil() {
        let (_, out) = render("$7\r\n{\"a\":1}\r\n");
        assert_eq!(out, "{\n  \"a\": 1\n}\n");

        let (_, out) = render("$-1\r\n");
        assert_eq!(out, "(nil)\n");
    }

    #[test]
    fn test_ok_is_reported() {
        let (ok, _) = render("+OK Streaming changes\r\n");
        assert!(ok);
    }

    #[test]
    fn test_continuous_feed_detection() {
        assert!(is_continuous_feed("changes since 3 continuous"));
        assert!(!is_continuous_feed("CHANGES SINCE 3"));
        assert!(!is_continuous_feed("REPLICATE http://x CONTINUOUS"));
    }
}
