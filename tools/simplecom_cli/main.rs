//! Terminal front end for SimpleCom.
//!
//! Lists serial ports, or opens one and bridges it to the terminal: received
//! data is printed with a timestamp at the start of each line (or as hex),
//! and every stdin line is sent with the selected line ending.
//!
//! # Usage
//!
//! ```bash
//! simplecom_cli ports
//! simplecom_cli open /dev/ttyUSB0 --baud 9600 --line-ending lf
//! simplecom_cli open --hex          # last used port and baud
//! ```
//!
//! Port, baud, line ending and history are shared with the desktop app's
//! settings file.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};

use clap::{Args, Parser, Subcommand};

use simplecom_lib::console::{lock_console, send_text, Console, ConsoleUpdate};
use simplecom_lib::io::serial::{list_ports, LineEnding, SystemPorts, WorkerEvent};
use simplecom_lib::settings::{default_settings_path, AppSettings};
use simplecom_lib::settings_store::SettingsStore;

#[derive(Parser)]
#[command(name = "simplecom_cli")]
#[command(about = "Serial port debug terminal")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List available serial ports
    Ports,
    /// Open a port and bridge it to this terminal
    Open(OpenArgs),
}

#[derive(Args)]
struct OpenArgs {
    /// Port to open (default: last used port)
    port: Option<String>,

    /// Baud rate (default: last used baud rate)
    #[arg(short, long)]
    baud: Option<u32>,

    /// Line ending appended to each sent line: none, cr, lf, crlf
    #[arg(short = 'e', long)]
    line_ending: Option<LineEnding>,

    /// Print received bytes as hex instead of text
    #[arg(long)]
    hex: bool,

    /// Also write the diagnostic log to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Ports => list(),
        Command::Open(args) => open(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn list() -> Result<(), Box<dyn std::error::Error>> {
    let ports = list_ports();
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }

    for port in ports {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => {
                println!("{:<24} {} [{:04x}:{:04x}]", port.port_name, port.description, vid, pid)
            }
            _ => println!("{:<24} {}", port.port_name, port.description),
        }
    }
    Ok(())
}

fn open(args: OpenArgs) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(dir) = &args.log_dir {
        simplecom_lib::init_file_logging(dir)?;
    }

    let settings = match default_settings_path() {
        Some(path) => SettingsStore::open(path),
        None => SettingsStore::in_memory(AppSettings::default()),
    };
    let saved = settings.get();
    let port = args.port.unwrap_or(saved.port);
    let baud_rate = args.baud.unwrap_or(saved.baud_rate);

    let (events_tx, events_rx) = mpsc::channel();
    let console = Arc::new(Mutex::new(Console::new(
        SystemPorts,
        events_tx,
        settings.clone(),
    )));

    {
        let mut console = lock_console(&console);
        if let Some(line_ending) = args.line_ending {
            console.set_line_ending(line_ending);
        }
        console.connect(&port, baud_rate)?;
        eprintln!(
            "Connected to {} at {} baud, line ending {}. Ctrl-D to quit.",
            port,
            baud_rate,
            console.line_ending()
        );
    }

    let printer = {
        let console = console.clone();
        let settings = settings.clone();
        let hex = args.hex;
        std::thread::spawn(move || print_events(events_rx, console, settings, hex))
    };

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if let Err(e) = send_text(&console, &line) {
            eprintln!("Send failed: {}", e);
        }
    }

    lock_console(&console).disconnect();
    let _ = printer.join();
    settings.flush()?;
    simplecom_lib::stop_file_logging();
    Ok(())
}

/// Print worker events until the connection ends. An unexpected disconnect
/// ends the process with status 1.
fn print_events(
    events: mpsc::Receiver<WorkerEvent>,
    console: Arc<Mutex<Console>>,
    settings: Arc<SettingsStore>,
    hex: bool,
) {
    let stdout = std::io::stdout();
    for event in events {
        let update = lock_console(&console).handle_event(event, chrono::Local::now());
        match update {
            ConsoleUpdate::Received { text, bytes, .. } => {
                let mut out = stdout.lock();
                if hex {
                    let hex: Vec<String> = bytes.chunks(1).map(hex::encode_upper).collect();
                    let _ = writeln!(out, "{}", hex.join(" "));
                } else {
                    let _ = write!(out, "{}", text);
                }
                let _ = out.flush();
            }
            ConsoleUpdate::Disconnected { error: None, .. } => break,
            ConsoleUpdate::Disconnected { error: Some(e), .. } => {
                eprintln!("\n{}", e);
                let _ = settings.flush();
                std::process::exit(1);
            }
        }
    }
}
