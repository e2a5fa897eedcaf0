//! panehost - attach the host terminal to one managed pane
//!
//! Spawns (or re-attaches to) a pane session through the library's
//! `SessionManager` and relays keystrokes, output and window size between
//! the host terminal and the pane's PTY.
//!
//! # Quick Start
//!
//! ```text
//! panehost                        # default shell, workspace "default", pane "main"
//! panehost --shell /bin/zsh       # custom shell
//! panehost -w api -p server       # separate pane with its own scrollback
//! panehost -s /bin/zsh --save-config  # persist the shell choice
//! ```
//!
//! Press `Ctrl+]` to detach.

use std::env;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use crossterm::terminal;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use panehost::config::app_dir;
use panehost::{AttachResult, Config, CreateRequest, PaneEvent, SessionManager};

/// Ctrl+]
const DETACH_KEY: u8 = 0x1d;

const RESIZE_POLL: Duration = Duration::from_millis(250);

/// Command line options
struct Options {
    shell: Option<String>,
    workspace: String,
    pane: String,
    cwd: Option<PathBuf>,
    config: Option<PathBuf>,
    save_config: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            shell: None,
            workspace: "default".to_string(),
            pane: "main".to_string(),
            cwd: None,
            config: None,
            save_config: false,
        }
    }
}

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    eprintln!("panehost {}", VERSION);
}

fn print_help() {
    eprintln!("panehost {} - PTY session host", VERSION);
    eprintln!();
    eprintln!("Usage: panehost [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -s, --shell <CMD>       Shell to launch (default: config or $SHELL)");
    eprintln!("  -w, --workspace <ID>    Workspace id (default: default)");
    eprintln!("  -p, --pane <ID>         Pane id (default: main)");
    eprintln!("  -C, --cwd <DIR>         Working directory for a new session");
    eprintln!("  -c, --config <FILE>     Config file (default: ~/.panehost/config.toml)");
    eprintln!("      --save-config       Write the effective config file and exit");
    eprintln!("  -V, --version           Show version");
    eprintln!("  -h, --help              Show this help");
    eprintln!();
    eprintln!("Keys:");
    eprintln!("  Ctrl+]                  Detach");
    eprintln!();
    eprintln!("Logs: ~/.panehost/panehost.log (level from PANEHOST_LOG)");
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = env::args().collect();
    let mut options = Options::default();
    let mut i = 1;

    fn value(args: &[String], i: usize, flag: &str) -> Result<String, String> {
        args.get(i)
            .cloned()
            .ok_or_else(|| format!("Missing argument for {}", flag))
    }

    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-V" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-s" | "--shell" => {
                i += 1;
                options.shell = Some(value(&args, i, flag)?);
            }
            "-w" | "--workspace" => {
                i += 1;
                options.workspace = value(&args, i, flag)?;
            }
            "-p" | "--pane" => {
                i += 1;
                options.pane = value(&args, i, flag)?;
            }
            "-C" | "--cwd" => {
                i += 1;
                options.cwd = Some(PathBuf::from(value(&args, i, flag)?));
            }
            "-c" | "--config" => {
                i += 1;
                options.config = Some(PathBuf::from(value(&args, i, flag)?));
            }
            "--save-config" => options.save_config = true,
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(options)
}

fn init_logging() {
    let log_path = app_dir()
        .map(|dir| dir.join("panehost.log"))
        .unwrap_or_else(|| PathBuf::from("panehost.log"));

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_env("PANEHOST_LOG")
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn main() -> anyhow::Result<()> {
    let options = match parse_args() {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    init_logging();
    info!("panehost {} starting...", VERSION);

    let mut config = match &options.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if let Some(shell) = &options.shell {
        config.shell = Some(shell.clone());
    }

    if options.save_config {
        let path = match &options.config {
            Some(path) => {
                config.save_to(path)?;
                path.clone()
            }
            None => config.save()?,
        };
        info!("Saved config to {}", path.display());
        eprintln!("Saved config to {}", path.display());
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(config, options))
}

/// How the relay loop ended
enum Ending {
    Detached,
    Exited(i32),
}

enum Input {
    Bytes(Vec<u8>),
    Detach,
}

async fn run(config: Config, options: Options) -> anyhow::Result<()> {
    let manager = SessionManager::new(config);
    let (cols, rows) = terminal::size().unwrap_or((80, 24));

    let mut request = CreateRequest::new(&options.pane, &options.pane, &options.workspace)
        .size(cols, rows);
    if let Some(cwd) = options.cwd {
        request = request.cwd(cwd);
    }
    let attach = manager.create_or_attach(request).await?;
    info!(
        "[{}] Attached (new: {}, recovered: {})",
        options.pane, attach.is_new, attach.was_recovered
    );

    terminal::enable_raw_mode()?;
    let ending = relay(&manager, &options.pane, attach).await;
    let _ = terminal::disable_raw_mode();

    match &ending {
        Ok(Ending::Detached) => eprintln!("\r\n[detached from {}]", options.pane),
        Ok(Ending::Exited(code)) => eprintln!("\r\n[{} exited with code {}]", options.pane, code),
        Err(_) => {}
    }

    manager.cleanup().await;
    ending.map(|_| ())
}

async fn relay(
    manager: &SessionManager,
    pane_id: &str,
    attach: AttachResult,
) -> anyhow::Result<Ending> {
    let mut stdout = std::io::stdout();
    stdout.write_all(attach.scrollback.as_bytes())?;
    stdout.flush()?;

    let mut events = attach.events;
    let mut input = spawn_stdin_reader()?;
    let mut ticker = tokio::time::interval(RESIZE_POLL);
    let mut size = terminal::size().ok();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(PaneEvent::Data(data)) => {
                    stdout.write_all(&data)?;
                    stdout.flush()?;
                }
                Ok(PaneEvent::Exit { exit_code, .. }) => return Ok(Ending::Exited(exit_code)),
                Err(RecvError::Lagged(n)) => warn!("[{}] Dropped {} output events", pane_id, n),
                Err(RecvError::Closed) => return Ok(Ending::Detached),
            },
            key = input.recv() => match key {
                Some(Input::Bytes(data)) => {
                    if let Err(e) = manager.write(pane_id, &data).await {
                        warn!("[{}] Input dropped: {}", pane_id, e);
                    }
                }
                Some(Input::Detach) | None => {
                    manager.detach(pane_id).await;
                    return Ok(Ending::Detached);
                }
            },
            _ = ticker.tick() => {
                let current = terminal::size().ok();
                if current != size {
                    if let Some((cols, rows)) = current {
                        manager.resize(pane_id, cols, rows).await;
                    }
                    size = current;
                }
            }
        }
    }
}

/// Blocking stdin reader; stops at the detach key
fn spawn_stdin_reader() -> std::io::Result<mpsc::UnboundedReceiver<Input>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("panehost-stdin".to_string())
        .spawn(move || {
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; 1024];
            loop {
                let n = match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let chunk = &buf[..n];
                if let Some(pos) = chunk.iter().position(|&b| b == DETACH_KEY) {
                    if pos > 0 {
                        let _ = tx.send(Input::Bytes(chunk[..pos].to_vec()));
                    }
                    let _ = tx.send(Input::Detach);
                    break;
                }
                if tx.send(Input::Bytes(chunk.to_vec())).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}
