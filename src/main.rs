//! Command line for the PS4 second-screen library.

use std::net::IpAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use ps4_2ndscreen::blocking::{self, BlockingConsole};
use ps4_2ndscreen::{files, Console, CredentialError, CredentialService, DdpEndpoint};

type CliError = Box<dyn std::error::Error>;

#[derive(Parser)]
#[command(
    name = "ps4-2ndscreen",
    version,
    about = "Control PS4 consoles over the local network"
)]
struct Cli {
    /// Console IP address; defaults to the sole saved console.
    #[arg(short = 'i', long, global = true)]
    ip_address: Option<IpAddr>,
    /// PSN credential; defaults to the saved credential.
    #[arg(short = 'c', long, global = true)]
    credentials: Option<String>,
    /// Control (TCP) port override.
    #[arg(short = 'p', long, global = true)]
    port: Option<u16>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search the LAN for consoles.
    Search,
    /// Show the status of one console.
    Status,
    /// Run the credential service and save the captured credential.
    Credentials {
        /// Seconds to wait for the mobile app.
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },
    /// Pair with a console using the pin it shows under mobile-device
    /// registration.
    Link { pin: String },
    /// Wake a console from standby.
    Wakeup,
    /// Put a console into standby.
    Standby,
    /// Start a title (CUSA#####).
    Start { title_id: String },
    /// Press a remote-control button.
    Remote {
        button: String,
        /// Hold time in milliseconds; only the PS button honors it.
        #[arg(long, default_value_t = 0)]
        hold_ms: u32,
    },
    /// Poll saved consoles and accept commands interactively.
    Interactive,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    match &cli.command {
        Command::Search => search(),
        Command::Status => status(resolve_ip(&cli)?),
        Command::Credentials { timeout } => credentials(*timeout),
        Command::Link { pin } => link(&cli, pin),
        Command::Wakeup => {
            console(&cli)?.wakeup()?;
            println!("wakeup sent");
            Ok(())
        }
        Command::Standby => {
            console(&cli)?.standby()?;
            println!("standby requested");
            Ok(())
        }
        Command::Start { title_id } => start(&cli, title_id),
        Command::Remote { button, hold_ms } => {
            console(&cli)?.remote_control(button, *hold_ms)?;
            println!("sent {button}");
            Ok(())
        }
        Command::Interactive => interactive(&cli),
    }
}

fn resolve_ip(cli: &Cli) -> Result<IpAddr, CliError> {
    if let Some(ip) = cli.ip_address {
        return Ok(ip);
    }
    let consoles = files::load_consoles()?;
    if consoles.len() == 1 {
        if let Some(ip) = consoles.keys().next() {
            return Ok(ip.parse()?);
        }
    }
    Err("no console selected; pass --ip-address or link one first".into())
}

fn resolve_credentials(cli: &Cli, ip: IpAddr) -> Result<String, CliError> {
    if let Some(credentials) = &cli.credentials {
        return Ok(credentials.clone());
    }
    if let Some(credentials) = files::load_consoles()?.get(&ip.to_string()) {
        return Ok(credentials.clone());
    }
    if let Some(credentials) = files::load_credentials()? {
        return Ok(credentials);
    }
    Err("no credential saved; run the credentials command first".into())
}

fn console(cli: &Cli) -> Result<BlockingConsole, CliError> {
    let ip = resolve_ip(cli)?;
    let credentials = resolve_credentials(cli, ip)?;
    Ok(BlockingConsole::new(ip, &credentials, None, cli.port))
}

fn search() -> Result<(), CliError> {
    let found = blocking::search(None, Duration::from_secs(3))?;
    println!("found {} console(s):", found.len());
    for status in found {
        let ip = status
            .host_ip
            .map(|ip| ip.to_string())
            .unwrap_or_default();
        println!(
            "  {ip}  {}  ({} {})",
            status.host_name().unwrap_or("?"),
            status.code,
            status.status
        );
    }
    Ok(())
}

fn status(ip: IpAddr) -> Result<(), CliError> {
    match blocking::get_status(ip)? {
        Some(status) => {
            println!("{} {}", status.code, status.status);
            for (key, value) in &status.fields {
                println!("{key}: {value}");
            }
            Ok(())
        }
        None => Err(format!("no response from {ip}; ensure the console is connected").into()),
    }
}

fn credentials(timeout: u64) -> Result<(), CliError> {
    let runtime = tokio::runtime::Runtime::new()?;
    let result: Result<(), CliError> = runtime.block_on(async {
        let service = match CredentialService::bind(None).await {
            Ok(service) => service,
            Err(CredentialError::Bind { port, source }) => {
                return Err(format!(
                    "could not bind port {port} ({source}); the port is privileged, try sudo"
                )
                .into());
            }
            Err(err) => return Err(err.into()),
        };
        println!("with the PS4 Second Screen app, refresh devices and select this host");
        let credentials = service.listen(Duration::from_secs(timeout)).await?;
        let path = files::save_credentials(&credentials)?;
        println!("credential: {credentials}");
        println!("saved to {}", path.display());
        Ok(())
    });
    result
}

fn link(cli: &Cli, pin: &str) -> Result<(), CliError> {
    if !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err("pin must be all digits".into());
    }
    let ip = resolve_ip(cli)?;
    let credentials = resolve_credentials(cli, ip)?;
    let mut console = BlockingConsole::new(ip, &credentials, None, cli.port);
    console.login(Some(pin))?;
    let path = files::save_console(&ip.to_string(), &credentials)?;
    println!("linked {ip}; saved to {}", path.display());
    Ok(())
}

fn start(cli: &Cli, title_id: &str) -> Result<(), CliError> {
    let mut console = console(cli)?;
    console.get_status()?;
    let running = console
        .status()
        .and_then(|status| status.running_app_titleid().map(str::to_string));
    console.start_title(title_id, running.as_deref())?;
    println!("started {title_id}");
    Ok(())
}

fn interactive(cli: &Cli) -> Result<(), CliError> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_interactive(cli))
}

async fn run_interactive(cli: &Cli) -> Result<(), CliError> {
    let endpoint = DdpEndpoint::bind().await?;

    let mut targets: Vec<(IpAddr, String)> = Vec::new();
    if let Some(ip) = cli.ip_address {
        targets.push((ip, resolve_credentials(cli, ip)?));
    } else {
        for (ip, credentials) in files::load_consoles()? {
            targets.push((ip.parse()?, credentials));
        }
    }
    if targets.is_empty() {
        return Err("no consoles configured; link one first".into());
    }

    let mut consoles = Vec::new();
    for (ip, credentials) in targets {
        let console = Console::new(ip, &credentials, None, cli.port);
        console.attach(&endpoint);
        console.set_status_callback(move |status| match status {
            Some(status) => println!(
                "[{ip}] {} {} {}",
                status.code,
                status.status,
                status.running_app_name().unwrap_or("")
            ),
            None => println!("[{ip}] unreachable"),
        });
        consoles.push(console);
    }

    let pollers = consoles.clone();
    tokio::spawn(async move {
        loop {
            for console in &pollers {
                let _ = console.poll().await;
                if let (Some(id), Some(name)) =
                    (console.running_app_titleid(), console.running_app_name())
                {
                    let _ = files::record_title(&id, &name);
                }
            }
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
    });

    println!(
        "commands: list | use <ip> | status | wake | standby | start <title-id> \
         | remote <button> | quit"
    );
    let mut selected = 0usize;
    if consoles.len() > 1 {
        println!(
            "tracking {} consoles; commands go to {} (switch with: use <ip>)",
            consoles.len(),
            consoles[selected].host()
        );
    }
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        let Some(word) = parts.next() else { continue };
        if matches!(word, "quit" | "exit") {
            break;
        }
        let console = &consoles[selected];
        let result = match word {
            "list" => {
                for (index, console) in consoles.iter().enumerate() {
                    let marker = if index == selected { '*' } else { ' ' };
                    let state = match console.status() {
                        Some(status) => format!("{} {}", status.code, status.status),
                        None => "no status yet".to_string(),
                    };
                    println!("{marker} {}  {state}", console.host());
                }
                Ok(())
            }
            "use" => {
                match parts.next().and_then(|token| token.parse::<IpAddr>().ok()) {
                    Some(ip) => match consoles.iter().position(|c| c.host() == ip) {
                        Some(index) => {
                            selected = index;
                            println!("commands now go to {ip}");
                        }
                        None => println!("no tracked console at {ip}"),
                    },
                    None => println!("usage: use <ip>"),
                }
                Ok(())
            }
            "status" => {
                match console.status() {
                    Some(status) => {
                        println!("[{}] {} {}", console.host(), status.code, status.status)
                    }
                    None => println!("[{}] no status yet", console.host()),
                }
                Ok(())
            }
            "wake" => console.wakeup().await,
            "standby" => console.standby().await,
            "start" => match parts.next() {
                Some(title_id) => console.start_title(title_id, None).await,
                None => {
                    println!("usage: start <title-id>");
                    Ok(())
                }
            },
            "remote" => match parts.next() {
                Some(button) => console.remote_control(button, 0).await,
                None => {
                    println!("usage: remote <button>");
                    Ok(())
                }
            },
            other => {
                println!("unknown command: {other}");
                Ok(())
            }
        };
        if let Err(err) = result {
            println!("command failed: {err}");
        }
    }
    for console in &consoles {
        console.close().await;
    }
    Ok(())
}
