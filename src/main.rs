#![cfg_attr(not(target_os = "windows"), allow(dead_code))]
use clap::{CommandFactory, Parser, error::ErrorKind};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
mod numeric;
mod timer;
use timer::{Request, instance_guard};
const LOG_ENV: &str = "SET_TIMER_RESOLUTION_LOG";
#[derive(Parser, Debug)]
#[command(
    name = "SetTimerResolution",
    version,
    about = "Raises the global timer resolution and holds it until the process is terminated"
)]
struct Cli {
    /// specify the desired resolution in 100-ns units
    #[arg(long, value_name = "RESOLUTION", value_parser = clap::value_parser!(u32).range(1..))]
    resolution: u32,
    /// hide the console window
    #[arg(long)]
    no_console: bool,
}
fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => {
                    eprintln!("\n{}", Cli::command().render_help());
                    ExitCode::FAILURE
                }
            };
        }
    };
    init_logging();
    let request = Request {
        resolution: cli.resolution,
        detach_console: cli.no_console,
        image_name: instance_guard::own_image_name(),
    };
    tracing::debug!(?request, "starting");
    run(&request)
}
#[cfg(target_os = "windows")]
fn run(request: &Request) -> ExitCode {
    let host = timer::windows::WindowsHost;
    let mut stdout = std::io::stdout().lock();
    match timer::Pipeline::new(&host).run(request, &mut stdout) {
        Ok(timer::Parked) => ExitCode::SUCCESS,
        Err(fatal) => {
            tracing::debug!(stage = ?fatal.stage, "aborted");
            eprintln!("{fatal}");
            ExitCode::FAILURE
        }
    }
}
#[cfg(not(target_os = "windows"))]
fn run(_request: &Request) -> ExitCode {
    eprintln!("SetTimerResolution only runs on Windows");
    ExitCode::FAILURE
}
