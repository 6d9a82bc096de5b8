//! Fluid Settings CLI (`fluid-settings`)
//!
//! Console access to the fluid-settings service: get, set and delete
//! values, list the declared options and services, or watch values until
//! interrupted. Exactly one command per invocation; exit code 0 on
//! success, 1 on any failure including a timeout.

use clap::Parser;
use fluid_settings::connection::cli_service_name;
use fluid_settings::{FluidSettings, LocalOptions, SessionConfig, SettingEvent, SettingStatus};
use fluid_settings_cli::display::render_value;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "fluid-settings",
    version,
    about = "Access the fluid-settings service from the console",
    group(clap::ArgGroup::new("command").required(true).multiple(false)),
)]
struct Args {
    /// Delete a value (return it to its default)
    #[arg(long, short = 'D', value_name = "NAME", group = "command")]
    delete: Option<String>,

    /// Get a value
    #[arg(long, short = 'g', value_name = "NAME", group = "command")]
    get: Option<String>,

    /// Get the default value if that field has one
    #[arg(long, short = 'G', value_name = "NAME", group = "command")]
    get_default: Option<String>,

    /// Retrieve a list of all the options
    #[arg(long, short = 'a', group = "command")]
    list_all: bool,

    /// Retrieve the options of the named service
    #[arg(long, short = 'l', value_name = "SERVICE", group = "command")]
    list_options: Option<String>,

    /// Retrieve a list of all the services using fluid-settings
    #[arg(long, short = 'L', group = "command")]
    list_services: bool,

    /// Set a value: NAME VALUE (or a single NAME=VALUE)
    #[arg(
        long,
        short = 's',
        visible_alias = "put",
        num_args = 1..=2,
        value_names = ["NAME", "VALUE"],
        group = "command"
    )]
    set: Option<Vec<String>>,

    /// Watch values until Ctrl-C is hit
    #[arg(long, short = 'w', value_name = "NAMES", group = "command")]
    watch: Option<String>,

    /// Watch values only while the fluid-settings service is up
    #[arg(long, short = 'W', value_name = "NAMES", group = "command")]
    watch_if_up: Option<String>,

    /// Time given for a message to be sent and a reply received
    #[arg(
        long,
        short = 't',
        env = "FLUID_SETTINGS_CLI_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    timeout: Duration,

    /// Communicator bus address:port
    #[arg(
        long,
        env = "FLUID_SETTINGS_CLI_COMMUNICATOR",
        default_value = "127.0.0.1:4050"
    )]
    communicator: String,

    /// Show additional information about the values
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    if run(args).await {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn run(args: Args) -> bool {
    let config = SessionConfig::new(&args.communicator, cli_service_name())
        .with_timeout(args.timeout);
    let (session, mut events) = FluidSettings::connect(config, LocalOptions::new());
    let verbose = args.verbose;

    if let Some(name) = &args.get {
        if session.get_value(name).is_err() {
            return false;
        }
        return await_value(&mut events, verbose).await;
    }
    if let Some(name) = &args.get_default {
        if session.get_default_value(name).is_err() {
            return false;
        }
        return await_value(&mut events, verbose).await;
    }
    if let Some(name) = &args.delete {
        if session.delete(name, None).is_err() {
            return false;
        }
        return await_simple(&mut events, SettingStatus::Deleted, verbose).await;
    }
    if let Some(set) = &args.set {
        let Some((name, value)) = split_set_argument(set) else {
            eprintln!("error: --set expects NAME VALUE or NAME=VALUE");
            return false;
        };
        if session.put(&name, &value, None).is_err() {
            return false;
        }
        return await_simple(&mut events, SettingStatus::Updated, verbose).await;
    }
    if args.list_all {
        return await_options(&session, &mut events, |name| Some(name.to_string())).await;
    }
    if args.list_services {
        let mut seen = std::collections::BTreeSet::new();
        return await_options(&session, &mut events, move |name| {
            let service = name.split("::").next().unwrap_or(name);
            seen.insert(service.to_string()).then(|| service.to_string())
        })
        .await;
    }
    if let Some(service) = &args.list_options {
        let prefix = format!("{service}::");
        return await_options(&session, &mut events, move |name| {
            name.strip_prefix(&prefix).map(|_| name.to_string())
        })
        .await;
    }
    if let Some(names) = args.watch.as_ref().or(args.watch_if_up.as_ref()) {
        let close_when_down = args.watch_if_up.is_some();
        for name in names.split(',').filter(|n| !n.is_empty()) {
            if session.add_watch(name).is_err() {
                return false;
            }
        }
        return watch_loop(&mut events, close_when_down, verbose).await;
    }

    // clap's arg group guarantees one command was chosen
    false
}

/// Wait for the reply to a single GET-style request.
async fn await_value(events: &mut mpsc::UnboundedReceiver<SettingEvent>, verbose: bool) -> bool {
    while let Some(event) = events.recv().await {
        match event {
            SettingEvent::Changed { status, name, value } => match status {
                SettingStatus::Value | SettingStatus::Default => {
                    let (rendered, clean) = render_value(&value);
                    if verbose {
                        let origin = if status == SettingStatus::Default {
                            " (default)"
                        } else {
                            ""
                        };
                        println!("{name}={rendered}{origin}");
                    } else {
                        println!("{rendered}");
                    }
                    if !clean {
                        eprintln!("warning: value of {name} contains invalid characters");
                    }
                    return clean;
                }
                SettingStatus::Undefined => {
                    eprintln!("error: {name} is not set");
                    return false;
                }
                SettingStatus::Timeout => {
                    eprintln!("error: request timed out");
                    return false;
                }
                SettingStatus::Unavailable => {
                    eprintln!("error: the fluid-settings service is not available");
                    return false;
                }
                _ => {}
            },
            SettingEvent::Failed { message, .. } => {
                eprintln!("error: {message}");
                return false;
            }
            _ => {}
        }
    }
    false
}

/// Wait for an UPDATED or DELETED acknowledgement.
async fn await_simple(
    events: &mut mpsc::UnboundedReceiver<SettingEvent>,
    expected: SettingStatus,
    verbose: bool,
) -> bool {
    while let Some(event) = events.recv().await {
        match event {
            SettingEvent::Changed { status, name, value } => {
                if status == expected {
                    if verbose {
                        if value.is_empty() {
                            println!("{name}: done");
                        } else {
                            println!("{name}: {value}");
                        }
                    }
                    return true;
                }
                match status {
                    SettingStatus::Timeout => {
                        eprintln!("error: request timed out");
                        return false;
                    }
                    SettingStatus::Unavailable => {
                        eprintln!("error: the fluid-settings service is not available");
                        return false;
                    }
                    _ => {}
                }
            }
            SettingEvent::Failed { message, .. } => {
                eprintln!("error: {message}");
                return false;
            }
            _ => {}
        }
    }
    false
}

/// Ask for the option list and print whatever the filter keeps.
async fn await_options(
    session: &FluidSettings,
    events: &mut mpsc::UnboundedReceiver<SettingEvent>,
    mut filter: impl FnMut(&str) -> Option<String>,
) -> bool {
    if session.list_options().is_err() {
        return false;
    }
    while let Some(event) = events.recv().await {
        match event {
            SettingEvent::Options(names) => {
                for name in &names {
                    if let Some(line) = filter(name) {
                        println!("{line}");
                    }
                }
                return true;
            }
            SettingEvent::Changed { status, .. } => match status {
                SettingStatus::Timeout => {
                    eprintln!("error: request timed out");
                    return false;
                }
                SettingStatus::Unavailable => {
                    eprintln!("error: the fluid-settings service is not available");
                    return false;
                }
                _ => {}
            },
            SettingEvent::Failed { message, .. } => {
                eprintln!("error: {message}");
                return false;
            }
            _ => {}
        }
    }
    false
}

/// Print watched values until Ctrl-C (or, with `--watch-if-up`, until the
/// service goes away).
async fn watch_loop(
    events: &mut mpsc::UnboundedReceiver<SettingEvent>,
    close_when_down: bool,
    verbose: bool,
) -> bool {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return true,
            event = events.recv() => match event {
                Some(SettingEvent::Changed { status, name, value }) => match status {
                    SettingStatus::NewValue => {
                        let (rendered, clean) = render_value(&value);
                        println!("{name}={rendered}");
                        if !clean {
                            eprintln!("warning: value of {name} contains invalid characters");
                        }
                    }
                    SettingStatus::Undefined => println!("{name} is not set"),
                    SettingStatus::Ready => {
                        if verbose {
                            println!("all current values received");
                        }
                    }
                    SettingStatus::Unavailable if close_when_down => {
                        eprintln!("error: the fluid-settings service is not available");
                        return false;
                    }
                    _ => {}
                },
                Some(_) => {}
                None => return false,
            },
        }
    }
}

/// `--set` accepts `NAME VALUE` or a single `NAME=VALUE`.
fn split_set_argument(set: &[String]) -> Option<(String, String)> {
    match set {
        [name, value] => Some((name.clone(), value.clone())),
        [pair] => pair
            .split_once('=')
            .map(|(name, value)| (name.to_string(), value.to_string())),
        _ => None,
    }
}

/// RUST_LOG wins when set; otherwise stay quiet unless --verbose.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
