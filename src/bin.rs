extern crate atty;
#[macro_use]
extern crate clap;
extern crate env_logger;
extern crate libsleet;
#[macro_use]
extern crate log;
extern crate num_cpus;
extern crate tokio_core;

use std::fs::File;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::process::exit;
use std::time::Duration;

use clap::{App, Arg, ArgMatches, SubCommand};

use libsleet::{server, worker, VERSION};

const DEFAULT_SERVER_PORT: u16 = 7210;
const DEFAULT_WORKER_PORT: u16 = 0;
const DEFAULT_DELETE_INTERVAL_MS: u64 = 500;
const DEFAULT_HEARTBEAT_WINDOW_MS: u64 = 10_000;

fn parse_listen_arg(key: &str, args: &ArgMatches, default_port: u16) -> SocketAddr {
    if !args.is_present(key) {
        return SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), default_port);
    }

    value_t!(args, key, SocketAddr).unwrap_or_else(|_| match value_t!(args, key, IpAddr) {
        Ok(ip) => SocketAddr::new(ip, default_port),
        _ => SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            value_t_or_exit!(args, key, u16),
        ),
    })
}

// A file created once the process is ready; launchers poll for it.
fn create_ready_file(path: &Path) {
    match File::create(path) {
        Ok(mut file) => {
            let _ = writeln!(file, "ready");
        }
        Err(e) => warn!("Cannot create ready file {:?}: {}", path, e),
    }
}

fn run_server(_global_args: &ArgMatches, cmd_args: &ArgMatches) {
    let listen_address = parse_listen_arg("LISTEN_ADDRESS", cmd_args, DEFAULT_SERVER_PORT);
    let delete_interval =
        value_t!(cmd_args, "DELETE_INTERVAL", u64).unwrap_or(DEFAULT_DELETE_INTERVAL_MS);
    let heartbeat_window =
        value_t!(cmd_args, "HEARTBEAT_WINDOW", u64).unwrap_or(DEFAULT_HEARTBEAT_WINDOW_MS);
    info!(
        "Starting sleet {} scheduler at port {}",
        VERSION, listen_address
    );

    let debug_mode = ::std::env::var("SLEET_DEBUG_MODE")
        .map(|s| s == "1")
        .unwrap_or(false);
    if debug_mode {
        ::libsleet::DEBUG_CHECK_CONSISTENCY.store(true, ::std::sync::atomic::Ordering::Relaxed);
        info!("DEBUG mode enabled");
    }

    let mut core = tokio_core::reactor::Core::new().unwrap();
    let state = server::state::StateRef::new(
        core.handle(),
        listen_address,
        Duration::from_millis(delete_interval),
        Duration::from_millis(heartbeat_window),
    );
    state.start();

    if let Some(name) = cmd_args.value_of("READY_FILE") {
        create_ready_file(Path::new(name));
    }

    loop {
        core.turn(None);
        if !state.turn() {
            break;
        }
    }
}

fn run_worker(_global_args: &ArgMatches, cmd_args: &ArgMatches) {
    let listen_address = parse_listen_arg("LISTEN_ADDRESS", cmd_args, DEFAULT_WORKER_PORT);
    let mut server_address = cmd_args.value_of("SERVER_ADDRESS").unwrap().to_string();
    if !server_address.contains(':') {
        server_address = format!("{}:{}", server_address, DEFAULT_SERVER_PORT);
    }

    let server_addr = match server_address.to_socket_addrs() {
        Err(_) => {
            error!("Cannot resolve server address");
            exit(1);
        }
        Ok(mut addrs) => match addrs.next() {
            None => {
                error!("Cannot resolve server address");
                exit(1);
            }
            Some(ref addr) => *addr,
        },
    };

    fn detect_cpus() -> i32 {
        debug!("Detecting number of cpus");
        let cpus = num_cpus::get();
        if cpus < 1 {
            error!("Autodetection of CPUs failed. Use --cpus with a positive argument.");
            exit(1);
        }
        cpus as i32
    }

    let cpus = if cmd_args.value_of("CPUS") != Some("detect") {
        let value = value_t_or_exit!(cmd_args, "CPUS", i32);
        if value < 0 {
            let cpus = detect_cpus();
            if cpus <= -value {
                error!(
                    "{} cpus detected and {} is subtracted via --cpus. No cpus left.",
                    cpus, -value
                );
                exit(1);
            }
            detect_cpus() + value
        } else {
            value
        }
    } else {
        detect_cpus()
    };
    assert!(cpus >= 0);

    info!("Starting sleet {} as worker", VERSION);
    info!("Resources: {} cpus", cpus);
    info!(
        "Server address {} was resolved as {}",
        server_address, server_addr
    );

    let mut core = tokio_core::reactor::Core::new().unwrap();
    let state = worker::state::StateRef::new(
        core.handle(),
        server_addr,
        listen_address,
        cpus as u32,
        worker::executor::Registry::with_builtins(),
    );
    state.start();

    if let Some(name) = cmd_args.value_of("READY_FILE") {
        create_ready_file(Path::new(name));
    }

    loop {
        core.turn(None);
    }
}

fn init_log() {
    // Simple logger with better module log control, default level INFO
    if ::std::env::var("RUST_LOG").is_err() {
        ::std::env::set_var("RUST_LOG", "info");
    }
    if ::atty::is(::atty::Stream::Stdout) {
        ::env_logger::Builder::new()
            .format(|buf, record| {
                use env_logger::Color;
                use log::Level;

                let ts = buf.timestamp();
                let level = record.level();
                let mut level_style = buf.style();

                match level {
                    Level::Trace => level_style.set_color(Color::White),
                    Level::Debug => level_style.set_color(Color::Blue),
                    Level::Info => level_style.set_color(Color::Green),
                    Level::Warn => level_style.set_color(Color::Yellow),
                    Level::Error => level_style.set_color(Color::Red).set_bold(true),
                };
                let mut cloud_style = buf.style();
                cloud_style.set_color(Color::Cyan);
                writeln!(
                    buf,
                    "{} {:>5} {} {}",
                    cloud_style.value("\u{1F328}"),
                    level_style.value(level),
                    ts,
                    record.args()
                )
            })
            .parse(&::std::env::var("RUST_LOG").unwrap_or("info".into()))
            .init();
    } else {
        ::env_logger::init();
    }
}

fn main() {
    init_log();

    let args = App::new("Sleet")
        .version(VERSION)
        .about("Distributed task-graph scheduler and executor")
        .subcommand( // ---- SERVER ----
            SubCommand::with_name("server")
                .about("Sleet scheduler")
                .arg(Arg::with_name("LISTEN_ADDRESS")
                    .short("l")
                    .long("--listen")
                    .help("Listening port/address/address:port (default 0.0.0.0:7210)")
                    .takes_value(true))
                .arg(Arg::with_name("DELETE_INTERVAL")
                    .long("--delete-interval")
                    .value_name("MS")
                    .help("Milliseconds between bulk delete-data flushes (default 500)")
                    .takes_value(true))
                .arg(Arg::with_name("HEARTBEAT_WINDOW")
                    .long("--heartbeat-window")
                    .value_name("MS")
                    .help("Milliseconds of worker silence before removal (default 10000)")
                    .takes_value(true))
                .arg(Arg::with_name("READY_FILE")
                    .long("--ready-file")
                    .help("Create a file when the scheduler is ready to accept connections")
                    .takes_value(true)))
        .subcommand( // ---- WORKER ----
            SubCommand::with_name("worker")
                .about("Sleet worker")
                .arg(Arg::with_name("SERVER_ADDRESS")
                    .help("Scheduler address: port/address/address:port (default 0.0.0.0:7210)")
                    .required(true))
                .arg(Arg::with_name("LISTEN_ADDRESS")
                    .short("l")
                    .long("--listen")
                    .value_name("ADDRESS")
                    .help("Data port listening port/address/address:port (default = 0.0.0.0:auto)")
                    .takes_value(true))
                .arg(Arg::with_name("CPUS")
                    .long("--cpus")
                    .help("Number of cpus or 'detect' (default = detect)")
                    .value_name("N")
                    .default_value("detect"))
                .arg(Arg::with_name("READY_FILE")
                    .long("--ready-file")
                    .value_name("FILE")
                    .help("Create a file when the worker is registered with the scheduler")
                    .takes_value(true)))
        .get_matches();

    match args.subcommand() {
        ("server", Some(cmd_args)) => run_server(&args, cmd_args),
        ("worker", Some(cmd_args)) => run_worker(&args, cmd_args),
        _ => {
            error!("No subcommand provided.");
            ::std::process::exit(1);
        }
    }
}
