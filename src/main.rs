use clap::{Parser, Subcommand};
use fourward::capture::AfPacketSocket;
use fourward::config;
use fourward::dataplane::Router;
use fourward::telemetry::{init_logging, MetricsRegistry};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Consecutive receive failures on one device before giving up
const MAX_RECV_ERRORS: u32 = 8;

#[derive(Parser)]
#[command(name = "fourward")]
#[command(about = "A userspace IPv4 router with NAPT")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the router daemon
    Run {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Validate config.toml without running
    Validate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Run { config }) => cmd_run(&config),
        Some(Commands::Validate { config }) => cmd_validate(&config),
        None => cmd_run(&PathBuf::from("config.toml")),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn cmd_validate(config_path: &PathBuf) -> Result<(), String> {
    println!("[INFO] Validating {}...", config_path.display());

    let cfg = config::load(config_path).map_err(|e| e.to_string())?;
    let validation = config::validate(&cfg);
    validation.print_diagnostics();

    if validation.has_errors() {
        Err("validation failed".to_string())
    } else {
        println!("[INFO] Configuration is valid");
        Ok(())
    }
}

fn cmd_run(config_path: &PathBuf) -> Result<(), String> {
    let cfg = config::load(config_path)
        .map_err(|e| format!("failed to load {}: {}", config_path.display(), e))?;

    init_logging(Some(&cfg.log));

    let validation = config::validate(&cfg);
    validation.print_diagnostics();
    if validation.has_errors() {
        return Err("validation failed".to_string());
    }

    let metrics = Arc::new(MetricsRegistry::new());
    let mut router = Router::new(metrics);

    // Configuration failures at startup are fatal
    for (name, iface) in &cfg.interfaces {
        info!("binding to {}...", name);
        let socket = AfPacketSocket::bind(name)
            .map_err(|e| format!("failed to bind {}: {} (run as root?)", name, e))?;
        let mac = socket
            .hardware_addr()
            .map_err(|e| format!("failed to read MAC of {}: {}", name, e))?;

        let dev = router.register_device(name.clone(), mac, Box::new(socket));
        if let Some(cidr) = &iface.address {
            let (address, prefix_len) =
                config::parse_cidr(cidr).ok_or_else(|| format!("{}: bad address {}", name, cidr))?;
            router.set_address(dev, address, config::prefix_to_netmask(prefix_len));
        }
    }

    for route in &cfg.routing.static_routes {
        let (prefix, prefix_len) = config::parse_cidr(&route.destination)
            .ok_or_else(|| format!("bad route destination {}", route.destination))?;
        let next_hop = route
            .gateway
            .parse()
            .map_err(|_| format!("bad gateway {}", route.gateway))?;
        router.add_route(prefix, prefix_len, next_hop);
    }

    if let Some(nat) = &cfg.nat {
        if nat.enabled {
            let inside = router
                .find_device(&nat.inside)
                .ok_or_else(|| format!("napt: unknown interface {}", nat.inside))?;
            let outside = router
                .find_device(&nat.outside)
                .ok_or_else(|| format!("napt: unknown interface {}", nat.outside))?;
            router.enable_napt(inside, outside).map_err(|e| e.to_string())?;
        }
    }

    info!(
        "router started with {} interfaces ('a' arp, 'n' nat, 'q' quit)",
        router.device_count()
    );
    run_loop(&mut router)
}

fn run_loop(router: &mut Router) -> Result<(), String> {
    let console = Console::new().map_err(|e| format!("failed to set up console: {}", e))?;
    let mut error_streaks = vec![0u32; router.device_count()];

    loop {
        match console.read_key() {
            Some(b'a') => print!("{}", router.dump_arp_table()),
            Some(b'n') => print!("{}", router.dump_nat_table()),
            Some(b'q') => break,
            _ => {}
        }

        for dev in 0..router.device_count() {
            match router.poll_device(dev) {
                Ok(_) => error_streaks[dev] = 0,
                Err(e) => {
                    error!("receive error on {}: {}", router.device_name(dev), e);
                    error_streaks[dev] += 1;
                    if error_streaks[dev] >= MAX_RECV_ERRORS {
                        return Err(format!(
                            "persistent receive errors on {}",
                            router.device_name(dev)
                        ));
                    }
                }
            }
        }
    }

    info!("goodbye");
    Ok(())
}

/// Puts stdin into non-canonical non-blocking mode so single keystrokes are
/// visible to the poll loop, and restores the terminal on drop.
struct Console {
    saved_termios: libc::termios,
    saved_flags: libc::c_int,
}

impl Console {
    fn new() -> io::Result<Self> {
        let mut attr: libc::termios = unsafe { std::mem::zeroed() };
        if unsafe { libc::tcgetattr(0, &mut attr) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let saved_termios = attr;

        attr.c_lflag &= !(libc::ICANON | libc::ECHO);
        attr.c_cc[libc::VTIME] = 0;
        attr.c_cc[libc::VMIN] = 1;
        if unsafe { libc::tcsetattr(0, libc::TCSANOW, &attr) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let saved_flags = unsafe { libc::fcntl(0, libc::F_GETFL) };
        unsafe { libc::fcntl(0, libc::F_SETFL, saved_flags | libc::O_NONBLOCK) };

        Ok(Self {
            saved_termios,
            saved_flags,
        })
    }

    fn read_key(&self) -> Option<u8> {
        let mut byte = 0u8;
        let n = unsafe { libc::read(0, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        (n == 1).then_some(byte)
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(0, libc::TCSANOW, &self.saved_termios);
            libc::fcntl(0, libc::F_SETFL, self.saved_flags);
        }
    }
}
