//! # modhost Loader Binary
//!
//! Host program around the module loader: registers itself, preloads the
//! configured modules, then loads, unloads and lists modules from the
//! command line or an interactive prompt.
//!
//! # Usage
//!
//! ```bash
//! # Load a module from the module directory and list the chain
//! modhost --load hdt3270 --list
//!
//! # Load despite a dependency mismatch, with debug logging
//! modhost --module-dir target/debug --load modhost_sample --force -v
//!
//! # Interactive session (ldmod / rmmod / lsmod / lsdep / moddir / quit)
//! modhost --config /etc/modhost/modhost.toml --interactive
//! ```

use clap::Parser;
use modhost::{Loader, ModuleImage, NativeLibrary, OpcodeTable, ShutdownHooks, StaticImage};
use modhost_common::prelude::*;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// modhost - runtime module loader
#[derive(Parser, Debug)]
#[command(name = "modhost")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Runtime module loader with dependency checking and instruction splicing")]
#[command(long_about = None)]
struct Args {
    /// Path to the loader configuration file (modhost.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Module directory. Pins the directory for the whole run.
    #[arg(long, value_name = "DIR")]
    module_dir: Option<PathBuf>,

    /// Load a module (can be specified multiple times)
    #[arg(short, long = "load", action = clap::ArgAction::Append)]
    loads: Vec<String>,

    /// Load modules even if their dependency check fails
    #[arg(short, long)]
    force: bool,

    /// Unload a module after loading (can be specified multiple times)
    #[arg(short, long = "unload", action = clap::ArgAction::Append)]
    unloads: Vec<String>,

    /// List loaded modules
    #[arg(long)]
    list: bool,

    /// Include unresolved host entry points in listings
    #[arg(long)]
    all: bool,

    /// List recorded dependencies
    #[arg(long)]
    deps: bool,

    /// Read loader commands from standard input
    #[arg(short, long)]
    interactive: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs and listings in JSON format
    #[arg(long)]
    json: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run() {
        error!("modhost failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => LoaderConfig::load(path)?,
        None => LoaderConfig::default(),
    };
    if let Some(dir) = &args.module_dir {
        config.module_dir = Some(dir.clone());
    }
    config.validate()?;

    setup_tracing(&args, config.shared.log_level);
    info!(
        "modhost v{} starting ({})",
        env!("CARGO_PKG_VERSION"),
        config.shared.service_name
    );

    let hooks = ShutdownHooks::global();
    let on_signal = Arc::clone(&hooks);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        on_signal.run();
        std::process::exit(130);
    })?;

    let loader = Loader::builder()
        .config(&config)
        .shutdown_hooks(Arc::clone(&hooks))
        .dispatch(OpcodeTable::new(Address::from_ptr(
            operation_exception as *const (),
        )))
        .initialize(HostImage::new())?;
    loader.set_device_equates(device_equates);

    if let Some(dir) = loader.module_dir() {
        info!("module directory {}", dir.display());
    }

    let result = session(&args, &loader);
    hooks.run();
    info!("modhost shutdown complete");
    result
}

/// Everything between initialisation and shutdown.
fn session(args: &Args, loader: &Loader) -> Result<(), Box<dyn std::error::Error>> {
    let load_flags = if args.force {
        LoadFlags::FORCE
    } else {
        LoadFlags::empty()
    };
    for name in &args.loads {
        // Failures are logged by the loader.
        let _ = loader.load(name, load_flags);
    }
    for name in &args.unloads {
        let _ = loader.unload(name);
    }

    if args.deps {
        print_dependencies(loader, args.json)?;
    }
    if args.list {
        print_modules(loader, args.all, args.json)?;
    }
    if args.interactive {
        interactive(loader, args.json)?;
    }
    Ok(())
}

/// Setup tracing subscriber based on CLI arguments and configuration.
fn setup_tracing(args: &Args, level: LogLevel) {
    let directive = if args.verbose {
        LogLevel::Debug.as_directive()
    } else {
        level.as_directive()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

// ─── Host module ────────────────────────────────────────────────────

/// The host's own module image: built-in hooks first, then whatever the
/// platform loader can find in the running executable.
struct HostImage {
    builtin: StaticImage,
    native: Option<NativeLibrary>,
}

impl HostImage {
    fn new() -> Self {
        let native = NativeLibrary::open_self()
            .map_err(|e| warn!("executable symbols unavailable: {e}"))
            .ok();
        let builtin = StaticImage::new()
            .dependencies(host_dependencies)
            .register(host_register)
            .finalize(host_finalize);
        Self { builtin, native }
    }
}

impl ModuleImage for HostImage {
    fn symbol(&self, name: &str) -> Result<Address, String> {
        self.builtin.symbol(name).or_else(|builtin_err| match &self.native {
            Some(native) => native.symbol(name),
            None => Err(builtin_err),
        })
    }
}

fn host_dependencies(check: &mut DependencyCheck<'_>) -> Result<(), DependencyMismatch> {
    check.require_abi()?;
    check.require_type::<HostVersionFn>("HOST_VERSION_FN", ABI_VERSION)?;
    check.require_type::<HostLogFn>("HOST_LOG_FN", ABI_VERSION)
}

type HostVersionFn = fn() -> &'static str;
type HostLogFn = fn(&str, &str);

fn host_register(reg: &mut EntryRegistrar<'_>) {
    reg.entry("host_version", Address::from_ptr(host_version as *const ()));
    reg.entry("host_log", Address::from_ptr(host_log as *const ()));
    // Override points modules may provide.
    reg.entry("panel_command_hook", Address::NULL);
    reg.entry("system_command_hook", Address::NULL);
}

fn host_finalize() -> Result<(), i32> {
    info!("host finalized");
    Ok(())
}

fn host_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

fn host_log(module: &str, message: &str) {
    info!(module, "{message}");
}

fn operation_exception() {
    warn!("operation exception");
}

/// Device types served by another type's module.
fn device_equates(type_name: &str) -> Option<String> {
    let equated = match type_name.to_ascii_uppercase().as_str() {
        "3287" | "SYSG" => "3270",
        "3211" => "1403",
        "3410" | "3480" | "3490" | "3590" | "8809" | "9347" => "3420",
        "CTCT" | "CTCE" => "CTCI",
        _ => return None,
    };
    Some(equated.to_string())
}

// ─── Commands ───────────────────────────────────────────────────────

fn print_modules(loader: &Loader, all: bool, json: bool) -> Result<(), serde_json::Error> {
    let modules = loader.list(all);
    if json {
        println!("{}", serde_json::to_string_pretty(&modules)?);
    } else {
        for module in &modules {
            print!("{module}");
        }
    }
    Ok(())
}

fn print_dependencies(loader: &Loader, json: bool) -> Result<(), serde_json::Error> {
    let deps = loader.dependencies();
    if json {
        println!("{}", serde_json::to_string_pretty(&deps)?);
    } else {
        for dep in &deps {
            println!(
                "dependency = {}, version = {}, size = {}",
                dep.name, dep.version, dep.size
            );
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Control {
    Continue,
    Quit,
}

fn interactive(loader: &Loader, json: bool) -> std::io::Result<()> {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        if execute(loader, &line?, json) == Control::Quit {
            break;
        }
    }
    Ok(())
}

/// Run one interactive command. Failures are logged and the session goes on.
fn execute(loader: &Loader, line: &str, json: bool) -> Control {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Control::Continue;
    };
    let operands: Vec<&str> = words.collect();

    match command {
        "ldmod" => {
            let force = operands.first() == Some(&"-f");
            let names = if force { &operands[1..] } else { &operands[..] };
            if names.is_empty() {
                warn!("ldmod: module name missing");
            }
            let flags = if force {
                LoadFlags::FORCE
            } else {
                LoadFlags::empty()
            };
            for name in names {
                let _ = loader.load(name, flags);
            }
        }
        "rmmod" => {
            if operands.is_empty() {
                warn!("rmmod: module name missing");
            }
            for name in &operands {
                let _ = loader.unload(name);
            }
        }
        "lsmod" => {
            if let Err(e) = print_modules(loader, operands.first() == Some(&"all"), json) {
                error!("lsmod: {e}");
            }
        }
        "lsdep" => {
            if let Err(e) = print_dependencies(loader, json) {
                error!("lsdep: {e}");
            }
        }
        "moddir" => match operands.first() {
            Some(dir) => match loader.set_module_dir(Path::new(dir)) {
                Ok(in_effect) => println!("{}", in_effect.display()),
                Err(e) => error!(code = e.code(), "moddir: {e}"),
            },
            None => match loader.module_dir() {
                Some(dir) => println!("{}", dir.display()),
                None => println!("(none)"),
            },
        },
        "quit" | "exit" => return Control::Quit,
        other => warn!("unknown command: {other}"),
    }
    Control::Continue
}
