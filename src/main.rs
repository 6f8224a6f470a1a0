use std::env::set_var;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use clap::{arg, command, ArgAction};
use log::*;
use nix::sys::signal;

use rmfs::flocks::FlockSchedMode;
use rmfs::{Master, MasterOptions};

fn now() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0)
}

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .about("metadata master: initialize, restore and compact the metadata store")
        .arg(arg!(-d --data <DIR> "Metadata data directory").default_value("."))
        .arg(arg!(-i --init "Initialize a fresh metadata store").action(ArgAction::SetTrue))
        .arg(arg!(-a --restore "Load the image, replay changelogs and store a fresh image")
            .action(ArgAction::SetTrue))
        .arg(arg!(--flockmode <MODE> "Flock scheduling: correct, linux or bsd")
            .required(false)
            .default_value("correct"))
        .arg(arg!(--sustain <SECONDS> "Session sustain time after disconnect")
            .required(false))
        .arg(arg!(--ignoreerrors "Keep loading over non-fatal metadata damage")
            .action(ArgAction::SetTrue))
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`")
            .action(ArgAction::SetTrue))
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    pub extern "C" fn signal_handler(_: i32) {
        unsafe {
            println!("[{}] Received signal, shutting down.", libc::getpid());
        }
        std::process::exit(0);
    }
    let sig_action = signal::SigAction::new(
        signal::SigHandler::Handler(signal_handler),
        signal::SaFlags::SA_NODEFER,
        signal::SigSet::empty(),
    );
    unsafe {
        if let Err(e) = signal::sigaction(signal::SIGINT, &sig_action) {
            println!("SIGINT signal set failed, {:?}", e);
        }
    }

    let data_dir = PathBuf::from(matches.get_one::<String>("data").unwrap());
    if !data_dir.is_dir() {
        return Err(anyhow!("{}: not a directory", data_dir.display()));
    }
    let flock_mode = match matches.get_one::<String>("flockmode").unwrap().as_str() {
        "correct" => FlockSchedMode::Correct,
        "linux" => FlockSchedMode::Linux,
        "bsd" => FlockSchedMode::Bsd,
        other => return Err(anyhow!("unknown flock mode: {}", other)),
    };
    let mut opts = MasterOptions {
        data_dir: Some(data_dir.clone()),
        flock_mode,
        ignore_load_errors: matches.get_flag("ignoreerrors"),
        ..Default::default()
    };
    if let Some(s) = matches.get_one::<String>("sustain") {
        opts.session_sustain_time = s.parse()?;
    }

    if matches.get_flag("init") {
        info!("Initializing fresh metadata in {}", data_dir.display());
        let metaid = now() as u64;
        let mut master = Master::new(now(), metaid, &opts)?;
        master.store_image()?;
        info!("All Done.");
        return Ok(());
    }

    // load the newest image and replay every changelog beyond it; with
    // `-a` also dump the compacted image back
    let mut master = Master::load(&opts)?;
    info!(
        "Loaded: {} inodes, {} chunks, {} sessions, meta version {}",
        master.tree.node_count(),
        master.chunks.count(),
        master.sessions.count(),
        master.chlog.version()
    );
    if matches.get_flag("restore") {
        master.store_image()?;
    }
    info!("All Done.");
    Ok(())
}
