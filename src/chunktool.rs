use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{arg, command, ArgAction};
use log::*;

use chunk_disk::scan::{Scanner, MODE_EMPTY, MODE_FAST, MODE_NAME, MODE_REPAIR};

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .about("offline chunk scan / repair tool")
        .arg(arg!([path] ... "Chunk file or chunk-server data path").required(true))
        .arg(arg!(-f --fast "Fast check (header and last data block crc only)").action(ArgAction::SetTrue))
        .arg(arg!(-r --repair "Repair (fix header from file name, recalculate crc)").action(ArgAction::SetTrue))
        .arg(arg!(-n --name "When the file name is wrong, fix it from the header").action(ArgAction::SetTrue))
        .arg(arg!(-e --empty "Also check crc values of absent blocks in 1.0 chunks").action(ArgAction::SetTrue))
        .arg(arg!(-x --showok "Print 'OK' for good files").action(ArgAction::SetTrue))
        .arg(arg!(-m --damaged <DIR> "Move damaged chunks to this directory").required(false))
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`").action(ArgAction::SetTrue))
        .get_matches();

    if matches.get_flag("verbose") {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    let mut mode = 0u8;
    if matches.get_flag("fast") {
        mode |= MODE_FAST;
    }
    if matches.get_flag("repair") {
        mode |= MODE_REPAIR;
    }
    if matches.get_flag("name") {
        mode |= MODE_NAME;
    }
    if matches.get_flag("empty") {
        mode |= MODE_EMPTY;
    }
    let showok = matches.get_flag("showok");

    let damaged = match matches.get_one::<String>("damaged") {
        Some(d) => {
            let p = PathBuf::from(d)
                .canonicalize()
                .map_err(|e| anyhow!("{}: {}", d, e))?;
            if !p.is_dir() {
                return Err(anyhow!("{}: not a directory", p.display()));
            }
            Some(p)
        }
        None => None,
    };

    let mut scanner = Scanner::new(mode, showok, damaged);
    let mut ret = 0u8;
    for path in matches.get_many::<String>("path").unwrap() {
        ret |= scanner.scan(std::path::Path::new(path));
    }
    scanner.finish();
    debug!("{} objects scanned", scanner.scanned());

    // exit status is the or-ed status bitmask: 0 only when no chunk
    // needed any action
    std::process::exit(ret as i32);
}
