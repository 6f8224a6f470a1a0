extern crate core;

mod rmfs_lib;

pub use rmfs_lib::*;
