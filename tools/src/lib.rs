extern crate log;
pub mod utils;
