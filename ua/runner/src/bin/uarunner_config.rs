use clap::{App, Arg};
use std::fs;
use uacore::config::ServerConfig;

/// Writes the default server configuration to the given path.
pub fn main() {
    let matches = App::new("UA Server Config Generator")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Writes the default server configuration file.")
        .arg(
            Arg::with_name("OUT_FILE")
                .help("Path of the config file to write")
                .required(true),
        )
        .get_matches();

    let out_path = matches.value_of("OUT_FILE").unwrap();
    let config = ServerConfig::default();

    fs::write(out_path, config.to_toml()).expect("Error writing config file");
    println!("Wrote default configuration to {}", out_path);
}
