use clap::{App, Arg};
use flint::logging;
use uacore::config::ServerConfig;
use uacore::server::Server;

pub fn main() {
    let matches = App::new("UA Server Runner")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Runs the OPC UA secure channel server.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .get_matches();

    let config_file_path = matches.value_of("CONFIG_FILE").unwrap();
    let config = ServerConfig::load(config_file_path);

    // Initialize logging
    let logger = logging::init();

    logging::info!(logger, "starting server";
                   "config" => config_file_path,
                   "address" => &config.server.address);

    let mut server = match Server::new(config, &logger) {
        Ok(server) => server,
        Err(err) => {
            logging::crit!(logger, "server startup failed"; "error" => err);
            std::process::exit(1);
        }
    };

    server.run();
}
