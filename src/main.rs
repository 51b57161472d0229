// General flow:
//  - parse command line arguments, optionally starting from a JSON config file
//  - build the compression factory once (validates the level, loads the dictionary)
//  - accept new TCP connections, each one handled in its own task:
//      - wrap the accepted connection in the configured role
//      - connect to the next upstream server
//      - relay both directions until each side has closed, then close the wrapper
//
//  An encode-side proxy sits in front of plain clients and speaks zstd upstream.
//  A decode-side proxy accepts the zstd link and speaks plain bytes upstream.

use error_chain::ChainedError;
use stream_compress::errors::*;

use stream_compress::compression::StreamCompress;
use stream_compress::config::StreamCompressConfig;
use stream_compress::proxy;

use clap::{App, Arg};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const APP_NAME: &str = "stream-compress";
const ABOUT_STR: &str = "TCP proxy that compresses or decompresses each relayed \
    connection with zstd";

const PORT_HELP: &str = const_format::formatcp!(
    "port number receiving incoming connections on all interfaces, default {}",
    proxy::DEFAULT_PORT
);

const LEVEL_HELP: &str = "compression level: fastest, default, better, best or a numeric zstd level";

fn run() -> Result<()> {
    let m = App::new(APP_NAME)
        .about(ABOUT_STR)
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("JSON file with algorithm, level, dictionary and role; flags override it"),
        )
        .arg(
            Arg::with_name("algorithm")
                .short("a")
                .long("algorithm")
                .takes_value(true)
                .help("compression algorithm, only zstd is supported"),
        )
        .arg(
            Arg::with_name("level")
                .short("l")
                .long("level")
                .takes_value(true)
                .help(LEVEL_HELP),
        )
        .arg(
            Arg::with_name("dictionary")
                .short("d")
                .long("dictionary")
                .takes_value(true)
                .help("Path to a zstd dictionary shared with the peer proxy."),
        )
        .arg(
            Arg::with_name("role")
                .short("r")
                .long("role")
                .takes_value(true)
                .possible_values(&["encode", "decode"])
                .required_unless("config")
                .help("encode: plain clients, compressed upstream; decode: the reverse"),
        )
        .arg(
            Arg::with_name("listen")
                .long("listen")
                .takes_value(true)
                .conflicts_with("port")
                .help("address receiving incoming connections in format ip:port"),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .takes_value(true)
                .help(PORT_HELP),
        )
        .arg(
            Arg::with_name("UPSTREAMS")
                .help("upstream addresses in format ip:port")
                .required(true)
                .multiple(true),
        )
        .get_matches_safe()
        .chain_err(|| "error parsing arguments")?;

    let mut config = match m.value_of("config") {
        Some(path) => StreamCompressConfig::from_json_file(Path::new(path))?,
        None => StreamCompressConfig::new(
            m.value_of("role")
                .chain_err(|| "no role given")?
                .parse()?,
        ),
    };
    if let Some(role) = m.value_of("role") {
        config.role = role.parse()?;
    }
    if let Some(algorithm) = m.value_of("algorithm") {
        config.algorithm = algorithm.to_string();
    }
    if let Some(level) = m.value_of("level") {
        config.level = level.to_string();
    }
    if let Some(dictionary) = m.value_of("dictionary") {
        config.dictionary = Some(PathBuf::from(dictionary));
    }

    let addr = match (m.value_of("listen"), m.value_of("port")) {
        (Some(a), _) => a
            .parse::<SocketAddr>()
            .chain_err(|| format!("error parsing listen address \"{}\"", a))?,
        (None, port) => {
            let port = match port {
                Some(p) => p
                    .parse()
                    .chain_err(|| format!("error parsing port number \"{}\"", p))?,
                None => proxy::DEFAULT_PORT,
            };
            SocketAddr::from((IpAddr::from([0, 0, 0, 0]), port))
        }
    };

    let upstreams = m
        .values_of("UPSTREAMS")
        .chain_err(|| "no upstream addresses")?
        .map(|a| {
            a.parse::<SocketAddr>()
                .chain_err(|| format!("error parsing socket address \"{}\"", a))
        })
        .collect::<Result<Vec<_>>>()?;

    let compress = StreamCompress::new(&config).chain_err(|| "error configuring compression")?;

    proxy::run(addr, upstreams, compress).chain_err(|| "error in proxy::run()")
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("{}", e.display_chain().to_string());
        std::process::exit(1);
    }
}
