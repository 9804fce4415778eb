use std::fs;

use clap::{crate_version, App, Arg};
use log::LevelFilter;
use pddb_decode::{
    decode, decode_with_credentials, encode_keyfile, parse_keyfile, BasisName, Config, KeyFileMode, KeyRom, TieBreak,
};
use pddb_tools::utils::{parse_credential, parse_u32, parse_u64, read_file};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("pddb-analyze")
        .version(crate_version!())
        .author("bunnie <bunnie@kosagi.com>")
        .about("Decode a PDDB image and check it for consistency")
        .arg(Arg::with_name("image").help("raw PDDB image, as dumped from flash").required(true).index(1))
        .arg(
            Arg::with_name("keyrom")
                .long("keyrom")
                .help("KEYROM dump of the device the image came from")
                .value_name("keyrom file")
                .takes_value(true)
                .required_unless("keyfile")
                .conflicts_with("keyfile"),
        )
        .arg(
            Arg::with_name("keyfile")
                .long("keyfile")
                .help("previously exported basis keys; skips password derivation")
                .value_name("key file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("password")
                .long("password")
                .help("boot password, used with --keyrom")
                .value_name("boot password")
                .takes_value(true)
                .required_unless("keyfile"),
        )
        .arg(
            Arg::with_name("basis")
                .long("basis")
                .help("secret basis to unlock, as name:passphrase. May be repeated.")
                .value_name("name:passphrase")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
        .arg(
            Arg::with_name("dna")
                .long("dna")
                .help("device DNA, bound into every page's AAD")
                .value_name("dna")
                .takes_value(true)
                .default_value("0"),
        )
        .arg(
            Arg::with_name("expect-trailers")
                .long("expect-trailers")
                .takes_value(false)
                .help("fail keys that lack a self-check trailer"),
        )
        .arg(Arg::with_name("dump").long("dump").takes_value(false).help("hex dump key contents"))
        .arg(
            Arg::with_name("probe-limit")
                .long("probe-limit")
                .help("number of dictionary indices to probe per basis")
                .value_name("count")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("keep-last")
                .long("keep-last")
                .takes_value(false)
                .help("on equal journal revisions, keep the later candidate instead of the first"),
        )
        .arg(
            Arg::with_name("export-keys")
                .long("export-keys")
                .help("write the basis keys used for this run to a key file")
                .value_name("key file")
                .takes_value(true),
        )
        .arg(Arg::with_name("verbose").short("v").multiple(true).help("log more; repeat for more detail"))
        .get_matches();

    let mut logger = env_logger::Builder::from_default_env();
    match matches.occurrences_of("verbose") {
        0 => {}
        1 => {
            logger.filter_level(LevelFilter::Info);
        }
        2 => {
            logger.filter_level(LevelFilter::Debug);
        }
        _ => {
            logger.filter_level(LevelFilter::Trace);
        }
    }
    logger.init();

    let mut config = Config::default();
    if let Some(dna) = matches.value_of("dna") {
        config.dna = parse_u64(dna)?;
    }
    if let Some(limit) = matches.value_of("probe-limit") {
        config.dict_probe_limit = parse_u32(limit)?;
    }
    config.expect_trailers = matches.is_present("expect-trailers");
    config.dump_data = matches.is_present("dump");
    if matches.is_present("keep-last") {
        config.tie_break = TieBreak::KeepLast;
    }

    let mut credentials: Vec<(BasisName, String)> = Vec::new();
    if let Some(values) = matches.values_of("basis") {
        for value in values {
            credentials.push(parse_credential(value)?);
        }
    }

    let image_path = matches.value_of("image").ok_or("no image specified")?;
    let image = read_file(image_path)?;
    log::info!("read {} bytes from {}", image.len(), image_path);

    let (report, keyring) = if let Some(keyfile) = matches.value_of("keyfile") {
        let (keyring, mode) = parse_keyfile(&read_file(keyfile)?)?;
        log::info!("loaded keys for {} bases ({:?}) from {}", keyring.len(), mode, keyfile);
        if !credentials.is_empty() {
            log::warn!("--basis credentials are ignored when a key file is given");
        }
        (decode(&image, &keyring, &config)?, keyring)
    } else {
        let keyrom_path = matches.value_of("keyrom").ok_or("no keyrom specified")?;
        let keyrom = KeyRom::from_bytes(&read_file(keyrom_path)?)?;
        let password = matches.value_of("password").ok_or("no boot password specified")?;
        decode_with_credentials(&image, keyrom, password, &credentials, &config)?
    };

    print!("{}", report);

    if let Some(path) = matches.value_of("export-keys") {
        let exported = encode_keyfile(&keyring, KeyFileMode::FullFidelity);
        fs::write(path, &exported[..])?;
        println!("Exported keys for {} bases to {}", keyring.len(), path);
    }

    if !report.passed() {
        std::process::exit(1);
    }
    Ok(())
}
