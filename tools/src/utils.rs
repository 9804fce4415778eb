use std::fmt;
use std::fs::File;
use std::io::{self, Read};

use pddb_decode::{BasisName, PddbError};

#[derive(Debug)]
pub enum ConfigError {
    /// Couldn't parse string as number
    NumberParseError(String, std::num::ParseIntError),

    /// Number parsed, but doesn't fit the field it's for
    OutOfRange(String),

    /// A basis credential that isn't of the form `name:passphrase`
    CredentialFormat(String),

    /// The basis name in a credential was rejected
    Pddb(PddbError),

    /// Generic IO Error
    IoError(io::Error),
}

impl std::convert::From<io::Error> for ConfigError {
    fn from(e: io::Error) -> ConfigError { ConfigError::IoError(e) }
}

impl std::convert::From<PddbError> for ConfigError {
    fn from(e: PddbError) -> ConfigError { ConfigError::Pddb(e) }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NumberParseError(s, e) => write!(f, "couldn't parse {:?} as a number: {}", s, e),
            ConfigError::OutOfRange(s) => write!(f, "{} is out of range", s),
            ConfigError::CredentialFormat(s) => {
                write!(f, "basis credential {:?} should be of the form name:passphrase", s)
            }
            ConfigError::Pddb(e) => write!(f, "{}", e),
            ConfigError::IoError(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

pub fn get_base(value: &str) -> (&str, u32) {
    if value.starts_with("0x") {
        (value.trim_start_matches("0x"), 16)
    } else if value.starts_with("0X") {
        (value.trim_start_matches("0X"), 16)
    } else if value.starts_with("0b") {
        (value.trim_start_matches("0b"), 2)
    } else if value.starts_with("0B") {
        (value.trim_start_matches("0B"), 2)
    } else if value.starts_with('0') && value != "0" {
        (value.trim_start_matches('0'), 8)
    } else {
        (value, 10)
    }
}

pub fn parse_u64(value: &str) -> Result<u64, ConfigError> {
    let (digits, base) = get_base(value);
    u64::from_str_radix(&digits.replace('_', ""), base)
        .map_err(|e| ConfigError::NumberParseError(value.to_owned(), e))
}

pub fn parse_u32(value: &str) -> Result<u32, ConfigError> {
    let wide = parse_u64(value)?;
    u32::try_from(wide).map_err(|_| ConfigError::OutOfRange(value.to_owned()))
}

/// Splits a `name:passphrase` argument. Basis names cannot contain ':', so everything after
/// the first one belongs to the passphrase.
pub fn parse_credential(arg: &str) -> Result<(BasisName, String), ConfigError> {
    let (name, pass) = arg.split_once(':').ok_or_else(|| ConfigError::CredentialFormat(arg.to_owned()))?;
    Ok((BasisName::new(name)?, pass.to_owned()))
}

pub fn read_file(path: &str) -> Result<Vec<u8>, ConfigError> {
    let mut file = File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    Ok(data)
}
