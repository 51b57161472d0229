use crate::errors::*;
use error_chain::bail;
use serde_derive::Deserialize;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Supported compression algorithms
#[derive(PartialEq, Debug, Copy, Clone)]
pub enum Algorithm {
    Zstd,
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(name: &str) -> Result<Algorithm> {
        match name {
            "zstd" => Ok(Algorithm::Zstd),
            other => {
                Err(ErrorKind::Config(format!("unknown compression algorithm {}", other)).into())
            }
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Zstd => f.write_str("zstd"),
        }
    }
}

/// zstd compression level.
///
/// Parsed from the named levels `fastest`, `default`, `better` and `best`
/// (case-insensitive, empty means `default`) or from a numeric level inside
/// the range supported by the linked zstd library.
#[derive(PartialEq, Debug, Copy, Clone)]
pub struct Level(i32);

impl Level {
    pub const FASTEST: Level = Level(1);
    pub const DEFAULT: Level = Level(3);
    pub const BETTER: Level = Level(7);
    pub const BEST: Level = Level(11);

    pub fn get(self) -> i32 {
        self.0
    }
}

impl Default for Level {
    fn default() -> Self {
        Level::DEFAULT
    }
}

impl FromStr for Level {
    type Err = Error;

    fn from_str(level: &str) -> Result<Level> {
        match level.trim().to_ascii_lowercase().as_str() {
            "" | "default" => Ok(Level::DEFAULT),
            "fastest" => Ok(Level::FASTEST),
            "better" => Ok(Level::BETTER),
            "best" => Ok(Level::BEST),
            other => match other.parse::<i32>() {
                Ok(value) if zstd::compression_level_range().contains(&value) => Ok(Level(value)),
                _ => Err(ErrorKind::Config(format!("unknown compression level {}", level)).into()),
            },
        }
    }
}

/// Which transform a wrapper applies to the bytes the caller reads.
#[derive(Deserialize, PartialEq, Debug, Copy, Clone)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Bytes read from the connection are compressed, bytes written to it are decompressed.
    #[serde(alias = "encode-side")]
    Encode,
    /// Bytes read from the connection are decompressed, bytes written to it are compressed.
    #[serde(alias = "decode-side")]
    Decode,
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(role: &str) -> Result<Role> {
        match role {
            "encode" | "encode-side" => Ok(Role::Encode),
            "decode" | "decode-side" => Ok(Role::Decode),
            other => Err(ErrorKind::Config(format!("unknown role {}", other)).into()),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Encode => f.write_str("encode"),
            Role::Decode => f.write_str("decode"),
        }
    }
}

/// Shared zstd dictionary. Cloning only bumps a reference count.
#[derive(Clone, PartialEq)]
pub struct Dictionary(Arc<[u8]>);

impl Dictionary {
    pub fn from_bytes<B: Into<Vec<u8>>>(bytes: B) -> Dictionary {
        Dictionary(Arc::from(bytes.into()))
    }

    pub fn load(path: &Path) -> Result<Dictionary> {
        let bytes = std::fs::read(path).map_err(|e| {
            ErrorKind::Config(format!(
                "failed to read dictionary file {}: {}",
                path.display(),
                e
            ))
        })?;
        if bytes.is_empty() {
            bail!(ErrorKind::Config(format!(
                "dictionary file {} is empty",
                path.display()
            )));
        }
        Ok(Dictionary::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dictionary({} bytes)", self.0.len())
    }
}

/// Validated codec settings shared by every stream built from one configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CodecOptions {
    pub algorithm: Algorithm,
    pub level: Level,
    pub dictionary: Option<Dictionary>,
}

impl Default for CodecOptions {
    fn default() -> Self {
        CodecOptions {
            algorithm: Algorithm::Zstd,
            level: Level::DEFAULT,
            dictionary: None,
        }
    }
}

/// Stream compression settings as written in a JSON configuration file.
///
/// ```json
/// { "algorithm": "zstd", "level": "best", "dictionary": "/etc/dict.zstd", "role": "decode" }
/// ```
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StreamCompressConfig {
    pub algorithm: String,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub dictionary: Option<PathBuf>,
    pub role: Role,
}

impl StreamCompressConfig {
    pub fn new(role: Role) -> StreamCompressConfig {
        StreamCompressConfig {
            algorithm: Algorithm::Zstd.to_string(),
            level: String::new(),
            dictionary: None,
            role,
        }
    }

    pub fn from_json_file(path: &Path) -> Result<StreamCompressConfig> {
        let file = File::open(path)
            .chain_err(|| format!("error opening config file {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .chain_err(|| format!("error parsing config file {}", path.display()))
    }

    /// Checks the algorithm and level and loads the dictionary, if any.
    pub fn codec_options(&self) -> Result<CodecOptions> {
        let algorithm = self.algorithm.parse()?;
        let level = self.level.parse()?;
        let dictionary = match &self.dictionary {
            Some(path) if !path.as_os_str().is_empty() => Some(Dictionary::load(path)?),
            _ => None,
        };

        Ok(CodecOptions {
            algorithm,
            level,
            dictionary,
        })
    }
}
