//! Master files.
//!
//! Zones are persisted either in the usual text format or in a compact
//! binary format. Only the binary format can be read back by this crate
//! on its own. Reading the text format requires a [`ZoneFileParser`]
//! supplied by the embedding application.
//!
//! The binary format starts with a header that records, for the signed
//! half of an inline-signing pair, the serial of the unsigned zone the
//! content was derived from.

use super::version::ZoneVersion;
use super::wire::{self, WireError};
use super::DbError;
use crate::base::iana::Class;
use crate::base::name::Name;
use crate::base::record::Record;
use crate::base::serial::Serial;
use bytes::BufMut;
use core::fmt;
use octseq::parse::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

//------------ MasterFormat --------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MasterFormat {
    #[default]
    Text,
    Raw,
}

//------------ ZoneFileParser ------------------------------------------------

/// Something that can parse the text form of a zone.
pub trait ZoneFileParser: fmt::Debug + Send + Sync {
    fn parse(
        &self,
        origin: &Name,
        class: Class,
        text: &str,
    ) -> Result<Vec<Record>, MasterFileError>;
}

//------------ Loaded --------------------------------------------------------

/// The result of loading a master file.
#[derive(Clone, Debug)]
pub struct Loaded {
    pub version: ZoneVersion,

    /// The serial of the unsigned source, if recorded.
    pub source_serial: Option<Serial>,

    /// When the file was last modified.
    pub modified: SystemTime,
}

//------------ MasterFile ----------------------------------------------------

/// The location and format of a zone's master file.
#[derive(Clone, Debug)]
pub struct MasterFile {
    path: PathBuf,
    format: MasterFormat,
}

impl MasterFile {
    const RAW_MAGIC: &'static [u8; 4] = b"ZKR1";
    const RAW_VERSION: u32 = 1;

    pub fn new(path: impl Into<PathBuf>, format: MasterFormat) -> Self {
        MasterFile {
            path: path.into(),
            format,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> MasterFormat {
        self.format
    }

    /// Returns the modification time of the file.
    pub fn modified(&self) -> Result<SystemTime, MasterFileError> {
        Ok(fs::metadata(&self.path)?.modified()?)
    }

    /// Loads the file.
    pub fn load(
        &self,
        origin: &Name,
        class: Class,
        parser: Option<&dyn ZoneFileParser>,
    ) -> Result<Loaded, MasterFileError> {
        let modified = self.modified()?;
        let data = fs::read(&self.path)?;
        let (version, source_serial) = match self.format {
            MasterFormat::Raw => Self::parse_raw(origin, class, &data)?,
            MasterFormat::Text => {
                let parser = parser.ok_or(MasterFileError::NoParser)?;
                let text = String::from_utf8(data)
                    .map_err(|_| MasterFileError::Syntax("not UTF-8".into()))?;
                let records = parser.parse(origin, class, &text)?;
                (
                    ZoneVersion::from_records(origin.clone(), class, records)?,
                    None,
                )
            }
        };
        Ok(Loaded {
            version,
            source_serial,
            modified,
        })
    }

    /// Writes the content of `version` to the file.
    ///
    /// The content is written to a temporary file first which then
    /// replaces the master file.
    pub fn dump(
        &self,
        version: &ZoneVersion,
        source_serial: Option<Serial>,
    ) -> Result<(), MasterFileError> {
        let data = match self.format {
            MasterFormat::Raw => Self::compose_raw(version, source_serial)?,
            MasterFormat::Text => Self::compose_text(version)?,
        };
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn compose_text(version: &ZoneVersion) -> Result<Vec<u8>, MasterFileError> {
        let mut res = Vec::new();
        writeln!(res, "$ORIGIN {}", version.origin())?;
        for record in version.records() {
            writeln!(res, "{}", record)?;
        }
        Ok(res)
    }

    fn compose_raw(
        version: &ZoneVersion,
        source_serial: Option<Serial>,
    ) -> Result<Vec<u8>, MasterFileError> {
        let count = u32::try_from(version.record_count())
            .map_err(|_| WireError::TooLong)?;
        let mut res = Vec::new();
        res.put_slice(Self::RAW_MAGIC);
        res.put_u32(Self::RAW_VERSION);
        res.put_u8(u8::from(source_serial.is_some()));
        res.put_u32(source_serial.map_or(0, Serial::into_int));
        res.put_u32(count);
        for record in version.records() {
            wire::compose_record(&record, &mut res)?;
        }
        Ok(res)
    }

    fn parse_raw(
        origin: &Name,
        class: Class,
        data: &[u8],
    ) -> Result<(ZoneVersion, Option<Serial>), MasterFileError> {
        if data.len() < 4 || &data[..4] != Self::RAW_MAGIC {
            return Err(MasterFileError::BadHeader);
        }
        let mut parser = Parser::from_ref(&data[4..]);
        let format_version =
            parser.parse_u32_be().map_err(WireError::from)?;
        if format_version != Self::RAW_VERSION {
            return Err(MasterFileError::BadHeader);
        }
        let has_source = parser.parse_u8().map_err(WireError::from)?;
        let source = Serial::parse(&mut parser).map_err(WireError::from)?;
        let count = parser.parse_u32_be().map_err(WireError::from)?;
        let mut records = Vec::new();
        for _ in 0..count {
            records.push(wire::parse_record(&mut parser)?);
        }
        let version =
            ZoneVersion::from_records(origin.clone(), class, records)?;
        Ok((version, (has_source != 0).then_some(source)))
    }
}

//------------ MasterFileError -----------------------------------------------

#[derive(Debug)]
pub enum MasterFileError {
    Io(io::Error),

    /// The binary header is missing or of an unknown version.
    BadHeader,

    /// The binary content is corrupt.
    Format(WireError),

    /// The text content couldn't be parsed.
    Syntax(String),

    /// Text files can't be read without a parser.
    NoParser,

    /// The records don't form a valid zone.
    Content(DbError),
}

impl From<io::Error> for MasterFileError {
    fn from(err: io::Error) -> Self {
        MasterFileError::Io(err)
    }
}

impl From<WireError> for MasterFileError {
    fn from(err: WireError) -> Self {
        MasterFileError::Format(err)
    }
}

impl From<DbError> for MasterFileError {
    fn from(err: DbError) -> Self {
        MasterFileError::Content(err)
    }
}

impl fmt::Display for MasterFileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MasterFileError::Io(err) => err.fmt(f),
            MasterFileError::BadHeader => f.write_str("bad raw file header"),
            MasterFileError::Format(err) => write!(f, "corrupt file: {}", err),
            MasterFileError::Syntax(err) => write!(f, "syntax error: {}", err),
            MasterFileError::NoParser => {
                f.write_str("no parser for text master files")
            }
            MasterFileError::Content(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for MasterFileError {}

//============ Testing =======================================================
