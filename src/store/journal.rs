//! Journals of zone changes.
//!
//! A journal is an append-only list of [`Transaction`]s. Each transaction
//! has to start at the serial the previous one ended with. Journals serve
//! two purposes: rolling a zone forward after it has been loaded from an
//! older master file, and providing the data for outgoing incremental
//! transfers.

use super::diff::Transaction;
use super::wire::{self, WireError};
use crate::base::serial::Serial;
use core::fmt;
use octseq::parse::Parser;
use parking_lot::Mutex;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

//------------ Journal -------------------------------------------------------

pub trait Journal: fmt::Debug + Send + Sync {
    /// Appends a transaction.
    fn write(&self, txn: &Transaction) -> Result<(), JournalError>;

    /// Returns the serial of the oldest version recorded.
    fn first_serial(&self) -> Option<Serial>;

    /// Returns the serial of the newest version recorded.
    fn last_serial(&self) -> Option<Serial>;

    /// Returns the transactions leading from `from` to `to`.
    ///
    /// If `to` is `None`, returns everything from `from` onwards. Returns
    /// an empty list if `from` is the last serial.
    fn transactions(
        &self,
        from: Serial,
        to: Option<Serial>,
    ) -> Result<Vec<Transaction>, JournalError>;

    /// Drops the oldest transactions until the journal is at most
    /// `max_size` bytes large.
    ///
    /// The newest transaction is always kept.
    fn compact(&self, max_size: usize) -> Result<(), JournalError>;

    /// Removes all content.
    fn clear(&self) -> Result<(), JournalError>;

    /// Returns the size of the encoded content in bytes.
    fn size(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.last_serial().is_none()
    }
}

//------------ Entries -------------------------------------------------------

/// The transactions of a journal with their encoded size.
#[derive(Clone, Debug, Default)]
struct Entries {
    txns: Vec<(Transaction, usize)>,
}

impl Entries {
    fn push(&mut self, txn: Transaction, size: usize) -> Result<(), JournalError> {
        if let Some((last, _)) = self.txns.last() {
            if last.to != txn.from {
                return Err(JournalError::OutOfSequence {
                    expected: last.to,
                    found: txn.from,
                });
            }
        }
        self.txns.push((txn, size));
        Ok(())
    }

    fn first_serial(&self) -> Option<Serial> {
        self.txns.first().map(|(txn, _)| txn.from)
    }

    fn last_serial(&self) -> Option<Serial> {
        self.txns.last().map(|(txn, _)| txn.to)
    }

    fn range(
        &self,
        from: Serial,
        to: Option<Serial>,
    ) -> Result<Vec<Transaction>, JournalError> {
        if self.last_serial() == Some(from) && to.map_or(true, |to| to == from)
        {
            return Ok(Vec::new());
        }
        let start = self
            .txns
            .iter()
            .position(|(txn, _)| txn.from == from)
            .ok_or(JournalError::NotFound(from))?;
        let mut res = Vec::new();
        for (txn, _) in &self.txns[start..] {
            res.push(txn.clone());
            if Some(txn.to) == to {
                return Ok(res);
            }
        }
        match to {
            Some(to) => Err(JournalError::NotFound(to)),
            None => Ok(res),
        }
    }

    /// Drops entries from the front, returning whether anything changed.
    fn compact(&mut self, max_size: usize) -> bool {
        let mut size = self.size();
        let mut drop = 0;
        while size > max_size && drop + 1 < self.txns.len() {
            size -= self.txns[drop].1;
            drop += 1;
        }
        self.txns.drain(..drop);
        drop > 0
    }

    fn size(&self) -> usize {
        self.txns.iter().map(|(_, size)| size).sum()
    }
}

fn encode(txn: &Transaction) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    wire::compose_transaction(txn, &mut buf)?;
    Ok(buf)
}

/// Returns the length prefix of an encoded transaction.
fn length_prefix(data: &[u8]) -> Result<[u8; 4], WireError> {
    u32::try_from(data.len())
        .map(u32::to_be_bytes)
        .map_err(|_| WireError::TooLong)
}

//------------ MemoryJournal -------------------------------------------------

/// A journal kept in memory only.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    entries: Mutex<Entries>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().txns.len()
    }
}

impl Journal for MemoryJournal {
    fn write(&self, txn: &Transaction) -> Result<(), JournalError> {
        let size = encode(txn)?.len();
        self.entries.lock().push(txn.clone(), size)
    }

    fn first_serial(&self) -> Option<Serial> {
        self.entries.lock().first_serial()
    }

    fn last_serial(&self) -> Option<Serial> {
        self.entries.lock().last_serial()
    }

    fn transactions(
        &self,
        from: Serial,
        to: Option<Serial>,
    ) -> Result<Vec<Transaction>, JournalError> {
        self.entries.lock().range(from, to)
    }

    fn compact(&self, max_size: usize) -> Result<(), JournalError> {
        self.entries.lock().compact(max_size);
        Ok(())
    }

    fn clear(&self) -> Result<(), JournalError> {
        self.entries.lock().txns.clear();
        Ok(())
    }

    fn size(&self) -> usize {
        self.entries.lock().size()
    }
}

//------------ FileJournal ---------------------------------------------------

/// A journal stored in a file.
///
/// The file starts with a four byte magic value followed by the
/// transactions, each prefixed by its length as a 32 bit integer. The
/// content is kept in memory, too, so only writing touches the file.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl FileJournal {
    const MAGIC: &'static [u8; 4] = b"ZKJ1";

    /// Opens the journal at `path`, creating it if necessary.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(data) => Self::parse(&data)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Entries::default()
            }
            Err(err) => return Err(err.into()),
        };
        Ok(FileJournal {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(data: &[u8]) -> Result<Entries, JournalError> {
        let mut entries = Entries::default();
        if data.is_empty() {
            return Ok(entries);
        }
        if data.len() < 4 || &data[..4] != Self::MAGIC {
            return Err(JournalError::Format(WireError::ShortInput));
        }
        let mut parser = Parser::from_ref(&data[4..]);
        while parser.remaining() > 0 {
            let len = parser.parse_u32_be().map_err(WireError::from)? as usize;
            let txn = wire::parse_transaction(&mut parser)?;
            entries.push(txn, len)?;
        }
        Ok(entries)
    }

    fn rewrite(&self, entries: &Entries) -> Result<(), JournalError> {
        let mut buf = Vec::from(&Self::MAGIC[..]);
        for (txn, _) in &entries.txns {
            let data = encode(txn)?;
            buf.extend_from_slice(&length_prefix(&data)?);
            buf.extend_from_slice(&data);
        }
        let tmp = self.path.with_extension("jnw");
        fs::write(&tmp, &buf)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Journal for FileJournal {
    fn write(&self, txn: &Transaction) -> Result<(), JournalError> {
        let mut entries = self.entries.lock();
        let data = encode(txn)?;
        let prefix = length_prefix(&data)?;
        // Check sequence before touching the file.
        let mut check = Entries::default();
        if let Some((last, size)) = entries.txns.last() {
            check.txns.push((last.clone(), *size));
        }
        check.push(txn.clone(), data.len())?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if entries.txns.is_empty() && file.metadata()?.len() == 0 {
            file.write_all(Self::MAGIC)?;
        }
        file.write_all(&prefix)?;
        file.write_all(&data)?;
        file.flush()?;
        entries.push(txn.clone(), data.len())
    }

    fn first_serial(&self) -> Option<Serial> {
        self.entries.lock().first_serial()
    }

    fn last_serial(&self) -> Option<Serial> {
        self.entries.lock().last_serial()
    }

    fn transactions(
        &self,
        from: Serial,
        to: Option<Serial>,
    ) -> Result<Vec<Transaction>, JournalError> {
        self.entries.lock().range(from, to)
    }

    fn compact(&self, max_size: usize) -> Result<(), JournalError> {
        let mut entries = self.entries.lock();
        if entries.compact(max_size) {
            debug!("Journal '{}' compacted", self.path.display());
            self.rewrite(&entries)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), JournalError> {
        self.entries.lock().txns.clear();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn size(&self) -> usize {
        self.entries.lock().size()
    }
}

//------------ JournalError --------------------------------------------------

#[derive(Debug)]
pub enum JournalError {
    /// A transaction doesn't start where the previous one ended.
    OutOfSequence { expected: Serial, found: Serial },

    /// The journal doesn't contain the given serial.
    NotFound(Serial),

    /// The journal file is corrupt or a transaction can't be encoded.
    Format(WireError),

    Io(io::Error),
}

impl From<io::Error> for JournalError {
    fn from(err: io::Error) -> Self {
        JournalError::Io(err)
    }
}

impl From<WireError> for JournalError {
    fn from(err: WireError) -> Self {
        JournalError::Format(err)
    }
}

impl fmt::Display for JournalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JournalError::OutOfSequence { expected, found } => write!(
                f,
                "transaction starts at serial {} instead of {}",
                found, expected
            ),
            JournalError::NotFound(serial) => {
                write!(f, "serial {} not in journal", serial)
            }
            JournalError::Format(err) => write!(f, "bad journal data: {}", err),
            JournalError::Io(err) => write!(f, "journal I/O error: {}", err),
        }
    }
}

impl std::error::Error for JournalError {}

//============ Testing =======================================================
