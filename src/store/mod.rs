//! Storage of zone content.
//!
//! The zone maintenance code needs three kinds of storage: a versioned
//! database holding the current content of a zone, a journal recording
//! the changes between versions, and the master file the content is
//! loaded from and dumped to. Each of them is accessed through a trait so
//! that the embedding server can provide its own. This module provides
//! implementations that keep everything in memory or in simple files.

pub use self::diff::{Diff, DiffOp, DiffTuple, Transaction};
pub use self::journal::{FileJournal, Journal, JournalError, MemoryJournal};
pub use self::masterfile::{
    Loaded, MasterFile, MasterFileError, MasterFormat, ZoneFileParser,
};
pub use self::version::{Node, ZoneVersion};

pub mod diff;
pub mod journal;
pub mod masterfile;
pub mod version;
mod wire;

use crate::base::iana::{Class, Rtype};
use crate::base::name::Name;
use crate::base::record::Record;
use arc_swap::ArcSwap;
use core::fmt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::vec::Vec;

//------------ Database ------------------------------------------------------

/// A versioned store for the content of a single zone.
///
/// Readers get hold of the current version and keep using it for as
/// long as they like. Writers commit diffs which results in a new
/// version that becomes current atomically.
pub trait Database: fmt::Debug + Send + Sync {
    fn origin(&self) -> &Name;

    fn class(&self) -> Class;

    /// Returns the current version.
    fn current(&self) -> Arc<ZoneVersion>;

    /// Applies a diff to the current version and makes the result current.
    fn commit(&self, diff: &Diff) -> Result<Arc<ZoneVersion>, DbError>;

    /// Makes an entirely new version current.
    fn replace(&self, version: ZoneVersion) -> Result<(), DbError>;

    /// Sets the interval before expiry at which signatures are renewed.
    fn set_resign_interval(&self, secs: u32);

    /// Returns whether the current version is signed.
    fn is_secure(&self) -> bool {
        self.current().is_secure()
    }
}

//------------ DatabaseBackend -----------------------------------------------

/// Something that creates databases.
///
/// The arguments are passed through from the zone configuration
/// unchanged. Their meaning is up to the backend.
pub trait DatabaseBackend: fmt::Debug + Send + Sync {
    fn create(
        &self,
        origin: &Name,
        class: Class,
        args: &[String],
    ) -> Result<Arc<dyn Database>, DbError>;
}

//------------ MemoryBackend -------------------------------------------------

/// A backend creating [`MemoryDatabase`]s. It takes no arguments.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryBackend;

impl DatabaseBackend for MemoryBackend {
    fn create(
        &self,
        origin: &Name,
        class: Class,
        args: &[String],
    ) -> Result<Arc<dyn Database>, DbError> {
        if let Some(arg) = args.first() {
            return Err(DbError::BadArgument(arg.clone()));
        }
        Ok(Arc::new(MemoryDatabase::new(origin.clone(), class)))
    }
}

//------------ MemoryDatabase ------------------------------------------------

/// A database keeping all versions in memory.
#[derive(Debug)]
pub struct MemoryDatabase {
    origin: Name,
    class: Class,
    current: ArcSwap<ZoneVersion>,

    /// Serializes writers.
    write: Mutex<()>,
}

impl MemoryDatabase {
    pub fn new(origin: Name, class: Class) -> Self {
        let empty = ZoneVersion::new(origin.clone(), class);
        MemoryDatabase {
            origin,
            class,
            current: ArcSwap::from_pointee(empty),
            write: Mutex::new(()),
        }
    }

    pub fn with_version(version: ZoneVersion) -> Self {
        let res = Self::new(version.origin().clone(), version.class());
        res.current.store(Arc::new(version));
        res
    }
}

impl Database for MemoryDatabase {
    fn origin(&self) -> &Name {
        &self.origin
    }

    fn class(&self) -> Class {
        self.class
    }

    fn current(&self) -> Arc<ZoneVersion> {
        self.current.load_full()
    }

    fn commit(&self, diff: &Diff) -> Result<Arc<ZoneVersion>, DbError> {
        let _guard = self.write.lock();
        let (new, _) = self.current.load().apply(diff)?;
        let new = Arc::new(new);
        self.current.store(new.clone());
        Ok(new)
    }

    fn replace(&self, mut version: ZoneVersion) -> Result<(), DbError> {
        if version.origin() != &self.origin {
            return Err(DbError::OutOfZone(version.origin().clone()));
        }
        if version.class() != self.class {
            return Err(DbError::WrongClass(version.class()));
        }
        let _guard = self.write.lock();
        version.set_resign_interval(self.current.load().resign_interval());
        self.current.store(Arc::new(version));
        Ok(())
    }

    fn set_resign_interval(&self, secs: u32) {
        let _guard = self.write.lock();
        let current = self.current.load();
        if current.resign_interval() != secs {
            let mut new = current.fork();
            new.set_resign_interval(secs);
            self.current.store(Arc::new(new));
        }
    }
}

//------------ DbError -------------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DbError {
    /// A record's owner is not within the zone.
    OutOfZone(Name),

    /// A record has a class different from the zone's.
    WrongClass(Class),

    /// A record has a type that can't be stored.
    MetaType(Rtype),

    /// The same record appeared twice in data loaded.
    Duplicate(Record),

    /// The backend didn't understand an argument.
    BadArgument(String),
}

//--- Display and Error

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DbError::OutOfZone(name) => {
                write!(f, "name '{}' is out of zone", name)
            }
            DbError::WrongClass(class) => {
                write!(f, "record of wrong class {}", class)
            }
            DbError::MetaType(rtype) => {
                write!(f, "meta type {} can't be stored", rtype)
            }
            DbError::Duplicate(record) => {
                write!(f, "duplicate record '{}'", record)
            }
            DbError::BadArgument(arg) => {
                write!(f, "unsupported database argument '{}'", arg)
            }
        }
    }
}

impl std::error::Error for DbError {}

//============ Testing =======================================================
