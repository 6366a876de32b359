//! The state bits of a zone.

use core::fmt;

//------------ ZoneFlags -----------------------------------------------------

/// A set of zone state flags.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct ZoneFlags(u32);

impl ZoneFlags {
    /// A load is in progress.
    pub const LOADING: Self = Self(1 << 0);

    /// The zone has content.
    pub const LOADED: Self = Self(1 << 1);

    /// A refresh cycle is running.
    pub const REFRESH: Self = Self(1 << 2);

    /// Another refresh was asked for while one was running.
    pub const NEEDREFRESH: Self = Self(1 << 3);

    /// The content expired and is no longer served.
    pub const EXPIRED: Self = Self(1 << 4);

    /// Secondaries need to be told about a change.
    pub const NEEDNOTIFY: Self = Self(1 << 5);

    /// The pending notifications are the first after loading.
    pub const STARTUPNOTIFY: Self = Self(1 << 6);

    /// The content changed since it was last written to disk.
    pub const NEEDDUMP: Self = Self(1 << 7);

    /// A dump is in progress.
    pub const DUMPING: Self = Self(1 << 8);

    /// The journal should be trimmed.
    pub const NEEDCOMPACT: Self = Self(1 << 9);

    /// None of the masters could be reached in the last refresh cycle.
    pub const NOMASTERS: Self = Self(1 << 10);

    /// Refreshing is disabled.
    pub const NOREFRESH: Self = Self(1 << 11);

    /// Refresh timers were learned from an SOA record.
    pub const HAVETIMERS: Self = Self(1 << 12);

    /// The next transfer has to be a full one.
    pub const FORCEXFER: Self = Self(1 << 13);

    /// Don't use EDNS with the current master.
    pub const NOEDNS: Self = Self(1 << 14);

    /// Query the current master over TCP.
    pub const USEVC: Self = Self(1 << 15);

    /// The SOA query was skipped and went straight to the transfer.
    pub const SOABEFOREAXFR: Self = Self(1 << 16);

    /// Use the alternate transfer source for this round.
    pub const USEALTXFRSRC: Self = Self(1 << 17);

    /// The zone is shutting down.
    pub const EXITING: Self = Self(1 << 18);

    /// A signing quantum is running.
    pub const SIGNING: Self = Self(1 << 19);

    const NAMES: [(ZoneFlags, &'static str); 20] = [
        (Self::LOADING, "loading"),
        (Self::LOADED, "loaded"),
        (Self::REFRESH, "refresh"),
        (Self::NEEDREFRESH, "needrefresh"),
        (Self::EXPIRED, "expired"),
        (Self::NEEDNOTIFY, "neednotify"),
        (Self::STARTUPNOTIFY, "startupnotify"),
        (Self::NEEDDUMP, "needdump"),
        (Self::DUMPING, "dumping"),
        (Self::NEEDCOMPACT, "needcompact"),
        (Self::NOMASTERS, "nomasters"),
        (Self::NOREFRESH, "norefresh"),
        (Self::HAVETIMERS, "havetimers"),
        (Self::FORCEXFER, "forcexfer"),
        (Self::NOEDNS, "noedns"),
        (Self::USEVC, "usevc"),
        (Self::SOABEFOREAXFR, "soabeforeaxfr"),
        (Self::USEALTXFRSRC, "usealtxfrsrc"),
        (Self::EXITING, "exiting"),
        (Self::SIGNING, "signing"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns whether all flags of `other` are set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns whether any flag of `other` is set.
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0
    }

    pub fn set(&mut self, other: Self, value: bool) {
        if value {
            self.insert(other)
        } else {
            self.remove(other)
        }
    }
}

//--- BitOr

impl core::ops::BitOr for ZoneFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

//--- Display and Debug

impl fmt::Display for ZoneFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ZoneFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ZoneFlags({})", self)
    }
}

//============ Testing =======================================================
