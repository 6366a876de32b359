//! Absolute domain names.
//!
//! Zone maintenance only ever deals with absolute names and never needs
//! to preserve the case of the labels, so names are kept as a sequence of
//! lowercased labels. This makes equality, hashing and the canonical
//! ordering of [RFC 4034, section 6.1] cheap.
//!
//! [RFC 4034, section 6.1]: https://tools.ietf.org/html/rfc4034#section-6.1

use bytes::{BufMut, Bytes};
use core::cmp::Ordering;
use core::fmt;
use core::str::FromStr;
use octseq::parse::Parser;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;

/// The maximum length of a single label.
pub const MAX_LABEL_LEN: usize = 63;

/// The maximum length of a name in wire format.
pub const MAX_NAME_LEN: usize = 255;

//------------ Name ----------------------------------------------------------

/// An absolute, lowercased domain name.
///
/// The labels are stored leftmost first. The root label is implied and
/// not stored, so the root name has no labels at all.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct Name {
    labels: SmallVec<[Bytes; 4]>,
}

impl Name {
    /// Returns the root name.
    pub fn root() -> Self {
        Name {
            labels: SmallVec::new(),
        }
    }

    /// Creates a name from a sequence of labels, leftmost first.
    pub fn from_labels<I, L>(labels: I) -> Result<Self, NameError>
    where
        I: IntoIterator<Item = L>,
        L: AsRef<[u8]>,
    {
        let mut res = Name::root();
        let mut len = 1;
        for label in labels {
            let label = label.as_ref();
            if label.is_empty() {
                return Err(NameError::EmptyLabel);
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(NameError::LongLabel);
            }
            len += label.len() + 1;
            if len > MAX_NAME_LEN {
                return Err(NameError::LongName);
            }
            res.labels.push(Bytes::from(label.to_ascii_lowercase()));
        }
        Ok(res)
    }

    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    /// Returns the number of labels, not counting the root label.
    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    pub fn labels(&self) -> impl DoubleEndedIterator<Item = &[u8]> {
        self.labels.iter().map(|l| l.as_ref())
    }

    pub fn first_label(&self) -> Option<&[u8]> {
        self.labels.first().map(|l| l.as_ref())
    }

    /// Returns the length of the name in wire format.
    pub fn wire_len(&self) -> usize {
        self.labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1
    }

    /// Returns the immediate parent or `None` for the root.
    pub fn parent(&self) -> Option<Name> {
        if self.is_root() {
            None
        } else {
            Some(Name {
                labels: self.labels[1..].iter().cloned().collect(),
            })
        }
    }

    /// Returns a new name with `label` prepended.
    pub fn prepend(&self, label: &[u8]) -> Result<Name, NameError> {
        if label.is_empty() {
            return Err(NameError::EmptyLabel);
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(NameError::LongLabel);
        }
        if self.wire_len() + label.len() + 1 > MAX_NAME_LEN {
            return Err(NameError::LongName);
        }
        let mut labels = SmallVec::with_capacity(self.labels.len() + 1);
        labels.push(Bytes::from(label.to_ascii_lowercase()));
        labels.extend(self.labels.iter().cloned());
        Ok(Name { labels })
    }

    /// Returns whether `self` is `base` or below it.
    pub fn ends_with(&self, base: &Name) -> bool {
        if base.labels.len() > self.labels.len() {
            return false;
        }
        self.labels
            .iter()
            .rev()
            .zip(base.labels.iter().rev())
            .all(|(l, r)| l == r)
    }

    /// Returns whether `self` is strictly below `base`.
    pub fn is_below(&self, base: &Name) -> bool {
        self.labels.len() > base.labels.len() && self.ends_with(base)
    }

    /// Returns the names between `self` (exclusive) and `base`
    /// (exclusive), closest to `self` first.
    ///
    /// Returns an empty list if `self` isn't below `base`.
    pub fn ancestors_until(&self, base: &Name) -> Vec<Name> {
        let mut res = Vec::new();
        if !self.is_below(base) {
            return res;
        }
        let mut current = self.parent();
        while let Some(name) = current {
            if name.label_count() <= base.label_count() {
                break;
            }
            current = name.parent();
            res.push(name);
        }
        res
    }

    /// Returns whether the first label is the wildcard label.
    pub fn is_wildcard(&self) -> bool {
        self.first_label() == Some(b"*")
    }
}

/// # Parsing and Composing
///
impl Name {
    /// Appends the uncompressed wire format of the name.
    ///
    /// Since labels are kept lowercased, this is also the canonical
    /// format used for signing.
    pub fn compose(&self, target: &mut impl BufMut) {
        for label in &self.labels {
            target.put_u8(label.len() as u8);
            target.put_slice(label);
        }
        target.put_u8(0);
    }

    /// Parses an uncompressed name.
    pub fn parse(parser: &mut Parser<[u8]>) -> Result<Self, NameError> {
        let mut labels = SmallVec::new();
        let mut len = 0;
        loop {
            let label_len = parser.parse_u8()? as usize;
            len += label_len + 1;
            if len > MAX_NAME_LEN {
                return Err(NameError::LongName);
            }
            if label_len == 0 {
                break;
            }
            if label_len > MAX_LABEL_LEN {
                return Err(NameError::LongLabel);
            }
            let mut buf = vec![0u8; label_len];
            parser.parse_buf(&mut buf)?;
            buf.make_ascii_lowercase();
            labels.push(Bytes::from(buf));
        }
        Ok(Name { labels })
    }
}

//--- FromStr

impl FromStr for Name {
    type Err = NameError;

    /// Parses a name in presentation format.
    ///
    /// Names are always absolute, a missing trailing dot is implied.
    /// The escapes `\.` and `\DDD` are supported.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "." || s.is_empty() {
            return Ok(Name::root());
        }
        let mut labels: Vec<Vec<u8>> = Vec::new();
        let mut label = Vec::new();
        let mut chars = s.bytes().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                b'.' => {
                    if label.is_empty() {
                        return Err(NameError::EmptyLabel);
                    }
                    labels.push(core::mem::take(&mut label));
                }
                b'\\' => {
                    let first = chars.next().ok_or(NameError::BadEscape)?;
                    if first.is_ascii_digit() {
                        let second =
                            chars.next().ok_or(NameError::BadEscape)?;
                        let third =
                            chars.next().ok_or(NameError::BadEscape)?;
                        if !second.is_ascii_digit() || !third.is_ascii_digit()
                        {
                            return Err(NameError::BadEscape);
                        }
                        let value = u32::from(first - b'0') * 100
                            + u32::from(second - b'0') * 10
                            + u32::from(third - b'0');
                        let value = u8::try_from(value)
                            .map_err(|_| NameError::BadEscape)?;
                        label.push(value);
                    } else {
                        label.push(first);
                    }
                }
                _ => label.push(ch),
            }
        }
        if !label.is_empty() {
            labels.push(label);
        }
        Name::from_labels(labels)
    }
}

//--- PartialOrd and Ord

impl PartialOrd for Name {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Name {
    /// Compares names in canonical DNS order.
    ///
    /// Names are compared label by label starting at the rightmost label.
    /// Labels are compared as lowercased octet strings. A name that runs
    /// out of labels first sorts first.
    fn cmp(&self, other: &Self) -> Ordering {
        let mut left = self.labels.iter().rev();
        let mut right = other.labels.iter().rev();
        loop {
            match (left.next(), right.next()) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(l), Some(r)) => match l.as_ref().cmp(r.as_ref()) {
                    Ordering::Equal => {}
                    res => return res,
                },
            }
        }
    }
}

//--- Display and Debug

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_root() {
            return f.write_str(".");
        }
        for label in &self.labels {
            for &ch in label.iter() {
                if ch == b'.' || ch == b'\\' {
                    write!(f, "\\{}", ch as char)?;
                } else if ch.is_ascii_graphic() {
                    write!(f, "{}", ch as char)?;
                } else {
                    write!(f, "\\{:03}", ch)?;
                }
            }
            f.write_str(".")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Name({})", self)
    }
}

//--- Serialize and Deserialize

impl Serialize for Name {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Name {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Name::from_str(&s).map_err(serde::de::Error::custom)
    }
}

//------------ NameError -----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NameError {
    EmptyLabel,
    LongLabel,
    LongName,
    BadEscape,
    ShortInput,
}

impl From<octseq::parse::ShortInput> for NameError {
    fn from(_: octseq::parse::ShortInput) -> Self {
        NameError::ShortInput
    }
}

impl fmt::Display for NameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NameError::EmptyLabel => f.write_str("empty label"),
            NameError::LongLabel => f.write_str("label too long"),
            NameError::LongName => f.write_str("name too long"),
            NameError::BadEscape => f.write_str("illegal escape sequence"),
            NameError::ShortInput => f.write_str("unexpected end of input"),
        }
    }
}

impl std::error::Error for NameError {}

//============ Testing =======================================================
