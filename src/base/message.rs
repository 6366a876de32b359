//! DNS messages in structured form.
//!
//! Encoding messages for the wire is the business of the transport. The
//! zone maintenance code only ever builds a handful of request messages
//! and inspects the sections and header bits of the responses, so a plain
//! structure is all it needs.

use super::iana::{Class, Opcode, Rcode, Rtype};
use super::name::Name;
use super::record::Record;
use core::fmt;

//------------ Question ------------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Question {
    pub qname: Name,
    pub qtype: Rtype,
    pub qclass: Class,
}

impl Question {
    pub fn new(qname: Name, qtype: Rtype, qclass: Class) -> Self {
        Question {
            qname,
            qtype,
            qclass,
        }
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", self.qname, self.qclass, self.qtype)
    }
}

//------------ Header --------------------------------------------------------

/// The header flags we care about.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Header {
    pub id: u16,
    pub opcode: Opcode,
    pub rcode: Rcode,
    pub qr: bool,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
}

impl Default for Opcode {
    fn default() -> Self {
        Opcode::QUERY
    }
}

impl Default for Rcode {
    fn default() -> Self {
        Rcode::NOERROR
    }
}

//------------ Message -------------------------------------------------------

/// A DNS message.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Message {
    pub header: Header,
    pub question: Option<Question>,
    pub answer: Vec<Record>,
    pub authority: Vec<Record>,
    pub additional: Vec<Record>,
}

impl Message {
    /// Creates a query for the given question.
    pub fn query(qname: Name, qtype: Rtype, qclass: Class) -> Self {
        Message {
            question: Some(Question::new(qname, qtype, qclass)),
            ..Default::default()
        }
    }

    /// Creates a NOTIFY for a zone.
    ///
    /// If given, the SOA record is placed in the answer section as a
    /// hint for the secondary as suggested by RFC 1996, section 3.7.
    pub fn notify(zone: Name, class: Class, soa: Option<Record>) -> Self {
        let mut res = Message::query(zone, Rtype::SOA, class);
        res.header.opcode = Opcode::NOTIFY;
        res.header.aa = true;
        res.answer.extend(soa);
        res
    }

    pub fn rcode(&self) -> Rcode {
        self.header.rcode
    }

    /// Returns the answer records of the given type at the given owner.
    pub fn answers<'a>(
        &'a self,
        owner: &'a Name,
        rtype: Rtype,
    ) -> impl Iterator<Item = &'a Record> + 'a {
        self.answer
            .iter()
            .filter(move |r| r.rtype() == rtype && &r.owner == owner)
    }

    /// Counts the records of the given type and owner in a section.
    pub fn count(section: &[Record], owner: &Name, rtype: Rtype) -> usize {
        section
            .iter()
            .filter(|r| r.rtype() == rtype && &r.owner == owner)
            .count()
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use core::str::FromStr;

    #[test]
    fn notify_message() {
        let zone = Name::from_str("example.com").unwrap();
        let msg = Message::notify(zone.clone(), Class::IN, None);
        assert_eq!(msg.header.opcode, Opcode::NOTIFY);
        assert!(msg.header.aa);
        assert_eq!(
            msg.question,
            Some(Question::new(zone, Rtype::SOA, Class::IN))
        );
        assert!(msg.answer.is_empty());
    }
}
