//! The binary record encoding shared by journal and raw master files.
//!
//! A record is stored in uncompressed wire format. A transaction is
//! stored as its serials, an optional source serial, and the list of its
//! tuples each prefixed by an operation byte.

use super::diff::{DiffOp, DiffTuple, Transaction};
use crate::base::iana::{Class, Rtype};
use crate::base::name::{Name, NameError};
use crate::base::rdata::{Rdata, RdataError};
use crate::base::record::{Record, Ttl};
use crate::base::serial::Serial;
use bytes::BufMut;
use octseq::parse::{Parser, ShortInput};
use core::fmt;

const OP_DELETE: u8 = 0;
const OP_ADD: u8 = 1;

pub fn compose_record(
    record: &Record,
    target: &mut impl BufMut,
) -> Result<(), WireError> {
    let data = record.data.to_wire();
    let len = u16::try_from(data.len()).map_err(|_| WireError::TooLong)?;
    record.owner.compose(target);
    target.put_u16(record.rtype().to_int());
    target.put_u16(record.class.to_int());
    target.put_u32(record.ttl.as_secs());
    target.put_u16(len);
    target.put_slice(&data);
    Ok(())
}

pub fn parse_record(parser: &mut Parser<[u8]>) -> Result<Record, WireError> {
    let owner = Name::parse(parser)?;
    let rtype = Rtype::from_int(parser.parse_u16_be()?);
    let class = Class::from_int(parser.parse_u16_be()?);
    let ttl = Ttl::from_secs(parser.parse_u32_be()?);
    let len = usize::from(parser.parse_u16_be()?);
    let mut data = vec![0u8; len];
    parser.parse_buf(&mut data)?;
    let data = Rdata::parse(rtype, &data)?;
    Ok(Record::new(owner, class, ttl, data))
}

pub fn compose_transaction(
    txn: &Transaction,
    target: &mut impl BufMut,
) -> Result<(), WireError> {
    let count =
        u32::try_from(txn.tuples.len()).map_err(|_| WireError::TooLong)?;
    txn.from.compose(target);
    txn.to.compose(target);
    match txn.source_serial {
        Some(serial) => {
            target.put_u8(1);
            serial.compose(target);
        }
        None => {
            target.put_u8(0);
            target.put_u32(0);
        }
    }
    target.put_u32(count);
    for tuple in &txn.tuples {
        target.put_u8(match tuple.op {
            DiffOp::Delete => OP_DELETE,
            DiffOp::Add => OP_ADD,
        });
        compose_record(&tuple.record, target)?;
    }
    Ok(())
}

pub fn parse_transaction(
    parser: &mut Parser<[u8]>,
) -> Result<Transaction, WireError> {
    let from = Serial::parse(parser)?;
    let to = Serial::parse(parser)?;
    let has_source = parser.parse_u8()?;
    let source = Serial::parse(parser)?;
    let count = parser.parse_u32_be()?;
    let mut tuples = Vec::new();
    for _ in 0..count {
        let op = match parser.parse_u8()? {
            OP_DELETE => DiffOp::Delete,
            OP_ADD => DiffOp::Add,
            _ => return Err(WireError::BadOperation),
        };
        tuples.push(DiffTuple {
            op,
            record: parse_record(parser)?,
        });
    }
    Ok(Transaction {
        from,
        to,
        source_serial: (has_source != 0).then_some(source),
        tuples,
    })
}

//------------ WireError -----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WireError {
    ShortInput,
    BadOperation,

    /// Data is too long for its length field.
    TooLong,

    Name(NameError),
    Data(RdataError),
}

impl From<ShortInput> for WireError {
    fn from(_: ShortInput) -> Self {
        WireError::ShortInput
    }
}

impl From<NameError> for WireError {
    fn from(err: NameError) -> Self {
        WireError::Name(err)
    }
}

impl From<RdataError> for WireError {
    fn from(err: RdataError) -> Self {
        WireError::Data(err)
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WireError::ShortInput => f.write_str("unexpected end of data"),
            WireError::BadOperation => f.write_str("invalid diff operation"),
            WireError::TooLong => f.write_str("data too long"),
            WireError::Name(err) => err.fmt(f),
            WireError::Data(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for WireError {}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use core::str::FromStr;
    use std::net::Ipv4Addr;

    #[test]
    fn transaction_survives_storage() {
        let record = Record::new(
            Name::from_str("www.example.com").unwrap(),
            Class::IN,
            Ttl::from_secs(60),
            Rdata::A(Ipv4Addr::new(192, 0, 2, 1)),
        );
        let txn = Transaction {
            from: Serial(1),
            to: Serial(2),
            source_serial: Some(Serial(7)),
            tuples: vec![DiffTuple {
                op: DiffOp::Add,
                record,
            }],
        };
        let mut buf = Vec::new();
        compose_transaction(&txn, &mut buf).unwrap();
        let mut parser = Parser::from_ref(buf.as_slice());
        assert_eq!(parse_transaction(&mut parser).unwrap(), txn);
        assert_eq!(parser.remaining(), 0);

        buf.truncate(buf.len() - 1);
        let mut parser = Parser::from_ref(buf.as_slice());
        assert!(parse_transaction(&mut parser).is_err());
    }

    #[test]
    fn oversized_record_data_is_rejected() {
        let record = Record::new(
            Name::from_str("www.example.com").unwrap(),
            Class::IN,
            Ttl::from_secs(60),
            Rdata::Txt(vec![b'x'; 70_000].into()),
        );
        let mut buf = Vec::new();
        assert_eq!(compose_record(&record, &mut buf), Err(WireError::TooLong));
        assert!(buf.is_empty());
    }
}
