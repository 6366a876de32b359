//! Zone maintenance for authoritative DNS servers.
//!
//! This crate keeps the zones of an authoritative name server current. It
//! does not answer queries itself. Instead, an embedding server provides
//! a few services (a transport for talking to other servers, a database
//! backend, a key store and so on) and gets zones that look after
//! themselves.
//!
//! A zone, depending on its type, will
//!
//! * load its content from a master file and roll a journal forward,
//! * check the serial of its masters and transfer newer content via IXFR
//!   or AXFR,
//! * tell its secondaries about new content via NOTIFY,
//! * dump its content back to the master file when it changed,
//! * keep its DNSSEC signatures fresh, follow key rollovers and build
//!   NSEC and NSEC3 chains,
//! * or maintain trust anchors following RFC 5011.
//!
//! # Modules
//!
//! * [base] has the fundamental DNS types: names, record types and
//!   data, serial numbers, messages.
//! * [store] holds zone content: the database trait with an in-memory
//!   implementation, diffs, journals and master files.
//! * [net] describes the requests sent to other servers and the
//!   [`Transport`][net::Transport] trait that carries them.
//! * [zone] has the [`Zone`][zone::Zone] itself with its state and timers.
//! * [xfr] refreshes zones from their masters and sends notifies.
//! * [sign] signs zones.
//! * [trust] maintains managed trust anchors.
//! * [manager] has the [`ZoneManager`] creating zones and the resources
//!   they share.
//!
//! # Getting started
//!
//! ```no_run
//! use std::str::FromStr;
//! use std::sync::Arc;
//! use zonekeeper::base::{Class, Name};
//! use zonekeeper::config::{ManagerConfig, RemoteAddr, ZoneConfig, ZoneType};
//! use zonekeeper::manager::{Services, ZoneManager};
//! use zonekeeper::net::mock::MockTransport;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! zonekeeper::logging::init_logging();
//! let manager = ZoneManager::new(
//!     ManagerConfig::default(),
//!     Services::new(Arc::new(MockTransport::new())),
//! );
//! let zone = manager.create_zone(
//!     Name::from_str("example.com")?,
//!     Class::IN,
//!     ZoneConfig::new(ZoneType::Slave)
//!         .with_masters(vec![RemoteAddr::new("192.0.2.1:53".parse()?)]),
//! )?;
//! zone.load().await?;
//! # Ok(())
//! # }
//! ```

pub use self::manager::ZoneManager;

pub mod base;
pub mod config;
pub mod logging;
pub mod manager;
pub mod net;
pub mod sign;
pub mod store;
pub mod trust;
pub mod utils;
pub mod xfr;
pub mod zone;
