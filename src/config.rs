//! Configuration of zones and the zone manager.
//!
//! All configuration types can be deserialized, for instance from YAML
//! or JSON. Every field has a default so a configuration only needs to
//! name what it wants to change.

use crate::base::iana::Rtype;
use crate::base::name::Name;
use crate::base::serial::SerialUpdateMethod;
use crate::store::MasterFormat;
use core::fmt;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

//------------ Constants -----------------------------------------------------

pub const DEFAULT_REFRESH: u32 = 3600;
pub const DEFAULT_RETRY: u32 = 60;
pub const MIN_REFRESH: u32 = 300;
pub const MAX_REFRESH: u32 = 2_419_200;
pub const MIN_RETRY: u32 = 300;
pub const MAX_RETRY: u32 = 1_209_600;
pub const MAX_EXPIRE: u32 = 14_515_200;

//------------ ZoneType ------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ZoneType {
    /// The zone's content comes from a local master file.
    #[default]
    #[serde(alias = "primary")]
    Master,

    /// The zone is transferred from upstream servers.
    #[serde(alias = "secondary")]
    Slave,

    /// Only the apex NS records and their glue are fetched.
    Stub,

    /// Managed trust anchor state.
    Key,

    /// A zone answering for names that don't exist elsewhere.
    Redirect,
}

impl fmt::Display for ZoneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneType::Master => f.write_str("master"),
            ZoneType::Slave => f.write_str("slave"),
            ZoneType::Stub => f.write_str("stub"),
            ZoneType::Key => f.write_str("key"),
            ZoneType::Redirect => f.write_str("redirect"),
        }
    }
}

//------------ RemoteAddr ----------------------------------------------------

/// An upstream or downstream server.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RemoteAddr {
    pub addr: SocketAddr,

    /// The name of the TSIG key to use with this server.
    #[serde(default)]
    pub key: Option<Name>,
}

impl RemoteAddr {
    pub fn new(addr: SocketAddr) -> Self {
        RemoteAddr { addr, key: None }
    }

    pub fn with_key(addr: SocketAddr, key: Name) -> Self {
        RemoteAddr {
            addr,
            key: Some(key),
        }
    }
}

//------------ NotifyType ----------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotifyType {
    /// Don't send notifications.
    No,

    /// Notify the name servers of the zone and the explicit targets.
    #[default]
    Yes,

    /// Notify only the explicit targets.
    Explicit,

    /// Notify the name servers only if this is a master zone.
    MasterOnly,
}

//------------ XfrStrategy ---------------------------------------------------

/// Which kinds of transfer to request.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum XfrStrategy {
    /// Request only AXFR.
    AxfrOnly,

    /// Request only IXFR.
    IxfrOnly,

    /// Request IXFR with fallback to AXFR.
    ///
    /// If the upstream cannot provide the incremental difference data, it
    /// falls back to a full transfer in its answer itself.
    #[default]
    IxfrWithAxfrFallback,
}

impl XfrStrategy {
    /// Returns the transfer type to ask for.
    pub fn rtype(self, have_version: bool, force_axfr: bool) -> Rtype {
        if !have_version || force_axfr || self == XfrStrategy::AxfrOnly {
            Rtype::AXFR
        } else {
            Rtype::IXFR
        }
    }
}

//------------ ZoneConfig ----------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ZoneConfig {
    #[serde(rename = "type")]
    pub zone_type: ZoneType,

    /// The upstream servers, tried in order.
    pub masters: Vec<RemoteAddr>,

    /// Additional notify targets.
    pub also_notify: Vec<RemoteAddr>,

    pub notify_type: NotifyType,

    /// Whether to notify the server named in the SOA MNAME field.
    pub notify_to_soa: bool,

    /// Minimum seconds between notify rounds.
    pub notify_delay: u32,

    pub notify_source: Option<SocketAddr>,

    pub xfr_strategy: XfrStrategy,

    /// Whether to compute and journal the changes of full transfers.
    pub ixfr_from_differences: bool,

    /// Whether a slave zone whose SOA query timed out tries the transfer.
    pub try_tcp_refresh: bool,

    pub transfer_source: Option<SocketAddr>,

    /// Source used for a second round after all masters failed.
    pub alt_transfer_source: Option<SocketAddr>,

    pub use_alt_transfer_source: bool,

    /// Seconds a transfer may take before it is abandoned.
    pub max_transfer_time_in: u32,

    pub min_refresh: u32,
    pub max_refresh: u32,
    pub min_retry: u32,
    pub max_retry: u32,

    /// Seconds newly made signatures are valid.
    pub sig_validity: u32,

    /// Seconds before expiry at which signatures are renewed.
    ///
    /// Defaults to a quarter of the validity.
    pub resign_interval: Option<u32>,

    /// Nodes visited per signing quantum.
    pub sig_signing_nodes: u32,

    /// Signatures created per signing quantum.
    pub sig_signing_signatures: u32,

    /// Type of the records that track signing state.
    pub sig_signing_type: u16,

    pub serial_update_method: SerialUpdateMethod,

    /// Whether KSKs sign only the DNSKEY set if ZSKs are present.
    pub update_check_ksk: bool,

    /// Whether only KSKs sign the DNSKEY set.
    pub dnskey_ksk_only: bool,

    /// Whether a slave forwards dynamic updates to its masters.
    pub forward_updates: bool,

    pub master_file: Option<PathBuf>,
    pub master_format: MasterFormat,

    /// Seconds between a change and dumping it.
    pub dump_delay: u32,

    pub journal: Option<PathBuf>,

    /// Size in bytes the journal is compacted to.
    pub max_journal_size: Option<usize>,

    /// Arguments for the database backend.
    pub database: Vec<String>,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        ZoneConfig {
            zone_type: ZoneType::Master,
            masters: Vec::new(),
            also_notify: Vec::new(),
            notify_type: NotifyType::Yes,
            notify_to_soa: false,
            notify_delay: 5,
            notify_source: None,
            xfr_strategy: XfrStrategy::IxfrWithAxfrFallback,
            ixfr_from_differences: false,
            try_tcp_refresh: true,
            transfer_source: None,
            alt_transfer_source: None,
            use_alt_transfer_source: false,
            max_transfer_time_in: 7200,
            min_refresh: MIN_REFRESH,
            max_refresh: MAX_REFRESH,
            min_retry: MIN_RETRY,
            max_retry: MAX_RETRY,
            sig_validity: 30 * 86400,
            resign_interval: None,
            sig_signing_nodes: 100,
            sig_signing_signatures: 10,
            sig_signing_type: Rtype::DEFAULT_PRIVATE.to_int(),
            serial_update_method: SerialUpdateMethod::Increment,
            update_check_ksk: true,
            dnskey_ksk_only: false,
            forward_updates: false,
            master_file: None,
            master_format: MasterFormat::Text,
            dump_delay: 900,
            journal: None,
            max_journal_size: None,
            database: Vec::new(),
        }
    }
}

impl ZoneConfig {
    pub fn new(zone_type: ZoneType) -> Self {
        ZoneConfig {
            zone_type,
            ..Default::default()
        }
    }

    pub fn with_masters(mut self, masters: Vec<RemoteAddr>) -> Self {
        self.masters = masters;
        self
    }

    /// Returns the resign interval in seconds.
    pub fn resign_interval(&self) -> u32 {
        self.resign_interval.unwrap_or(self.sig_validity / 4)
    }

    pub fn private_type(&self) -> Rtype {
        Rtype::from_int(self.sig_signing_type)
    }

    /// Returns whether the zone behaves like a slave zone.
    ///
    /// That is the case for slave zones and for redirect zones that have
    /// masters.
    pub fn is_slave_like(&self) -> bool {
        match self.zone_type {
            ZoneType::Slave => true,
            ZoneType::Redirect => !self.masters.is_empty(),
            _ => false,
        }
    }

    /// Returns whether the zone is refreshed from masters.
    pub fn is_transferred(&self) -> bool {
        self.is_slave_like() || self.zone_type == ZoneType::Stub
    }
}

//------------ ManagerConfig -------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ManagerConfig {
    /// Concurrent inbound transfers overall.
    pub transfers_in: usize,

    /// Concurrent inbound transfers per upstream server.
    pub transfers_per_ns: usize,

    /// SOA queries per second.
    pub serial_query_rate: u32,

    /// Notifications per second.
    pub notify_rate: u32,

    /// Notifications per second right after start up.
    pub startup_notify_rate: u32,

    /// Concurrent master file loads and dumps.
    pub io_limit: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            transfers_in: 10,
            transfers_per_ns: 2,
            serial_query_rate: 20,
            notify_rate: 20,
            startup_notify_rate: 20,
            io_limit: 1,
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zone_from_yaml() {
        let config: ZoneConfig = serde_yaml::from_str(
            "
type: secondary
masters:
  - addr: 192.0.2.1:53
  - addr: 192.0.2.2:53
    key: xfr.key.
notify-type: explicit
serial-update-method: date
",
        )
        .unwrap();
        assert_eq!(config.zone_type, ZoneType::Slave);
        assert_eq!(config.masters.len(), 2);
        assert_eq!(
            config.masters[1].key.as_ref().map(ToString::to_string),
            Some("xfr.key.".into())
        );
        assert_eq!(config.notify_type, NotifyType::Explicit);
        assert_eq!(config.serial_update_method, SerialUpdateMethod::Date);
        assert_eq!(config.sig_validity, 2_592_000);
        assert_eq!(config.resign_interval(), 648_000);
        assert!(config.is_transferred());
    }

    #[test]
    fn manager_from_json() {
        let config: ManagerConfig =
            serde_json::from_str(r#"{"transfers-in": 20}"#).unwrap();
        assert_eq!(config.transfers_in, 20);
        assert_eq!(config.transfers_per_ns, 2);
        assert_eq!(config.serial_query_rate, 20);
    }

    #[test]
    fn redirect_with_masters_is_slave_like() {
        let mut config = ZoneConfig::new(ZoneType::Redirect);
        assert!(!config.is_slave_like());
        config.masters.push(RemoteAddr::new("192.0.2.1:53".parse().unwrap()));
        assert!(config.is_slave_like());
        assert_eq!(XfrStrategy::AxfrOnly.rtype(true, false), Rtype::AXFR);
        assert_eq!(
            XfrStrategy::IxfrWithAxfrFallback.rtype(true, false),
            Rtype::IXFR
        );
        assert_eq!(
            XfrStrategy::IxfrWithAxfrFallback.rtype(false, false),
            Rtype::AXFR
        );
    }
}
