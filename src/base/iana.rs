//! IANA registry values used by zone maintenance.
//!
//! Each type is a thin wrapper around the integer used on the wire with
//! associated constants for the values we care about. Unknown values are
//! perfectly fine; they are displayed in their generic `TYPE<n>` style
//! representation.

use core::fmt;
use serde::{Deserialize, Serialize};

//------------ int_type ------------------------------------------------------

macro_rules! int_type {
    (
        $(#[$attr:meta])*
        $ianatype:ident, $inttype:ty, $generic:expr;
        $( $(#[$variant_attr:meta])* ($variant:ident, $value:expr, $mnemonic:expr) )*
    ) => {
        $(#[$attr])*
        #[derive(
            Clone, Copy, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
            Serialize,
        )]
        pub struct $ianatype($inttype);

        impl $ianatype {
            $(
                $(#[$variant_attr])*
                pub const $variant: Self = Self($value);
            )*

            pub const fn from_int(value: $inttype) -> Self {
                Self(value)
            }

            pub const fn to_int(self) -> $inttype {
                self.0
            }

            /// Returns the mnemonic for this value if it has one.
            pub fn to_mnemonic(self) -> Option<&'static str> {
                match self.0 {
                    $( $value => Some($mnemonic), )*
                    _ => None,
                }
            }

            /// Returns the value for the given mnemonic.
            ///
            /// The comparison ignores ASCII case.
            pub fn from_mnemonic(s: &str) -> Option<Self> {
                $(
                    if s.eq_ignore_ascii_case($mnemonic) {
                        return Some(Self($value));
                    }
                )*
                None
            }
        }

        impl From<$inttype> for $ianatype {
            fn from(value: $inttype) -> Self {
                Self(value)
            }
        }

        impl From<$ianatype> for $inttype {
            fn from(value: $ianatype) -> Self {
                value.0
            }
        }

        impl fmt::Display for $ianatype {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                match self.to_mnemonic() {
                    Some(m) => f.write_str(m),
                    None => write!(f, "{}{}", $generic, self.0),
                }
            }
        }

        impl fmt::Debug for $ianatype {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                match self.to_mnemonic() {
                    Some(m) => write!(f, "{}::{}", stringify!($ianatype), m),
                    None => write!(
                        f, "{}({})", stringify!($ianatype), self.0
                    ),
                }
            }
        }
    }
}

//------------ Rtype ---------------------------------------------------------

int_type! {
    /// Resource record types.
    Rtype, u16, "TYPE";

    (A, 1, "A")
    (NS, 2, "NS")
    (CNAME, 5, "CNAME")
    (SOA, 6, "SOA")
    (MX, 15, "MX")
    (TXT, 16, "TXT")
    (AAAA, 28, "AAAA")
    (SRV, 33, "SRV")
    (DNAME, 39, "DNAME")
    (OPT, 41, "OPT")
    (DS, 43, "DS")
    (RRSIG, 46, "RRSIG")
    (NSEC, 47, "NSEC")
    (DNSKEY, 48, "DNSKEY")
    (NSEC3, 50, "NSEC3")
    (NSEC3PARAM, 51, "NSEC3PARAM")
    (CDS, 59, "CDS")
    (CDNSKEY, 60, "CDNSKEY")
    (TSIG, 250, "TSIG")
    (IXFR, 251, "IXFR")
    (AXFR, 252, "AXFR")
    (ANY, 255, "ANY")
    /// Managed trust anchor state kept in key zones.
    (KEYDATA, 65533, "KEYDATA")
}

impl Rtype {
    /// The default type of the private records that track signing state.
    pub const DEFAULT_PRIVATE: Self = Self(65534);

    /// Returns whether records of this type are signed by the zone.
    ///
    /// RRSIGs are never signed themselves. The transfer meta types never
    /// appear in zones.
    pub fn is_signable(self) -> bool {
        !matches!(self, Rtype::RRSIG | Rtype::OPT | Rtype::TSIG)
            && !self.is_meta()
    }

    /// Returns whether this is a query-only meta type.
    pub fn is_meta(self) -> bool {
        matches!(self, Rtype::IXFR | Rtype::AXFR | Rtype::ANY)
    }
}

//------------ Class ---------------------------------------------------------

int_type! {
    /// DNS classes.
    Class, u16, "CLASS";

    (IN, 1, "IN")
    (CH, 3, "CH")
    (HS, 4, "HS")
    (NONE, 254, "NONE")
    (ANY, 255, "ANY")
}

impl Default for Class {
    fn default() -> Self {
        Class::IN
    }
}

//------------ Rcode ---------------------------------------------------------

int_type! {
    /// Response codes.
    Rcode, u8, "RCODE";

    (NOERROR, 0, "NOERROR")
    (FORMERR, 1, "FORMERR")
    (SERVFAIL, 2, "SERVFAIL")
    (NXDOMAIN, 3, "NXDOMAIN")
    (NOTIMP, 4, "NOTIMP")
    (REFUSED, 5, "REFUSED")
    (YXDOMAIN, 6, "YXDOMAIN")
    (YXRRSET, 7, "YXRRSET")
    (NXRRSET, 8, "NXRRSET")
    (NOTAUTH, 9, "NOTAUTH")
    (NOTZONE, 10, "NOTZONE")
}

//------------ Opcode --------------------------------------------------------

int_type! {
    /// Message opcodes.
    Opcode, u8, "OPCODE";

    (QUERY, 0, "QUERY")
    (NOTIFY, 4, "NOTIFY")
    (UPDATE, 5, "UPDATE")
}

//------------ SecAlg --------------------------------------------------------

int_type! {
    /// DNSSEC security algorithms.
    SecAlg, u8, "ALG";

    (RSAMD5, 1, "RSAMD5")
    (DSA, 3, "DSA")
    (RSASHA1, 5, "RSASHA1")
    (DSA_NSEC3_SHA1, 6, "DSA-NSEC3-SHA1")
    (RSASHA1_NSEC3_SHA1, 7, "RSASHA1-NSEC3-SHA1")
    (RSASHA256, 8, "RSASHA256")
    (RSASHA512, 10, "RSASHA512")
    (ECC_GOST, 12, "ECC-GOST")
    (ECDSAP256SHA256, 13, "ECDSAP256SHA256")
    (ECDSAP384SHA384, 14, "ECDSAP384SHA384")
    (ED25519, 15, "ED25519")
    (ED448, 16, "ED448")
}

impl SecAlg {
    /// Returns whether the algorithm may be used with NSEC3.
    ///
    /// The algorithms assigned before RFC 5155 must not be used to sign
    /// zones that use NSEC3. Resolvers not aware of NSEC3 treat zones
    /// signed with them as insecure otherwise.
    pub fn supports_nsec3(self) -> bool {
        !matches!(self, SecAlg::RSAMD5 | SecAlg::DSA | SecAlg::RSASHA1)
    }
}

//------------ Nsec3HashAlg --------------------------------------------------

int_type! {
    /// NSEC3 hash algorithms.
    Nsec3HashAlg, u8, "HASH";

    (SHA1, 1, "SHA-1")
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(Rtype::SOA.to_string(), "SOA");
        assert_eq!(Rtype::from_int(65534).to_string(), "TYPE65534");
        assert_eq!(Rcode::REFUSED.to_string(), "REFUSED");
        assert_eq!(format!("{:?}", Rtype::NS), "Rtype::NS");
    }

    #[test]
    fn mnemonic() {
        assert_eq!(Rtype::from_mnemonic("nsec3param"), Some(Rtype::NSEC3PARAM));
        assert_eq!(Class::from_mnemonic("IN"), Some(Class::IN));
        assert_eq!(SecAlg::from_mnemonic("foo"), None);
    }

    #[test]
    fn nsec3_algorithms() {
        assert!(!SecAlg::RSASHA1.supports_nsec3());
        assert!(!SecAlg::RSAMD5.supports_nsec3());
        assert!(SecAlg::RSASHA1_NSEC3_SHA1.supports_nsec3());
        assert!(SecAlg::ED25519.supports_nsec3());
    }
}
