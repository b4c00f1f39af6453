//! Trust-aware client address resolution and IP geolocation.
//!
//! [`remote_addr`] decides which IP literal to treat as "the client" for a
//! request that may have crossed intermediary proxies, without trusting
//! forwarding headers from arbitrary peers. [`geoip`] feeds the resolved
//! address to a remote geolocation service.

extern crate tracing as log;

pub mod error;
pub mod geoip;
pub mod remote_addr;

pub use self::error::Error;
pub use self::geoip::{GeoInfo, GeoIpClient};
pub use self::remote_addr::{is_crawler, is_proxy, normalize_header, resolve, RequestMetadata, TrustConfig};
