//! Offline IP-range table provider.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use tracing::trace;

use super::provider::{GeoProvider, GeoResult, PRIVATE_COUNTRY_CODE};
use crate::error::{QuotaGuardError, Result};

/// An inclusive range of IPv4 addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    pub start: u32,
    pub end: u32,
}

impl IpRange {
    /// Parse a range from dotted endpoints.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let start = ip_to_number(start)
            .ok_or_else(|| QuotaGuardError::Config(format!("invalid IPv4 address: {}", start)))?;
        let end = ip_to_number(end)
            .ok_or_else(|| QuotaGuardError::Config(format!("invalid IPv4 address: {}", end)))?;
        if start > end {
            return Err(QuotaGuardError::Config(format!(
                "range start {} is after end {}",
                Ipv4Addr::from(start),
                Ipv4Addr::from(end)
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ip: u32) -> bool {
        ip >= self.start && ip <= self.end
    }
}

/// Dotted IPv4 address as a 32-bit integer.
pub fn ip_to_number(ip: &str) -> Option<u32> {
    ip.trim().parse::<Ipv4Addr>().ok().map(u32::from)
}

#[derive(Debug, Clone)]
struct CountryRanges {
    code: String,
    country: String,
    ranges: Vec<IpRange>,
}

/// Country lookup over a fixed table of IPv4 ranges.
///
/// Countries are scanned in insertion order and the first containing range
/// wins. IPv6 and malformed addresses resolve to nothing.
#[derive(Debug, Clone, Default)]
pub struct StaticGeoProvider {
    table: Vec<CountryRanges>,
}

impl StaticGeoProvider {
    /// The built-in sample table.
    pub fn new() -> Self {
        let mut provider = Self::empty();
        let builtin: [(&str, &str, &str, &str); 7] = [
            ("US", "United States", "3.0.0.0", "3.255.255.255"),
            ("US", "United States", "4.0.0.0", "4.255.255.255"),
            ("GB", "United Kingdom", "2.16.0.0", "2.16.255.255"),
            (PRIVATE_COUNTRY_CODE, "Localhost", "127.0.0.0", "127.255.255.255"),
            (PRIVATE_COUNTRY_CODE, "Private", "10.0.0.0", "10.255.255.255"),
            (PRIVATE_COUNTRY_CODE, "Private", "172.16.0.0", "172.31.255.255"),
            (PRIVATE_COUNTRY_CODE, "Private", "192.168.0.0", "192.168.255.255"),
        ];
        for (code, country, start, end) in builtin {
            // The literals above are well-formed.
            if let Ok(range) = IpRange::parse(start, end) {
                provider.push(code, country, range);
            }
        }
        provider
    }

    /// A provider with no ranges.
    pub fn empty() -> Self {
        Self { table: Vec::new() }
    }

    /// Add a range for a country.
    pub fn with_range(mut self, code: &str, country: &str, start: &str, end: &str) -> Result<Self> {
        let range = IpRange::parse(start, end)?;
        self.push(code, country, range);
        Ok(self)
    }

    fn push(&mut self, code: &str, country: &str, range: IpRange) {
        match self
            .table
            .iter_mut()
            .find(|c| c.code == code && c.country == country)
        {
            Some(entry) => entry.ranges.push(range),
            None => self.table.push(CountryRanges {
                code: code.to_string(),
                country: country.to_string(),
                ranges: vec![range],
            }),
        }
    }

    /// Synchronous lookup.
    pub fn resolve(&self, ip: &str) -> Option<GeoResult> {
        let Some(ip_num) = ip_to_number(ip) else {
            trace!(ip = %ip, "Not an IPv4 address, skipping static lookup");
            return None;
        };

        self.table
            .iter()
            .find(|entry| entry.ranges.iter().any(|r| r.contains(ip_num)))
            .map(|entry| GeoResult::country(&entry.code, &entry.country))
    }
}

#[async_trait]
impl GeoProvider for StaticGeoProvider {
    async fn lookup(&self, ip: &str) -> Result<Option<GeoResult>> {
        Ok(self.resolve(ip))
    }

    fn name(&self) -> &str {
        "internal"
    }
}
