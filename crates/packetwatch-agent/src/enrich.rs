// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry enrichment: country and owning-process lookups.
//!
//! Both resolvers cache aggressively. A busy flow produces thousands of
//! packets for the same peer, and neither the geolocation API nor a procfs
//! walk is cheap enough to repeat per packet.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

/// Country label for non-routable peers.
pub const COUNTRY_LOCAL: &str = "Local";
/// Country label when the lookup fails or the service has no answer.
pub const COUNTRY_UNKNOWN: &str = "Unknown";
/// Process label when no owning process can be found.
pub const SOFTWARE_UNKNOWN: &str = "Unknown";

/// Upper bound on a single geolocation query.
const GEO_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct GeoResponse {
    status: String,
    #[serde(default)]
    country: Option<String>,
}

/// Maps peer addresses to country names via an ip-api.com style endpoint.
pub struct GeoResolver {
    client: reqwest::Client,
    api_base: String,
    cache: HashMap<IpAddr, String>,
}

impl GeoResolver {
    /// `api_base` is the service root without a trailing slash, e.g.
    /// `http://ip-api.com/json`.
    pub fn new(api_base: String) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(GEO_LOOKUP_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            api_base,
            cache: HashMap::new(),
        })
    }

    /// Resolves the country for a peer address.
    ///
    /// Every outcome is cached, including `Unknown`, so a dead lookup is
    /// not retried for each packet of the same flow.
    pub async fn resolve(&mut self, ip: IpAddr) -> String {
        if let Some(country) = self.cache.get(&ip) {
            return country.clone();
        }

        let country = if is_private(ip) {
            COUNTRY_LOCAL.to_string()
        } else {
            self.query(ip).await
        };
        self.cache.insert(ip, country.clone());
        country
    }

    async fn query(&self, ip: IpAddr) -> String {
        let url = format!("{}/{ip}?fields=status,country", self.api_base);
        match self.lookup(&url).await {
            Ok(response) if response.status == "success" => response
                .country
                .unwrap_or_else(|| COUNTRY_UNKNOWN.to_string()),
            Ok(_) => COUNTRY_UNKNOWN.to_string(),
            Err(e) => {
                debug!("Geo lookup failed for {ip}: {e}");
                COUNTRY_UNKNOWN.to_string()
            }
        }
    }

    async fn lookup(&self, url: &str) -> Result<GeoResponse, reqwest::Error> {
        self.client.get(url).send().await?.json().await
    }
}

/// Peers that never leave the site network. Only 10/8, 127/8 and
/// 192.168/16 short-circuit to `Local`; every other range goes through
/// the lookup.
fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            octets[0] == 10 || octets[0] == 127 || (octets[0] == 192 && octets[1] == 168)
        }
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Maps a flow endpoint to the name of the local process bound to it.
///
/// Lookups walk procfs, so results are cached per endpoint. Flows whose
/// owning process cannot be found are recorded as `Unknown`.
#[derive(Default)]
pub struct SoftwareResolver {
    cache: HashMap<(IpAddr, u16), String>,
}

impl SoftwareResolver {
    pub fn resolve(&mut self, ip: IpAddr, port: u16) -> String {
        if let Some(name) = self.cache.get(&(ip, port)) {
            return name.clone();
        }

        let name =
            lookup_process_name(ip, port).unwrap_or_else(|| SOFTWARE_UNKNOWN.to_string());
        self.cache.insert((ip, port), name.clone());
        name
    }
}

/// Finds the process owning a socket whose local or remote endpoint is
/// `ip:port`, by chasing the socket inode through `/proc/<pid>/fd`.
#[cfg(target_os = "linux")]
fn lookup_process_name(ip: IpAddr, port: u16) -> Option<String> {
    let ip = match ip {
        IpAddr::V4(v4) => v4,
        // The capture path is IPv4 only, so the v6 tables are not parsed.
        IpAddr::V6(_) => return None,
    };

    for table in ["/proc/net/tcp", "/proc/net/udp"] {
        let content = match std::fs::read_to_string(table) {
            Ok(content) => content,
            Err(_) => continue,
        };
        if let Some(inode) = find_socket_inode(&content, ip, port) {
            if let Some(pid) = find_pid_by_inode(&inode) {
                if let Some(name) = read_process_name(pid) {
                    return Some(name);
                }
            }
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn lookup_process_name(_ip: IpAddr, _port: u16) -> Option<String> {
    None
}

/// Scans a `/proc/net/{tcp,udp}` table for a socket whose local or remote
/// endpoint matches, returning its inode column.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn find_socket_inode(table: &str, ip: std::net::Ipv4Addr, port: u16) -> Option<String> {
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }

        let local = parse_proc_endpoint(fields[1]);
        let remote = parse_proc_endpoint(fields[2]);
        let matched = local == Some((ip, port)) || remote == Some((ip, port));
        // Inode 0 marks sockets without an owner, e.g. TIME_WAIT entries.
        if matched && fields[9] != "0" {
            return Some(fields[9].to_string());
        }
    }
    None
}

/// Parses one `address:port` column. The kernel prints the IPv4 address as
/// eight hex digits in little-endian byte order and the port big-endian.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_endpoint(field: &str) -> Option<(std::net::Ipv4Addr, u16)> {
    let (hex_ip, hex_port) = field.split_once(':')?;
    if hex_ip.len() != 8 {
        return None;
    }
    let raw = u32::from_str_radix(hex_ip, 16).ok()?;
    let bytes = raw.to_be_bytes();
    let ip = std::net::Ipv4Addr::new(bytes[3], bytes[2], bytes[1], bytes[0]);
    let port = u16::from_str_radix(hex_port, 16).ok()?;
    Some((ip, port))
}

#[cfg(target_os = "linux")]
fn find_pid_by_inode(inode: &str) -> Option<u32> {
    let target = format!("socket:[{inode}]");

    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let pid = match entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
            Some(pid) => pid,
            None => continue,
        };
        let fds = match std::fs::read_dir(entry.path().join("fd")) {
            Ok(fds) => fds,
            // Sockets of other users are not readable without privileges.
            Err(_) => continue,
        };
        for fd in fds.flatten() {
            if let Ok(link) = std::fs::read_link(fd.path()) {
                if link.to_string_lossy() == target {
                    return Some(pid);
                }
            }
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn read_process_name(pid: u32) -> Option<String> {
    let comm = std::fs::read_to_string(format!("/proc/{pid}/comm")).ok()?;
    let name = comm.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn geo_resolver_caches_successful_lookups() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/8.8.8.8")
            .match_query(Matcher::UrlEncoded(
                "fields".into(),
                "status,country".into(),
            ))
            .with_status(200)
            .with_body(r#"{"status":"success","country":"United States"}"#)
            .expect(1)
            .create_async()
            .await;

        let mut resolver = GeoResolver::new(server.url()).unwrap();
        let ip: IpAddr = "8.8.8.8".parse().unwrap();

        assert_eq!(resolver.resolve(ip).await, "United States");
        // Second resolve must come from the cache.
        assert_eq!(resolver.resolve(ip).await, "United States");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn geo_resolver_short_circuits_private_ranges() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let mut resolver = GeoResolver::new(server.url()).unwrap();

        assert_eq!(resolver.resolve("10.1.2.3".parse().unwrap()).await, "Local");
        assert_eq!(
            resolver.resolve("192.168.0.77".parse().unwrap()).await,
            "Local"
        );
        assert_eq!(
            resolver.resolve("127.0.0.1".parse().unwrap()).await,
            "Local"
        );
        assert_eq!(resolver.resolve("::1".parse().unwrap()).await, "Local");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn geo_resolver_caches_failures_as_unknown() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/203.0.113.5")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"status":"fail"}"#)
            .expect(1)
            .create_async()
            .await;

        let mut resolver = GeoResolver::new(server.url()).unwrap();
        let ip: IpAddr = "203.0.113.5".parse().unwrap();

        assert_eq!(resolver.resolve(ip).await, COUNTRY_UNKNOWN);
        assert_eq!(resolver.resolve(ip).await, COUNTRY_UNKNOWN);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn geo_resolver_maps_transport_errors_to_unknown() {
        // The .invalid TLD never resolves, so the request fails outright.
        let mut resolver = GeoResolver::new("http://geo.invalid/json".to_string()).unwrap();
        let country = resolver.resolve("198.51.100.1".parse().unwrap()).await;
        assert_eq!(country, COUNTRY_UNKNOWN);
    }

    #[test]
    fn is_private_covers_the_short_circuit_ranges() {
        assert!(is_private("10.0.0.1".parse().unwrap()));
        assert!(is_private("127.0.0.1".parse().unwrap()));
        assert!(is_private("192.168.254.3".parse().unwrap()));
        // 172.16/12 goes through the lookup.
        assert!(!is_private("172.16.0.1".parse().unwrap()));
        assert!(!is_private("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn parse_proc_endpoint_reverses_kernel_byte_order() {
        assert_eq!(
            parse_proc_endpoint("0100007F:0CEA"),
            Some((Ipv4Addr::new(127, 0, 0, 1), 3306))
        );
        assert_eq!(
            parse_proc_endpoint("22D8B85D:01BB"),
            Some((Ipv4Addr::new(93, 184, 216, 34), 443))
        );
        assert_eq!(parse_proc_endpoint("garbage"), None);
        assert_eq!(parse_proc_endpoint("0100007F"), None);
    }

    #[test]
    fn find_socket_inode_matches_either_endpoint() {
        let table = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n   0: 0100007F:0CEA 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 100 0 0 10 0\n   1: 0F01A8C0:C832 22D8B85D:01BB 01 00000000:00000000 00:00000000 00000000  1000        0 67890 1 0000000000000000 20 4 30 10 -1\n";

        // Remote endpoint of the established connection.
        assert_eq!(
            find_socket_inode(table, Ipv4Addr::new(93, 184, 216, 34), 443),
            Some("67890".to_string())
        );
        // Local endpoint of the listener.
        assert_eq!(
            find_socket_inode(table, Ipv4Addr::new(127, 0, 0, 1), 3306),
            Some("12345".to_string())
        );
        assert_eq!(
            find_socket_inode(table, Ipv4Addr::new(203, 0, 113, 9), 80),
            None
        );
    }

    #[test]
    fn find_socket_inode_skips_unowned_sockets() {
        let table = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n   0: 0F01A8C0:C832 22D8B85D:01BB 06 00000000:00000000 00:00000000 00000000  1000        0 0 1 0000000000000000\n";
        assert_eq!(
            find_socket_inode(table, Ipv4Addr::new(93, 184, 216, 34), 443),
            None
        );
    }

    #[test]
    fn software_resolver_caches_misses() {
        let mut resolver = SoftwareResolver::default();
        let ip: IpAddr = "203.0.113.80".parse().unwrap();
        // No socket to this address exists, so both calls settle on Unknown
        // and the second is served from the cache.
        assert_eq!(resolver.resolve(ip, 65001), SOFTWARE_UNKNOWN);
        assert_eq!(resolver.resolve(ip, 65001), SOFTWARE_UNKNOWN);
        assert_eq!(resolver.cache.len(), 1);
    }
}
