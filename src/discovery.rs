//! Guest address discovery.
//!
//! After boot the guest obtains an address from the host's vmnet DHCP
//! server, which records it in `/var/db/dhcpd_leases`:
//!
//! ```text
//! {
//!     name=darwin-vz-guest
//!     ip_address=192.168.64.2
//!     hw_address=1,2:da:72:56:0:1
//!     identifier=1,2:da:72:56:0:1
//!     lease=0x67000001
//! }
//! ```
//!
//! Leases survive VM restarts, so a hostname match alone can point at a
//! previous incarnation. Discovery therefore only considers leases newer
//! than the VM start and confirms the candidate through the ARP table
//! against the guest's fixed MAC address before accepting it.

use crate::constants::{DHCP_LEASES_PATH, GUEST_HOSTNAME, GUEST_MAC_ADDRESS};
use crate::error::{Error, Result};
use crate::host::{args, CommandRunner};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Path of the ARP utility.
pub const ARP_BIN: &str = "/usr/sbin/arp";

/// Delay between lease registry polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// ARP output for a host that did not answer.
const ARP_INCOMPLETE: &str = "(incomplete)";

/// One block of the lease registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseEntry {
    /// Hostname declared by the client.
    pub name: Option<String>,
    /// Assigned address.
    pub ip_address: Option<String>,
    /// Client hardware address, without the type prefix.
    pub hw_address: Option<String>,
    /// Lease counter (seconds since the epoch, hex in the file). 0 if absent.
    pub lease: u64,
}

/// Parse lease registry content into entries.
///
/// Malformed content yields whatever blocks could be read; fields that are
/// missing stay `None` and a missing or unparsable lease counts as 0.
pub fn parse_leases(content: &str) -> Vec<LeaseEntry> {
    content
        .split('}')
        .map(parse_block)
        .filter(|entry| *entry != LeaseEntry::default())
        .collect()
}

fn parse_block(block: &str) -> LeaseEntry {
    let mut entry = LeaseEntry::default();

    for line in block.lines() {
        let line = line.trim();
        if let Some(name) = line.strip_prefix("name=") {
            entry.name = Some(name.to_string());
        } else if let Some(ip) = line.strip_prefix("ip_address=") {
            entry.ip_address = Some(ip.to_string());
        } else if let Some(hw) = line.strip_prefix("hw_address=") {
            // "1,2:da:..." where the leading number is the hardware type.
            let mac = hw.split_once(',').map_or(hw, |(_, mac)| mac);
            entry.hw_address = Some(mac.to_string());
        } else if let Some(hex) = line.strip_prefix("lease=0x") {
            entry.lease = u64::from_str_radix(hex, 16).unwrap_or(0);
        }
    }

    entry
}

/// Pick the newest lease for `hostname` issued after `not_before`.
///
/// Entries without an address are skipped. Among equal counters the last
/// one in file order wins.
pub fn select_lease<'a>(
    entries: &'a [LeaseEntry],
    hostname: &str,
    not_before: u64,
) -> Option<&'a LeaseEntry> {
    let mut newest: Option<&LeaseEntry> = None;

    for entry in entries {
        if entry.name.as_deref() != Some(hostname) || entry.ip_address.is_none() {
            continue;
        }
        if entry.lease <= not_before {
            continue;
        }
        if newest.map_or(true, |n| entry.lease >= n.lease) {
            newest = Some(entry);
        }
    }

    newest
}

/// Address of the newest eligible lease in raw registry content.
pub fn find_lease_ip(content: &str, hostname: &str, not_before: u64) -> Option<String> {
    let entries = parse_leases(content);
    select_lease(&entries, hostname, not_before).and_then(|e| e.ip_address.clone())
}

/// Normalize a MAC address for comparison.
///
/// Lower-cases and strips leading zeros from every octet, so
/// `02:DA:72:56:00:01` and `2:da:72:56:0:1` compare equal.
pub fn normalize_mac(mac: &str) -> String {
    mac.to_lowercase()
        .split(':')
        .map(|octet| {
            let stripped = octet.trim_start_matches('0');
            if stripped.is_empty() {
                "0"
            } else {
                stripped
            }
        })
        .collect::<Vec<_>>()
        .join(":")
}

/// Extract the MAC from `arp -an <ip>` output.
///
/// Output looks like `? (192.168.64.8) at 2:da:72:56:0:1 on bridge100 ...`.
/// Returns `None` when the markers are missing or the entry is incomplete.
pub fn parse_arp_mac(output: &str) -> Option<&str> {
    let (_, rest) = output.split_once(" at ")?;
    let (mac, _) = rest.split_once(" on ")?;
    if mac == ARP_INCOMPLETE {
        return None;
    }
    Some(mac)
}

/// Confirm through the ARP table that `ip` belongs to `expected_mac`.
///
/// Any failure to run or parse `arp` counts as unverified.
pub fn verify_ip_via_arp(runner: &dyn CommandRunner, ip: &str, expected_mac: &str) -> bool {
    let output = match runner.run(ARP_BIN, &args(["-an", ip])) {
        Ok(output) => output,
        Err(e) => {
            tracing::debug!(ip, error = %e, "arp lookup failed");
            return false;
        }
    };

    match parse_arp_mac(&output.stdout) {
        Some(mac) => {
            let matches = normalize_mac(mac) == normalize_mac(expected_mac);
            if !matches {
                tracing::debug!(ip, observed = mac, expected = expected_mac, "arp mac mismatch");
            }
            matches
        }
        None => false,
    }
}

/// Convert a wall-clock instant to the lease registry's counter unit.
pub fn lease_counter(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Discovery progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Reading the lease registry.
    Polling,
    /// Checking a candidate against the ARP table.
    Verifying(String),
    /// Candidate confirmed.
    Found(String),
    /// Deadline passed without a confirmed address.
    TimedOut,
}

/// Polls the lease registry until the guest address is confirmed.
pub struct GuestDiscovery<'a> {
    runner: &'a dyn CommandRunner,
    lease_file: PathBuf,
    hostname: String,
    expected_mac: String,
    timeout: Duration,
    poll_interval: Duration,
}

impl<'a> GuestDiscovery<'a> {
    /// Discovery against the system lease registry with default timing.
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            lease_file: PathBuf::from(DHCP_LEASES_PATH),
            hostname: GUEST_HOSTNAME.to_string(),
            expected_mac: GUEST_MAC_ADDRESS.to_string(),
            timeout: crate::settings::DEFAULT_DISCOVERY_TIMEOUT,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Read leases from `path` instead of the system registry.
    pub fn with_lease_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lease_file = path.into();
        self
    }

    /// Give up after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Wait `interval` between polls.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Block until the guest address is verified or the timeout passes.
    ///
    /// Only leases with a counter greater than `not_before` qualify.
    pub fn discover(&self, not_before: u64) -> Result<String> {
        let deadline = Instant::now() + self.timeout;
        let mut state = DiscoveryState::Polling;

        loop {
            state = match state {
                DiscoveryState::Polling => match self.poll(not_before) {
                    Some(ip) => DiscoveryState::Verifying(ip),
                    None => self.wait_or_time_out(deadline),
                },
                DiscoveryState::Verifying(ip) => {
                    if verify_ip_via_arp(self.runner, &ip, &self.expected_mac) {
                        DiscoveryState::Found(ip)
                    } else {
                        tracing::debug!(ip = %ip, "candidate not verified");
                        self.wait_or_time_out(deadline)
                    }
                }
                DiscoveryState::Found(ip) => {
                    tracing::info!(ip = %ip, "guest address verified");
                    return Ok(ip);
                }
                DiscoveryState::TimedOut => {
                    tracing::debug!(timeout = ?self.timeout, "guest discovery timed out");
                    return Err(Error::GuestIpNotFound);
                }
            };
        }
    }

    /// Discover the address and persist it to `record`.
    pub fn discover_and_record(&self, not_before: u64, record: &Path) -> Result<String> {
        let ip = self.discover(not_before)?;
        write_guest_ip(record, &ip)?;
        Ok(ip)
    }

    fn poll(&self, not_before: u64) -> Option<String> {
        // Missing or unreadable registry just means no candidate yet.
        let content = std::fs::read_to_string(&self.lease_file).ok()?;
        find_lease_ip(&content, &self.hostname, not_before)
    }

    fn wait_or_time_out(&self, deadline: Instant) -> DiscoveryState {
        let now = Instant::now();
        if now >= deadline {
            return DiscoveryState::TimedOut;
        }
        std::thread::sleep(self.poll_interval.min(deadline - now));
        DiscoveryState::Polling
    }
}

/// Read the recorded guest address.
pub fn read_guest_ip(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path).map_err(|_| Error::GuestIpNotFound)?;
    let ip = content.trim();
    if ip.is_empty() {
        return Err(Error::GuestIpNotFound);
    }
    Ok(ip.to_string())
}

/// Atomically record the guest address (mode 0644).
pub fn write_guest_ip(path: &Path, ip: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(ip.as_bytes())?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
