//! Fixed values shared with the NixOS guest image.
//!
//! The guest is built separately from this crate. Every constant here has a
//! counterpart in the guest's Nix configuration and must be changed on both
//! sides together.

/// VirtioFS tag for the read-only host `/nix/store` share.
///
/// Guest: `fileSystems."/nix/.ro-store".device`.
pub const NIX_STORE_TAG: &str = "nix-store";

/// VirtioFS tag for the Rosetta runtime share.
///
/// Guest: `virtualisation.rosetta.mountTag`.
pub const ROSETTA_TAG: &str = "rosetta";

/// VirtioFS tag for the SSH public key share.
///
/// Guest: `fileSystems."/run/ssh-keys".device`.
pub const SSH_KEYS_TAG: &str = "ssh-keys";

/// Hostname the guest reports to the host DHCP server.
///
/// Guest: `networking.hostName`.
pub const GUEST_HOSTNAME: &str = "darwin-vz-guest";

/// Locally administered MAC address assigned to the guest NIC.
///
/// `02` marks a locally administered unicast address; `da:72:56` spells "darVZ".
pub const GUEST_MAC_ADDRESS: &str = "02:da:72:56:00:01";

/// Login user provisioned in the guest.
pub const SSH_USER: &str = "builder";

/// Port the guest sshd listens on.
pub const SSH_PORT: u16 = 22;

/// Comment embedded in the generated host keypair.
pub const SSH_KEY_COMMENT: &str = "builder@darwin-vz-nix";

/// Host package store shared into the guest.
pub const NIX_STORE_PATH: &str = "/nix/store";

/// macOS vmnet DHCP lease registry.
pub const DHCP_LEASES_PATH: &str = "/var/db/dhcpd_leases";
