//! DHCPRELEASE emission for revoked leases.
//!
//! Revoking a lease is effected by sending a well-formed RFC 2131
//! DHCPRELEASE on the client's behalf: the DHCP server then frees the
//! address immediately instead of waiting for expiry. Packet construction is
//! a pure function; only [`send_release`] touches the network.

use std::io;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Arc;

use macaddr::MacAddr6;
use nacd_core::reconcile::ReconciliationAction;

use crate::repository::{ActionSink, SinkError};
use crate::store::{LeaseStore, format_mac};

/// DHCP server port.
pub const DHCP_SERVER_PORT: u16 = 67;

/// DHCP client port; release packets are sent from it.
pub const DHCP_CLIENT_PORT: u16 = 68;

/// Offset of the options region: the fixed RFC 2131 header plus the magic
/// cookie.
const OPTIONS_OFFSET: usize = 236 + 4;

/// Size of the zero-padded options region.
const OPTIONS_SIZE: usize = 308;

const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

/// DHCPRELEASE message type value for option 53.
const DHCP_RELEASE: u8 = 7;

const RELEASE_MESSAGE: &[u8] = b"Lease revoked administratively";

/// Build a DHCPRELEASE packet for the given client.
///
/// The packet carries message-type, server-identifier, and message options,
/// plus the client identifier when one is known. `xid` is supplied by the
/// caller so packet construction stays deterministic under test.
#[must_use]
pub fn build_release_packet(
    server_ip: Ipv4Addr,
    client_ip: Ipv4Addr,
    client_mac: MacAddr6,
    client_id: Option<&[u8]>,
    xid: u32,
) -> Vec<u8> {
    let mut packet = vec![0u8; OPTIONS_OFFSET + OPTIONS_SIZE];
    packet[0] = 1; // op: BOOTREQUEST
    packet[1] = 1; // htype: Ethernet
    packet[2] = 6; // hlen
    // hops stays 0
    packet[4..8].copy_from_slice(&xid.to_be_bytes());
    // secs and flags stay 0
    packet[12..16].copy_from_slice(&client_ip.octets()); // ciaddr
    // yiaddr, siaddr, giaddr stay 0
    packet[28..34].copy_from_slice(client_mac.as_bytes()); // chaddr
    // sname and file stay 0
    packet[236..240].copy_from_slice(&MAGIC_COOKIE);

    let mut options = Vec::with_capacity(OPTIONS_SIZE);
    options.extend_from_slice(&[53, 1, DHCP_RELEASE]);
    options.extend_from_slice(&[54, 4]);
    options.extend_from_slice(&server_ip.octets());
    options.push(56);
    options.push(u8::try_from(RELEASE_MESSAGE.len()).unwrap_or(u8::MAX));
    options.extend_from_slice(RELEASE_MESSAGE);
    if let Some(client_id) = client_id {
        let len = client_id.len().min(255);
        options.push(61);
        options.push(u8::try_from(len).unwrap_or(u8::MAX));
        options.extend_from_slice(&client_id[..len]);
    }
    options.push(255);

    let end = OPTIONS_OFFSET + options.len().min(OPTIONS_SIZE);
    packet[OPTIONS_OFFSET..end].copy_from_slice(&options[..end - OPTIONS_OFFSET]);
    packet
}

/// Send a DHCPRELEASE for the given lease to a DHCP server.
///
/// The packet is sent as a DHCP client (source port 68) to the server port.
/// When `from_ip` is unset the operating system chooses the source address.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound or the packet cannot be
/// sent.
pub fn send_release(
    server_ip: Ipv4Addr,
    client_ip: Ipv4Addr,
    client_mac: MacAddr6,
    client_id: Option<&[u8]>,
    from_ip: Option<Ipv4Addr>,
) -> io::Result<()> {
    let packet = build_release_packet(
        server_ip,
        client_ip,
        client_mac,
        client_id,
        rand::random::<u32>(),
    );
    let socket = UdpSocket::bind((
        from_ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
        DHCP_CLIENT_PORT,
    ))?;
    let sent = socket.send_to(&packet, (server_ip, DHCP_SERVER_PORT))?;
    if sent < packet.len() {
        tracing::error!(sent, total = packet.len(), "short send of release packet");
    }
    Ok(())
}

/// Applies reconciliation actions against the running DHCP daemon.
///
/// Revokes resolve the lease in the store and release it; grants are logged
/// only, because the host reservation export consumed by the DHCP daemon is
/// regenerated by an external collaborator.
pub struct ReleaseActionSink {
    store: Arc<LeaseStore>,
    dhcp_server_ip: Option<Ipv4Addr>,
    from_ip: Option<Ipv4Addr>,
}

impl ReleaseActionSink {
    /// Create a sink over the given lease store.
    #[must_use]
    pub fn new(
        store: Arc<LeaseStore>,
        dhcp_server_ip: Option<Ipv4Addr>,
        from_ip: Option<Ipv4Addr>,
    ) -> Self {
        Self {
            store,
            dhcp_server_ip,
            from_ip,
        }
    }

    fn revoke(&self, ip: IpAddr) -> Result<(), SinkError> {
        let Some(lease) = self.store.get(ip)? else {
            tracing::debug!(%ip, "revoke for ip without active lease");
            return Ok(());
        };
        let Some(server_ip) = self.dhcp_server_ip else {
            tracing::info!(
                %ip,
                mac = %format_mac(lease.mac),
                "lease invalid but no DHCP server configured for release"
            );
            return Ok(());
        };
        let IpAddr::V4(client_ip) = ip else {
            tracing::warn!(%ip, "cannot release non-IPv4 lease; skipping");
            return Ok(());
        };
        tracing::debug!(%ip, mac = %format_mac(lease.mac), "releasing lease");
        send_release(
            server_ip,
            client_ip,
            lease.mac,
            lease.client_id.as_deref(),
            self.from_ip,
        )?;
        Ok(())
    }
}

impl ActionSink for ReleaseActionSink {
    fn apply(&self, actions: &[ReconciliationAction]) -> Result<(), SinkError> {
        for action in actions {
            match action {
                ReconciliationAction::Revoke { ip } => self.revoke(*ip)?,
                ReconciliationAction::Grant { mac, ip, hostname } => {
                    tracing::debug!(
                        mac = %format_mac(*mac),
                        %ip,
                        hostname = hostname.as_deref().unwrap_or("*"),
                        "reservation granted"
                    );
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(s: &str) -> MacAddr6 {
        s.parse().unwrap()
    }

    #[test]
    fn test_release_packet_header_layout() {
        let packet = build_release_packet(
            Ipv4Addr::new(10, 66, 0, 1),
            Ipv4Addr::new(141, 30, 227, 13),
            mac("de:ad:be:ef:00:00"),
            None,
            0x1122_3344,
        );
        assert_eq!(packet.len(), 236 + 4 + 308);
        assert_eq!(packet[0], 1, "op must be BOOTREQUEST");
        assert_eq!(packet[1], 1, "htype must be Ethernet");
        assert_eq!(packet[2], 6, "hlen must be 6");
        assert_eq!(&packet[4..8], &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(&packet[12..16], &[141, 30, 227, 13], "ciaddr");
        assert_eq!(&packet[16..20], &[0, 0, 0, 0], "yiaddr stays empty");
        assert_eq!(&packet[28..34], &[0xde, 0xad, 0xbe, 0xef, 0x00, 0x00]);
        assert_eq!(&packet[34..44], &[0u8; 10], "chaddr padding");
        assert_eq!(&packet[236..240], &[0x63, 0x82, 0x53, 0x63]);
    }

    #[test]
    fn test_release_packet_options() {
        let packet = build_release_packet(
            Ipv4Addr::new(10, 66, 0, 1),
            Ipv4Addr::new(141, 30, 227, 13),
            mac("de:ad:be:ef:00:00"),
            None,
            0,
        );
        let options = &packet[OPTIONS_OFFSET..];
        assert_eq!(&options[0..3], &[53, 1, DHCP_RELEASE]);
        assert_eq!(&options[3..5], &[54, 4]);
        assert_eq!(&options[5..9], &[10, 66, 0, 1]);
        assert_eq!(options[9], 56);
        let len = options[10] as usize;
        assert_eq!(&options[11..11 + len], RELEASE_MESSAGE);
        assert_eq!(options[11 + len], 255, "end option terminates the packet");
    }

    #[test]
    fn test_release_packet_includes_client_id_when_known() {
        let client_id = [0x01, 0x50, 0x7b, 0x9d];
        let packet = build_release_packet(
            Ipv4Addr::new(10, 66, 0, 1),
            Ipv4Addr::new(141, 30, 227, 13),
            mac("de:ad:be:ef:00:00"),
            Some(&client_id),
            0,
        );
        let options = &packet[OPTIONS_OFFSET..];
        let message_len = options[10] as usize;
        let after_message = 11 + message_len;
        assert_eq!(options[after_message], 61);
        assert_eq!(options[after_message + 1] as usize, client_id.len());
        assert_eq!(
            &options[after_message + 2..after_message + 2 + client_id.len()],
            &client_id
        );
        assert_eq!(options[after_message + 2 + client_id.len()], 255);
    }
}
