//! Typed interpretation of decoded hook invocations.
//!
//! A decoded invocation carries a command in `argv` and structured metadata
//! in `DNSMASQ_*` environment variables. This module turns that pair into a
//! [`HookRequest`]: either an `init` state query or a [`LeaseEvent`] to be
//! applied to the lease store.
//!
//! The `DNSMASQ_` namespace is the DHCP daemon's hook API and a stable wire
//! contract; the recognized keys below must not be renamed. Unrecognized
//! keys are silently ignored so that newer daemon versions with additional
//! variables keep working.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Duration, TimeZone, Utc};
use macaddr::MacAddr6;
use thiserror::Error;

use crate::wire::DecodedInvocation;

/// Namespace prefix of all structured metadata variables.
pub const ENV_PREFIX: &str = "DNSMASQ_";

/// Lease lifecycle commands the DHCP daemon issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseCommand {
    /// `add`: a new lease was created.
    Add,
    /// `del`: a lease was destroyed.
    Delete,
    /// `old`: an existing lease was renewed or its hostname changed.
    RenamedOrRenewed,
}

impl LeaseCommand {
    /// The keyword used on the wire.
    #[must_use]
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Delete => "del",
            Self::RenamedOrRenewed => "old",
        }
    }
}

impl std::fmt::Display for LeaseCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.keyword())
    }
}

/// A single DHCP lease lifecycle event.
///
/// Constructed once per hook invocation, immutable, and consumed exactly
/// once by the lease store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseEvent {
    /// The lifecycle command.
    pub command: LeaseCommand,
    /// Client hardware address.
    pub mac: MacAddr6,
    /// Leased address; unique key of the lease store.
    pub ip: IpAddr,
    /// Hostname the daemon associates with the lease.
    pub hostname: Option<String>,
    /// Hostname the client claimed in its request, before sanitization.
    pub supplied_hostname: Option<String>,
    /// Hostname of the previous lease state, present on renames.
    pub old_hostname: Option<String>,
    /// DNS domain of the lease.
    pub domain: Option<String>,
    /// Absolute expiry time.
    pub expires_at: DateTime<Utc>,
    /// DHCP client identifier (option 61), raw bytes.
    pub client_id: Option<Vec<u8>>,
    /// Address of the DHCP relay the request came through.
    pub relay_ip: Option<IpAddr>,
    /// Agent circuit id (option 82.1), raw bytes.
    pub circuit_id: Option<Vec<u8>>,
    /// Subscriber id (option 82.6), raw bytes.
    pub subscriber_id: Option<Vec<u8>>,
    /// Agent remote id (option 82.2), raw bytes.
    pub remote_id: Option<Vec<u8>>,
    /// Vendor class identifier string.
    pub vendor_class: Option<String>,
    /// Option codes the client requested. Order is not significant but
    /// duplicates are preserved.
    pub requested_options: Vec<u16>,
    /// User classes, one per numbered `USER_CLASSn` variable.
    pub user_classes: Vec<String>,
    /// Tags the daemon attached to the request.
    pub tags: Vec<String>,
}

/// A parsed hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookRequest {
    /// `init`: the DHCP daemon asks for a dump of all known leases. Carries
    /// no mac/ip; it is a state query, not an event.
    Init,
    /// A lease lifecycle event.
    Event(LeaseEvent),
}

/// Errors interpreting a decoded invocation.
///
/// Each failure mode is distinct so the server can report it precisely; all
/// of them map to a nonzero status byte for the affected connection only.
#[derive(Debug, Error)]
pub enum EventParseError {
    /// The invocation had no command argument at all.
    #[error("missing command argument")]
    MissingCommand,

    /// The command keyword is not one of `add`, `del`, `old`, `init`.
    #[error("unknown command {command:?}")]
    UnknownCommand {
        /// The keyword that was received.
        command: String,
    },

    /// A required positional argument is absent.
    #[error("command {command:?} requires a {name} argument")]
    MissingArgument {
        /// The command being parsed.
        command: &'static str,
        /// The missing argument.
        name: &'static str,
    },

    /// The MAC address positional does not parse.
    #[error("invalid MAC address {value:?}")]
    InvalidMac {
        /// The offending value.
        value: String,
    },

    /// An IP address (positional or relay) does not parse.
    #[error("invalid IP address {value:?}")]
    InvalidIp {
        /// The offending value.
        value: String,
    },

    /// A numeric environment variable does not parse or is out of range.
    #[error("environment variable {name} contains an illegal value {value:?}")]
    InvalidValue {
        /// The variable name.
        name: String,
        /// The offending value.
        value: String,
    },

    /// A colon-/hex-encoded environment variable is not valid hex.
    #[error("environment variable {name} contains malformed hex {value:?}")]
    InvalidHex {
        /// The variable name.
        name: String,
        /// The offending value.
        value: String,
    },
}

/// Parse a decoded invocation into a typed request.
///
/// `received_at` anchors relative expiry times (`DNSMASQ_TIME_REMAINING`);
/// it is supplied by the caller rather than read ambiently so that event
/// interpretation is deterministic under test.
///
/// `argv[0]` is the hook client's program name; the command starts at
/// `argv[1]`.
///
/// # Errors
///
/// See [`EventParseError`] for the failure taxonomy.
pub fn parse_request(
    invocation: &DecodedInvocation,
    received_at: DateTime<Utc>,
) -> Result<HookRequest, EventParseError> {
    let command = invocation
        .argv
        .get(1)
        .ok_or(EventParseError::MissingCommand)?;
    let command = String::from_utf8_lossy(command);

    let command = match command.as_ref() {
        "init" => return Ok(HookRequest::Init),
        "add" => LeaseCommand::Add,
        "del" => LeaseCommand::Delete,
        "old" => LeaseCommand::RenamedOrRenewed,
        other => {
            return Err(EventParseError::UnknownCommand {
                command: other.to_owned(),
            });
        },
    };

    let mac = positional(invocation, 2, command.keyword(), "mac")?;
    let mac: MacAddr6 = mac.parse().map_err(|_| EventParseError::InvalidMac {
        value: mac,
    })?;
    let ip = positional(invocation, 3, command.keyword(), "ip")?;
    let ip: IpAddr = ip.parse().map_err(|_| EventParseError::InvalidIp {
        value: ip,
    })?;
    let hostname = invocation
        .argv
        .get(4)
        .map(|h| String::from_utf8_lossy(h).into_owned());

    let env = Environment::new(&invocation.env);

    let expires_at = match env.get_i64("LEASE_EXPIRES")? {
        Some(secs) => Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| EventParseError::InvalidValue {
                name: format!("{ENV_PREFIX}LEASE_EXPIRES"),
                value: secs.to_string(),
            })?,
        None => {
            let remaining = env.get_i64("TIME_REMAINING")?.unwrap_or(0);
            received_at + Duration::seconds(remaining)
        },
    };

    let relay_ip = match env.get_str("RELAY_ADDRESS") {
        Some(value) => Some(value.parse().map_err(|_| EventParseError::InvalidIp {
            value,
        })?),
        None => None,
    };

    Ok(HookRequest::Event(LeaseEvent {
        command,
        mac,
        ip,
        hostname,
        supplied_hostname: env.get_str("SUPPLIED_HOSTNAME"),
        old_hostname: env.get_str("OLD_HOSTNAME"),
        domain: env.get_str("DOMAIN"),
        expires_at,
        client_id: env.get_hex("CLIENT_ID")?,
        relay_ip,
        circuit_id: env.get_hex("CIRCUIT_ID")?,
        subscriber_id: env.get_hex("SUBSCRIBER_ID")?,
        remote_id: env.get_hex("REMOTE_ID")?,
        vendor_class: env.get_str("VENDOR_CLASS"),
        requested_options: env.get_u16_list("REQUESTED_OPTIONS", ',')?,
        user_classes: env.user_classes(),
        tags: env
            .get_str("TAGS")
            .map(|t| t.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default(),
    }))
}

fn positional(
    invocation: &DecodedInvocation,
    index: usize,
    command: &'static str,
    name: &'static str,
) -> Result<String, EventParseError> {
    invocation
        .argv
        .get(index)
        .map(|v| String::from_utf8_lossy(v).into_owned())
        .ok_or(EventParseError::MissingArgument { command, name })
}

/// Schema-driven view of the `DNSMASQ_*` environment.
struct Environment<'a> {
    vars: HashMap<&'a [u8], &'a [u8]>,
}

impl<'a> Environment<'a> {
    fn new(env: &'a [(Vec<u8>, Vec<u8>)]) -> Self {
        let vars = env
            .iter()
            .filter(|(key, _)| key.starts_with(ENV_PREFIX.as_bytes()))
            .map(|(key, value)| (&key[ENV_PREFIX.len()..], value.as_slice()))
            .collect();
        Self { vars }
    }

    fn raw(&self, name: &str) -> Option<&'a [u8]> {
        self.vars.get(name.as_bytes()).copied()
    }

    /// Text value with illegal bytes replaced, mirroring how the original
    /// environment made it through the surrounding OS layers.
    fn get_str(&self, name: &str) -> Option<String> {
        self.raw(name).map(|v| String::from_utf8_lossy(v).into_owned())
    }

    fn get_i64(&self, name: &str) -> Result<Option<i64>, EventParseError> {
        match self.get_str(name) {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| EventParseError::InvalidValue {
                    name: format!("{ENV_PREFIX}{name}"),
                    value,
                }),
        }
    }

    /// Decode a colon- or plain-hex-encoded binary identifier.
    fn get_hex(&self, name: &str) -> Result<Option<Vec<u8>>, EventParseError> {
        let Some(raw) = self.raw(name) else {
            return Ok(None);
        };
        let stripped: Vec<u8> = raw.iter().copied().filter(|&b| b != b':').collect();
        hex::decode(&stripped)
            .map(Some)
            .map_err(|_| EventParseError::InvalidHex {
                name: format!("{ENV_PREFIX}{name}"),
                value: String::from_utf8_lossy(raw).into_owned(),
            })
    }

    fn get_u16_list(&self, name: &str, sep: char) -> Result<Vec<u16>, EventParseError> {
        let Some(value) = self.get_str(name) else {
            return Ok(Vec::new());
        };
        value
            .split(sep)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse().map_err(|_| EventParseError::InvalidValue {
                    name: format!("{ENV_PREFIX}{name}"),
                    value: value.clone(),
                })
            })
            .collect()
    }

    /// Collect `USER_CLASS0`, `USER_CLASS1`, ... in order, stopping at the
    /// first gap.
    fn user_classes(&self) -> Vec<String> {
        let mut classes = Vec::new();
        for n in 0.. {
            match self.get_str(&format!("USER_CLASS{n}")) {
                Some(class) => classes.push(class),
                None => break,
            }
        }
        classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(argv: &[&str], env: &[(&str, &str)]) -> DecodedInvocation {
        DecodedInvocation {
            argv: argv.iter().map(|a| a.as_bytes().to_vec()).collect(),
            env: env
                .iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
                .collect(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_508_969_413, 0).single().unwrap()
    }

    fn expect_event(request: HookRequest) -> LeaseEvent {
        match request {
            HookRequest::Event(event) => event,
            HookRequest::Init => panic!("expected a lease event"),
        }
    }

    #[test]
    fn test_parse_add_with_full_metadata() {
        let inv = invocation(
            &[
                "nacd-dhcp-script",
                "add",
                "00:de:ad:be:ef:00",
                "141.76.121.2",
            ],
            &[
                ("DNSMASQ_CLIENT_ID", "01:50:7b:9d:87:76:4b"),
                ("DNSMASQ_INTERFACE", "eth2"),
                ("DNSMASQ_RELAY_ADDRESS", "141.76.121.1"),
                ("DNSMASQ_SUPPLIED_HOSTNAME", "My fancy Laptop"),
                ("DNSMASQ_TAGS", "Bor34 known eth2"),
                ("DNSMASQ_TIME_REMAINING", "86400"),
                ("DNSMASQ_VENDOR_CLASS", "MSFT 5.0"),
                ("DNSMASQ_REQUESTED_OPTIONS", "1,3,6,15"),
            ],
        );
        let event = expect_event(parse_request(&inv, now()).unwrap());

        assert_eq!(event.command, LeaseCommand::Add);
        assert_eq!(event.mac, "00:de:ad:be:ef:00".parse::<MacAddr6>().unwrap());
        assert_eq!(event.ip, "141.76.121.2".parse::<IpAddr>().unwrap());
        assert_eq!(event.hostname, None);
        assert_eq!(
            event.client_id.as_deref(),
            Some(&[0x01, 0x50, 0x7b, 0x9d, 0x87, 0x76, 0x4b][..])
        );
        assert_eq!(
            event.relay_ip,
            Some("141.76.121.1".parse::<IpAddr>().unwrap())
        );
        assert_eq!(event.supplied_hostname.as_deref(), Some("My fancy Laptop"));
        assert_eq!(event.vendor_class.as_deref(), Some("MSFT 5.0"));
        assert_eq!(event.tags, vec!["Bor34", "known", "eth2"]);
        assert_eq!(event.requested_options, vec![1, 3, 6, 15]);
        assert_eq!(event.expires_at, now() + Duration::seconds(86400));
    }

    #[test]
    fn test_absolute_expiry_takes_precedence() {
        let inv = invocation(
            &["prog", "add", "de:ad:be:ef:00:00", "192.168.1.13", "test"],
            &[
                ("DNSMASQ_LEASE_EXPIRES", "1508969413"),
                ("DNSMASQ_TIME_REMAINING", "60"),
            ],
        );
        let event = expect_event(parse_request(&inv, now() + Duration::hours(3)).unwrap());
        assert_eq!(event.expires_at, now());
        assert_eq!(event.hostname.as_deref(), Some("test"));
    }

    #[test]
    fn test_missing_timing_defaults_to_receipt_time() {
        let inv = invocation(&["prog", "del", "de:ad:be:ef:00:00", "192.168.1.13"], &[]);
        let event = expect_event(parse_request(&inv, now()).unwrap());
        assert_eq!(event.expires_at, now());
    }

    #[test]
    fn test_user_classes_collected_in_order_until_gap() {
        let inv = invocation(
            &["prog", "add", "de:ad:be:ef:00:00", "192.168.1.13"],
            &[
                ("DNSMASQ_USER_CLASS1", "second"),
                ("DNSMASQ_USER_CLASS0", "first"),
                ("DNSMASQ_USER_CLASS3", "unreachable"),
            ],
        );
        let event = expect_event(parse_request(&inv, now()).unwrap());
        assert_eq!(event.user_classes, vec!["first", "second"]);
    }

    #[test]
    fn test_init_carries_no_positionals() {
        let inv = invocation(&["prog", "init"], &[]);
        assert_eq!(parse_request(&inv, now()).unwrap(), HookRequest::Init);
    }

    #[test]
    fn test_unknown_command_is_a_typed_error() {
        let inv = invocation(&["prog", "tftp", "x"], &[]);
        let err = parse_request(&inv, now()).unwrap_err();
        match err {
            EventParseError::UnknownCommand { command } => assert_eq!(command, "tftp"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_positional_argument() {
        let inv = invocation(&["prog", "add", "de:ad:be:ef:00:00"], &[]);
        let err = parse_request(&inv, now()).unwrap_err();
        match err {
            EventParseError::MissingArgument { command, name } => {
                assert_eq!(command, "add");
                assert_eq!(name, "ip");
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_malformed_hex_is_an_error_not_a_crash() {
        let inv = invocation(
            &["prog", "add", "de:ad:be:ef:00:00", "192.168.1.13"],
            &[("DNSMASQ_CLIENT_ID", "zz:zz")],
        );
        let err = parse_request(&inv, now()).unwrap_err();
        assert!(matches!(err, EventParseError::InvalidHex { .. }));
    }

    #[test]
    fn test_bad_mac_and_ip() {
        let inv = invocation(&["prog", "add", "not-a-mac", "192.168.1.13"], &[]);
        assert!(matches!(
            parse_request(&inv, now()).unwrap_err(),
            EventParseError::InvalidMac { .. }
        ));

        let inv = invocation(&["prog", "add", "de:ad:be:ef:00:00", "not-an-ip"], &[]);
        assert!(matches!(
            parse_request(&inv, now()).unwrap_err(),
            EventParseError::InvalidIp { .. }
        ));
    }

    #[test]
    fn test_unrecognized_keys_are_ignored() {
        let inv = invocation(
            &["prog", "old", "de:ad:be:ef:00:00", "192.168.1.13"],
            &[
                ("DNSMASQ_FUTURE_EXTENSION", "whatever"),
                ("PATH", "/usr/bin"),
                ("DNSMASQ_DOMAIN", "example.net"),
            ],
        );
        let event = expect_event(parse_request(&inv, now()).unwrap());
        assert_eq!(event.command, LeaseCommand::RenamedOrRenewed);
        assert_eq!(event.domain.as_deref(), Some("example.net"));
    }

    #[test]
    fn test_ipv6_lease_address() {
        let inv = invocation(&["prog", "add", "de:ad:be:ef:00:00", "fd00::13"], &[]);
        let event = expect_event(parse_request(&inv, now()).unwrap());
        assert_eq!(event.ip, "fd00::13".parse::<IpAddr>().unwrap());
    }
}
