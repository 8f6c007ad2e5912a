//! Replication role reported by `ROLE`.

use crate::config::HostAddr;
use crate::Reply;

use std::fmt;

/// The role a server plays in the replication topology.
#[derive(Debug, Clone, PartialEq)]
pub enum Role {
    Master,
    Replica { master: HostAddr, link: LinkState },
    /// Anything else, e.g. `sentinel`, or a reply that could not be understood.
    Unknown(String),
}

/// State of a replica's link to its master.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    Connect,
    Connecting,
    Sync,
    Connected,
    Other(String),
}

impl LinkState {
    fn parse(src: &str) -> LinkState {
        match src {
            "connect" => LinkState::Connect,
            "connecting" => LinkState::Connecting,
            "sync" => LinkState::Sync,
            "connected" => LinkState::Connected,
            other => LinkState::Other(other.to_string()),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

impl Role {
    /// Interprets a `ROLE` reply.
    ///
    /// ```text
    /// master:  ["master", <offset>, [[ip, port, offset], ...]]
    /// replica: ["slave", <master ip>, <master port>, <link state>, <offset>]
    /// ```
    pub fn from_reply(reply: Reply) -> Role {
        let parts = match reply {
            Reply::Array(parts) => parts,
            other => return Role::Unknown(format!("{:?}", other)),
        };

        let mut parts = parts.into_iter().map(text);

        match parts.next().flatten().as_deref() {
            Some("master") => Role::Master,
            Some(name @ ("slave" | "replica")) => {
                let host = parts.next().flatten();
                let port = parts.next().flatten().and_then(|p| p.parse::<u16>().ok());
                let link = parts.next().flatten();

                match (host, port, link) {
                    (Some(host), Some(port), Some(link)) => Role::Replica {
                        master: HostAddr::new(host, port),
                        link: LinkState::parse(&link),
                    },
                    _ => Role::Unknown(format!("malformed {} role", name)),
                }
            }
            Some(other) => Role::Unknown(other.to_string()),
            None => Role::Unknown("empty role reply".to_string()),
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self, Role::Master)
    }
}

/// Renders scalar reply parts as text.
fn text(reply: Reply) -> Option<String> {
    match reply {
        Reply::Bulk(data) => String::from_utf8(data.to_vec()).ok(),
        Reply::Status(status) => Some(status),
        Reply::Integer(int) => Some(int.to_string()),
        _ => None,
    }
}

impl fmt::Display for Role {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => "master".fmt(fmt),
            Role::Replica { master, .. } => write!(fmt, "replica of {}", master),
            Role::Unknown(role) => write!(fmt, "unknown ({})", role),
        }
    }
}
