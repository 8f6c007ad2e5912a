//! Host pool walk and master/replica resolution.

use crate::cmd::Command;
use crate::config::HostAddr;
use crate::connection::{Connection, Dialer};
use crate::role::Role;
use crate::{Error, Reply};

use rand::seq::SliceRandom;
use tokio::time;
use tracing::{debug, info, instrument, warn};

/// Number of passes over the host pool before giving up.
const POOL_ROUNDS: u32 = 2;

/// Outcome of trying one candidate host.
enum Attempt {
    Bound(Connection),
    /// The candidate is unusable; move on to the next one.
    Skip(Error),
}

/// Opens a connection bound to a server of the right role.
///
/// The host pool is shuffled and walked in order. When `master_only` is set and a candidate
/// turns out to be a replica, the replica's master is followed instead. The pool is retried
/// once after `pool_retry_delay`. `AUTH` and `SELECT` rejections end the walk immediately.
#[instrument(skip(dialer))]
pub(crate) async fn establish(
    dialer: &Dialer,
    database: u32,
    master_only: bool,
) -> crate::Result<Connection> {
    let config = dialer.config();
    let mut last_err = None;

    for round in 0..POOL_ROUNDS {
        if round > 0 {
            debug!(delay = ?config.pool_retry_delay, "retrying host pool");
            time::sleep(config.pool_retry_delay).await;
        }

        let mut candidates = config.hosts.clone();
        candidates.shuffle(&mut rand::thread_rng());

        for addr in &candidates {
            match bind(dialer, addr, master_only).await? {
                Attempt::Bound(mut conn) => {
                    select(&mut conn, database).await?;

                    info!(addr = %conn.addr(), role = %conn.role(), "connected");
                    return Ok(conn);
                }
                Attempt::Skip(err) => {
                    warn!(%addr, cause = %err, "candidate rejected");
                    last_err = Some(err);
                }
            }
        }
    }

    let cause = match last_err {
        Some(err) => err.to_string(),
        None => "host pool is empty".to_string(),
    };

    Err(Error::Connect(format!("no usable host: {}", cause)))
}

/// Tries a single candidate. Only authentication failures are returned as `Err`.
async fn bind(dialer: &Dialer, addr: &HostAddr, master_only: bool) -> crate::Result<Attempt> {
    let mut conn = match open(dialer, addr).await? {
        Some(conn) => conn,
        None => return Ok(Attempt::Skip(Error::Connect(format!("{} unreachable", addr)))),
    };

    let role = match query_role(&mut conn).await {
        Ok(role) => role,
        Err(err) => return Ok(Attempt::Skip(err)),
    };

    match role {
        Role::Master => Ok(Attempt::Bound(conn)),
        Role::Replica { .. } if !master_only => Ok(Attempt::Bound(conn)),
        Role::Replica { .. } => follow_master(dialer, conn, role).await,
        Role::Unknown(role) => Ok(Attempt::Skip(Error::Connect(format!(
            "{} reports unsupported role {}",
            addr, role
        )))),
    }
}

/// Waits for `replica` to report a connected master link, then binds to that master.
async fn follow_master(
    dialer: &Dialer,
    mut replica: Connection,
    mut role: Role,
) -> crate::Result<Attempt> {
    let config = dialer.config();

    for poll in 1..=config.role_poll_attempts {
        if poll > 1 {
            time::sleep(config.role_poll_interval).await;

            role = match query_role(&mut replica).await {
                Ok(role) => role,
                Err(err) => return Ok(Attempt::Skip(err)),
            };
        }

        let master = match &role {
            // Promoted while we were waiting.
            Role::Master => return Ok(Attempt::Bound(replica)),
            Role::Replica { master, link } if link.is_connected() => master.clone(),
            Role::Replica { link, .. } => {
                debug!(replica = %replica.addr(), poll, ?link, "master link not ready");
                continue;
            }
            Role::Unknown(other) => {
                let err = Error::Connect(format!("{} changed to role {}", replica.addr(), other));
                return Ok(Attempt::Skip(err));
            }
        };

        debug!(replica = %replica.addr(), %master, "following master");
        drop(replica);

        let mut conn = match open(dialer, &master).await? {
            Some(conn) => conn,
            None => {
                let err = Error::Connect(format!("master {} unreachable", master));
                return Ok(Attempt::Skip(err));
            }
        };

        return match query_role(&mut conn).await {
            Ok(Role::Master) => Ok(Attempt::Bound(conn)),
            Ok(other) => Ok(Attempt::Skip(Error::Connect(format!(
                "{} reports role {}, expected master",
                master, other
            )))),
            Err(err) => Ok(Attempt::Skip(err)),
        };
    }

    Ok(Attempt::Skip(Error::Connect(format!(
        "master link of {} not connected after {} polls",
        replica.addr(),
        config.role_poll_attempts
    ))))
}

/// Opens a socket and authenticates.
///
/// `Ok(None)` means the host could not be reached. A rejected `AUTH` is fatal.
async fn open(dialer: &Dialer, addr: &HostAddr) -> crate::Result<Option<Connection>> {
    let mut conn = match Connection::open(addr, dialer).await {
        Ok(conn) => conn,
        Err(err) => {
            debug!(%addr, cause = %err, "connect failed");
            return Ok(None);
        }
    };

    if let Some(password) = &dialer.config().password {
        let cmd = Command::new("AUTH").arg(password.as_str());

        match conn.request(&cmd).await.and_then(Reply::from_frame) {
            Ok(reply) if reply.is_ok() => {}
            Ok(reply) => return Err(Error::Connect(format!("AUTH rejected: {:?}", reply))),
            Err(err) if err.is_transport() => {
                debug!(%addr, cause = %err, "auth failed");
                return Ok(None);
            }
            Err(err) => return Err(Error::Connect(format!("AUTH rejected: {}", err))),
        }
    }

    Ok(Some(conn))
}

async fn query_role(conn: &mut Connection) -> crate::Result<Role> {
    let reply = Reply::from_frame(conn.request(&Command::new("ROLE")).await?)?;
    let role = Role::from_reply(reply);

    conn.set_role(role.clone());
    Ok(role)
}

async fn select(conn: &mut Connection, database: u32) -> crate::Result<()> {
    let cmd = Command::new("SELECT").arg(database);

    match conn.request(&cmd).await.and_then(Reply::from_frame) {
        Ok(reply) if reply.is_ok() => Ok(()),
        Ok(reply) => Err(Error::Connect(format!("SELECT {} rejected: {:?}", database, reply))),
        Err(err) => Err(Error::Connect(format!("SELECT {} failed: {}", database, err))),
    }
}
