//! The durable embedded store: one SQLite file per node, opened in WAL
//! journaling mode so a crash mid-write cannot corrupt it, with a bounded
//! busy-wait standing in for "serialize concurrent writers" instead of any
//! in-process lock — correctness comes from the database itself, the same
//! way two independent processes on one host would never coordinate
//! through a shared mutex.

use std::net::IpAddr;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

use crate::cni::schema::Protocol;
use crate::error::Error;

/// How long a writer will wait on `SQLITE_BUSY` before giving up and
/// surfacing [`Error::StoreBusy`].
const BUSY_TIMEOUT_MS: u32 = 1_000;

/// One active pod sandbox. Never mutated after creation; removed by `DEL`
/// or by `ADD` rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodBinding {
    pub container_id: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub netns_path: String,
    pub host_ifname: String,
    pub ipv4: Option<IpAddr>,
    pub ipv6: Option<IpAddr>,
    pub gw_v4: Option<IpAddr>,
    pub gw_v6: Option<IpAddr>,
    pub mtu: u32,
    pub created_at: i64,
}

/// One `hostPort -> containerPort` row, cascade-deleted with its pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub id: i64,
    pub container_id: String,
    pub host_ip: IpAddr,
    pub host_port: u16,
    pub protocol: Protocol,
    pub container_ip: IpAddr,
    pub container_port: u16,
}

/// A new port mapping row to be inserted, prior to the store assigning it
/// an id.
#[derive(Debug, Clone)]
pub struct NewPortMapping {
    pub container_id: String,
    pub host_ip: IpAddr,
    pub host_port: u16,
    pub protocol: Protocol,
    pub container_ip: IpAddr,
    pub container_port: u16,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if absent) the database file at `path`, apply WAL
    /// journaling and foreign-key enforcement, and ensure the schema
    /// exists.
    pub fn open(path: &Path) -> Result<Store, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| Error::Io {
                context: format!("could not create store directory {}", parent.display()),
                error,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS as u64))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Store { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Open an in-memory store. Used by tests that want store semantics
    /// without a filesystem fixture.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Store, Error> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Store { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<(), Error> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS pod_binding (
                container_id TEXT PRIMARY KEY,
                name         TEXT NOT NULL,
                namespace    TEXT NOT NULL,
                uid          TEXT NOT NULL,
                netns_path   TEXT NOT NULL,
                host_ifname  TEXT NOT NULL,
                ipv4         TEXT UNIQUE,
                ipv6         TEXT UNIQUE,
                gw_v4        TEXT,
                gw_v6        TEXT,
                mtu          INTEGER NOT NULL,
                created_at   INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS port_mapping (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                container_id   TEXT NOT NULL REFERENCES pod_binding(container_id) ON DELETE CASCADE,
                host_ip        TEXT NOT NULL,
                host_port      INTEGER NOT NULL,
                protocol       TEXT NOT NULL,
                container_ip   TEXT NOT NULL,
                container_port INTEGER NOT NULL,
                UNIQUE(host_ip, host_port, protocol)
            );

            CREATE TABLE IF NOT EXISTS ip_reservation (
                ip           TEXT PRIMARY KEY,
                container_id TEXT NOT NULL,
                created_at   INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Insert a new pod binding. The store's unique constraints on `ipv4`
    /// and `ipv6` are the sole serialization point for allocator
    /// correctness: this call either wins outright or fails with
    /// [`Error::StoreConstraint`], never silently overwrites. On success,
    /// drops whatever `ip_reservation` rows fed this binding's addresses —
    /// the pod binding's own per-family `UNIQUE` constraint is now the
    /// durable record, so the transient reservation has nothing left to do.
    pub fn insert_pod(&self, binding: &PodBinding) -> Result<(), Error> {
        let result = self.conn.execute(
            "INSERT INTO pod_binding
                (container_id, name, namespace, uid, netns_path, host_ifname,
                 ipv4, ipv6, gw_v4, gw_v6, mtu, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                binding.container_id,
                binding.name,
                binding.namespace,
                binding.uid,
                binding.netns_path,
                binding.host_ifname,
                binding.ipv4.map(|a| a.to_string()),
                binding.ipv6.map(|a| a.to_string()),
                binding.gw_v4.map(|a| a.to_string()),
                binding.gw_v6.map(|a| a.to_string()),
                binding.mtu,
                binding.created_at,
            ],
        );
        map_write_result(result)?;

        for addr in binding.ipv4.into_iter().chain(binding.ipv6) {
            self.conn.execute(
                "DELETE FROM ip_reservation WHERE ip = ?1",
                params![addr.to_string()],
            )?;
        }
        Ok(())
    }

    /// Delete a pod binding (and, via `ON DELETE CASCADE`, its port
    /// mappings). Deleting an absent row is a no-op, not an error —
    /// `DEL` must be idempotent.
    pub fn delete_pod(&self, container_id: &str) -> Result<(), Error> {
        self.conn.execute(
            "DELETE FROM pod_binding WHERE container_id = ?1",
            params![container_id],
        )?;
        Ok(())
    }

    pub fn insert_portmap(&self, row: &NewPortMapping) -> Result<(), Error> {
        let result = self.conn.execute(
            "INSERT INTO port_mapping
                (container_id, host_ip, host_port, protocol, container_ip, container_port)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.container_id,
                row.host_ip.to_string(),
                row.host_port,
                row.protocol.to_string(),
                row.container_ip.to_string(),
                row.container_port,
            ],
        );
        map_write_result(result)
    }

    pub fn list_portmaps(&self) -> Result<Vec<PortMapping>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT id, container_id, host_ip, host_port, protocol, container_ip, container_port
             FROM port_mapping",
        )?;
        let rows = stmt
            .query_map([], row_to_portmapping)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_portmaps_for(&self, container_id: &str) -> Result<Vec<PortMapping>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT id, container_id, host_ip, host_port, protocol, container_ip, container_port
             FROM port_mapping WHERE container_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![container_id], row_to_portmapping)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Is `ip` currently unused by any active pod binding, and not
    /// currently claimed by an in-flight allocation's reservation row?
    pub fn is_ip_free(&self, ip: IpAddr) -> Result<bool, Error> {
        let ip_str = ip.to_string();
        let taken: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM pod_binding WHERE ipv4 = ?1 OR ipv6 = ?1
                 UNION ALL
                 SELECT 1 FROM ip_reservation WHERE ip = ?1
                 LIMIT 1",
                params![ip_str],
                |row| row.get(0),
            )
            .optional()?;
        Ok(taken.is_none())
    }

    pub fn count_pods(&self) -> Result<u64, Error> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pod_binding", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Claim a single address for `container_id` ahead of a full
    /// [`PodBinding`] existing. This is the allocator's probing commit
    /// point: it writes to a dedicated `ip_reservation` table keyed on the
    /// address itself, not on `container_id`, so allocating two families
    /// (one IPv4, one IPv6) for the same container never collides with
    /// itself the way two inserts into `pod_binding`'s `container_id`
    /// primary key would. The orchestrator combines both families into one
    /// [`PodBinding`] and calls [`Store::insert_pod`] once that reservation
    /// has served its purpose.
    pub fn reserve_address(&self, container_id: &str, addr: IpAddr) -> Result<(), Error> {
        let result = self.conn.execute(
            "INSERT INTO ip_reservation (ip, container_id, created_at) VALUES (?1, ?2, ?3)",
            params![addr.to_string(), container_id, now()],
        );
        map_write_result(result)
    }

    /// Remove any reservation or pod binding row carrying `addr`. No-op if
    /// none exists — covers both releasing a bare reservation (an `ADD`
    /// that failed before the final row was written) and releasing an
    /// address straight out of an active binding.
    pub fn release_ip(&self, addr: IpAddr) -> Result<(), Error> {
        let ip_str = addr.to_string();
        self.conn.execute(
            "DELETE FROM ip_reservation WHERE ip = ?1",
            params![ip_str],
        )?;
        self.conn.execute(
            "DELETE FROM pod_binding WHERE ipv4 = ?1 OR ipv6 = ?1",
            params![ip_str],
        )?;
        Ok(())
    }
}

/// Seconds since the Unix epoch, for `PodBinding::created_at`.
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn row_to_portmapping(row: &rusqlite::Row) -> rusqlite::Result<PortMapping> {
    let host_ip: String = row.get(2)?;
    let protocol: String = row.get(4)?;
    let container_ip: String = row.get(5)?;
    Ok(PortMapping {
        id: row.get(0)?,
        container_id: row.get(1)?,
        host_ip: host_ip.parse().unwrap_or_else(|_| "0.0.0.0".parse().unwrap()),
        host_port: row.get::<_, i64>(3)? as u16,
        protocol: match protocol.as_str() {
            "udp" => Protocol::Udp,
            "sctp" => Protocol::Sctp,
            _ => Protocol::Tcp,
        },
        container_ip: container_ip
            .parse()
            .unwrap_or_else(|_| "0.0.0.0".parse().unwrap()),
        container_port: row.get::<_, i64>(6)? as u16,
    })
}

/// Translate a SQLite constraint violation into [`Error::StoreConstraint`]
/// and an `SQLITE_BUSY` after the busy-wait into [`Error::StoreBusy`];
/// anything else flattens into [`Error::StoreIo`].
fn map_write_result(result: rusqlite::Result<usize>) -> Result<(), Error> {
    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(ref e, ref msg))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(Error::StoreConstraint(
                msg.clone().unwrap_or_else(|| "unique constraint".into()),
            ))
        }
        Err(rusqlite::Error::SqliteFailure(ref e, _))
            if e.code == rusqlite::ErrorCode::DatabaseBusy =>
        {
            Err(Error::StoreBusy)
        }
        Err(other) => Err(Error::StoreIo(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_binding(id: &str, ipv4: &str) -> PodBinding {
        PodBinding {
            container_id: id.into(),
            name: "nginx".into(),
            namespace: "default".into(),
            uid: "uid-1".into(),
            netns_path: "/var/run/netns/test".into(),
            host_ifname: "veth0".into(),
            ipv4: Some(ipv4.parse().unwrap()),
            ipv6: None,
            gw_v4: Some("10.0.0.1".parse().unwrap()),
            gw_v6: None,
            mtu: 1500,
            created_at: now(),
        }
    }

    #[test]
    fn insert_and_count() {
        let store = Store::open_in_memory().unwrap();
        store.insert_pod(&sample_binding("c1", "10.0.0.2")).unwrap();
        assert_eq!(store.count_pods().unwrap(), 1);
        assert!(!store.is_ip_free("10.0.0.2".parse().unwrap()).unwrap());
        assert!(store.is_ip_free("10.0.0.3".parse().unwrap()).unwrap());
    }

    #[test]
    fn duplicate_ipv4_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        store.insert_pod(&sample_binding("c1", "10.0.0.2")).unwrap();
        let err = store.insert_pod(&sample_binding("c2", "10.0.0.2")).unwrap_err();
        assert!(matches!(err, Error::StoreConstraint(_)));
    }

    #[test]
    fn delete_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.insert_pod(&sample_binding("c1", "10.0.0.2")).unwrap();
        store.delete_pod("c1").unwrap();
        store.delete_pod("c1").unwrap();
        assert_eq!(store.count_pods().unwrap(), 0);
    }

    #[test]
    fn delete_cascades_to_portmaps() {
        let store = Store::open_in_memory().unwrap();
        store.insert_pod(&sample_binding("c1", "10.0.0.2")).unwrap();
        store
            .insert_portmap(&NewPortMapping {
                container_id: "c1".into(),
                host_ip: "0.0.0.0".parse().unwrap(),
                host_port: 8080,
                protocol: Protocol::Tcp,
                container_ip: "10.0.0.2".parse().unwrap(),
                container_port: 80,
            })
            .unwrap();
        assert_eq!(store.list_portmaps().unwrap().len(), 1);
        store.delete_pod("c1").unwrap();
        assert!(store.list_portmaps().unwrap().is_empty());
    }

    #[test]
    fn reserving_both_families_then_inserting_one_binding_does_not_collide() {
        let store = Store::open_in_memory().unwrap();
        let container_id = "c1";
        let v4: IpAddr = "10.0.0.2".parse().unwrap();
        let v6: IpAddr = "fd00::2".parse().unwrap();

        // Mirrors what the allocator does per family while probing: each
        // reservation lands in `ip_reservation`, keyed on the address, so
        // claiming two families for the same container never collides on
        // `container_id` the way two `pod_binding` inserts would.
        store.reserve_address(container_id, v4).unwrap();
        store.reserve_address(container_id, v6).unwrap();
        assert!(!store.is_ip_free(v4).unwrap());
        assert!(!store.is_ip_free(v6).unwrap());

        let mut binding = sample_binding(container_id, "10.0.0.2");
        binding.ipv6 = Some(v6);
        store.insert_pod(&binding).unwrap();

        assert_eq!(store.count_pods().unwrap(), 1);
        // The reservation rows are retired once the real binding exists.
        store.delete_pod(container_id).unwrap();
        assert!(store.is_ip_free(v4).unwrap());
        assert!(store.is_ip_free(v6).unwrap());
    }

    #[test]
    fn releasing_a_bare_reservation_frees_the_address() {
        let store = Store::open_in_memory().unwrap();
        let addr: IpAddr = "10.0.0.9".parse().unwrap();
        store.reserve_address("c1", addr).unwrap();
        assert!(!store.is_ip_free(addr).unwrap());
        store.release_ip(addr).unwrap();
        assert!(store.is_ip_free(addr).unwrap());
    }

    #[test]
    fn duplicate_hostport_binding_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        store.insert_pod(&sample_binding("c1", "10.0.0.2")).unwrap();
        store.insert_pod(&sample_binding("c2", "10.0.0.3")).unwrap();
        store
            .insert_portmap(&NewPortMapping {
                container_id: "c1".into(),
                host_ip: "0.0.0.0".parse().unwrap(),
                host_port: 8080,
                protocol: Protocol::Tcp,
                container_ip: "10.0.0.2".parse().unwrap(),
                container_port: 80,
            })
            .unwrap();
        let err = store
            .insert_portmap(&NewPortMapping {
                container_id: "c2".into(),
                host_ip: "0.0.0.0".parse().unwrap(),
                host_port: 8080,
                protocol: Protocol::Tcp,
                container_ip: "10.0.0.3".parse().unwrap(),
                container_port: 80,
            })
            .unwrap_err();
        assert!(matches!(err, Error::StoreConstraint(_)));
    }
}
