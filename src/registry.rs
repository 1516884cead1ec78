use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Authenticated end user of the gateway.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Principal {
    pub user_id: i64,
    pub username: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ssh,
    Rdp,
    Vnc,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ssh => "ssh",
            Protocol::Rdp => "rdp",
            Protocol::Vnc => "vnc",
        }
    }

    pub fn parse(raw: &str) -> Option<Protocol> {
        match raw {
            "ssh" => Some(Protocol::Ssh),
            "rdp" => Some(Protocol::Rdp),
            "vnc" => Some(Protocol::Vnc),
            _ => None,
        }
    }
}

/// Target machine reachable through the gateway.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Asset {
    pub asset_id: i64,
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    pub protocol: Protocol,
    pub os: String,
}

/// Login credentials on an asset.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Account {
    pub account_id: i64,
    pub username: String,
    pub password: String,
    pub is_active: bool,
}

/// Lookup collaborators consumed by the session engines. Sessions receive an
/// implementation at construction time; nothing in the engines knows where
/// the data lives.
pub trait Directory: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<Principal>;
    fn lookup_asset_account(
        &self,
        asset_id: i64,
        account_id: i64,
    ) -> Result<(Asset, Account), GatewayError>;
    /// 连接时整体取一次黑名单快照，会话期间不再刷新
    fn blocklist_snapshot(&self) -> HashSet<String>;
}

/// SQLite-backed directory. The schema is created on open so a fresh
/// deployment starts from an empty database.
pub struct SqliteDirectory {
    conn: Mutex<Connection>,
}

impl SqliteDirectory {
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        use anyhow::Context as _;
        let conn = Connection::open(path).with_context(|| "Failed to open directory database")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        use anyhow::Context as _;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                token TEXT UNIQUE NOT NULL
            );
            CREATE TABLE IF NOT EXISTS assets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hostname TEXT NOT NULL,
                ip TEXT NOT NULL,
                port INTEGER NOT NULL,
                protocol TEXT NOT NULL,
                os TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                asset_id INTEGER NOT NULL REFERENCES assets(id),
                username TEXT NOT NULL,
                password TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS black_commands (
                key TEXT PRIMARY KEY
            );",
        )
        .with_context(|| "Failed to create directory tables")?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

impl Directory for SqliteDirectory {
    fn authenticate(&self, token: &str) -> Option<Principal> {
        let conn = self.conn.lock().ok()?;
        conn.query_row(
            "SELECT id, username FROM users WHERE token = ?1",
            params![token],
            |row| Ok(Principal { user_id: row.get(0)?, username: row.get(1)? }),
        )
        .ok()
    }

    fn lookup_asset_account(
        &self,
        asset_id: i64,
        account_id: i64,
    ) -> Result<(Asset, Account), GatewayError> {
        let conn = self.conn.lock().map_err(|_| GatewayError::AssetNotFound(asset_id))?;
        let asset = conn
            .query_row(
                "SELECT id, hostname, ip, port, protocol, os FROM assets WHERE id = ?1",
                params![asset_id],
                |row| {
                    let protocol: String = row.get(4)?;
                    Ok(Asset {
                        asset_id: row.get(0)?,
                        hostname: row.get(1)?,
                        ip: row.get(2)?,
                        port: row.get::<_, i64>(3)? as u16,
                        protocol: Protocol::parse(&protocol).unwrap_or(Protocol::Ssh),
                        os: row.get(5)?,
                    })
                },
            )
            .map_err(|_| GatewayError::AssetNotFound(asset_id))?;

        let account = conn
            .query_row(
                "SELECT id, username, password, is_active FROM accounts
                 WHERE id = ?1 AND asset_id = ?2",
                params![account_id, asset_id],
                |row| {
                    Ok(Account {
                        account_id: row.get(0)?,
                        username: row.get(1)?,
                        password: row.get(2)?,
                        is_active: row.get::<_, i64>(3)? != 0,
                    })
                },
            )
            .map_err(|_| GatewayError::AssetNotFound(account_id))?;

        if !account.is_active {
            return Err(GatewayError::AccountInactive(account_id));
        }
        Ok((asset, account))
    }

    fn blocklist_snapshot(&self) -> HashSet<String> {
        let Ok(conn) = self.conn.lock() else {
            return HashSet::new();
        };
        let mut out = HashSet::new();
        let Ok(mut stmt) = conn.prepare("SELECT key FROM black_commands") else {
            return out;
        };
        if let Ok(rows) = stmt.query_map([], |row| row.get::<_, String>(0)) {
            for key in rows.flatten() {
                out.insert(key);
            }
        }
        out
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Seed helper shared by unit and integration tests.
    pub fn seeded_directory() -> SqliteDirectory {
        let dir = SqliteDirectory::open_in_memory().expect("open in-memory directory");
        {
            let conn = dir.conn.lock().unwrap();
            conn.execute_batch(
                "INSERT INTO users (id, username, token) VALUES (1, 'ops', 'tok-ops');
                 INSERT INTO assets (id, hostname, ip, port, protocol, os)
                     VALUES (3, 'db-master', '10.1.2.3', 22, 'ssh', 'linux');
                 INSERT INTO assets (id, hostname, ip, port, protocol, os)
                     VALUES (4, 'win-jump', '10.1.2.4', 3389, 'rdp', 'windows');
                 INSERT INTO accounts (id, asset_id, username, password, is_active)
                     VALUES (5, 3, 'root', 'pw', 1);
                 INSERT INTO accounts (id, asset_id, username, password, is_active)
                     VALUES (6, 3, 'nobody', 'pw', 0);
                 INSERT INTO accounts (id, asset_id, username, password, is_active)
                     VALUES (7, 4, 'administrator', 'pw', 1);
                 INSERT INTO black_commands (key) VALUES ('rm');
                 INSERT INTO black_commands (key) VALUES ('reboot');",
            )
            .expect("seed");
        }
        dir
    }
}

#[cfg(test)]
mod tests {
    use super::testing::seeded_directory;
    use super::*;

    #[test]
    fn authenticate_by_token() {
        let dir = seeded_directory();
        let principal = dir.authenticate("tok-ops").expect("principal");
        assert_eq!(principal.user_id, 1);
        assert_eq!(principal.username, "ops");
        assert!(dir.authenticate("bogus").is_none());
    }

    #[test]
    fn lookup_returns_asset_and_account() {
        let dir = seeded_directory();
        let (asset, account) = dir.lookup_asset_account(3, 5).expect("lookup");
        assert_eq!(asset.hostname, "db-master");
        assert_eq!(asset.protocol, Protocol::Ssh);
        assert_eq!(account.username, "root");
        assert!(account.is_active);
    }

    #[test]
    fn lookup_rejects_missing_and_inactive() {
        let dir = seeded_directory();
        assert!(matches!(
            dir.lookup_asset_account(99, 5),
            Err(GatewayError::AssetNotFound(99))
        ));
        // account belongs to a different asset
        assert!(matches!(dir.lookup_asset_account(4, 5), Err(GatewayError::AssetNotFound(5))));
        assert!(matches!(
            dir.lookup_asset_account(3, 6),
            Err(GatewayError::AccountInactive(6))
        ));
    }

    #[test]
    fn blocklist_snapshot_is_a_set() {
        let dir = seeded_directory();
        let set = dir.blocklist_snapshot();
        assert!(set.contains("rm"));
        assert!(set.contains("reboot"));
        assert_eq!(set.len(), 2);
    }
}
