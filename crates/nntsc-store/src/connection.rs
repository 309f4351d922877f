//! Connection handling. Each consumer task owns exactly one
//! [`DbConnection`]; connections are never shared across tasks.

use std::time::Duration;

use tokio_postgres::{Client, NoTls};
use tracing::{info, warn};

use nntsc_core::{DatabaseConfig, StoreError};

/// A single postgres connection with its driver task.
pub struct DbConnection {
    client: Client,
}

impl DbConnection {
    /// Connect once.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let (client, connection) = tokio_postgres::connect(&config.connstr(), NoTls).await?;

        // The connection object performs the actual socket I/O and must
        // be driven for the client handle to make progress.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "database connection terminated");
            }
        });

        Ok(DbConnection { client })
    }

    /// Connect, retrying forever with a fixed delay. Used at daemon
    /// startup and by the reconnect paths, where giving up is not an
    /// option short of shutdown.
    pub async fn connect_retrying(config: &DatabaseConfig, retrywait: Duration) -> Self {
        loop {
            match Self::connect(config).await {
                Ok(conn) => return conn,
                Err(e) => {
                    warn!(error = %e, wait = ?retrywait, "database connection failed, retrying");
                    tokio::time::sleep(retrywait).await;
                }
            }
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut Client {
        &mut self.client
    }

    /// True once the backing socket has gone away; the owner should
    /// reconnect.
    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

/// Log a reconnect attempt consistently across the gateway.
pub(crate) fn note_reconnect(context: &str) {
    info!(context, "reconnecting to database");
}
