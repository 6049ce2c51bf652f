//! PostgreSQL backup sessions over `sqlx`.
//!
//! Each session is a single dedicated connection authenticated with the
//! cluster's replication client certificate. The backup is non-exclusive,
//! so it is tied to this connection and ends if the connection drops.

use std::time::Duration;

use sqlx::Connection;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};

use super::{BackupError, BackupFuture, BackupSession, BackupStopOutput, DatabaseConnector};
use crate::label::SnapshotLabel;
use crate::model::SourceIdentity;
use crate::retry::Backoff;

/// First server version offering `pg_backup_start`/`pg_backup_stop`.
pub const BACKUP_FUNCTIONS_RENAMED_IN: i32 = 150_000;

const APPLICATION_NAME: &str = "pg-reflinker";

/// Server functions used to bracket a backup on a given major version.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BackupDialect {
    start_sql: &'static str,
    stop_sql: &'static str,
}

impl BackupDialect {
    /// Selects the functions matching `server_version_num`.
    #[must_use]
    pub const fn for_version(server_version_num: i32) -> Self {
        if server_version_num >= BACKUP_FUNCTIONS_RENAMED_IN {
            Self {
                start_sql: "SELECT pg_backup_start($1, $2)::text",
                stop_sql: "SELECT labelfile, spcmapfile FROM pg_backup_stop($1)",
            }
        } else {
            Self {
                start_sql: "SELECT pg_start_backup($1, $2, false)::text",
                stop_sql: "SELECT labelfile, spcmapfile FROM pg_stop_backup(false, $1)",
            }
        }
    }

    /// Query entering backup mode; binds the label and the fast flag.
    #[must_use]
    pub const fn start_sql(self) -> &'static str {
        self.start_sql
    }

    /// Query leaving backup mode; binds the wait-for-archive flag.
    #[must_use]
    pub const fn stop_sql(self) -> &'static str {
        self.stop_sql
    }
}

/// Opens sessions using the connection settings from configuration.
#[derive(Clone, Debug)]
pub struct PostgresConnector {
    user: String,
    database: String,
    port: u16,
    attempts: u32,
    backoff: Backoff,
}

impl PostgresConnector {
    /// Creates a connector retrying up to `attempts` times.
    #[must_use]
    pub const fn new(user: String, database: String, port: u16, attempts: u32) -> Self {
        Self {
            user,
            database,
            port,
            attempts,
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(30)),
        }
    }

    /// Overrides the delay schedule between connection attempts.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn options(&self, source: &SourceIdentity) -> PgConnectOptions {
        let credentials = &source.credentials;
        PgConnectOptions::new_without_pgpass()
            .host(&source.pod_ip)
            .port(self.port)
            .username(&self.user)
            .database(&self.database)
            .application_name(APPLICATION_NAME)
            .ssl_mode(PgSslMode::VerifyCa)
            .ssl_root_cert_from_pem(credentials.ca_pem.clone().into_bytes())
            .ssl_client_cert_from_pem(credentials.cert_pem.as_bytes())
            .ssl_client_key_from_pem(credentials.key_pem.as_bytes())
    }

    async fn open(&self, source: &SourceIdentity) -> Result<PostgresSession, BackupError> {
        let target = format!("{}:{}/{}", source.pod_ip, self.port, self.database);
        let options = self.options(source);
        let mut connection = PgConnection::connect_with(&options)
            .await
            .map_err(|err| connect_error(&target, &err))?;
        let version: i32 =
            sqlx::query_scalar("SELECT current_setting('server_version_num')::integer")
                .fetch_one(&mut connection)
                .await
                .map_err(|err| connect_error(&target, &err))?;
        tracing::debug!(%target, version, "opened backup session");
        Ok(PostgresSession {
            connection,
            dialect: BackupDialect::for_version(version),
        })
    }
}

fn connect_error(target: &str, err: &sqlx::Error) -> BackupError {
    match err {
        sqlx::Error::Tls(inner) => BackupError::Credentials {
            message: inner.to_string(),
        },
        other => BackupError::Connect {
            target: target.to_owned(),
            message: other.to_string(),
        },
    }
}

impl DatabaseConnector for PostgresConnector {
    fn connect<'a>(
        &'a self,
        source: &'a SourceIdentity,
    ) -> BackupFuture<'a, Box<dyn BackupSession>> {
        Box::pin(async move {
            let session = self
                .backoff
                .retry(
                    self.attempts,
                    |err: &BackupError| matches!(err, BackupError::Connect { .. }),
                    || self.open(source),
                )
                .await?;
            Ok(Box::new(session) as Box<dyn BackupSession>)
        })
    }
}

/// One open connection able to run a non-exclusive backup.
#[derive(Debug)]
pub struct PostgresSession {
    connection: PgConnection,
    dialect: BackupDialect,
}

impl BackupSession for PostgresSession {
    fn start<'a>(&'a mut self, label: &'a SnapshotLabel, fast: bool) -> BackupFuture<'a, ()> {
        Box::pin(async move {
            let lsn: Option<String> = sqlx::query_scalar(self.dialect.start_sql())
                .bind(label.as_str())
                .bind(fast)
                .fetch_one(&mut self.connection)
                .await
                .map_err(|err| BackupError::Protocol {
                    operation: "backup start",
                    message: err.to_string(),
                })?;
            tracing::debug!(%label, lsn = lsn.as_deref().unwrap_or("unknown"), "backup start acknowledged");
            Ok(())
        })
    }

    fn stop(&mut self, wait_for_archive: bool) -> BackupFuture<'_, BackupStopOutput> {
        Box::pin(async move {
            let (raw_label, tablespace_map): (Option<String>, Option<String>) =
                sqlx::query_as(self.dialect.stop_sql())
                    .bind(wait_for_archive)
                    .fetch_one(&mut self.connection)
                    .await
                    .map_err(|err| BackupError::Protocol {
                        operation: "backup stop",
                        message: err.to_string(),
                    })?;
            let label_file = raw_label.ok_or_else(|| BackupError::Protocol {
                operation: "backup stop",
                message: String::from("server returned no label file"),
            })?;
            Ok(BackupStopOutput {
                label_file,
                tablespace_map: tablespace_map.unwrap_or_default(),
            })
        })
    }

    fn close(self: Box<Self>) -> BackupFuture<'static, ()> {
        Box::pin(async move {
            self.connection
                .close()
                .await
                .map_err(|err| BackupError::Protocol {
                    operation: "session close",
                    message: err.to_string(),
                })
        })
    }
}
