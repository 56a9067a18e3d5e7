//! Pooled PostgreSQL connections with password or identity-token auth.
//!
//! # Authentication
//!
//! | `user` | `password` | Mode |
//! |--------|------------|------|
//! | set | set | Password |
//! | unset | unset | Identity token (role resolved at connect) |
//! | one of the two | | [`Error::Configuration`] |
//!
//! With identity tokens the pool authenticates with the current bearer token
//! as its password. A background task fetches a new token before the current
//! one expires and swaps in a pool configured with it; connections already
//! checked out keep working until returned.
//!
//! # Pool
//!
//! Every physical connection runs `CREATE EXTENSION IF NOT EXISTS vector`
//! once, right after it is opened. Checkout waits at most
//! [`EngineConfig::wait_timeout`] and fails with [`Error::Connectivity`].

pub mod credentials;
pub mod token;

use crate::config::{EngineConfig, TlsMode};
use crate::index::VectorIndex;
use crate::models::SafeIdent;
use crate::observability::record_operation;
use crate::schema::{TABLE_COLUMNS_QUERY, TABLE_EXISTS_QUERY, TableColumn, TableConfig};
use crate::{Error, Result};
use credentials::{AuthMode, auth_mode};
use deadpool_postgres::{
    Hook, HookError, ManagerConfig, Object, Pool, PoolConfig, RecyclingMethod, Runtime, Timeouts,
};
use secrecy::ExposeSecret;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::instrument;

pub use credentials::{IdentityIntrospector, TokenInfoIntrospector, resolve_iam_user};
pub use token::{AccessToken, GoogleTokenSource, StaticTokenSource, TokenSource};

/// Runs once per physical connection.
pub const CREATE_VECTOR_EXTENSION: &str = "CREATE EXTENSION IF NOT EXISTS vector";

/// Delay before retrying a failed background token refresh.
const REFRESH_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Lower bound between background refreshes, for tokens shorter than the
/// refresh margin.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// A pool and the expiry of the token it authenticates with.
struct PoolState {
    pool: Pool,
    expires_at: Option<Instant>,
}

struct IdentityAuth {
    source: Arc<dyn TokenSource>,
    refresh: tokio::sync::Mutex<()>,
}

struct EngineInner {
    config: EngineConfig,
    user: String,
    state: RwLock<PoolState>,
    identity: Option<IdentityAuth>,
    refresher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let handle = self
            .refresher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

/// Connection manager shared by schema operations and stores.
///
/// Cheap to clone; clones share one pool.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("host", &self.inner.config.host)
            .field("database", &self.inner.config.database)
            .field("user", &self.inner.user)
            .field("identity_auth", &self.inner.identity.is_some())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine.
    ///
    /// Password pools connect lazily. Identity auth discovers Application
    /// Default Credentials, fetches a token and resolves the role before
    /// returning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for half-specified credentials (before
    /// any I/O) or when the identity cannot be resolved, and
    /// [`Error::Connectivity`] if a token cannot be fetched.
    #[instrument(skip(config), fields(host = %config.host, database = %config.database))]
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        match auth_mode(&config)? {
            AuthMode::Password { user, password } => {
                let pool = build_pool(&config, &user, password.expose_secret())?;
                tracing::info!(user = %user, "Engine created with password auth");
                Ok(Self::from_parts(config, user, pool, None, None))
            },
            AuthMode::Identity => {
                let source: Arc<dyn TokenSource> = Arc::new(GoogleTokenSource::from_env()?);
                let introspector = TokenInfoIntrospector::new(config.tokeninfo_url.clone());
                Self::connect_with_identity(config, source, &introspector).await
            },
        }
    }

    /// Creates an engine authenticating with tokens from `source`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a user or password is configured,
    /// or the role cannot be resolved; [`Error::Connectivity`] if the first
    /// token cannot be fetched.
    #[instrument(skip_all, fields(host = %config.host, database = %config.database))]
    pub async fn connect_with_identity(
        config: EngineConfig,
        source: Arc<dyn TokenSource>,
        introspector: &dyn IdentityIntrospector,
    ) -> Result<Self> {
        if !matches!(auth_mode(&config)?, AuthMode::Identity) {
            return Err(Error::Configuration(
                "identity auth cannot be combined with a user and password".to_string(),
            ));
        }

        let token = source.token().await?;
        let user = credentials::resolve_iam_user(
            config.iam_account_email.as_deref(),
            &token,
            introspector,
        )
        .await?;
        let pool = build_pool(&config, &user, token.secret())?;
        tracing::info!(user = %user, "Engine created with identity auth");

        let engine = Self::from_parts(
            config,
            user,
            pool,
            Some(token.expires_at()),
            Some(IdentityAuth {
                source,
                refresh: tokio::sync::Mutex::new(()),
            }),
        );
        engine.spawn_refresher();
        Ok(engine)
    }

    fn from_parts(
        config: EngineConfig,
        user: String,
        pool: Pool,
        expires_at: Option<Instant>,
        identity: Option<IdentityAuth>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                user,
                state: RwLock::new(PoolState { pool, expires_at }),
                identity,
                refresher: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Returns the database role in use.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.inner.user
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn current(&self) -> (Pool, Option<Instant>) {
        let state = self
            .inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        (state.pool.clone(), state.expires_at)
    }

    /// Checks out a pooled connection.
    ///
    /// With identity auth, an already expired token is refreshed first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connectivity`] if no connection is available within
    /// the wait timeout, a new connection cannot be opened, or an expired
    /// token cannot be refreshed.
    pub async fn acquire(&self) -> Result<Object> {
        let (mut pool, expires_at) = self.current();
        if expires_at.is_some_and(|at| Instant::now() >= at) {
            tracing::warn!("Identity token expired before checkout; refreshing inline");
            pool = refresh_pool(&self.inner).await?;
        }
        pool.get().await.map_err(|e| Error::pool("acquire", e))
    }

    fn spawn_refresher(&self) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(refresh_loop(weak));
        *self
            .inner
            .refresher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Creates the vector table and its index.
    ///
    /// Without `index`, an HNSW cosine index with default parameters is
    /// built; pass [`VectorIndex::exact`] for none. With
    /// [`TableConfig::overwrite_existing`] an existing table is dropped
    /// first, destroying its rows. The probe, drop, create and index
    /// statements run in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an invalid configuration or
    /// index (before any SQL), [`Error::SchemaConflict`] if the table exists
    /// and overwriting is disabled, and connectivity or operation errors
    /// from the database.
    #[instrument(skip(self, config, index), fields(table = %config.table_name, schema = %config.schema_name))]
    pub async fn init_vector_store_table(
        &self,
        config: &TableConfig,
        index: Option<&VectorIndex>,
    ) -> Result<()> {
        let started = Instant::now();
        let result = self.init_vector_store_table_inner(config, index).await;
        record_operation("init_table", started, &result);
        result
    }

    async fn init_vector_store_table_inner(
        &self,
        config: &TableConfig,
        index: Option<&VectorIndex>,
    ) -> Result<()> {
        let layout = config.validate()?;
        let index = index.cloned().unwrap_or_default();
        let index_sql =
            index.create_index_statement(&layout.schema, &layout.table, &layout.embedding_column)?;

        let mut client = self.acquire().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| Error::query("init_table_begin", &e))?;

        if config.overwrite_existing {
            tracing::warn!(table = %layout.qualified_name(), "Dropping existing table");
            tx.batch_execute(&layout.drop_table_statement())
                .await
                .map_err(|e| Error::query("drop_table", &e))?;
        } else {
            let row = tx
                .query_one(
                    TABLE_EXISTS_QUERY,
                    &[&layout.schema.as_str(), &layout.table.as_str()],
                )
                .await
                .map_err(|e| Error::query("probe_table", &e))?;
            let exists: bool = row.get(0);
            if exists {
                return Err(Error::SchemaConflict {
                    schema: layout.schema.to_string(),
                    table: layout.table.to_string(),
                });
            }
        }

        tx.batch_execute(&layout.create_table_statement())
            .await
            .map_err(|e| Error::query("create_table", &e))?;
        if let Some(sql) = &index_sql {
            tx.batch_execute(sql)
                .await
                .map_err(|e| Error::query("create_index", &e))?;
        }
        tx.commit()
            .await
            .map_err(|e| Error::query("init_table_commit", &e))?;

        tracing::info!(
            table = %layout.qualified_name(),
            dimension = layout.dimension,
            metadata_columns = layout.metadata_columns.len(),
            index = index.kind.method().unwrap_or("exact"),
            "Vector table created"
        );
        Ok(())
    }

    /// Creates `index` on an existing embedding column.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for unsafe names or an unsupported
    /// index, or a database error.
    #[instrument(skip(self, index))]
    pub async fn apply_vector_index(
        &self,
        schema: &str,
        table: &str,
        column: &str,
        index: &VectorIndex,
    ) -> Result<()> {
        let (schema, table, column) = idents(schema, table, column)?;
        let Some(sql) = index.create_index_statement(&schema, &table, &column)? else {
            return Ok(());
        };
        let client = self.acquire().await?;
        client
            .batch_execute(&sql)
            .await
            .map_err(|e| Error::query("create_index", &e))?;
        tracing::info!(index = %index.index_name(&table, &column)?, "Vector index created");
        Ok(())
    }

    /// Drops the index `index` would create, if present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for unsafe names, or a database error.
    #[instrument(skip(self, index))]
    pub async fn drop_vector_index(
        &self,
        schema: &str,
        table: &str,
        column: &str,
        index: &VectorIndex,
    ) -> Result<()> {
        let (schema, table, column) = idents(schema, table, column)?;
        let sql = index.drop_index_statement(&schema, &table, &column)?;
        let client = self.acquire().await?;
        client
            .batch_execute(&sql)
            .await
            .map_err(|e| Error::query("drop_index", &e))
    }

    /// Lists a table's columns from the catalog, in table order.
    ///
    /// Returns an empty list if the table does not exist.
    ///
    /// # Errors
    ///
    /// Returns a connectivity or operation error.
    #[instrument(skip(self))]
    pub async fn table_columns(&self, schema: &str, table: &str) -> Result<Vec<TableColumn>> {
        let client = self.acquire().await?;
        let rows = client
            .query(TABLE_COLUMNS_QUERY, &[&schema, &table])
            .await
            .map_err(|e| Error::query("table_columns", &e))?;
        Ok(rows
            .iter()
            .map(|row| TableColumn {
                name: row.get(0),
                data_type: row.get(1),
            })
            .collect())
    }

    /// Drops a table if it exists. Destroys all of its rows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for unsafe names, or a database error.
    #[instrument(skip(self))]
    pub async fn drop_table(&self, schema: &str, table: &str) -> Result<()> {
        let schema = SafeIdent::new(schema)?;
        let table = SafeIdent::new(table)?;
        let client = self.acquire().await?;
        client
            .batch_execute(&crate::schema::drop_table_statement(&schema, &table))
            .await
            .map_err(|e| Error::query("drop_table", &e))
    }

    /// Closes the pool. Later checkouts fail with [`Error::Connectivity`].
    pub fn close(&self) {
        self.current().0.close();
        if let Some(handle) = self
            .inner
            .refresher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

fn idents(schema: &str, table: &str, column: &str) -> Result<(SafeIdent, SafeIdent, SafeIdent)> {
    Ok((
        SafeIdent::new(schema)?,
        SafeIdent::new(table)?,
        SafeIdent::new(column)?,
    ))
}

/// Fetches a token and swaps in a pool that authenticates with it.
///
/// Concurrent callers share one refresh; a caller that waited on another's
/// refresh reuses its result.
async fn refresh_pool(inner: &EngineInner) -> Result<Pool> {
    let Some(identity) = &inner.identity else {
        let state = inner.state.read().unwrap_or_else(PoisonError::into_inner);
        return Ok(state.pool.clone());
    };
    let _guard = identity.refresh.lock().await;

    {
        let state = inner.state.read().unwrap_or_else(PoisonError::into_inner);
        let margin = inner.config.token_refresh_margin;
        if state
            .expires_at
            .is_some_and(|at| at.checked_sub(margin).is_some_and(|due| Instant::now() < due))
        {
            return Ok(state.pool.clone());
        }
    }

    let token = identity.source.token().await?;
    let pool = build_pool(&inner.config, &inner.user, token.secret())?;
    let old = {
        let mut state = inner.state.write().unwrap_or_else(PoisonError::into_inner);
        let old = std::mem::replace(&mut state.pool, pool.clone());
        state.expires_at = Some(token.expires_at());
        old
    };
    old.close();
    tracing::info!("Identity token refreshed");
    metrics::counter!("embedstore_token_refresh_total").increment(1);
    Ok(pool)
}

async fn refresh_loop(weak: Weak<EngineInner>) {
    loop {
        let delay = {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let state = inner.state.read().unwrap_or_else(PoisonError::into_inner);
            state.expires_at.map_or(REFRESH_RETRY_DELAY, |at| {
                at.checked_sub(inner.config.token_refresh_margin)
                    .map_or(Duration::ZERO, |due| due.saturating_duration_since(Instant::now()))
            })
        };
        tokio::time::sleep(delay.max(MIN_REFRESH_INTERVAL)).await;

        let Some(inner) = weak.upgrade() else {
            return;
        };
        if let Err(e) = refresh_pool(&inner).await {
            tracing::warn!(error = %e, "Background token refresh failed");
            drop(inner);
            tokio::time::sleep(REFRESH_RETRY_DELAY).await;
        }
    }
}

/// Builds a pool for `user` and `password`.
fn build_pool(config: &EngineConfig, user: &str, password: &str) -> Result<Pool> {
    if config.pool_max_size == 0 {
        return Err(Error::Configuration(
            "pool_max_size must be positive".to_string(),
        ));
    }

    let mut cfg = deadpool_postgres::Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.user = Some(user.to_string());
    cfg.password = Some(password.to_string());
    cfg.dbname = Some(config.database.clone());
    cfg.pool = Some(PoolConfig {
        max_size: config.pool_max_size,
        timeouts: Timeouts {
            wait: Some(config.wait_timeout),
            create: Some(config.create_timeout),
            recycle: Some(config.recycle_timeout),
        },
        ..Default::default()
    });
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    let builder = match config.tls {
        TlsMode::Disable => {
            cfg.ssl_mode = Some(deadpool_postgres::SslMode::Disable);
            cfg.builder(tokio_postgres::NoTls)
        },
        TlsMode::Require => {
            cfg.ssl_mode = Some(deadpool_postgres::SslMode::Require);
            cfg.builder(tls::connector()?)
        },
    }
    .map_err(|e| Error::Configuration(format!("invalid pool configuration: {e}")))?;

    builder
        .runtime(Runtime::Tokio1)
        .post_create(Hook::async_fn(|client, _| {
            Box::pin(async move {
                client
                    .batch_execute(CREATE_VECTOR_EXTENSION)
                    .await
                    .map_err(HookError::Backend)?;
                Ok(())
            })
        }))
        .build()
        .map_err(|e| Error::OperationFailed {
            operation: "create_pool".to_string(),
            cause: e.to_string(),
        })
}

#[cfg(feature = "tls")]
mod tls {
    use crate::{Error, Result};
    use std::sync::Arc;
    use tokio_postgres_rustls::MakeRustlsConnect;

    pub(super) fn connector() -> Result<MakeRustlsConnect> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config =
            rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .map_err(|e| Error::Configuration(format!("invalid TLS configuration: {e}")))?
                .with_root_certificates(roots)
                .with_no_client_auth();
        Ok(MakeRustlsConnect::new(config))
    }
}

#[cfg(not(feature = "tls"))]
mod tls {
    use crate::{Error, Result};

    pub(super) fn connector() -> Result<tokio_postgres::NoTls> {
        Err(Error::Configuration(
            "TLS requires building embedstore with the `tls` feature".to_string(),
        ))
    }
}
