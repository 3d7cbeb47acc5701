use crate::{Result, TenancyError, TenantContext};
use dashmap::DashMap;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres};
use tb_common::{DataError, TenantDatabase, TenantRoute, TenantTier};
use tb_config::PostgresSettings;
use tracing::{debug, info};

pub type TenantConnection = PoolConnection<Postgres>;

/// Builds connect options for the catalog, the shared tenant database and
/// isolated tenant databases.
#[derive(Debug, Clone)]
pub struct ConnectOptionsFactory {
    settings: PostgresSettings,
}

impl ConnectOptionsFactory {
    pub fn new(settings: PostgresSettings) -> Self {
        Self { settings }
    }

    fn base(&self, host: &str, database: &str) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(host)
            .port(self.settings.port)
            .username(&self.settings.username)
            .database(database)
            .application_name(&self.settings.application_name);
        if !self.settings.password.is_empty() {
            options = options.password(&self.settings.password);
        }
        options
    }

    pub fn catalog(&self) -> PgConnectOptions {
        self.base(&self.settings.host, &self.settings.catalog_db)
    }

    pub fn shared(&self) -> PgConnectOptions {
        self.base(&self.settings.host, &self.settings.tenant_shared_db)
    }

    pub fn isolated(&self, database: &TenantDatabase) -> PgConnectOptions {
        let host = database
            .server_name
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.settings.host);
        self.base(host, &database.database_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PoolKey {
    Shared,
    Isolated { server: Option<String>, database: String },
}

/// Hands out pooled connections bound to a tenant.
///
/// Every connection has `app.tenant_id` set before it is returned, and
/// cleared when it goes back to the pool.
pub struct TenantConnectionProvider {
    factory: ConnectOptionsFactory,
    max_connections: u32,
    pools: DashMap<PoolKey, PgPool>,
}

impl TenantConnectionProvider {
    pub fn new(settings: PostgresSettings) -> Self {
        let max_connections = settings.max_connections.max(1);
        Self {
            factory: ConnectOptionsFactory::new(settings),
            max_connections,
            pools: DashMap::new(),
        }
    }

    pub fn factory(&self) -> &ConnectOptionsFactory {
        &self.factory
    }

    /// Opens a connection for the tenant resolved on the current request.
    pub async fn open(&self, context: &TenantContext) -> Result<TenantConnection> {
        let resolution = context.require()?;
        self.open_route(resolution).await
    }

    /// Opens a connection for any routable tenant (request resolution or
    /// catalog entry).
    pub async fn open_route<R: TenantRoute + ?Sized>(&self, route: &R) -> Result<TenantConnection> {
        let tenant_id = route.tenant_id();
        let pool = self.pool_for(route)?;

        let mut connection = pool
            .acquire()
            .await
            .map_err(DataError::during("open tenant connection"))?;

        sqlx::query("SELECT set_config('app.tenant_id', $1, false)")
            .bind(tenant_id.to_string())
            .execute(&mut *connection)
            .await
            .map_err(DataError::during("set tenant session"))?;

        debug!(tenant_id = %tenant_id, "Opened tenant connection");
        Ok(connection)
    }

    /// Pool for the tenant's physical database. Creating it does not connect.
    pub fn pool_for<R: TenantRoute + ?Sized>(&self, route: &R) -> Result<PgPool> {
        let (key, options) = match route.tier() {
            TenantTier::Shared => (PoolKey::Shared, self.factory.shared()),
            TenantTier::Isolated => {
                let database = route
                    .database()
                    .ok_or(TenancyError::MissingDatabaseMapping(route.tenant_id()))?;
                let key = PoolKey::Isolated {
                    server: database.server_name.clone(),
                    database: database.database_name.clone(),
                };
                (key, self.factory.isolated(database))
            }
        };

        if let Some(pool) = self.pools.get(&key) {
            return Ok(pool.clone());
        }

        let pool = self
            .pools
            .entry(key.clone())
            .or_insert_with(|| {
                info!(pool = ?key, "Creating tenant connection pool");
                PgPoolOptions::new()
                    .max_connections(self.max_connections)
                    .after_release(|conn, _meta| {
                        Box::pin(async move {
                            sqlx::query("SELECT set_config('app.tenant_id', '', false)")
                                .execute(&mut *conn)
                                .await?;
                            Ok(true)
                        })
                    })
                    .connect_lazy_with(options)
            })
            .clone();
        Ok(pool)
    }

    /// Number of physical database pools opened so far.
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}
