use crate::Result;
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::ImageExt;
use testcontainers::{ContainerAsync, GenericImage};
use typed_builder::TypedBuilder;

const POSTGRES_PORT: u16 = 5432;

#[derive(Debug, Clone, TypedBuilder)]
pub struct PostgresConfig {
    #[builder(default = "snip".to_string(), setter(into))]
    database: String,
    #[builder(default = "snip".to_string(), setter(into))]
    username: String,
    #[builder(default = "snip".to_string(), setter(into))]
    password: String,
    #[builder(default = "16-alpine".to_string(), setter(into))]
    tag: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A PostgreSQL server living as long as this value.
///
/// The server restarts once after initializing the database, so the first
/// connection attempts may still be refused. Callers should retry.
pub struct PostgresServer {
    container: ContainerAsync<GenericImage>,
    config: PostgresConfig,
}

impl PostgresServer {
    pub async fn new(config: PostgresConfig) -> Result<Self> {
        let container = GenericImage::new("postgres", config.tag.as_str())
            .with_exposed_port(POSTGRES_PORT.tcp())
            .with_wait_for(WaitFor::message_on_stderr(
                "database system is ready to accept connections",
            ))
            .with_env_var("POSTGRES_DB", config.database.as_str())
            .with_env_var("POSTGRES_USER", config.username.as_str())
            .with_env_var("POSTGRES_PASSWORD", config.password.as_str())
            .start()
            .await?;

        Ok(Self { container, config })
    }

    pub async fn host(&self) -> Result<String> {
        Ok(self.container.get_host().await?.to_string())
    }

    pub async fn port(&self) -> Result<u16> {
        Ok(self.container.get_host_port_ipv4(POSTGRES_PORT).await?)
    }

    pub async fn database_url(&self) -> Result<String> {
        let host = self.host().await?;
        let port = self.port().await?;
        Ok(format!(
            "postgres://{}:{}@{}:{}/{}",
            self.config.username, self.config.password, host, port, self.config.database
        ))
    }

    pub fn container(&self) -> &ContainerAsync<GenericImage> {
        &self.container
    }
}
