//! Validated broker connection settings for the publisher and subscriber roles.

use std::fmt;

use super::{ConfigError, ConfigSection};

/// Port used when `Port` is not set.
pub const DEFAULT_PORT: u16 = 5672;
/// Virtual host used when `VirtualHost` is not set.
pub const DEFAULT_VIRTUAL_HOST: &str = "/";

/// Connection and exchange settings shared by both roles.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    host: String,
    virtual_host: String,
    port: u16,
    username: String,
    password: String,
    exchange: String,
}

impl ConnectionConfig {
    /// Build from explicit values, applying the same validation as
    /// [`ConnectionConfig::from_section`].
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        exchange: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            host: host.into(),
            virtual_host: DEFAULT_VIRTUAL_HOST.to_string(),
            port: DEFAULT_PORT,
            username: username.into(),
            password: password.into(),
            exchange: exchange.into(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Read and validate the `Host`, `VirtualHost`, `Port`, `Username`,
    /// `Password` and `Exchange` settings.
    pub fn from_section(section: &ConfigSection) -> Result<Self, ConfigError> {
        Ok(Self {
            host: section.required("Host")?,
            virtual_host: section
                .non_empty("VirtualHost")
                .unwrap_or(DEFAULT_VIRTUAL_HOST)
                .to_string(),
            port: parse_port(section.non_empty("Port"))?,
            username: section.required("Username")?,
            password: section.required("Password")?,
            exchange: section.required("Exchange")?,
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Empty values fall back to `/`.
    pub fn with_virtual_host(mut self, virtual_host: impl Into<String>) -> Self {
        let virtual_host = virtual_host.into();
        self.virtual_host = if virtual_host.is_empty() {
            DEFAULT_VIRTUAL_HOST.to_string()
        } else {
            virtual_host
        };
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Missing("Host"));
        }
        if self.username.is_empty() {
            return Err(ConfigError::Missing("Username"));
        }
        if self.password.is_empty() {
            return Err(ConfigError::Missing("Password"));
        }
        if self.exchange.is_empty() {
            return Err(ConfigError::Missing("Exchange"));
        }
        Ok(())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn virtual_host(&self) -> &str {
        &self.virtual_host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Connection target for logs, without the password.
    pub fn display_uri(&self) -> String {
        format!(
            "amqp://{}@{}:{}/{}",
            self.username,
            self.host,
            self.port,
            self.virtual_host.trim_start_matches('/')
        )
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("virtual_host", &self.virtual_host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"*".repeat(self.password.len()))
            .field("exchange", &self.exchange)
            .finish()
    }
}

/// Subscriber settings: connection plus the queue to consume from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberConfig {
    connection: ConnectionConfig,
    queue: String,
    routing_key: String,
}

impl SubscriberConfig {
    /// Bind `queue` with an empty routing key (receive everything).
    pub fn new(connection: ConnectionConfig, queue: impl Into<String>) -> Result<Self, ConfigError> {
        let queue = queue.into();
        if queue.is_empty() {
            return Err(ConfigError::Missing("Queue"));
        }
        Ok(Self {
            connection,
            queue,
            routing_key: String::new(),
        })
    }

    /// Read the connection settings plus `Queue` (required) and `RoutingKey`
    /// (default empty).
    pub fn from_section(section: &ConfigSection) -> Result<Self, ConfigError> {
        let connection = ConnectionConfig::from_section(section)?;
        Ok(Self {
            connection,
            queue: section.required("Queue")?,
            routing_key: section.get("RoutingKey").unwrap_or_default().to_string(),
        })
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn connection(&self) -> &ConnectionConfig {
        &self.connection
    }

    pub fn exchange(&self) -> &str {
        self.connection.exchange()
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }
}

fn parse_port(raw: Option<&str>) -> Result<u16, ConfigError> {
    match raw {
        None => Ok(DEFAULT_PORT),
        Some(value) => value
            .trim()
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort(value.to_string())),
    }
}
