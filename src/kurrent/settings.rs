use eventstore::ClientSettings;

use crate::error::Error;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 2113;

/// Where and how to reach a KurrentDB node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    host: String,
    port: u16,
    tls: bool,
    username: Option<String>,
    password: Option<String>,
}

impl ConnectionSettings {
    pub fn builder() -> ConnectionSettingsBuilder {
        ConnectionSettingsBuilder::default()
    }

    /// Reads `KURRENT_HOST`, `KURRENT_PORT`, `KURRENT_TLS`, `KURRENT_USERNAME`
    /// and `KURRENT_PASSWORD`. Host and port default to `localhost:2113`, TLS
    /// to off.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut builder = Self::builder();
        if let Some(host) = lookup("KURRENT_HOST") {
            builder = builder.host(host);
        }
        if let Some(port) = lookup("KURRENT_PORT") {
            let port = port.trim().parse::<u16>().map_err(|e| {
                Error::invalid_config(format!("'{port}' is not a port: {e}"), Some("KURRENT_PORT"))
            })?;
            builder = builder.port(port);
        }
        if let Some(tls) = lookup("KURRENT_TLS") {
            let tls = tls.trim().parse::<bool>().map_err(|e| {
                Error::invalid_config(format!("'{tls}' is not a bool: {e}"), Some("KURRENT_TLS"))
            })?;
            builder = builder.tls(tls);
        }
        if let Some(username) = lookup("KURRENT_USERNAME") {
            builder = builder.username(username);
        }
        if let Some(password) = lookup("KURRENT_PASSWORD") {
            builder = builder.password(password);
        }
        builder.build()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    /// The `esdb://` URL for these settings.
    pub fn to_connection_string(&self) -> String {
        let credentials = match (&self.username, &self.password) {
            (Some(username), Some(password)) => format!("{username}:{password}@"),
            _ => String::new(),
        };
        format!(
            "esdb://{credentials}{}:{}?tls={}",
            self.host, self.port, self.tls
        )
    }

    pub fn to_client_settings(&self) -> Result<ClientSettings, Error> {
        Ok(self.to_connection_string().parse::<ClientSettings>()?)
    }
}

#[derive(Debug, Default)]
pub struct ConnectionSettingsBuilder {
    host: Option<String>,
    port: Option<u16>,
    tls: Option<bool>,
    username: Option<String>,
    password: Option<String>,
}

impl ConnectionSettingsBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn tls(mut self, tls: bool) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for an empty host, port zero, or a username
    /// without a password (and the reverse).
    pub fn build(self) -> Result<ConnectionSettings, Error> {
        let host = self.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
        if host.trim().is_empty() {
            return Err(Error::invalid_config("host must not be empty", Some("host")));
        }
        let port = self.port.unwrap_or(DEFAULT_PORT);
        if port == 0 {
            return Err(Error::invalid_config("port must not be zero", Some("port")));
        }
        match (&self.username, &self.password) {
            (Some(_), None) => {
                return Err(Error::invalid_config(
                    "a username needs a password",
                    Some("password"),
                ));
            }
            (None, Some(_)) => {
                return Err(Error::invalid_config(
                    "a password needs a username",
                    Some("username"),
                ));
            }
            _ => {}
        }
        Ok(ConnectionSettings {
            host,
            port,
            tls: self.tls.unwrap_or(false),
            username: self.username,
            password: self.password,
        })
    }
}
