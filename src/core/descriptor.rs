/// Connection string parsing
use crate::error::{BackupError, BackupResult};
use regex::Regex;
use std::fmt;
use std::str::FromStr;

/// Whole-string pattern: scheme, credentials, host list, database, options
pub const DEFAULT_CONNECTION_PATTERN: &str = r"^(?P<scheme>mongodb)://(?P<user>[^:@/?]+):(?P<password>[^@/?]+)@(?P<hosts>[^@/?]+)/(?P<database>[^/?]+)(?:\?(?P<options>.*))?$";

/// Pattern every comma-separated host token must match
pub const DEFAULT_HOST_PATTERN: &str = r"^(?P<host>[A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)(?::(?P<port>[0-9]{1,5}))?$";

/// Structured form of a connection string
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionDescriptor {
    username: String,
    password: String,
    hosts: Vec<String>,
    default_database: String,
    options: Vec<(String, String)>,
}

impl ConnectionDescriptor {
    /// Build a descriptor from already-validated parts
    pub(crate) fn from_parts(
        username: String,
        password: String,
        hosts: Vec<String>,
        default_database: String,
        options: Vec<(String, String)>,
    ) -> Self {
        debug_assert!(!hosts.is_empty());
        Self {
            username,
            password,
            hosts,
            default_database,
            options,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn default_database(&self) -> &str {
        &self.default_database
    }

    /// Options in the order they appeared
    pub fn options(&self) -> &[(String, String)] {
        &self.options
    }

    /// Look up an option value by exact name
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Full URI including the password, for handing to the driver
    pub fn connection_uri(&self) -> String {
        self.render(&self.password)
    }

    fn render(&self, password: &str) -> String {
        let mut uri = format!(
            "mongodb://{}:{}@{}/{}",
            self.username,
            password,
            self.hosts.join(","),
            self.default_database
        );
        if !self.options.is_empty() {
            let options: Vec<String> = self
                .options
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect();
            uri.push('?');
            uri.push_str(&options.join("&"));
        }
        uri
    }
}

/// Password is redacted so descriptors can be logged
impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render("****"))
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConnectionStringSyntax::default().parse(s)
    }
}

/// Compiled connection string syntax
#[derive(Debug, Clone)]
pub struct ConnectionStringSyntax {
    pattern: Regex,
    host_pattern: Regex,
}

impl ConnectionStringSyntax {
    /// Build a syntax from custom patterns.
    ///
    /// `pattern` must define the named groups `user`, `password`, `hosts`,
    /// `database` and optionally `options`; `host_pattern` must define `host`
    /// and optionally `port`.
    pub fn new(pattern: &str, host_pattern: &str) -> BackupResult<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| BackupError::format(format!("invalid syntax pattern: {}", e)))?;
        let host_pattern = Regex::new(host_pattern)
            .map_err(|e| BackupError::format(format!("invalid host pattern: {}", e)))?;
        Ok(Self {
            pattern,
            host_pattern,
        })
    }

    /// Parse and validate a connection string
    pub fn parse(&self, input: &str) -> BackupResult<ConnectionDescriptor> {
        let input = input.trim();
        if !input.starts_with("mongodb://") {
            return Err(BackupError::format("missing 'mongodb://' scheme"));
        }
        if !input.contains('@') {
            return Err(BackupError::format("missing '@' credential separator"));
        }

        let captures = self
            .pattern
            .captures(input)
            .ok_or_else(|| BackupError::format("connection string is malformed"))?;

        let group = |name: &str| captures.name(name).map(|m| m.as_str()).unwrap_or("");

        let username = group("user");
        let password = group("password");
        if username.is_empty() || password.is_empty() {
            return Err(BackupError::format("username and password are required"));
        }

        let hosts = self.parse_hosts(group("hosts"))?;

        let default_database = group("database");
        if default_database.is_empty() {
            return Err(BackupError::format("default database is required"));
        }

        let options = match captures.name("options") {
            Some(options) => parse_options(options.as_str())?,
            None => Vec::new(),
        };

        Ok(ConnectionDescriptor::from_parts(
            username.to_string(),
            password.to_string(),
            hosts,
            default_database.to_string(),
            options,
        ))
    }

    fn parse_hosts(&self, raw: &str) -> BackupResult<Vec<String>> {
        let mut hosts = Vec::new();
        for token in raw.split(',') {
            let captures = self
                .host_pattern
                .captures(token)
                .ok_or_else(|| BackupError::format(format!("invalid host '{}'", token)))?;

            if let Some(port) = captures.name("port") {
                match port.as_str().parse::<u16>() {
                    Ok(port) if port > 0 => {}
                    _ => {
                        return Err(BackupError::format(format!(
                            "invalid port in host '{}'",
                            token
                        )))
                    }
                }
            }
            hosts.push(token.to_string());
        }

        if hosts.is_empty() {
            return Err(BackupError::format("at least one host is required"));
        }
        Ok(hosts)
    }
}

impl Default for ConnectionStringSyntax {
    fn default() -> Self {
        // Both patterns are compile-time constants covered by tests.
        Self {
            pattern: Regex::new(DEFAULT_CONNECTION_PATTERN).unwrap(),
            host_pattern: Regex::new(DEFAULT_HOST_PATTERN).unwrap(),
        }
    }
}

fn parse_options(raw: &str) -> BackupResult<Vec<(String, String)>> {
    let mut options = Vec::new();
    for pair in raw.split('&') {
        match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() && !value.contains('=') => {
                options.push((key.to_string(), value.to_string()));
            }
            _ => {
                return Err(BackupError::format(format!(
                    "option '{}' is not a key=value pair",
                    pair
                )))
            }
        }
    }
    Ok(options)
}
