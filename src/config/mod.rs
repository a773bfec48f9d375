//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    num::NonZeroU32,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::domain::queries::{ParamSpec, QueryDefinition};
use crate::domain::types::{ArgumentValue, ParamType};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "dashcache";
const ENV_PREFIX: &str = "DASHCACHE";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8050;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 4;
const DEFAULT_DB_ACQUIRE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_DB_CONNECT_TIMEOUT_SECS: u32 = 15;
const DEFAULT_DB_STATEMENT_TIMEOUT_SECS: u32 = 120;
const DEFAULT_REFRESH_TICK_SECS: u32 = 15;
const DEFAULT_REFRESH_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_REFRESH_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_REFRESH_BACKOFF_MAX_MS: u64 = 10_000;
const DEFAULT_REFRESH_JITTER: f64 = 0.2;
const MAX_REFRESH_BACKOFF_MS: u64 = 3_600_000;
const DEFAULT_MAX_STALENESS_SECS: u64 = 300;

/// Environment variables of the earlier dashboard deployment, mapped onto
/// configuration keys at the lowest precedence.
const LEGACY_ENV_KEYS: [(&str, &str); 5] = [
    ("DB_SERVER", "database.server"),
    ("DB_NAME", "database.name"),
    ("DB_USER", "database.user"),
    ("DB_PASSWORD", "database.password"),
    ("PORT", "server.port"),
];

/// Command-line arguments for the dashcache binary.
#[derive(Debug, Parser)]
#[command(
    name = "dashcache",
    version,
    about = "Caching refresh layer between a dashboard and SQL Server"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "DASHCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the refresh scheduler and the dashboard HTTP surface.
    Serve(Box<ServeArgs>),
    /// Refresh the selected queries once and print their status.
    Refresh(RefreshArgs),
    /// Validate and print the registered query definitions.
    Queries,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection string.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Override the periodic refresh tick.
    #[arg(long = "refresh-tick-seconds", value_name = "SECONDS")]
    pub refresh_tick_seconds: Option<u32>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RefreshArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Query to refresh; repeat for several. Refreshes every query when omitted.
    #[arg(long = "query", value_name = "NAME")]
    pub queries: Vec<String>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub refresh: RefreshSettings,
    pub queries: Vec<QueryDefinition>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Clone)]
pub struct DatabaseSettings {
    /// ADO.NET style connection string; `None` when nothing was configured.
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
    pub acquire_timeout_ms: u64,
    pub connect_timeout_seconds: NonZeroU32,
    pub statement_timeout_seconds: NonZeroU32,
}

impl DatabaseSettings {
    pub fn connection_string(&self) -> Result<&str, LoadError> {
        self.url.as_deref().ok_or_else(|| {
            LoadError::invalid(
                "database.url",
                "set database.url or database.server (DB_SERVER) to reach SQL Server",
            )
        })
    }
}

impl std::fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout_ms", &self.acquire_timeout_ms)
            .field("connect_timeout_seconds", &self.connect_timeout_seconds)
            .field("statement_timeout_seconds", &self.statement_timeout_seconds)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub tick_seconds: NonZeroU32,
    pub max_attempts: NonZeroU32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub jitter: f64,
    pub warm_on_startup: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence
/// (default file → legacy env → local file → `--config-file` → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    load_with_env(cli, Path::new(""), |key| std::env::var(key).ok())
}

fn load_with_env(
    cli: &CliArgs,
    root: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::from(root.join(DEFAULT_CONFIG_BASENAME)).required(false))
        .add_source(legacy_layer(lookup)?)
        .add_source(File::from(root.join(LOCAL_CONFIG_BASENAME)).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Refresh(args)) => raw.apply_database_override(&args.database),
        Some(Command::Queries) => {}
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Legacy deployment variables as their own layer, above the shipped defaults
/// and below every file an operator writes.
fn legacy_layer(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, LoadError> {
    let mut builder = Config::builder();
    for (variable, key) in LEGACY_ENV_KEYS {
        if let Some(value) = lookup(variable).filter(|value| !value.trim().is_empty()) {
            builder = builder.set_override(key, value)?;
        }
    }
    Ok(builder.build()?)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    refresh: RawRefreshSettings,
    queries: Vec<RawQuerySettings>,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(tick) = overrides.refresh_tick_seconds {
            self.refresh.tick_seconds = Some(tick);
        }

        self.apply_database_override(&overrides.database);
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            refresh,
            queries,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            refresh: build_refresh_settings(refresh)?,
            queries: build_query_definitions(queries)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = match non_empty(database.url) {
        Some(url) => Some(url),
        None => non_empty(database.server).map(|server| {
            compose_connection_string(
                &server,
                database.name.as_deref(),
                database.user.as_deref(),
                database.password.as_deref(),
            )
        }),
    };

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    let acquire_timeout_ms = database
        .acquire_timeout_ms
        .unwrap_or(DEFAULT_DB_ACQUIRE_TIMEOUT_MS);
    if acquire_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "database.acquire_timeout_ms",
            "must be greater than zero",
        ));
    }

    let connect_timeout_seconds = non_zero_u32(
        database
            .connect_timeout_seconds
            .unwrap_or(DEFAULT_DB_CONNECT_TIMEOUT_SECS)
            .into(),
        "database.connect_timeout_seconds",
    )?;
    let statement_timeout_seconds = non_zero_u32(
        database
            .statement_timeout_seconds
            .unwrap_or(DEFAULT_DB_STATEMENT_TIMEOUT_SECS)
            .into(),
        "database.statement_timeout_seconds",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
        acquire_timeout_ms,
        connect_timeout_seconds,
        statement_timeout_seconds,
    })
}

/// Compose an ADO.NET connection string from discrete parts.
fn compose_connection_string(
    server: &str,
    name: Option<&str>,
    user: Option<&str>,
    password: Option<&str>,
) -> String {
    let mut parts = vec![format!("Server={server}")];
    if let Some(name) = name.filter(|value| !value.is_empty()) {
        parts.push(format!("Database={name}"));
    }
    if let Some(user) = user.filter(|value| !value.is_empty()) {
        parts.push(format!("User Id={user}"));
    }
    if let Some(password) = password {
        parts.push(format!("Password={password}"));
    }
    parts.push("Encrypt=yes".to_string());
    parts.push("TrustServerCertificate=yes".to_string());
    parts.join(";")
}

fn build_refresh_settings(refresh: RawRefreshSettings) -> Result<RefreshSettings, LoadError> {
    let tick_seconds = non_zero_u32(
        refresh
            .tick_seconds
            .unwrap_or(DEFAULT_REFRESH_TICK_SECS)
            .into(),
        "refresh.tick_seconds",
    )?;
    let max_attempts = non_zero_u32(
        refresh
            .max_attempts
            .unwrap_or(DEFAULT_REFRESH_MAX_ATTEMPTS)
            .into(),
        "refresh.max_attempts",
    )?;

    let backoff_base_ms = refresh
        .backoff_base_ms
        .unwrap_or(DEFAULT_REFRESH_BACKOFF_BASE_MS);
    let backoff_max_ms = refresh
        .backoff_max_ms
        .unwrap_or(DEFAULT_REFRESH_BACKOFF_MAX_MS);
    if backoff_max_ms < backoff_base_ms {
        return Err(LoadError::invalid(
            "refresh.backoff_max_ms",
            format!("must be at least backoff_base_ms ({backoff_base_ms})"),
        ));
    }
    if backoff_max_ms > MAX_REFRESH_BACKOFF_MS {
        return Err(LoadError::invalid(
            "refresh.backoff_max_ms",
            format!("must not exceed {MAX_REFRESH_BACKOFF_MS} (one hour)"),
        ));
    }

    let jitter = refresh.jitter.unwrap_or(DEFAULT_REFRESH_JITTER);
    if !(0.0..1.0).contains(&jitter) {
        return Err(LoadError::invalid(
            "refresh.jitter",
            "must be within [0.0, 1.0)",
        ));
    }

    Ok(RefreshSettings {
        tick_seconds,
        max_attempts,
        backoff_base_ms,
        backoff_max_ms,
        jitter,
        warm_on_startup: refresh.warm_on_startup.unwrap_or(true),
    })
}

fn build_query_definitions(
    queries: Vec<RawQuerySettings>,
) -> Result<Vec<QueryDefinition>, LoadError> {
    queries
        .into_iter()
        .map(|query| {
            let staleness = query
                .max_staleness_seconds
                .unwrap_or(DEFAULT_MAX_STALENESS_SECS);
            if staleness == 0 {
                return Err(LoadError::invalid(
                    "queries.max_staleness_seconds",
                    format!("query `{}` must allow a non-zero staleness", query.name),
                ));
            }

            Ok(QueryDefinition {
                name: query.name,
                sql: query.sql,
                params: query
                    .params
                    .into_iter()
                    .map(|param| ParamSpec {
                        name: param.name,
                        kind: param.kind,
                        nullable: param.nullable,
                    })
                    .collect(),
                max_staleness: Duration::from_secs(staleness),
                arguments: query
                    .arguments
                    .into_iter()
                    .map(|(name, value)| (name, value.into()))
                    .collect(),
                expected_columns: query.expected_columns,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    server: Option<String>,
    name: Option<String>,
    user: Option<String>,
    password: Option<String>,
    max_connections: Option<u32>,
    acquire_timeout_ms: Option<u64>,
    connect_timeout_seconds: Option<u32>,
    statement_timeout_seconds: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRefreshSettings {
    tick_seconds: Option<u32>,
    max_attempts: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    jitter: Option<f64>,
    warm_on_startup: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawQuerySettings {
    name: String,
    sql: String,
    #[serde(default)]
    params: Vec<RawParamSettings>,
    #[serde(default)]
    max_staleness_seconds: Option<u64>,
    #[serde(default)]
    arguments: BTreeMap<String, ArgumentValue>,
    #[serde(default)]
    expected_columns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawParamSettings {
    name: String,
    kind: ParamType,
    #[serde(default)]
    nullable: bool,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serial_test::serial;

    use crate::domain::types::SqlValue;

    use super::*;

    #[test]
    fn defaults_listen_on_dashboard_port() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
        assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
        assert_eq!(settings.refresh.max_attempts.get(), 3);
        assert!(settings.database.url.is_none());
        assert!(settings.queries.is_empty());
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = RawSettings::default();
        raw.server.port = Some(4000);
        raw.logging.level = Some("info".to_string());

        let overrides = ServeOverrides {
            server_port: Some(4321),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.server.addr.port(), 4321);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    }

    #[test]
    fn cli_json_logging_enforces_format() {
        let mut raw = RawSettings::default();
        let overrides = ServeOverrides {
            log_json: Some(true),
            ..Default::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn discrete_database_parts_compose_connection_string() {
        let mut raw = RawSettings::default();
        raw.database.server = Some("tcp:db.internal,1433".to_string());
        raw.database.name = Some("HR".to_string());
        raw.database.user = Some("report".to_string());
        raw.database.password = Some("secret".to_string());

        let settings = Settings::from_raw(raw).expect("valid settings");
        assert_eq!(
            settings.database.connection_string().expect("url"),
            "Server=tcp:db.internal,1433;Database=HR;User Id=report;Password=secret;Encrypt=yes;TrustServerCertificate=yes"
        );
    }

    #[test]
    fn explicit_url_wins_over_parts() {
        let mut raw = RawSettings::default();
        raw.database.server = Some("ignored".to_string());
        raw.database.url = Some("Server=primary;Database=HR".to_string());

        let settings = Settings::from_raw(raw).expect("valid settings");
        assert_eq!(
            settings.database.url.as_deref(),
            Some("Server=primary;Database=HR")
        );
    }

    #[test]
    fn debug_output_redacts_connection_string() {
        let mut raw = RawSettings::default();
        raw.database.url = Some("Server=db;Password=hunter2".to_string());
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert!(!format!("{:?}", settings.database).contains("hunter2"));
    }

    #[test]
    fn rejects_jitter_outside_unit_range() {
        let mut raw = RawSettings::default();
        raw.refresh.jitter = Some(1.5);
        let err = Settings::from_raw(raw).expect_err("invalid jitter");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "refresh.jitter",
                ..
            }
        ));
    }

    #[test]
    fn rejects_zero_staleness() {
        let mut raw = RawSettings::default();
        raw.queries.push(RawQuerySettings {
            name: "personnel".to_string(),
            sql: "SELECT 1".to_string(),
            params: Vec::new(),
            max_staleness_seconds: Some(0),
            arguments: BTreeMap::new(),
            expected_columns: Vec::new(),
        });
        assert!(Settings::from_raw(raw).is_err());
    }

    /// Config root holding the shipped defaults, independent of the working directory.
    fn config_root() -> tempfile::TempDir {
        let root = tempfile::tempdir().expect("temp dir");
        std::fs::create_dir(root.path().join("config")).expect("config dir");
        std::fs::write(
            root.path().join("config/default.toml"),
            "[server]\nhost = \"0.0.0.0\"\nport = 8050\n",
        )
        .expect("write defaults");
        root
    }

    fn config_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    /// Sets a process environment variable for the lifetime of the guard.
    struct EnvVar(&'static str);

    impl EnvVar {
        fn set(key: &'static str, value: &str) -> Self {
            // SAFETY: every test touching the environment runs under `#[serial]`.
            unsafe { std::env::set_var(key, value) };
            Self(key)
        }
    }

    impl Drop for EnvVar {
        fn drop(&mut self) {
            // SAFETY: see `EnvVar::set`.
            unsafe { std::env::remove_var(self.0) };
        }
    }

    #[test]
    #[serial]
    fn legacy_environment_sits_between_defaults_and_config_files() {
        let root = config_root();
        let file = config_file(
            r#"
[database]
name = "HR_Reporting"

[[queries]]
name = "personnel_military"
sql = "EXEC Rpt_Personnel_Military_Data @P1, @P2"
max_staleness_seconds = 600
expected_columns = ["Person_Instance_ID"]

[[queries.params]]
name = "company"
kind = "int"

[[queries.params]]
name = "branch"
kind = "int"
nullable = true

[queries.arguments]
company = 92
"#,
        );

        let cli = CliArgs::parse_from([
            "dashcache",
            "--config-file",
            file.path().to_str().expect("utf-8 path"),
            "queries",
        ]);
        let settings = load_with_env(&cli, root.path(), |key| match key {
            "DB_SERVER" => Some("legacy-host".to_string()),
            "DB_NAME" => Some("Legacy".to_string()),
            "PORT" => Some("9000".to_string()),
            _ => None,
        })
        .expect("settings");

        assert_eq!(settings.server.addr.port(), 9000);
        let url = settings.database.url.expect("composed url");
        assert!(url.starts_with("Server=legacy-host;Database=HR_Reporting;"));

        let query = settings
            .queries
            .iter()
            .find(|query| query.name == "personnel_military")
            .expect("query loaded");
        assert_eq!(query.max_staleness, Duration::from_secs(600));
        assert_eq!(query.params.len(), 2);
        assert!(query.params[1].nullable);
        assert_eq!(query.arguments.get("company"), Some(&SqlValue::Int(92)));
    }

    #[test]
    #[serial]
    fn shipped_defaults_apply_without_legacy_port() {
        let root = config_root();
        let cli = CliArgs::parse_from(["dashcache", "queries"]);
        let settings = load_with_env(&cli, root.path(), |_| None).expect("settings");
        assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
    }

    #[test]
    #[serial]
    fn prefixed_environment_beats_files_and_loses_to_cli() {
        let root = config_root();
        let file = config_file("[server]\nport = 8100\n");
        let path = file.path().to_str().expect("utf-8 path");
        let _port = EnvVar::set("DASHCACHE__SERVER__PORT", "7000");

        let cli = CliArgs::parse_from(["dashcache", "--config-file", path, "queries"]);
        let settings = load_with_env(&cli, root.path(), |key| {
            (key == "PORT").then(|| "9000".to_string())
        })
        .expect("settings");
        assert_eq!(settings.server.addr.port(), 7000);

        let cli = CliArgs::parse_from([
            "dashcache",
            "--config-file",
            path,
            "serve",
            "--server-port",
            "7100",
        ]);
        let settings = load_with_env(&cli, root.path(), |_| None).expect("settings");
        assert_eq!(settings.server.addr.port(), 7100);
    }

    #[test]
    #[serial]
    fn blank_legacy_values_are_ignored() {
        let root = config_root();
        let cli = CliArgs::parse_from(["dashcache", "queries"]);
        let settings = load_with_env(&cli, root.path(), |key| {
            (key == "DB_SERVER").then(|| "   ".to_string())
        })
        .expect("settings");
        assert!(settings.database.url.is_none());
    }

    #[test]
    fn rejects_backoff_beyond_one_hour() {
        let mut raw = RawSettings::default();
        raw.refresh.backoff_max_ms = Some(MAX_REFRESH_BACKOFF_MS + 1);
        let err = Settings::from_raw(raw).expect_err("backoff too long");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "refresh.backoff_max_ms",
                ..
            }
        ));
    }

    #[test]
    fn default_to_serve_command() {
        let args = CliArgs::parse_from(["dashcache"]);
        let command = args
            .command
            .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
        assert!(matches!(command, Command::Serve(_)));
    }

    #[test]
    fn parse_refresh_arguments() {
        let args = CliArgs::parse_from([
            "dashcache",
            "refresh",
            "--database-url",
            "Server=override",
            "--query",
            "personnel_military",
            "--query",
            "sales_by_region",
        ]);

        match args.command.expect("refresh command") {
            Command::Refresh(refresh) => {
                assert_eq!(
                    refresh.database.database_url.as_deref(),
                    Some("Server=override")
                );
                assert_eq!(
                    refresh.queries,
                    vec!["personnel_military".to_string(), "sales_by_region".to_string()]
                );
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn parse_serve_overrides() {
        let args = CliArgs::parse_from([
            "dashcache",
            "serve",
            "--server-host",
            "127.0.0.1",
            "--database-url",
            "Server=override",
            "--refresh-tick-seconds",
            "5",
        ]);

        match args.command.expect("serve command") {
            Command::Serve(serve) => {
                assert_eq!(serve.overrides.server_host.as_deref(), Some("127.0.0.1"));
                assert_eq!(
                    serve.overrides.database.database_url.as_deref(),
                    Some("Server=override")
                );
                assert_eq!(serve.overrides.refresh_tick_seconds, Some(5));
            }
            _ => panic!("wrong command parsed"),
        }
    }
}
