/// Configuration management
use crate::error::{MirrorError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PORT: u16 = 1358;
const ATTACHMENTS_SUBDIR: &str = "Library/Messages/Attachments";

/// Mirror configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source store file (the chat log database)
    pub db_path: PathBuf,

    /// How often the refresh engine checks the source file
    pub poll_interval: Duration,

    /// Forced refresh period, even when the source file looks unchanged
    pub rescan_interval: Duration,

    /// HTTP listen address
    pub listen_addr: SocketAddr,

    /// Directory served under /file/
    pub attachments_dir: PathBuf,

    /// Per-conversation message window
    pub message_limit: usize,

    /// Deadline applied to every store query
    pub query_timeout: Duration,

    /// Max pooled connections to the source store
    pub pool_size: u32,

    /// Capacity of the flat attachment table
    pub attachment_cache_size: usize,

    /// Service/channel whose conversations are mirrored
    pub service: String,

    /// Debug-level logging
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::new(),
            poll_interval: Duration::from_millis(2000),
            rescan_interval: Duration::from_secs(60),
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            attachments_dir: default_attachments_dir(),
            message_limit: 50,
            query_timeout: Duration::from_secs(5),
            pool_size: 4,
            attachment_cache_size: 4096,
            service: "iMessage".to_string(),
            verbose: false,
        }
    }
}

fn default_attachments_dir() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(ATTACHMENTS_SUBDIR),
        Err(_) => PathBuf::from(ATTACHMENTS_SUBDIR),
    }
}

fn usage(program: &str) -> String {
    format!(
        "Usage: {} --db <path> [--interval <ms>] [--rescan-interval <ms>] [--port <port>] [--bind <addr>] [--attachments-dir <path>] [--message-limit <n>] [--query-timeout-ms <ms>] [--pool-size <n>] [--attachment-cache <n>] [--service <name>] [--verbose]",
        program
    )
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(|s| s.as_str())
        .ok_or_else(|| MirrorError::Config(format!("{} requires an argument", flag)))
}

fn parse_number<T: std::str::FromStr>(value: &str, flag: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| MirrorError::Config(format!("{} must be a valid number, got {:?}", flag, value)))
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        let program = args.first().map(|s| s.as_str()).unwrap_or("chatmirror");
        let mut config = Self::default();
        let mut db_path: Option<PathBuf> = None;
        let mut port = DEFAULT_PORT;
        let mut bind = config.listen_addr.ip();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--db" => {
                    db_path = Some(PathBuf::from(flag_value(args, i, "--db")?));
                    i += 2;
                }
                "--interval" => {
                    let ms: u64 = parse_number(flag_value(args, i, "--interval")?, "--interval")?;
                    config.poll_interval = Duration::from_millis(ms);
                    i += 2;
                }
                "--rescan-interval" => {
                    let ms: u64 = parse_number(
                        flag_value(args, i, "--rescan-interval")?,
                        "--rescan-interval",
                    )?;
                    config.rescan_interval = Duration::from_millis(ms);
                    i += 2;
                }
                "--port" => {
                    port = parse_number(flag_value(args, i, "--port")?, "--port")?;
                    i += 2;
                }
                "--bind" => {
                    let value = flag_value(args, i, "--bind")?;
                    bind = value.parse::<IpAddr>().map_err(|_| {
                        MirrorError::Config(format!("--bind must be an IP address, got {:?}", value))
                    })?;
                    i += 2;
                }
                "--attachments-dir" => {
                    config.attachments_dir =
                        PathBuf::from(flag_value(args, i, "--attachments-dir")?);
                    i += 2;
                }
                "--message-limit" => {
                    config.message_limit =
                        parse_number(flag_value(args, i, "--message-limit")?, "--message-limit")?;
                    i += 2;
                }
                "--query-timeout-ms" => {
                    let ms: u64 = parse_number(
                        flag_value(args, i, "--query-timeout-ms")?,
                        "--query-timeout-ms",
                    )?;
                    config.query_timeout = Duration::from_millis(ms);
                    i += 2;
                }
                "--pool-size" => {
                    config.pool_size =
                        parse_number(flag_value(args, i, "--pool-size")?, "--pool-size")?;
                    i += 2;
                }
                "--attachment-cache" => {
                    config.attachment_cache_size = parse_number(
                        flag_value(args, i, "--attachment-cache")?,
                        "--attachment-cache",
                    )?;
                    i += 2;
                }
                "--service" => {
                    config.service = flag_value(args, i, "--service")?.to_string();
                    i += 2;
                }
                "--verbose" | "--debug" => {
                    config.verbose = true;
                    i += 1;
                }
                other => {
                    return Err(MirrorError::Config(format!(
                        "Unknown argument {:?}\n{}",
                        other,
                        usage(program)
                    )));
                }
            }
        }

        // Env overrides (nice for launchd plists)
        if db_path.is_none() {
            db_path = std::env::var("CHATMIRROR_DB").ok().map(PathBuf::from);
        }
        if let Some(ms) = std::env::var("CHATMIRROR_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(p) = std::env::var("CHATMIRROR_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        {
            port = p;
        }
        if let Ok(dir) = std::env::var("CHATMIRROR_ATTACHMENTS_DIR") {
            config.attachments_dir = PathBuf::from(dir);
        }
        if std::env::var("CHATMIRROR_VERBOSE").is_ok() {
            config.verbose = true;
        }

        config.db_path = db_path.ok_or_else(|| {
            MirrorError::Config(format!("--db is required\n{}", usage(program)))
        })?;
        config.listen_addr = SocketAddr::new(bind, port);

        Ok(config)
    }

    /// Check startup preconditions. Failing here is the only fatal path.
    pub fn validate(&self) -> Result<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(MirrorError::Config("source store path is empty".to_string()));
        }
        if !self.db_path.is_file() {
            return Err(MirrorError::Config(format!(
                "source store {} does not exist",
                self.db_path.display()
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(MirrorError::Config("--interval must be positive".to_string()));
        }
        if self.query_timeout.is_zero() {
            return Err(MirrorError::Config("--query-timeout-ms must be positive".to_string()));
        }
        if self.pool_size == 0 {
            return Err(MirrorError::Config("--pool-size must be at least 1".to_string()));
        }
        if self.message_limit == 0 {
            return Err(MirrorError::Config("--message-limit must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_args(&args(&["chatmirror", "--db", "/tmp/chat.db"])).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/chat.db"));
        assert_eq!(config.poll_interval, Duration::from_millis(2000));
        assert_eq!(config.message_limit, 50);
        assert_eq!(config.service, "iMessage");
    }

    #[test]
    fn test_flags_parsed() {
        let config = Config::from_args(&args(&[
            "chatmirror",
            "--db",
            "/tmp/chat.db",
            "--interval",
            "500",
            "--bind",
            "0.0.0.0",
            "--port",
            "9000",
            "--message-limit",
            "10",
            "--verbose",
        ]))
        .unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.listen_addr, "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.message_limit, 10);
        assert!(config.verbose);
    }

    #[test]
    fn test_bad_interval_rejected() {
        let err = Config::from_args(&args(&["chatmirror", "--db", "x", "--interval", "soon"]))
            .unwrap_err();
        assert!(matches!(err, MirrorError::Config(_)));
    }

    #[test]
    fn test_unknown_flag_rejected() {
        assert!(Config::from_args(&args(&["chatmirror", "--db", "x", "--bogus"])).is_err());
    }

    #[test]
    fn test_missing_file_fails_validation() {
        let mut config = Config::default();
        config.db_path = PathBuf::from("/definitely/not/here/chat.db");
        assert!(matches!(config.validate(), Err(MirrorError::Config(_))));
    }
}
