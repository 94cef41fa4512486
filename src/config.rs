// Application configuration, loaded from environment variables and CLI flags.

use std::path::PathBuf;

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .map(|v| v.parse().unwrap_or_else(|_| panic!("{key} must parse")))
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(default)
}

fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
    args.windows(2).find_map(|pair| {
        if pair[0] == flag {
            Some(pair[1].clone())
        } else {
            None
        }
    })
}

/// Endpoints shared by both binaries: the submissions database, the game
/// server, and the blob store.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub database_url: String,
    pub gameserver_host: String,
    pub gameserver_tcpport: u16,
    pub gameserver_webport: u16,
    pub droopy_url: String,
    pub droopy_creds: Option<(String, String)>,
}

impl Endpoints {
    fn load() -> Self {
        let droopy_creds = std::env::var("DROOPY_CREDS").ok().and_then(|v| {
            let mut parts = v.splitn(2, ':');
            match (parts.next(), parts.next()) {
                (Some(u), Some(p)) => Some((u.to_string(), p.to_string())),
                _ => None,
            }
        });

        Endpoints {
            database_url: env_string("DATABASE_URL", "sqlite:arena.db?mode=rwc"),
            gameserver_host: env_string("GAMESERVER_HOST", "localhost"),
            gameserver_tcpport: env_parsed("GAMESERVER_TCPPORT", 7777),
            gameserver_webport: env_parsed("GAMESERVER_WEBPORT", 3080),
            droopy_url: env_string("DROOPY_URL", "http://localhost:8080/"),
            droopy_creds,
        }
    }

    pub fn gameserver_base_url(&self) -> String {
        format!("http://{}:{}", self.gameserver_host, self.gameserver_webport)
    }
}

/// Configuration for the match-runner binary.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub endpoints: Endpoints,
    pub game_name: String,
    pub dockerfile_path: PathBuf,
    pub submission_cache_path: PathBuf,
    pub logfile_path: PathBuf,
    pub lookback_seconds: i64,
    pub container_cpu: String,
    pub container_ram: String,
    pub match_timeout: u64,
    pub run_forever: bool,
    pub admin_port: u16,
    pub match_status_poll_tries: u32,
    pub match_status_poll_base_seconds: f64,
}

impl RunnerConfig {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// CLI flags:
    /// - `--admin-port <PORT>` overrides `ADMIN_PORT`.
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();

        let admin_port = parse_cli_value(&args, "--admin-port")
            .and_then(|v| v.parse().ok())
            .or_else(|| std::env::var("ADMIN_PORT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(9090);

        RunnerConfig {
            endpoints: Endpoints::load(),
            game_name: env_string("GAME_NAME", "Anarchy"),
            dockerfile_path: env_path("DOCKERFILE_PATH", "./dockerfiles"),
            submission_cache_path: env_path("SUBMISSION_CACHE_PATH", "./cache/submissions"),
            logfile_path: env_path("LOGFILE_PATH", "./cache/logs"),
            lookback_seconds: env_parsed("LOOKBACK_SECONDS", 3600),
            container_cpu: env_string("CONTAINER_CPU", "1.0"),
            container_ram: env_string("CONTAINER_RAM", "512m"),
            match_timeout: env_parsed("MATCH_TIMEOUT", 600),
            run_forever: env_bool("RUN_FOREVER", true),
            admin_port,
            match_status_poll_tries: env_parsed("MATCH_STATUS_POLL_TRIES", 5),
            match_status_poll_base_seconds: env_parsed("MATCH_STATUS_POLL_BASE_SECONDS", 1.0),
        }
    }
}

/// Configuration for the bracket-engine binary.
#[derive(Debug, Clone)]
pub struct BracketConfig {
    pub endpoints: Endpoints,
    pub n_elimination: u32,
    pub best_of: u32,
    pub reuse_old_games: bool,
    pub refresh_seconds: u64,
    pub output_file: PathBuf,
    pub admin_port: u16,
}

impl BracketConfig {
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();

        let admin_port = parse_cli_value(&args, "--admin-port")
            .and_then(|v| v.parse().ok())
            .or_else(|| std::env::var("ADMIN_PORT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(9091);

        BracketConfig {
            endpoints: Endpoints::load(),
            n_elimination: env_parsed("N_ELIMINATION", 1),
            best_of: env_parsed("BEST_OF", 1),
            reuse_old_games: env_bool("REUSE_OLD_GAMES", false),
            refresh_seconds: env_parsed("REFRESH_SECONDS", 30),
            output_file: env_path("OUTPUT_FILE", "bracket.dot"),
            admin_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_bool_defaults() {
        assert!(env_bool("ARENA_CONFIG_TEST_MISSING_BOOL", true));
        assert!(!env_bool("ARENA_CONFIG_TEST_MISSING_BOOL", false));
    }

    #[test]
    fn test_env_parsed_default() {
        let v: u64 = env_parsed("ARENA_CONFIG_TEST_MISSING_U64", 42);
        assert_eq!(v, 42);
    }

    #[test]
    fn test_parse_cli_value() {
        let args = vec!["bin".to_string(), "--port".to_string(), "8080".to_string()];
        assert_eq!(parse_cli_value(&args, "--port"), Some("8080".to_string()));
        assert_eq!(parse_cli_value(&args, "--missing"), None);
    }

    #[test]
    fn test_droopy_creds_parsing() {
        std::env::set_var("ARENA_CONFIG_TEST_CREDS", "user:pass");
        let v = std::env::var("ARENA_CONFIG_TEST_CREDS").ok().and_then(|v| {
            let mut parts = v.splitn(2, ':');
            match (parts.next(), parts.next()) {
                (Some(u), Some(p)) => Some((u.to_string(), p.to_string())),
                _ => None,
            }
        });
        assert_eq!(v, Some(("user".to_string(), "pass".to_string())));
        std::env::remove_var("ARENA_CONFIG_TEST_CREDS");
    }
}
