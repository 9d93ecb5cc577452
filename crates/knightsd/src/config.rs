//! Server configuration file.
//!
//! Plain `Key = Value` lines; `#` starts a comment. Unknown keys are
//! fatal, with the line number in the error.

/// Configuration error, carrying the offending line number.
#[derive(Debug, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct ConfigError {
    pub line: usize,
    pub message: String,
}

impl ConfigError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        ConfigError {
            line,
            message: message.into(),
        }
    }
}

/// Parsed server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub description: String,
    pub motd_file: Option<String>,
    pub old_motd_file: Option<String>,
    pub max_players: u32,
    pub max_games: u32,
    pub use_broadcast: bool,
    pub knights_data_dir: Option<String>,
    pub log_file: Option<String>,
    pub password: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 16399,
            description: String::new(),
            motd_file: None,
            old_motd_file: None,
            max_players: 100,
            max_games: 9_999_999, // effectively unlimited
            use_broadcast: true,
            knights_data_dir: None,
            log_file: None,
            password: None,
        }
    }
}

fn parse_bool(line: usize, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "t" | "true" | "y" | "yes" | "1" => Ok(true),
        "f" | "false" | "n" | "no" | "0" => Ok(false),
        _ => Err(ConfigError::new(
            line,
            "Boolean value (true or false) expected",
        )),
    }
}

fn parse_int<T: std::str::FromStr>(line: usize, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::new(line, "Integer expected"))
}

impl Config {
    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::new(line_no, "Syntax error"));
            };
            let key = key.trim();
            let value = value.trim();

            match key.to_ascii_lowercase().as_str() {
                "port" => config.port = parse_int(line_no, value)?,
                "description" => config.description = value.to_owned(),
                "motdfile" => config.motd_file = Some(value.to_owned()),
                "oldmotdfile" => config.old_motd_file = Some(value.to_owned()),
                "maxplayers" => {
                    config.max_players = parse_int(line_no, value)?;
                    if config.max_players < 2 {
                        return Err(ConfigError::new(line_no, "MaxPlayers must be at least 2"));
                    }
                }
                "maxgames" => {
                    config.max_games = parse_int(line_no, value)?;
                    if config.max_games < 1 {
                        return Err(ConfigError::new(line_no, "MaxGames must be at least 1"));
                    }
                }
                "usebroadcast" => config.use_broadcast = parse_bool(line_no, value)?,
                "knightsdatadir" => config.knights_data_dir = Some(value.to_owned()),
                "logfile" => config.log_file = Some(value.to_owned()),
                "password" => config.password = Some(value.to_owned()),
                _ => {
                    return Err(ConfigError::new(
                        line_no,
                        format!("Unknown setting: {key}"),
                    ));
                }
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_overrides() {
        let config = Config::parse(
            "# comment\n\
             Port = 12345\n\
             MaxGames = 4\n\
             UseBroadcast = no  # trailing comment\n\
             Description = My Server\n",
        )
        .unwrap();
        assert_eq!(config.port, 12345);
        assert_eq!(config.max_games, 4);
        assert!(!config.use_broadcast);
        assert_eq!(config.description, "My Server");
        assert_eq!(config.max_players, 100);
    }

    #[test]
    fn unknown_key_is_fatal_with_line_number() {
        let err = Config::parse("Port = 1\nColour = red\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("Colour"));
    }

    #[test]
    fn bad_values_are_rejected() {
        assert_eq!(Config::parse("Port = lots\n").unwrap_err().line, 1);
        assert!(Config::parse("MaxPlayers = 1\n").is_err());
        assert!(Config::parse("MaxGames = 0\n").is_err());
        assert!(Config::parse("nonsense\n").is_err());
    }
}
