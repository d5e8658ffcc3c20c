//! Configuration validation utilities.

use std::collections::HashSet;

use url::Url;

use super::error::{ConfigError, ConfigResult};
use super::schema::{BotConfig, GlobalConfig, TetherConfig, WebConfig};

/// Required length of a parental unlock code.
pub const PARENTAL_CODE_LENGTH: usize = 4;

/// Validates the entire configuration.
pub fn validate_config(config: &TetherConfig) -> ConfigResult<()> {
    validate_global_config(&config.global)?;
    validate_web_config(&config.web)?;
    validate_bots_config(&config.bots)?;
    Ok(())
}

fn validate_global_config(global: &GlobalConfig) -> ConfigResult<()> {
    if global.connection_timeout_secs == 0 {
        return Err(ConfigError::validation(
            "Connection timeout must be greater than 0",
        ));
    }

    if global.max_connections == 0 {
        return Err(ConfigError::validation(
            "Max connections must be greater than 0",
        ));
    }

    Ok(())
}

fn validate_web_config(web: &WebConfig) -> ConfigResult<()> {
    for (host, url) in web.hosts() {
        let parsed =
            Url::parse(url).map_err(|e| ConfigError::invalid_url(host, url, e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::invalid_url(
                host,
                url,
                "URL must use http or https",
            ));
        }
        if parsed.host_str().is_none() {
            return Err(ConfigError::invalid_url(host, url, "URL has no host"));
        }
    }

    for (universe, key) in &web.universe_keys {
        hex::decode(key.trim()).map_err(|e| ConfigError::InvalidUniverseKey {
            universe: universe.clone(),
            reason: e.to_string(),
        })?;
    }

    Ok(())
}

fn validate_bots_config(bots: &[BotConfig]) -> ConfigResult<()> {
    let mut seen = HashSet::new();

    for bot in bots {
        if bot.name.is_empty() {
            return Err(ConfigError::missing_field("bots.name"));
        }

        if !seen.insert(&bot.name) {
            return Err(ConfigError::DuplicateBotName(bot.name.clone()));
        }

        validate_bot_config(bot)?;
    }

    Ok(())
}

fn validate_bot_config(bot: &BotConfig) -> ConfigResult<()> {
    if bot.name.contains(['/', '\\']) {
        return Err(ConfigError::validation(format!(
            "Bot name '{}' cannot contain path separators",
            bot.name
        )));
    }

    if let Some(code) = bot.parental_code.as_deref()
        && !code.is_empty()
        && code.chars().count() != PARENTAL_CODE_LENGTH
    {
        return Err(ConfigError::validation(format!(
            "Parental code of bot '{}' must be {PARENTAL_CODE_LENGTH} characters long",
            bot.name
        )));
    }

    if bot.enabled && bot.login.is_empty() {
        return Err(ConfigError::missing_field(format!("bots.{}.login", bot.name)));
    }

    if bot.password_format.decode(&bot.password).is_none() {
        return Err(ConfigError::validation(format!(
            "Password of bot '{}' is not valid {:?}",
            bot.name, bot.password_format
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PasswordFormat;

    fn bot(name: &str) -> BotConfig {
        let mut bot = BotConfig::new(name);
        bot.login = "user".into();
        bot.password = "pass".into();
        bot
    }

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&TetherConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut config = TetherConfig::default();
        config.global.connection_timeout_secs = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_validate_duplicate_bot_name() {
        let config = TetherConfig {
            bots: vec![bot("main"), bot("main")],
            ..Default::default()
        };
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::DuplicateBotName(_))
        ));
    }

    #[test]
    fn test_validate_parental_code_length() {
        let mut main = bot("main");
        main.parental_code = Some("12345".into());
        let config = TetherConfig {
            bots: vec![main],
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_non_http_host() {
        let mut config = TetherConfig::default();
        config.web.store = "ftp://store.example.com".into();
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_validate_bad_universe_key_and_password() {
        let mut config = TetherConfig::default();
        config
            .web
            .universe_keys
            .insert("public".into(), "not-hex".into());
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::InvalidUniverseKey { .. })
        ));

        let mut main = bot("main");
        main.password_format = PasswordFormat::Base64;
        main.password = "***".into();
        let config = TetherConfig {
            bots: vec![main],
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());
    }
}
