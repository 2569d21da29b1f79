use anyhow::{Context, Result, bail};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8001;
pub const DEFAULT_TOKEN_EXPIRE_MINUTES: i64 = 43_200;
/// One year.
pub const MAX_TOKEN_EXPIRE_MINUTES: i64 = 525_600;
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";
pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_ESTIMATOR_TIMEOUT_SECS: u64 = 15;

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
}

impl Config {
    /// Resolve the data directory: `HEALTHISM_DATA_DIR` if set, otherwise the
    /// platform data directory.
    pub fn load() -> Result<Self> {
        if let Some(dir) = std::env::var_os("HEALTHISM_DATA_DIR") {
            return Self::at(PathBuf::from(dir));
        }
        let proj_dirs =
            ProjectDirs::from("", "", "healthism").context("Could not determine home directory")?;
        Self::at(proj_dirs.data_dir().to_path_buf())
    }

    pub fn at(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let db_path = data_dir.join("healthism.db");

        Ok(Config { db_path, data_dir })
    }

    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join("session.json")
    }

    /// Load the token signing secret from disk, or generate a new one.
    pub fn load_or_create_secret(&self) -> Result<String> {
        use rand::Rng;
        use std::fmt::Write;

        let path = self.data_dir.join("secret_key");

        if path.exists() {
            let key = std::fs::read_to_string(&path).context("Failed to read secret key file")?;
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Ok(key);
            }
        }

        let bytes: [u8; 32] = rand::rng().random();
        let key = bytes
            .iter()
            .fold(String::with_capacity(64), |mut acc: String, b| {
                let _ = write!(acc, "{b:02x}");
                acc
            });
        std::fs::write(&path, &key).context("Failed to write secret key file")?;
        restrict_permissions(&path)?;
        tracing::info!(path = %path.display(), "generated new token signing secret");
        Ok(key)
    }
}

/// Make a file readable by its owner only.
pub fn restrict_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct EstimatorSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub secret_key: String,
    pub token_expire_minutes: i64,
    pub estimator: EstimatorSettings,
}

impl ServerSettings {
    pub fn from_env(config: &Config) -> Result<Self> {
        Self::from_vars(config, |name| std::env::var(name).ok())
    }

    /// Build settings from a variable lookup. Blank values count as unset.
    pub fn from_vars(config: &Config, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| var(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let secret_key = match var("HEALTHISM_SECRET_KEY") {
            Some(key) => key,
            None => config.load_or_create_secret()?,
        };

        let token_expire_minutes = match var("HEALTHISM_TOKEN_EXPIRE_MINUTES") {
            Some(v) => v
                .parse::<i64>()
                .with_context(|| format!("Invalid HEALTHISM_TOKEN_EXPIRE_MINUTES '{v}'"))?,
            None => DEFAULT_TOKEN_EXPIRE_MINUTES,
        };
        if token_expire_minutes <= 0 {
            bail!("HEALTHISM_TOKEN_EXPIRE_MINUTES must be greater than 0");
        }
        if token_expire_minutes > MAX_TOKEN_EXPIRE_MINUTES {
            bail!("HEALTHISM_TOKEN_EXPIRE_MINUTES must be at most {MAX_TOKEN_EXPIRE_MINUTES}");
        }

        let timeout_secs = match var("HEALTHISM_ESTIMATOR_TIMEOUT_SECS") {
            Some(v) => v
                .parse::<u64>()
                .with_context(|| format!("Invalid HEALTHISM_ESTIMATOR_TIMEOUT_SECS '{v}'"))?,
            None => DEFAULT_ESTIMATOR_TIMEOUT_SECS,
        };

        Ok(Self {
            secret_key,
            token_expire_minutes,
            estimator: EstimatorSettings {
                api_key: var("OPENAI_API_KEY"),
                model: var("HEALTHISM_OPENAI_MODEL")
                    .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
                url: var("HEALTHISM_OPENAI_URL").unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string()),
                timeout: Duration::from_secs(timeout_secs.clamp(10, 15)),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_config_at_creates_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("healthism");
        let config = Config::at(dir.clone()).unwrap();
        assert!(dir.is_dir());
        assert_eq!(config.db_path, dir.join("healthism.db"));
        assert_eq!(config.session_path(), dir.join("session.json"));
    }

    #[test]
    fn test_secret_is_generated_once() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::at(tmp.path().to_path_buf()).unwrap();

        let first = config.load_or_create_secret().unwrap();
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));

        let second = config.load_or_create_secret().unwrap();
        assert_eq!(first, second);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(tmp.path().join("secret_key"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_server_settings_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::at(tmp.path().to_path_buf()).unwrap();
        let settings = ServerSettings::from_vars(&config, lookup(&[])).unwrap();

        assert_eq!(settings.token_expire_minutes, DEFAULT_TOKEN_EXPIRE_MINUTES);
        assert_eq!(settings.estimator.model, "gpt-4o");
        assert_eq!(settings.estimator.url, DEFAULT_OPENAI_URL);
        assert_eq!(settings.estimator.timeout, Duration::from_secs(15));
        assert!(settings.estimator.api_key.is_none());
        // falls back to the generated secret
        assert_eq!(settings.secret_key, config.load_or_create_secret().unwrap());
    }

    #[test]
    fn test_server_settings_from_vars() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::at(tmp.path().to_path_buf()).unwrap();
        let settings = ServerSettings::from_vars(
            &config,
            lookup(&[
                ("HEALTHISM_SECRET_KEY", "s3cret"),
                ("HEALTHISM_TOKEN_EXPIRE_MINUTES", "60"),
                ("OPENAI_API_KEY", "sk-test"),
                ("HEALTHISM_OPENAI_MODEL", "gpt-4o-mini"),
                ("HEALTHISM_ESTIMATOR_TIMEOUT_SECS", "30"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.secret_key, "s3cret");
        assert_eq!(settings.token_expire_minutes, 60);
        assert_eq!(settings.estimator.api_key.as_deref(), Some("sk-test"));
        assert_eq!(settings.estimator.model, "gpt-4o-mini");
        // clamped to the 10-15s window
        assert_eq!(settings.estimator.timeout, Duration::from_secs(15));
        assert!(!tmp.path().join("secret_key").exists());
    }

    #[test]
    fn test_server_settings_rejects_bad_numbers() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::at(tmp.path().to_path_buf()).unwrap();
        assert!(
            ServerSettings::from_vars(
                &config,
                lookup(&[
                    ("HEALTHISM_SECRET_KEY", "x"),
                    ("HEALTHISM_TOKEN_EXPIRE_MINUTES", "soon")
                ])
            )
            .is_err()
        );
        assert!(
            ServerSettings::from_vars(
                &config,
                lookup(&[
                    ("HEALTHISM_SECRET_KEY", "x"),
                    ("HEALTHISM_TOKEN_EXPIRE_MINUTES", "0")
                ])
            )
            .is_err()
        );
        assert!(
            ServerSettings::from_vars(
                &config,
                lookup(&[
                    ("HEALTHISM_SECRET_KEY", "x"),
                    ("HEALTHISM_TOKEN_EXPIRE_MINUTES", "9223372036854775807")
                ])
            )
            .is_err()
        );
        let settings = ServerSettings::from_vars(
            &config,
            lookup(&[
                ("HEALTHISM_SECRET_KEY", "x"),
                ("HEALTHISM_TOKEN_EXPIRE_MINUTES", "525600"),
            ]),
        )
        .unwrap();
        assert_eq!(settings.token_expire_minutes, MAX_TOKEN_EXPIRE_MINUTES);
    }
}
