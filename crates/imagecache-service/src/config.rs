use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::caching::DEFAULT_TTL;

/// The origin serving a random image on every request.
const DEFAULT_ORIGIN_URL: &str = "https://picsum.photos/300";

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the service.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "imagecache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// The directory holding the cached image.
    pub image_dir: PathBuf,

    /// The URL the image is fetched from whenever the cached one is stale.
    pub origin_url: Url,

    /// The name of the cached image file.
    ///
    /// Artifact files are named after its stem and extension.
    pub cached_image_name: String,

    /// How long a fetched image is served before it is fetched again.
    #[serde(with = "humantime_serde")]
    pub cache_duration: Duration,

    /// Origins allowed to make cross-origin requests. `*` allows any origin.
    pub allowed_origins: Vec<String>,

    /// The timeout for establishing a connection to the origin.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The maximum time a single download from the origin may take.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// Serve the previously cached image if refreshing it fails.
    ///
    /// By default, the error is returned to the caller instead.
    pub serve_stale_on_error: bool,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,
}

/// Default value for the "image_dir" configuration: `image` next to the working directory.
fn default_image_dir() -> PathBuf {
    match env::current_dir() {
        Ok(cwd) => cwd.parent().unwrap_or(&cwd).join("image"),
        Err(_) => PathBuf::from("image"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: "127.0.0.1:8080".to_owned(),
            image_dir: default_image_dir(),
            origin_url: DEFAULT_ORIGIN_URL.parse().unwrap(),
            cached_image_name: "current_image.jpg".to_owned(),
            cache_duration: DEFAULT_TTL,
            allowed_origins: vec!["*".to_owned()],
            connect_timeout: Duration::from_secs(1),
            max_download_timeout: Duration::from_secs(30),
            serve_stale_on_error: false,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
        }
    }
}

impl Config {
    /// Loads the configuration from `path`, or the defaults if no path is given.
    ///
    /// Environment overrides are applied on top in both cases. The result still needs to be
    /// [validated](Self::validate).
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            )?,
            None => Config::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// Applies the environment variables understood by existing deployments.
    ///
    /// Variables that are set but empty keep the current value.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| var(key).filter(|value| !value.trim().is_empty());

        if let Some(port) = var("PORT") {
            self.bind = format!("0.0.0.0:{port}");
        }
        if let Some(image_dir) = var("IMAGE_DIR") {
            self.image_dir = PathBuf::from(image_dir);
        }
        if let Some(url) = var("IMAGE_URL") {
            self.origin_url = url.parse().context("invalid IMAGE_URL")?;
        }
        if let Some(origins) = var("ALLOWED_ORIGINS") {
            self.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if let Some(name) = var("CACHED_IMAGE_NAME") {
            self.cached_image_name = name;
        }
        if let Some(minutes) = var("CACHE_DURATION_MINUTES") {
            // invalid values are replaced in `validate`
            self.cache_duration = match minutes.trim().parse::<u64>() {
                Ok(minutes) => Duration::from_secs(minutes.saturating_mul(60)),
                Err(_) => Duration::ZERO,
            };
        }
        Ok(())
    }

    /// Replaces settings that would make the service misbehave with their defaults.
    ///
    /// This logs every replacement, and should therefore run once logging is set up.
    pub fn validate(&mut self) {
        if self.cache_duration.is_zero() {
            tracing::warn!(
                "Cache duration must be a positive number of minutes, using the default of {}",
                humantime::format_duration(DEFAULT_TTL)
            );
            self.cache_duration = DEFAULT_TTL;
        }
    }

    /// Whether cross-origin requests from any origin are allowed.
    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origins.iter().any(|origin| origin == "*")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.bind, "127.0.0.1:8080");
        assert_eq!(cfg.origin_url.as_str(), "https://picsum.photos/300");
        assert_eq!(cfg.cached_image_name, "current_image.jpg");
        assert_eq!(cfg.cache_duration, Duration::from_secs(600));
        assert!(cfg.allows_any_origin());
        assert!(cfg.image_dir.ends_with("image"));
        assert!(!cfg.serve_stale_on_error);
    }

    #[test]
    fn test_partial_config() {
        let yaml = r#"
            cache_duration: 5m
            origin_url: http://localhost:1234/image.png
            allowed_origins:
              - http://localhost:3000
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        let default_cfg = Config::default();

        assert_eq!(cfg.cache_duration, Duration::from_secs(300));
        assert_eq!(cfg.origin_url.as_str(), "http://localhost:1234/image.png");
        assert_eq!(cfg.allowed_origins, vec!["http://localhost:3000"]);
        assert!(!cfg.allows_any_origin());
        assert_eq!(cfg.max_download_timeout, default_cfg.max_download_timeout);
        assert_eq!(cfg.connect_timeout, default_cfg.connect_timeout);
        assert_eq!(cfg.cached_image_name, default_cfg.cached_image_name);
    }

    #[test]
    fn test_logging_config() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert!(cfg.logging.enable_backtraces);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            not_a_setting: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = Config::default();
        cfg.apply_env(vars(&[
            ("PORT", "9000"),
            ("IMAGE_DIR", "/data/image"),
            ("IMAGE_URL", "http://example.com/cat.png"),
            ("ALLOWED_ORIGINS", "http://a.example, http://b.example,"),
            ("CACHED_IMAGE_NAME", "cat.png"),
            ("CACHE_DURATION_MINUTES", "3"),
        ]))
        .unwrap();

        assert_eq!(cfg.bind, "0.0.0.0:9000");
        assert_eq!(cfg.image_dir, PathBuf::from("/data/image"));
        assert_eq!(cfg.origin_url.as_str(), "http://example.com/cat.png");
        assert_eq!(
            cfg.allowed_origins,
            vec!["http://a.example", "http://b.example"]
        );
        assert_eq!(cfg.cached_image_name, "cat.png");
        assert_eq!(cfg.cache_duration, Duration::from_secs(180));
    }

    #[test]
    fn test_invalid_cache_duration_falls_back() {
        for value in ["0", "-5", "ten"] {
            let mut cfg = Config::default();
            cfg.cache_duration = Duration::from_secs(1);
            cfg.apply_env(vars(&[("CACHE_DURATION_MINUTES", value)]))
                .unwrap();
            cfg.validate();
            assert_eq!(cfg.cache_duration, DEFAULT_TTL, "value {value:?}");
        }

        let yaml = r#"
            cache_duration: 0s
        "#;
        let mut cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        cfg.validate();
        assert_eq!(cfg.cache_duration, DEFAULT_TTL);
    }

    #[test]
    fn test_empty_env_values_keep_defaults() {
        let mut cfg = Config::default();
        cfg.apply_env(vars(&[
            ("PORT", ""),
            ("IMAGE_DIR", ""),
            ("IMAGE_URL", ""),
            ("ALLOWED_ORIGINS", " "),
            ("CACHED_IMAGE_NAME", ""),
            ("CACHE_DURATION_MINUTES", ""),
        ]))
        .unwrap();

        let default_cfg = Config::default();
        assert_eq!(cfg.bind, default_cfg.bind);
        assert_eq!(cfg.image_dir, default_cfg.image_dir);
        assert_eq!(cfg.origin_url, default_cfg.origin_url);
        assert_eq!(cfg.allowed_origins, vec!["*"]);
        assert!(cfg.allows_any_origin());
        assert_eq!(cfg.cached_image_name, "current_image.jpg");
        assert_eq!(cfg.cache_duration, DEFAULT_TTL);
    }

    #[test]
    fn test_invalid_image_url() {
        let mut cfg = Config::default();
        let result = cfg.apply_env(vars(&[("IMAGE_URL", "not a url")]));
        assert!(result.is_err());
    }
}
