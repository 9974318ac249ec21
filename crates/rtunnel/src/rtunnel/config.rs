use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;
use url::Url;

use crate::rtunnel::tunnel::reverse::DEFAULT_KEEPALIVE;

pub const CONFIG_ENV: &str = "RTUNNEL_CONFIG";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(flag: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = flag {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(Path::new(&p))?,
            source: ConfigPathSource::Env,
        });
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }
    if p.is_dir() {
        return Ok(discover_config_path(p).unwrap_or_else(|| p.join("rtunnel.toml")));
    }
    Ok(p.to_path_buf())
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["rtunnel.toml", "rtunnel.yaml", "rtunnel.yml"]
        .into_iter()
        .map(|c| dir.join(c))
        .find(|p| p.is_file())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/rtunnel/rtunnel.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "rtunnel", "rtunnel")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("rtunnel.toml"))
    }
}

/// Where `keygen` writes when no path is given.
pub fn default_key_path() -> anyhow::Result<PathBuf> {
    let proj = ProjectDirs::from("dev", "rtunnel", "rtunnel")
        .context("config: resolve user data dir")?;
    Ok(proj.data_dir().join("id_ed25519"))
}

#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: Url,
    pub session_id: String,
    pub key_files: Vec<PathBuf>,
    pub keepalive: Duration,
    pub forward_addr: String,
    pub identity: Option<String>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    endpoint: String,
    session_id: String,
    key_files: StringOrVec,
    keepalive: Option<String>,
    forward_addr: String,
    identity: Option<String>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrVec {
    One(String),
    Many(Vec<String>),
}

impl StringOrVec {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrVec::One(s) => vec![s],
            StringOrVec::Many(v) => v,
        }
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let s = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {:?}", ext),
    };

    Config::from_file_config(fc, path)
}

impl Config {
    fn from_file_config(fc: FileConfig, config_path: &Path) -> anyhow::Result<Config> {
        let endpoint = Url::parse(fc.endpoint.trim())
            .with_context(|| format!("config: invalid endpoint {:?}", fc.endpoint))?;
        if endpoint.host_str().is_none_or(str::is_empty) {
            anyhow::bail!("config: endpoint {endpoint} has no host");
        }

        let session_id = fc.session_id.trim().to_string();
        if session_id.is_empty() {
            anyhow::bail!("config: session_id is required");
        }

        let base = config_path.parent().unwrap_or_else(|| Path::new("."));
        let key_files: Vec<PathBuf> = fc
            .key_files
            .into_vec()
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .map(|k| base.join(k))
            .collect();
        if key_files.is_empty() {
            anyhow::bail!("config: at least one key file is required");
        }

        let keepalive = match fc.keepalive.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_KEEPALIVE,
            Some(s) => humantime::parse_duration(s)
                .with_context(|| format!("config: invalid keepalive {s:?}"))?,
        };
        if keepalive.is_zero() {
            anyhow::bail!("config: keepalive must be positive");
        }

        let forward_addr = fc.forward_addr.trim().to_string();
        if forward_addr.is_empty() {
            anyhow::bail!("config: forward_addr is required");
        }

        let mut logging = LoggingConfig::default();
        if let Some(l) = fc.logging {
            if let Some(v) = l.level.filter(|v| !v.trim().is_empty()) {
                logging.level = v;
            }
            if let Some(v) = l.format.filter(|v| !v.trim().is_empty()) {
                logging.format = v;
            }
            if let Some(v) = l.output.filter(|v| !v.trim().is_empty()) {
                logging.output = v;
            }
            logging.add_source = l.add_source;
        }

        Ok(Config {
            endpoint,
            session_id,
            key_files,
            keepalive,
            forward_addr,
            identity: fc
                .identity
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            logging,
        })
    }
}
