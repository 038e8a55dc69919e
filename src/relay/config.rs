use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_LISTEN_ADDR: &str = ":3000";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
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

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps LANRELAY_CONFIG into the flag already; this only matters when
    // the resolver is driven without the CLI.
    if let Some(p) = std::env::var_os("LANRELAY_CONFIG") {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
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

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|_| p.join("lanrelay.toml")));
        }
        return Ok(p.to_path_buf());
    }

    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["lanrelay.toml", "lanrelay.yaml", "lanrelay.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no lanrelay.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/lanrelay/lanrelay.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("dev", "lanrelay", "lanrelay")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("lanrelay.toml"))
    }
}

/// Writes the default template to `path` when nothing exists there yet.
/// Returns `true` if a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!(
            "config: {} exists but is not a regular file",
            path.display()
        ),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn config_ext(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match config_ext(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match config_ext(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        other => anyhow::bail!("config: unsupported config extension {}", other),
    };

    Config::from_file_config(fc, std::env::var("PORT").ok())
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub logging: LoggingConfig,
    pub bridge: BridgeConfig,
    pub control: ControlConfig,
    pub sessions: SessionsConfig,
    pub discovery: DiscoveryConfig,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub connect_timeout: Duration,
    pub buffer_size: usize,
    /// Accept inbound `mc-data` frames and write them to the target socket.
    pub client_to_target: bool,
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub outbound_queue: usize,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct SessionsConfig {
    pub close_on_host_disconnect: bool,
    /// Zero disables idle expiry.
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Zero disables eviction.
    pub ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.into(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
            bridge: BridgeConfig {
                connect_timeout: Duration::from_millis(5000),
                buffer_size: 32 * 1024,
                client_to_target: true,
            },
            control: ControlConfig {
                outbound_queue: 256,
                max_frame_bytes: 1 << 20,
            },
            sessions: SessionsConfig {
                close_on_host_disconnect: true,
                idle_timeout: Duration::from_millis(30 * 60 * 1000),
            },
            discovery: DiscoveryConfig {
                ttl: Duration::from_millis(10 * 60 * 1000),
            },
            sweep_interval: Duration::from_millis(30_000),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    listen_addr: String,

    logging: Option<FileLogging>,
    bridge: Option<FileBridge>,
    control: Option<FileControl>,
    sessions: Option<FileSessions>,
    discovery: Option<FileDiscovery>,

    sweep_interval_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileBridge {
    connect_timeout_ms: Option<i64>,
    buffer_size: Option<i64>,
    client_to_target: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FileControl {
    outbound_queue: Option<i64>,
    max_frame_bytes: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileSessions {
    close_on_host_disconnect: Option<bool>,
    idle_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileDiscovery {
    ttl_ms: Option<i64>,
}

fn millis(v: i64) -> Duration {
    Duration::from_millis(v.max(0) as u64)
}

fn non_empty(s: &Option<String>) -> Option<String> {
    s.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl Config {
    fn from_file_config(fc: FileConfig, port_env: Option<String>) -> anyhow::Result<Config> {
        let mut cfg = Config::default();

        let listen = fc.listen_addr.trim();
        if !listen.is_empty() {
            cfg.listen_addr = listen.to_string();
        } else if let Some(port) = port_env.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            // Hosting platforms hand out the port through PORT.
            let port: u16 = port
                .parse()
                .with_context(|| format!("config: invalid PORT env value {port:?}"))?;
            cfg.listen_addr = format!(":{port}");
        }

        if let Some(l) = &fc.logging {
            if let Some(level) = non_empty(&l.level) {
                cfg.logging.level = level;
            }
            if let Some(fmt) = non_empty(&l.format) {
                cfg.logging.format = fmt;
            }
            if let Some(out) = non_empty(&l.output) {
                cfg.logging.output = out;
            }
            cfg.logging.add_source = l.add_source;
        }

        if let Some(b) = &fc.bridge {
            if let Some(ms) = b.connect_timeout_ms.filter(|v| *v > 0) {
                cfg.bridge.connect_timeout = millis(ms);
            }
            if let Some(n) = b.buffer_size.filter(|v| *v > 0) {
                cfg.bridge.buffer_size = n as usize;
            }
            if let Some(on) = b.client_to_target {
                cfg.bridge.client_to_target = on;
            }
        }

        if let Some(c) = &fc.control {
            if let Some(n) = c.outbound_queue.filter(|v| *v > 0) {
                cfg.control.outbound_queue = n as usize;
            }
            if let Some(n) = c.max_frame_bytes.filter(|v| *v > 0) {
                cfg.control.max_frame_bytes = n as usize;
            }
        }

        if let Some(s) = &fc.sessions {
            if let Some(on) = s.close_on_host_disconnect {
                cfg.sessions.close_on_host_disconnect = on;
            }
            if let Some(ms) = s.idle_timeout_ms {
                cfg.sessions.idle_timeout = millis(ms);
            }
        }

        if let Some(d) = &fc.discovery {
            if let Some(ms) = d.ttl_ms {
                cfg.discovery.ttl = millis(ms);
            }
        }

        if let Some(ms) = fc.sweep_interval_ms.filter(|v| *v > 0) {
            cfg.sweep_interval = millis(ms);
        }
        if cfg.sweep_interval < Duration::from_millis(100) {
            cfg.sweep_interval = Duration::from_millis(100);
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# lanrelay configuration (auto-generated)
#
# This file was created because lanrelay could not find a configuration file at
# the resolved config path. The defaults below are runnable without edits.
#
# Hosts connect over WebSocket (ws://<relay>/ or ws://<relay>/ws) and register
# their LAN game server; clients join a session and get its bytes relayed as
# base64 `mc-data` frames.

# Leave empty to honour the PORT environment variable (falls back to :3000).
listen_addr = ""

sweep_interval_ms = 30000

[bridge]
connect_timeout_ms = 5000
buffer_size = 32768
client_to_target = true

[control]
outbound_queue = 256
max_frame_bytes = 1048576

[sessions]
close_on_host_disconnect = true
idle_timeout_ms = 1800000

[discovery]
ttl_ms = 600000

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# lanrelay configuration (auto-generated)
#
# This file was created because lanrelay could not find a configuration file at
# the resolved config path. The defaults below are runnable without edits.
#
# Hosts connect over WebSocket (ws://<relay>/ or ws://<relay>/ws) and register
# their LAN game server; clients join a session and get its bytes relayed as
# base64 `mc-data` frames.

# Leave empty to honour the PORT environment variable (falls back to :3000).
listen_addr: ""

sweep_interval_ms: 30000

bridge:
  connect_timeout_ms: 5000
  buffer_size: 32768
  client_to_target: true

control:
  outbound_queue: 256
  max_frame_bytes: 1048576

sessions:
  close_on_host_disconnect: true
  idle_timeout_ms: 1800000

discovery:
  ttl_ms: 600000

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false
"#;
