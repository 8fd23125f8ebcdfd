//! Configuration file loading.
//!
//! INI-style as specified in section 6: one `[user]` section, one
//! `[server]` section, and one section per project. Grounded in shape on
//! the original's `ConfigParser`-based loader (`baboon/config.py`, kept
//! source) and in loader-structure idiom (validated typed struct, dedicated
//! `ConfigError`, default-search-path helper) on the teacher's
//! `config.rs`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ini::Ini;
use thiserror::Error;

pub const DEFAULT_MAX_STANZA_SIZE: usize = 65536;

/// Neither `master` nor `streamer` carry an explicit port in the
/// configuration file, matching the original's reliance on its XMPP
/// library's defaults (standard client-to-server port, and the `xep_0065`
/// plugin's default SOCKS5 streamer port).
pub const DEFAULT_XMPP_PORT: u16 = 5222;
pub const DEFAULT_STREAMER_PORT: u16 = 7777;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found at {0}")]
    NotFound(PathBuf),

    #[error("failed to parse configuration file {path}: {source}")]
    Parse { path: PathBuf, source: ini::Error },

    #[error("missing required section [{0}]")]
    MissingSection(String),

    #[error("missing or empty required field '{field}' in section [{section}]")]
    MissingField { section: String, field: String },

    #[error("invalid value for '{field}' in section [{section}]: {value}")]
    InvalidValue { section: String, field: String, value: String },
}

#[derive(Debug, Clone)]
pub struct UserConfig {
    pub jid: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub master: String,
    pub pubsub: String,
    pub streamer: String,
    pub max_stanza_size: usize,
    /// Root directory the daemon stores every project's per-user mirrors
    /// under (`<working_dir>/<project>/<userJID>/`). Unused by the
    /// watcher, which never holds a server-side mirror of its own.
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScmKind {
    Git,
}

#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub name: String,
    pub local_path: PathBuf,
    pub scm_kind: ScmKind,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct Configuration {
    pub user: UserConfig,
    pub server: ServerConfig,
    pub projects: Vec<ProjectConfig>,
    pub config_path: PathBuf,
}

impl Configuration {
    pub fn enabled_projects(&self) -> impl Iterator<Item = &ProjectConfig> {
        self.projects.iter().filter(|p| p.enabled)
    }

    pub fn project(&self, name: &str) -> Option<&ProjectConfig> {
        self.projects.iter().find(|p| p.name == name)
    }
}

/// Default search paths, checked in order, mirroring the teacher's
/// `config_search_paths`.
pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".baboonrc"));
    }
    paths.push(PathBuf::from("/etc/baboonrc"));
    paths
}

pub fn find_config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return if path.exists() {
            Ok(path.to_path_buf())
        } else {
            Err(ConfigError::NotFound(path.to_path_buf()))
        };
    }
    for candidate in config_search_paths() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(ConfigError::NotFound(PathBuf::from("~/.baboonrc")))
}

pub fn load_config(path: &Path) -> Result<Configuration, ConfigError> {
    let ini = Ini::load_from_file(path).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_config(&ini, path)
}

fn required<'a>(ini: &'a Ini, section: &str, field: &str) -> Result<&'a str, ConfigError> {
    let value = ini
        .section(Some(section))
        .ok_or_else(|| ConfigError::MissingSection(section.to_string()))?
        .get(field)
        .ok_or_else(|| ConfigError::MissingField {
            section: section.to_string(),
            field: field.to_string(),
        })?;
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField {
            section: section.to_string(),
            field: field.to_string(),
        });
    }
    Ok(value)
}

fn parse_config(ini: &Ini, path: &Path) -> Result<Configuration, ConfigError> {
    let user = UserConfig {
        jid: required(ini, "user", "jid")?.to_string(),
        password: required(ini, "user", "passwd")?.to_string(),
    };

    let server_section = ini.section(Some("server")).ok_or_else(|| ConfigError::MissingSection("server".into()))?;
    let max_stanza_size = match server_section.get("max_stanza_size") {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse::<usize>().map_err(|_| ConfigError::InvalidValue {
            section: "server".into(),
            field: "max_stanza_size".into(),
            value: raw.to_string(),
        })?,
        _ => DEFAULT_MAX_STANZA_SIZE,
    };
    let working_dir_raw = server_section.get("working_dir").unwrap_or("~/.baboon-data");
    let working_dir = PathBuf::from(shellexpand::tilde(working_dir_raw).into_owned());

    let server = ServerConfig {
        master: required(ini, "server", "master")?.to_string(),
        pubsub: required(ini, "server", "pubsub")?.to_string(),
        streamer: required(ini, "server", "streamer")?.to_string(),
        max_stanza_size,
        working_dir,
    };

    let reserved = ["user", "server", "DEFAULT"];
    let mut projects = Vec::new();
    let mut seen_names: HashMap<String, ()> = HashMap::new();

    for section_name in ini.sections() {
        let Some(name) = section_name else { continue };
        if reserved.contains(&name) {
            continue;
        }
        if seen_names.contains_key(name) {
            continue;
        }
        seen_names.insert(name.to_string(), ());

        let properties = ini.section(Some(name)).expect("section just yielded by sections() must exist");

        let raw_path = properties.get("path").ok_or_else(|| ConfigError::MissingField {
            section: name.to_string(),
            field: "path".into(),
        })?;
        if raw_path.trim().is_empty() {
            return Err(ConfigError::MissingField {
                section: name.to_string(),
                field: "path".into(),
            });
        }
        let expanded = shellexpand::tilde(raw_path).into_owned();

        let scm_raw = properties.get("scm").ok_or_else(|| ConfigError::MissingField {
            section: name.to_string(),
            field: "scm".into(),
        })?;
        let scm_kind = match scm_raw.trim() {
            "git" => ScmKind::Git,
            other => {
                return Err(ConfigError::InvalidValue {
                    section: name.to_string(),
                    field: "scm".into(),
                    value: other.to_string(),
                })
            }
        };

        let enable_raw = properties.get("enable").unwrap_or("1");
        let enabled = match enable_raw.trim() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            other => {
                return Err(ConfigError::InvalidValue {
                    section: name.to_string(),
                    field: "enable".into(),
                    value: other.to_string(),
                })
            }
        };

        projects.push(ProjectConfig {
            name: name.to_string(),
            local_path: PathBuf::from(expanded),
            scm_kind,
            enabled,
        });
    }

    Ok(Configuration {
        user,
        server,
        projects,
        config_path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const VALID: &str = "
[user]
jid = alice@example.com
passwd = secret

[server]
master = baboon.example.com
pubsub = pubsub.example.com
streamer = proxy.example.com

[myproject]
path = /tmp/myproject
scm = git
enable = 1
";

    #[test]
    fn parses_valid_config() {
        let file = write_config(VALID);
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.user.jid, "alice@example.com");
        assert_eq!(config.server.master, "baboon.example.com");
        assert_eq!(config.server.max_stanza_size, DEFAULT_MAX_STANZA_SIZE);
        assert_eq!(config.projects.len(), 1);
        assert!(config.projects[0].enabled);
    }

    #[test]
    fn missing_user_jid_is_config_error() {
        let file = write_config(
            "
[user]
passwd = secret

[server]
master = m
pubsub = p
streamer = s
",
        );
        let err = load_config(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { .. }));
    }

    #[test]
    fn empty_value_is_config_error() {
        let file = write_config(
            "
[user]
jid =
passwd = secret

[server]
master = m
pubsub = p
streamer = s
",
        );
        let err = load_config(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { .. }));
    }

    #[test]
    fn disabled_project_is_excluded_from_enabled_iterator() {
        let file = write_config(
            "
[user]
jid = a
passwd = b

[server]
master = m
pubsub = p
streamer = s

[off]
path = /tmp/off
scm = git
enable = 0
",
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.enabled_projects().count(), 0);
    }

    #[test]
    fn custom_max_stanza_size_is_honored() {
        let file = write_config(
            "
[user]
jid = a
passwd = b

[server]
master = m
pubsub = p
streamer = s
max_stanza_size = 4096
",
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.server.max_stanza_size, 4096);
    }

    #[test]
    fn invalid_scm_is_rejected() {
        let file = write_config(
            "
[user]
jid = a
passwd = b

[server]
master = m
pubsub = p
streamer = s

[p]
path = /tmp/p
scm = hg
",
        );
        let err = load_config(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
