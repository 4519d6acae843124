//! Configuration management for the mirror synchroniser.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`MIRROR_SYNC__SECTION__KEY`), then resolves the module table into the
//! explicit per-module specs the rest of the crate works with.

use crate::utils::logger::level_for_verbosity;
use crate::{MirrorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment prefix for configuration overrides
const ENV_PREFIX: &str = "MIRROR_SYNC";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mirror: MirrorConfig,

    /// Per-module directory and registry mappings, keyed by module name
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleConfig>,

    #[serde(default)]
    pub checkin: CheckinConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Local destination root; module directories live directly below it
    pub dest_dir: PathBuf,

    /// Run state file (`LASTTIME=<epoch>`), also the lock key for the target
    pub state_file: PathBuf,

    /// Remote endpoint, e.g. `rsync://dl.example.org`
    pub remote: String,

    /// Remote module that contains every mirrored module as a subdirectory
    pub master_module: String,

    /// Modules mirrored by this target
    pub modules: Vec<String>,

    /// Manifest file name template (`{dir}` and `{module}` are expanded)
    #[serde(default = "default_manifest_name")]
    pub manifest_name: String,

    /// Auxiliary list file templates fetched alongside every manifest
    #[serde(default = "default_extra_files")]
    pub extra_files: Vec<String>,

    /// Regex of manifest paths excluded from mirroring
    #[serde(default)]
    pub filter: Option<String>,

    /// Include restricted (pre-release) manifest entries
    #[serde(default)]
    pub include_restricted: bool,

    /// Path to the rsync binary
    #[serde(default = "default_rsync_path")]
    pub rsync_path: PathBuf,

    /// Extra options passed to every rsync invocation
    #[serde(default = "default_rsync_options")]
    pub rsync_options: Vec<String>,

    /// Per-call rsync I/O timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Verbosity 0-7, used when no explicit log level is configured
    #[serde(default = "default_verbose")]
    pub verbose: u8,

    /// Maximum attempts for retryable transfer failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base of the exponential backoff, in seconds
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,

    /// Name of rsync's temporary partial-transfer directory
    #[serde(default = "default_temp_dir_name")]
    pub temp_dir_name: String,

    /// Delete leftover temp files smaller than `small_file_threshold`
    #[serde(default)]
    pub partial_dir_workaround: bool,

    #[serde(default = "default_small_file_threshold")]
    pub small_file_threshold: u64,

    /// Only report directories that would be deleted
    #[serde(default)]
    pub report_only_dirs: bool,

    /// Only report files that would be deleted
    #[serde(default)]
    pub report_only_files: bool,

    /// Verify local files against the manifest checksum section
    #[serde(default = "default_true")]
    pub verify_checksums: bool,

    /// Escalate lock contention when the last run is older than this
    #[serde(default = "default_warn_delay_secs")]
    pub warn_delay_secs: u64,

    /// Scratch directory for per-run artifacts
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Status artifact location (defaults to `<scratch_dir>/status.json`)
    #[serde(default)]
    pub status_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Directory name below `dest_dir` (and below the master module)
    #[serde(default)]
    pub dir: Option<String>,

    /// Registry category this module reports as
    #[serde(default)]
    pub registry_category: Option<String>,

    /// Registry host name override for this module
    #[serde(default)]
    pub registry_host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckinConfig {
    #[serde(default)]
    pub enabled: bool,

    /// XML-RPC endpoint of the registry
    #[serde(default = "default_checkin_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub site: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Registry host name (defaults to the machine hostname)
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_checkin_retries")]
    pub max_retries: u32,

    /// Linear backoff step between attempts, in seconds
    #[serde(default = "default_checkin_delay_secs")]
    pub retry_delay_secs: u64,

    #[serde(default = "default_checkin_timeout_secs")]
    pub timeout_secs: u64,

    /// Text the tag-stripped response must contain
    #[serde(default = "default_success_marker")]
    pub success_marker: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error); overrides `mirror.verbose`
    #[serde(default)]
    pub level: Option<String>,

    /// Append log output to this file instead of stderr
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// A module with every mapping resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpec {
    pub name: String,
    pub dir: String,
    pub category: Option<String>,
    pub host_override: Option<String>,
}

// Default values
fn default_manifest_name() -> String {
    "fullfiletimelist-{dir}".to_string()
}

fn default_extra_files() -> Vec<String> {
    vec!["fullfilelist".to_string(), "imagelist-{dir}".to_string()]
}

fn default_rsync_path() -> PathBuf {
    PathBuf::from("rsync")
}

fn default_rsync_options() -> Vec<String> {
    vec![
        "-aSH".to_string(),
        "--no-motd".to_string(),
        "--delay-updates".to_string(),
    ]
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_verbose() -> u8 {
    3
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_base_secs() -> u64 {
    1
}

fn default_temp_dir_name() -> String {
    ".~tmp~".to_string()
}

fn default_small_file_threshold() -> u64 {
    4096
}

fn default_true() -> bool {
    true
}

fn default_warn_delay_secs() -> u64 {
    24 * 60 * 60
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("/var/tmp/mirror-sync")
}

fn default_checkin_endpoint() -> String {
    "https://admin.fedoraproject.org/mirrormanager/xmlrpc".to_string()
}

fn default_checkin_retries() -> u32 {
    5
}

fn default_checkin_delay_secs() -> u64 {
    30
}

fn default_checkin_timeout_secs() -> u64 {
    60
}

fn default_success_marker() -> String {
    "checked in successful".to_string()
}

impl Default for CheckinConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_checkin_endpoint(),
            site: None,
            password: None,
            host: None,
            max_retries: default_checkin_retries(),
            retry_delay_secs: default_checkin_delay_secs(),
            timeout_secs: default_checkin_timeout_secs(),
            success_marker: default_success_marker(),
        }
    }
}

/// Well-known modules: (name, directory, registry category)
const BUILTIN_MODULES: &[(&str, &str, &str)] = &[
    ("fedora-enchilada", "fedora", "Fedora Linux"),
    ("fedora-epel", "epel", "Fedora EPEL"),
    ("fedora-archive", "archive", "Fedora Archive"),
    ("fedora-secondary", "fedora-secondary", "Fedora Secondary Arches"),
    ("fedora-alt", "alt", "Fedora Other"),
];

impl Config {
    /// Load configuration from a TOML file, layering `MIRROR_SYNC__*`
    /// environment variables on top
    pub fn load(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| MirrorError::Config(format!("{}: {}", path.display(), e)))?;

        settings
            .try_deserialize()
            .map_err(|e| MirrorError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse configuration from TOML text without environment overrides
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| MirrorError::Config(e.to_string()))
    }

    /// Check required settings before anything touches the filesystem
    pub fn validate(&self) -> Result<()> {
        let m = &self.mirror;
        if m.dest_dir.as_os_str().is_empty() {
            return Err(MirrorError::Config("mirror.dest_dir is required".into()));
        }
        if m.state_file.as_os_str().is_empty() {
            return Err(MirrorError::Config("mirror.state_file is required".into()));
        }
        if m.remote.trim().is_empty() {
            return Err(MirrorError::Config("mirror.remote is required".into()));
        }
        if m.master_module.trim().is_empty() {
            return Err(MirrorError::Config("mirror.master_module is required".into()));
        }
        if m.modules.is_empty() {
            return Err(MirrorError::Config("mirror.modules must not be empty".into()));
        }
        if m.max_retries == 0 {
            return Err(MirrorError::Config("mirror.max_retries must be at least 1".into()));
        }
        if let Some(filter) = &m.filter {
            regex::Regex::new(filter)
                .map_err(|e| MirrorError::Config(format!("mirror.filter: {}", e)))?;
        }

        // Every module must resolve to a directory
        self.resolve_modules(&[])?;

        if self.checkin.enabled {
            if self.checkin.site.is_none() || self.checkin.password.is_none() {
                return Err(MirrorError::Config(
                    "checkin.site and checkin.password are required when checkin is enabled"
                        .into(),
                ));
            }
            let host = match &self.checkin.host {
                Some(host) => Some(host.trim()).filter(|h| !h.is_empty()).map(str::to_string),
                None => machine_hostname(),
            };
            if host.is_none() {
                return Err(MirrorError::Config(
                    "checkin.host is required when checkin is enabled and the machine hostname is unknown"
                        .into(),
                ));
            }
            if self.checkin.max_retries == 0 {
                return Err(MirrorError::Config(
                    "checkin.max_retries must be at least 1".into(),
                ));
            }
        }

        Ok(())
    }

    /// Resolve the configured module list (optionally restricted to `only`)
    /// into explicit specs.
    pub fn resolve_modules(&self, only: &[String]) -> Result<Vec<ModuleSpec>> {
        for name in only {
            if !self.mirror.modules.contains(name) {
                return Err(MirrorError::Config(format!(
                    "module {} is not configured for this target",
                    name
                )));
            }
        }

        let mut specs = Vec::new();
        for name in &self.mirror.modules {
            if !only.is_empty() && !only.contains(name) {
                continue;
            }
            specs.push(self.resolve_module(name)?);
        }
        Ok(specs)
    }

    fn resolve_module(&self, name: &str) -> Result<ModuleSpec> {
        let builtin = BUILTIN_MODULES.iter().find(|(n, _, _)| *n == name);
        let configured = self.modules.get(name);

        let dir = configured
            .and_then(|m| m.dir.clone())
            .or_else(|| builtin.map(|(_, d, _)| d.to_string()))
            .ok_or_else(|| {
                MirrorError::Config(format!("module {} has no directory mapping", name))
            })?;
        if dir.is_empty() || dir.contains("..") || dir.starts_with('/') {
            return Err(MirrorError::Config(format!(
                "module {} has an invalid directory mapping: {:?}",
                name, dir
            )));
        }

        let category = configured
            .and_then(|m| m.registry_category.clone())
            .or_else(|| builtin.map(|(_, _, c)| c.to_string()));
        let host_override = configured.and_then(|m| m.registry_host.clone());

        Ok(ModuleSpec {
            name: name.to_string(),
            dir,
            category,
            host_override,
        })
    }

    /// Expand the manifest name template for a module
    pub fn manifest_name(&self, module: &ModuleSpec) -> String {
        expand_template(&self.mirror.manifest_name, module)
    }

    /// Expand the auxiliary list file templates for a module
    pub fn extra_files(&self, module: &ModuleSpec) -> Vec<String> {
        self.mirror
            .extra_files
            .iter()
            .map(|t| expand_template(t, module))
            .collect()
    }

    /// Local directory of a module
    pub fn module_root(&self, module: &ModuleSpec) -> PathBuf {
        self.mirror.dest_dir.join(&module.dir)
    }

    /// Remote source for the master module, with trailing slash
    pub fn remote_source(&self) -> String {
        format!(
            "{}/{}/",
            self.mirror.remote.trim_end_matches('/'),
            self.mirror.master_module
        )
    }

    pub fn status_file(&self) -> PathBuf {
        self.mirror
            .status_file
            .clone()
            .unwrap_or_else(|| self.mirror.scratch_dir.join("status.json"))
    }

    /// Effective log level: explicit level first, then verbosity mapping
    pub fn log_level(&self) -> String {
        self.log
            .level
            .clone()
            .unwrap_or_else(|| level_for_verbosity(self.mirror.verbose).to_string())
    }

    /// Registry host name: configured value or the machine hostname
    pub fn checkin_host(&self) -> String {
        self.checkin
            .host
            .clone()
            .or_else(machine_hostname)
            .unwrap_or_else(|| "localhost".to_string())
    }
}

fn machine_hostname() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
}

fn expand_template(template: &str, module: &ModuleSpec) -> String {
    template
        .replace("{dir}", &module.dir)
        .replace("{module}", &module.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
[mirror]
dest_dir = "/srv/mirror"
state_file = "/var/lib/mirror-sync/fedora.state"
remote = "rsync://dl.example.org/"
master_module = "fedora-buffet"
modules = ["fedora-enchilada", "fedora-epel", "custom"]

[modules.custom]
dir = "custom-dir"
registry_category = "Custom Stuff"
registry_host = "mirror2.example.org"

[modules.fedora-epel]
registry_host = "epel.example.org"
"#;

    #[test]
    fn test_parse_and_defaults() {
        let config = Config::from_toml_str(BASIC).unwrap();
        assert_eq!(config.mirror.manifest_name, "fullfiletimelist-{dir}");
        assert_eq!(config.mirror.max_retries, 10);
        assert_eq!(config.mirror.temp_dir_name, ".~tmp~");
        assert!(config.mirror.verify_checksums);
        assert!(!config.checkin.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve_modules_mappings() {
        let config = Config::from_toml_str(BASIC).unwrap();
        let modules = config.resolve_modules(&[]).unwrap();
        assert_eq!(modules.len(), 3);

        assert_eq!(modules[0].dir, "fedora");
        assert_eq!(modules[0].category.as_deref(), Some("Fedora Linux"));
        assert_eq!(modules[0].host_override, None);

        assert_eq!(modules[1].dir, "epel");
        assert_eq!(modules[1].host_override.as_deref(), Some("epel.example.org"));

        assert_eq!(modules[2].dir, "custom-dir");
        assert_eq!(modules[2].category.as_deref(), Some("Custom Stuff"));
    }

    #[test]
    fn test_resolve_module_subset() {
        let config = Config::from_toml_str(BASIC).unwrap();
        let modules = config.resolve_modules(&["fedora-epel".to_string()]).unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].name, "fedora-epel");

        let err = config.resolve_modules(&["nope".to_string()]);
        assert!(matches!(err, Err(MirrorError::Config(_))));
    }

    #[test]
    fn test_unknown_module_without_dir_is_rejected() {
        let toml = BASIC.replace("\"custom\"]", "\"custom\", \"mystery\"]");
        let config = Config::from_toml_str(&toml).unwrap();
        assert!(matches!(config.validate(), Err(MirrorError::Config(_))));
    }

    #[test]
    fn test_checkin_requires_credentials() {
        let toml = format!("{}\n[checkin]\nenabled = true\nsite = \"s\"\n", BASIC);
        let config = Config::from_toml_str(&toml).unwrap();
        assert!(matches!(config.validate(), Err(MirrorError::Config(_))));
    }

    #[test]
    fn test_checkin_host() {
        let creds = "[checkin]\nenabled = true\nsite = \"s\"\npassword = \"p\"\n";

        let toml = format!("{}\n{}host = \" \"\n", BASIC, creds);
        let config = Config::from_toml_str(&toml).unwrap();
        assert!(matches!(config.validate(), Err(MirrorError::Config(_))));

        let toml = format!("{}\n{}host = \"mirror.example.org\"\n", BASIC, creds);
        let config = Config::from_toml_str(&toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.checkin_host(), "mirror.example.org");

        // Without a configured host the machine hostname stands in
        let toml = format!("{}\n{}", BASIC, creds);
        let config = Config::from_toml_str(&toml).unwrap();
        assert_eq!(config.validate().is_ok(), machine_hostname().is_some());
    }

    #[test]
    fn test_templates_and_paths() {
        let config = Config::from_toml_str(BASIC).unwrap();
        let modules = config.resolve_modules(&[]).unwrap();
        assert_eq!(config.manifest_name(&modules[1]), "fullfiletimelist-epel");
        assert_eq!(
            config.extra_files(&modules[1]),
            vec!["fullfilelist".to_string(), "imagelist-epel".to_string()]
        );
        assert_eq!(config.module_root(&modules[1]), PathBuf::from("/srv/mirror/epel"));
        assert_eq!(config.remote_source(), "rsync://dl.example.org/fedora-buffet/");
        assert_eq!(config.status_file(), PathBuf::from("/var/tmp/mirror-sync/status.json"));
    }

    #[test]
    fn test_log_level_from_verbosity() {
        let mut config = Config::from_toml_str(BASIC).unwrap();
        assert_eq!(config.log_level(), "info");
        config.mirror.verbose = 6;
        assert_eq!(config.log_level(), "debug");
        config.log.level = Some("error".to_string());
        assert_eq!(config.log_level(), "error");
    }

    #[test]
    fn test_load_from_file() -> std::io::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("mirror.toml");
        std::fs::write(&path, BASIC)?;

        let config = Config::load(&path).unwrap();
        assert_eq!(config.mirror.master_module, "fedora-buffet");
        Ok(())
    }
}
