use serde::Deserialize;
use std::{collections::BTreeMap, env, fs, path::PathBuf, time::Duration};

use crate::api::ClientConfig;

/// On-disk CLI configuration (`fnctl.json`).
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

/// Settings resolved from the config file and command line.
#[derive(Debug, Clone)]
pub struct Settings {
    pub client: ClientConfig,
    pub namespace: String,
}

/// Values given on the command line; these win over the config file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub api_url: Option<String>,
    pub namespace: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

pub const DEFAULT_NAMESPACE: &str = "default";

/// Locate the config file. `Ok(None)` means no config file is in use.
pub fn resolve_config_path() -> anyhow::Result<Option<PathBuf>> {
    if let Ok(p) = env::var("FNCTL_CONFIG") {
        let path = PathBuf::from(p);
        if !path.exists() {
            return Err(anyhow::anyhow!(
                "FNCTL_CONFIG points to {}, which does not exist",
                path.display()
            ));
        }
        return Ok(Some(path));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("fnctl").join("config.json");
        if candidate.exists() {
            return Ok(Some(candidate));
        }
    }

    let candidate = PathBuf::from("fnctl.json");
    if candidate.exists() {
        return Ok(Some(candidate));
    }

    Ok(None)
}

fn expand_env_vars(input: &str) -> String {
    expand_vars(input, |name| env::var(name).ok())
}

/// Replace `${NAME}` with `lookup(NAME)`; unknown or unterminated
/// variables are kept verbatim.
fn expand_vars(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                name.push(c);
            }
            match lookup(&name) {
                Some(val) if closed => out.push_str(&val),
                _ => {
                    out.push_str("${");
                    out.push_str(&name);
                    if closed {
                        out.push('}');
                    }
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}

fn expand_opt(value: &mut Option<String>) {
    if let Some(v) = value.as_mut() {
        *v = expand_env_vars(v);
    }
}

impl FileConfig {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut cfg: FileConfig = serde_json::from_str(raw)?;
        expand_opt(&mut cfg.api_url);
        expand_opt(&mut cfg.namespace);
        expand_opt(&mut cfg.username);
        expand_opt(&mut cfg.password);
        expand_opt(&mut cfg.token);
        for val in cfg.headers.values_mut() {
            *val = expand_env_vars(val);
        }
        Ok(cfg)
    }

    pub fn load() -> anyhow::Result<Self> {
        match resolve_config_path()? {
            Some(path) => {
                let raw = fs::read_to_string(&path)?;
                Self::parse(&raw).map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))
            }
            None => Ok(Self::default()),
        }
    }

    /// Merge with command-line overrides into the final settings.
    pub fn resolve(self, overrides: Overrides) -> Settings {
        let defaults = ClientConfig::default();
        let timeout = overrides
            .request_timeout_secs
            .or(self.request_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);

        Settings {
            client: ClientConfig {
                base_url: overrides.api_url.or(self.api_url).unwrap_or(defaults.base_url),
                request_timeout: timeout,
                token: overrides.token.or(self.token),
                username: overrides.username.or(self.username),
                password: overrides.password.or(self.password),
                headers: self.headers,
            },
            namespace: overrides
                .namespace
                .or(self.namespace)
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
        }
    }
}
