use std::path::Path;

use tollgate_proxy::ProxyConfig;

/// Command-line and environment values that take precedence over the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub upstream: Option<String>,
    pub bypass: Option<String>,
    pub host_identity: Option<String>,
    pub listen_host: Option<String>,
    pub listen_port: Option<u16>,
}

pub fn load_file(path: &Path) -> Result<ProxyConfig, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| format!("reading {}: {err}", path.display()))?;
    toml::from_str(&raw).map_err(|err| format!("parsing {}: {err}", path.display()))
}

pub fn resolve(file: Option<ProxyConfig>, overrides: Overrides) -> Result<ProxyConfig, String> {
    let mut config = file.unwrap_or_default();

    if let Some(upstream) = overrides.upstream {
        config.upstream.url = upstream;
    }
    if let Some(bypass) = overrides.bypass {
        config.bypass.hosts = Some(bypass);
    }
    if let Some(host_identity) = overrides.host_identity {
        config.bypass.host_identity = Some(host_identity);
    }
    if let Some(host) = overrides.listen_host {
        config.listen.host = host;
    }
    if let Some(port) = overrides.listen_port {
        config.listen.port = port;
    }

    if config.upstream.url.trim().is_empty() {
        return Err("no upstream proxy configured (use --upstream or [upstream] url)".to_string());
    }

    Ok(config)
}
