use super::{emit, Authenticator, AuthenticationToken};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
struct ContainerdConfig {
    #[serde(default)]
    server: String,
    #[serde(default)]
    host: std::collections::BTreeMap<String, ContainerdHostConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerdHostConfig {
    #[serde(default)]
    #[allow(dead_code)]
    capabilities: Vec<String>,
    #[serde(default)]
    header: ContainerdHeader,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerdHeader {
    #[serde(default)]
    authorization: String,
}

struct ContainerdServerHeader {
    server: String,
    header: String,
}

/// Authenticates from containerd `hosts.toml` files on the node.
pub struct ContainerdAuthenticator {
    directory: PathBuf,
}

impl ContainerdAuthenticator {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    fn find_host_header(&self, registry: &str) -> Option<ContainerdServerHeader> {
        let mut files = Vec::new();
        walk_toml_files(&self.directory, &mut files);
        // The whole directory is walked; a later matching file overrides an
        // earlier one.
        let mut matched = None;
        for path in files {
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(_) => continue,
            };
            let config: ContainerdConfig = match toml::from_str(&content) {
                Ok(config) => config,
                Err(_) => continue,
            };
            if !config.server.contains(registry) {
                continue;
            }
            debug!(server = config.server.as_str(), "found containerd auth");
            if let Some(host) = config.host.values().next() {
                let header = host
                    .header
                    .authorization
                    .strip_prefix("Basic ")
                    .unwrap_or(&host.header.authorization);
                matched = Some(ContainerdServerHeader {
                    server: config.server.clone(),
                    header: header.to_string(),
                });
            }
        }
        matched
    }
}

fn walk_toml_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|entry| entry.path());
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            walk_toml_files(&path, out);
        } else if path.extension().map(|ext| ext == "toml").unwrap_or(false) {
            out.push(path);
        }
    }
}

#[async_trait]
impl Authenticator for ContainerdAuthenticator {
    async fn authenticate(
        &self,
        _image_pull_secret: &str,
        registry: &str,
        image: &str,
        _tag: &str,
        candidates: &mpsc::Sender<AuthenticationToken>,
    ) {
        let Some(server_header) = self.find_host_header(registry) else {
            return;
        };
        if server_header.header.is_empty() {
            return;
        }
        debug!(
            registry = server_header.server.as_str(),
            image = format!("{}/{}", registry, image).as_str(),
            "image matches containerd registry config, trying it"
        );
        emit(
            candidates,
            AuthenticationToken::basic(server_header.header, "containerD"),
        )
        .await;
    }
}
