//! Caddy configuration rendering
//!
//! Rendering is a pure function of the registry snapshot. The output is a
//! global `Caddyfile` plus one unit per domain under `sites/`, in domain
//! order, so identical registries always render byte-identical files.
//!
//! Writing goes through a staging directory. The previous configuration is
//! kept beside the active one until the proxy accepted the new one, so a
//! failed reload can put it back.

use std::io;
use std::path::{Path, PathBuf};

use dh_core::model::{Domain, DomainTarget};
use dh_core::DevhostConfig;

use crate::store::Snapshot;

pub const GLOBAL_FILE: &str = "Caddyfile";
const SITES_DIR: &str = "sites";
const STAGING_SUFFIX: &str = "staging";
const PREVIOUS_SUFFIX: &str = "previous";

/// One rendered per-domain unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteUnit {
    pub file_name: String,
    pub contents: String,
}

/// Everything written for one reload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub global: String,
    pub sites: Vec<SiteUnit>,
}

/// Render the proxy configuration for `snapshot`
///
/// TLS is emitted for a domain only when it asks for it and the local CA
/// exists; otherwise the domain is served over plain HTTP.
pub fn render_config(snapshot: &Snapshot, config: &DevhostConfig, ca_exists: bool) -> RenderedConfig {
    let sites = snapshot
        .domains
        .values()
        .filter_map(|domain| {
            let upstream = upstream_port(snapshot, domain)?;
            Some(SiteUnit {
                file_name: format!("{}.caddy", domain.full_domain),
                contents: render_site(domain, upstream, ca_exists),
            })
        })
        .collect();

    RenderedConfig {
        global: render_global(config, ca_exists),
        sites,
    }
}

fn upstream_port(snapshot: &Snapshot, domain: &Domain) -> Option<u16> {
    match &domain.target {
        DomainTarget::Port(port) => Some(*port),
        DomainTarget::Instance(id) => match snapshot.instance(id) {
            Some(instance) => Some(instance.port),
            None => {
                tracing::warn!("{} routes to unknown instance {}", domain.full_domain, id);
                None
            }
        },
    }
}

fn render_global(config: &DevhostConfig, ca_exists: bool) -> String {
    let tld = config.tld.trim_matches('.');
    let mut out = String::new();
    out.push_str("# Managed by devhost. Manual edits are overwritten.\n");
    out.push_str("{\n");
    out.push_str(&format!("\thttp_port {}\n", config.proxy.http_port));
    out.push_str(&format!("\thttps_port {}\n", config.proxy.https_port));
    out.push_str("}\n\n");
    out.push_str(&format!("import {}/*.caddy\n\n", SITES_DIR));
    // Unmapped names under the tld get a clear 404; HTTPS only once the CA exists
    if ca_exists {
        out.push_str(&format!("http://*.{}, https://*.{} {{\n", tld, tld));
        out.push_str("\ttls internal\n");
    } else {
        out.push_str(&format!("http://*.{} {{\n", tld));
    }
    out.push_str("\trespond \"No site is configured for {host}\" 404\n");
    out.push_str("}\n");
    out
}

fn render_site(domain: &Domain, upstream: u16, ca_exists: bool) -> String {
    let tls = domain.ssl_enabled && ca_exists;
    let mut out = String::new();

    out.push_str(&format!("# {} -> 127.0.0.1:{}\n", domain.full_domain, upstream));
    if domain.ssl_enabled && !ca_exists {
        out.push_str("# TLS requested but the local CA does not exist yet\n");
    }

    let scheme = if tls { "https" } else { "http" };
    out.push_str(&format!("{}://{} {{\n", scheme, domain.full_domain));
    if tls {
        out.push_str("\ttls internal\n");
    }
    match &domain.document_root {
        Some(root) => {
            out.push_str(&format!("\treverse_proxy 127.0.0.1:{} {{\n", upstream));
            out.push_str(&format!(
                "\t\theader_up X-Document-Root \"{}\"\n",
                escape_quoted(&root.display().to_string())
            ));
            out.push_str("\t}\n");
        }
        None => out.push_str(&format!("\treverse_proxy 127.0.0.1:{}\n", upstream)),
    }
    out.push_str("}\n");
    out
}

fn escape_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn sibling(dir: &Path, name: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{}.{}", name, suffix))
}

/// Handle on a written configuration that has not been confirmed yet
#[derive(Debug)]
pub struct PendingConfig {
    dir: PathBuf,
}

impl PendingConfig {
    /// Path of the global file to hand to the proxy
    pub fn global_path(&self) -> PathBuf {
        self.dir.join(GLOBAL_FILE)
    }

    /// The proxy accepted the new configuration; drop the previous one
    pub async fn commit(self) -> io::Result<()> {
        remove_if_exists(&sibling(&self.dir, SITES_DIR, PREVIOUS_SUFFIX)).await?;
        remove_if_exists(&sibling(&self.dir, GLOBAL_FILE, PREVIOUS_SUFFIX)).await
    }

    /// The proxy rejected it; put the previous configuration back
    pub async fn restore(self) -> io::Result<()> {
        let dir = &self.dir;
        let sites = dir.join(SITES_DIR);
        let previous_sites = sibling(dir, SITES_DIR, PREVIOUS_SUFFIX);
        remove_if_exists(&sites).await?;
        if exists(&previous_sites).await {
            tokio::fs::rename(&previous_sites, &sites).await?;
        }

        let global = dir.join(GLOBAL_FILE);
        let previous_global = sibling(dir, GLOBAL_FILE, PREVIOUS_SUFFIX);
        if exists(&previous_global).await {
            tokio::fs::rename(&previous_global, &global).await?;
        } else {
            remove_if_exists(&global).await?;
        }
        Ok(())
    }
}

/// Write `rendered` into `dir`, keeping the current configuration as previous
pub async fn write_config(dir: &Path, rendered: &RenderedConfig) -> io::Result<PendingConfig> {
    tokio::fs::create_dir_all(dir).await?;

    let staging = sibling(dir, SITES_DIR, STAGING_SUFFIX);
    remove_if_exists(&staging).await?;
    tokio::fs::create_dir_all(&staging).await?;
    for site in &rendered.sites {
        tokio::fs::write(staging.join(&site.file_name), &site.contents).await?;
    }
    let staging_global = sibling(dir, GLOBAL_FILE, STAGING_SUFFIX);
    tokio::fs::write(&staging_global, &rendered.global).await?;

    let sites = dir.join(SITES_DIR);
    let previous_sites = sibling(dir, SITES_DIR, PREVIOUS_SUFFIX);
    let global = dir.join(GLOBAL_FILE);
    let previous_global = sibling(dir, GLOBAL_FILE, PREVIOUS_SUFFIX);
    remove_if_exists(&previous_sites).await?;
    remove_if_exists(&previous_global).await?;

    let mut renames = Vec::new();
    if exists(&sites).await {
        renames.push((sites.clone(), previous_sites));
    }
    if exists(&global).await {
        renames.push((global.clone(), previous_global));
    }
    renames.push((staging.clone(), sites));
    renames.push((staging_global.clone(), global));

    if let Err(e) = apply_renames(&renames).await {
        let _ = remove_if_exists(&staging).await;
        let _ = remove_if_exists(&staging_global).await;
        return Err(e);
    }

    Ok(PendingConfig {
        dir: dir.to_path_buf(),
    })
}

/// Apply `(from, to)` renames in order, undoing the applied ones on failure
async fn apply_renames(renames: &[(PathBuf, PathBuf)]) -> io::Result<()> {
    for (applied, (from, to)) in renames.iter().enumerate() {
        if let Err(e) = tokio::fs::rename(from, to).await {
            for (from, to) in renames[..applied].iter().rev() {
                if let Err(undo_err) = tokio::fs::rename(to, from).await {
                    tracing::warn!("Failed to move {} back: {}", to.display(), undo_err);
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

async fn exists(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok()
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
