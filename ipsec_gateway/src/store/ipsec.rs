//! Tunnel blocks in the daemon's connection and secrets files.
//!
//! Tunnels live after a title marker in the connection file. Each one is a
//! block rendered from the connection template, starting with a
//! `conn <name>` header and exactly as long as the template. The scanner
//! relies on that length, so the writer refuses values that would change it.
//! The secrets file holds the mirrored block, every line tagged `# <name>`.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::excise::excise;
use super::template::{render_template, Templates, WriteMode};
use super::{StoreError, StoreResult};
use crate::types::{TunnelEntry, TunnelRecord};

pub const MANAGED_REGION_MARKER: &str = "### IpsecManager Tunnels ###";
pub const SOURCE_KEYWORD: &str = "leftsubnet";
pub const DEST_KEYWORD: &str = "rightsubnet";

/// Name of the tunnel if `line` is a `conn <name>` header.
fn conn_header(line: &str) -> Option<&str> {
    let name = line.trim_end().strip_prefix("conn ")?;
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    Some(name)
}

/// Reject `value` unless it is a non-empty run of `[A-Za-z0-9_.-]`.
///
/// Tunnel and bridge names end up in shell command lines.
pub fn check_identifier(what: &str, value: &str) -> StoreResult<()> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-');
    if value.is_empty() || !value.chars().all(allowed) {
        return Err(StoreError::InvalidEntry(format!(
            "{what} '{value}' may only contain letters, digits, '_', '.' and '-'"
        )));
    }
    Ok(())
}

fn field_value<'a>(block: &[&'a str], keyword: &str) -> Option<&'a str> {
    block.iter().find_map(|line| {
        line.trim()
            .strip_prefix(keyword)
            .and_then(|rest| rest.strip_prefix('='))
    })
}

/// Reader/writer for the managed region of the daemon files.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    conf_path: PathBuf,
    secrets_path: PathBuf,
    templates: Templates,
}

impl ConfigStore {
    /// Fails with `InvalidEntry` if the connection template does not start
    /// with a `conn TUNNEL_NAME` header, since such blocks could never be
    /// found again.
    pub fn new(
        conf_path: impl Into<PathBuf>,
        secrets_path: impl Into<PathBuf>,
        templates: Templates,
    ) -> StoreResult<Self> {
        let header = templates.connection.render(&[]);
        if header.lines().next().and_then(conn_header) != Some("TUNNEL_NAME") {
            return Err(StoreError::InvalidEntry(format!(
                "{} must start with 'conn TUNNEL_NAME'",
                templates.connection.name()
            )));
        }
        Ok(Self {
            conf_path: conf_path.into(),
            secrets_path: secrets_path.into(),
            templates,
        })
    }

    pub fn conf_path(&self) -> &Path {
        &self.conf_path
    }

    pub fn secrets_path(&self) -> &Path {
        &self.secrets_path
    }

    /// Lines occupied by one tunnel block.
    pub fn block_len(&self) -> usize {
        self.templates.connection.line_count()
    }

    /// Append the title marker unless it is already present.
    /// Returns whether the file was changed.
    pub fn ensure_managed_region(&self) -> StoreResult<bool> {
        let content = match fs::read_to_string(&self.conf_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        if content.lines().any(|l| l.trim() == MANAGED_REGION_MARKER) {
            return Ok(false);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.conf_path)?;
        write!(file, "\n{MANAGED_REGION_MARKER}\n")?;
        info!(file = %self.conf_path.display(), "added managed tunnel region");
        Ok(true)
    }

    fn read_region(&self) -> StoreResult<(String, usize)> {
        let content = fs::read_to_string(&self.conf_path)?;
        let start = content
            .lines()
            .position(|l| l.trim() == MANAGED_REGION_MARKER)
            .ok_or_else(|| StoreError::ManagedRegionMissing(self.conf_path.clone()))?;
        Ok((content, start + 1))
    }

    fn block<'a>(&self, lines: &[&'a str], header_index: usize) -> Vec<&'a str> {
        let end = (header_index + self.block_len()).min(lines.len());
        lines[header_index..end].to_vec()
    }

    fn block_ip(&self, block: &[&str], name: &str, keyword: &str) -> StoreResult<Ipv4Addr> {
        let malformed = |detail: String| StoreError::MalformedConfig {
            path: self.conf_path.clone(),
            detail,
        };
        let value = field_value(block, keyword)
            .ok_or_else(|| malformed(format!("tunnel {name} has no {keyword}= line")))?;
        let ip = value.split('/').next().unwrap_or_default();
        ip.parse::<Ipv4Addr>()
            .map_err(|_| malformed(format!("tunnel {name} has invalid {keyword}={value}")))
    }

    /// Every tunnel in the managed region, in file order.
    pub fn list_tunnels(&self) -> StoreResult<Vec<TunnelRecord>> {
        let (content, start) = self.read_region()?;
        let lines: Vec<&str> = content.lines().collect();

        let mut records = Vec::new();
        for index in start..lines.len() {
            let Some(name) = conn_header(lines[index]) else {
                continue;
            };
            let block = self.block(&lines, index);
            records.push(TunnelRecord {
                name: name.to_string(),
                source_ip: self.block_ip(&block, name, SOURCE_KEYWORD)?,
                dest_ip: self.block_ip(&block, name, DEST_KEYWORD)?,
            });
        }
        debug!(count = records.len(), "listed managed tunnels");
        Ok(records)
    }

    fn tunnel_block(&self, name: &str) -> StoreResult<Vec<String>> {
        let (content, start) = self.read_region()?;
        let lines: Vec<&str> = content.lines().collect();
        let index = (start..lines.len())
            .find(|&i| conn_header(lines[i]) == Some(name))
            .ok_or_else(|| StoreError::TunnelNotFound(name.to_string()))?;
        Ok(self
            .block(&lines, index)
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    /// Raw value of `keyword=` within the block of tunnel `name`.
    pub fn lookup_field(&self, name: &str, keyword: &str) -> StoreResult<String> {
        let block = self.tunnel_block(name)?;
        let lines: Vec<&str> = block.iter().map(String::as_str).collect();
        field_value(&lines, keyword)
            .map(str::to_string)
            .ok_or_else(|| StoreError::MalformedConfig {
                path: self.conf_path.clone(),
                detail: format!("tunnel {name} has no {keyword}= line"),
            })
    }

    /// Source and destination addresses of tunnel `name`.
    pub fn tunnel_endpoints(&self, name: &str) -> StoreResult<(Ipv4Addr, Ipv4Addr)> {
        let block = self.tunnel_block(name)?;
        let lines: Vec<&str> = block.iter().map(String::as_str).collect();
        Ok((
            self.block_ip(&lines, name, SOURCE_KEYWORD)?,
            self.block_ip(&lines, name, DEST_KEYWORD)?,
        ))
    }

    fn validate_entry(entry: &TunnelEntry) -> StoreResult<()> {
        check_identifier("tunnel name", &entry.name)?;
        for (field, value) in [
            ("localId", &entry.local_id),
            ("remoteId", &entry.remote_id),
            ("psk", &entry.psk),
        ] {
            if value.is_empty() || value.contains(['\n', '\r']) {
                return Err(StoreError::InvalidEntry(format!(
                    "{field} must be a non-empty single line"
                )));
            }
        }
        if entry.psk.contains('"') {
            return Err(StoreError::InvalidEntry(
                "psk must not contain '\"'".to_string(),
            ));
        }
        Ok(())
    }

    /// Append the connection and secrets blocks for `entry`.
    ///
    /// The managed region must already exist; values are validated before
    /// either file is touched.
    pub fn append_tunnel(&self, entry: &TunnelEntry, local_gateway_ip: Ipv4Addr) -> StoreResult<()> {
        Self::validate_entry(entry)?;
        self.read_region()?;

        let local_gateway_ip = local_gateway_ip.to_string();
        let remote_gateway_ip = entry.remote_gateway_ip.to_string();
        let source_ip = entry.source_ip.to_string();
        let dest_ip = entry.dest_ip.to_string();

        render_template(
            &self.templates.connection,
            &self.conf_path,
            &[
                ("TUNNEL_NAME", entry.name.as_str()),
                ("LOCAL_GATEWAY_IP", local_gateway_ip.as_str()),
                ("REMOTE_GATEWAY_IP", remote_gateway_ip.as_str()),
                ("SOURCE_IP", source_ip.as_str()),
                ("DEST_IP", dest_ip.as_str()),
                ("LOCAL_ID", entry.local_id.as_str()),
                ("REMOTE_ID", entry.remote_id.as_str()),
            ],
            WriteMode::Append,
        )?;
        render_template(
            &self.templates.secrets,
            &self.secrets_path,
            &[
                ("TUNNEL_NAME", entry.name.as_str()),
                ("LOCAL_ID", entry.local_id.as_str()),
                ("REMOTE_ID", entry.remote_id.as_str()),
                ("PRE_SHARED_KEY", entry.psk.as_str()),
            ],
            WriteMode::Append,
        )?;
        info!(tunnel = %entry.name, "wrote tunnel blocks");
        Ok(())
    }

    /// Excise the secrets block and the connection block of tunnel `name`.
    pub fn remove_tunnel_blocks(&self, name: &str) -> StoreResult<()> {
        let tag = format!("# {name}");
        excise(
            &self.secrets_path,
            |l| l.ends_with(&tag),
            |l| l.ends_with(&tag),
        )?;

        let mut in_region = false;
        let removed = excise(
            &self.conf_path,
            |l| {
                if l == MANAGED_REGION_MARKER {
                    in_region = true;
                }
                in_region && conn_header(l) == Some(name)
            },
            |l| conn_header(l).map_or(true, |other| other == name),
        )?;
        if !removed {
            return Err(StoreError::TunnelNotFound(name.to_string()));
        }
        info!(tunnel = name, "removed tunnel blocks");
        Ok(())
    }
}
