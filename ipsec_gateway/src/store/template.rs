//! Placeholder substitution over line-oriented template files.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

pub const CONNECTION_TEMPLATE: &str = "ipsec.conf.template";
pub const SECRETS_TEMPLATE: &str = "ipsec.secrets.template";
pub const GATEWAY_TEMPLATE: &str = "gateway.template";

/// How [`render_template`] opens its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Append,
    Truncate,
}

/// A template file held in memory.
#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    text: String,
}

impl Template {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(name, fs::read_to_string(path)?))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of lines one rendered block occupies.
    pub fn line_count(&self) -> usize {
        self.text.lines().count()
    }

    /// Replace every occurrence of each placeholder, line by line.
    ///
    /// Each line is scanned once; at every position the longest matching
    /// key wins, so `GATEWAY_IP` never clobbers `LOCAL_GATEWAY_IP` and
    /// substituted values are never rescanned. The result always ends with
    /// a newline.
    pub fn render(&self, substitutions: &[(&str, &str)]) -> String {
        let mut ordered: Vec<&(&str, &str)> =
            substitutions.iter().filter(|(key, _)| !key.is_empty()).collect();
        ordered.sort_by_key(|(key, _)| std::cmp::Reverse(key.len()));

        let mut rendered = String::with_capacity(self.text.len());
        for line in self.text.lines() {
            let mut rest = line;
            while let Some(c) = rest.chars().next() {
                match ordered.iter().find(|(key, _)| rest.starts_with(*key)) {
                    Some((key, value)) => {
                        rendered.push_str(value);
                        rest = &rest[key.len()..];
                    }
                    None => {
                        rendered.push(c);
                        rest = &rest[c.len_utf8()..];
                    }
                }
            }
            rendered.push('\n');
        }
        rendered
    }
}

/// Render `template` into `destination`, creating the file if needed.
pub fn render_template(
    template: &Template,
    destination: &Path,
    substitutions: &[(&str, &str)],
    mode: WriteMode,
) -> io::Result<()> {
    let rendered = template.render(substitutions);
    let mut options = OpenOptions::new();
    options.create(true);
    match mode {
        WriteMode::Append => options.append(true),
        WriteMode::Truncate => options.write(true).truncate(true),
    };
    let mut file = options.open(destination)?;
    file.write_all(rendered.as_bytes())
}

/// The three templates the tool writes from.
#[derive(Debug, Clone)]
pub struct Templates {
    pub connection: Template,
    pub secrets: Template,
    pub gateway: Template,
}

impl Templates {
    /// Templates compiled into the binary.
    pub fn embedded() -> Self {
        Self {
            connection: Template::new(
                CONNECTION_TEMPLATE,
                include_str!("../../templates/ipsec.conf.template"),
            ),
            secrets: Template::new(
                SECRETS_TEMPLATE,
                include_str!("../../templates/ipsec.secrets.template"),
            ),
            gateway: Template::new(
                GATEWAY_TEMPLATE,
                include_str!("../../templates/gateway.template"),
            ),
        }
    }

    /// Load all three templates from `dir`; every file must be present.
    pub fn from_dir(dir: &Path) -> io::Result<Self> {
        Ok(Self {
            connection: Template::load(&dir.join(CONNECTION_TEMPLATE))?,
            secrets: Template::load(&dir.join(SECRETS_TEMPLATE))?,
            gateway: Template::load(&dir.join(GATEWAY_TEMPLATE))?,
        })
    }

    pub fn resolve(dir: Option<&Path>) -> io::Result<Self> {
        match dir {
            Some(dir) => Self::from_dir(dir),
            None => Ok(Self::embedded()),
        }
    }
}
