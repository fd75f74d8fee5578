//! Package loading
//!
//! A package is either a directory of YAML templates or a single YAML file.
//! Files whose name starts with `nyl-` are reserved (schema, deployment) and
//! never treated as templates.

use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};
use crate::schema::Schema;

/// Schema file names, in lookup order
pub const SCHEMA_FILES: &[&str] = &["nyl-schema.yaml", "nyl-schema.json", "values.schema.json"];

/// A single template document source
#[derive(Debug, Clone)]
pub struct TemplateFile {
    /// File name relative to the package root
    pub name: String,
    pub path: PathBuf,
    pub content: String,
}

/// A loaded package; immutable once loaded
#[derive(Debug, Clone)]
pub struct Package {
    pub name: String,

    /// Canonical path, used as the package identity
    pub path: PathBuf,

    /// Directory relative package references resolve against
    pub base_dir: PathBuf,

    /// Templates in sorted file name order
    pub templates: Vec<TemplateFile>,

    pub schema: Option<Schema>,
}

impl Package {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CoreError::PackageNotFound {
                path: path.display().to_string(),
            });
        }
        let path = path.canonicalize()?;

        if path.is_file() {
            Self::load_file(path)
        } else {
            Self::load_dir(path)
        }
    }

    fn load_file(path: PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let file_name = file_name(&path);
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| file_name.clone());
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            name,
            templates: vec![TemplateFile {
                name: file_name,
                path: path.clone(),
                content,
            }],
            path,
            base_dir,
            schema: None,
        })
    }

    fn load_dir(path: PathBuf) -> Result<Self> {
        let mut templates = Vec::new();

        for entry in walkdir::WalkDir::new(&path)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| CoreError::InvalidPackage {
                message: format!("{}: {}", path.display(), e),
            })?;
            let file_path = entry.path();
            if !entry.file_type().is_file() || !is_template(file_path) {
                continue;
            }

            templates.push(TemplateFile {
                name: file_name(file_path),
                path: file_path.to_path_buf(),
                content: std::fs::read_to_string(file_path)?,
            });
        }

        let schema = SCHEMA_FILES
            .iter()
            .map(|f| path.join(f))
            .find(|p| p.exists())
            .map(Schema::from_file)
            .transpose()?;

        tracing::debug!(
            package = %path.display(),
            templates = templates.len(),
            has_schema = schema.is_some(),
            "loaded package"
        );

        Ok(Self {
            name: file_name(&path),
            base_dir: path.clone(),
            path,
            templates,
            schema,
        })
    }

    /// Resolve a package reference made from inside this package
    pub fn resolve_relative(&self, reference: &str) -> PathBuf {
        let target = Path::new(reference);
        if target.is_absolute() {
            target.to_path_buf()
        } else {
            self.base_dir.join(target)
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn is_template(path: &Path) -> bool {
    let name = file_name(path);
    let is_yaml = name.ends_with(".yaml") || name.ends_with(".yml");
    is_yaml && !name.starts_with("nyl-")
}
