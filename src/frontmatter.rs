//! Frontmatter store (spec.md 6): `readFrontmatter(path) -> {data, content}`,
//! `writeFrontmatter(path, data, content)`.
//!
//! Named directly in spec.md 1's non-goals ("markdown-frontmatter parsing") as a
//! collaborator the core only depends on through this contract — the implementation
//! here is deliberately small, grounded in the teacher's `parser::frontmatter`
//! module (a leading `---`-delimited YAML block followed by markdown body).

use std::path::Path;

use anyhow::{anyhow, Context, Result};

#[derive(Debug, Clone)]
pub struct FrontmatterDocument {
    pub data: serde_yaml::Value,
    pub content: String,
}

pub trait FrontmatterStore: Send + Sync {
    fn read(&self, path: &Path) -> Result<FrontmatterDocument>;
    fn write(&self, path: &Path, data: serde_yaml::Value, content: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownFrontmatter;

impl FrontmatterStore for MarkdownFrontmatter {
    fn read(&self, path: &Path) -> Result<FrontmatterDocument> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        extract(&raw).ok_or_else(|| anyhow!("no frontmatter block in {}", path.display()))
    }

    fn write(&self, path: &Path, data: serde_yaml::Value, content: &str) -> Result<()> {
        let yaml = serde_yaml::to_string(&data).context("serializing frontmatter")?;
        let rendered = format!("---\n{yaml}---\n{content}");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        std::fs::write(path, rendered).with_context(|| format!("writing {}", path.display()))
    }
}

fn extract(raw: &str) -> Option<FrontmatterDocument> {
    let rest = raw.strip_prefix("---\n")?;
    let end = rest.find("\n---")?;
    let yaml = &rest[..end];
    let content = rest[end + 4..].trim_start_matches('\n').to_string();
    let data: serde_yaml::Value = serde_yaml::from_str(yaml).ok()?;
    Some(FrontmatterDocument { data, content })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_data_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.md");
        std::fs::write(&path, "---\nstatus: Design\n---\nbody text\n").unwrap();

        let store = MarkdownFrontmatter;
        let doc = store.read(&path).unwrap();
        assert_eq!(doc.data["status"].as_str(), Some("Design"));
        assert_eq!(doc.content, "body text\n");

        let mut data = doc.data;
        data["status"] = "Build".into();
        store.write(&path, data, &doc.content).unwrap();

        let doc2 = store.read(&path).unwrap();
        assert_eq!(doc2.data["status"].as_str(), Some("Build"));
        assert_eq!(doc2.content, "body text\n");
    }

    #[test]
    fn missing_frontmatter_block_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.md");
        std::fs::write(&path, "no frontmatter here\n").unwrap();
        assert!(MarkdownFrontmatter.read(&path).is_err());
    }
}
