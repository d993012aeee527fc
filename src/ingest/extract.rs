//! Plain-text extraction for documents, code and markup.

use crate::error::Result;

use anyhow::Context as _;
use regex::Regex;
use std::io::Read as _;
use std::path::Path;
use std::sync::LazyLock;

/// Upper bound on extracted text handed to the provider.
const MAX_EXTRACTED_BYTES: usize = 2 * 1024 * 1024;

static PARAGRAPH_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"</(?:w:p|a:p|text:p|text:h|row)>|<(?:w:br|text:line-break|w:tab)\s*/>")
        .expect("hardcoded paragraph regex")
});

static CELL_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</(?:c|table:table-cell)>").expect("hardcoded cell regex"));

static XML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("hardcoded tag regex"));

static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("hardcoded blank line regex"));

/// Turns a local file into plain text.
#[async_trait::async_trait]
pub trait TextExtractor: Send + Sync + 'static {
    async fn extract(&self, source: &Path, declared_type: &str) -> Result<String>;
}

/// Default extractor: office zip containers are unpacked and stripped of
/// markup, everything else is read as (lossy) UTF-8.
#[derive(Debug, Clone, Default)]
pub struct DocumentExtractor;

#[async_trait::async_trait]
impl TextExtractor for DocumentExtractor {
    async fn extract(&self, source: &Path, declared_type: &str) -> Result<String> {
        let path = source.to_path_buf();
        let declared_type = declared_type.to_string();

        let text = tokio::task::spawn_blocking(move || extract_blocking(&path, &declared_type))
            .await
            .context("text extraction task panicked")??;

        Ok(truncate(text))
    }
}

fn extract_blocking(path: &Path, declared_type: &str) -> Result<String> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    let is_office = matches!(
        extension.as_str(),
        "docx" | "pptx" | "xlsx" | "odt" | "ods" | "odp"
    );

    if !is_office {
        if declared_type == "application/msword" || extension == "doc" {
            return Err(anyhow::anyhow!("legacy binary .doc files are not supported").into());
        }
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        return Ok(String::from_utf8_lossy(&bytes).into_owned());
    }

    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(file).context("not a valid office document")?;
    let names: Vec<String> = archive.file_names().map(str::to_string).collect();

    let mut text = String::new();
    for entry in office_entries(&extension, &names) {
        let Ok(mut file) = archive.by_name(&entry) else {
            continue;
        };
        let mut xml = String::new();
        file.read_to_string(&mut xml)
            .with_context(|| format!("failed to read {entry}"))?;
        let stripped = strip_markup(&xml);
        if !stripped.trim().is_empty() {
            text.push_str(stripped.trim());
            text.push_str("\n\n");
        }
    }

    if text.trim().is_empty() {
        return Err(anyhow::anyhow!("document contains no text").into());
    }
    Ok(text.trim_end().to_string())
}

/// Archive entries holding the document text, in reading order.
fn office_entries(extension: &str, names: &[String]) -> Vec<String> {
    match extension {
        "docx" => vec!["word/document.xml".into()],
        "pptx" => numbered_entries(names, "ppt/slides/slide"),
        "xlsx" => {
            let mut entries = vec!["xl/sharedStrings.xml".to_string()];
            entries.extend(numbered_entries(names, "xl/worksheets/sheet"));
            entries
        }
        _ => vec!["content.xml".into()],
    }
}

/// Entries named `<prefix><n>.xml`, in numeric order.
fn numbered_entries(names: &[String], prefix: &str) -> Vec<String> {
    let mut numbered: Vec<(u32, String)> = names
        .iter()
        .filter_map(|name| {
            let number = name.strip_prefix(prefix)?.strip_suffix(".xml")?;
            Some((number.parse().ok()?, name.clone()))
        })
        .collect();
    numbered.sort();
    numbered.into_iter().map(|(_, name)| name).collect()
}

fn strip_markup(xml: &str) -> String {
    let with_breaks = PARAGRAPH_END.replace_all(xml, "\n");
    let with_cells = CELL_END.replace_all(&with_breaks, "\t");
    let text = XML_TAG.replace_all(&with_cells, "");
    let decoded = text
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&");
    BLANK_RUNS.replace_all(&decoded, "\n\n").into_owned()
}

fn truncate(mut text: String) -> String {
    if text.len() <= MAX_EXTRACTED_BYTES {
        return text;
    }
    let mut end = MAX_EXTRACTED_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text.push_str("\n[truncated]");
    text
}
