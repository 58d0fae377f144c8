use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use super::walker::SupportedFormat;

/// Reads `path` as plain text suitable for chunking.
pub fn extract_text(path: &Path, format: SupportedFormat) -> Result<String> {
    let raw = match format {
        SupportedFormat::PlainText => read_utf8(path)?,
        SupportedFormat::Markdown => strip_markdown(&read_utf8(path)?),
        SupportedFormat::Pdf => extract_pdf(path)?,
        SupportedFormat::Docx => extract_docx(path)?,
    };
    Ok(clean_text(&raw))
}

fn read_utf8(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read text file: {}", path.display()))
}

fn extract_pdf(path: &Path) -> Result<String> {
    pdf_extract::extract_text(path)
        .with_context(|| format!("Failed to extract PDF text: {}", path.display()))
}

fn extract_docx(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open DOCX: {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Failed to read DOCX as ZIP: {}", path.display()))?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .context("No word/document.xml found in DOCX")?
        .read_to_string(&mut xml)?;

    Ok(docx_paragraphs(&xml).join("\n\n"))
}

static PARAGRAPH: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<w:p[ >].*?</w:p>").unwrap());
static RUN_TEXT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<w:t(?: [^>]*)?>(.*?)</w:t>").unwrap());

/// Text of each non-empty `<w:p>` paragraph, runs concatenated.
fn docx_paragraphs(xml: &str) -> Vec<String> {
    PARAGRAPH
        .find_iter(xml)
        .map(|paragraph| {
            RUN_TEXT
                .captures_iter(paragraph.as_str())
                .map(|caps| decode_entities(&caps[1]))
                .collect::<String>()
        })
        .filter(|text| !text.trim().is_empty())
        .collect()
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ \t]*(```|~~~).*$").unwrap());
static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ \t]{0,3}#{1,6}[ \t]+").unwrap());
static BLOCKQUOTE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ \t]{0,3}>[ \t]?").unwrap());
static LIST_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^([ \t]*)(?:[-*+]|\d+\.)[ \t]+").unwrap());
static RULE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ \t]*(?:-{3,}|\*{3,}|_{3,})[ \t]*$").unwrap());
static IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\([^)]*\)").unwrap());
static LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]+)\]\([^)]*\)").unwrap());
static BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\*\*|__)([^\n]+?)(\*\*|__)").unwrap());
static ITALIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*([^*\n]+)\*").unwrap());
static INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`\n]*)`").unwrap());
static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>\n]+>").unwrap());

/// Drops markdown syntax, keeping the visible text.
pub fn strip_markdown(markdown: &str) -> String {
    let text = CODE_FENCE.replace_all(markdown, "");
    let text = RULE.replace_all(&text, "");
    let text = HEADING.replace_all(&text, "");
    let text = BLOCKQUOTE.replace_all(&text, "");
    let text = LIST_MARKER.replace_all(&text, "$1");
    let text = IMAGE.replace_all(&text, "$1");
    let text = LINK.replace_all(&text, "$1");
    let text = BOLD.replace_all(&text, "$2");
    let text = ITALIC.replace_all(&text, "$1");
    let text = INLINE_CODE.replace_all(&text, "$1");
    let text = HTML_TAG.replace_all(&text, "");
    decode_entities(&text)
}

static INLINE_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\u{a0}]+").unwrap());
static EXTRA_NEWLINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Collapses runs of spaces, trims lines and keeps at most one blank line
/// between paragraphs.
pub fn clean_text(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<String> = normalized
        .lines()
        .map(|line| INLINE_SPACE.replace_all(line, " ").trim().to_string())
        .collect();
    EXTRA_NEWLINES
        .replace_all(&lines.join("\n"), "\n\n")
        .trim()
        .to_string()
}
