//! Format-specific text extraction.
//!
//! Turns the raw bytes of a course file into ordered [`ExtractedSegment`]s.
//! The format is chosen from the object key's extension:
//!
//! | Extension        | Segments                                   | Position        |
//! |------------------|--------------------------------------------|-----------------|
//! | `.pdf`           | one per page, non-ASCII dropped            | page (1-based)  |
//! | `.docx`          | one, paragraphs joined by newlines         | blank           |
//! | `.ppt`, `.pptx`  | one, slides in order                       | blank           |
//! | `.srt`           | cues grouped into ~1000-character windows  | `HH:MM:SS`      |
//! | `.txt`           | one, lossy UTF-8                           | blank           |
//!
//! PDFs also produce a first-page thumbnail (see [`crate::thumbnail`]).
//! Extraction never panics on malformed input; it returns an [`ExtractError`]
//! and bulk ingestion records the file as failed.

use std::io::Read;
use std::path::Path;

use lopdf::{Document, Object};
use tracing::debug;

use crate::error::ExtractError;
use crate::models::{ExtractedSegment, PageOrTimestamp};
use crate::thumbnail;

pub const MIME_PNG: &str = "image/png";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Target size of a grouped subtitle segment, in characters.
const SRT_SEGMENT_CHARS: usize = 1000;

/// Supported source formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Pdf,
    Docx,
    Ppt,
    Srt,
    Txt,
}

impl Format {
    /// Pick a format from the key's extension, ignoring case.
    pub fn from_path(key: &str) -> Option<Format> {
        let ext = Path::new(key)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())?;
        match ext.as_str() {
            "pdf" => Some(Format::Pdf),
            "docx" => Some(Format::Docx),
            "ppt" | "pptx" => Some(Format::Ppt),
            "srt" => Some(Format::Srt),
            "txt" => Some(Format::Txt),
            _ => None,
        }
    }
}

/// PNG rendering of a PDF's first page and the key it is stored under.
#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub key: String,
    pub png: Vec<u8>,
}

/// Everything extracted from one file.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub segments: Vec<ExtractedSegment>,
    pub thumbnail: Option<Thumbnail>,
}

/// Human-readable name for a key: the file name without its extension.
pub fn readable_filename(key: &str) -> String {
    Path::new(key)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Object key of the first-page thumbnail for a PDF key.
pub fn thumbnail_key(key: &str) -> String {
    let stem = if key.to_ascii_lowercase().ends_with(".pdf") {
        &key[..key.len() - 4]
    } else {
        key
    };
    format!("{}-pg1-thumb.png", stem)
}

/// Extract segments (and a thumbnail for PDFs) from `bytes`.
pub fn extract(format: Format, key: &str, bytes: &[u8]) -> Result<Extraction, ExtractError> {
    let name = readable_filename(key);
    match format {
        Format::Pdf => {
            let segments = extract_pdf(bytes, &name)?;
            let png = thumbnail::render_first_page(bytes)?;
            Ok(Extraction {
                segments,
                thumbnail: Some(Thumbnail {
                    key: thumbnail_key(key),
                    png,
                }),
            })
        }
        Format::Docx => Ok(single(extract_docx(bytes)?, &name)),
        Format::Ppt => Ok(single(extract_pptx(bytes)?, &name)),
        Format::Srt => Ok(Extraction {
            segments: extract_srt(bytes, &name)?,
            thumbnail: None,
        }),
        Format::Txt => Ok(single(String::from_utf8_lossy(bytes).into_owned(), &name)),
    }
}

fn single(text: String, name: &str) -> Extraction {
    Extraction {
        segments: vec![ExtractedSegment {
            text,
            position: PageOrTimestamp::blank(),
            readable_filename: name.to_string(),
        }],
        thumbnail: None,
    }
}

// ---------------------------------------------------------------- PDF

fn extract_pdf(bytes: &[u8], name: &str) -> Result<Vec<ExtractedSegment>, ExtractError> {
    let pages = match pdf_pages_via_pdf_extract(bytes) {
        Ok(pages) if pages.iter().any(|p| !p.trim().is_empty()) => pages,
        Ok(_) => {
            debug!(file = name, "pdf-extract found no text, trying lopdf");
            pdf_pages_via_lopdf(bytes)?
        }
        Err(e) => {
            debug!(file = name, error = %e, "pdf-extract failed, trying lopdf");
            pdf_pages_via_lopdf(bytes)?
        }
    };

    Ok(pages
        .into_iter()
        .enumerate()
        .map(|(i, text)| ExtractedSegment {
            text: text.chars().filter(|c| c.is_ascii()).collect(),
            position: PageOrTimestamp::Page(i as u32 + 1),
            readable_filename: name.to_string(),
        })
        .collect())
}

fn pdf_pages_via_pdf_extract(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    // pdf-extract panics on some malformed inputs.
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        pdf_extract::extract_text_from_mem_by_pages(bytes)
    }));
    match result {
        Ok(Ok(pages)) => Ok(pages),
        Ok(Err(e)) => Err(ExtractError::Pdf(e.to_string())),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ExtractError::Pdf(format!("pdf-extract panicked: {}", msg)))
        }
    }
}

/// Page texts from raw content-stream text operators. Less faithful than
/// pdf-extract for embedded fonts but tolerant of odd files.
pub(crate) fn pdf_pages_via_lopdf(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    let doc = Document::load_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    let mut pages = Vec::new();
    for (_, page_id) in doc.get_pages() {
        let mut text = String::new();
        if let Ok(content) = doc.get_page_content(page_id) {
            let operations = lopdf::content::Content::decode(&content)
                .map(|c| c.operations)
                .unwrap_or_default();
            for op in operations {
                match op.operator.as_str() {
                    "Tj" | "'" | "\"" => {
                        if let Some(Object::String(bytes, _)) = op.operands.last() {
                            text.push_str(&decode_pdf_string(bytes));
                        }
                    }
                    "TJ" => {
                        if let Some(Object::Array(items)) = op.operands.first() {
                            for item in items {
                                if let Object::String(bytes, _) = item {
                                    text.push_str(&decode_pdf_string(bytes));
                                }
                            }
                        }
                    }
                    "Td" | "TD" | "T*" => {
                        if !text.is_empty() && !text.ends_with(char::is_whitespace) {
                            text.push(' ');
                        }
                    }
                    "ET" => {
                        if !text.is_empty() && !text.ends_with('\n') {
                            text.push('\n');
                        }
                    }
                    _ => {}
                }
            }
        }
        pages.push(text);
    }
    Ok(pages)
}

fn decode_pdf_string(bytes: &[u8]) -> String {
    String::from_utf8(bytes.to_vec()).unwrap_or_else(|_| bytes.iter().map(|&b| b as char).collect())
}

// ---------------------------------------------------------------- OOXML

fn open_zip(bytes: &[u8]) -> Result<zip::ZipArchive<std::io::Cursor<&[u8]>>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(format!("not an OOXML container: {}", e)))
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;
    let text = collect_text_runs(&xml, '\n')?;
    Ok(text.trim_end().to_string())
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let mut slide_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    if slide_names.is_empty() {
        return Err(ExtractError::Ooxml("no slides found".to_string()));
    }
    slide_names.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut slides = Vec::with_capacity(slide_names.len());
    for name in slide_names {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        let text = collect_text_runs(&xml, ' ')?;
        let text = text.trim();
        if !text.is_empty() {
            slides.push(text.to_string());
        }
    }
    Ok(slides.join("\n\n"))
}

/// Concatenate the text of every `<*:t>` element, emitting `paragraph_sep`
/// at the end of each `<*:p>`.
fn collect_text_runs(xml: &[u8], paragraph_sep: char) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push(paragraph_sep),
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if matches!(e.local_name().as_ref(), b"tab" | b"br") {
                    out.push(' ');
                }
            }
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

// ---------------------------------------------------------------- SRT

#[derive(Debug, PartialEq)]
struct Cue {
    start: String,
    text: String,
}

fn extract_srt(bytes: &[u8], name: &str) -> Result<Vec<ExtractedSegment>, ExtractError> {
    let content = String::from_utf8_lossy(bytes);
    let cues = parse_srt(&content)?;

    let mut segments = Vec::new();
    let mut current: Option<(String, String)> = None;
    for cue in cues {
        match current.as_mut() {
            Some((_, text)) if text.len() + 1 + cue.text.len() <= SRT_SEGMENT_CHARS => {
                text.push(' ');
                text.push_str(&cue.text);
            }
            _ => {
                if let Some((start, text)) = current.take() {
                    segments.push(srt_segment(start, text, name));
                }
                current = Some((cue.start, cue.text));
            }
        }
    }
    if let Some((start, text)) = current {
        segments.push(srt_segment(start, text, name));
    }
    Ok(segments)
}

fn srt_segment(start: String, text: String, name: &str) -> ExtractedSegment {
    ExtractedSegment {
        text,
        position: PageOrTimestamp::Label(start),
        readable_filename: name.to_string(),
    }
}

fn parse_srt(content: &str) -> Result<Vec<Cue>, ExtractError> {
    let content = content.trim_start_matches('\u{feff}').replace("\r\n", "\n");
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut cues = Vec::new();
    for lines in cue_blocks(&content) {
        let Some(timing_idx) = lines.iter().position(|l| l.contains("-->")) else {
            continue;
        };
        let start = lines[timing_idx]
            .split("-->")
            .next()
            .map(str::trim)
            .unwrap_or_default();
        let start = normalize_timestamp(start)?;
        let text = lines[timing_idx + 1..].join(" ");
        if !text.is_empty() {
            cues.push(Cue { start, text });
        }
    }

    if cues.is_empty() {
        return Err(ExtractError::Srt("no subtitle cues found".to_string()));
    }
    Ok(cues)
}

/// Trimmed lines grouped into blocks; any whitespace-only line separates.
fn cue_blocks(content: &str) -> Vec<Vec<&str>> {
    let mut blocks = Vec::new();
    let mut current = Vec::new();
    for line in content.lines().map(str::trim) {
        if line.is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

/// `00:01:05,120` → `00:01:05`.
fn normalize_timestamp(raw: &str) -> Result<String, ExtractError> {
    let clock = raw.split([',', '.']).next().unwrap_or_default();
    let parts: Vec<&str> = clock.split(':').collect();
    let valid = parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if !valid {
        return Err(ExtractError::Srt(format!("malformed timestamp '{}'", raw)));
    }
    Ok(format!("{:0>2}:{:0>2}:{:0>2}", parts[0], parts[1], parts[2]))
}
