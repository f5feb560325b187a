//! Upload validation, classification and PDF text extraction.

use std::sync::OnceLock;

use lopdf::{Dictionary, Document, Object};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BloomError, Result};

pub const PDF_MIME_TYPE: &str = "application/pdf";
pub const MAX_FILE_SIZE: usize = 50 * 1024 * 1024;
pub const IMAGE_MIME_TYPES: [&str; 5] = [
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/gif",
    "image/webp",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Pdf,
    Image,
    Unknown,
}

/// An uploaded file as received from the client.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_image(&self) -> bool {
        IMAGE_MIME_TYPES.contains(&self.mime_type.as_str())
    }
}

/// Returns every problem with the upload at once, as `BloomError::Validation`.
pub fn validate_pdf(file: &UploadedFile, max_size: usize) -> Result<()> {
    let mut errors = Vec::new();
    if file.mime_type != PDF_MIME_TYPE {
        errors.push(format!(
            "Unsupported file type: {}. Only PDF files are supported.",
            file.mime_type
        ));
    }
    if file.size() == 0 {
        errors.push("File is empty".to_string());
    }
    if file.size() > max_size {
        errors.push(format!(
            "File size ({:.2}MB) exceeds maximum allowed size of {}MB",
            file.size() as f64 / 1024.0 / 1024.0,
            max_size as f64 / 1024.0 / 1024.0
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(BloomError::Validation(errors))
    }
}

pub fn is_valid_pdf(file: &UploadedFile, max_size: usize) -> bool {
    file.mime_type == PDF_MIME_TYPE && file.size() <= max_size
}

/// PDF MIME type wins regardless of size; oversize PDFs are rejected later by
/// validation with the itemized reasons.
pub fn classify(file: &UploadedFile) -> Result<DocumentType> {
    if file.mime_type == PDF_MIME_TYPE {
        Ok(DocumentType::Pdf)
    } else if file.is_image() {
        Ok(DocumentType::Image)
    } else {
        Err(BloomError::Analysis {
            message: "Unsupported file type. Please upload a PDF or image file.".into(),
            details: Some(format!("mime type `{}`", file.mime_type)),
        })
    }
}

/// `0 Bytes`, `512 Bytes`, `1.5 KB`, `2 MB`...
pub fn format_file_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 Bytes".into();
    }
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = (value * 100.0).round() / 100.0;
    format!("{} {}", rounded, UNITS[unit])
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static regex"))
}

/// Strips control and replacement characters, collapses runs of horizontal
/// whitespace and keeps at most one blank line between paragraphs.
pub fn preprocess_text(text: &str) -> String {
    static HORIZONTAL: OnceLock<Regex> = OnceLock::new();
    static BREAKS: OnceLock<Regex> = OnceLock::new();

    let cleaned: String = text
        .chars()
        .filter(|c| *c != '\u{FFFD}' && (!c.is_control() || *c == '\n' || *c == '\t'))
        .collect();
    let collapsed = regex(&HORIZONTAL, r"[ \t\x{00A0}]+").replace_all(&cleaned, " ");
    let paragraphs = regex(&BREAKS, r" ?\n[ \n]*").replace_all(&collapsed, |caps: &regex::Captures| {
        if caps[0].matches('\n').count() > 1 {
            "\n\n"
        } else {
            "\n"
        }
    });
    paragraphs.trim().to_string()
}

/// Document information dictionary plus derived fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdfMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modification_date: Option<String>,
}

/// Raw output of a PDF backend: one entry per page, in order.
#[derive(Debug, Clone, Default)]
pub struct RawPdf {
    pub pages: Vec<std::result::Result<String, String>>,
    pub metadata: PdfMetadata,
}

pub trait PdfExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8]) -> Result<RawPdf>;
}

/// Extractor backed by `lopdf`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl LopdfExtractor {
    fn info_dictionary(doc: &Document) -> Option<&Dictionary> {
        match doc.trailer.get(b"Info").ok()? {
            Object::Reference(id) => doc.get_dictionary(*id).ok(),
            Object::Dictionary(dict) => Some(dict),
            _ => None,
        }
    }

    fn info_string(info: &Dictionary, key: &[u8]) -> Option<String> {
        match info.get(key).ok()? {
            Object::String(bytes, _) => {
                let text = decode_pdf_string(bytes);
                (!text.trim().is_empty()).then_some(text)
            }
            _ => None,
        }
    }
}

/// PDF text strings are UTF-16BE with a BOM, or single-byte otherwise.
fn decode_pdf_string(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        bytes.iter().map(|b| *b as char).collect()
    }
}

impl PdfExtractor for LopdfExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<RawPdf> {
        let doc = Document::load_mem(bytes).map_err(|err| BloomError::Extraction(err.to_string()))?;

        let pages = doc
            .get_pages()
            .keys()
            .map(|page_number| {
                doc.extract_text(&[*page_number])
                    .map_err(|err| err.to_string())
            })
            .collect();

        let metadata = Self::info_dictionary(&doc)
            .map(|info| PdfMetadata {
                title: Self::info_string(info, b"Title"),
                author: Self::info_string(info, b"Author"),
                creator: Self::info_string(info, b"Creator"),
                producer: Self::info_string(info, b"Producer"),
                creation_date: Self::info_string(info, b"CreationDate"),
                modification_date: Self::info_string(info, b"ModDate"),
            })
            .unwrap_or_default();

        Ok(RawPdf { pages, metadata })
    }
}

/// Cleaned text of a PDF together with its page count and metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedPdf {
    pub text: String,
    pub pages: usize,
    pub metadata: PdfMetadata,
}

/// Validates, extracts and preprocesses a PDF upload.
///
/// Pages that fail individually are replaced with a marker; a document where
/// every page fails, or with no printable text, is an error.
pub fn extract_pdf(
    extractor: &dyn PdfExtractor,
    file: &UploadedFile,
    max_size: usize,
) -> Result<ExtractedPdf> {
    validate_pdf(file, max_size)?;

    let raw = extractor.extract(&file.bytes)?;
    if raw.pages.is_empty() {
        return Err(BloomError::NoExtractableText);
    }
    if raw.pages.iter().all(|page| page.is_err()) {
        return Err(BloomError::Extraction("no page could be read".into()));
    }

    let mut joined = String::new();
    for (index, page) in raw.pages.iter().enumerate() {
        match page {
            Ok(text) => joined.push_str(text),
            Err(reason) => {
                warn!(page = index + 1, error = %reason, "failed extracting page text");
                joined.push_str(&format!("[Error extracting page {}]", index + 1));
            }
        }
        joined.push_str("\n\n");
    }

    let text = preprocess_text(&joined);
    if text.trim().is_empty() {
        return Err(BloomError::NoExtractableText);
    }
    debug!(file = %file.file_name, pages = raw.pages.len(), chars = text.len(), "extracted PDF text");

    Ok(ExtractedPdf {
        text,
        pages: raw.pages.len(),
        metadata: raw.metadata,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use lopdf::{dictionary, Document, Object, Stream, StringFormat};

    /// Builds a PDF with one page per entry using the standard Helvetica font.
    pub fn make_pdf(pages: &[&str], title: Option<&str>) -> Vec<u8> {
        let mut doc = Document::with_version("1.4");
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });
        let pages_id = doc.new_object_id();

        let mut kids = Vec::new();
        for text in pages {
            let content = format!("BT /F1 12 Tf 72 700 Td ({text}) Tj ET");
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
                "Contents" => content_id,
                "Resources" => dictionary! {
                    "Font" => dictionary! { "F1" => font_id },
                },
            });
            kids.push(Object::Reference(page_id));
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        if let Some(title) = title {
            let info_id = doc.add_object(dictionary! {
                "Title" => Object::String(title.as_bytes().to_vec(), StringFormat::Literal),
                "Producer" => Object::String(
                    [&[0xFE, 0xFF][..], &[0x00, b'L', 0x00, b'a', 0x00, b'b']].concat(),
                    StringFormat::Hexadecimal,
                ),
            });
            doc.trailer.set("Info", info_id);
        }

        let mut buf = Vec::new();
        doc.save_to(&mut buf).unwrap();
        buf
    }
}
