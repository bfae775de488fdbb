//! Page-level text extraction for uploaded files.
//!
//! The format is sniffed from the bytes rather than trusted from the upload:
//!
//! | Format | Detection | Page units |
//! |--------|-----------|------------|
//! | PDF | `%PDF-` magic | one per PDF page |
//! | DOCX | ZIP containing `word/document.xml` | split at explicit page breaks |
//! | Text | valid UTF-8 | split at form feeds (`\x0c`) |
//!
//! Extraction never panics on corrupt input; it returns an [`ExtractError`]
//! and the pipeline marks the document `FAILED`.

use std::io::Read;

use thiserror::Error;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

const PDF_MAGIC: &[u8] = b"%PDF-";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const FORM_FEED: char = '\u{0c}';

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("unsupported format: {0}")]
    Unsupported(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
    #[error("document has no extractable text")]
    Empty,
}

/// The parser collaborator: bytes in, ordered page texts out.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> Result<Vec<String>, ExtractError>;
}

/// Default parser that sniffs PDF, DOCX, and plain text.
#[derive(Debug, Default, Clone, Copy)]
pub struct PageParser;

impl DocumentParser for PageParser {
    fn parse(&self, bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
        let pages = extract_pages(bytes)?;
        if pages.iter().all(|p| p.trim().is_empty()) {
            return Err(ExtractError::Empty);
        }
        Ok(pages)
    }
}

/// Split a document into page texts, in reading order.
pub fn extract_pages(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    if bytes.starts_with(PDF_MAGIC) {
        extract_pdf_pages(bytes)
    } else if bytes.starts_with(ZIP_MAGIC) {
        extract_docx_pages(bytes)
    } else {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| ExtractError::Unsupported("binary content".to_string()))?;
        Ok(text.split(FORM_FEED).map(|p| p.trim().to_string()).collect())
    }
}

fn extract_pdf_pages(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;
    Ok(pages.into_iter().map(|p| p.trim().to_string()).collect())
}

fn extract_docx_pages(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Unsupported("ZIP archive is not a DOCX".to_string()))?;

    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    docx_xml_pages(&xml)
}

/// Walk `w:t` runs, closing a line at each `w:p` and a page at each
/// `<w:br w:type="page"/>`.
fn docx_xml_pages(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    use quick_xml::events::Event;

    let mut pages = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(|e| ExtractError::Docx(e.to_string()))?;
                current.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => current.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"br" => {
                let is_page_break = e.attributes().flatten().any(|a| {
                    a.key.local_name().as_ref() == b"type" && a.value.as_ref() == b"page"
                });
                if is_page_break {
                    pages.push(current.trim().to_string());
                    current.clear();
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    pages.push(current.trim().to_string());
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx(document_xml: &str) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file(
                "word/document.xml",
                zip::write::SimpleFileOptions::default(),
            )
            .unwrap();
        writer.write_all(document_xml.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn plain_text_splits_on_form_feed() {
        let pages = PageParser.parse(b"page one\n\x0cpage two").unwrap();
        assert_eq!(pages, ["page one", "page two"]);
    }

    #[test]
    fn whitespace_only_document_is_empty() {
        let err = PageParser.parse(b"  \n \x0c ").unwrap_err();
        assert!(matches!(err, ExtractError::Empty));
    }

    #[test]
    fn binary_content_is_unsupported() {
        let err = PageParser.parse(&[0xFF, 0xFE, 0x00, 0x81]).unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported(_)));
    }

    #[test]
    fn corrupt_pdf_is_an_error() {
        let err = PageParser.parse(b"%PDF-1.7 garbage").unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn docx_page_breaks_split_pages() {
        let xml = r#"<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>
            <w:p><w:r><w:t>First page</w:t></w:r></w:p>
            <w:p><w:r><w:br w:type="page"/><w:t>Second page</w:t></w:r></w:p>
        </w:body></w:document>"#;
        let pages = PageParser.parse(&docx(xml)).unwrap();
        assert_eq!(pages, ["First page", "Second page"]);
    }

    #[test]
    fn zip_without_document_xml_is_unsupported() {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file("readme.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"hi").unwrap();
        let bytes = writer.finish().unwrap().into_inner();
        assert!(matches!(
            PageParser.parse(&bytes).unwrap_err(),
            ExtractError::Unsupported(_)
        ));
    }
}
