//! NZB index generation
//!
//! Consumes the article set a job produced and writes a single NZB document
//! describing it, optionally compressed (`.nzb.zst` / `.nzb.br`).

use crate::config::{CompressionType, NzbCompressionConfig};
use crate::error::{Error, Result};
use crate::poster::{PostedFile, PostedSegment};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event as XmlEvent};
use std::io::Write as _;
use std::path::{Path, PathBuf};

/// Writes NZB documents for completed jobs
pub struct NzbWriter {
    output_dir: PathBuf,
    compression: NzbCompressionConfig,
}

impl NzbWriter {
    /// Create a writer rooted at `output_dir`.
    pub fn new(output_dir: PathBuf, compression: NzbCompressionConfig) -> Self {
        Self {
            output_dir,
            compression,
        }
    }

    /// Write the NZB for a job whose source was `source_name` (relative path
    /// under the output directory, extension replaced by `.nzb`).
    ///
    /// Returns the full path of the written file.
    pub async fn write(&self, source_name: &Path, files: &[PostedFile]) -> Result<PathBuf> {
        let document = render_document(files)?;

        let stem = source_name
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::Nzb(format!("no file stem in {}", source_name.display())))?;

        let relative_dir = source_name.parent().unwrap_or_else(|| Path::new(""));
        let target_dir = self.output_dir.join(relative_dir);
        tokio::fs::create_dir_all(&target_dir).await?;

        let (bytes, extension) = match self.codec() {
            CompressionType::None => (document, "nzb".to_string()),
            CompressionType::Zstd => {
                let level = self.compression.level.clamp(1, 21);
                let compressed = zstd::stream::encode_all(&document[..], level)
                    .map_err(|e| Error::Nzb(format!("zstd compression failed: {}", e)))?;
                (compressed, "nzb.zst".to_string())
            }
            CompressionType::Brotli => {
                let params = brotli::enc::BrotliEncoderParams {
                    quality: self.compression.level.clamp(0, 11),
                    ..Default::default()
                };
                let mut compressed = Vec::new();
                brotli::enc::BrotliCompress(&mut &document[..], &mut compressed, &params)
                    .map_err(|e| Error::Nzb(format!("brotli compression failed: {}", e)))?;
                (compressed, "nzb.br".to_string())
            }
        };

        let nzb_path = target_dir.join(format!("{stem}.{extension}"));
        tokio::fs::write(&nzb_path, bytes).await?;

        tracing::info!(path = %nzb_path.display(), files = files.len(), "NZB written");

        Ok(nzb_path)
    }

    fn codec(&self) -> CompressionType {
        if self.compression.enabled {
            self.compression.r#type
        } else {
            CompressionType::None
        }
    }
}

/// Render the NZB XML document for a set of posted files.
fn render_document(files: &[PostedFile]) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer
        .write_event(XmlEvent::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(|e| Error::Nzb(e.to_string()))?;
    writer
        .write_event(XmlEvent::DocType(BytesText::from_escaped(
            r#"nzb PUBLIC "-//newzBin//DTD NZB 1.1//EN" "http://www.newzbin.com/DTD/nzb/nzb-1.1.dtd""#,
        )))
        .map_err(|e| Error::Nzb(e.to_string()))?;

    let mut nzb = BytesStart::new("nzb");
    nzb.push_attribute(("xmlns", "http://www.newzbin.com/DTD/2003/nzb"));
    writer.write_event(XmlEvent::Start(nzb)).map_err(|e| Error::Nzb(e.to_string()))?;

    // File-level hashes ride along as head metadata
    writer
        .write_event(XmlEvent::Start(BytesStart::new("head")))
        .map_err(|e| Error::Nzb(e.to_string()))?;
    for file in files {
        let mut meta = BytesStart::new("meta");
        meta.push_attribute(("type", "x_sha256"));
        writer.write_event(XmlEvent::Start(meta)).map_err(|e| Error::Nzb(e.to_string()))?;
        writer
            .write_event(XmlEvent::Text(BytesText::new(&format!(
                "{}:{}",
                file.file_name, file.file_hash
            ))))
            .map_err(|e| Error::Nzb(e.to_string()))?;
        writer
            .write_event(XmlEvent::End(BytesEnd::new("meta")))
            .map_err(|e| Error::Nzb(e.to_string()))?;
    }
    writer
        .write_event(XmlEvent::End(BytesEnd::new("head")))
        .map_err(|e| Error::Nzb(e.to_string()))?;

    for file in files {
        write_file_element(&mut writer, file)?;
    }

    writer
        .write_event(XmlEvent::End(BytesEnd::new("nzb")))
        .map_err(|e| Error::Nzb(e.to_string()))?;

    let mut bytes = writer.into_inner();
    bytes.write_all(b"\n").map_err(|e| Error::Nzb(e.to_string()))?;
    Ok(bytes)
}

fn write_file_element(writer: &mut Writer<Vec<u8>>, file: &PostedFile) -> Result<()> {
    let date = file.posted_at.to_string();
    let mut file_el = BytesStart::new("file");
    file_el.push_attribute(("poster", file.poster.as_str()));
    file_el.push_attribute(("date", date.as_str()));
    file_el.push_attribute(("subject", file.subject.as_str()));
    writer.write_event(XmlEvent::Start(file_el)).map_err(|e| Error::Nzb(e.to_string()))?;

    writer.write_event(XmlEvent::Start(BytesStart::new("groups"))).map_err(|e| Error::Nzb(e.to_string()))?;
    for group in &file.groups {
        writer.write_event(XmlEvent::Start(BytesStart::new("group"))).map_err(|e| Error::Nzb(e.to_string()))?;
        writer.write_event(XmlEvent::Text(BytesText::new(group))).map_err(|e| Error::Nzb(e.to_string()))?;
        writer.write_event(XmlEvent::End(BytesEnd::new("group"))).map_err(|e| Error::Nzb(e.to_string()))?;
    }
    writer.write_event(XmlEvent::End(BytesEnd::new("groups"))).map_err(|e| Error::Nzb(e.to_string()))?;

    writer.write_event(XmlEvent::Start(BytesStart::new("segments"))).map_err(|e| Error::Nzb(e.to_string()))?;
    // Segments are written in part-number order so reconstruction is deterministic
    let mut segments: Vec<&PostedSegment> = file.segments.iter().collect();
    segments.sort_by_key(|s| s.number);
    for segment in segments {
        let bytes = segment.bytes.to_string();
        let number = segment.number.to_string();
        let mut seg_el = BytesStart::new("segment");
        seg_el.push_attribute(("bytes", bytes.as_str()));
        seg_el.push_attribute(("number", number.as_str()));
        writer.write_event(XmlEvent::Start(seg_el)).map_err(|e| Error::Nzb(e.to_string()))?;
        writer.write_event(XmlEvent::Text(BytesText::new(&segment.message_id))).map_err(|e| Error::Nzb(e.to_string()))?;
        writer.write_event(XmlEvent::End(BytesEnd::new("segment"))).map_err(|e| Error::Nzb(e.to_string()))?;
    }
    writer.write_event(XmlEvent::End(BytesEnd::new("segments"))).map_err(|e| Error::Nzb(e.to_string()))?;

    writer.write_event(XmlEvent::End(BytesEnd::new("file"))).map_err(|e| Error::Nzb(e.to_string()))?;
    Ok(())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompressionType, NzbCompressionConfig};
    use tempfile::TempDir;

    fn posted_file() -> PostedFile {
        PostedFile {
            path: PathBuf::from("/watch/movie.bin"),
            file_name: "movie.bin".to_string(),
            subject: "[1/1] \"movie.bin\" - 2048 - yEnc (1/2)".to_string(),
            poster: "anon <anon@example.com>".to_string(),
            groups: vec!["alt.binaries.test".to_string()],
            posted_at: 1_700_000_000,
            file_hash: "deadbeef".to_string(),
            segments: vec![
                PostedSegment {
                    number: 2,
                    bytes: 1024,
                    message_id: "part2@example.com".to_string(),
                    groups: vec!["alt.binaries.test".to_string()],
                },
                PostedSegment {
                    number: 1,
                    bytes: 1024,
                    message_id: "part1@example.com".to_string(),
                    groups: vec!["alt.binaries.test".to_string()],
                },
            ],
        }
    }

    #[tokio::test]
    async fn writes_plain_nzb() {
        let dir = TempDir::new().unwrap();
        let writer = NzbWriter::new(dir.path().to_path_buf(), NzbCompressionConfig::default());

        let path = writer
            .write(Path::new("movie.bin"), &[posted_file()])
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("movie.nzb"));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("<?xml"));
        assert!(content.contains("<!DOCTYPE nzb"));
        assert!(content.contains(r#"xmlns="http://www.newzbin.com/DTD/2003/nzb""#));
        assert!(content.contains("alt.binaries.test"));
        assert!(content.contains("part1@example.com"));
        assert!(content.contains(r#"date="1700000000""#));
        assert!(content.contains("movie.bin:deadbeef"));
    }

    #[tokio::test]
    async fn segments_are_ordered_by_part_number() {
        let dir = TempDir::new().unwrap();
        let writer = NzbWriter::new(dir.path().to_path_buf(), NzbCompressionConfig::default());

        let path = writer
            .write(Path::new("movie.bin"), &[posted_file()])
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let first = content.find("part1@example.com").unwrap();
        let second = content.find("part2@example.com").unwrap();
        assert!(first < second, "segment 1 must precede segment 2");
        assert!(content.contains(r#"number="1""#));
        assert!(content.contains(r#"number="2""#));
    }

    #[tokio::test]
    async fn preserves_relative_subdirectories() {
        let dir = TempDir::new().unwrap();
        let writer = NzbWriter::new(dir.path().to_path_buf(), NzbCompressionConfig::default());

        let path = writer
            .write(Path::new("season1/episode.bin"), &[posted_file()])
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("season1/episode.nzb"));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn zstd_output_roundtrips() {
        let dir = TempDir::new().unwrap();
        let writer = NzbWriter::new(
            dir.path().to_path_buf(),
            NzbCompressionConfig {
                enabled: true,
                r#type: CompressionType::Zstd,
                level: 3,
            },
        );

        let path = writer
            .write(Path::new("movie.bin"), &[posted_file()])
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("movie.nzb.zst"));
        let compressed = std::fs::read(&path).unwrap();
        let decompressed = zstd::stream::decode_all(&compressed[..]).unwrap();
        let content = String::from_utf8(decompressed).unwrap();
        assert!(content.contains("part1@example.com"));
    }

    #[tokio::test]
    async fn brotli_output_gets_br_extension() {
        let dir = TempDir::new().unwrap();
        let writer = NzbWriter::new(
            dir.path().to_path_buf(),
            NzbCompressionConfig {
                enabled: true,
                r#type: CompressionType::Brotli,
                level: 5,
            },
        );

        let path = writer
            .write(Path::new("movie.bin"), &[posted_file()])
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("movie.nzb.br"));
        let compressed = std::fs::read(&path).unwrap();
        assert!(!compressed.is_empty());
        assert_ne!(&compressed[..5.min(compressed.len())], b"<?xml");
    }

    #[tokio::test]
    async fn disabled_compression_ignores_codec() {
        let dir = TempDir::new().unwrap();
        let writer = NzbWriter::new(
            dir.path().to_path_buf(),
            NzbCompressionConfig {
                enabled: false,
                r#type: CompressionType::Zstd,
                level: 3,
            },
        );

        let path = writer
            .write(Path::new("movie.bin"), &[posted_file()])
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("movie.nzb"));
    }
}
