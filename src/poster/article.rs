//! Article construction — segmentation, headers, message-IDs, obfuscation.
//!
//! For a given source file, articles partition `[0, size)` into contiguous
//! windows of the configured segment size (the last window may be short).
//! Everything about an article except its body bytes is decided here, so the
//! upload workers only read, hash, encode, and post.

use crate::config::{GroupPolicy, MessageIdFormat, ObfuscationPolicy, PostingConfig};
use rand::Rng;
use rand::distributions::Alphanumeric;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Whether a file carries payload data or recovery data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartType {
    /// Source payload
    Data,
    /// PAR2 recovery file
    Par2,
}

impl PartType {
    /// Derivation tag used by seed-based message-IDs
    fn tag(self) -> &'static str {
        match self {
            PartType::Data => "data",
            PartType::Par2 => "par2",
        }
    }

    /// Classify a path by extension.
    pub fn of_path(path: &Path) -> Self {
        let is_par2 = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("par2"));
        if is_par2 { PartType::Par2 } else { PartType::Data }
    }
}

/// One NNTP article: a segment of a file plus its headers
#[derive(Clone, Debug)]
pub struct Article {
    /// Wire identity, unique per message (no angle brackets)
    pub message_id: String,
    /// Subject actually posted (possibly obfuscated)
    pub subject: String,
    /// Canonical subject before obfuscation
    pub original_subject: String,
    /// From header actually posted
    pub from: String,
    /// Newsgroups this article goes to
    pub groups: Vec<String>,
    /// 1-based part number
    pub part_number: u32,
    /// Total parts for this file
    pub total_parts: u32,
    /// 1-based index of the file within the job
    pub file_number: u32,
    /// Filename carried on the wire (possibly obfuscated)
    pub file_name: String,
    /// Original filename on disk
    pub original_name: String,
    /// Byte offset of this segment within the source file
    pub offset: u64,
    /// Segment size in bytes
    pub size: u64,
    /// Total size of the source file in bytes
    pub file_size: u64,
    /// Extra headers from configuration
    pub custom_headers: Vec<(String, String)>,
    /// Optional X-NXG header value
    pub x_nxg_header: Option<String>,
    /// Explicit Date override (full obfuscation); epoch seconds
    pub date: Option<i64>,
    /// Payload vs recovery data
    pub part_type: PartType,
}

impl Article {
    /// Ordered header list for the wire.
    ///
    /// `posted_at` supplies the Date header unless the article carries an
    /// explicit (obfuscated) date.
    pub fn wire_headers(&self, posted_at: i64) -> Vec<(String, String)> {
        let date_secs = self.date.unwrap_or(posted_at);
        let date = chrono::DateTime::from_timestamp(date_secs, 0)
            .unwrap_or_else(chrono::Utc::now)
            .to_rfc2822();

        let mut headers = vec![
            ("From".to_string(), self.from.clone()),
            ("Newsgroups".to_string(), self.groups.join(",")),
            ("Message-ID".to_string(), format!("<{}>", self.message_id)),
            ("Subject".to_string(), self.subject.clone()),
            ("Date".to_string(), date),
        ];

        for (name, value) in &self.custom_headers {
            headers.push((name.clone(), value.clone()));
        }

        if let Some(nxg) = &self.x_nxg_header {
            headers.push(("X-NXG".to_string(), nxg.clone()));
        }

        headers
    }
}

/// Per-file random seed from which NXG message-IDs and the NXG header derive.
///
/// IDs are `sha256(seed ‖ tag ‖ part)` truncations: deterministic given the
/// seed, unlinkable without it. The header publishes the seed plus the
/// segment count so a reader holding the header can reconstruct every ID.
#[derive(Clone, Copy, Debug)]
pub struct NxgSeed([u8; 16]);

impl NxgSeed {
    /// Fresh random seed.
    pub fn random() -> Self {
        let mut seed = [0u8; 16];
        rand::thread_rng().fill(&mut seed);
        Self(seed)
    }

    /// Seed from fixed bytes (tests).
    #[cfg(test)]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// 32-hex-character derivation for (tag, n).
    fn derive(&self, tag: &str, n: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hasher.update(tag.as_bytes());
        hasher.update(n.to_be_bytes());
        let digest = hasher.finalize();
        hex_string(&digest[..16])
    }

    /// Message-ID for a part, shaped `local(32)@8.3` like the random format.
    pub fn message_id(&self, part_type: PartType, part_number: u32) -> String {
        let local = self.derive(part_type.tag(), u64::from(part_number));
        let domain = self.derive("domain", u64::from(part_number));
        format!("{}@{}.{}", local, &domain[..8], &domain[8..11])
    }

    /// Obfuscated subject derived for a part.
    pub fn subject(&self, part_number: u32) -> String {
        self.derive("subject", u64::from(part_number))
    }

    /// Header value: hex seed plus segment count, derived at part 0.
    pub fn header_value(&self, num_segments: u32) -> String {
        format!("{}:{}", hex_string(&self.0), num_segments)
    }
}

/// Description of one file to be segmented into articles
#[derive(Clone, Debug)]
pub struct FileSpec {
    /// Source path
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
    /// Payload or recovery data
    pub part_type: PartType,
    /// 1-based index within the job's file list
    pub file_number: u32,
    /// Total files in the job
    pub total_files: u32,
}

/// Build the ordered article set for one file.
///
/// Windows are `[i * segment, min((i+1) * segment, size))`; the final window
/// absorbs the remainder. Obfuscation follows the policy for the file's part
/// type.
pub fn build_articles(config: &PostingConfig, spec: &FileSpec, maintain_extension: bool) -> Vec<Article> {
    let segment_size = config.article_size_in_bytes.max(1);
    let num_segments = spec.size.div_ceil(segment_size).max(1) as u32;

    let original_name = spec
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed")
        .to_string();

    let groups = match config.group_policy {
        GroupPolicy::All => config.groups.clone(),
        GroupPolicy::EachFile => {
            let idx = rand::thread_rng().gen_range(0..config.groups.len().max(1));
            config.groups.get(idx).cloned().into_iter().collect()
        }
    };

    let policy = match spec.part_type {
        PartType::Data => config.obfuscation_policy,
        PartType::Par2 => config.par2_obfuscation_policy,
    };

    let seed = NxgSeed::random();
    let file_from = match &config.post_headers.default_from {
        Some(from) => from.clone(),
        None => random_from(),
    };

    let x_nxg_header = if config.post_headers.add_ngx_header
        && policy != ObfuscationPolicy::Full
        && config.message_id_format != MessageIdFormat::Ngx
    {
        Some(seed.header_value(num_segments))
    } else {
        None
    };

    let custom_headers: Vec<(String, String)> = config
        .post_headers
        .custom_headers
        .iter()
        .map(|h| (h.name.clone(), h.value.clone()))
        .collect();

    let extension = spec.path.extension().and_then(|e| e.to_str());

    let mut articles = Vec::with_capacity(num_segments as usize);
    for i in 0..num_segments {
        let part_number = i + 1;
        let offset = u64::from(i) * segment_size;
        let size = segment_size.min(spec.size - offset);

        let message_id = match config.message_id_format {
            MessageIdFormat::Random => random_message_id(),
            MessageIdFormat::Ngx => seed.message_id(spec.part_type, part_number),
        };

        let original_subject = format!(
            "[{}/{}] \"{}\" - {} - yEnc ({}/{})",
            spec.file_number, spec.total_files, original_name, spec.size, part_number, num_segments
        );

        let (subject, file_name, from, date) = match policy {
            ObfuscationPolicy::None => (
                original_subject.clone(),
                original_name.clone(),
                file_from.clone(),
                None,
            ),
            ObfuscationPolicy::Partial => {
                let hashed_name = format!(
                    "{:x}",
                    md5::compute(format!("{original_name}{part_number}"))
                );
                let file_name = with_extension(hashed_name, extension, maintain_extension);
                let subject = match config.message_id_format {
                    MessageIdFormat::Random => {
                        format!("{:x}", md5::compute(&original_subject))
                    }
                    MessageIdFormat::Ngx => seed.subject(part_number),
                };
                (subject, file_name, file_from.clone(), None)
            }
            ObfuscationPolicy::Full => {
                let file_name =
                    with_extension(random_string(22), extension, maintain_extension);
                let date = chrono::Utc::now().timestamp()
                    - rand::thread_rng().gen_range(0..6 * 3600);
                (random_string(22), file_name, random_from(), Some(date))
            }
        };

        articles.push(Article {
            message_id,
            subject,
            original_subject,
            from,
            groups: groups.clone(),
            part_number,
            total_parts: num_segments,
            file_number: spec.file_number,
            file_name,
            original_name: original_name.clone(),
            offset,
            size,
            file_size: spec.size,
            custom_headers: custom_headers.clone(),
            x_nxg_header: x_nxg_header.clone(),
            date,
            part_type: spec.part_type,
        });
    }

    articles
}

/// Random message-ID: 32-character local part with an 8.3 domain.
pub fn random_message_id() -> String {
    format!(
        "{}@{}.{}",
        random_string(32),
        random_string(8).to_lowercase(),
        random_string(3).to_lowercase()
    )
}

/// Random synthetic From address.
fn random_from() -> String {
    let user = random_string(10).to_lowercase();
    let host = random_string(8).to_lowercase();
    let tld = random_string(3).to_lowercase();
    format!("{user} <{user}@{host}.{tld}>")
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn with_extension(name: String, extension: Option<&str>, maintain: bool) -> String {
    match (maintain, extension) {
        (true, Some(ext)) => format!("{name}.{ext}"),
        _ => name,
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
