//! Evidence Index (EI), §4.7, plus the Source / Document / Chunk / Fact
//! types from §3.
//!
//! Three tables plus FTS5: WAL mode, `content=''` external-content-less FTS
//! tables kept in sync by explicit inserts rather than triggers.

use crate::store::Partition;
use crate::types::{ContentHash, DocId, DocKind, FactId, IdentityMatchLevel, SnippetId, SourceId, Tier};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

const MIGRATIONS: &[&str] = &[r#"
CREATE TABLE sources (
    source_id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    final_url TEXT NOT NULL,
    host TEXT NOT NULL,
    root_domain TEXT NOT NULL,
    tier INTEGER NOT NULL,
    doc_kind TEXT NOT NULL,
    content_type TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    bytes INTEGER NOT NULL,
    fetched_at TEXT NOT NULL,
    fetch_mode TEXT NOT NULL,
    status_code INTEGER,
    identity_match_level TEXT NOT NULL,
    target_match_score REAL NOT NULL,
    page_product_cluster_id TEXT
);

CREATE TABLE documents (
    doc_id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL REFERENCES sources(source_id),
    content_hash TEXT NOT NULL,
    parser_version TEXT NOT NULL,
    chunker_version TEXT NOT NULL,
    parsed_ok INTEGER NOT NULL,
    indexed_at TEXT NOT NULL,
    UNIQUE(content_hash, parser_version, chunker_version)
);

CREATE TABLE doc_source_links (
    doc_id TEXT NOT NULL REFERENCES documents(doc_id),
    source_id TEXT NOT NULL REFERENCES sources(source_id),
    PRIMARY KEY (doc_id, source_id)
);

CREATE TABLE chunks (
    snippet_id TEXT PRIMARY KEY,
    doc_id TEXT NOT NULL REFERENCES documents(doc_id),
    surface TEXT NOT NULL,
    text TEXT NOT NULL,
    start_offset INTEGER NOT NULL,
    end_offset INTEGER NOT NULL,
    text_hash TEXT NOT NULL
);

CREATE VIRTUAL TABLE chunks_fts USING fts5(snippet_id UNINDEXED, text);

CREATE TABLE facts (
    fact_id TEXT PRIMARY KEY,
    doc_id TEXT NOT NULL REFERENCES documents(doc_id),
    table_id TEXT NOT NULL,
    row_id TEXT NOT NULL,
    raw_key TEXT NOT NULL,
    raw_value TEXT NOT NULL,
    normalized_key TEXT NOT NULL,
    normalized_value TEXT NOT NULL,
    unit_hint TEXT,
    snippet_id TEXT NOT NULL REFERENCES chunks(snippet_id)
);

CREATE VIRTUAL TABLE facts_fts USING fts5(fact_id UNINDEXED, normalized_key, normalized_value);
"#];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Surface {
    Title,
    Heading,
    Paragraph,
    TableRow,
    Caption,
    ListItem,
    Kv,
}

impl Surface {
    fn as_str(self) -> &'static str {
        match self {
            Surface::Title => "title",
            Surface::Heading => "heading",
            Surface::Paragraph => "paragraph",
            Surface::TableRow => "table_row",
            Surface::Caption => "caption",
            Surface::ListItem => "list_item",
            Surface::Kv => "kv",
        }
    }

    fn parse(s: &str) -> Surface {
        match s {
            "title" => Surface::Title,
            "heading" => Surface::Heading,
            "table_row" => Surface::TableRow,
            "caption" => Surface::Caption,
            "list_item" => Surface::ListItem,
            "kv" => Surface::Kv,
            _ => Surface::Paragraph,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub source_id: SourceId,
    pub url: String,
    pub final_url: String,
    pub host: String,
    pub root_domain: String,
    pub tier: Tier,
    pub doc_kind: DocKind,
    pub content_type: String,
    pub content_hash: ContentHash,
    pub bytes: u64,
    pub fetched_at: DateTime<Utc>,
    pub fetch_mode: crate::types::FetchMode,
    pub status_code: Option<u16>,
    pub identity_match_level: IdentityMatchLevel,
    pub target_match_score: f64,
    pub page_product_cluster_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: DocId,
    pub source_id: SourceId,
    pub content_hash: ContentHash,
    pub parser_version: String,
    pub chunker_version: String,
    pub parsed_ok: bool,
    pub indexed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub snippet_id: SnippetId,
    pub doc_id: DocId,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub surface: Surface,
    pub text_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub fact_id: FactId,
    pub doc_id: DocId,
    pub table_id: String,
    pub row_id: String,
    pub raw_key: String,
    pub raw_value: String,
    pub normalized_key: String,
    pub normalized_value: String,
    pub unit_hint: Option<String>,
    pub snippet_id: SnippetId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseMode {
    Identical,
    Updated,
}

#[derive(Debug, Clone)]
pub enum IndexOutcome {
    DedupeHit { doc_id: DocId, reuse_mode: ReuseMode },
    IndexedNew { doc_id: DocId, chunk_count: usize, fact_count: usize },
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub tier: Option<Tier>,
    pub doc_kind: Option<DocKind>,
    pub source_identity_match: Option<IdentityMatchLevel>,
    pub host: Option<String>,
}

/// `snippet_id = H(final_url || start_offset || end_offset || text_hash_prefix || parser_version || chunker_version)`
/// (invariant 2, §3): a pure function of content, offsets, and versions.
pub fn compute_snippet_id(
    final_url: &str,
    start_offset: usize,
    end_offset: usize,
    text_hash: &str,
    parser_version: &str,
    chunker_version: &str,
) -> SnippetId {
    let text_hash_prefix = &text_hash[..text_hash.len().min(16)];
    let payload = format!(
        "{final_url}\u{1}{start_offset}\u{1}{end_offset}\u{1}{text_hash_prefix}\u{1}{parser_version}\u{1}{chunker_version}"
    );
    blake3::hash(payload.as_bytes()).to_hex().to_string()
}

pub fn compute_content_hash(bytes: &[u8]) -> ContentHash {
    blake3::hash(bytes).to_hex().to_string()
}

/// Split raw text into paragraph-surface chunks on blank lines. This is the
/// crate's chunker; real HTML/PDF structure-awareness lives upstream of the
/// content this crate receives (see DESIGN.md's Open Question on
/// pdf_text/pdf_ocr/image_ocr).
pub fn chunk_paragraphs(text: &str) -> Vec<(usize, usize, &str, Surface)> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    for raw_para in text.split("\n\n") {
        let trimmed = raw_para.trim();
        let start = offset + raw_para.find(trimmed).unwrap_or(0);
        if !trimmed.is_empty() {
            let surface = if trimmed.contains(':') && trimmed.lines().count() == 1 {
                Surface::Kv
            } else {
                Surface::Paragraph
            };
            out.push((start, start + trimmed.len(), trimmed, surface));
        }
        offset += raw_para.len() + 2; // account for the "\n\n" separator
    }
    out
}

/// Parse `key: value` lines into normalized facts (the
/// `deterministic_normalizer` extraction method's raw material).
pub fn extract_kv_facts(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(|line| {
            let (k, v) = line.split_once(':')?;
            let key = k.trim();
            let value = v.trim();
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

pub fn normalize_key(raw: &str) -> String {
    raw.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

#[derive(Clone)]
pub struct EvidenceIndex {
    partition: Partition,
}

impl EvidenceIndex {
    pub fn open(path: impl AsRef<std::path::Path>) -> rusqlite::Result<Self> {
        Ok(EvidenceIndex {
            partition: Partition::open(path, MIGRATIONS)?,
        })
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Ok(EvidenceIndex {
            partition: Partition::open_in_memory(MIGRATIONS)?,
        })
    }

    pub fn upsert_source(&self, source: &Source) -> rusqlite::Result<()> {
        self.partition.with(|conn| {
            conn.execute(
                "INSERT INTO sources (source_id, url, final_url, host, root_domain, tier, doc_kind,
                    content_type, content_hash, bytes, fetched_at, fetch_mode, status_code,
                    identity_match_level, target_match_score, page_product_cluster_id)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
                 ON CONFLICT(source_id) DO UPDATE SET
                    identity_match_level = excluded.identity_match_level,
                    target_match_score = excluded.target_match_score",
                params![
                    source.source_id,
                    source.url,
                    source.final_url,
                    source.host,
                    source.root_domain,
                    source.tier.0,
                    format!("{:?}", source.doc_kind).to_lowercase(),
                    source.content_type,
                    source.content_hash,
                    source.bytes as i64,
                    source.fetched_at.to_rfc3339(),
                    format!("{:?}", source.fetch_mode).to_lowercase(),
                    source.status_code,
                    format!("{:?}", source.identity_match_level).to_lowercase(),
                    source.target_match_score,
                    source.page_product_cluster_id,
                ],
            )?;
            Ok(())
        })
    }

    /// Write path (§4.7): if `(content_hash, parser_version, chunker_version)`
    /// already exists, skip parsing entirely and link the existing doc to
    /// this source (invariant 3, §3). Otherwise parse, chunk, extract facts,
    /// and write.
    pub fn index_source(
        &self,
        source: &Source,
        parser_version: &str,
        chunker_version: &str,
        raw_text: &str,
    ) -> rusqlite::Result<IndexOutcome> {
        self.upsert_source(source)?;

        let existing: Option<(String, String)> = self.partition.with(|conn| {
            conn.query_row(
                "SELECT doc_id, source_id FROM documents d
                 JOIN doc_source_links l ON l.doc_id = d.doc_id AND l.source_id = ?4
                 WHERE d.content_hash = ?1 AND d.parser_version = ?2 AND d.chunker_version = ?3
                 LIMIT 1",
                params![source.content_hash, parser_version, chunker_version, source.source_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
        })?;
        if existing.is_some() {
            return Ok(IndexOutcome::DedupeHit {
                doc_id: existing.unwrap().0,
                reuse_mode: ReuseMode::Identical,
            });
        }

        let any_existing_doc: Option<String> = self.partition.with(|conn| {
            conn.query_row(
                "SELECT doc_id FROM documents
                 WHERE content_hash = ?1 AND parser_version = ?2 AND chunker_version = ?3
                 LIMIT 1",
                params![source.content_hash, parser_version, chunker_version],
                |r| r.get(0),
            )
            .optional()
        })?;
        if let Some(doc_id) = any_existing_doc {
            self.partition.with(|conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO doc_source_links (doc_id, source_id) VALUES (?1, ?2)",
                    params![doc_id, source.source_id],
                )
            })?;
            return Ok(IndexOutcome::DedupeHit {
                doc_id,
                reuse_mode: ReuseMode::Updated,
            });
        }

        let doc_id = blake3::hash(
            format!("{}{}{}", source.content_hash, parser_version, chunker_version).as_bytes(),
        )
        .to_hex()
        .to_string();
        let now = Utc::now();

        self.partition.with(|conn| {
            conn.execute(
                "INSERT INTO documents (doc_id, source_id, content_hash, parser_version,
                    chunker_version, parsed_ok, indexed_at) VALUES (?1,?2,?3,?4,?5,1,?6)",
                params![
                    doc_id,
                    source.source_id,
                    source.content_hash,
                    parser_version,
                    chunker_version,
                    now.to_rfc3339(),
                ],
            )?;
            conn.execute(
                "INSERT INTO doc_source_links (doc_id, source_id) VALUES (?1, ?2)",
                params![doc_id, source.source_id],
            )?;

            let mut chunk_count = 0usize;
            let mut total_fact_count = 0usize;
            for (start, end, text, surface) in chunk_paragraphs(raw_text) {
                let text_hash = blake3::hash(text.as_bytes()).to_hex().to_string();
                let snippet_id = compute_snippet_id(
                    &source.final_url,
                    start,
                    end,
                    &text_hash,
                    parser_version,
                    chunker_version,
                );
                conn.execute(
                    "INSERT OR IGNORE INTO chunks (snippet_id, doc_id, surface, text, start_offset, end_offset, text_hash)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    params![snippet_id, doc_id, surface.as_str(), text, start as i64, end as i64, text_hash],
                )?;
                conn.execute(
                    "INSERT INTO chunks_fts (snippet_id, text) VALUES (?1, ?2)",
                    params![snippet_id, text],
                )?;
                chunk_count += 1;

                if surface == Surface::Kv {
                    let mut chunk_fact_count = 0usize;
                    for (raw_key, raw_value) in extract_kv_facts(text) {
                        let normalized_key = normalize_key(&raw_key);
                        let normalized_value = raw_value.trim().to_lowercase();
                        let fact_id = blake3::hash(
                            format!("{doc_id}{snippet_id}{normalized_key}{chunk_fact_count}").as_bytes(),
                        )
                        .to_hex()
                        .to_string();
                        conn.execute(
                            "INSERT INTO facts (fact_id, doc_id, table_id, row_id, raw_key, raw_value,
                                normalized_key, normalized_value, unit_hint, snippet_id)
                             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,NULL,?9)",
                            params![
                                fact_id,
                                doc_id,
                                "kv",
                                chunk_fact_count.to_string(),
                                raw_key,
                                raw_value,
                                normalized_key,
                                normalized_value,
                                snippet_id,
                            ],
                        )?;
                        conn.execute(
                            "INSERT INTO facts_fts (fact_id, normalized_key, normalized_value) VALUES (?1,?2,?3)",
                            params![fact_id, normalized_key, normalized_value],
                        )?;
                        chunk_fact_count += 1;
                    }
                    total_fact_count += chunk_fact_count;
                }
            }

            Ok(IndexOutcome::IndexedNew {
                doc_id: doc_id.clone(),
                chunk_count,
                fact_count: total_fact_count,
            })
        })
    }

    /// Every `snippet_id` returned by any extractor must resolve here (EC's
    /// schema validator rejects anything that doesn't — invariant 2, §3 and
    /// §4.9).
    pub fn resolve_snippet(&self, snippet_id: &SnippetId) -> rusqlite::Result<Option<Chunk>> {
        self.partition.with(|conn| {
            conn.query_row(
                "SELECT snippet_id, doc_id, text, start_offset, end_offset, surface, text_hash
                 FROM chunks WHERE snippet_id = ?1",
                params![snippet_id],
                |r| {
                    Ok(Chunk {
                        snippet_id: r.get(0)?,
                        doc_id: r.get(1)?,
                        text: r.get(2)?,
                        start_offset: r.get::<_, i64>(3)? as usize,
                        end_offset: r.get::<_, i64>(4)? as usize,
                        surface: Surface::parse(&r.get::<_, String>(5)?),
                        text_hash: r.get(6)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn source_for_doc(&self, doc_id: &DocId) -> rusqlite::Result<Option<Source>> {
        self.partition.with(|conn| {
            conn.query_row(
                "SELECT s.source_id, s.url, s.final_url, s.host, s.root_domain, s.tier, s.doc_kind,
                        s.content_type, s.content_hash, s.bytes, s.fetched_at, s.fetch_mode,
                        s.status_code, s.identity_match_level, s.target_match_score, s.page_product_cluster_id
                 FROM sources s
                 JOIN doc_source_links l ON l.source_id = s.source_id
                 WHERE l.doc_id = ?1 LIMIT 1",
                params![doc_id],
                row_to_source,
            )
            .optional()
        })
    }

    /// `query` is an FTS5 match expression (callers wanting a literal phrase
    /// should quote it themselves; `get_by_field_anchor` relies on this to
    /// build an `OR` expression across anchors).
    pub fn search_chunks_fts(&self, query: &str, filters: &SearchFilters) -> rusqlite::Result<Vec<Chunk>> {
        let like = query.replace('"', "");
        self.partition.with(|conn| {
            let mut sql = String::from(
                "SELECT c.snippet_id, c.doc_id, c.text, c.start_offset, c.end_offset, c.surface, c.text_hash
                 FROM chunks_fts f
                 JOIN chunks c ON c.snippet_id = f.snippet_id
                 JOIN documents d ON d.doc_id = c.doc_id
                 JOIN doc_source_links l ON l.doc_id = d.doc_id
                 JOIN sources s ON s.source_id = l.source_id
                 WHERE chunks_fts MATCH ?1",
            );
            apply_filters(&mut sql, filters);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![like], |r| {
                Ok(Chunk {
                    snippet_id: r.get(0)?,
                    doc_id: r.get(1)?,
                    text: r.get(2)?,
                    start_offset: r.get::<_, i64>(3)? as usize,
                    end_offset: r.get::<_, i64>(4)? as usize,
                    surface: Surface::parse(&r.get::<_, String>(5)?),
                    text_hash: r.get(6)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn search_facts_fts(&self, query: &str, filters: &SearchFilters) -> rusqlite::Result<Vec<Fact>> {
        let like = query.replace('"', "");
        self.partition.with(|conn| {
            let mut sql = String::from(
                "SELECT fa.fact_id, fa.doc_id, fa.table_id, fa.row_id, fa.raw_key, fa.raw_value,
                        fa.normalized_key, fa.normalized_value, fa.unit_hint, fa.snippet_id
                 FROM facts_fts f
                 JOIN facts fa ON fa.fact_id = f.fact_id
                 JOIN documents d ON d.doc_id = fa.doc_id
                 JOIN doc_source_links l ON l.doc_id = d.doc_id
                 JOIN sources s ON s.source_id = l.source_id
                 WHERE facts_fts MATCH ?1",
            );
            apply_filters(&mut sql, filters);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![like], |r| {
                Ok(Fact {
                    fact_id: r.get(0)?,
                    doc_id: r.get(1)?,
                    table_id: r.get(2)?,
                    row_id: r.get(3)?,
                    raw_key: r.get(4)?,
                    raw_value: r.get(5)?,
                    normalized_key: r.get(6)?,
                    normalized_value: r.get(7)?,
                    unit_hint: r.get(8)?,
                    snippet_id: r.get(9)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn get_by_field_anchor(&self, _field: &str, anchors: &[String], filters: &SearchFilters) -> rusqlite::Result<Vec<Chunk>> {
        if anchors.is_empty() {
            return Ok(Vec::new());
        }
        self.search_chunks_fts(&anchors.join(" OR "), filters)
    }
}

fn apply_filters(sql: &mut String, filters: &SearchFilters) {
    if let Some(tier) = filters.tier {
        sql.push_str(&format!(" AND s.tier = {}", tier.0));
    }
    if let Some(doc_kind) = filters.doc_kind {
        sql.push_str(&format!(" AND s.doc_kind = '{:?}'", doc_kind).to_lowercase());
    }
    if let Some(level) = filters.source_identity_match {
        sql.push_str(&format!(" AND s.identity_match_level = '{:?}'", level).to_lowercase());
    }
    if let Some(host) = &filters.host {
        sql.push_str(&format!(" AND s.host = '{}'", host.replace('\'', "''")));
    }
}

fn row_to_source(r: &rusqlite::Row) -> rusqlite::Result<Source> {
    let tier: u8 = r.get(5)?;
    let doc_kind_s: String = r.get(6)?;
    let fetch_mode_s: String = r.get(11)?;
    let identity_s: String = r.get(13)?;
    Ok(Source {
        source_id: r.get(0)?,
        url: r.get(1)?,
        final_url: r.get(2)?,
        host: r.get(3)?,
        root_domain: r.get(4)?,
        tier: Tier(tier),
        doc_kind: parse_doc_kind(&doc_kind_s),
        content_type: r.get(7)?,
        content_hash: r.get(8)?,
        bytes: r.get::<_, i64>(9)? as u64,
        fetched_at: DateTime::parse_from_rfc3339(&r.get::<_, String>(10)?)
            .unwrap()
            .with_timezone(&Utc),
        fetch_mode: parse_fetch_mode(&fetch_mode_s),
        status_code: r.get(12)?,
        identity_match_level: parse_identity_level(&identity_s),
        target_match_score: r.get(14)?,
        page_product_cluster_id: r.get(15)?,
    })
}

fn parse_doc_kind(s: &str) -> DocKind {
    match s {
        "spec" => DocKind::Spec,
        "manual" => DocKind::Manual,
        "support" => DocKind::Support,
        "review" => DocKind::Review,
        "teardown" => DocKind::Teardown,
        "retail" => DocKind::Retail,
        "forum" => DocKind::Forum,
        _ => DocKind::Other,
    }
}

fn parse_fetch_mode(s: &str) -> crate::types::FetchMode {
    match s {
        "headless" => crate::types::FetchMode::Headless,
        "altcrawler" => crate::types::FetchMode::AltCrawler,
        _ => crate::types::FetchMode::Http,
    }
}

fn parse_identity_level(s: &str) -> IdentityMatchLevel {
    match s {
        "locked" => IdentityMatchLevel::Locked,
        "provisional" => IdentityMatchLevel::Provisional,
        "conflict" => IdentityMatchLevel::Conflict,
        _ => IdentityMatchLevel::Unlocked,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FetchMode;

    fn sample_source(id: &str, hash: &str) -> Source {
        Source {
            source_id: id.to_string(),
            url: "https://example.com/spec".into(),
            final_url: "https://example.com/spec".into(),
            host: "example.com".into(),
            root_domain: "example.com".into(),
            tier: Tier::MANUFACTURER,
            doc_kind: DocKind::Spec,
            content_type: "text/html".into(),
            content_hash: hash.to_string(),
            bytes: 1024,
            fetched_at: Utc::now(),
            fetch_mode: FetchMode::Http,
            status_code: Some(200),
            identity_match_level: IdentityMatchLevel::Locked,
            target_match_score: 0.98,
            page_product_cluster_id: None,
        }
    }

    #[test]
    fn new_content_indexes_and_second_identical_call_dedupes() {
        let ei = EvidenceIndex::open_in_memory().unwrap();
        let source = sample_source("s1", "hash-a");
        let text = "Polling Rate: 8000 Hz\n\nThe sensor ships pre-calibrated.";

        let first = ei.index_source(&source, "p1", "c1", text).unwrap();
        assert!(matches!(first, IndexOutcome::IndexedNew { .. }));

        let second = ei.index_source(&source, "p1", "c1", text).unwrap();
        assert!(matches!(second, IndexOutcome::DedupeHit { reuse_mode: ReuseMode::Identical, .. }));
    }

    #[test]
    fn snippet_id_is_idempotent_across_reparse() {
        let ei = EvidenceIndex::open_in_memory().unwrap();
        let source = sample_source("s1", "hash-b");
        let text = "Weight: 54 g";
        let out1 = ei.index_source(&source, "p1", "c1", text).unwrap();
        let doc_id = match out1 {
            IndexOutcome::IndexedNew { doc_id, .. } => doc_id,
            _ => panic!("expected new index"),
        };
        let chunks = ei
            .search_chunks_fts("Weight", &SearchFilters::default())
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].doc_id, doc_id);
        let resolved = ei.resolve_snippet(&chunks[0].snippet_id).unwrap();
        assert!(resolved.is_some());
    }

    #[test]
    fn dangling_snippet_id_does_not_resolve() {
        let ei = EvidenceIndex::open_in_memory().unwrap();
        assert!(ei.resolve_snippet(&"not-a-real-id".to_string()).unwrap().is_none());
    }

    #[test]
    fn facts_are_extracted_from_kv_lines() {
        let ei = EvidenceIndex::open_in_memory().unwrap();
        let source = sample_source("s1", "hash-c");
        let text = "Sensor: Focus Pro 35K";
        ei.index_source(&source, "p1", "c1", text).unwrap();
        let facts = ei.search_facts_fts("sensor", &SearchFilters::default()).unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].normalized_key, "sensor");
    }
}
