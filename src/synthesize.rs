//! Answer synthesis: grounded prompt assembly, extraction retry, and
//! source attribution.
//!
//! Three prompt shapes cover the strategies: document-grounded, hybrid
//! merge (documents + database rows as two labeled sections), and the small
//! ungrounded conversation prompt that the intent analyzer already answers
//! inline. When a grounded answer claims the sources are silent even though
//! sources exist, one stricter extraction-only retry runs.

use std::sync::Arc;

use tracing::debug;

use crate::dbquery::DbQueryOutcome;
use crate::error::Result;
use crate::models::{sort_sources, Source, SourceDetail};
use crate::providers::AiGateway;
use crate::store::documents::ScoredChunk;

const EXCERPT_CHARS: usize = 240;

/// Everything one synthesis pass needs, precomputed by the orchestrator.
pub struct SynthesisInput<'a> {
    pub query: &'a str,
    pub document_chunks: &'a [ScoredChunk],
    pub database: Option<&'a DbQueryOutcome>,
    /// `(server_id, text)` blocks from MCP tool calls.
    pub mcp_sections: &'a [(String, String)],
    pub history: Option<&'a str>,
    /// ISO 639-1 code; absent means "answer in the query's language".
    pub preferred_language: Option<&'a str>,
}

pub struct Synthesizer {
    gateway: Arc<AiGateway>,
}

impl Synthesizer {
    pub fn new(gateway: Arc<AiGateway>) -> Self {
        Self { gateway }
    }

    /// Produce the grounded answer and its source list.
    pub async fn synthesize(&self, input: &SynthesisInput<'_>) -> Result<(String, Vec<Source>)> {
        let has_documents = !input.document_chunks.is_empty();
        let has_database = input
            .database
            .map(|db| !db.sections.is_empty())
            .unwrap_or(false);

        let system = self.system_message(input, has_documents && has_database);
        let user = build_user_prompt(input);

        let mut answer = self
            .gateway
            .generate_text(Some(&system), input.history, &user)
            .await?;

        if has_documents && claims_missing_data(&answer) {
            debug!("answer claimed missing data with sources present, retrying extraction");
            let strict = format!(
                "{system}\nOnly extract facts verbatim from the numbered sources. If any \
                 source contains a relevant statement, quote it; do not say the information \
                 is missing."
            );
            answer = self
                .gateway
                .generate_text(Some(&strict), input.history, &user)
                .await?;
        }

        let mut sources = assemble_sources(input);
        sort_sources(&mut sources);
        Ok((answer, sources))
    }

    fn system_message(&self, input: &SynthesisInput<'_>, hybrid: bool) -> String {
        let mut system = if hybrid {
            "You merge evidence from two kinds of sources: database query results and \
             document excerpts. Both sections are labeled. Combine the facts into one \
             coherent answer, citing figures exactly as the rows show them. Do not invent \
             data absent from either section."
                .to_string()
        } else {
            "You answer strictly from the provided sources. Ground every statement in \
             them; when the sources do not contain the answer, say so briefly."
                .to_string()
        };

        match input.preferred_language {
            Some(code) => {
                system.push_str(&format!(
                    "\nRespond in the language with ISO 639-1 code '{code}'."
                ));
            }
            None => {
                system.push_str("\nRespond in the language of the question.");
            }
        }
        system
    }
}

fn build_user_prompt(input: &SynthesisInput<'_>) -> String {
    let mut out = String::new();

    if let Some(db) = input.database {
        if !db.sections.is_empty() {
            out.push_str("## Database results\n\n");
            out.push_str(&db.merged_context());
            out.push_str("\n\n");
        }
    }

    if !input.document_chunks.is_empty() {
        out.push_str("## Document excerpts\n\n");
        for (i, chunk) in input.document_chunks.iter().enumerate() {
            out.push_str(&format!(
                "[{}] {} (chunk {}):\n{}\n\n",
                i + 1,
                chunk.filename,
                chunk.chunk_index,
                chunk.content
            ));
        }
    }

    for (server, text) in input.mcp_sections {
        out.push_str(&format!("## Tool results ({server})\n\n{text}\n\n"));
    }

    out.push_str(&format!("Question: {}", input.query));
    out
}

/// Heuristic for a grounded answer that wrongly declares the sources empty.
fn claims_missing_data(answer: &str) -> bool {
    let lowered = answer.to_lowercase();
    [
        "not found in the sources",
        "no information",
        "i don't have",
        "i do not have",
        "cannot find",
        "can't find",
        "sources do not contain",
        "sources don't contain",
    ]
    .iter()
    .any(|marker| lowered.contains(marker))
}

fn assemble_sources(input: &SynthesisInput<'_>) -> Vec<Source> {
    let mut sources = Vec::new();

    for chunk in input.document_chunks {
        let detail = match chunk_media(&chunk.filename) {
            Media::Image => SourceDetail::Image {
                document_id: chunk.document_id,
                filename: chunk.filename.clone(),
                chunk_index: chunk.chunk_index,
                start_position: chunk.start_position,
                end_position: chunk.end_position,
            },
            Media::Audio => SourceDetail::Audio {
                document_id: chunk.document_id,
                filename: chunk.filename.clone(),
                chunk_index: chunk.chunk_index,
                seconds: [0.0, 0.0],
            },
            Media::Text => SourceDetail::Document {
                document_id: chunk.document_id,
                filename: chunk.filename.clone(),
                chunk_index: chunk.chunk_index,
                start_position: chunk.start_position,
                end_position: chunk.end_position,
            },
        };
        sources.push(Source {
            detail,
            relevance: chunk.score.clamp(0.0, 1.0),
            excerpt: truncate_chars(&chunk.content, EXCERPT_CHARS),
            location: Some(format!(
                "chars {}-{}",
                chunk.start_position, chunk.end_position
            )),
        });
    }

    if let Some(db) = input.database {
        for section in db.sections.iter().filter(|s| s.success) {
            sources.push(Source {
                detail: SourceDetail::Database {
                    database_id: section.database_id.clone(),
                    database_name: section.database_name.clone(),
                    tables: section.tables.clone(),
                    sql: section.sql.clone().unwrap_or_default(),
                    row: None,
                },
                relevance: 0.95,
                excerpt: section
                    .rendered
                    .as_deref()
                    .map(|r| truncate_chars(r, EXCERPT_CHARS))
                    .unwrap_or_default(),
                location: Some(format!("{} rows", section.row_count)),
            });
        }
    }

    for (server, text) in input.mcp_sections {
        sources.push(Source {
            detail: SourceDetail::System {
                origin: format!("mcp:{server}"),
            },
            relevance: 0.5,
            excerpt: truncate_chars(text, EXCERPT_CHARS),
            location: None,
        });
    }

    sources
}

enum Media {
    Text,
    Image,
    Audio,
}

fn chunk_media(filename: &str) -> Media {
    let ext = filename
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_lowercase();
    match ext.as_str() {
        "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "tiff" => Media::Image,
        "mp3" | "wav" | "m4a" | "flac" | "ogg" => Media::Audio,
        _ => Media::Text,
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{cut}…")
}
