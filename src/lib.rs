//! # Answer Harness
//!
//! **A multi-source retrieval-augmented generation orchestration service.**
//!
//! Answer Harness answers natural-language queries by routing them across
//! three kinds of knowledge sources — vector-indexed document corpora, live
//! relational databases (SQL generated on demand and validated against a
//! cached schema catalog), and external MCP tool servers — then fusing the
//! evidence into one grounded, source-attributed answer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────────────────────┐
//! │  HTTP /  │──▶│ Orchestrator │──▶│ Documents │ DBs │ MCP     │
//! │  watcher │   │ (intent +    │   │ (SQLite)  │(4 dialects)   │
//! └──────────┘   │  strategy)   │   └─────┬─────────────────────┘
//!                └──────┬───────┘         │
//!                       ▼                 ▼
//!                ┌─────────────┐   ┌─────────────┐
//!                │ Synthesizer │◀──│  Evidence    │
//!                │ + sources   │   │  sections    │
//!                └─────────────┘   └─────────────┘
//! ```
//!
//! ## Query flow
//!
//! 1. The **intent analyzer** ([`intent`]) classifies the query as small
//!    talk or retrieval and names the databases that could answer it.
//! 2. The **orchestrator** ([`orchestrator`]) picks exactly one strategy:
//!    conversational, document-only, database-only, or hybrid (MCP results
//!    are additive).
//! 3. Documents come from the **store** ([`store::documents`]) via cosine
//!    similarity with a lexical fallback; database rows come from the
//!    **coordinator** ([`dbquery::coordinator`]), which generates SQL once,
//!    repairs and validates it per dialect, and executes in parallel under
//!    a deadline.
//! 4. The **synthesizer** ([`synthesize`]) merges the evidence into an
//!    answer with ranked [`models::Source`] attributions, and the turn is
//!    appended to the **conversation store** ([`store::conversations`]).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types: `Document`, `Chunk`, `Source`, `QueryIntent`, `RagResponse` |
//! | [`error`] | Error taxonomy shared by every subsystem |
//! | [`providers`] | AI gateway: retry policy, fallback chain, embedding rate gate |
//! | [`chunk`] | Overlap-preserving chunker with boundary realignment |
//! | [`embedding`] | Batched chunk embedding and vector utilities |
//! | [`store`] | SQLite persistence: documents, chunks, vectors, conversations |
//! | [`dbquery`] | Schema catalog, SQL dialects, validation, execution, coordination |
//! | [`mcp`] | JSON-RPC 2.0 client for MCP tool servers |
//! | [`intent`] | Query classification and database routing |
//! | [`orchestrator`] | Strategy selection and response assembly |
//! | [`synthesize`] | Grounded prompts, extraction retry, source attribution |
//! | [`extract`] | Upload text extraction (text family + PDF) |
//! | [`ingest`] | Shared upload pipeline: extract → chunk → embed → store |
//! | [`watcher`] | Folder observation with MD5 de-duplication |
//! | [`startup`] | Component wiring and the one-shot lifecycle hook |
//! | [`health`] | Bounded-time dependency probes |
//! | [`server`] | Axum HTTP surface under `/smartrag` |

pub mod chunk;
pub mod config;
pub mod dbquery;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod health;
pub mod ingest;
pub mod intent;
pub mod mcp;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod server;
pub mod startup;
pub mod store;
pub mod synthesize;
pub mod text;
pub mod watcher;
