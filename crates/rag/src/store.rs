use std::path::{Path, PathBuf};

use bytemuck::{cast_slice, pod_collect_to_vec};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use paperchat_core::{cosine_similarity, Author, ChatError, Paper, Passage, Result, ScoredPassage};

/// SQLite-backed paper/passage store. Read-only at request time apart from
/// the usage log; rows come from ingestion. Connections are opened per call,
/// so the handle is cheap to clone across tasks.
#[derive(Clone)]
pub struct PaperStore {
    path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PaperInsert {
    pub id: String,
    pub name: String,
    pub abstract_text: String,
    pub authors: Vec<Author>,
    pub topic: Option<String>,
    pub arxiv_id: Option<String>,
    pub source_id: Option<String>,
    pub searchable_text: String,
    pub related_models: Option<Value>,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct PassageInsert {
    pub text: String,
    pub abstract_text: Option<String>,
    pub embedding: Vec<f32>,
}

impl PaperStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.init()?;
        Ok(store)
    }

    fn connection(&self) -> Result<Connection> {
        Connection::open(&self.path).map_err(db_err)
    }

    pub fn init(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS papers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                abstract TEXT NOT NULL DEFAULT '',
                authors TEXT NOT NULL DEFAULT '[]',
                topic TEXT,
                arxiv_id TEXT,
                source_id TEXT,
                searchable_text TEXT NOT NULL DEFAULT '',
                related_models TEXT,
                embedding BLOB NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS passages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                paper_id TEXT NOT NULL,
                text TEXT NOT NULL,
                abstract TEXT,
                embedding BLOB NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY(paper_id) REFERENCES papers(id)
            );
            CREATE INDEX IF NOT EXISTS idx_passages_paper ON passages(paper_id);
            CREATE TABLE IF NOT EXISTS usage_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                question_text TEXT NOT NULL,
                paper_id TEXT,
                metadata TEXT,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE VIRTUAL TABLE IF NOT EXISTS paper_fts USING fts5(
                name,
                abstract,
                searchable_text,
                content='',
                contentless_delete=1,
                tokenize="unicode61 remove_diacritics 2"
            );
            "#,
        )
        .map_err(db_err)
    }

    pub fn insert_paper(&self, paper: &PaperInsert) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT INTO papers (id, name, abstract, authors, topic, arxiv_id, source_id, searchable_text, related_models, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                paper.id,
                paper.name,
                paper.abstract_text,
                serde_json::to_string(&paper.authors)?,
                paper.topic,
                paper.arxiv_id,
                paper.source_id,
                paper.searchable_text,
                paper.related_models.as_ref().map(|v| v.to_string()),
                cast_slice::<f32, u8>(&paper.embedding),
            ],
        )
        .map_err(db_err)?;
        let rowid = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO paper_fts (rowid, name, abstract, searchable_text) VALUES (?1, ?2, ?3, ?4)",
            params![rowid, paper.name, paper.abstract_text, paper.searchable_text],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)
    }

    pub fn insert_passages(&self, paper_id: &str, passages: &[PassageInsert]) -> Result<usize> {
        let mut conn = self.connection()?;
        let tx = conn.transaction().map_err(db_err)?;
        for passage in passages {
            tx.execute(
                "INSERT INTO passages (paper_id, text, abstract, embedding) VALUES (?1, ?2, ?3, ?4)",
                params![
                    paper_id,
                    passage.text,
                    passage.abstract_text,
                    cast_slice::<f32, u8>(&passage.embedding),
                ],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(passages.len())
    }

    pub fn get_paper(&self, id: &str) -> Result<Option<Paper>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!("{PAPER_SELECT} WHERE id = ?1"))
            .map_err(db_err)?;
        stmt.query_row([id], paper_from_row)
            .optional()
            .map_err(db_err)
    }

    /// Arbitrary bounded page for the browse fallback. No ordering guarantee
    /// beyond being stable for an unchanged corpus.
    pub fn list_papers(&self, limit: usize) -> Result<Vec<Paper>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!("{PAPER_SELECT} LIMIT ?1"))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([limit as i64], paper_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Full-text match over name, abstract and searchable text, in the
    /// engine's own relevance order. `terms` must already be sanitized;
    /// each term is quoted so none of them can act as an FTS operator.
    pub fn lexical_search(&self, terms: &str, limit: usize) -> Result<Vec<Paper>> {
        let match_expr = terms
            .split_whitespace()
            .map(|term| format!("\"{term}\""))
            .collect::<Vec<_>>()
            .join(" ");
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {PAPER_COLUMNS} FROM paper_fts f JOIN papers p ON p.rowid = f.rowid
                 WHERE paper_fts MATCH ?1 ORDER BY rank LIMIT ?2"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![match_expr, limit as i64], paper_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Rank every paper by whole-document embedding similarity. `floor`
    /// optionally drops papers under a minimum score; the default resolver
    /// applies none, unlike passage search.
    pub fn rank_papers_by_embedding(
        &self,
        query: &[f32],
        limit: usize,
        floor: Option<f32>,
    ) -> Result<Vec<(Paper, f32)>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(PAPER_SELECT).map_err(db_err)?;
        let rows = stmt.query_map([], paper_from_row).map_err(db_err)?;
        let mut scored = Vec::new();
        for row in rows {
            let paper = row.map_err(db_err)?;
            let score = cosine_similarity(query, &paper.embedding);
            if floor.map_or(true, |min| score >= min) {
                scored.push((paper, score));
            }
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    /// Passage similarity search scoped to one paper. The scope predicate is
    /// part of the query itself: a passage from another paper can never
    /// enter the candidate set, whatever its similarity.
    pub fn search_passages(
        &self,
        paper_id: &str,
        query: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredPassage>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT paper_id, text, abstract, embedding FROM passages WHERE paper_id = ?1")
            .map_err(retrieval_err)?;
        let mut rows = stmt.query([paper_id]).map_err(retrieval_err)?;
        let mut hits: Vec<ScoredPassage> = Vec::new();
        while let Some(row) = rows.next().map_err(retrieval_err)? {
            let blob: Vec<u8> = row.get(3).map_err(retrieval_err)?;
            let embedding: Vec<f32> = pod_collect_to_vec(&blob);
            if embedding.len() != query.len() {
                return Err(ChatError::Retrieval(format!(
                    "stored embedding width {} does not match query width {}",
                    embedding.len(),
                    query.len()
                )));
            }
            let score = cosine_similarity(query, &embedding);
            if score < min_score {
                continue;
            }
            hits.push(ScoredPassage {
                passage: Passage {
                    paper_id: row.get(0).map_err(retrieval_err)?,
                    text: row.get(1).map_err(retrieval_err)?,
                    abstract_text: row.get(2).map_err(retrieval_err)?,
                    embedding: Vec::new(),
                },
                score,
            });
        }
        // Stable sort keeps storage order for equal scores.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    pub fn log_usage(
        &self,
        question_text: &str,
        paper_id: Option<&str>,
        metadata: Option<&Value>,
    ) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO usage_log (question_text, paper_id, metadata) VALUES (?1, ?2, ?3)",
            params![
                question_text,
                paper_id,
                metadata.map(|value| value.to_string())
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn paper_count(&self) -> Result<usize> {
        let conn = self.connection()?;
        conn.query_row("SELECT COUNT(*) FROM papers", [], |row| row.get::<_, i64>(0))
            .map(|count| count as usize)
            .map_err(db_err)
    }

    pub fn usage_count(&self) -> Result<usize> {
        let conn = self.connection()?;
        conn.query_row("SELECT COUNT(*) FROM usage_log", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|count| count as usize)
        .map_err(db_err)
    }
}

const PAPER_COLUMNS: &str = "p.id, p.name, p.abstract, p.authors, p.topic, p.arxiv_id, p.source_id, p.searchable_text, p.related_models, p.embedding";
const PAPER_SELECT: &str = "SELECT id, name, abstract, authors, topic, arxiv_id, source_id, searchable_text, related_models, embedding FROM papers p";

fn paper_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Paper> {
    let authors_json: String = row.get(3)?;
    let related_json: Option<String> = row.get(8)?;
    let blob: Vec<u8> = row.get(9)?;
    Ok(Paper {
        id: row.get(0)?,
        name: row.get(1)?,
        abstract_text: row.get(2)?,
        authors: serde_json::from_str(&authors_json).unwrap_or_default(),
        topic: row.get(4)?,
        arxiv_id: row.get(5)?,
        source_id: row.get(6)?,
        searchable_text: row.get(7)?,
        related_models: related_json.and_then(|json| serde_json::from_str(&json).ok()),
        embedding: pod_collect_to_vec(&blob),
    })
}

fn db_err(err: rusqlite::Error) -> ChatError {
    ChatError::Database(err.to_string())
}

fn retrieval_err(err: rusqlite::Error) -> ChatError {
    ChatError::Retrieval(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use paperchat_core::{HashEmbedder, HashEmbedderConfig};
    use tempfile::tempdir;

    fn embedder() -> HashEmbedder {
        HashEmbedder::new(HashEmbedderConfig {
            dimensions: 64,
            seed: 1337,
        })
    }

    fn test_store() -> (tempfile::TempDir, PaperStore) {
        let dir = tempdir().unwrap();
        let store = PaperStore::open(dir.path().join("papers.sqlite")).unwrap();
        (dir, store)
    }

    fn seed_paper(store: &PaperStore, id: &str, name: &str, text: &str) {
        let embedder = embedder();
        store
            .insert_paper(&PaperInsert {
                id: id.to_string(),
                name: name.to_string(),
                abstract_text: format!("Abstract of {name}"),
                authors: vec![Author {
                    name: "J. Doe".to_string(),
                    institution: Some("MIT".to_string()),
                    ..Default::default()
                }],
                topic: Some("ml".to_string()),
                arxiv_id: Some(format!("2401.{id}")),
                source_id: None,
                searchable_text: text.to_string(),
                related_models: None,
                embedding: embedder.embed_text(text),
            })
            .unwrap();
    }

    #[test]
    fn point_lookup_roundtrips_paper() {
        let (_dir, store) = test_store();
        seed_paper(&store, "p1", "Sparse Attention", "sparse attention for long sequences");
        let paper = store.get_paper("p1").unwrap().unwrap();
        assert_eq!(paper.name, "Sparse Attention");
        assert_eq!(paper.authors[0].institution.as_deref(), Some("MIT"));
        assert_eq!(paper.embedding.len(), 64);
        assert!(store.get_paper("missing").unwrap().is_none());
    }

    #[test]
    fn lexical_search_matches_indexed_text() {
        let (_dir, store) = test_store();
        seed_paper(&store, "p1", "Sparse Attention", "sparse attention transformers");
        seed_paper(&store, "p2", "Graph Pooling", "graph neural network pooling");
        let hits = store.lexical_search("attention", 15).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "p1");
    }

    #[test]
    fn lexical_search_quotes_operator_lookalikes() {
        let (_dir, store) = test_store();
        seed_paper(&store, "p1", "Logic Papers", "reasoning AND planning");
        // "AND" must behave as a term, not an operator with a missing operand.
        let hits = store.lexical_search("AND", 15).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn scoped_passage_search_never_leaks_across_papers() {
        let (_dir, store) = test_store();
        let embedder = embedder();
        seed_paper(&store, "a", "Paper A", "alpha");
        seed_paper(&store, "b", "Paper B", "beta");
        // Identical text in both papers: maximal similarity either way.
        let shared = "the attention mechanism weighs token pairs";
        for paper in ["a", "b"] {
            store
                .insert_passages(
                    paper,
                    &[PassageInsert {
                        text: shared.to_string(),
                        abstract_text: None,
                        embedding: embedder.embed_text(shared),
                    }],
                )
                .unwrap();
        }
        let query = embedder.embed_text("attention mechanism");
        let hits = store.search_passages("a", &query, 6, 0.0).unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|hit| hit.passage.paper_id == "a"));
    }

    #[test]
    fn passage_scores_are_descending_filtered_and_truncated() {
        let (_dir, store) = test_store();
        let embedder = embedder();
        seed_paper(&store, "p", "Paper", "text");
        let texts = [
            "attention mechanism weighs token pairs",
            "attention over long sequences",
            "convolutional image filters",
            "attention attention attention",
            "recurrent state updates",
            "mechanism of self attention layers",
            "unrelated cooking recipe",
        ];
        let inserts: Vec<PassageInsert> = texts
            .iter()
            .map(|text| PassageInsert {
                text: text.to_string(),
                abstract_text: None,
                embedding: embedder.embed_text(text),
            })
            .collect();
        store.insert_passages("p", &inserts).unwrap();
        let query = embedder.embed_text("attention mechanism");
        let hits = store.search_passages("p", &query, 3, 0.2).unwrap();
        assert!(hits.len() <= 3);
        assert!(hits.windows(2).all(|pair| pair[0].score >= pair[1].score));
        assert!(hits.iter().all(|hit| hit.score >= 0.2));
    }

    #[test]
    fn threshold_with_no_match_yields_empty_result() {
        let (_dir, store) = test_store();
        let embedder = embedder();
        seed_paper(&store, "p", "Paper", "text");
        store
            .insert_passages(
                "p",
                &[PassageInsert {
                    text: "completely unrelated topic".to_string(),
                    abstract_text: None,
                    embedding: embedder.embed_text("completely unrelated topic"),
                }],
            )
            .unwrap();
        let query = embedder.embed_text("attention mechanism");
        let hits = store.search_passages("p", &query, 6, 0.4).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn mismatched_embedding_width_is_a_retrieval_error() {
        let (_dir, store) = test_store();
        let embedder = embedder();
        seed_paper(&store, "p", "Paper", "text");
        store
            .insert_passages(
                "p",
                &[PassageInsert {
                    text: "passage".to_string(),
                    abstract_text: None,
                    embedding: embedder.embed_text("passage"),
                }],
            )
            .unwrap();
        let narrow_query = vec![0.5f32; 8];
        let err = store
            .search_passages("p", &narrow_query, 6, 0.0)
            .unwrap_err();
        assert!(matches!(err, ChatError::Retrieval(_)));
    }

    #[test]
    fn rank_papers_orders_by_similarity_and_honors_floor() {
        let (_dir, store) = test_store();
        seed_paper(&store, "near", "Near", "attention mechanism study");
        seed_paper(&store, "far", "Far", "culinary techniques of provence");
        let query = embedder().embed_text("attention mechanism");
        let ranked = store.rank_papers_by_embedding(&query, 10, None).unwrap();
        assert_eq!(ranked[0].0.id, "near");
        let floored = store
            .rank_papers_by_embedding(&query, 10, Some(0.99))
            .unwrap();
        assert!(floored.len() < ranked.len());
    }

    #[test]
    fn browse_page_is_bounded() {
        let (_dir, store) = test_store();
        for i in 0..12 {
            seed_paper(&store, &format!("p{i}"), &format!("Paper {i}"), "text");
        }
        assert_eq!(store.list_papers(10).unwrap().len(), 10);
        assert_eq!(store.paper_count().unwrap(), 12);
    }

    #[test]
    fn usage_log_appends_without_error() {
        let (_dir, store) = test_store();
        store
            .log_usage(
                "what is attention",
                Some("p1"),
                Some(&serde_json::json!({"model": "llama3.1-70b"})),
            )
            .unwrap();
        store.log_usage("no scope", None, None).unwrap();
    }
}
