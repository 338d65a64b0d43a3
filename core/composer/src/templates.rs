use memory_engine_schemas::RankedCitation;

/// Renders ranked citations into the numbered blocks answers are grounded
/// on. Labels are 1-based and always agree with the citation list order, so
/// a UI can cross-link `[Nk]` tokens back to the k-th citation.
pub struct CitationRenderer;

impl CitationRenderer {
    /// Numbered citation block handed to the answer model (and useful as a
    /// context brief on its own).
    pub fn render_block(citations: &[RankedCitation]) -> String {
        let mut lines = Vec::new();

        for citation in citations {
            let memory = &citation.memory;
            let mut header = format!("[N{}] id={}", citation.rank, memory.id);
            if let Some(project) = &memory.project {
                header.push_str(&format!(" | project={}", project));
            }
            if let Some(url) = &memory.source_url {
                header.push_str(&format!(" | source={}", url));
            }
            lines.push(header);
            lines.push(format!("  summary: {}", memory.effective_summary()));
            lines.push(format!("  content: {}", memory.statement));
            lines.push(String::new());
        }

        lines.join("\n").trim_end().to_string()
    }

    /// Bullet-point synthesis from the top citations. Degraded but still
    /// citation-consistent; used whenever no answer model is reachable.
    pub fn heuristic_bullets(citations: &[RankedCitation], max: usize) -> String {
        let mut lines = vec!["Based on stored memories:".to_string()];

        for citation in citations.iter().take(max) {
            lines.push(format!(
                "- {} [N{}]",
                citation.memory.effective_summary(),
                citation.rank
            ));
        }

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory_engine_schemas::{MemoryId, MemoryRecord, SourceId, MEMORY_KIND_ATOMIC};

    fn citation(rank: usize, statement: &str, project: Option<&str>) -> RankedCitation {
        RankedCitation {
            rank,
            score: 1.0 / rank as f64,
            memory: MemoryRecord {
                id: MemoryId(format!("mem-{}", rank)),
                source_id: SourceId("src".into()),
                source_version: 1,
                memory_kind: MEMORY_KIND_ATOMIC.into(),
                extracted_kind: "knowledge".into(),
                fingerprint: "fp".into(),
                statement: statement.into(),
                manual_title: None,
                manual_notes: None,
                pinned_tags: vec![],
                auto_title: None,
                auto_summary: None,
                auto_tags: vec![],
                confidence: None,
                project: project.map(str::to_string),
                source_url: None,
                embedding: None,
                created_at: "2025-01-01T00:00:00Z".into(),
                updated_at: "2025-01-01T00:00:00Z".into(),
            },
        }
    }

    #[test]
    fn test_block_numbers_follow_rank_order() {
        let citations = vec![
            citation(1, "first fact", Some("work")),
            citation(2, "second fact", None),
        ];

        let block = CitationRenderer::render_block(&citations);
        assert!(block.contains("[N1] id=mem-1 | project=work"));
        assert!(block.contains("[N2] id=mem-2"));
        assert!(block.contains("content: first fact"));
        assert!(block.find("[N1]").unwrap() < block.find("[N2]").unwrap());
    }

    #[test]
    fn test_bullets_cite_existing_indexes_only() {
        let citations = vec![citation(1, "first fact", None), citation(2, "second fact", None)];

        let bullets = CitationRenderer::heuristic_bullets(&citations, 5);
        assert!(bullets.contains("first fact [N1]"));
        assert!(bullets.contains("second fact [N2]"));
        assert!(!bullets.contains("[N3]"));
    }

    #[test]
    fn test_bullets_respect_max() {
        let citations = vec![
            citation(1, "first fact", None),
            citation(2, "second fact", None),
            citation(3, "third fact", None),
        ];

        let bullets = CitationRenderer::heuristic_bullets(&citations, 2);
        assert!(bullets.contains("[N2]"));
        assert!(!bullets.contains("[N3]"));
    }
}
