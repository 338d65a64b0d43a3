use regex::Regex;
use sha2::{Digest, Sha256};

/// Content addressing for sources and memories.
///
/// Every durable id in the store is a pure function of identity-bearing
/// input, which is what makes re-ingestion idempotent: the same document and
/// the same extracted fact always land on the same rows.

fn hex_digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Derive the canonical source id for an input document.
///
/// A caller-supplied external id wins when present: it is trimmed,
/// whitespace-collapsed, lowercased, stripped of any existing `ext:` prefix
/// and returned as `ext:<normalized>`, so the same external id maps to the
/// same source regardless of casing. Without one, the id is the SHA-256 of
/// the normalized filename — identical paths collide on purpose, giving
/// stable identity without coordination.
pub fn derive_source_id(filename: &str, external_id: Option<&str>) -> String {
    if let Some(external) = external_id {
        let collapsed = external.split_whitespace().collect::<Vec<_>>().join(" ");
        let normalized = collapsed.to_lowercase();
        let normalized = normalized.strip_prefix("ext:").unwrap_or(&normalized);
        if !normalized.is_empty() {
            return format!("ext:{}", normalized);
        }
    }

    let normalized_path = filename.trim().to_lowercase().replace('\\', "/");
    hex_digest(&normalized_path)
}

/// Exact-content checksum over newline-normalized bytes.
pub fn content_checksum(content: &str) -> String {
    let normalized = content.replace("\r\n", "\n").replace('\r', "\n");
    hex_digest(&normalized)
}

/// Whitespace/case-insensitive checksum reserved for near-duplicate
/// consolidation. Not consulted by version-creation decisions.
pub fn fuzzy_checksum(content: &str) -> String {
    let folded = content.to_lowercase().replace("\r\n", "\n").replace('\r', "\n");
    let spaces = Regex::new(r"[ \t]+").unwrap();
    let blank_lines = Regex::new(r"\n{2,}").unwrap();
    let collapsed = spaces.replace_all(&folded, " ");
    let collapsed = blank_lines.replace_all(&collapsed, "\n");
    hex_digest(collapsed.trim())
}

/// Collapse internal whitespace and cap length. Used before fingerprinting
/// so formatting differences do not fork memory identity.
pub fn normalize_statement(statement: &str, max_len: usize) -> String {
    let mut collapsed = statement.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.len() > max_len {
        let mut cut = max_len;
        while cut > 0 && !collapsed.is_char_boundary(cut) {
            cut -= 1;
        }
        collapsed.truncate(cut);
    }
    collapsed
}

/// Identity of one extracted fact: hash of its lowercased kind and its
/// normalized statement. Title, tags and confidence deliberately do not
/// participate, so metadata churn never forks the row.
pub fn fact_fingerprint(kind: &str, statement: &str) -> String {
    hex_digest(&format!("{}\n{}", kind.trim().to_lowercase(), statement))
}

/// Memory id = hash of (owning source, fact fingerprint). Re-extracting an
/// identical fact updates the existing row; a changed statement creates a
/// new one.
pub fn derive_memory_id(source_id: &str, fingerprint: &str) -> String {
    hex_digest(&format!("{}\n{}", source_id, fingerprint))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_id_normalization() {
        let a = derive_source_id("whatever.md", Some("  My  Doc "));
        let b = derive_source_id("other.md", Some("my doc"));
        let c = derive_source_id("other.md", Some("ext:MY DOC"));
        assert_eq!(a, "ext:my doc");
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_filename_identity_is_deterministic() {
        let a = derive_source_id("Notes/Daily.md", None);
        let b = derive_source_id("notes/daily.md", None);
        let c = derive_source_id("notes\\daily.md", None);
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_ne!(a, derive_source_id("notes/weekly.md", None));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_checksum_newline_normalization() {
        assert_eq!(
            content_checksum("line one\r\nline two"),
            content_checksum("line one\nline two")
        );
        assert_ne!(
            content_checksum("line one"),
            content_checksum("line two")
        );
    }

    #[test]
    fn test_fuzzy_checksum_ignores_case_and_spacing() {
        assert_eq!(
            fuzzy_checksum("Hello   World\n\n\nBye"),
            fuzzy_checksum("hello world\nbye")
        );
    }

    #[test]
    fn test_fingerprint_stability() {
        let statement = normalize_statement("Likes  soccer   on weekends.", 600);
        let a = fact_fingerprint("Preferences", &statement);
        let b = fact_fingerprint("preferences", &statement);
        assert_eq!(a, b);

        let mem_a = derive_memory_id("src-1", &a);
        let mem_b = derive_memory_id("src-1", &b);
        let mem_other = derive_memory_id("src-2", &a);
        assert_eq!(mem_a, mem_b);
        assert_ne!(mem_a, mem_other);
    }

    #[test]
    fn test_normalize_statement_caps_length() {
        let long = "word ".repeat(300);
        let normalized = normalize_statement(&long, 600);
        assert!(normalized.len() <= 600);
        assert!(!normalized.contains("  "));
    }
}
