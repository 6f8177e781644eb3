//! Conflict naming for keep-both resolution
//!
//! Generates names for conflict copies, following the pattern:
//! `filename (conflicted copy YYYY-MM-DD HHMMSS).ext`

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Generates conflict copy names
pub struct ConflictNamer;

impl ConflictNamer {
    /// Generates a conflict copy name stamped with the current time
    ///
    /// Given "report.docx", produces something like:
    /// "report (conflicted copy 2026-02-07 134502).docx"
    pub fn generate(original_name: &str) -> String {
        Self::generate_at(original_name, Utc::now())
    }

    /// Generates a conflict copy name stamped with `at`
    pub fn generate_at(original_name: &str, at: DateTime<Utc>) -> String {
        let timestamp = at.format("%Y-%m-%d %H%M%S");
        let (stem, ext) = split_extension(original_name);
        format!("{stem} (conflicted copy {timestamp}){ext}")
    }

    /// Generates a name for which `exists` returns false
    ///
    /// If the timestamped name is taken, appends an incrementing suffix.
    pub fn generate_unique<F>(original_name: &str, at: DateTime<Utc>, mut exists: F) -> String
    where
        F: FnMut(&str) -> bool,
    {
        Self::candidates(original_name, at)
            .find(|candidate| !exists(candidate))
            .unwrap_or_else(|| Self::random_candidate(original_name, at))
    }

    /// Names to try in order: the timestamped name, then suffixes 2 to 99
    ///
    /// Callers that check existence asynchronously walk this themselves and
    /// fall back to [`ConflictNamer::random_candidate`].
    pub fn candidates(original_name: &str, at: DateTime<Utc>) -> impl Iterator<Item = String> {
        let first = Self::generate_at(original_name, at);
        let (stem, ext) = split_extension(&first);
        let (stem, ext) = (stem.to_string(), ext.to_string());
        let numbered = (2..=99).map(move |i| format!("{stem} {i}{ext}"));
        std::iter::once(first).chain(numbered)
    }

    /// Timestamped name with a random suffix
    pub fn random_candidate(original_name: &str, at: DateTime<Utc>) -> String {
        let first = Self::generate_at(original_name, at);
        let (stem, ext) = split_extension(&first);
        let short_uuid = &Uuid::new_v4().simple().to_string()[..8];
        format!("{stem} {short_uuid}{ext}")
    }

    /// Returns true if `name` looks like a generated conflict copy
    pub fn is_conflict_copy(name: &str) -> bool {
        name.contains(" (conflicted copy ")
    }
}

/// Splits "name.ext" into ("name", ".ext"); dotfiles have no extension
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn fixed() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 7, 13, 45, 2).unwrap()
    }

    #[test]
    fn test_generate_with_extension() {
        let name = ConflictNamer::generate_at("report.docx", fixed());
        assert_eq!(name, "report (conflicted copy 2026-02-07 134502).docx");
    }

    #[test]
    fn test_generate_without_extension() {
        let name = ConflictNamer::generate_at("Makefile", fixed());
        assert_eq!(name, "Makefile (conflicted copy 2026-02-07 134502)");
    }

    #[test]
    fn test_generate_with_multiple_dots() {
        let name = ConflictNamer::generate_at("archive.tar.gz", fixed());
        assert_eq!(name, "archive.tar (conflicted copy 2026-02-07 134502).gz");
    }

    #[test]
    fn test_generate_dotfile() {
        let name = ConflictNamer::generate_at(".bashrc", fixed());
        assert_eq!(name, ".bashrc (conflicted copy 2026-02-07 134502)");
    }

    #[test]
    fn test_generate_unique_no_collision() {
        let name = ConflictNamer::generate_unique("test.txt", fixed(), |_| false);
        assert_eq!(name, "test (conflicted copy 2026-02-07 134502).txt");
    }

    #[test]
    fn test_generate_unique_with_collision() {
        let mut call_count = 0;
        let name = ConflictNamer::generate_unique("test.txt", fixed(), |_| {
            call_count += 1;
            call_count <= 2
        });
        assert_eq!(name, "test (conflicted copy 2026-02-07 134502) 3.txt");
    }

    #[test]
    fn test_generate_unique_falls_back_to_random_suffix() {
        let all_taken = ConflictNamer::generate_unique("a", fixed(), |n| {
            n.len() <= "a (conflicted copy 2026-02-07 134502) 99".len()
        });
        assert_eq!(
            all_taken.len(),
            "a (conflicted copy 2026-02-07 134502) ".len() + 8
        );
    }

    #[test]
    fn test_candidates_start_with_plain_name() {
        let names: Vec<String> = ConflictNamer::candidates("notes.md", fixed()).take(3).collect();
        assert_eq!(
            names,
            vec![
                "notes (conflicted copy 2026-02-07 134502).md",
                "notes (conflicted copy 2026-02-07 134502) 2.md",
                "notes (conflicted copy 2026-02-07 134502) 3.md",
            ]
        );
        assert_eq!(ConflictNamer::candidates("notes.md", fixed()).count(), 99);
    }

    #[test]
    fn test_is_conflict_copy() {
        assert!(ConflictNamer::is_conflict_copy(&ConflictNamer::generate(
            "x.txt"
        )));
        assert!(!ConflictNamer::is_conflict_copy("x.txt"));
    }
}
