//! Fuzzy resident validation
//!
//! Three similarity measures on a 0–100 scale — full ratio, partial ratio,
//! token-sort ratio — with the max of the three deciding admission. A score
//! at or above [`VALIDATION_THRESHOLD`] matches.

use crate::types::{normalize_voip_number, DirectoryEntry};

/// Minimum best-of-three score that validates a resident name
pub const VALIDATION_THRESHOLD: u8 = 75;

fn prepare(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Full similarity ratio, 0–100
pub fn ratio(a: &str, b: &str) -> u8 {
    let a = prepare(a);
    let b = prepare(b);
    if a.is_empty() && b.is_empty() {
        return 100;
    }
    (strsim::normalized_levenshtein(&a, &b) * 100.0).round() as u8
}

/// Best ratio of the shorter string against every same-length window of the
/// longer one
pub fn partial_ratio(a: &str, b: &str) -> u8 {
    let a = prepare(a);
    let b = prepare(b);
    let (short, long) = if a.chars().count() <= b.chars().count() {
        (a, b)
    } else {
        (b, a)
    };

    let short_len = short.chars().count();
    if short_len == 0 {
        return if long.is_empty() { 100 } else { 0 };
    }

    let long_chars: Vec<char> = long.chars().collect();
    if long_chars.len() == short_len {
        return (strsim::normalized_levenshtein(&short, &long) * 100.0).round() as u8;
    }

    let mut best = 0u8;
    for window in long_chars.windows(short_len) {
        let candidate: String = window.iter().collect();
        let score = (strsim::normalized_levenshtein(&short, &candidate) * 100.0).round() as u8;
        best = best.max(score);
        if best == 100 {
            break;
        }
    }
    best
}

/// Ratio over whitespace tokens sorted into canonical order
pub fn token_sort_ratio(a: &str, b: &str) -> u8 {
    let sort_tokens = |s: &str| -> String {
        let mut tokens: Vec<&str> = s.split_whitespace().collect();
        tokens.sort_unstable();
        tokens.join(" ")
    };
    ratio(&sort_tokens(&prepare(a)), &sort_tokens(&prepare(b)))
}

/// Max of the three measures
pub fn best_score(a: &str, b: &str) -> u8 {
    ratio(a, b)
        .max(partial_ratio(a, b))
        .max(token_sort_ratio(a, b))
}

/// Best score of the provided name against every known resident
pub fn best_resident_score(residents: &[String], provided: &str) -> u8 {
    residents
        .iter()
        .map(|known| best_score(known, provided))
        .max()
        .unwrap_or(0)
}

/// Outcome of validating the collected intent against the directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Resident matched; digits are normalized and ready to dial
    Matched { voip_number: String, score: u8 },
    /// Apartment exists but no resident name came close enough
    ResidentNotMatched { best_score: u8 },
    /// No such apartment in the directory
    ApartmentNotFound,
}

/// Validate a provided resident name against an apartment lookup result
pub fn validate_visit(entry: Option<&DirectoryEntry>, provided_resident: &str) -> ValidationOutcome {
    let Some(entry) = entry else {
        return ValidationOutcome::ApartmentNotFound;
    };

    let score = best_resident_score(&entry.residents, provided_resident);
    if score >= VALIDATION_THRESHOLD {
        ValidationOutcome::Matched {
            voip_number: normalize_voip_number(&entry.voip_number),
            score,
        }
    } else {
        ValidationOutcome::ResidentNotMatched { best_score: score }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> DirectoryEntry {
        DirectoryEntry {
            apartment: "501".to_string(),
            residents: vec!["Daniel dos Reis".to_string()],
            voip_number: "sip:1003021@pbx.local".to_string(),
        }
    }

    #[test]
    fn test_identical_names_score_100() {
        assert_eq!(ratio("Daniel", "Daniel"), 100);
        assert_eq!(best_score("daniel", "DANIEL"), 100);
    }

    #[test]
    fn test_partial_ratio_finds_substring() {
        // "daniel" appears verbatim inside "daniel dos reis".
        assert_eq!(partial_ratio("Daniel", "Daniel dos Reis"), 100);
    }

    #[test]
    fn test_token_sort_handles_reordering() {
        assert_eq!(token_sort_ratio("dos Reis Daniel", "Daniel dos Reis"), 100);
    }

    #[test]
    fn test_first_name_matches_full_directory_name() {
        let outcome = validate_visit(Some(&entry()), "Daniel");
        match outcome {
            ValidationOutcome::Matched { voip_number, score } => {
                assert_eq!(voip_number, "1003021");
                assert!(score >= VALIDATION_THRESHOLD);
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_unrelated_name_fails() {
        let outcome = validate_visit(Some(&entry()), "Zezé");
        assert!(matches!(
            outcome,
            ValidationOutcome::ResidentNotMatched { best_score } if best_score < VALIDATION_THRESHOLD
        ));
    }

    #[test]
    fn test_unknown_apartment() {
        assert_eq!(validate_visit(None, "Daniel"), ValidationOutcome::ApartmentNotFound);
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        // One edit in four characters scores exactly 75: admitted.
        let known = "aaaa".to_string();
        assert_eq!(best_score(&known, "aaax"), 75);
        let entry = DirectoryEntry {
            apartment: "1".to_string(),
            residents: vec![known],
            voip_number: "100".to_string(),
        };
        assert!(matches!(
            validate_visit(Some(&entry), "aaax"),
            ValidationOutcome::Matched { score: 75, .. }
        ));

        // Thirteen edits in fifty characters scores exactly 74: rejected.
        let known = "a".repeat(50);
        let provided = format!("{}{}", "a".repeat(37), "b".repeat(13));
        assert_eq!(best_score(&known, &provided), 74);
        let entry = DirectoryEntry {
            apartment: "1".to_string(),
            residents: vec![known],
            voip_number: "100".to_string(),
        };
        assert_eq!(
            validate_visit(Some(&entry), &provided),
            ValidationOutcome::ResidentNotMatched { best_score: 74 }
        );
    }

    #[test]
    fn test_multiple_residents_take_the_best() {
        let residents = vec!["Ana Clara".to_string(), "Daniel dos Reis".to_string()];
        let best = best_resident_score(&residents, "Daniel");
        assert!(best >= VALIDATION_THRESHOLD);
    }
}
