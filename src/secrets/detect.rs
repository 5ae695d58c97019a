use crate::config::Sensitivity;
use uuid::Uuid;

/// A secret-looking span in scanned text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedSecret {
    pub label: &'static str,
    /// Byte range of the secret value itself, excluding any `key=` marker.
    pub start: usize,
    pub end: usize,
}

/// A `{SECRET:<uuid>:<label>}` reference already present in text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretReference {
    pub secret_id: Uuid,
    pub label: String,
    pub start: usize,
    pub end: usize,
}

/// Well-known credential prefixes; detected at every sensitivity.
const SECRET_PREFIXES: &[(&str, &str)] = &[
    ("sk-", "api_key"),
    ("ghp_", "github_token"),
    ("github_pat_", "github_token"),
    ("gho_", "github_token"),
    ("ghs_", "github_token"),
    ("AKIA", "aws_access_key"),
    ("ASIA", "aws_access_key"),
    ("xoxb-", "slack_token"),
    ("xoxp-", "slack_token"),
    ("xapp-", "slack_token"),
    ("hf_", "hf_token"),
    ("glpat-", "gitlab_token"),
    ("AGE-SECRET-KEY-", "age_key"),
    ("GOCSPX-", "oauth_client_secret"),
    ("AIza", "google_api_key"),
    ("ya29.", "oauth_token"),
    ("eyJ", "jwt"),
];

/// `marker → value` assignments; detected from medium sensitivity up.
const ASSIGNMENT_MARKERS: &[(&str, &str)] = &[
    ("password=", "password"),
    ("passwd=", "password"),
    ("secret=", "secret"),
    ("api_key=", "api_key"),
    ("access_token=", "access_token"),
    ("refresh_token=", "refresh_token"),
    ("\"password\":\"", "password"),
    ("\"secret\":\"", "secret"),
    ("\"api_key\":\"", "api_key"),
    ("\"token\":\"", "token"),
    ("\"client_secret\":\"", "client_secret"),
    ("Bearer ", "bearer_token"),
];

const MIN_TOKEN_TAIL: usize = 8;
const MIN_ASSIGNED_VALUE: usize = 4;
const MIN_OPAQUE_TOKEN: usize = 32;
const REFERENCE_OPEN: &str = "{SECRET:";

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '+' | '/' | '=')
}

fn token_end(text: &str, from: usize) -> usize {
    text[from..]
        .find(|c: char| !is_token_char(c))
        .map_or(text.len(), |rel| from + rel)
}

fn overlaps(start: usize, end: usize, spans: &[(usize, usize)]) -> bool {
    spans.iter().any(|&(s, e)| start < e && s < end)
}

/// Every well-formed vault reference in `text`, in order.
pub fn find_references(text: &str) -> Vec<SecretReference> {
    let mut references = Vec::new();
    let mut search_from = 0;
    while let Some(rel) = text[search_from..].find(REFERENCE_OPEN) {
        let start = search_from + rel;
        let inner_start = start + REFERENCE_OPEN.len();
        let Some(rel_close) = text[inner_start..].find('}') else {
            break;
        };
        let inner = &text[inner_start..inner_start + rel_close];
        let end = inner_start + rel_close + 1;

        if let Some((id, label)) = inner.split_once(':')
            && let Ok(secret_id) = Uuid::parse_str(id)
        {
            references.push(SecretReference {
                secret_id,
                label: label.to_string(),
                start,
                end,
            });
        }
        search_from = end;
    }
    references
}

/// Scan `text` for secrets at the given sensitivity. Spans never overlap
/// each other or an existing vault reference.
pub fn detect(text: &str, sensitivity: Sensitivity) -> Vec<DetectedSecret> {
    let mut taken: Vec<(usize, usize)> = find_references(text)
        .iter()
        .map(|r| (r.start, r.end))
        .collect();
    let mut found = Vec::new();

    let mut push = |label: &'static str, start: usize, end: usize, taken: &mut Vec<(usize, usize)>| {
        if !overlaps(start, end, taken) {
            taken.push((start, end));
            found.push(DetectedSecret { label, start, end });
        }
    };

    for &(prefix, label) in SECRET_PREFIXES {
        let mut search_from = 0;
        while let Some(rel) = text[search_from..].find(prefix) {
            let start = search_from + rel;
            let end = token_end(text, start);
            let at_word_start = text[..start]
                .chars()
                .next_back()
                .is_none_or(|c| !is_token_char(c));
            if at_word_start && end - start >= prefix.len() + MIN_TOKEN_TAIL {
                push(label, start, end, &mut taken);
            }
            search_from = start + prefix.len();
        }
    }

    if sensitivity >= Sensitivity::Medium {
        for &(marker, label) in ASSIGNMENT_MARKERS {
            let mut search_from = 0;
            while let Some(rel) = text[search_from..].find(marker) {
                let value_start = search_from + rel + marker.len();
                let value_end = if marker.ends_with('"') {
                    text[value_start..]
                        .find('"')
                        .map_or(text.len(), |q| value_start + q)
                } else {
                    token_end(text, value_start)
                };
                if value_end - value_start >= MIN_ASSIGNED_VALUE {
                    push(label, value_start, value_end, &mut taken);
                }
                search_from = value_start;
            }
        }
    }

    if sensitivity >= Sensitivity::High {
        let mut search_from = 0;
        while let Some(rel) = text[search_from..].find(is_token_char) {
            let start = search_from + rel;
            let end = token_end(text, start);
            let word = &text[start..end];
            let has_digit = word.chars().any(|c| c.is_ascii_digit());
            let has_alpha = word.chars().any(|c| c.is_ascii_alphabetic());
            if word.len() >= MIN_OPAQUE_TOKEN && has_digit && has_alpha {
                push("opaque_token", start, end, &mut taken);
            }
            search_from = end;
        }
    }

    found.sort_by_key(|s| s.start);
    found
}
