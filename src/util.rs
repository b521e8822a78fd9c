use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

static INVALID_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f\x7f]"#).unwrap());
static EXTRA_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\w\s\-_.,()\[\]{}!@#$%^&+=]").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static FEAT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\s*\(feat\.?[^)]*\)",
        r"(?i)\s*\(ft\.?[^)]*\)",
        r"(?i)\s*feat\.?\s.*",
        r"(?i)\s*ft\.?\s.*",
        r"(?i)\s*featuring\s.*",
        r"(?i)\s*with\s.*",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});
static VERSION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\s*\([^)]*version[^)]*\)",
        r"(?i)\s*\([^)]*mix[^)]*\)",
        r"(?i)\s*\([^)]*edit[^)]*\)",
        r"(?i)\s*\([^)]*remix[^)]*\)",
        r"(?i)\s*\([^)]*remaster[^)]*\)",
        r"(?i)\s*\[[^\]]*version[^\]]*\]",
        r"(?i)\s*\[[^\]]*mix[^\]]*\]",
        r"(?i)\s*\[[^\]]*edit[^\]]*\]",
        r"(?i)\s*\[[^\]]*remix[^\]]*\]",
        r"(?i)\s*\[[^\]]*remaster[^\]]*\]",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Sanitize a filename for cross-platform use. Idempotent: running it twice
/// yields the same string.
pub fn sanitize_filename(name: &str, max_length: usize, replace_spaces: bool) -> String {
    let mut s = name.trim().to_string();
    s = s.trim_matches(|c| c == '"' || c == '\'').trim().to_string();
    if s.is_empty() {
        return "unknown".into();
    }

    s = INVALID_CHARS.replace_all(&s, "").into_owned();
    s = EXTRA_CHARS.replace_all(&s, "").into_owned();
    s = WHITESPACE.replace_all(&s, " ").into_owned();
    if replace_spaces {
        s = s.replace(' ', "_");
    }
    s = s.trim_matches(|c| c == ' ' || c == '.').to_string();

    let base = s.split('.').next().unwrap_or("").to_ascii_uppercase();
    if RESERVED_NAMES.contains(&base.as_str()) {
        s = format!("_{}", s);
    }

    if s.chars().count() > max_length {
        s = truncate_preserving_extension(&s, max_length);
    }

    s = s.trim_end_matches(|c| c == ' ' || c == '.').to_string();
    if s.is_empty() || s == "." || s == ".." {
        return "unknown".into();
    }
    s
}

fn truncate_preserving_extension(name: &str, max_length: usize) -> String {
    if let Some(idx) = name.rfind('.') {
        let (stem, ext) = name.split_at(idx);
        let ext_len = ext.chars().count();
        if ext_len < max_length {
            let keep = max_length - ext_len;
            let stem: String = stem.chars().take(keep).collect();
            return format!("{}{}", stem, ext);
        }
    }
    name.chars().take(max_length).collect()
}

/// Sanitize a directory name. Stricter than filenames: quotes are removed
/// anywhere, `..` sequences are collapsed, leading/trailing dots stripped.
pub fn sanitize_directory_name(name: &str, max_length: usize) -> String {
    let mut s = name.trim().replace(['"', '\''], "");
    s = s.trim().to_string();
    if s.is_empty() {
        return "unknown_directory".into();
    }

    s = INVALID_CHARS.replace_all(&s, "").into_owned();
    s = EXTRA_CHARS.replace_all(&s, "").into_owned();
    s = WHITESPACE.replace_all(&s, " ").into_owned();
    s = s.trim_matches(|c| c == ' ' || c == '.').to_string();

    if RESERVED_NAMES.contains(&s.to_ascii_uppercase().as_str()) {
        s = format!("_{}", s);
    }

    if s.chars().count() > max_length {
        s = s.chars().take(max_length).collect();
    }
    s = s.trim_end_matches('.').to_string();
    if s.starts_with('.') && s.len() > 1 {
        s = s[1..].to_string();
    }
    while s.contains("..") {
        s = s.replace("..", "_");
    }
    if s.trim().is_empty() {
        return "unknown_directory".into();
    }
    s
}

/// Format a duration in seconds as `m:ss` or `h:mm:ss`.
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{}:{:02}", minutes, secs)
    }
}

/// Parse `m:ss`, `mm:ss` or `h:mm:ss` into seconds.
pub fn parse_duration_str(s: &str) -> Option<u64> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    match parts.as_slice() {
        [m, sec] => {
            let m: u64 = m.trim().parse().ok()?;
            let sec: u64 = sec.trim().parse().ok()?;
            Some(m * 60 + sec)
        }
        [h, m, sec] => {
            let h: u64 = h.trim().parse().ok()?;
            let m: u64 = m.trim().parse().ok()?;
            let sec: u64 = sec.trim().parse().ok()?;
            Some(h * 3600 + m * 60 + sec)
        }
        _ => None,
    }
}

/// Normalized edit-distance similarity in [0, 1]. Both inputs empty -> 1.0,
/// exactly one empty -> 0.0.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let ca: Vec<char> = a.chars().collect();
    let cb: Vec<char> = b.chars().collect();
    let dist = levenshtein(&ca, &cb);
    let max_len = ca.len().max(cb.len());
    (1.0 - dist as f64 / max_len as f64).max(0.0)
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            cur[j + 1] = (prev[j + 1] + 1).min(cur[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Lowercase, strip a leading article and featuring credits, collapse spaces.
pub fn normalize_artist_name(artist: &str) -> String {
    let mut s = artist.to_lowercase();
    for prefix in ["the ", "a ", "an "] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest.to_string();
            break;
        }
    }
    s = strip_feat(&s);
    WHITESPACE.replace_all(&s, " ").trim().to_string()
}

/// Lowercase, strip parenthesized/bracketed version tags and featuring
/// credits, collapse spaces.
pub fn normalize_track_title(title: &str) -> String {
    let mut s = title.to_lowercase();
    for re in VERSION_PATTERNS.iter() {
        s = re.replace_all(&s, "").into_owned();
    }
    s = strip_feat(&s);
    WHITESPACE.replace_all(&s, " ").trim().to_string()
}

/// Remove featuring credits (`feat.`, `ft.`, `featuring`, `with`) from a name.
pub fn strip_feat(name: &str) -> String {
    let mut s = name.to_string();
    for re in FEAT_PATTERNS.iter() {
        s = re.replace_all(&s, "").into_owned();
    }
    s.trim().to_string()
}

pub fn has_feat_credit(name: &str) -> bool {
    FEAT_PATTERNS.iter().any(|re| re.is_match(name))
}

/// File extension (with dot) for a configured output format.
pub fn file_extension_for(format: &str) -> &'static str {
    match format.to_lowercase().as_str() {
        "m4a" => ".m4a",
        "flac" => ".flac",
        "aac" => ".aac",
        "ogg" => ".ogg",
        "wav" => ".wav",
        _ => ".mp3",
    }
}

/// Timestamped sibling path used before overwriting a file.
pub fn backup_filename(original: &Path) -> PathBuf {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let parent = original.parent().unwrap_or_else(|| Path::new("."));
    let stem = original
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    match original.extension().and_then(|e| e.to_str()) {
        Some(ext) => parent.join(format!("{}.backup_{}.{}", stem, timestamp, ext)),
        None => parent.join(format!("{}.backup_{}", stem, timestamp)),
    }
}

/// Join untrusted parts under a base directory, refusing traversal
/// components so the result is always a descendant of `base`.
pub fn safe_path_join(base: &Path, parts: &[&str]) -> PathBuf {
    let mut out = base.to_path_buf();
    for part in parts {
        let clean = part.replace("..", "").replace('~', "");
        let clean = clean.trim_matches('/').trim();
        if !clean.is_empty() && clean != "." {
            out.push(clean);
        }
    }
    out
}

/// Expand a leading `~` using the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}
