use std::path::Path;

/// Final path component as UTF-8, used as the remote object name.
pub fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

/// Forward-slash path of `full` relative to `base`, or `None` when `full`
/// lies outside `base`.
pub fn relative_path(base: &Path, full: &Path) -> Option<String> {
    let rel = full.strip_prefix(base).ok()?;
    let parts: Vec<_> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Guess a MIME type from the file extension.
pub fn mime_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string()
}

pub fn matches_exclude(relative: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| glob_match(p, relative))
}

/// `*` and `?` stay within a segment, `**` spans any number of segments.
/// Patterns without a `/` are matched against the file name alone.
fn glob_match(pattern: &str, path: &str) -> bool {
    if !pattern.contains('/') && pattern != "**" {
        let name = path.rsplit('/').next().unwrap_or(path);
        return segment_match(pattern.as_bytes(), name.as_bytes());
    }

    let pat: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    segments_match(&pat, &segs)
}

fn segments_match(pat: &[&str], segs: &[&str]) -> bool {
    match pat.split_first() {
        None => segs.is_empty(),
        Some((&"**", rest)) => (0..=segs.len()).any(|i| segments_match(rest, &segs[i..])),
        Some((p, rest)) => match segs.split_first() {
            Some((s, tail)) => {
                segment_match(p.as_bytes(), s.as_bytes()) && segments_match(rest, tail)
            }
            None => false,
        },
    }
}

fn segment_match(pat: &[u8], text: &[u8]) -> bool {
    match pat.split_first() {
        None => text.is_empty(),
        Some((b'*', rest)) => (0..=text.len()).any(|i| segment_match(rest, &text[i..])),
        Some((b'?', rest)) => match utf8_char_len(text) {
            Some(n) => segment_match(rest, &text[n..]),
            None => false,
        },
        Some((c, rest)) => text.first() == Some(c) && segment_match(rest, &text[1..]),
    }
}

fn utf8_char_len(text: &[u8]) -> Option<usize> {
    let first = *text.first()?;
    let len = match first {
        0x00..=0x7f => 1,
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        _ => 4,
    };
    (len <= text.len()).then_some(len)
}
